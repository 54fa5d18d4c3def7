use aws_sdk_ec2::Error as Ec2Error;
use aws_sdk_rds::Error as RdsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigratorError {
    /// a json parsing error
    #[error("json parsing error {0}")]
    JsonParsingError(#[from] serde_json::Error),

    /// a yaml parsing error
    #[error("yaml parsing error {0}")]
    YamlParsingError(#[from] serde_yaml::Error),

    /// a kube error
    #[error("kube error {0}")]
    KubeError(#[from] kube::Error),

    #[error("kube exec error: {0}")]
    KubeExecError(String),

    /// an aws error
    #[error("rds sdk error {0}")]
    AwsRdsError(#[from] Box<RdsError>),

    #[error("ec2 sdk error {0}")]
    AwsEc2Error(#[from] Box<Ec2Error>),

    #[error("gcp auth error: {0}")]
    GcpAuthError(String),

    #[error("gcp api error: {0}")]
    GcpApiError(String),

    #[error("http error {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("sql error {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("io error {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0} was not found")]
    NotFound(String),

    #[error("max retries ({0}) for apply config change exceeded")]
    Conflict(u32),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("validation errors: {}", .0.join("\n"))]
    Validation(Vec<String>),

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error("task {0} already exists")]
    TaskExists(String),
}
