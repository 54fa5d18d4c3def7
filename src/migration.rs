use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use passwords::PasswordGenerator;
use serde_json::{json, Map, Value};

use crate::cluster::{PgConn, PodsStatus, SecretSpec};
use crate::config::{ConfigStore, ServiceConfig};
use crate::errors::MigratorError;
use crate::tasks::TaskLog;
use crate::types::{DmsJobStatus, JobPhase, JobState};
use crate::Result;

pub const DEFAULT_PORT: u16 = 5432;
const MJ_PREFIX: &str = "auto-mj-";
const CP_SRC_PREFIX: &str = "src-";

/// How long a remote-strategy cutover waits for the restarted workload to
/// settle before promoting. Must stay long enough that no write issued against
/// the source can land after promotion starts.
const CUTOVER_SETTLE: Duration = Duration::from_secs(120);

// obtained from https://s3.amazonaws.com/rds-downloads/rds-ca-2019-root.pem
const RDS_ROOT_PEM64: &str = "LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCk1JSUVCakNDQXU2Z0F3SUJBZ0lKQU1jMFp6YVNVSzUxTUEwR0NTcUdTSWIzRFFFQkN3VUFNSUdQTVFzd0NRWUQKVlFRR0V3SlZVekVRTUE0R0ExVUVCd3dIVTJWaGRIUnNaVEVUTUJFR0ExVUVDQXdLVjJGemFHbHVaM1J2YmpFaQpNQ0FHQTFVRUNnd1pRVzFoZW05dUlGZGxZaUJUWlhKMmFXTmxjeXdnU1c1akxqRVRNQkVHQTFVRUN3d0tRVzFoCmVtOXVJRkpFVXpFZ01CNEdBMVVFQXd3WFFXMWhlbTl1SUZKRVV5QlNiMjkwSURJd01Ua2dRMEV3SGhjTk1Ua3cKT0RJeU1UY3dPRFV3V2hjTk1qUXdPREl5TVRjd09EVXdXakNCanpFTE1Ba0dBMVVFQmhNQ1ZWTXhFREFPQmdOVgpCQWNNQjFObFlYUjBiR1V4RXpBUkJnTlZCQWdNQ2xkaGMyaHBibWQwYjI0eElqQWdCZ05WQkFvTUdVRnRZWHB2CmJpQlhaV0lnVTJWeWRtbGpaWE1zSUVsdVl5NHhFekFSQmdOVkJBc01Da0Z0WVhwdmJpQlNSRk14SURBZUJnTlYKQkFNTUYwRnRZWHB2YmlCU1JGTWdVbTl2ZENBeU1ERTVJRU5CTUlJQklqQU5CZ2txaGtpRzl3MEJBUUVGQUFPQwpBUThBTUlJQkNnS0NBUUVBclhuRi9FNi9RaCtrdTNoUVRTS1BNaFFRbENwb1d2bkl0aHpYNk1LM3A1YTBlWEtaCm9XSWpZY05ORzZVd0pqcDRmVVhsNmdscDUzSm9ibit0V05YODhkTkgybjhEVmJwcFN3U2NWRTJMcHVMKzk0dlkKMEVZRS9YeE43c3ZLZWE4WXZscnFrVUJLeXhMeFRqaCtVL0tyR09hSHh6OXYwbDZaTmxEYnVhWnczcUlXZEQvSQo2YU5iR2VSVVZ0cE02UCtiV0lveFZsL2NhUXlsUVM2Q0VZVWsrQ3BWeUpTa29wd0pselhUMDd0TW9ETDVXZ1g5Ck8wOEtWZ0ROejlxUC9JR3RBY1JkdVJjTmlvSDNFOXY5ODFRTzF6dC9HcGIyZjhOcUFqVVVDVVp6T25pajZteDkKTWNaKzljV1g4OENSelIwdlFPRFd1WnNjZ0kwOE52TTY5Rm4yU1FJREFRQUJvMk13WVRBT0JnTlZIUThCQWY4RQpCQU1DQVFZd0R3WURWUjBUQVFIL0JBVXdBd0VCL3pBZEJnTlZIUTRFRmdRVWMxOWcyTHpMQTVqMEt4YzBMalphCnBtRC92Qjh3SHdZRFZSMGpCQmd3Rm9BVWMxOWcyTHpMQTVqMEt4YzBMalphcG1EL3ZCOHdEUVlKS29aSWh2Y04KQVFFTEJRQURnZ0VCQUhBRzdXVG15anpQUklNODVyVmorZldIc0xJdnFwdzZET2JJak1Xb2twbGlDZU1JTlpGVgp5bmZnQktzZjFFeHdidkpOellGWFc2ZGlobmd1REc5Vk1QcGkydXAvY3RRVE44dG05bkRLT3kwOHVOWm9vZk1jCk5VWnhLQ0VrVktaditJTDRvSG9lYXl0OGVndHYzdWpKTTZWMTRBc3RNUTZTd3Z3dkE5M0VQL1VnMmU0V0FYSHUKY2JJMU5BYlVnVkRxcCtEUmRmdlprZ1lLcnlqVFdkLzArMWZTOFgxYkJaVld6bDdlaXJOVm5IYlNIMlpEcE51WQowU0JkOGRqNUY2bGQzdDU4eWRaYnJUSHplN0pKT2Q4aWp5U0FwNC9raXU5VWZaV3VUUEFCekRhL0RTZHo5RGsvCnpQVzRDWFh2aExtRTAyVEE5L0hlQ3czS0VISXdpY051RWZ3PQotLS0tLUVORCBDRVJUSUZJQ0FURS0tLS0tCg==";

fn env_code(env: &str) -> Result<&'static str> {
    match env {
        "dev" => Ok("d"),
        "staging" => Ok("s"),
        "prod" => Ok("p"),
        "sb1" => Ok("sb"),
        other => Err(MigratorError::Invalid(format!("unknown k8s-env \"{other}\""))),
    }
}

/// Per-environment shared-VPC naming: the host project holding the network and
/// the shared base network name.
fn vpc_names(env: &str) -> Result<(String, String)> {
    let code = env_code(env)?;
    Ok((
        format!("prj-{code}-vpc-host"),
        format!("vpc-{code}-shared-base"),
    ))
}

/// Target-cloud capability set the orchestrator drives.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn project_id(&self, name: &str) -> Result<String>;

    async fn upsert_connection_profile(
        &self,
        project: &str,
        region: &str,
        profile_id: &str,
        body: &Value,
    ) -> Result<()>;

    async fn delete_connection_profile(&self, reference: &str) -> Result<()>;

    async fn create_migration_job(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
        body: &Value,
    ) -> Result<()>;

    async fn start_migration_job(&self, project: &str, region: &str, job_id: &str) -> Result<()>;

    async fn get_dms_status(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
    ) -> Result<Option<DmsJobStatus>>;

    async fn promote_dms_job(&self, project: &str, region: &str, job_id: &str) -> Result<()>;

    async fn delete_dms_job(&self, project: &str, region: &str, job_id: &str) -> Result<()>;

    async fn get_instance_name(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
    ) -> Result<Option<String>>;

    async fn get_host(&self, project: &str, instance: &str) -> Result<String>;

    async fn create_user(
        &self,
        project: &str,
        instance: &str,
        username: &str,
        password: Option<String>,
    ) -> Result<String>;

    async fn delete_instance(&self, project: &str, instance: &str) -> Result<()>;
}

/// Cluster capability set the orchestrator drives.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_secret(&self, name: &str, namespace: &str, spec: &SecretSpec) -> Result<()>;

    async fn restart_workload(&self, name: &str, namespace: &str) -> Result<()>;

    async fn check_app_healthy(&self, namespace: &str, app: &str) -> Result<(bool, String)>;

    async fn pods_status(&self, namespace: &str, app: &str) -> Result<PodsStatus>;

    async fn check_connection(&self, conn: &PgConn) -> Result<()>;

    async fn grant_access(&self, conn: &PgConn, grantee: &str) -> Result<()>;

    async fn set_owner_all_tables(&self, conn: &PgConn, grantee: &str) -> Result<()>;

    async fn create_replication_user(
        &self,
        username: &str,
        password: Option<String>,
        conn: &PgConn,
    ) -> Result<String>;
}

/// Drives one service through the migration phases. Stateless across
/// invocations: everything durable lives in the config store or on the remote
/// migration job, so each operation re-reads current state and performs only
/// the missing steps.
pub struct Migration {
    config: Arc<dyn ConfigStore>,
    cloud: Arc<dyn CloudApi>,
    cluster: Arc<dyn ClusterApi>,
    log: TaskLog,
    started: String,
    rds_cert: String,
    settle: Duration,
}

impl Migration {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        cloud: Arc<dyn CloudApi>,
        cluster: Arc<dyn ClusterApi>,
        log: TaskLog,
    ) -> Self {
        let cert_bytes = general_purpose::STANDARD
            .decode(RDS_ROOT_PEM64)
            .expect("embedded RDS root certificate is valid base64");
        Self {
            config,
            cloud,
            cluster,
            log,
            started: Utc::now().format("%Y%m%dt%H%M%S").to_string(),
            rds_cert: String::from_utf8(cert_bytes)
                .expect("embedded RDS root certificate is valid utf-8"),
            settle: CUTOVER_SETTLE,
        }
    }

    #[cfg(test)]
    fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Pre-flight checks and source preparation: app health, master
    /// connectivity, replication user. Returns a status map whose `pass`
    /// entry is true only when every check came back ok.
    pub async fn preflight(&self, service: &str) -> Result<Value> {
        let cfg = self.config.get(service).await?;
        let mut status = Map::new();

        let namespace = cfg.require("k8s-namespace")?;
        let app = cfg.require("k8s-service")?;
        let (healthy, reason) = self.cluster.check_app_healthy(&namespace, &app).await?;
        status.insert(
            "app".to_string(),
            Value::from(if healthy { "ok".to_string() } else { reason }),
        );

        let master = PgConn {
            host: cfg.require("aws-host")?,
            port: cfg.require_port("aws-port")?,
            dbname: cfg.require("database-name")?,
            user: cfg.require("aws-master-username")?,
            password: cfg.require("aws-master-password")?,
        };
        if let Err(e) = self.cluster.check_connection(&master).await {
            status.insert(
                "rdsMaster".to_string(),
                Value::from(format!(
                    "failed to connect to db {}/{} as {}: {}",
                    master.host, master.dbname, master.user, e
                )),
            );
            status.insert("pass".to_string(), Value::from(false));
            return Ok(Value::Object(status));
        }

        let repl_username = cfg.require("aws-replication-username")?;
        let stored_password = cfg.get_str("aws-replication-password");
        let had_password = stored_password.is_some();
        match self
            .cluster
            .create_replication_user(&repl_username, stored_password, &master)
            .await
        {
            Ok(password) => {
                if !had_password {
                    self.save(service, &[("aws-replication-password", Value::from(password))])
                        .await?;
                }
            }
            Err(e) => {
                status.insert(
                    "rdsReplication".to_string(),
                    Value::from(format!(
                        "failed to create replication user {}/{}: {}",
                        master.host, master.dbname, e
                    )),
                );
            }
        }

        let pass = status.values().all(|v| v.as_str() == Some("ok"));
        status.insert("pass".to_string(), Value::from(pass));
        Ok(Value::Object(status))
    }

    /// Create and start the migration job, provision target users and sync
    /// secrets, then wait for continuous replication (CDC) to be reached.
    pub async fn sync(&self, service: &str) -> Result<()> {
        self.create_connection_profiles(service).await?;
        self.create_dms_job(service).await?;

        let cfg = self.config.get(service).await?;
        self.log.debug(format!(
            "migrating {} using strategy \"{}\"",
            service,
            cfg.require("gcp-migration-strategy")?
        ));
        self.create_db_users(service).await?;
        self.create_sync_secrets(service, false).await?;
        self.cluster
            .restart_workload(&cfg.require("k8s-service")?, &cfg.require("k8s-namespace")?)
            .await?;

        self.await_state(service, JobState::Running).await?;
        self.log.info("job running, await database CDC phase");
        self.await_phase(service, JobPhase::Cdc).await?;
        self.log.info("CDC phase reached, sync complete, ready to cutover");
        Ok(())
    }

    /// Promote the migration job and attach the workload to the promoted
    /// database.
    pub async fn cutover(&self, service: &str) -> Result<()> {
        let cfg = self.config.get(service).await?;
        let app = cfg.require("k8s-service")?;
        let namespace = cfg.require("k8s-namespace")?;
        let strategy = cfg.require("gcp-migration-strategy")?;

        let status = self.describe_dms_job(service).await?.ok_or_else(|| {
            MigratorError::Precondition(format!("dms job for service {service} was not found"))
        })?;
        if status.state == JobState::Completed {
            self.log.info("job already completed, exiting");
            return Ok(());
        }
        if status.state != JobState::Running || status.phase != JobPhase::Cdc {
            return Err(MigratorError::Precondition(format!(
                "{} dms state: {:?}/{:?}, but expecting 'CDC' mode",
                service, status.state, status.phase
            )));
        }

        if strategy == "remote" {
            // flip the app onto the target read-only before promotion so no
            // write lands on the source afterwards
            self.create_sync_secrets(service, true).await?;
            self.cluster.restart_workload(&app, &namespace).await?;
            self.log.info("waiting 2m for service to restart");
            tokio::time::sleep(self.settle).await;
        }

        self.create_cutover_secrets(service).await?;
        if !self.promote_dms_job(service).await? {
            return Err(MigratorError::Precondition(format!(
                "dms job for service {service} was not promoted"
            )));
        }

        self.log.info(format!("await job completion for {service}"));
        self.await_state(service, JobState::Completed).await?;

        self.log.info(format!("job/{service} complete, doing final setup"));
        let cfg = self.config.get(service).await?;
        let root = PgConn {
            host: cfg.require("gcp-host")?,
            port: DEFAULT_PORT,
            dbname: cfg.require("database-name")?,
            user: "postgres".to_string(),
            password: cfg.require("gcp-root-password")?,
        };
        self.cluster.set_owner_all_tables(&root, "readwrite").await?;
        self.cluster.restart_workload(&app, &namespace).await?;
        self.log.info(format!(
            "cutover for {service} complete. {app} is restarting"
        ));
        Ok(())
    }

    /// Delete the completed job and everything hanging off it: the shadow
    /// source-representation instance, the source connection profile and the
    /// job itself. Deletion failures are logged, not fatal.
    pub async fn cleanup(&self, service: &str) -> Result<()> {
        let cfg = self.config.get(service).await?;
        let project_id = self.cloud.project_id(&cfg.require("gcp-project-name")?).await?;
        let region = cfg.require("gcp-instance-region")?;
        let job_id = format!("{MJ_PREFIX}{service}");

        let Some(status) = self
            .cloud
            .get_dms_status(&project_id, &region, &job_id)
            .await?
        else {
            self.log
                .warning(format!("job for service {service} was not found, exiting"));
            return Ok(());
        };
        if status.state != JobState::Completed {
            self.log
                .warning(format!("job for service {service} was not COMPLETED, exiting"));
            return Ok(());
        }

        if let Some(destination) = status.body["destination"].as_str() {
            let shadow = format!(
                "{}-master",
                destination.rsplit('/').next().unwrap_or(destination)
            );
            self.log.info(format!("deleting db ref {shadow}"));
            if let Err(e) = self.cloud.delete_instance(&project_id, &shadow).await {
                self.log
                    .warning(format!("unable to delete sql instance '{shadow}'. {e}"));
            }
        }

        if let Some(source) = status.body["source"].as_str() {
            self.log.info(format!("deleting profile {source}"));
            if let Err(e) = self.cloud.delete_connection_profile(source).await {
                self.log.warning(format!(
                    "unable to delete source connection profile '{source}'. {e}"
                ));
            }
        }

        self.log.info(format!("deleting job {job_id}"));
        if let Err(e) = self.cloud.delete_dms_job(&project_id, &region, &job_id).await {
            self.log
                .warning(format!("unable to delete dms job {job_id}. {e}"));
        }
        Ok(())
    }

    async fn save(&self, service: &str, patch: &[(&str, Value)]) -> Result<()> {
        let map: BTreeMap<String, serde_yaml::Value> = patch
            .iter()
            .map(|(k, v)| {
                let yaml = serde_yaml::to_value(v).unwrap_or(serde_yaml::Value::Null);
                (k.to_string(), yaml)
            })
            .collect();
        self.config.save(service, &map).await
    }

    /// Destination instance names conform to the pattern terraform expects:
    /// sql-{env-code}-p-{service-name}-{timestamp}.
    fn sql_instance_name(&self, service: &str, cfg: &ServiceConfig) -> Result<String> {
        let code = env_code(&cfg.require("k8s-env")?)?;
        Ok(format!("sql-{}-p-{}-{}", code, service, self.started))
    }

    async fn describe_dms_job(&self, service: &str) -> Result<Option<DmsJobStatus>> {
        let cfg = self.config.get(service).await?;
        let project_id = self.cloud.project_id(&cfg.require("gcp-project-name")?).await?;
        let region = cfg.require("gcp-instance-region")?;
        self.cloud
            .get_dms_status(&project_id, &region, &format!("{MJ_PREFIX}{service}"))
            .await
    }

    /// Upsert the source connection profile and, unless the job already has a
    /// destination instance, create the destination profile that materializes
    /// the Cloud SQL instance.
    async fn create_connection_profiles(&self, service: &str) -> Result<()> {
        self.log.info(format!("creating connection profiles for {service}"));
        let cfg = self.config.get(service).await?;
        let project_id = self.cloud.project_id(&cfg.require("gcp-project-name")?).await?;
        let region = cfg.require("gcp-instance-region")?;
        let job_id = format!("{MJ_PREFIX}{service}");

        let source_id = format!("{CP_SRC_PREFIX}{service}");
        let replication_password = cfg.get_str("aws-replication-password").ok_or_else(|| {
            MigratorError::Precondition(format!(
                "no replication password for {service}; run preflight first"
            ))
        })?;
        let source_body = json!({
            "displayName": source_id,
            "postgresql": {
                "host": cfg.require("aws-host")?,
                "port": cfg.require_port("aws-port")?,
                "username": cfg.require("aws-replication-username")?,
                "password": replication_password,
                "ssl": {
                    "type": "SERVER_ONLY",
                    "caCertificate": self.rds_cert,
                }
            }
        });
        self.cloud
            .upsert_connection_profile(&project_id, &region, &source_id, &source_body)
            .await?;

        if let Some(existing) = self
            .cloud
            .get_instance_name(&project_id, &region, &job_id)
            .await?
        {
            self.log.info(format!(
                "cloud SQL destination instance for {service} already created: {existing}"
            ));
            return Ok(());
        }

        let destination_id = self.sql_instance_name(service, &cfg)?;
        let root_password = generate_root_password();
        let cpu = cfg.get_i64("gcp-instance-cpu").ok_or_else(|| {
            MigratorError::Invalid(format!("gcp-instance-cpu is not numeric for {service}"))
        })?;
        let mem = cfg.get_i64("gcp-instance-mem").ok_or_else(|| {
            MigratorError::Invalid(format!("gcp-instance-mem is not numeric for {service}"))
        })?;
        self.log.debug(format!("{destination_id} cpu: {cpu}, mem: {mem}"));

        let (vpc_host, vpc_base) = vpc_names(&cfg.require("k8s-env")?)?;
        let vpc_host_id = self.cloud.project_id(&vpc_host).await?;
        let destination_body = json!({
            "displayName": destination_id,
            "cloudsql": {
                "settings": {
                    "autoStorageIncrease": yaml_to_json(cfg.get("gcp-auto-storage-increase")),
                    "dataDiskType": cfg.require("gcp-disk-type")?,
                    "rootPassword": root_password,
                    "databaseVersion": cfg.require("gcp-database-version")?,
                    "tier": format!("db-custom-{cpu}-{mem}"),
                    "dataDiskSizeGb": yaml_to_json(cfg.get("gcp-instance-storage")),
                    "sourceId": format!(
                        "projects/{project_id}/locations/{region}/connectionProfiles/{source_id}"
                    ),
                    "ipConfig": {
                        "enableIpv4": false,
                        "privateNetwork": format!(
                            "https://www.googleapis.com/compute/v1/projects/{vpc_host_id}/global/networks/{vpc_base}"
                        ),
                    }
                }
            }
        });
        self.cloud
            .upsert_connection_profile(&project_id, &region, &destination_id, &destination_body)
            .await?;
        self.save(service, &[("gcp-root-password", Value::from(root_password.clone()))])
            .await?;
        self.log
            .debug(format!("root password for {service}/{destination_id} saved"));

        // park the root credentials in the cluster just in case
        let host = self.cloud.get_host(&project_id, &destination_id).await?;
        self.cluster
            .create_secret(
                &cfg.require("gcp-rootuser-secret-name")?,
                &cfg.require("k8s-namespace")?,
                &SecretSpec {
                    username: "postgres".to_string(),
                    password: root_password,
                    dbname: "postgres".to_string(),
                    host,
                    port: DEFAULT_PORT.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Create the CONTINUOUS migration job and start it. An existing job is
    /// started only when it never ran.
    async fn create_dms_job(&self, service: &str) -> Result<()> {
        let cfg = self.config.get(service).await?;
        self.log.info(format!("creating dms job for {service}"));
        let project_id = self.cloud.project_id(&cfg.require("gcp-project-name")?).await?;
        let region = cfg.require("gcp-instance-region")?;
        let job_id = format!("{MJ_PREFIX}{service}");

        if let Some(status) = self
            .cloud
            .get_dms_status(&project_id, &region, &job_id)
            .await?
        {
            self.log.info(format!(
                "dms job {:?} exists in state {:?}",
                job_id, status.state
            ));
            if status.state == JobState::NotStarted {
                self.cloud
                    .start_migration_job(&project_id, &region, &job_id)
                    .await?;
            }
            return Ok(());
        }

        let source_id = format!("{CP_SRC_PREFIX}{service}");
        let destination_id = self.sql_instance_name(service, &cfg)?;
        let (vpc_host, vpc_base) = vpc_names(&cfg.require("k8s-env")?)?;
        let vpc_host_id = self.cloud.project_id(&vpc_host).await?;
        let body = json!({
            "type": "CONTINUOUS",
            "source": format!(
                "projects/{project_id}/locations/{region}/connectionProfiles/{source_id}"
            ),
            "destination": format!(
                "projects/{project_id}/locations/{region}/connectionProfiles/{destination_id}"
            ),
            "destinationDatabase": {
                "provider": "CLOUDSQL",
                "engine": "POSTGRESQL"
            },
            "vpcPeeringConnectivity": {
                "vpc": format!(
                    "https://www.googleapis.com/compute/v1/projects/{vpc_host_id}/global/networks/{vpc_base}"
                )
            }
        });
        self.cloud
            .create_migration_job(&project_id, &region, &job_id, &body)
            .await?;
        self.cloud
            .start_migration_job(&project_id, &region, &job_id)
            .await?;
        Ok(())
    }

    /// Provision readonly/readwrite users on the target instance, persist the
    /// connection material, and grant table access. Table ownership stays with
    /// the migration user until promotion.
    async fn create_db_users(&self, service: &str) -> Result<()> {
        let cfg = self.config.get(service).await?;
        let project_id = self.cloud.project_id(&cfg.require("gcp-project-name")?).await?;
        let region = cfg.require("gcp-instance-region")?;
        let job_id = format!("{MJ_PREFIX}{service}");

        let instance = match self
            .cloud
            .get_instance_name(&project_id, &region, &job_id)
            .await?
        {
            Some(instance) => instance,
            None => self.sql_instance_name(service, &cfg)?,
        };

        let ro_password = self
            .cloud
            .create_user(
                &project_id,
                &instance,
                "readonly",
                cfg.get_str("gcp-readonly-password"),
            )
            .await?;
        let rw_password = self
            .cloud
            .create_user(
                &project_id,
                &instance,
                "readwrite",
                cfg.get_str("gcp-readwrite-password"),
            )
            .await?;
        let host = self.cloud.get_host(&project_id, &instance).await?;
        self.save(
            service,
            &[
                ("gcp-readonly-password", Value::from(ro_password)),
                ("gcp-readwrite-password", Value::from(rw_password)),
                ("gcp-host", Value::from(host)),
                ("gcp-port", Value::from(DEFAULT_PORT)),
            ],
        )
        .await?;

        self.grant_access_to_user(service, "readwrite").await?;
        self.grant_access_to_user(service, "readonly").await?;
        Ok(())
    }

    async fn grant_access_to_user(&self, service: &str, grantee: &str) -> Result<()> {
        let cfg = self.config.get(service).await?;
        let conn = PgConn {
            host: cfg.require("gcp-host")?,
            port: DEFAULT_PORT,
            dbname: cfg.require("database-name")?,
            user: "postgres".to_string(),
            password: cfg.require("gcp-root-password")?,
        };
        self.cluster.grant_access(&conn, grantee).await
    }

    /// Secrets the workload uses while the job is at or before CDC. Local
    /// strategy points at the target with the rw secret deliberately bound to
    /// the readonly identity (no writes may land on the target before
    /// promotion); remote keeps the workload on the source.
    async fn create_sync_secrets(&self, service: &str, force_local: bool) -> Result<()> {
        let cfg = self.config.get(service).await?;
        let namespace = cfg.require("k8s-namespace")?;
        let dbname = cfg.require("database-name")?;

        let local = force_local || cfg.require("gcp-migration-strategy")? == "local";
        let (host, port, rw_username, rw_password, ro_password) = if local {
            (
                cfg.require("gcp-host")?,
                cfg.require("gcp-port")?,
                "readonly".to_string(),
                cfg.require("gcp-readonly-password")?,
                cfg.require("gcp-readonly-password")?,
            )
        } else {
            (
                cfg.require("aws-host")?,
                cfg.require("aws-port")?,
                "readwrite".to_string(),
                cfg.require("aws-readwrite-password")?,
                cfg.require("aws-readonly-password")?,
            )
        };

        self.cluster
            .create_secret(
                &cfg.require("readwrite-secret-name")?,
                &namespace,
                &SecretSpec {
                    username: rw_username,
                    password: rw_password,
                    dbname: dbname.clone(),
                    host: host.clone(),
                    port: port.clone(),
                },
            )
            .await?;
        self.cluster
            .create_secret(
                &cfg.require("readonly-secret-name")?,
                &namespace,
                &SecretSpec {
                    username: "readonly".to_string(),
                    password: ro_password,
                    dbname,
                    host,
                    port,
                },
            )
            .await?;
        Ok(())
    }

    /// Post-promotion secrets: real identities, pointing at the target.
    async fn create_cutover_secrets(&self, service: &str) -> Result<()> {
        let cfg = self.config.get(service).await?;
        let namespace = cfg.require("k8s-namespace")?;
        let dbname = cfg.require("database-name")?;
        let host = cfg.require("gcp-host")?;
        let port = cfg.require("gcp-port")?;

        self.cluster
            .create_secret(
                &cfg.require("readwrite-secret-name")?,
                &namespace,
                &SecretSpec {
                    username: "readwrite".to_string(),
                    password: cfg.require("gcp-readwrite-password")?,
                    dbname: dbname.clone(),
                    host: host.clone(),
                    port: port.clone(),
                },
            )
            .await?;
        self.cluster
            .create_secret(
                &cfg.require("readonly-secret-name")?,
                &namespace,
                &SecretSpec {
                    username: "readonly".to_string(),
                    password: cfg.require("gcp-readonly-password")?,
                    dbname,
                    host,
                    port,
                },
            )
            .await?;
        Ok(())
    }

    /// Promote only from CDC; a job that is gone or already COMPLETED counts
    /// as promoted.
    async fn promote_dms_job(&self, service: &str) -> Result<bool> {
        let cfg = self.config.get(service).await?;
        let project_id = self.cloud.project_id(&cfg.require("gcp-project-name")?).await?;
        let region = cfg.require("gcp-instance-region")?;
        let job_id = format!("{MJ_PREFIX}{service}");

        let status = self.cloud.get_dms_status(&project_id, &region, &job_id).await?;
        match status {
            None => {
                self.log.warning(format!("promotion already done for {service}"));
                Ok(true)
            }
            Some(status) if status.state == JobState::Completed => {
                self.log.warning(format!("promotion already done for {service}"));
                Ok(true)
            }
            Some(status) if status.phase == JobPhase::Cdc => {
                self.cloud.promote_dms_job(&project_id, &region, &job_id).await?;
                Ok(true)
            }
            Some(status) => {
                self.log.warning(format!(
                    "not ready to promote job {}. state: {:?}/{:?}",
                    service, status.state, status.phase
                ));
                Ok(false)
            }
        }
    }

    /// Poll until the job reaches `target`, backing off 1s -> 10s. A FAILED
    /// job fails fast.
    async fn await_state(&self, service: &str, target: JobState) -> Result<()> {
        let mut status = self.describe_dms_job(service).await?.ok_or_else(|| {
            MigratorError::Precondition(format!("dms job for service {service} was not found"))
        })?;
        self.log.info(format!(
            "state of job/{}: {:?}, target: {:?}",
            service, status.state, target
        ));
        let mut delay = 1;
        while status.state != target {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            delay = (delay * 2).min(10);
            status = self.describe_dms_job(service).await?.ok_or_else(|| {
                MigratorError::Precondition(format!("dms job for service {service} disappeared"))
            })?;
            if status.state == JobState::Failed {
                return Err(MigratorError::Precondition(format!(
                    "job failed: {}",
                    status.body
                )));
            }
        }
        self.log.info(format!(
            "state of job/{}: {:?}",
            service, status.state
        ));
        Ok(())
    }

    /// Poll until the replication phase reaches `target` under the phase
    /// ordering. The job must stay RUNNING; COMPLETED short-circuits.
    async fn await_phase(&self, service: &str, target: JobPhase) -> Result<()> {
        let status = self.describe_dms_job(service).await?.ok_or_else(|| {
            MigratorError::Precondition(format!("dms job for service {service} was not found"))
        })?;
        if status.state != JobState::Running {
            return Err(MigratorError::Precondition(format!(
                "job was not in RUNNING state: {:?}",
                status.state
            )));
        }

        let start = std::time::Instant::now();
        let mut phase = status.phase;
        self.log.info(format!(
            "phase {}: {:?}, target: {:?}",
            service, phase, target
        ));
        let mut delay = 1;
        while phase.rank() < target.rank() {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            delay = (delay * 2).min(10);
            let status = self.describe_dms_job(service).await?.ok_or_else(|| {
                MigratorError::Precondition(format!("dms job for service {service} disappeared"))
            })?;
            if status.state == JobState::Completed {
                break;
            }
            if status.state != JobState::Running {
                return Err(MigratorError::Precondition(format!(
                    "job was not in RUNNING state: {:?}",
                    status.state
                )));
            }
            phase = status.phase;
        }
        self.log.info(format!(
            "phase {}: {:?}, target: {:?} after {:.0?}",
            service,
            phase,
            target,
            start.elapsed()
        ));
        Ok(())
    }
}

fn yaml_to_json(v: Option<serde_yaml::Value>) -> Value {
    v.and_then(|v| serde_json::to_value(v).ok()).unwrap_or(Value::Null)
}

fn generate_root_password() -> String {
    let pg = PasswordGenerator {
        length: 12,
        numbers: true,
        lowercase_letters: false,
        uppercase_letters: true,
        symbols: false,
        spaces: false,
        exclude_similar_characters: false,
        strict: true,
    };
    pg.generate_one().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    struct MemStore {
        services: Mutex<BTreeMap<String, BTreeMap<String, serde_yaml::Value>>>,
    }

    impl MemStore {
        fn single(service: &str, pairs: &[(&str, serde_yaml::Value)]) -> Arc<Self> {
            let props = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            Arc::new(Self {
                services: Mutex::new(BTreeMap::from([(service.to_string(), props)])),
            })
        }

        fn prop(&self, service: &str, key: &str) -> Option<String> {
            let services = self.services.lock().unwrap();
            services
                .get(service)
                .and_then(|p| p.get(key))
                .and_then(|v| v.as_str().map(str::to_string))
        }
    }

    #[async_trait]
    impl ConfigStore for MemStore {
        async fn keys(&self) -> Result<Vec<String>> {
            Ok(self.services.lock().unwrap().keys().cloned().collect())
        }

        async fn get(&self, service: &str) -> Result<ServiceConfig> {
            self.services
                .lock()
                .unwrap()
                .get(service)
                .map(|p| ServiceConfig::new(service, p.clone()))
                .ok_or_else(|| MigratorError::NotFound(service.to_string()))
        }

        async fn save(
            &self,
            service: &str,
            patch: &BTreeMap<String, serde_yaml::Value>,
        ) -> Result<()> {
            let mut services = self.services.lock().unwrap();
            let props = services
                .get_mut(service)
                .ok_or_else(|| MigratorError::NotFound(service.to_string()))?;
            for (k, v) in patch {
                props.insert(k.clone(), v.clone());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCloud {
        /// successive answers to get_dms_status; the last one repeats
        statuses: Mutex<VecDeque<Option<DmsJobStatus>>>,
        instance_name: Mutex<Option<String>>,
        upserted_profiles: Mutex<Vec<String>>,
        created_jobs: Mutex<Vec<String>>,
        started_jobs: Mutex<Vec<String>>,
        promoted_jobs: Mutex<Vec<String>>,
        deleted_instances: Mutex<Vec<String>>,
        deleted_profiles: Mutex<Vec<String>>,
        deleted_jobs: Mutex<Vec<String>>,
        created_users: Mutex<HashMap<String, String>>,
        fail_deletes: bool,
    }

    impl FakeCloud {
        fn with_statuses(statuses: Vec<Option<DmsJobStatus>>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.into()),
                ..Default::default()
            })
        }
    }

    fn job(state: JobState, phase: JobPhase) -> Option<DmsJobStatus> {
        Some(DmsJobStatus {
            state,
            phase,
            body: json!({
                "source": "projects/pid/locations/region-1/connectionProfiles/src-svc",
                "destination": "projects/pid/locations/region-1/connectionProfiles/sql-d-p-svc-x",
                "state": format!("{state:?}"),
            }),
        })
    }

    #[async_trait]
    impl CloudApi for FakeCloud {
        async fn project_id(&self, name: &str) -> Result<String> {
            Ok(format!("{name}-id"))
        }

        async fn upsert_connection_profile(
            &self,
            _project: &str,
            _region: &str,
            profile_id: &str,
            _body: &Value,
        ) -> Result<()> {
            self.upserted_profiles
                .lock()
                .unwrap()
                .push(profile_id.to_string());
            Ok(())
        }

        async fn delete_connection_profile(&self, reference: &str) -> Result<()> {
            if self.fail_deletes {
                return Err(MigratorError::GcpApiError("boom".to_string()));
            }
            self.deleted_profiles
                .lock()
                .unwrap()
                .push(reference.to_string());
            Ok(())
        }

        async fn create_migration_job(
            &self,
            _project: &str,
            _region: &str,
            job_id: &str,
            _body: &Value,
        ) -> Result<()> {
            self.created_jobs.lock().unwrap().push(job_id.to_string());
            Ok(())
        }

        async fn start_migration_job(
            &self,
            _project: &str,
            _region: &str,
            job_id: &str,
        ) -> Result<()> {
            self.started_jobs.lock().unwrap().push(job_id.to_string());
            Ok(())
        }

        async fn get_dms_status(
            &self,
            _project: &str,
            _region: &str,
            _job_id: &str,
        ) -> Result<Option<DmsJobStatus>> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.pop_front().unwrap_or(None))
            } else {
                Ok(statuses.front().cloned().unwrap_or(None))
            }
        }

        async fn promote_dms_job(&self, _project: &str, _region: &str, job_id: &str) -> Result<()> {
            self.promoted_jobs.lock().unwrap().push(job_id.to_string());
            Ok(())
        }

        async fn delete_dms_job(&self, _project: &str, _region: &str, job_id: &str) -> Result<()> {
            if self.fail_deletes {
                return Err(MigratorError::GcpApiError("boom".to_string()));
            }
            self.deleted_jobs.lock().unwrap().push(job_id.to_string());
            Ok(())
        }

        async fn get_instance_name(
            &self,
            _project: &str,
            _region: &str,
            _job_id: &str,
        ) -> Result<Option<String>> {
            Ok(self.instance_name.lock().unwrap().clone())
        }

        async fn get_host(&self, _project: &str, _instance: &str) -> Result<String> {
            Ok("10.20.30.40".to_string())
        }

        async fn create_user(
            &self,
            _project: &str,
            _instance: &str,
            username: &str,
            password: Option<String>,
        ) -> Result<String> {
            let password = password.unwrap_or_else(|| format!("gen-{username}"));
            self.created_users
                .lock()
                .unwrap()
                .insert(username.to_string(), password.clone());
            Ok(password)
        }

        async fn delete_instance(&self, _project: &str, instance: &str) -> Result<()> {
            if self.fail_deletes {
                return Err(MigratorError::GcpApiError("boom".to_string()));
            }
            self.deleted_instances
                .lock()
                .unwrap()
                .push(instance.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCluster {
        secrets: Mutex<HashMap<String, SecretSpec>>,
        restarts: Mutex<u32>,
        healthy: bool,
        connection_error: Option<String>,
        grants: Mutex<Vec<(String, String)>>,
        owners: Mutex<Vec<(String, String)>>,
        replication_users: Mutex<Vec<(String, Option<String>)>>,
    }

    impl FakeCluster {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                healthy: true,
                ..Default::default()
            })
        }

        fn secret(&self, name: &str) -> SecretSpec {
            self.secrets.lock().unwrap().get(name).cloned().unwrap()
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn create_secret(
            &self,
            name: &str,
            _namespace: &str,
            spec: &SecretSpec,
        ) -> Result<()> {
            self.secrets
                .lock()
                .unwrap()
                .insert(name.to_string(), spec.clone());
            Ok(())
        }

        async fn restart_workload(&self, _name: &str, _namespace: &str) -> Result<()> {
            *self.restarts.lock().unwrap() += 1;
            Ok(())
        }

        async fn check_app_healthy(&self, namespace: &str, app: &str) -> Result<(bool, String)> {
            if self.healthy {
                Ok((true, String::new()))
            } else {
                Ok((
                    false,
                    format!("statefulset or deployment {namespace}/{app} does not exist"),
                ))
            }
        }

        async fn pods_status(&self, _namespace: &str, _app: &str) -> Result<PodsStatus> {
            Ok(PodsStatus::default())
        }

        async fn check_connection(&self, _conn: &PgConn) -> Result<()> {
            match &self.connection_error {
                Some(reason) => Err(MigratorError::SqlError(sqlx::Error::Protocol(
                    reason.clone(),
                ))),
                None => Ok(()),
            }
        }

        async fn grant_access(&self, conn: &PgConn, grantee: &str) -> Result<()> {
            self.grants
                .lock()
                .unwrap()
                .push((conn.user.clone(), grantee.to_string()));
            Ok(())
        }

        async fn set_owner_all_tables(&self, conn: &PgConn, grantee: &str) -> Result<()> {
            self.owners
                .lock()
                .unwrap()
                .push((conn.user.clone(), grantee.to_string()));
            Ok(())
        }

        async fn create_replication_user(
            &self,
            username: &str,
            password: Option<String>,
            _conn: &PgConn,
        ) -> Result<String> {
            self.replication_users
                .lock()
                .unwrap()
                .push((username.to_string(), password.clone()));
            Ok(password.unwrap_or_else(|| "generated-replication-pw".to_string()))
        }
    }

    fn yv(v: &str) -> serde_yaml::Value {
        serde_yaml::Value::from(v.to_string())
    }

    fn base_config(strategy: &str) -> Vec<(&'static str, serde_yaml::Value)> {
        vec![
            ("aws-host", yv("rds.example.com")),
            ("aws-port", serde_yaml::Value::from(5432)),
            ("aws-instance", yv("svc-instance")),
            ("aws-master-password", yv("master-pw")),
            ("aws-replication-username", yv("gcp_replication")),
            ("aws-replication-password", yv("repl-pw")),
            ("aws-readonly-password", yv("aws-ro-pw")),
            ("aws-readwrite-password", yv("aws-rw-pw")),
            ("readwrite-secret-name", yv("svc.appdb.rw")),
            ("readonly-secret-name", yv("svc.appdb.ro")),
            ("gcp-project-name", yv("my-project")),
            ("gcp-instance-region", yv("region-1")),
            ("gcp-instance-cpu", serde_yaml::Value::from(2)),
            ("gcp-instance-mem", serde_yaml::Value::from(4096)),
            ("gcp-instance-storage", serde_yaml::Value::from(100)),
            ("gcp-disk-type", yv("PD_SSD")),
            ("gcp-auto-storage-increase", serde_yaml::Value::from(true)),
            ("gcp-database-version", yv("POSTGRES_12")),
            (
                "gcp-migration-strategy",
                yv(strategy),
            ),
            ("k8s-env", yv("dev")),
            ("k8s-namespace", yv("apps")),
            ("k8s-service", yv("svc")),
        ]
    }

    fn synced_config(strategy: &str) -> Vec<(&'static str, serde_yaml::Value)> {
        let mut pairs = base_config(strategy);
        pairs.push(("gcp-host", yv("10.20.30.40")));
        pairs.push(("gcp-port", serde_yaml::Value::from(5432)));
        pairs.push(("gcp-root-password", yv("ROOTPW123456")));
        pairs.push(("gcp-readonly-password", yv("gcp-ro-pw")));
        pairs.push(("gcp-readwrite-password", yv("gcp-rw-pw")));
        pairs
    }

    fn migration(
        store: Arc<MemStore>,
        cloud: Arc<FakeCloud>,
        cluster: Arc<FakeCluster>,
    ) -> Migration {
        let (log, _rx) = TaskLog::channel("test");
        Migration::new(store, cloud, cluster, log).with_settle(Duration::ZERO)
    }

    #[tokio::test]
    async fn preflight_short_circuits_on_master_connection_failure() {
        let store = MemStore::single("svc", &base_config("local"));
        let cloud = FakeCloud::with_statuses(vec![]);
        let cluster = Arc::new(FakeCluster {
            healthy: true,
            connection_error: Some("password authentication failed".to_string()),
            ..Default::default()
        });
        let m = migration(store.clone(), cloud, cluster.clone());

        let status = m.preflight("svc").await.unwrap();
        assert_eq!(status["app"], "ok");
        assert!(status["rdsMaster"]
            .as_str()
            .unwrap()
            .starts_with("failed to connect to db rds.example.com/appdb as pgadmin"));
        assert_eq!(status["pass"], false);
        // short-circuit: the replication user is never touched
        assert!(cluster.replication_users.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preflight_persists_generated_replication_password() {
        let mut pairs = base_config("local");
        pairs.retain(|(k, _)| *k != "aws-replication-password");
        let store = MemStore::single("svc", &pairs);
        let cloud = FakeCloud::with_statuses(vec![]);
        let cluster = FakeCluster::healthy();
        let m = migration(store.clone(), cloud, cluster.clone());

        let status = m.preflight("svc").await.unwrap();
        assert_eq!(status["pass"], true);
        assert_eq!(
            store.prop("svc", "aws-replication-password").as_deref(),
            Some("generated-replication-pw")
        );
        let calls = cluster.replication_users.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("gcp_replication".to_string(), None)]);
    }

    #[tokio::test]
    async fn preflight_keeps_existing_replication_password() {
        let store = MemStore::single("svc", &base_config("local"));
        let cloud = FakeCloud::with_statuses(vec![]);
        let cluster = FakeCluster::healthy();
        let m = migration(store.clone(), cloud, cluster.clone());

        let status = m.preflight("svc").await.unwrap();
        assert_eq!(status["pass"], true);
        assert_eq!(store.prop("svc", "aws-replication-password").as_deref(), Some("repl-pw"));
        let calls = cluster.replication_users.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[("gcp_replication".to_string(), Some("repl-pw".to_string()))]
        );
    }

    #[tokio::test]
    async fn sync_local_provisions_and_blocks_target_writes() {
        let store = MemStore::single("svc", &base_config("local"));
        // no job yet; once created it is RUNNING and already at CDC
        let cloud = FakeCloud::with_statuses(vec![
            None,
            job(JobState::Running, JobPhase::Cdc),
        ]);
        let cluster = FakeCluster::healthy();
        let m = migration(store.clone(), cloud.clone(), cluster.clone());

        m.sync("svc").await.unwrap();

        // source + destination connection profiles, one migration job, started
        let profiles = cloud.upserted_profiles.lock().unwrap();
        assert_eq!(profiles[0], "src-svc");
        assert_eq!(profiles.len(), 2);
        assert!(profiles[1].starts_with("sql-d-p-svc-"));
        assert_eq!(cloud.created_jobs.lock().unwrap().as_slice(), &["auto-mj-svc".to_string()]);
        assert_eq!(cloud.started_jobs.lock().unwrap().len(), 1);

        // connection material persisted exactly once
        for key in [
            "gcp-host",
            "gcp-root-password",
            "gcp-readonly-password",
            "gcp-readwrite-password",
        ] {
            assert!(store.prop("svc", key).is_some(), "missing {key}");
        }
        assert_eq!(store.prop("svc", "gcp-host").as_deref(), Some("10.20.30.40"));

        // rw secret deliberately bound to the readonly identity
        let rw = cluster.secret("svc.appdb.rw");
        assert_eq!(rw.username, "readonly");
        assert_eq!(rw.password, "gen-readonly");
        assert_eq!(rw.host, "10.20.30.40");
        assert_eq!(rw.dbname, "appdb");
        let ro = cluster.secret("svc.appdb.ro");
        assert_eq!(ro.username, "readonly");
        assert_eq!(ro.password, "gen-readonly");

        // root credentials parked in the cluster
        let root = cluster.secret("svc.appdb.root");
        assert_eq!(root.username, "postgres");
        assert_eq!(root.dbname, "postgres");

        // grants went to both users as postgres, ownership untouched
        let grants = cluster.grants.lock().unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|(user, _)| user == "postgres"));
        assert!(cluster.owners.lock().unwrap().is_empty());

        assert_eq!(*cluster.restarts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_remote_keeps_workload_on_source() {
        let store = MemStore::single("svc", &base_config("remote"));
        let cloud = FakeCloud::with_statuses(vec![
            None,
            job(JobState::Running, JobPhase::Cdc),
        ]);
        let cluster = FakeCluster::healthy();
        let m = migration(store.clone(), cloud, cluster.clone());

        m.sync("svc").await.unwrap();

        let rw = cluster.secret("svc.appdb.rw");
        assert_eq!(rw.username, "readwrite");
        assert_eq!(rw.password, "aws-rw-pw");
        assert_eq!(rw.host, "rds.example.com");
        let ro = cluster.secret("svc.appdb.ro");
        assert_eq!(ro.password, "aws-ro-pw");
        assert_eq!(ro.host, "rds.example.com");
    }

    #[tokio::test]
    async fn sync_again_creates_no_new_resources() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![job(JobState::Running, JobPhase::Cdc)]);
        *cloud.instance_name.lock().unwrap() = Some("sql-d-p-svc-20240101t000000".to_string());
        let cluster = FakeCluster::healthy();
        let m = migration(store.clone(), cloud.clone(), cluster.clone());

        m.sync("svc").await.unwrap();

        // only the source profile is re-applied; nothing else is re-created
        let profiles = cloud.upserted_profiles.lock().unwrap();
        assert_eq!(profiles.as_slice(), &["src-svc".to_string()]);
        assert!(cloud.created_jobs.lock().unwrap().is_empty());
        assert!(cloud.started_jobs.lock().unwrap().is_empty());
        // stored credentials survive
        assert_eq!(store.prop("svc", "gcp-root-password").as_deref(), Some("ROOTPW123456"));
        assert_eq!(
            store.prop("svc", "gcp-readonly-password").as_deref(),
            Some("gcp-ro-pw")
        );
    }

    #[tokio::test]
    async fn cutover_promotes_once_and_finishes() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![
            job(JobState::Running, JobPhase::Cdc),
            job(JobState::Running, JobPhase::Cdc),
            job(JobState::Completed, JobPhase::PromoteInProgress),
        ]);
        let cluster = FakeCluster::healthy();
        let m = migration(store.clone(), cloud.clone(), cluster.clone());

        m.cutover("svc").await.unwrap();

        assert_eq!(cloud.promoted_jobs.lock().unwrap().as_slice(), &["auto-mj-svc".to_string()]);
        let rw = cluster.secret("svc.appdb.rw");
        assert_eq!(rw.username, "readwrite");
        assert_eq!(rw.password, "gcp-rw-pw");
        assert_eq!(rw.host, "10.20.30.40");
        let ro = cluster.secret("svc.appdb.ro");
        assert_eq!(ro.username, "readonly");
        assert_eq!(ro.password, "gcp-ro-pw");
        let owners = cluster.owners.lock().unwrap();
        assert_eq!(owners.as_slice(), &[("postgres".to_string(), "readwrite".to_string())]);
        assert_eq!(*cluster.restarts.lock().unwrap(), 1);

        // a second cutover short-circuits on COMPLETED
        m.cutover("svc").await.unwrap();
        assert_eq!(cloud.promoted_jobs.lock().unwrap().len(), 1);
        assert_eq!(*cluster.restarts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cutover_requires_running_cdc() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![job(JobState::Running, JobPhase::FullDump)]);
        let cluster = FakeCluster::healthy();
        let m = migration(store, cloud.clone(), cluster.clone());

        let err = m.cutover("svc").await.unwrap_err();
        assert!(matches!(err, MigratorError::Precondition(_)));
        // precondition failures mutate nothing
        assert!(cluster.secrets.lock().unwrap().is_empty());
        assert!(cloud.promoted_jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_deletes_job_and_references() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud =
            FakeCloud::with_statuses(vec![job(JobState::Completed, JobPhase::PromoteInProgress)]);
        let cluster = FakeCluster::healthy();
        let m = migration(store, cloud.clone(), cluster);

        m.cleanup("svc").await.unwrap();

        assert_eq!(
            cloud.deleted_instances.lock().unwrap().as_slice(),
            &["sql-d-p-svc-x-master".to_string()]
        );
        assert_eq!(
            cloud.deleted_profiles.lock().unwrap().as_slice(),
            &["projects/pid/locations/region-1/connectionProfiles/src-svc".to_string()]
        );
        assert_eq!(cloud.deleted_jobs.lock().unwrap().as_slice(), &["auto-mj-svc".to_string()]);
    }

    #[tokio::test]
    async fn cleanup_skips_unfinished_jobs() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![job(JobState::Running, JobPhase::Cdc)]);
        let cluster = FakeCluster::healthy();
        let m = migration(store, cloud.clone(), cluster);

        m.cleanup("svc").await.unwrap();
        assert!(cloud.deleted_instances.lock().unwrap().is_empty());
        assert!(cloud.deleted_jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_swallows_deletion_failures() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = Arc::new(FakeCloud {
            statuses: Mutex::new(
                vec![job(JobState::Completed, JobPhase::PromoteInProgress)].into(),
            ),
            fail_deletes: true,
            ..Default::default()
        });
        let cluster = FakeCluster::healthy();
        let m = migration(store, cloud, cluster);

        // each deletion fails; cleanup still reports success
        m.cleanup("svc").await.unwrap();
    }

    #[tokio::test]
    async fn await_phase_polls_until_target() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![
            job(JobState::Running, JobPhase::FullDump),
            job(JobState::Running, JobPhase::Cdc),
        ]);
        let m = migration(store, cloud, FakeCluster::healthy());
        m.await_phase("svc", JobPhase::Cdc).await.unwrap();
    }

    #[tokio::test]
    async fn await_phase_allows_completed_to_short_circuit() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![
            job(JobState::Running, JobPhase::FullDump),
            job(JobState::Completed, JobPhase::PromoteInProgress),
        ]);
        let m = migration(store, cloud, FakeCluster::healthy());
        m.await_phase("svc", JobPhase::Cdc).await.unwrap();
    }

    #[tokio::test]
    async fn await_phase_fails_when_job_leaves_running() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![
            job(JobState::Running, JobPhase::FullDump),
            job(JobState::Failed, JobPhase::PhaseUnspecified),
        ]);
        let m = migration(store, cloud, FakeCluster::healthy());
        let err = m.await_phase("svc", JobPhase::Cdc).await.unwrap_err();
        assert!(matches!(err, MigratorError::Precondition(_)));
    }

    #[tokio::test]
    async fn await_phase_requires_running_at_entry() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![job(
            JobState::NotStarted,
            JobPhase::PhaseUnspecified,
        )]);
        let m = migration(store, cloud, FakeCluster::healthy());
        let err = m.await_phase("svc", JobPhase::Cdc).await.unwrap_err();
        assert!(matches!(err, MigratorError::Precondition(_)));
    }

    #[tokio::test]
    async fn await_state_fails_fast_on_failed() {
        let store = MemStore::single("svc", &synced_config("local"));
        let cloud = FakeCloud::with_statuses(vec![
            job(JobState::Creating, JobPhase::PhaseUnspecified),
            job(JobState::Failed, JobPhase::PhaseUnspecified),
        ]);
        let m = migration(store, cloud, FakeCluster::healthy());
        let err = m.await_state("svc", JobState::Running).await.unwrap_err();
        assert!(matches!(err, MigratorError::Precondition(_)));
    }
}
