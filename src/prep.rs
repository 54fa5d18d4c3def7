//! Bootstrap CLI: the source-side preparations that happen before the control
//! plane takes over, run from an operator workstation with cluster and AWS
//! access.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use log::{info, warn};

use migrator::aws::RdsApi;
use migrator::cluster::sql::PodExecSql;
use migrator::cluster::{ClusterCtl, PgConn};
use migrator::config::{
    ConfigMapStore, ConfigStore, FileStore, DEFAULT_CONFIG_MAP, DEFAULT_CONFIG_NAMESPACE,
};

/// Private ranges the target cloud connects from.
const INGRESS_CIDRS: &[&str] = &["10.0.0.0/8", "172.0.0.0/8", "192.0.0.0/8"];

const DEFAULT_REPLICATION_USER: &str = "gcp_replication";

#[derive(Parser)]
#[command(name = "prep", about = "Source-side preparation for Cloud SQL migrations")]
struct Cli {
    /// Path to the services YAML, or "k8s" to use the cluster ConfigMap
    #[arg(long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check config completeness and source connectivity
    Validate {
        #[arg(long, default_value = "all")]
        service: String,
    },
    /// Ensure the RDS security group admits the target cloud's ranges
    PrepareNetwork {
        #[arg(long, default_value = "all")]
        service: String,
    },
    /// Reset the master password when unset, optionally pre-create the
    /// replication user
    PrepareUsers {
        #[arg(long)]
        service: String,
        #[arg(long)]
        create_replication_user: bool,
    },
    /// Push a local services YAML into the cluster ConfigMap
    UpdateConfigMap {
        #[arg(long)]
        location: String,
        #[arg(long, default_value = DEFAULT_CONFIG_MAP)]
        name: String,
        #[arg(long, default_value = DEFAULT_CONFIG_NAMESPACE)]
        namespace: String,
        /// Only push one service instead of the whole document
        #[arg(long)]
        service: Option<String>,
    },
}

async fn store(config: &str) -> anyhow::Result<Arc<dyn ConfigStore>> {
    if config == "k8s" {
        let client = Client::try_default().await?;
        Ok(Arc::new(ConfigMapStore::from_env(client)))
    } else {
        Ok(Arc::new(FileStore::new(config).await?))
    }
}

async fn cluster() -> anyhow::Result<ClusterCtl> {
    let client = Client::try_default().await?;
    let pod = std::env::var("PSQL_PROXY_POD").unwrap_or_else(|_| String::from("psql-proxy"));
    let namespace =
        std::env::var("PSQL_PROXY_NAMESPACE").unwrap_or_else(|_| String::from("default"));
    let sql = Arc::new(PodExecSql::new(client.clone(), &namespace, &pod));
    Ok(ClusterCtl::new(client, sql))
}

fn targets(all: Vec<String>, service: &str) -> Vec<String> {
    if service == "all" {
        all
    } else {
        vec![service.to_string()]
    }
}

async fn validate(store: Arc<dyn ConfigStore>, service: &str) -> anyhow::Result<()> {
    let cluster = cluster().await?;
    for name in targets(store.keys().await?, service) {
        let errors = store.validate(&name).await?;
        if !errors.is_empty() {
            bail!("validation errors:\n{}", errors.join("\n"));
        }
        let cfg = store.get(&name).await?;
        let conn = PgConn {
            host: cfg.require("aws-host")?,
            port: cfg.require_port("aws-port")?,
            dbname: cfg.require("database-name")?,
            user: cfg.require("aws-replication-username")?,
            password: cfg.require("aws-replication-password")?,
        };
        cluster.check_connection(&conn).await?;
        info!("{name}: ok");
    }
    Ok(())
}

async fn prepare_network(store: Arc<dyn ConfigStore>, service: &str) -> anyhow::Result<()> {
    let aws = RdsApi::new().await;
    let cidrs: Vec<String> = INGRESS_CIDRS.iter().map(|c| c.to_string()).collect();
    for name in targets(store.keys().await?, service) {
        let cfg = store.get(&name).await?;
        let instance = cfg.require("aws-instance")?;
        let added = aws.allow_ingress(&instance, &cidrs).await?;
        if added.is_empty() {
            info!("no action taken for {name}/{instance}");
        } else {
            info!("updating allowed cidr blocks for {name}/{instance} :: {added:?}");
        }
    }
    Ok(())
}

async fn prepare_users(
    store: Arc<dyn ConfigStore>,
    service: &str,
    create_replication_user: bool,
) -> anyhow::Result<()> {
    let cfg = store.get(service).await?;
    let aws = RdsApi::new().await;

    let master_password = match cfg.get_str("aws-master-password") {
        Some(password) => password,
        None => {
            info!("resetting master password for {service}");
            let password = aws
                .reset_master_password(&cfg.require("aws-instance")?)
                .await?;
            store
                .save(
                    service,
                    &BTreeMap::from([(
                        "aws-master-password".to_string(),
                        serde_yaml::Value::from(password.clone()),
                    )]),
                )
                .await?;
            password
        }
    };

    if !create_replication_user {
        info!("skipping creating replication user, this will happen automatically on sync");
        return Ok(());
    }

    info!("creating replication user");
    let username = cfg
        .get_str("aws-replication-username")
        .unwrap_or_else(|| DEFAULT_REPLICATION_USER.to_string());
    let conn = PgConn {
        host: cfg.require("aws-host")?,
        port: cfg.require_port("aws-port")?,
        dbname: cfg.require("database-name")?,
        user: cfg.require("aws-master-username")?,
        password: master_password,
    };
    let password = cluster()
        .await?
        .create_replication_user(&username, None, &conn)
        .await?;
    store
        .save(
            service,
            &BTreeMap::from([
                (
                    "aws-replication-username".to_string(),
                    serde_yaml::Value::from(username),
                ),
                (
                    "aws-replication-password".to_string(),
                    serde_yaml::Value::from(password),
                ),
            ]),
        )
        .await?;
    Ok(())
}

async fn update_config_map(
    location: &str,
    name: &str,
    namespace: &str,
    service: Option<&str>,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(location)
        .await
        .with_context(|| format!("reading {location}"))?;
    let doc: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&raw)?;

    let mut data = BTreeMap::new();
    for (key, value) in &doc {
        if service.is_none() || service == Some(key.as_str()) {
            data.insert(key.clone(), serde_yaml::to_string(value)?);
        }
    }
    if data.is_empty() {
        bail!(
            "0 services for update, select one of: {:?}",
            doc.keys().collect::<Vec<_>>()
        );
    }

    let client = Client::try_default().await?;
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data.clone()),
        ..Default::default()
    };
    if api.get_opt(name).await?.is_some() {
        info!("patching {:?}", data.keys().collect::<Vec<_>>());
        api.patch(name, &PatchParams::default(), &Patch::Merge(&cm))
            .await?;
    } else {
        info!("creating {:?}", data.keys().collect::<Vec<_>>());
        api.create(&PostParams::default(), &cm).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    match &cli.command {
        Command::Validate { service } => validate(store(&cli.config).await?, service).await,
        Command::PrepareNetwork { service } => {
            prepare_network(store(&cli.config).await?, service).await
        }
        Command::PrepareUsers {
            service,
            create_replication_user,
        } => {
            warn!("ensure your kube context points at the source cluster");
            prepare_users(store(&cli.config).await?, service, *create_replication_user).await
        }
        Command::UpdateConfigMap {
            location,
            name,
            namespace,
            service,
        } => update_config_map(location, name, namespace, service.as_deref()).await,
    }
}
