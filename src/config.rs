use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use log::{debug, info, warn};
use serde_yaml::Value;
use tokio::sync::RwLock;

use crate::errors::MigratorError;
use crate::Result;

pub const DEFAULT_CONFIG_MAP: &str = "cloudsql-migration";
pub const DEFAULT_CONFIG_NAMESPACE: &str = "tmc-iam";

/// How many times a conflicting ConfigMap update is re-applied before giving up.
pub const SAVE_CONFLICT_LIMIT: u32 = 10;

const REQUIRED_FIELDS: &[&str] = &[
    "aws-host",
    "aws-instance",
    "aws-port",
    "readonly-secret-name",
    "readwrite-secret-name",
    "aws-replication-password",
    "aws-replication-username",
    "gcp-auto-storage-increase",
    "gcp-database-version",
    "gcp-disk-type",
    "gcp-instance-cpu",
    "gcp-instance-mem",
    "gcp-instance-region",
    "gcp-instance-storage",
    "gcp-migration-strategy",
    "gcp-project-name",
    "k8s-env",
    "k8s-namespace",
    "k8s-service",
];

const REMOTE_FIELDS: &[&str] = &["aws-readonly-password", "aws-readwrite-password"];

/// Per-service migration properties. Deliberately schema-lax: new fields are
/// added over the lifetime of a migration, so this is an open mapping with
/// typed accessors rather than a closed record.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub props: BTreeMap<String, Value>,
}

impl ServiceConfig {
    pub fn new(name: &str, props: BTreeMap<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            props,
        }
    }

    /// Property lookup with the read-time inference rules applied:
    /// `database-name` falls back to the middle dotted token of the
    /// readwrite secret name, `gcp-rootuser-secret-name` is derived by
    /// replacing `.rw` with `.root`, `aws-master-username` defaults to
    /// `pgadmin`, and placeholder replication passwords read as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "database-name" => self.raw(key).or_else(|| {
                self.raw_str("readwrite-secret-name")
                    .and_then(|s| s.split('.').nth(1).map(|t| Value::from(t.to_string())))
            }),
            "gcp-rootuser-secret-name" => self.raw(key).or_else(|| {
                self.raw_str("readwrite-secret-name")
                    .map(|s| Value::from(s.replace(".rw", ".root")))
            }),
            "aws-master-username" => self
                .raw(key)
                .or_else(|| Some(Value::from("pgadmin".to_string()))),
            "aws-replication-password" => self
                .raw(key)
                .filter(|v| !matches!(v, Value::String(s) if s == "?" || s.is_empty())),
            _ => self.raw(key),
        }
    }

    fn raw(&self, key: &str) -> Option<Value> {
        self.props.get(key).filter(|v| !v.is_null()).cloned()
    }

    fn raw_str(&self, key: &str) -> Option<String> {
        self.raw(key).and_then(|v| value_to_string(&v))
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| value_to_string(&v))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Required string property; missing fields are reported the same way
    /// `validate` phrases them.
    pub fn require(&self, key: &str) -> Result<String> {
        self.get_str(key).ok_or_else(|| {
            MigratorError::Invalid(format!(
                "missing configuration field \"{}\" in config \"{}\"",
                key, self.name
            ))
        })
    }

    pub fn require_port(&self, key: &str) -> Result<u16> {
        self.get_i64(key)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                MigratorError::Invalid(format!(
                    "\"{}\" is not a valid port in config \"{}\"",
                    key, self.name
                ))
            })
    }

    /// Static validation. Returns human-readable errors; an empty list means
    /// the config is complete enough to migrate.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for field in REQUIRED_FIELDS {
            if !self.props.contains_key(*field) || self.props[*field].is_null() {
                errors.push(format!(
                    "missing configuration field \"{}\" in config \"{}\"",
                    field, self.name
                ));
            }
        }

        if self.raw_str("gcp-migration-strategy").as_deref() == Some("remote") {
            for field in REMOTE_FIELDS {
                if !self.props.contains_key(*field) || self.props[*field].is_null() {
                    errors.push(format!(
                        "missing configuration field \"{}\" in config \"{}\"",
                        field, self.name
                    ));
                }
            }
        }

        if !self.props.contains_key("database-name")
            && self
                .raw_str("readwrite-secret-name")
                .unwrap_or_default()
                .split('.')
                .count()
                != 3
        {
            errors.push(format!(
                "missing configuration field \"database-name\" in config \"{}\"",
                self.name
            ));
        }

        let cpu = self.get_i64("gcp-instance-cpu");
        let mem = self.get_i64("gcp-instance-mem");
        if let Some(cpu) = cpu {
            if !(1..=96).contains(&cpu) {
                errors.push(format!(
                    "{}: gcp-cpu is not a valid value: {} must be between 1 and 96",
                    self.name, cpu
                ));
            } else if cpu % 2 == 1 && cpu > 1 {
                errors.push(format!(
                    "{}: gcp-cpu is not a valid value: {} must be either 1 or an even number",
                    self.name, cpu
                ));
            }
        }
        if let Some(mem) = mem {
            if mem % 256 > 0 {
                errors.push(format!(
                    "{}: gcp-mem is not a valid value: {} must be a multiple of 256 MB",
                    self.name, mem
                ));
            } else if mem < 3840 {
                errors.push(format!(
                    "{}: gcp-mem is not a valid value: {} must be at least 3.75 GB (3840 MB)",
                    self.name, mem
                ));
            } else if let Some(cpu) = cpu {
                let min_mem = 0.9 * 1024.0 * cpu as f64;
                let max_mem = 6.5 * 1024.0 * cpu as f64;
                if (mem as f64) < min_mem || (mem as f64) > max_mem {
                    errors.push(format!(
                        "{}: gcp-mem is not a valid value: {} must be 0.9 to 6.5 GB per vCPU",
                        self.name, mem
                    ));
                }
            }
        }
        errors
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Persistent, versioned store of per-service migration configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn keys(&self) -> Result<Vec<String>>;

    async fn get(&self, service: &str) -> Result<ServiceConfig>;

    /// Merge `patch` into the service's properties and persist. The merge is
    /// atomic per save; version conflicts in the backing store are retried.
    async fn save(&self, service: &str, patch: &BTreeMap<String, Value>) -> Result<()>;

    async fn validate(&self, service: &str) -> Result<Vec<String>> {
        Ok(self.get(service).await?.validate())
    }
}

/// YAML-file-backed store: a single document mapping service name to its
/// property map. Expects single-writer process discipline.
pub struct FileStore {
    path: PathBuf,
    services: RwLock<BTreeMap<String, ServiceConfig>>,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let services = Self::load(&path).await?;
        Ok(Self {
            path,
            services: RwLock::new(services),
        })
    }

    async fn load(path: &PathBuf) -> Result<BTreeMap<String, ServiceConfig>> {
        let raw = tokio::fs::read_to_string(path).await?;
        let doc: BTreeMap<String, BTreeMap<String, Value>> = serde_yaml::from_str(&raw)?;
        Ok(doc
            .into_iter()
            .map(|(name, props)| (name.clone(), ServiceConfig::new(&name, props)))
            .collect())
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.services.read().await.keys().cloned().collect())
    }

    async fn get(&self, service: &str) -> Result<ServiceConfig> {
        self.services
            .read()
            .await
            .get(service)
            .cloned()
            .ok_or_else(|| MigratorError::NotFound(format!("service config {service}")))
    }

    async fn save(&self, service: &str, patch: &BTreeMap<String, Value>) -> Result<()> {
        // Reload from disk so a save never clobbers fields written since load.
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut doc: BTreeMap<String, BTreeMap<String, Value>> = serde_yaml::from_str(&raw)?;
        let props = doc
            .get_mut(service)
            .ok_or_else(|| MigratorError::NotFound(format!("service config {service}")))?;
        for (k, v) in patch {
            props.insert(k.clone(), v.clone());
        }
        tokio::fs::write(&self.path, serde_yaml::to_string(&doc)?).await?;
        *self.services.write().await = Self::load(&self.path).await?;
        Ok(())
    }
}

/// ConfigMap-backed store: one ConfigMap whose data maps each service name to
/// a YAML property document. Writes go through a conditional replace keyed on
/// `resourceVersion`, retried on conflict.
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, name: &str, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    pub fn from_env(client: Client) -> Self {
        let name =
            std::env::var("CONFIG_MAP_NAME").unwrap_or_else(|_| DEFAULT_CONFIG_MAP.to_string());
        let namespace = std::env::var("CONFIG_MAP_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_CONFIG_NAMESPACE.to_string());
        Self::new(client, &name, &namespace)
    }

    async fn load(&self) -> Result<(ConfigMap, BTreeMap<String, ServiceConfig>)> {
        let cm = self.api.get(&self.name).await?;
        let mut services = BTreeMap::new();
        for (name, raw) in cm.data.clone().unwrap_or_default() {
            let props: BTreeMap<String, Value> = serde_yaml::from_str(&raw)?;
            services.insert(name.clone(), ServiceConfig::new(&name, props));
        }
        Ok((cm, services))
    }
}

#[async_trait]
impl ConfigStore for ConfigMapStore {
    async fn keys(&self) -> Result<Vec<String>> {
        let (_, services) = self.load().await?;
        Ok(services.keys().cloned().collect())
    }

    async fn get(&self, service: &str) -> Result<ServiceConfig> {
        let (_, services) = self.load().await?;
        services
            .get(service)
            .cloned()
            .ok_or_else(|| MigratorError::NotFound(format!("service config {service}")))
    }

    async fn save(&self, service: &str, patch: &BTreeMap<String, Value>) -> Result<()> {
        info!(
            "updating config properties: {}::{:?}",
            service,
            patch.keys().collect::<Vec<_>>()
        );
        with_conflict_retry(SAVE_CONFLICT_LIMIT, || async {
            // Re-read so the merge applies on top of the latest revision; the
            // conditional replace below catches anything we still raced with.
            let (mut cm, services) = self.load().await?;
            let mut props = services
                .get(service)
                .ok_or_else(|| MigratorError::NotFound(format!("service config {service}")))?
                .props
                .clone();
            for (k, v) in patch {
                props.insert(k.clone(), v.clone());
            }
            let mut data = cm.data.take().unwrap_or_default();
            data.insert(service.to_string(), serde_yaml::to_string(&props)?);
            cm.data = Some(data);
            self.api
                .replace(&self.name, &PostParams::default(), &cm)
                .await?;
            Ok(())
        })
        .await
    }
}

/// Run `attempt` until it succeeds or fails with something other than an
/// optimistic-concurrency conflict, up to `limit` tries.
pub async fn with_conflict_retry<T, F, Fut>(limit: u32, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    for n in 0..limit {
        match attempt().await {
            Err(MigratorError::KubeError(kube::Error::Api(ae))) if ae.code == 409 => {
                debug!("conflict on attempt {}, retrying", n + 1);
            }
            other => return other,
        }
    }
    warn!("conflict retry limit ({limit}) exhausted");
    Err(MigratorError::Conflict(limit))
}
