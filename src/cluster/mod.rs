pub mod sql;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use log::{info, warn};
use serde_json::{json, Value};

use crate::Result;

pub use sql::{PgConn, SqlExec};

pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

/// Connection fields written into a database secret. All values land opaque
/// base64 on the wire; a derived `jdbc_url` is always included.
#[derive(Debug, Clone)]
pub struct SecretSpec {
    pub username: String,
    pub password: String,
    pub dbname: String,
    pub host: String,
    pub port: String,
}

#[derive(Debug, Clone, Default)]
pub struct PodsStatus {
    pub restarts: i64,
    pub states: BTreeSet<String>,
    pub pods: Vec<Value>,
}

/// Cluster adapter: secrets, workload restarts, health checks and the SQL
/// capability set behind whichever transport was chosen at bootstrap.
pub struct ClusterCtl {
    client: Client,
    sql: Arc<dyn SqlExec>,
}

impl ClusterCtl {
    pub fn new(client: Client, sql: Arc<dyn SqlExec>) -> Self {
        Self { client, sql }
    }

    pub fn sql(&self) -> &dyn SqlExec {
        self.sql.as_ref()
    }

    fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(ae) if ae.code == 404)
    }

    /// Upsert a database secret. When the secret already holds a password,
    /// that value is carried over into `old-password` so consumers can finish
    /// in-flight work during rotation.
    pub async fn create_secret(&self, name: &str, namespace: &str, spec: &SecretSpec) -> Result<()> {
        info!("creating secret \"{namespace}/{name}\"");
        let secret_api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let old_password = match secret_api.get_opt(name).await? {
            Some(existing) => existing
                .data
                .as_ref()
                .and_then(|data| data.get("password"))
                .and_then(|b| String::from_utf8(b.0.clone()).ok()),
            None => None,
        };

        let jdbc_url = format!(
            "jdbc:postgresql://{}:{}/{}",
            spec.host, spec.port, spec.dbname
        );
        let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
        data.insert("username".to_string(), b64_field(&spec.username));
        data.insert("password".to_string(), b64_field(&spec.password));
        data.insert("dbname".to_string(), b64_field(&spec.dbname));
        data.insert("host".to_string(), b64_field(&spec.host));
        data.insert("port".to_string(), b64_field(&spec.port));
        data.insert("jdbc_url".to_string(), b64_field(&jdbc_url));
        if let Some(old_password) = old_password {
            data.insert("old-password".to_string(), b64_field(&old_password));
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        let params = PatchParams::apply("migrator").force();
        secret_api.patch(name, &params, &Patch::Apply(&secret)).await?;
        Ok(())
    }

    /// Roll a workload by stamping the pod template's restartedAt annotation.
    /// Tries a Deployment first, then a StatefulSet; a workload that exists
    /// under neither kind is logged and skipped.
    pub async fn restart_workload(&self, name: &str, namespace: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let body = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { RESTARTED_AT: now }
                    }
                }
            }
        });
        let params = PatchParams::default();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match deployments.patch(name, &params, &Patch::Merge(&body)).await {
            Ok(_) => return Ok(()),
            Err(e) if Self::is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match statefulsets.patch(name, &params, &Patch::Merge(&body)).await {
            Ok(_) => return Ok(()),
            Err(e) if Self::is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        warn!("service '{namespace}/{name}' was not found, not restarting");
        Ok(())
    }

    /// A workload is considered present when a Deployment or StatefulSet with
    /// its name exists. Failures to reach the API read as unhealthy, not as
    /// errors, so preflight can report them.
    pub async fn check_app_healthy(&self, namespace: &str, app: &str) -> Result<(bool, String)> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match deployments.get_opt(app).await {
            Ok(Some(_)) => return Ok((true, String::new())),
            Ok(None) => {}
            Err(e) => {
                return Ok((
                    false,
                    format!("failed to call k8s api in namespace {namespace}: {e}"),
                ))
            }
        }
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match statefulsets.get_opt(app).await {
            Ok(Some(_)) => Ok((true, String::new())),
            Ok(None) => Ok((
                false,
                format!("statefulset or deployment {namespace}/{app} does not exist"),
            )),
            Err(e) => Ok((
                false,
                format!("failed to call k8s api in namespace {namespace}: {e}"),
            )),
        }
    }

    /// Restart counts and container-state set across an app's pods.
    pub async fn pods_status(&self, namespace: &str, app: &str) -> Result<PodsStatus> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let listing = pods
            .list(&ListParams::default().labels(&format!("app={app}")))
            .await?;

        let mut status = PodsStatus::default();
        for pod in listing.items {
            let container = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|cs| cs.first());
            let Some(container) = container else { continue };
            status.restarts += i64::from(container.restart_count);
            let state = container
                .state
                .as_ref()
                .and_then(|s| s.running.as_ref())
                .map(|_| "running")
                .unwrap_or("error");
            status.states.insert(state.to_string());
            status.pods.push(serde_json::to_value(container)?);
        }
        Ok(status)
    }

    pub async fn check_connection(&self, conn: &PgConn) -> Result<()> {
        sql::check_connection(self.sql.as_ref(), conn).await
    }

    pub async fn grant_access(&self, conn: &PgConn, grantee: &str) -> Result<()> {
        sql::grant_access(self.sql.as_ref(), conn, grantee).await
    }

    pub async fn set_owner_all_tables(&self, conn: &PgConn, grantee: &str) -> Result<()> {
        sql::set_owner_all_tables(self.sql.as_ref(), conn, grantee).await
    }

    pub async fn create_replication_user(
        &self,
        username: &str,
        password: Option<String>,
        conn: &PgConn,
    ) -> Result<String> {
        sql::create_replication_user(self.sql.as_ref(), username, password, conn).await
    }
}

#[async_trait::async_trait]
impl crate::migration::ClusterApi for ClusterCtl {
    async fn create_secret(&self, name: &str, namespace: &str, spec: &SecretSpec) -> Result<()> {
        ClusterCtl::create_secret(self, name, namespace, spec).await
    }

    async fn restart_workload(&self, name: &str, namespace: &str) -> Result<()> {
        ClusterCtl::restart_workload(self, name, namespace).await
    }

    async fn check_app_healthy(&self, namespace: &str, app: &str) -> Result<(bool, String)> {
        ClusterCtl::check_app_healthy(self, namespace, app).await
    }

    async fn pods_status(&self, namespace: &str, app: &str) -> Result<PodsStatus> {
        ClusterCtl::pods_status(self, namespace, app).await
    }

    async fn check_connection(&self, conn: &PgConn) -> Result<()> {
        ClusterCtl::check_connection(self, conn).await
    }

    async fn grant_access(&self, conn: &PgConn, grantee: &str) -> Result<()> {
        ClusterCtl::grant_access(self, conn, grantee).await
    }

    async fn set_owner_all_tables(&self, conn: &PgConn, grantee: &str) -> Result<()> {
        ClusterCtl::set_owner_all_tables(self, conn, grantee).await
    }

    async fn create_replication_user(
        &self,
        username: &str,
        password: Option<String>,
        conn: &PgConn,
    ) -> Result<String> {
        ClusterCtl::create_replication_user(self, username, password, conn).await
    }
}

fn b64_field(value: &str) -> ByteString {
    // ByteString carries raw bytes; the API server applies the base64 framing.
    ByteString(value.as_bytes().to_vec())
}
