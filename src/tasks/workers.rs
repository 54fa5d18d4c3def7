use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use super::{TaskFn, TaskFuture, TaskLog, TaskOutcome};
use crate::cluster::sql::DirectSql;
use crate::cluster::ClusterCtl;
use crate::config::ConfigMapStore;
use crate::errors::MigratorError;
use crate::gcp::GcpApi;
use crate::migration::Migration;
use crate::Result;

/// The task kinds the control plane exposes. `dummy` stays registered as a
/// health-test worker that touches nothing remote.
pub fn registry() -> Vec<(String, TaskFn)> {
    vec![
        wrap("preflight", preflight),
        wrap("sync", sync),
        wrap("cutover", cutover),
        wrap("cleanup", cleanup),
        wrap("dummy", dummy),
    ]
}

fn wrap<F, Fut>(name: &str, f: F) -> (String, TaskFn)
where
    F: Fn(TaskLog, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<TaskOutcome>> + Send + 'static,
{
    let task_fn: TaskFn = Arc::new(move |log, arg| -> TaskFuture { Box::pin(f(log, arg)) });
    (name.to_string(), task_fn)
}

/// Fresh collaborators for one worker run. Each task builds its own clients so
/// a failure in one never bleeds into another.
async fn migration(log: &TaskLog) -> Result<Migration> {
    let client = Client::try_default().await?;
    let config = Arc::new(ConfigMapStore::from_env(client.clone()));
    let cloud = Arc::new(GcpApi::new().await?);
    let cluster = Arc::new(ClusterCtl::new(client, Arc::new(DirectSql)));
    Ok(Migration::new(config, cloud, cluster, log.clone()))
}

async fn preflight(log: TaskLog, service: String) -> Result<TaskOutcome> {
    let commands = migration(&log).await?;
    let status = commands.preflight(&service).await?;
    let ok = status["pass"].as_bool().unwrap_or(false);
    Ok(TaskOutcome {
        ok,
        value: Some(status),
    })
}

async fn sync(log: TaskLog, service: String) -> Result<TaskOutcome> {
    let commands = migration(&log).await?;
    commands.sync(&service).await?;
    Ok(TaskOutcome::ok())
}

async fn cutover(log: TaskLog, service: String) -> Result<TaskOutcome> {
    let commands = migration(&log).await?;
    commands.cutover(&service).await?;
    Ok(TaskOutcome::ok())
}

async fn cleanup(log: TaskLog, service: String) -> Result<TaskOutcome> {
    let commands = migration(&log).await?;
    commands.cleanup(&service).await?;
    Ok(TaskOutcome::ok())
}

/// Emits one log line per second for `arg` seconds. Useful for exercising the
/// task surface without touching any cloud.
async fn dummy(log: TaskLog, arg: String) -> Result<TaskOutcome> {
    let n: i64 = arg
        .parse()
        .map_err(|_| MigratorError::Invalid(format!("not a number: {arg}")))?;
    if n < 1 {
        return Err(MigratorError::Invalid(format!(
            "values less than 1 are not supported: {n}"
        )));
    }
    log.info(format!("begin {n} for {n} iterations"));
    for i in 0..n {
        log.info(format!("{i}"));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    log.info(format!("end {n}"));
    Ok(TaskOutcome::ok())
}
