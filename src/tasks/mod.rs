pub mod workers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use log::Level;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::errors::MigratorError;
use crate::Result;

/// One structured entry in a task's log stream.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub ts: String,
    pub level: String,
    pub text: String,
}

/// Per-task logging handle. Lines go to the task's channel for the HTTP
/// surface and are mirrored to the process logger.
#[derive(Clone)]
pub struct TaskLog {
    name: String,
    tx: UnboundedSender<LogLine>,
}

impl TaskLog {
    pub fn channel(name: &str) -> (Self, UnboundedReceiver<LogLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.to_string(),
                tx,
            },
            rx,
        )
    }

    fn log(&self, level: Level, text: impl Into<String>) {
        let text = text.into();
        log::log!(level, "{}:: {}", self.name, text);
        // receiver may be gone when the task was deleted mid-flight
        let _ = self.tx.send(LogLine {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level: level.to_string(),
            text,
        });
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.log(Level::Debug, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(Level::Info, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.log(Level::Warn, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(Level::Error, text);
    }
}

/// What a worker hands back when it finishes on its own terms.
#[derive(Debug, Default)]
pub struct TaskOutcome {
    pub ok: bool,
    pub value: Option<Value>,
}

impl TaskOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            value: None,
        }
    }
}

/// Shared slot the worker writes its outcome into. `finished` stays false when
/// the worker panicked or was aborted, which reads as not-ok.
#[derive(Default)]
struct OutcomeCell {
    finished: AtomicBool,
    ok: AtomicBool,
    value: Mutex<Option<Value>>,
}

impl OutcomeCell {
    fn set(&self, ok: bool, value: Option<Value>) {
        *self.value.lock().expect("outcome lock poisoned") = value;
        self.ok.store(ok, Ordering::SeqCst);
        self.finished.store(true, Ordering::SeqCst);
    }
}

pub type TaskFuture = BoxFuture<'static, Result<TaskOutcome>>;
pub type TaskFn = Arc<dyn Fn(TaskLog, String) -> TaskFuture + Send + Sync>;

struct TaskEntry {
    create_time: String,
    handle: JoinHandle<()>,
    rx: Mutex<UnboundedReceiver<LogLine>>,
    history: Mutex<Vec<LogLine>>,
    outcome: Arc<OutcomeCell>,
}

impl TaskEntry {
    /// Pull everything the worker has logged so far into the retained history.
    fn drain(&self) {
        let mut rx = self.rx.lock().expect("task log receiver lock poisoned");
        let mut history = self.history.lock().expect("task history lock poisoned");
        while let Ok(line) = rx.try_recv() {
            history.push(line);
        }
    }
}

/// Snapshot of one task, as reported over HTTP. The id rides along only in
/// listings; a task fetched by id reports just its state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub state: &'static str,
    #[serde(rename = "createTime")]
    pub create_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<LogLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// In-process registry of running and finished workers, keyed by
/// `{kind}/{service}`. Workers are spawned tasks: isolated from each other,
/// forcibly cancellable, reporting only through their log channel and outcome
/// slot.
pub struct TaskManager {
    kinds: Vec<(String, TaskFn)>,
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskManager {
    pub fn new(kinds: Vec<(String, TaskFn)>) -> Self {
        Self {
            kinds,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn kinds(&self) -> Vec<String> {
        self.kinds.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Start a worker for `{kind}/{arg}`. An existing id, running or not, must
    /// be deleted first.
    pub async fn create(&self, kind: &str, arg: &str) -> Result<String> {
        let task_fn = self
            .kinds
            .iter()
            .find(|(name, _)| name == kind)
            .map(|(_, f)| Arc::clone(f))
            .ok_or_else(|| MigratorError::NotFound(format!("task kind {kind}")))?;

        let id = format!("{kind}/{arg}");
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(MigratorError::TaskExists(id));
        }

        let (log, rx) = TaskLog::channel(&id);
        let outcome = Arc::new(OutcomeCell::default());
        let worker = task_fn(log.clone(), arg.to_string());
        let handle = tokio::spawn({
            let outcome = Arc::clone(&outcome);
            async move {
                match worker.await {
                    Ok(result) => {
                        outcome.set(result.ok, result.value);
                        log.info("task completed normally");
                    }
                    Err(e) => {
                        log.error(format!("{e:?}"));
                        log.error(format!("task terminated with error: {e}"));
                        outcome.set(false, None);
                    }
                }
            }
        });

        tasks.insert(
            id.clone(),
            TaskEntry {
                create_time: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                handle,
                rx: Mutex::new(rx),
                history: Mutex::new(Vec::new()),
                outcome,
            },
        );
        Ok(id)
    }

    fn view(id: &str, entry: &TaskEntry, include_messages: bool) -> TaskView {
        entry.drain();
        let running = !entry.handle.is_finished();
        let mut view = TaskView {
            id: id.to_string(),
            state: if running { "running" } else { "complete" },
            create_time: entry.create_time.clone(),
            messages: include_messages.then(|| {
                entry
                    .history
                    .lock()
                    .expect("task history lock poisoned")
                    .clone()
            }),
            ok: None,
            value: None,
        };
        if !running {
            // a worker that never reported (panic, abort) completes not-ok
            let finished = entry.outcome.finished.load(Ordering::SeqCst);
            view.ok = Some(finished && entry.outcome.ok.load(Ordering::SeqCst));
            view.value = entry
                .outcome
                .value
                .lock()
                .expect("outcome lock poisoned")
                .clone();
        }
        view
    }

    pub async fn get(&self, kind: &str, arg: &str) -> Option<TaskView> {
        let id = format!("{kind}/{arg}");
        let tasks = self.tasks.read().await;
        tasks.get(&id).map(|entry| {
            let mut view = Self::view(&id, entry, true);
            view.id = String::new();
            view
        })
    }

    /// All tasks, optionally narrowed to a kind. Completed tasks are filtered
    /// out unless asked for.
    pub async fn list(&self, kind: Option<&str>, include_completed: bool) -> Vec<TaskView> {
        let tasks = self.tasks.read().await;
        let mut views: Vec<TaskView> = tasks
            .iter()
            .filter(|(id, _)| match kind {
                Some(kind) => id.starts_with(&format!("{kind}/")),
                None => true,
            })
            .map(|(id, entry)| Self::view(id, entry, false))
            .filter(|view| include_completed || view.state != "complete")
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Remove a task, killing its worker when still running. Returns what
    /// happened, or `None` when the id is unknown.
    pub async fn delete(&self, kind: &str, arg: &str) -> Option<&'static str> {
        let id = format!("{kind}/{arg}");
        let mut tasks = self.tasks.write().await;
        let entry = tasks.remove(&id)?;
        if entry.handle.is_finished() {
            Some("deleted")
        } else {
            entry.handle.abort();
            Some("killed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleepy_registry() -> Vec<(String, TaskFn)> {
        vec![
            (
                "nap".to_string(),
                Arc::new(|log: TaskLog, arg: String| -> TaskFuture {
                    Box::pin(async move {
                        let secs: u64 = arg.parse().unwrap_or(1);
                        log.info("napping");
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                        Ok(TaskOutcome {
                            ok: true,
                            value: Some(serde_json::json!({"slept": secs})),
                        })
                    })
                }),
            ),
            (
                "fail".to_string(),
                Arc::new(|_log: TaskLog, _arg: String| -> TaskFuture {
                    Box::pin(async move {
                        Err(MigratorError::Invalid("doomed from the start".to_string()))
                    })
                }),
            ),
            (
                "panic".to_string(),
                Arc::new(|_log: TaskLog, _arg: String| -> TaskFuture {
                    Box::pin(async move { panic!("worker blew up") })
                }),
            ),
        ]
    }

    #[tokio::test]
    async fn create_is_unique_per_id() {
        let manager = TaskManager::new(sleepy_registry());
        let id = manager.create("nap", "2").await.unwrap();
        assert_eq!(id, "nap/2");
        assert!(matches!(
            manager.create("nap", "2").await,
            Err(MigratorError::TaskExists(_))
        ));
        // a different arg is a different task
        manager.create("nap", "3").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_kind_is_not_found() {
        let manager = TaskManager::new(sleepy_registry());
        assert!(matches!(
            manager.create("bogus", "x").await,
            Err(MigratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn worker_error_completes_not_ok() {
        let manager = TaskManager::new(sleepy_registry());
        manager.create("fail", "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let view = manager.get("fail", "x").await.unwrap();
        assert_eq!(view.state, "complete");
        assert_eq!(view.ok, Some(false));
        let messages = view.messages.unwrap();
        assert!(messages
            .iter()
            .any(|m| m.text.contains("task terminated with error")));
    }

    #[tokio::test]
    async fn worker_panic_completes_not_ok() {
        let manager = TaskManager::new(sleepy_registry());
        manager.create("panic", "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let view = manager.get("panic", "x").await.unwrap();
        assert_eq!(view.state, "complete");
        assert_eq!(view.ok, Some(false));
    }

    #[tokio::test]
    async fn delete_kills_running_and_removes() {
        let manager = TaskManager::new(sleepy_registry());
        manager.create("nap", "30").await.unwrap();
        assert_eq!(manager.delete("nap", "30").await, Some("killed"));
        assert!(manager.get("nap", "30").await.is_none());
        assert_eq!(manager.delete("nap", "30").await, None);
        // recreation after delete works
        manager.create("nap", "30").await.unwrap();
    }

    #[tokio::test]
    async fn list_hides_completed_by_default() {
        let manager = TaskManager::new(sleepy_registry());
        manager.create("fail", "x").await.unwrap();
        manager.create("nap", "30").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let running = manager.list(None, false).await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "nap/30");
        // list views never carry messages
        assert!(running[0].messages.is_none());

        let all = manager.list(None, true).await;
        assert_eq!(all.len(), 2);

        let by_kind = manager.list(Some("fail"), true).await;
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].id, "fail/x");
        assert_eq!(by_kind[0].ok, Some(false));
    }
}
