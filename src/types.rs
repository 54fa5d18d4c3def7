use serde::{Deserialize, Serialize};

/// Lifecycle state of a Database Migration Service job.
/// <https://cloud.google.com/database-migration/docs/reference/rest/v1/projects.locations.migrationJobs>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    StateUnspecified,
    Maintenance,
    Draft,
    Creating,
    NotStarted,
    Running,
    Failed,
    Completed,
    Deleting,
    Stopping,
    Stopped,
    Deleted,
    Updating,
    Starting,
    Restarting,
    Resuming,
    #[serde(other)]
    Unknown,
}

/// Replication progress of a running migration job. The job only reports a
/// phase while its state is RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    PhaseUnspecified,
    FullDump,
    Cdc,
    PromoteInProgress,
    WaitingForSourceWritesToStop,
    PreparingTheDump,
    #[serde(other)]
    Unknown,
}

impl JobPhase {
    /// Total order used by phase awaits. PHASE_UNSPECIFIED sorts above
    /// everything so a job that stopped reporting a phase terminates the wait;
    /// unknown phases sort below FULL_DUMP so the wait keeps polling.
    pub fn rank(&self) -> i32 {
        match self {
            JobPhase::PhaseUnspecified => 1000,
            JobPhase::FullDump => 2,
            JobPhase::Cdc => 3,
            JobPhase::PromoteInProgress => 4,
            _ => -1,
        }
    }
}

/// Point-in-time description of a migration job, with the raw resource body
/// retained for callers that need the source/destination references.
#[derive(Debug, Clone)]
pub struct DmsJobStatus {
    pub state: JobState,
    pub phase: JobPhase,
    pub body: serde_json::Value,
}

impl DmsJobStatus {
    pub fn from_body(body: serde_json::Value) -> Self {
        let state = serde_json::from_value(body["state"].clone()).unwrap_or(JobState::Unknown);
        let phase =
            serde_json::from_value(body["phase"].clone()).unwrap_or(JobPhase::PhaseUnspecified);
        Self { state, phase, body }
    }
}
