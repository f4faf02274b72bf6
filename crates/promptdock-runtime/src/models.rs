//! Runtime domain model.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use promptdock_sandbox::{Evaluator, LogBuffer};

/// Lifecycle state of a supervised runtime.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Initializing,
    Running,
    Rebuilding,
    Stopped,
    Error,
    Failed,
    Finished,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeState::Initializing => "initializing",
            RuntimeState::Running => "running",
            RuntimeState::Rebuilding => "rebuilding",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Error => "error",
            RuntimeState::Failed => "failed",
            RuntimeState::Finished => "finished",
        };
        f.write_str(s)
    }
}

impl RuntimeState {
    /// Terminal with respect to automated recovery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuntimeState::Stopped | RuntimeState::Failed)
    }
}

/// One supervised instance of a generated program.
///
/// The registry stores whole records; clones alias the live handles
/// (`evaluator`, `logs`, `cancel`) through `Arc`s, so a cloned snapshot can
/// still cancel or shut down the attempt it was taken from. The live handles
/// are never persisted.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub prompt: String,
    pub code: String,
    pub state: RuntimeState,
    #[serde(default)]
    pub last_error_msg: String,
    #[serde(default)]
    pub rebuild_count: u32,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub passed_health_check: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub evaluator: Option<Arc<dyn Evaluator>>,
    #[serde(skip)]
    pub logs: Option<LogBuffer>,
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl Runtime {
    pub fn new(id: String, prompt: String, code: String) -> Self {
        Self {
            id,
            title: String::new(),
            prompt,
            code,
            state: RuntimeState::Initializing,
            last_error_msg: String::new(),
            rebuild_count: 0,
            port: 0,
            passed_health_check: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            evaluator: None,
            logs: None,
            cancel: None,
        }
    }

    /// Strip the live handles, leaving the persistable view of the record.
    pub fn into_inert(mut self) -> Self {
        self.evaluator = None;
        self.logs = None;
        self.cancel = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RuntimeState::Initializing).unwrap(),
            "\"initializing\""
        );
        assert_eq!(
            serde_json::from_str::<RuntimeState>("\"failed\"").unwrap(),
            RuntimeState::Failed
        );
    }

    #[test]
    fn live_handles_are_not_serialized() {
        let mut runtime = Runtime::new("a".repeat(32), "prompt".into(), "code".into());
        runtime.logs = Some(LogBuffer::new());
        runtime.cancel = Some(CancellationToken::new());
        let json = serde_json::to_value(&runtime).unwrap();
        assert!(json.get("logs").is_none());
        assert!(json.get("cancel").is_none());
        assert!(json.get("evaluator").is_none());

        let back: Runtime = serde_json::from_value(json).unwrap();
        assert!(back.cancel.is_none());
        assert_eq!(back.state, RuntimeState::Initializing);
    }

    #[test]
    fn terminal_states() {
        assert!(RuntimeState::Stopped.is_terminal());
        assert!(RuntimeState::Failed.is_terminal());
        assert!(!RuntimeState::Error.is_terminal());
        assert!(!RuntimeState::Running.is_terminal());
    }
}
