//! Core types shared by the daemon and the CLI.
//!
//! A run is the only persistent entity: one row per run, one status at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for runs.
/// Uses random `UUIDv4` (122 random bits) so ids never collide across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A status string outside the closed set of run states.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status '{0}', expected one of: pending, running, completed, failed")]
pub struct InvalidStatus(pub String);

/// Run lifecycle status.
///
/// ```text
/// pending --> running --> completed
///                    \--> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 4] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    /// States from which `next` may be entered.
    pub fn predecessors(next: RunStatus) -> Vec<RunStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

/// A single run of a bioinformatics tool over a set of input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    /// Creation time, set once.
    pub timestamp: DateTime<Utc>,
    /// Input file paths in execution order.
    pub input_files: Vec<String>,
    /// Output directory; empty until the run directory exists.
    pub output_path: String,
    pub status: RunStatus,
    /// External tool invoked once per input file (e.g. `fastqc`).
    pub tool: String,
    pub updated_at: DateTime<Utc>,
    /// Input file whose step failed.
    pub failed_step: Option<String>,
    /// Failure reason for `failed` runs.
    pub error: Option<String>,
}

/// Failure details recorded alongside a `failed` status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunFailure {
    pub failed_step: Option<String>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn id_is_a_v4_uuid() {
        let id = Id::new();
        let parsed = Uuid::parse_str(id.as_ref()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn run_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn run_status_rejects_unknown_on_deserialize() {
        assert!(serde_json::from_str::<RunStatus>("\"paused\"").is_err());
    }

    #[test]
    fn run_status_parses_known_values() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn run_status_parse_rejects_bogus() {
        let err = "bogus".parse::<RunStatus>().unwrap_err();
        assert_eq!(err, InvalidStatus("bogus".to_string()));
        assert!("PENDING".parse::<RunStatus>().is_err());
    }

    #[test]
    fn state_machine_edges() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));

        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [RunStatus::Completed, RunStatus::Failed] {
            assert!(terminal.is_terminal());
            for next in RunStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn predecessors_match_edges() {
        assert_eq!(
            RunStatus::predecessors(RunStatus::Running),
            vec![RunStatus::Pending]
        );
        assert_eq!(
            RunStatus::predecessors(RunStatus::Failed),
            vec![RunStatus::Running]
        );
        assert!(RunStatus::predecessors(RunStatus::Pending).is_empty());
    }
}
