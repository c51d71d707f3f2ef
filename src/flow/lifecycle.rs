use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Run state of a flow. Orthogonal to the phase a flow is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    #[default]
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled flows never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether a phase may be advanced from this state.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Initialized | Self::Running)
    }

    /// Check whether `self -> next` is a legal lifecycle transition.
    ///
    /// `Running -> Running` is allowed so a phase commit can keep a flow
    /// running; every other self-transition is rejected.
    pub fn can_transition_to(&self, next: LifecycleStatus) -> bool {
        use LifecycleStatus::*;
        match (self, next) {
            (Initialized, Running | Paused | Completed | Failed | Cancelled) => true,
            (Running, Running | Paused | Completed | Failed | Cancelled) => true,
            (Paused, Running | Failed | Cancelled) => true,
            (Failed, Running | Cancelled) => true,
            _ => false,
        }
    }

    /// Lifecycle a phase commit actually writes, given what is stored now and
    /// what the engine computed before the handler returned.
    ///
    /// A cancel or pause requested while the handler ran wins over `Running`;
    /// cancellation also wins over completion and failure. A flow another run
    /// failed stays failed: only `recover` brings it back to `Running`.
    pub fn resolve_commit(current: LifecycleStatus, desired: LifecycleStatus) -> LifecycleStatus {
        match (current, desired) {
            (Self::Cancelled, _) => Self::Cancelled,
            (Self::Completed, _) => Self::Completed,
            (Self::Failed, _) => Self::Failed,
            (Self::Paused, Self::Running) => Self::Paused,
            (_, desired) => desired,
        }
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid lifecycle status: {}", s)),
        }
    }
}
