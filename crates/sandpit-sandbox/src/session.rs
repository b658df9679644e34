//! Run sessions and their lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bundle::ExecutionMode;

/// Unique identifier of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Created, document not yet ready.
    Pending,
    /// The document signalled readiness.
    Running,
    /// Finished normally.
    Completed,
    /// The deadline elapsed first.
    TimedOut,
    /// Build, launch or runtime failure.
    Errored,
}

impl SessionStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Errored)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed-out",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of one bundle in one context.
///
/// Status moves `pending -> running -> terminal`, or straight from pending to
/// a terminal status. A terminal status never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSession {
    id: SessionId,
    created_at: DateTime<Utc>,
    mode: ExecutionMode,
    status: SessionStatus,
}

impl RunSession {
    /// A pending session for a bundle in `mode`.
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            id: SessionId::new(),
            created_at: Utc::now(),
            mode,
            status: SessionStatus::Pending,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Records the readiness signal. Only valid while pending.
    pub fn mark_running(&mut self) -> bool {
        if self.status != SessionStatus::Pending {
            return false;
        }
        self.status = SessionStatus::Running;
        true
    }

    /// Moves to `terminal`. Returns `false`, leaving the status as is, when
    /// the session already finished or `terminal` is not a final status.
    pub fn finish(&mut self, terminal: SessionStatus) -> bool {
        if self.status.is_terminal() || !terminal.is_terminal() {
            return false;
        }
        tracing::debug!(
            session_id = %self.id,
            from = %self.status,
            to = %terminal,
            "session finished"
        );
        self.status = terminal;
        true
    }
}
