//! Host-side console and result log.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::relay::{RelayEvent, RelayEventKind, RelaySink, ViolationReport};
use crate::session::{RunSession, SessionId};

/// One logged event with the session that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedEvent {
    /// Emitting session.
    pub session_id: SessionId,
    /// The event.
    #[serde(flatten)]
    pub event: RelayEvent,
}

/// Append-only log of every event delivered to it, in arrival order.
#[derive(Debug, Default)]
pub struct ConsoleAggregator {
    entries: Mutex<Vec<AggregatedEvent>>,
}

impl ConsoleAggregator {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry so far.
    pub fn entries(&self) -> Vec<AggregatedEvent> {
        self.lock().clone()
    }

    /// Events of one session, in order.
    pub fn for_session(&self, session: SessionId) -> Vec<RelayEvent> {
        self.lock()
            .iter()
            .filter(|entry| entry.session_id == session)
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Logs a violation raised by a host-side proctoring collaborator.
    pub fn record_violation(&self, session: SessionId, violation: ViolationReport) {
        self.deliver(
            session,
            RelayEvent::now(RelayEventKind::Violation {
                violation_type: violation.kind,
                severity: violation.severity,
                description: violation.description,
            }),
        );
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AggregatedEvent>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RelaySink for ConsoleAggregator {
    fn deliver(&self, session: SessionId, event: RelayEvent) {
        self.lock().push(AggregatedEvent {
            session_id: session,
            event,
        });
    }

    fn session_finished(&self, session: &RunSession) {
        tracing::trace!(session_id = %session.id(), status = %session.status(), "session finished");
    }
}
