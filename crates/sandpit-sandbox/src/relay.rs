//! Relay channel between an isolated context and its host.
//!
//! Documents post JSON messages tagged with `type`. The context side delivers
//! them only when the posted target origin would reach the host; the host side
//! validates each message on receipt and drops anything malformed. Delivery is
//! at-most-once and preserves emission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::session::{RunSession, SessionId};
use crate::verdict::deserialize_some;

/// Console method that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// `console.log`
    Log,
    /// `console.warn`
    Warn,
    /// `console.error`, uncaught errors and unhandled rejections
    Error,
}

/// A proctoring violation as reported from inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationReport {
    /// Violation type, e.g. `tab-switch`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Severity label.
    pub severity: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// A validated message received from a document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Console output.
    Console {
        /// Console method.
        level: ConsoleLevel,
        /// Serialized arguments, space separated.
        message: String,
        /// Milliseconds since the epoch at emission.
        #[serde(default)]
        timestamp: Option<f64>,
    },
    /// Outcome of one `runTest` call.
    TestResult {
        /// Whether `executeTest` returned without throwing.
        success: bool,
        /// Returned value.
        #[serde(default, deserialize_with = "deserialize_some")]
        result: Option<Value>,
        /// `false` when `executeTest` returned `undefined`.
        #[serde(default)]
        defined: Option<bool>,
        /// Thrown error message.
        #[serde(default)]
        error: Option<String>,
    },
    /// A proctoring violation.
    Violation {
        /// The report.
        violation: ViolationReport,
    },
    /// The document finished loading.
    Ready,
}

impl RelayMessage {
    /// Validates raw message data. Malformed messages yield `None`.
    pub fn parse(data: &str) -> Option<Self> {
        match serde_json::from_str::<RelayMessage>(data) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!(error = %e, len = data.len(), "dropping malformed relay message");
                None
            }
        }
    }

    /// The returned value of a successful test-result message.
    ///
    /// `None` means the function returned `undefined`.
    pub fn test_output(&self) -> Option<Value> {
        match self {
            Self::TestResult {
                result, defined, ..
            } => match defined {
                Some(false) => None,
                Some(true) => Some(result.clone().unwrap_or(Value::Null)),
                None => result.clone(),
            },
            _ => None,
        }
    }
}

/// Kind of a host-side relay event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RelayEventKind {
    /// `console.log` output.
    Log {
        /// Message text.
        message: String,
    },
    /// Errors, uncaught exceptions and build failures.
    Error {
        /// Message text.
        message: String,
    },
    /// `console.warn` output.
    Warning {
        /// Message text.
        message: String,
    },
    /// The verdict for one test case.
    TestResult {
        /// Test case the result belongs to, when known.
        test_case_id: Option<String>,
        /// Verdict.
        passed: bool,
        /// Value produced, `None` for undefined.
        actual_output: Option<Value>,
        /// Error text for failed cases.
        error_message: Option<String>,
    },
    /// A proctoring violation.
    Violation {
        /// Violation type.
        #[serde(rename = "type")]
        violation_type: String,
        /// Severity label.
        severity: String,
        /// Description.
        description: String,
    },
}

/// A timestamped event as seen by the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayEvent {
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: RelayEventKind,
}

impl RelayEvent {
    /// An event stamped with the current time.
    pub fn now(kind: RelayEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// An error event stamped with the current time.
    pub fn error(message: impl Into<String>) -> Self {
        Self::now(RelayEventKind::Error {
            message: message.into(),
        })
    }

    /// Converts a document message into a host event.
    ///
    /// `ready` is a lifecycle signal and has no event. Test results carry no
    /// verdict yet: `passed` mirrors `success` until the orchestrator grades it.
    pub fn from_message(raw: &RelayMessage) -> Option<Self> {
        let kind = match raw {
            RelayMessage::Console {
                level, message, timestamp,
            } => {
                let message = message.clone();
                let kind = match level {
                    ConsoleLevel::Log => RelayEventKind::Log { message },
                    ConsoleLevel::Warn => RelayEventKind::Warning { message },
                    ConsoleLevel::Error => RelayEventKind::Error { message },
                };
                let timestamp = timestamp
                    .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
                    .unwrap_or_else(Utc::now);
                return Some(Self { timestamp, kind });
            }
            RelayMessage::TestResult { success, error, .. } => RelayEventKind::TestResult {
                test_case_id: None,
                passed: *success,
                actual_output: raw.test_output(),
                error_message: error.clone(),
            },
            RelayMessage::Violation { violation } => RelayEventKind::Violation {
                violation_type: violation.kind.clone(),
                severity: violation.severity.clone(),
                description: violation.description.clone(),
            },
            RelayMessage::Ready => return None,
        };
        Some(Self::now(kind))
    }
}

/// Context-side end of a session's relay.
///
/// Stored in the context's op state; `postMessage` calls land in
/// [`RelayRoute::deliver`].
pub(crate) struct RelayRoute {
    host_origin: String,
    tx: mpsc::UnboundedSender<RelayMessage>,
    disposed: Arc<AtomicBool>,
}

impl RelayRoute {
    pub(crate) fn new(
        host_origin: impl Into<String>,
        disposed: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                host_origin: host_origin.into(),
                tx,
                disposed,
            },
            rx,
        )
    }

    /// Delivers `data` posted with `target_origin`.
    ///
    /// Returns `false` when the message was not delivered: the target would
    /// not reach the host, the payload is malformed, or the session is gone.
    pub(crate) fn deliver(&self, data: &str, target_origin: &str) -> bool {
        if target_origin != "*" && target_origin != self.host_origin {
            tracing::debug!(
                target_origin,
                host_origin = %self.host_origin,
                "relay message dropped: target origin does not match host"
            );
            return false;
        }
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        match RelayMessage::parse(data) {
            Some(message) => self.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Sends a message generated on the host side of the context.
    pub(crate) fn inject(&self, message: RelayMessage) {
        if !self.disposed.load(Ordering::SeqCst) && self.tx.send(message).is_err() {
            tracing::debug!("relay subscription already dropped");
        }
    }
}

/// Host-side end of a session's relay. One per session.
#[derive(Debug)]
pub struct RelaySubscription {
    rx: mpsc::UnboundedReceiver<RelayMessage>,
    disposed: Arc<AtomicBool>,
}

impl RelaySubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<RelayMessage>, disposed: Arc<AtomicBool>) -> Self {
        Self { rx, disposed }
    }

    /// Next message, or `None` once the context is disposed or gone.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        if self.is_detached() {
            return None;
        }
        let message = self.rx.recv().await?;
        if self.is_detached() {
            return None;
        }
        Some(message)
    }

    /// A message that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<RelayMessage> {
        if self.is_detached() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Whether the owning context has been disposed.
    pub fn is_detached(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Receives host events for display or grading.
pub trait RelaySink: Send + Sync {
    /// A session was created.
    fn session_started(&self, _session: &RunSession) {}

    /// An event was emitted by `session`.
    fn deliver(&self, session: SessionId, event: RelayEvent);

    /// A session reached a terminal status.
    fn session_finished(&self, _session: &RunSession) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_messages() {
        let console = RelayMessage::parse(
            r#"{"type":"console","level":"warn","message":"careful","timestamp":1700000000000}"#,
        )
        .unwrap();
        assert!(matches!(
            console,
            RelayMessage::Console { level: ConsoleLevel::Warn, .. }
        ));
        assert_eq!(RelayMessage::parse(r#"{"type":"ready"}"#), Some(RelayMessage::Ready));

        let violation = RelayMessage::parse(
            r#"{"type":"violation","violation":{"type":"tab-switch","severity":"high"}}"#,
        )
        .unwrap();
        let event = RelayEvent::from_message(&violation).unwrap();
        assert_eq!(
            event.kind,
            RelayEventKind::Violation {
                violation_type: "tab-switch".into(),
                severity: "high".into(),
                description: String::new(),
            }
        );
    }

    #[test]
    fn drops_malformed_messages() {
        for data in [
            "not json",
            "42",
            "[]",
            r#"{"message":"no type"}"#,
            r#"{"type":"telemetry","x":1}"#,
            r#"{"type":"console","level":"debug","message":"x"}"#,
            r#"{"type":"console","level":"log","message":7}"#,
            r#"{"type":"test-result","result":1}"#,
        ] {
            assert!(RelayMessage::parse(data).is_none(), "accepted {data}");
        }
    }

    #[test]
    fn distinguishes_null_from_undefined_results() {
        let null = RelayMessage::parse(r#"{"type":"test-result","success":true,"result":null,"defined":true}"#)
            .unwrap();
        assert_eq!(null.test_output(), Some(Value::Null));

        let undefined =
            RelayMessage::parse(r#"{"type":"test-result","success":true,"result":null,"defined":false}"#)
                .unwrap();
        assert_eq!(undefined.test_output(), None);

        let legacy = RelayMessage::parse(r#"{"type":"test-result","success":true,"result":[1,2]}"#)
            .unwrap();
        assert_eq!(legacy.test_output(), Some(json!([1, 2])));

        let absent = RelayMessage::parse(r#"{"type":"test-result","success":true}"#).unwrap();
        assert_eq!(absent.test_output(), None);
    }

    #[test]
    fn console_levels_map_to_event_kinds() {
        let msg = RelayMessage::parse(r#"{"type":"console","level":"error","message":"boom","timestamp":0}"#)
            .unwrap();
        let event = RelayEvent::from_message(&msg).unwrap();
        assert_eq!(event.kind, RelayEventKind::Error { message: "boom".into() });
        assert_eq!(event.timestamp.timestamp_millis(), 0);
        assert!(RelayEvent::from_message(&RelayMessage::Ready).is_none());
    }

    #[test]
    fn route_checks_target_origin() {
        let disposed = Arc::new(AtomicBool::new(false));
        let (route, mut rx) = RelayRoute::new("http://localhost:5173", disposed.clone());
        let msg = r#"{"type":"ready"}"#;

        assert!(route.deliver(msg, "*"));
        assert!(route.deliver(msg, "http://localhost:5173"));
        assert!(!route.deliver(msg, "null"));
        assert!(!route.deliver(msg, "https://evil.example"));
        assert!(!route.deliver("{}", "*"));
        assert_eq!(rx.try_recv().ok(), Some(RelayMessage::Ready));
        assert_eq!(rx.try_recv().ok(), Some(RelayMessage::Ready));
        assert!(rx.try_recv().is_err());

        disposed.store(true, Ordering::SeqCst);
        assert!(!route.deliver(msg, "*"));
    }

    #[tokio::test]
    async fn subscription_detaches_on_dispose() {
        let disposed = Arc::new(AtomicBool::new(false));
        let (route, rx) = RelayRoute::new("http://h", disposed.clone());
        let mut sub = RelaySubscription::new(rx, disposed.clone());

        route.inject(RelayMessage::Ready);
        assert_eq!(sub.recv().await, Some(RelayMessage::Ready));

        route.inject(RelayMessage::Ready);
        disposed.store(true, Ordering::SeqCst);
        assert!(sub.is_detached());
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = RelayEvent::now(RelayEventKind::TestResult {
            test_case_id: Some("t1".into()),
            passed: true,
            actual_output: Some(json!([0, 1])),
            error_message: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "test-result");
        assert_eq!(value["test_case_id"], "t1");
        assert!(value["timestamp"].is_string());
    }
}
