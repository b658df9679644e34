//! Audit logging for graded submissions.
//!
//! Every [`TestRunner::run_tests`](crate::runner::TestRunner::run_tests) call
//! emits one [`AuditEntry`] containing:
//! - Run ID (UUID)
//! - SHA-256 hash of the submitted code, plus a bounded preview
//! - Question id and execution mode
//! - One outcome per test case (verdict, duration, failure kind)
//! - Total duration and the overall outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bundle::ExecutionMode;
use crate::question::TestResult;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// Prefix of the error recorded for a test case that hit its deadline.
pub(crate) const TIMEOUT_PREFIX: &str = "Test timeout after ";

/// [`SandboxError::kind`](crate::SandboxError::kind) of a missed deadline.
pub(crate) const TIMEOUT_KIND: &str = "timeout";

/// A complete audit record for one graded submission.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique run identifier.
    pub run_id: String,
    /// ISO-8601 timestamp of when grading started.
    pub timestamp: DateTime<Utc>,
    /// Question the submission answers.
    pub question_id: String,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// First N characters of the code (for human review).
    pub code_preview: String,
    /// Mode the submission was graded in.
    pub mode: ExecutionMode,
    /// One record per test case, in test-case order.
    pub tests: Vec<TestCaseAudit>,
    /// Total grading duration in milliseconds.
    pub duration_ms: u64,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// How a single test case ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcomeKind {
    /// Output matched.
    Passed,
    /// Output did not match.
    WrongOutput,
    /// The deadline elapsed.
    Timeout,
    /// Thrown error, build or launch failure.
    Error,
}

impl TestOutcomeKind {
    /// Classifies a finished test result.
    pub fn classify(result: &TestResult) -> Self {
        match (&result.error, result.passed) {
            (_, true) => Self::Passed,
            (None, false) => Self::WrongOutput,
            (Some(_), false) if result.error_kind == Some(TIMEOUT_KIND) => Self::Timeout,
            (Some(_), false) => Self::Error,
        }
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::WrongOutput => "wrong_output",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Audit record for a single test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestCaseAudit {
    /// Test case id.
    pub test_case_id: String,
    /// How the case ended.
    pub outcome: TestOutcomeKind,
    /// Duration of the case in milliseconds.
    pub duration_ms: u64,
}

/// The outcome of a graded submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Every test case passed.
    Passed,
    /// Some test cases did not pass.
    Failed {
        /// Number of cases that did not pass.
        failed: usize,
    },
    /// The question had no test cases.
    Empty,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the logger, returning the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Builder for constructing an audit entry while grading.
pub struct AuditEntryBuilder {
    run_id: String,
    timestamp: DateTime<Utc>,
    question_id: String,
    code_hash: String,
    code_preview: String,
    mode: ExecutionMode,
    tests: Vec<TestCaseAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an entry for a submission.
    pub fn new(question_id: &str, code: &str, mode: ExecutionMode) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            question_id: question_id.to_string(),
            code_hash: sha256_hex(code),
            code_preview: code_preview(code),
            mode,
            tests: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Record a finished test case.
    pub fn record_test(&mut self, result: &TestResult) {
        self.tests.push(TestCaseAudit {
            test_case_id: result.test_case.id.clone(),
            outcome: TestOutcomeKind::classify(result),
            duration_ms: result.duration_ms,
        });
    }

    /// Finalize the entry.
    pub fn finish(self) -> AuditEntry {
        let failed = self
            .tests
            .iter()
            .filter(|t| t.outcome != TestOutcomeKind::Passed)
            .count();
        let outcome = match (self.tests.is_empty(), failed) {
            (true, _) => AuditOutcome::Empty,
            (false, 0) => AuditOutcome::Passed,
            (false, failed) => AuditOutcome::Failed { failed },
        };
        AuditEntry {
            run_id: self.run_id,
            timestamp: self.timestamp,
            question_id: self.question_id,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            mode: self.mode,
            tests: self.tests,
            duration_ms: self.start.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via the [`tracing`] framework.
///
/// Entries are logged at `INFO` level with `audit = true` for easy filtering.
/// Per-test records are summarised as counts.
///
/// Use `RUST_LOG=sandpit=info` to capture all audit events.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let count = |kind: TestOutcomeKind| entry.tests.iter().filter(|t| t.outcome == kind).count();
        tracing::info!(
            audit = true,
            run_id = %entry.run_id,
            question_id = %entry.question_id,
            mode = %entry.mode,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            tests = entry.tests.len(),
            passed = count(TestOutcomeKind::Passed),
            timeouts = count(TestOutcomeKind::Timeout),
            errors = count(TestOutcomeKind::Error),
            outcome = ?entry.outcome,
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::TestCase;
    use serde_json::{json, Value};

    fn case(id: &str) -> TestCase {
        TestCase {
            id: id.into(),
            input: Value::Null,
            expected_output: Some(json!(1)),
            description: String::new(),
            is_hidden: false,
        }
    }

    fn result(id: &str, passed: bool, error: Option<&str>) -> TestResult {
        TestResult {
            test_case: case(id),
            passed,
            output: None,
            error: error.map(String::from),
            error_kind: error.map(|_| "js_error"),
            duration_ms: 5,
        }
    }

    #[test]
    fn sha256_hex_known_value() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn code_preview_short_code_unchanged() {
        assert_eq!(code_preview("function f() {}"), "function f() {}");
    }

    #[test]
    fn code_preview_long_code_truncated() {
        let preview = code_preview(&"x".repeat(1000));
        assert_eq!(preview.len(), CODE_PREVIEW_MAX + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn code_preview_multibyte_boundary() {
        let code = format!("{}é{}", "a".repeat(CODE_PREVIEW_MAX - 1), "b".repeat(10));
        let preview = code_preview(&code);
        assert!(preview.ends_with("a..."));
    }

    #[test]
    fn classifies_outcomes() {
        assert_eq!(TestOutcomeKind::classify(&result("a", true, None)), TestOutcomeKind::Passed);
        assert_eq!(
            TestOutcomeKind::classify(&result("b", false, None)),
            TestOutcomeKind::WrongOutput
        );
        let timed_out = TestResult::failure(case("c"), "Test timeout after 10000ms", 5)
            .with_error_kind(TIMEOUT_KIND);
        assert_eq!(TestOutcomeKind::classify(&timed_out), TestOutcomeKind::Timeout);
        // A thrown message that merely reads like a timeout is still an error.
        assert_eq!(
            TestOutcomeKind::classify(&result("e", false, Some("Test timeout after 5ms"))),
            TestOutcomeKind::Error
        );
        assert_eq!(
            TestOutcomeKind::classify(&result("d", false, Some("nope"))),
            TestOutcomeKind::Error
        );
    }

    #[test]
    fn builder_summarises_outcome() {
        let mut builder = AuditEntryBuilder::new("q1", "function f() {}", ExecutionMode::VanillaDom);
        builder.record_test(&result("a", true, None));
        builder.record_test(&result("b", false, Some("boom")));
        let entry = builder.finish();
        assert_eq!(entry.outcome, AuditOutcome::Failed { failed: 1 });
        assert_eq!(entry.tests.len(), 2);
        assert_eq!(entry.code_hash, sha256_hex("function f() {}"));

        let empty = AuditEntryBuilder::new("q2", "", ExecutionMode::PureLogic).finish();
        assert_eq!(empty.outcome, AuditOutcome::Empty);
    }

    #[tokio::test]
    async fn json_lines_logger_writes_valid_json() {
        let logger = JsonLinesAuditLogger::new(Vec::<u8>::new());
        let mut builder = AuditEntryBuilder::new("q1", "code", ExecutionMode::ReactComponent);
        builder.record_test(&result("a", true, None));
        logger.log(&builder.finish()).await;

        let output = String::from_utf8(logger.into_inner()).unwrap();
        assert!(output.ends_with('\n'));
        let parsed: Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(parsed["question_id"], "q1");
        assert_eq!(parsed["mode"], "react-component");
        assert_eq!(parsed["outcome"], "passed");
        assert_eq!(parsed["tests"][0]["outcome"], "passed");
    }
}
