//! Test execution orchestrator.
//!
//! Grades a submission against every test case of a question. Component
//! questions run each case in its own harness document and context; plain
//! function questions call the identified function directly in a fresh
//! isolate. Either way every case gets a fresh context and one deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger, TIMEOUT_PREFIX};
use crate::bundle::{ExecutionMode, SourceBundle};
use crate::context::{ContextManager, ContextSlot};
use crate::document::{Capabilities, DocumentBuilder};
use crate::error::SandboxError;
use crate::evaluate::{evaluate_function, EvaluationConfig};
use crate::question::{Question, TestCase, TestResult};
use crate::relay::{RelayEvent, RelayEventKind, RelayMessage, RelaySink};
use crate::session::{RunSession, SessionStatus};
use crate::transform::{find_function_name, FunctionLookup};
use crate::verdict::outputs_match;

/// Error recorded when no callable could be identified in the submission.
pub const FUNCTION_NOT_FOUND: &str = "could not identify function";

/// Configuration for the test runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Deadline per test case.
    pub test_timeout: Duration,
    /// Test cases run at the same time; 1 runs them sequentially.
    pub parallelism: usize,
    /// Limits for direct function evaluation. Its timeout is replaced by
    /// `test_timeout`.
    pub evaluation: EvaluationConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_secs(10),
            parallelism: 1,
            evaluation: EvaluationConfig::default(),
        }
    }
}

/// Grades submissions. Cheap to clone.
#[derive(Clone)]
pub struct TestRunner {
    config: RunnerConfig,
    builder: DocumentBuilder,
    contexts: Arc<ContextManager>,
    sink: Option<Arc<dyn RelaySink>>,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

/// What the per-case work needs, shared with spawned tasks.
#[derive(Clone)]
enum Plan {
    Component {
        bundle: Arc<SourceBundle>,
    },
    Function {
        source: Arc<str>,
        name: Arc<str>,
    },
    Unrunnable {
        reason: &'static str,
    },
}

impl TestRunner {
    /// Create a runner launching component contexts through `contexts`.
    pub fn new(config: RunnerConfig, builder: DocumentBuilder, contexts: Arc<ContextManager>) -> Self {
        Self {
            config,
            builder,
            contexts,
            sink: None,
            audit_logger: Arc::new(NoopAuditLogger),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Forward console events and per-case verdicts to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn RelaySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Write one audit entry per graded submission to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// Record test outcomes in `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs every test case of `question` against `code`.
    ///
    /// Always returns one result per test case, in test-case order. Failures
    /// of any kind are reported inside the results, never as an error.
    pub async fn run_tests(&self, question: &Question, code: &str) -> Vec<TestResult> {
        let mode = question.infer_mode();
        let started = Instant::now();
        tracing::info!(
            question_id = %question.id,
            mode = %mode,
            cases = question.test_cases.len(),
            parallelism = self.config.parallelism,
            "grading submission"
        );

        let plan = self.plan(question, code, mode);
        let results = if self.config.parallelism <= 1 || question.test_cases.len() <= 1 {
            let mut results = Vec::with_capacity(question.test_cases.len());
            for case in &question.test_cases {
                results.push(self.run_case(&plan, mode, case.clone()).await);
            }
            results
        } else {
            self.run_parallel(&plan, mode, &question.test_cases).await
        };

        let mut audit = AuditEntryBuilder::new(&question.id, code, mode);
        for result in &results {
            audit.record_test(result);
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_test(
                    mode,
                    crate::audit::TestOutcomeKind::classify(result),
                    result.duration_ms as f64 / 1000.0,
                );
            }
        }
        self.audit_logger.log(&audit.finish()).await;

        tracing::info!(
            question_id = %question.id,
            passed = results.iter().filter(|r| r.passed).count(),
            total = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "grading complete"
        );
        results
    }

    fn plan(&self, question: &Question, code: &str, mode: ExecutionMode) -> Plan {
        match mode {
            ExecutionMode::ReactComponent => Plan::Component {
                bundle: Arc::new(SourceBundle {
                    script: code.to_string(),
                    mode,
                    test_support: question.test_harness.clone(),
                    ..Default::default()
                }),
            },
            ExecutionMode::VanillaDom | ExecutionMode::PureLogic => {
                match find_function_name(code, &question.title) {
                    FunctionLookup::NotFound => {
                        tracing::debug!(question_id = %question.id, "no function found in submission");
                        Plan::Unrunnable {
                            reason: FUNCTION_NOT_FOUND,
                        }
                    }
                    lookup => {
                        tracing::debug!(question_id = %question.id, lookup = ?lookup, "function identified");
                        Plan::Function {
                            source: Arc::from(code),
                            name: Arc::from(lookup.name().unwrap_or_default()),
                        }
                    }
                }
            }
        }
    }

    async fn run_parallel(
        &self,
        plan: &Plan,
        mode: ExecutionMode,
        cases: &[TestCase],
    ) -> Vec<TestResult> {
        let slots = Arc::new(Semaphore::new(self.config.parallelism));
        let mut set = JoinSet::new();
        for (index, case) in cases.iter().enumerate() {
            let runner = self.clone();
            let plan = plan.clone();
            let slots = slots.clone();
            let case = case.clone();
            set.spawn(async move {
                let _slot = slots.acquire_owned().await;
                (index, runner.run_case(&plan, mode, case).await)
            });
        }

        let mut results: Vec<Option<TestResult>> = vec![None; cases.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::warn!(error = %e, "test case task failed"),
            }
        }
        results
            .into_iter()
            .zip(cases)
            .map(|(result, case)| {
                result.unwrap_or_else(|| TestResult::failure(case.clone(), "test case task failed", 0))
            })
            .collect()
    }

    async fn run_case(&self, plan: &Plan, mode: ExecutionMode, case: TestCase) -> TestResult {
        let mut session = RunSession::new(mode);
        if let Some(sink) = &self.sink {
            sink.session_started(&session);
        }
        let timeout = self.config.test_timeout;
        let mut start = Instant::now();

        let outcome = match plan {
            Plan::Unrunnable { reason } => Err(SandboxError::ValidationFailed {
                reason: (*reason).to_string(),
            }),
            // Component cases queue for a live-context slot; the deadline
            // starts once one is held.
            Plan::Component { bundle } => match self.contexts.reserve().await {
                Ok(slot) => {
                    start = Instant::now();
                    let drive = self.drive_component(bundle, &case, &mut session, slot);
                    match tokio::time::timeout(timeout, drive).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(SandboxError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    }
                }
                Err(e) => Err(e),
            },
            Plan::Function { source, name } => {
                session.mark_running();
                let config = EvaluationConfig {
                    timeout,
                    ..self.config.evaluation.clone()
                };
                let call = evaluate_function(&config, source, name, &case.input);
                match tokio::time::timeout(timeout, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SandboxError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => {
                session.finish(SessionStatus::Completed);
                let passed = outputs_match(output.as_ref(), case.expected_output.as_ref());
                TestResult {
                    test_case: case,
                    passed,
                    output,
                    error: None,
                    error_kind: None,
                    duration_ms,
                }
            }
            Err(e) => {
                let kind = e.kind();
                let message = match e {
                    SandboxError::Timeout { timeout_ms } => {
                        session.finish(SessionStatus::TimedOut);
                        format!("{TIMEOUT_PREFIX}{timeout_ms}ms")
                    }
                    other => {
                        session.finish(SessionStatus::Errored);
                        failure_message(other)
                    }
                };
                TestResult::failure(case, message, duration_ms).with_error_kind(kind)
            }
        };

        tracing::debug!(
            session_id = %session.id(),
            test_case_id = %result.test_case.id,
            passed = result.passed,
            status = %session.status(),
            elapsed_ms = duration_ms,
            "test case finished"
        );

        if let Some(sink) = &self.sink {
            sink.deliver(
                session.id(),
                RelayEvent::now(RelayEventKind::TestResult {
                    test_case_id: Some(result.test_case.id.clone()),
                    passed: result.passed,
                    actual_output: result.output.clone(),
                    error_message: result.error.clone(),
                }),
            );
            sink.session_finished(&session);
        }
        result
    }

    /// Builds, launches and drives one harness context until it reports.
    ///
    /// Returns the value `executeTest` produced (`None` for undefined). The
    /// context is disposed on every path, including cancellation by the
    /// caller's deadline, because the handle lives in this future.
    async fn drive_component(
        &self,
        bundle: &SourceBundle,
        case: &TestCase,
        session: &mut RunSession,
        slot: ContextSlot,
    ) -> Result<Option<Value>, SandboxError> {
        let document = self.builder.build(bundle, Capabilities::test_harness())?;
        let (mut handle, mut relay) = self.contexts.launch_reserved(slot, &document).await?;

        let mut invoked = false;
        let outcome = loop {
            let Some(message) = relay.recv().await else {
                break Err(SandboxError::ContextClosed);
            };
            match message {
                RelayMessage::Ready => {
                    session.mark_running();
                    if !invoked {
                        invoked = true;
                        if let Err(e) = handle.invoke_test(&case.input) {
                            break Err(e);
                        }
                    }
                }
                RelayMessage::TestResult { success: true, .. } => break Ok(message.test_output()),
                RelayMessage::TestResult {
                    success: false,
                    error,
                    ..
                } => {
                    break Err(SandboxError::JsError {
                        message: error.unwrap_or_else(|| "test failed".to_string()),
                    })
                }
                other => {
                    if let (Some(sink), Some(event)) = (&self.sink, RelayEvent::from_message(&other)) {
                        sink.deliver(session.id(), event);
                    }
                }
            }
        };

        handle.dispose();
        outcome
    }
}

fn failure_message(error: SandboxError) -> String {
    match error {
        SandboxError::JsError { message } => message,
        SandboxError::ValidationFailed { reason } => reason,
        other => other.to_string(),
    }
}
