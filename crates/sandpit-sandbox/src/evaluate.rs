//! Direct function evaluation for plain-function questions.
//!
//! The candidate's source runs in a fresh isolate with the headless window
//! environment but without a document or relay. A wrapper then calls the
//! identified function and hands the outcome back through OpState.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use deno_core::{JsRuntime, PollEventLoopOptions};
use serde::Deserialize;
use serde_json::Value;

use crate::bootstrap;
use crate::context::{create_runtime, has_script_result, take_script_result, HeapGuard};
use crate::error::SandboxError;
use crate::validator::validate_source;
use crate::verdict::deserialize_some;

/// Limits for one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    /// Wall-clock and CPU deadline.
    pub timeout: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum size of the source in bytes.
    pub max_code_size: usize,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_code_size: 64 * 1024,        // 64 KB
            max_output_size: 1024 * 1024,    // 1 MB
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, deserialize_with = "deserialize_some")]
    ok: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Calls `function` from `source` with arguments derived from `input`.
///
/// Object inputs are spread as `Object.values(input)`; anything else is
/// passed as the single argument. Returns `Ok(None)` when the function
/// returned `undefined`.
pub async fn evaluate_function(
    config: &EvaluationConfig,
    source: &str,
    function: &str,
    input: &Value,
) -> Result<Option<Value>, SandboxError> {
    validate_source("script", source, Some(config.max_code_size))?;
    if !is_identifier(function) {
        return Err(SandboxError::ValidationFailed {
            reason: format!("'{function}' is not a plain identifier"),
        });
    }

    let source = source.to_string();
    let call = bootstrap::call_function(function, &serde_json::to_string(input)?);
    let config = config.clone();

    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                    tracing::warn!("evaluation result receiver dropped");
                }
                return;
            }
        };
        let result = rt.block_on(run_evaluation(&config, source, call));
        if tx.send(result).is_err() {
            tracing::warn!("evaluation result receiver dropped before result was sent");
        }
    });

    rx.await
        .map_err(|_| SandboxError::Execution(anyhow::anyhow!("evaluation thread panicked")))?
}

/// Runs on the evaluation thread.
///
/// A CPU watchdog thread terminates V8 when the deadline elapses, which also
/// covers synchronous infinite loops; the near-heap-limit guard covers
/// runaway allocation.
async fn run_evaluation(
    config: &EvaluationConfig,
    source: String,
    call: String,
) -> Result<Option<Value>, SandboxError> {
    let mut runtime = create_runtime(config.max_heap_size);
    let heap = HeapGuard::install(&mut runtime);

    runtime
        .execute_script("[sandpit:window]", bootstrap::window_bootstrap("null", &[]))
        .map_err(|e| SandboxError::JsError {
            message: e.to_string(),
        })?;

    // --- CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let exec_error = match runtime.execute_script("user", source) {
        Ok(_) => match runtime.execute_script("[sandpit:call]", call) {
            Ok(_) => {
                match tokio::time::timeout(config.timeout, run_until_settled(&mut runtime)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => {
                        timed_out.store(true, Ordering::SeqCst);
                        None
                    }
                }
            }
            Err(e) => Some(e.to_string()),
        },
        Err(e) => Some(e.to_string()),
    };

    // The watchdog must be gone before the runtime is dropped.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    let heap_exceeded = heap.triggered();
    let result = take_script_result(&mut runtime);
    heap.remove(&mut runtime);

    if heap_exceeded {
        return Err(SandboxError::HeapLimitExceeded);
    }
    if timed_out.load(Ordering::SeqCst) {
        return Err(SandboxError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }
    if let Some(message) = exec_error {
        return Err(SandboxError::JsError { message });
    }

    let raw = result.ok_or_else(|| SandboxError::JsError {
        message: "function did not settle".into(),
    })?;
    if raw.len() > config.max_output_size {
        return Err(SandboxError::OutputTooLarge {
            max: config.max_output_size,
        });
    }

    let envelope: Envelope = serde_json::from_str(&raw)?;
    if let Some(message) = envelope.error {
        return Err(SandboxError::JsError { message });
    }
    Ok(envelope.ok)
}

/// Drives the event loop until the call wrapper has handed back its
/// envelope. Timers the function leaves pending are abandoned with the
/// isolate.
async fn run_until_settled(runtime: &mut JsRuntime) -> Result<(), String> {
    std::future::poll_fn(|cx| {
        let polled = runtime.poll_event_loop(cx, PollEventLoopOptions::default());
        if has_script_result(runtime) {
            return Poll::Ready(Ok(()));
        }
        polled.map(|result| result.map_err(|e| e.to_string()))
    })
    .await
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
