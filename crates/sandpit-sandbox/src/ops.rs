//! deno_core op definitions for sandpit contexts.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments, so `missing_docs` is
//! allowed for the module. The functions and types themselves are documented.
#![allow(missing_docs)]

use std::time::Duration;

use deno_core::op2;
use deno_core::OpState;

use crate::relay::RelayRoute;

/// Longest single timer wait accepted from JS (about 24.8 days, the browser cap).
const MAX_SLEEP_MS: u32 = i32::MAX as u32;

/// JSON handed back by a host-driven script (transpile output, evaluation
/// envelope). Taken out of OpState by the Rust side after each script.
pub struct ScriptResult(pub String);

/// `window.parent.postMessage` after structured-clone-by-JSON.
///
/// Returns whether the message reached the host.
#[op2(fast)]
pub fn op_sandpit_post_message(
    state: &mut OpState,
    #[string] data: &str,
    #[string] target_origin: &str,
) -> bool {
    match state.try_borrow::<RelayRoute>() {
        Some(route) => route.deliver(data, target_origin),
        None => false,
    }
}

/// Store a script result in OpState.
#[op2(fast)]
pub fn op_sandpit_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ScriptResult(json.to_string()));
}

/// Base console of a context; the capture shim calls through to it.
#[op2(fast)]
pub fn op_sandpit_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::warn!(target: "sandpit::sandbox::js", level, "{}", msg),
        "debug" => tracing::debug!(target: "sandpit::sandbox::js", level, "{}", msg),
        _ => tracing::info!(target: "sandpit::sandbox::js", level, "{}", msg),
    }
}

/// Timer primitive behind `setTimeout` and `setInterval`.
#[op2(async)]
pub async fn op_sandpit_sleep(#[smi] ms: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(ms.min(MAX_SLEEP_MS)))).await;
}

deno_core::extension!(
    sandpit_ext,
    ops = [
        op_sandpit_post_message,
        op_sandpit_set_result,
        op_sandpit_log,
        op_sandpit_sleep
    ],
);
