#![warn(missing_docs)]

//! # sandpit-sandbox
//!
//! Runs untrusted candidate code for a coding-assessment platform.
//!
//! A [`SourceBundle`] (markup, styles, script and an [`ExecutionMode`]) is
//! assembled into a self-contained [`HostDocument`], loaded into a fresh V8
//! isolate with a headless window environment, and observed through a
//! one-way relay of console output, test results and proctoring signals.
//!
//! ## Isolation model
//!
//! - **Fresh isolate per run**: nothing survives from one run to the next
//! - **No ambient capabilities**: no fs, net, env or process access
//! - **Single bridge**: `postMessage` to the host, checked against the host origin
//! - **Pre-execution validation**: size limits and runtime-escape patterns
//! - **Deadlines**: every test case is cut off after its timeout, CPU-bound or not
//!
//! ## Entry points
//!
//! - [`TestRunner::run_tests`] grades a submission against a [`Question`]
//! - [`Preview::render`] shows a bundle in a live preview slot
//! - [`DocumentBuilder::build`] produces the document on its own

pub mod aggregator;
pub mod audit;
mod bootstrap;
pub mod bundle;
pub mod context;
pub mod document;
pub mod error;
pub mod escape;
pub mod evaluate;
#[cfg(feature = "metrics")]
pub mod metrics;
mod ops;
pub mod preview;
pub mod question;
pub mod relay;
pub mod runner;
pub mod session;
mod shims;
pub mod transform;
pub mod validator;
pub mod verdict;

pub use aggregator::ConsoleAggregator;
pub use bundle::{ExecutionMode, SourceBundle};
pub use context::{ContextConfig, ContextHandle, ContextManager, ContextSlot, ScriptResolver};
pub use document::{Capabilities, DocumentBuilder, DocumentOptions, HostDocument, TargetOrigin};
pub use error::SandboxError;
pub use evaluate::{evaluate_function, EvaluationConfig};
pub use preview::Preview;
pub use question::{Question, TestCase, TestResult};
pub use relay::{RelayEvent, RelayEventKind, RelayMessage, RelaySink, RelaySubscription};
pub use runner::{RunnerConfig, TestRunner};
pub use session::{RunSession, SessionId, SessionStatus};
pub use transform::{find_function_name, transform, FunctionLookup};
