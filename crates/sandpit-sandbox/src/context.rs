//! Isolated execution contexts.
//!
//! Every launch gets a brand new V8 isolate with the headless window
//! environment installed. Nothing is shared between contexts, so globals set
//! by one run are never visible to the next.
//!
//! V8 isolates are `!Send`, so each context lives on a dedicated thread with
//! its own single-threaded tokio runtime. The host talks to it through a
//! command channel and receives its messages through a [`RelaySubscription`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::bootstrap;
use crate::document::{HostDocument, ScriptBlock, ScriptKind};
use crate::error::SandboxError;
use crate::ops::{sandpit_ext, ScriptResult};
use crate::relay::{ConsoleLevel, RelayMessage, RelayRoute, RelaySubscription};

/// Origin the host application is served from, unless configured.
pub const DEFAULT_HOST_ORIGIN: &str = "http://localhost:5173";

/// Configuration for the context manager.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Origin of the host; same-origin documents report it as theirs.
    pub host_origin: String,
    /// V8 heap limit per context in bytes.
    pub max_heap_size: usize,
    /// Maximum simultaneously live contexts.
    pub max_live_contexts: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            host_origin: DEFAULT_HOST_ORIGIN.to_string(),
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_live_contexts: 8,
        }
    }
}

/// Supplies the text of external scripts (runtime libraries) to headless
/// contexts.
#[async_trait]
pub trait ScriptResolver: Send + Sync {
    /// The script served at `url`.
    async fn resolve(&self, url: &str) -> Result<String, SandboxError>;
}

/// Resolves nothing. Every external script surfaces as a load error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNetwork;

#[async_trait]
impl ScriptResolver for NoNetwork {
    async fn resolve(&self, url: &str) -> Result<String, SandboxError> {
        Err(SandboxError::ScriptUnavailable {
            url: url.to_string(),
            reason: "network access is disabled".into(),
        })
    }
}

/// Serves scripts from memory.
#[derive(Debug, Clone, Default)]
pub struct StaticScriptResolver {
    scripts: HashMap<String, String>,
}

impl StaticScriptResolver {
    /// An empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `source` for `url`.
    pub fn with_script(mut self, url: impl Into<String>, source: impl Into<String>) -> Self {
        self.scripts.insert(url.into(), source.into());
        self
    }
}

#[async_trait]
impl ScriptResolver for StaticScriptResolver {
    async fn resolve(&self, url: &str) -> Result<String, SandboxError> {
        self.scripts
            .get(url)
            .cloned()
            .ok_or_else(|| SandboxError::ScriptUnavailable {
                url: url.to_string(),
                reason: "no local copy registered".into(),
            })
    }
}

/// Serves scripts from vendored files, keyed by URL.
#[derive(Debug, Clone, Default)]
pub struct LocalFileResolver {
    files: HashMap<String, PathBuf>,
}

impl LocalFileResolver {
    /// A resolver over a URL-to-path map.
    pub fn new(files: HashMap<String, PathBuf>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl ScriptResolver for LocalFileResolver {
    async fn resolve(&self, url: &str) -> Result<String, SandboxError> {
        let path = self
            .files
            .get(url)
            .ok_or_else(|| SandboxError::ScriptUnavailable {
                url: url.to_string(),
                reason: "no local copy registered".into(),
            })?;
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SandboxError::ScriptUnavailable {
                url: url.to_string(),
                reason: format!("{}: {e}", path.display()),
            })
    }
}

enum Command {
    RunTest { input_json: String },
}

/// One document script after external resolution.
enum LoadStep {
    Script {
        label: &'static str,
        kind: ScriptKind,
        source: String,
    },
    Unavailable {
        url: String,
        reason: String,
    },
}

struct ContextSetup {
    origin: String,
    element_ids: Vec<String>,
    steps: Vec<LoadStep>,
    max_heap_size: usize,
    disposed: Arc<AtomicBool>,
}

/// Launches isolated contexts and bounds how many are alive.
///
/// `Send + Sync`; cheap to share behind an `Arc`.
pub struct ContextManager {
    config: ContextConfig,
    resolver: Arc<dyn ScriptResolver>,
    semaphore: Arc<Semaphore>,
    live: Arc<AtomicUsize>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl ContextManager {
    /// A manager whose contexts cannot load external scripts.
    pub fn new(config: ContextConfig) -> Self {
        Self::with_resolver(config, Arc::new(NoNetwork))
    }

    /// A manager using `resolver` for external scripts.
    pub fn with_resolver(config: ContextConfig, resolver: Arc<dyn ScriptResolver>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_live_contexts));
        Self {
            config,
            resolver,
            semaphore,
            live: Arc::new(AtomicUsize::new(0)),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Report launches and disposals to `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Manager configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Number of contexts launched and not yet disposed.
    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Loads `document` into a fresh context.
    ///
    /// Returns once the isolate exists and the window environment is
    /// installed; the document's scripts run afterwards on the context thread.
    ///
    /// Fails with [`SandboxError::ConcurrencyLimit`] when every slot is taken.
    pub async fn launch(
        &self,
        document: &HostDocument,
    ) -> Result<(ContextHandle, RelaySubscription), SandboxError> {
        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_live_contexts,
            }
        })?;
        self.launch_reserved(ContextSlot(permit), document).await
    }

    /// Waits until a live-context slot is free and holds it.
    pub async fn reserve(&self) -> Result<ContextSlot, SandboxError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(ContextSlot)
            .map_err(|_| SandboxError::ContextClosed)
    }

    /// Loads `document` into a fresh context occupying `slot`.
    pub async fn launch_reserved(
        &self,
        slot: ContextSlot,
        document: &HostDocument,
    ) -> Result<(ContextHandle, RelaySubscription), SandboxError> {
        let ContextSlot(permit) = slot;
        let steps = self.resolve_steps(document).await;
        let origin = if document.sandbox_flags().allows_same_origin() {
            self.config.host_origin.clone()
        } else {
            "null".to_string()
        };

        let disposed = Arc::new(AtomicBool::new(false));
        let (route, relay_rx) = RelayRoute::new(self.config.host_origin.clone(), disposed.clone());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let setup = ContextSetup {
            origin,
            element_ids: document.element_ids().to_vec(),
            steps,
            max_heap_size: self.config.max_heap_size,
            disposed: disposed.clone(),
        };

        std::thread::Builder::new()
            .name("sandpit-context".into())
            .spawn(move || run_context_thread(setup, route, cmd_rx, ready_tx))
            .map_err(|e| SandboxError::Execution(e.into()))?;

        let isolate = ready_rx.await.map_err(|_| {
            SandboxError::Execution(anyhow::anyhow!("context thread exited during startup"))
        })??;

        self.live.fetch_add(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_launch(document.mode());
        }
        tracing::debug!(
            mode = %document.mode(),
            live = self.live_contexts(),
            "context launched"
        );

        let handle = ContextHandle {
            isolate,
            commands: Some(cmd_tx),
            disposed: disposed.clone(),
            permit: Some(permit),
            live: self.live.clone(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        };
        Ok((handle, RelaySubscription::new(relay_rx, disposed)))
    }

    async fn resolve_steps(&self, document: &HostDocument) -> Vec<LoadStep> {
        let mut steps = Vec::with_capacity(document.scripts().len());
        for block in document.scripts() {
            match block {
                ScriptBlock::External { url } => match self.resolver.resolve(url).await {
                    Ok(source) => steps.push(LoadStep::Script {
                        label: "runtime",
                        kind: ScriptKind::Classic,
                        source,
                    }),
                    Err(e) => {
                        tracing::debug!(url = %url, error = %e, "external script unavailable");
                        let reason = match e {
                            SandboxError::ScriptUnavailable { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        steps.push(LoadStep::Unavailable {
                            url: url.clone(),
                            reason,
                        });
                    }
                },
                ScriptBlock::Inline {
                    label,
                    kind,
                    source,
                } => steps.push(LoadStep::Script {
                    label,
                    kind: *kind,
                    source: source.clone(),
                }),
            }
        }
        steps
    }
}

/// A reserved live-context slot, released on drop unless a context takes it.
#[derive(Debug)]
pub struct ContextSlot(OwnedSemaphorePermit);

/// Owner's handle to a live context.
///
/// Dropping the handle disposes the context.
pub struct ContextHandle {
    isolate: v8::IsolateHandle,
    commands: Option<mpsc::UnboundedSender<Command>>,
    disposed: Arc<AtomicBool>,
    permit: Option<OwnedSemaphorePermit>,
    live: Arc<AtomicUsize>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ContextHandle {
    /// Calls `window.runTest(input)` in the context.
    ///
    /// The outcome arrives on the relay subscription as a test-result message.
    pub fn invoke_test(&self, input: &Value) -> Result<(), SandboxError> {
        let input_json = serde_json::to_string(input)?;
        self.send(Command::RunTest { input_json })
    }

    fn send(&self, command: Command) -> Result<(), SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::ContextClosed);
        }
        self.commands
            .as_ref()
            .ok_or(SandboxError::ContextClosed)?
            .send(command)
            .map_err(|_| SandboxError::ContextClosed)
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Terminates the context and releases its slot.
    ///
    /// Stops running script, closes the command channel and detaches the
    /// relay subscription. Safe to call any number of times.
    pub fn dispose(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.isolate.terminate_execution();
        self.commands.take();
        self.permit.take();
        self.live.fetch_sub(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_dispose();
        }
        tracing::debug!("context disposed");
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_context_thread(
    setup: ContextSetup,
    route: RelayRoute,
    commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<v8::IsolateHandle, SandboxError>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            if ready.send(Err(SandboxError::Execution(e.into()))).is_err() {
                tracing::warn!("context launcher dropped");
            }
            return;
        }
    };
    rt.block_on(drive_context(setup, route, commands, ready));
}

async fn drive_context(
    setup: ContextSetup,
    route: RelayRoute,
    commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<v8::IsolateHandle, SandboxError>>,
) {
    let mut runtime = create_runtime(setup.max_heap_size);
    let heap = HeapGuard::install(&mut runtime);
    runtime.op_state().borrow_mut().put(route);

    let window = bootstrap::window_bootstrap(&setup.origin, &setup.element_ids);
    if let Err(e) = runtime.execute_script("[sandpit:window]", window) {
        let err = SandboxError::JsError {
            message: e.to_string(),
        };
        if ready.send(Err(err)).is_err() {
            tracing::warn!("context launcher dropped");
        }
        heap.remove(&mut runtime);
        return;
    }

    let isolate = runtime.v8_isolate().thread_safe_handle();
    if ready.send(Ok(isolate)).is_err() {
        tracing::debug!("context launcher dropped before the context was ready");
        heap.remove(&mut runtime);
        return;
    }

    load_document(&mut runtime, setup.steps, &setup.disposed, &heap);
    command_loop(&mut runtime, commands, &setup.disposed, &heap).await;

    if heap.triggered() {
        tracing::warn!("context terminated at the heap limit");
        if let Some(route) = runtime.op_state().borrow().try_borrow::<RelayRoute>() {
            route.inject(RelayMessage::Console {
                level: ConsoleLevel::Error,
                message: SandboxError::HeapLimitExceeded.to_string(),
                timestamp: None,
            });
        }
    }
    heap.remove(&mut runtime);
}

fn should_stop(disposed: &AtomicBool, heap: &HeapGuard) -> bool {
    disposed.load(Ordering::SeqCst) || heap.triggered()
}

fn load_document(
    runtime: &mut JsRuntime,
    steps: Vec<LoadStep>,
    disposed: &AtomicBool,
    heap: &HeapGuard,
) {
    for step in steps {
        if should_stop(disposed, heap) {
            return;
        }
        match step {
            LoadStep::Unavailable { url, reason } => {
                run_host_script(
                    runtime,
                    bootstrap::report_error(&format!("Failed to load script {url}: {reason}")),
                );
            }
            LoadStep::Script {
                label,
                kind: ScriptKind::Classic,
                source,
            } => run_document_script(runtime, label, source),
            LoadStep::Script {
                label,
                kind: ScriptKind::Jsx,
                source,
            } => match transpile(runtime, &source) {
                Ok(code) => run_document_script(runtime, label, code),
                Err(reason) => run_host_script(
                    runtime,
                    bootstrap::report_error(&format!("Could not transpile {label} script: {reason}")),
                ),
            },
        }
    }
    if !should_stop(disposed, heap) {
        run_host_script(runtime, bootstrap::fire_load());
    }
}

/// Runs one document script; an uncaught exception goes to `window.onerror`.
fn run_document_script(runtime: &mut JsRuntime, label: &'static str, source: String) {
    if let Err(e) = runtime.execute_script(label, source) {
        tracing::debug!(script = label, error = %e, "document script threw");
        run_host_script(runtime, bootstrap::report_error(&e.to_string()));
    }
}

fn run_host_script(runtime: &mut JsRuntime, script: String) {
    if let Err(e) = runtime.execute_script("[sandpit:host]", script) {
        tracing::debug!(error = %e, "host script failed");
    }
}

fn transpile(runtime: &mut JsRuntime, source: &str) -> Result<String, String> {
    #[derive(Deserialize)]
    struct Transpiled {
        code: Option<String>,
        error: Option<String>,
    }

    runtime
        .execute_script("[sandpit:transpile]", bootstrap::transpile_jsx(source))
        .map_err(|e| e.to_string())?;
    let raw = take_script_result(runtime).ok_or_else(|| "transpiler returned nothing".to_string())?;
    let transpiled: Transpiled = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
    match (transpiled.code, transpiled.error) {
        (Some(code), _) => Ok(code),
        (None, Some(error)) => Err(error),
        (None, None) => Err("transpiler returned no code".to_string()),
    }
}

pub(crate) fn has_script_result(runtime: &mut JsRuntime) -> bool {
    runtime.op_state().borrow().try_borrow::<ScriptResult>().is_some()
}

pub(crate) fn take_script_result(runtime: &mut JsRuntime) -> Option<String> {
    runtime
        .op_state()
        .borrow_mut()
        .try_take::<ScriptResult>()
        .map(|r| r.0)
}

async fn command_loop(
    runtime: &mut JsRuntime,
    mut commands: mpsc::UnboundedReceiver<Command>,
    disposed: &AtomicBool,
    heap: &HeapGuard,
) {
    let mut idle = false;
    loop {
        if should_stop(disposed, heap) {
            break;
        }

        if idle {
            match commands.recv().await {
                Some(command) => {
                    handle_command(runtime, command);
                    idle = false;
                }
                None => break,
            }
            continue;
        }

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => handle_command(runtime, command),
                None => break,
            },
            result = runtime.run_event_loop(PollEventLoopOptions::default()) => match result {
                Ok(()) => idle = true,
                Err(e) => {
                    if should_stop(disposed, heap) {
                        break;
                    }
                    tracing::debug!(error = %e, "context event loop error");
                    run_host_script(runtime, bootstrap::report_error(&e.to_string()));
                }
            },
        }
    }
}

fn handle_command(runtime: &mut JsRuntime, command: Command) {
    match command {
        Command::RunTest { input_json } => {
            run_host_script(runtime, bootstrap::invoke_test(&input_json));
        }
    }
}

/// Create a fresh JsRuntime with the sandpit extension loaded and V8 heap limits set.
pub(crate) fn create_runtime(max_heap_size: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);
    JsRuntime::new(RuntimeOptions {
        extensions: vec![sandpit_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    })
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points into the `HeapGuard` box that registered this
    // callback. The guard removes the callback before it is dropped, and V8
    // only invokes it on the isolate's own thread.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Owns the near-heap-limit registration of one runtime.
///
/// Call [`HeapGuard::remove`] before the guard or the runtime goes away.
pub(crate) struct HeapGuard {
    state: Box<HeapLimitState>,
}

impl HeapGuard {
    pub(crate) fn install(runtime: &mut JsRuntime) -> Self {
        let state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*state as *const HeapLimitState as *mut std::ffi::c_void,
        );
        Self { state }
    }

    pub(crate) fn triggered(&self) -> bool {
        self.state.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn remove(self, runtime: &mut JsRuntime) {
        runtime
            .v8_isolate()
            .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
        drop(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_network_refuses_everything() {
        let err = NoNetwork.resolve("https://unpkg.com/x.js").await.unwrap_err();
        assert!(matches!(err, SandboxError::ScriptUnavailable { .. }));
    }

    #[tokio::test]
    async fn static_resolver_serves_registered_scripts() {
        let resolver = StaticScriptResolver::new().with_script("https://cdn/x.js", "var x = 1;");
        assert_eq!(resolver.resolve("https://cdn/x.js").await.unwrap(), "var x = 1;");
        assert!(resolver.resolve("https://cdn/y.js").await.is_err());
    }

    #[tokio::test]
    async fn local_file_resolver_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("react.js");
        std::fs::write(&path, "globalThis.React = {};").unwrap();
        let resolver = LocalFileResolver::new(HashMap::from([
            ("https://cdn/react.js".to_string(), path),
            ("https://cdn/gone.js".to_string(), dir.path().join("gone.js")),
        ]));
        assert_eq!(
            resolver.resolve("https://cdn/react.js").await.unwrap(),
            "globalThis.React = {};"
        );
        let err = resolver.resolve("https://cdn/gone.js").await.unwrap_err();
        assert!(err.to_string().contains("gone.js"));
    }
}
