//! Live preview slot.
//!
//! A slot shows one run at a time. Rendering a new bundle disposes the
//! previous context before the next is launched, so a slot never holds more
//! than one live context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::bundle::{ExecutionMode, SourceBundle};
use crate::context::{ContextHandle, ContextManager};
use crate::document::{Capabilities, DocumentBuilder};
use crate::error::SandboxError;
use crate::relay::{RelayEvent, RelayMessage, RelaySink, RelaySubscription};
use crate::session::{RunSession, SessionId, SessionStatus};

struct LiveRun {
    handle: ContextHandle,
    pump: JoinHandle<()>,
}

/// One preview pane.
pub struct Preview {
    builder: DocumentBuilder,
    contexts: Arc<ContextManager>,
    sink: Arc<dyn RelaySink>,
    proctoring: bool,
    generation: Arc<AtomicU64>,
    session: Option<Arc<Mutex<RunSession>>>,
    live: Option<LiveRun>,
}

impl Preview {
    /// An empty slot reporting to `sink`.
    pub fn new(builder: DocumentBuilder, contexts: Arc<ContextManager>, sink: Arc<dyn RelaySink>) -> Self {
        Self {
            builder,
            contexts,
            sink,
            proctoring: false,
            generation: Arc::new(AtomicU64::new(0)),
            session: None,
            live: None,
        }
    }

    /// Install the proctoring hooks in every rendered document.
    pub fn with_proctoring(mut self) -> Self {
        self.proctoring = true;
        self
    }

    /// Replaces whatever the slot shows with `bundle`.
    ///
    /// Build and launch failures are reported to the sink as a single error
    /// event and leave the session errored.
    pub async fn render(&mut self, bundle: &SourceBundle) -> SessionId {
        self.dispose();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let session = RunSession::new(bundle.mode);
        let session_id = session.id();
        self.sink.session_started(&session);
        let session = Arc::new(Mutex::new(session));
        self.session = Some(session.clone());

        match self.launch(bundle).await {
            Ok((handle, relay)) => {
                tracing::debug!(session_id = %session_id, mode = %bundle.mode, generation, "preview rendered");
                let pump = tokio::spawn(pump_events(
                    relay,
                    session,
                    self.sink.clone(),
                    self.generation.clone(),
                    generation,
                ));
                self.live = Some(LiveRun { handle, pump });
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "preview failed to start");
                self.sink.deliver(session_id, RelayEvent::error(e.to_string()));
                let mut session = lock(&session);
                if session.finish(SessionStatus::Errored) {
                    self.sink.session_finished(&session);
                }
            }
        }
        session_id
    }

    async fn launch(
        &self,
        bundle: &SourceBundle,
    ) -> Result<(ContextHandle, RelaySubscription), SandboxError> {
        let caps = match bundle.mode {
            ExecutionMode::ReactComponent => Capabilities::react_preview(),
            ExecutionMode::VanillaDom | ExecutionMode::PureLogic => Capabilities::live_preview(),
        };
        let caps = if self.proctoring { caps.with_proctoring() } else { caps };
        let document = self.builder.build(bundle, caps)?;
        self.contexts.launch(&document).await
    }

    /// The most recent session, if anything was rendered.
    pub fn session(&self) -> Option<RunSession> {
        self.session.as_ref().map(|session| lock(session).clone())
    }

    /// Whether the slot holds a live context.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Tears down the live run, if any. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.pump.abort();
            live.handle.dispose();
        }
        if let Some(session) = &self.session {
            let mut session = lock(session);
            if session.finish(SessionStatus::Completed) {
                tracing::debug!(session_id = %session.id(), "preview disposed");
                self.sink.session_finished(&session);
            }
        }
    }
}

impl Drop for Preview {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn pump_events(
    mut relay: RelaySubscription,
    session: Arc<Mutex<RunSession>>,
    sink: Arc<dyn RelaySink>,
    current: Arc<AtomicU64>,
    generation: u64,
) {
    while let Some(message) = relay.recv().await {
        // Checked and delivered under the session lock, so nothing from this
        // run reaches the sink once dispose has finished the session.
        let mut run = lock(&session);
        if current.load(Ordering::SeqCst) != generation || run.status().is_terminal() {
            tracing::debug!(generation, "ignoring message from superseded preview");
            break;
        }
        if matches!(message, RelayMessage::Ready) {
            run.mark_running();
        }
        if let Some(event) = RelayEvent::from_message(&message) {
            sink.deliver(run.id(), event);
        }
    }
}

fn lock(session: &Mutex<RunSession>) -> MutexGuard<'_, RunSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
