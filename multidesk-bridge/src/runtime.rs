//! Host runtime for the mirroring core.
//!
//! The shell drives its own event loop (usually a GUI toolkit's). This module
//! spawns a dedicated background thread running a tokio `Runtime` that hosts
//! the bridge, the mirror coordinator and one task per pane, and talks to the
//! shell over `flume` channels, which work from sync code and any executor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    flume channels    ┌──────────────────────┐
//! │  shell          │ ◄──────────────────► │  tokio thread        │
//! │  webviews, OCR  │   ShellRequest →     │  Bridge, coordinator │
//! │  polls notes    │   ← ShellNotification│  pane tasks          │
//! └─────────────────┘                      └──────────────────────┘
//! ```

use crate::bridge::Bridge;
use crate::config::{MirrorConfig, PaneKind};
use crate::coordinator::MirrorCoordinator;
use crate::document::{Document, PaneId};
use crate::error::{MirrorError, Result};
use crate::listener::EchoGuard;
use crate::pane::{spawn_pane, HostContext, PaneHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;

/// Request from the shell to the mirroring runtime.
#[derive(Clone)]
pub enum ShellRequest {
    /// Start mirroring a pane whose page is reachable through `document`.
    AttachPane {
        pane_id: PaneId,
        kind: PaneKind,
        document: Arc<dyn Document>,
    },

    /// Stop mirroring a pane (closed or reloaded by the shell).
    DetachPane { pane_id: PaneId },

    /// Push text into one pane, as the coordinator would.
    SetExternalText { pane_id: PaneId, text: String },

    /// Send the current prompt in every pane except `source`.
    Submit { source: Option<PaneId> },

    /// Detach every pane and stop the runtime.
    Shutdown,
}

impl std::fmt::Debug for ShellRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttachPane {
                pane_id,
                kind,
                document,
            } => f
                .debug_struct("AttachPane")
                .field("pane_id", pane_id)
                .field("kind", kind)
                .field("url", &document.url())
                .finish(),
            Self::DetachPane { pane_id } => {
                f.debug_struct("DetachPane").field("pane_id", pane_id).finish()
            }
            Self::SetExternalText { pane_id, text } => f
                .debug_struct("SetExternalText")
                .field("pane_id", pane_id)
                .field("len", &text.len())
                .finish(),
            Self::Submit { source } => f.debug_struct("Submit").field("source", source).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Notification from the mirroring runtime back to the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellNotification {
    /// Handshake done and input element bound.
    PaneReady { pane_id: PaneId, selector: String },

    /// No descriptor matched within the retry budget. The shell should try
    /// its OCR fallback with `candidate_texts`.
    ElementNotFound {
        pane_id: PaneId,
        kind: PaneKind,
        candidate_texts: Vec<String>,
    },

    /// The pane never reached the host channel; it accepts inbound text
    /// but its user input is not mirrored.
    BridgeUnavailable { pane_id: PaneId },

    /// The bound input element disappeared.
    InputDetached { pane_id: PaneId },

    /// A new input element was bound after a re-render or navigation.
    InputReattached { pane_id: PaneId, selector: String },

    /// The reply to a submitted prompt stopped changing.
    AnswerReady { pane_id: PaneId, text: String },

    /// The reply did not settle in time.
    AnswerTimedOut { pane_id: PaneId, last_text: String },

    /// The pane task finished and its registration is gone.
    PaneDetached { pane_id: PaneId },

    /// A request could not be carried out.
    Error(String),

    /// The runtime is shutting down.
    Shutdown,
}

/// Owns the background tokio thread that runs the mirroring core.
pub struct MirrorRuntime {
    /// Send requests to the core (tokio-side).
    request_tx: flume::Sender<ShellRequest>,

    /// Receive notifications from the core (shell-side polls this).
    notification_rx: flume::Receiver<ShellNotification>,

    _tokio_thread: thread::JoinHandle<()>,

    shutdown: Arc<AtomicBool>,
}

impl MirrorRuntime {
    /// Validate `config` and start the runtime thread.
    pub fn new(config: MirrorConfig) -> Result<Self> {
        config.validate()?;

        let (request_tx, request_rx) = flume::unbounded::<ShellRequest>();
        let (notification_tx, notification_rx) = flume::unbounded::<ShellNotification>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let tokio_thread = thread::Builder::new()
            .name("multidesk-tokio-runtime".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("multidesk-tokio-worker")
                    .enable_all()
                    .build()
                    .expect("failed to create tokio runtime for mirroring");

                rt.block_on(host_loop(config, request_rx, notification_tx));

                shutdown_flag.store(true, Ordering::Release);
            })
            .expect("failed to spawn multidesk tokio thread");

        Ok(Self {
            request_tx,
            notification_rx,
            _tokio_thread: tokio_thread,
            shutdown,
        })
    }

    /// Send a request to the core (non-blocking).
    ///
    /// Returns `Err` if the runtime has shut down.
    pub fn send_request(
        &self,
        request: ShellRequest,
    ) -> std::result::Result<(), flume::SendError<ShellRequest>> {
        self.request_tx.send(request)
    }

    /// `Ok(None)` when nothing is pending, `Err` once the runtime is gone.
    pub fn try_recv_notification(
        &self,
    ) -> std::result::Result<Option<ShellNotification>, flume::RecvError> {
        match self.notification_rx.try_recv() {
            Ok(note) => Ok(Some(note)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(flume::RecvError::Disconnected),
        }
    }

    /// Receive a notification (blocking).
    pub fn recv_notification(&self) -> std::result::Result<ShellNotification, flume::RecvError> {
        self.notification_rx.recv()
    }

    /// For shells that poll from their own async executor via `recv_async()`.
    pub fn notification_receiver(&self) -> &flume::Receiver<ShellNotification> {
        &self.notification_rx
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        let _ = self.request_tx.send(ShellRequest::Shutdown);
    }
}

impl Drop for MirrorRuntime {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.request_shutdown();
        }
    }
}

async fn host_loop(
    config: MirrorConfig,
    requests: flume::Receiver<ShellRequest>,
    notifications: flume::Sender<ShellNotification>,
) {
    let bridge = Bridge::new();
    let cancel = CancellationToken::new();
    let coordinator = MirrorCoordinator::new(&bridge);
    let coordinator_task = tokio::spawn(coordinator.run(cancel.child_token()));

    let host = HostContext {
        bridge: bridge.clone(),
        guard: EchoGuard::new(),
        config: Arc::new(config),
        notifications: notifications.clone(),
    };
    let mut panes: HashMap<PaneId, PaneHandle> = HashMap::new();
    tracing::info!("Mirroring runtime started");

    while let Ok(request) = requests.recv_async().await {
        tracing::trace!("Shell request: {request:?}");
        match request {
            ShellRequest::AttachPane {
                pane_id,
                kind,
                document,
            } => match spawn_pane(&host, pane_id, kind, document, cancel.child_token()) {
                Ok(handle) => {
                    panes.insert(pane_id, handle);
                }
                Err(e) => {
                    tracing::warn!("Pane {pane_id}: attach failed: {e}");
                    host.notify(ShellNotification::Error(e.to_string()));
                }
            },
            ShellRequest::DetachPane { pane_id } => match panes.remove(&pane_id) {
                Some(handle) => handle.close().await,
                None => host.notify(ShellNotification::Error(format!(
                    "pane {pane_id} is not attached"
                ))),
            },
            ShellRequest::SetExternalText { pane_id, text } => {
                if !bridge.set_external_text(pane_id, &text) {
                    host.notify(ShellNotification::Error(
                        MirrorError::PaneClosed { pane_id }.to_string(),
                    ));
                }
            }
            ShellRequest::Submit { source } => {
                let submitted = bridge.broadcast_submit(source);
                tracing::info!("Prompt submitted to panes {submitted:?}");
            }
            ShellRequest::Shutdown => break,
        }
    }

    for (_, handle) in panes.drain() {
        handle.close().await;
    }
    cancel.cancel();
    if let Err(e) = coordinator_task.await {
        tracing::error!("Mirror coordinator ended abnormally: {e}");
    }
    tracing::info!("Mirroring runtime stopped");
    let _ = notifications.send(ShellNotification::Shutdown);
}
