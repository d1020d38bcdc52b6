//! The bridge between pane script contexts and the host.
//!
//! One [`Bridge`] exists per process. It owns the registration table that
//! maps each pane id to the pane-side command channel, and the host-side
//! event channel that carries user input to the mirror coordinator.
//!
//! ```text
//! ┌───────────────┐  on_user_input   ┌──────────┐  MirrorEvent   ┌─────────────┐
//! │ pane context  │ ───────────────► │  Bridge  │ ─────────────► │ coordinator │
//! │ (per document)│ ◄─────────────── │ registry │ ◄───────────── │  (host)     │
//! └───────────────┘   PaneCommand    └──────────┘ set_external_  └─────────────┘
//!                                                 text
//! ```
//!
//! Fan-out reads the registry through a snapshot, so attach and detach never
//! race with an iteration in progress.

use crate::config::{PaneKind, RetryPolicy};
use crate::document::{Document, ElementId, ElementKind, EventKind, PaneId};
use crate::error::{MirrorError, Result};
use crate::listener::EchoGuard;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Commands queued per pane before backpressure applies to fan-out.
const PANE_COMMAND_CAPACITY: usize = 64;

/// A user edit travelling from a pane to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEvent {
    pub source: PaneId,
    pub text: String,
    pub timestamp: Instant,
    /// Bridge-wide sequence number, increasing in send order.
    pub seq: u64,
}

/// Host-to-pane operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneCommand {
    /// Replace the pane's input text without re-triggering mirroring.
    SetExternalText(String),
    /// Click the pane's send button and watch for the reply.
    Submit,
}

/// One registration table entry.
#[derive(Debug)]
pub(crate) struct PaneSlot {
    pub pane_id: PaneId,
    pub kind: PaneKind,
    commands: flume::Sender<PaneCommand>,
    /// Last text pushed into this pane by the host.
    last_mirrored: Mutex<Option<String>>,
}

impl PaneSlot {
    pub fn last_mirrored(&self) -> Option<String> {
        self.last_mirrored.lock().clone()
    }

    pub fn clear_last_mirrored(&self) {
        *self.last_mirrored.lock() = None;
    }
}

struct BridgeInner {
    /// Registered panes in registration order.
    panes: RwLock<Vec<Arc<PaneSlot>>>,
    /// Host-side sink for user input; `None` until a coordinator connects.
    host: RwLock<Option<flume::Sender<MirrorEvent>>>,
    next_seq: AtomicU64,
    /// Sequence number of the newest event sent by each pane.
    latest: Mutex<HashMap<PaneId, u64>>,
}

/// Process-wide channel between pane script contexts and the host.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                panes: RwLock::new(Vec::new()),
                host: RwLock::new(None),
                next_seq: AtomicU64::new(1),
                latest: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install the host-side event sink. Panes can complete their handshake
    /// from this point on.
    pub fn connect_host(&self, sink: flume::Sender<MirrorEvent>) {
        *self.inner.host.write() = Some(sink);
        tracing::debug!("Bridge host channel connected");
    }

    pub fn disconnect_host(&self) {
        *self.inner.host.write() = None;
    }

    pub fn is_host_ready(&self) -> bool {
        self.inner
            .host
            .read()
            .as_ref()
            .is_some_and(|tx| !tx.is_disconnected())
    }

    /// Add `pane_id` to the registration table and return the receiving end
    /// of its command channel.
    pub fn register(
        &self,
        pane_id: PaneId,
        kind: PaneKind,
    ) -> Result<flume::Receiver<PaneCommand>> {
        let mut panes = self.inner.panes.write();
        if panes.iter().any(|slot| slot.pane_id == pane_id) {
            return Err(MirrorError::Config(format!(
                "pane {pane_id} is already registered"
            )));
        }
        let (tx, rx) = flume::bounded(PANE_COMMAND_CAPACITY);
        panes.push(Arc::new(PaneSlot {
            pane_id,
            kind,
            commands: tx,
            last_mirrored: Mutex::new(None),
        }));
        tracing::info!("Bridge: registered pane {pane_id} ({kind})");
        Ok(rx)
    }

    /// Remove `pane_id`. Commands already queued for it are dropped with the
    /// channel.
    pub fn unregister(&self, pane_id: PaneId) -> bool {
        let removed = {
            let mut panes = self.inner.panes.write();
            let before = panes.len();
            panes.retain(|slot| slot.pane_id != pane_id);
            panes.len() != before
        };
        self.inner.latest.lock().remove(&pane_id);
        if removed {
            tracing::info!("Bridge: unregistered pane {pane_id}");
        }
        removed
    }

    pub fn is_registered(&self, pane_id: PaneId) -> bool {
        self.inner.panes.read().iter().any(|s| s.pane_id == pane_id)
    }

    /// Registered pane ids in registration order.
    pub fn pane_ids(&self) -> Vec<PaneId> {
        self.inner.panes.read().iter().map(|s| s.pane_id).collect()
    }

    /// Copy of the registration table for iteration outside the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<PaneSlot>> {
        self.inner.panes.read().clone()
    }

    pub(crate) fn slot(&self, pane_id: PaneId) -> Option<Arc<PaneSlot>> {
        self.inner
            .panes
            .read()
            .iter()
            .find(|s| s.pane_id == pane_id)
            .cloned()
    }

    /// Sequence number of the newest event `pane_id` has sent, or 0.
    pub fn latest_seq(&self, pane_id: PaneId) -> u64 {
        self.inner.latest.lock().get(&pane_id).copied().unwrap_or(0)
    }

    /// Wait for the host side to become available, polling on `policy`.
    pub async fn handshake(
        &self,
        pane_id: PaneId,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<PaneChannel> {
        let max_attempts = policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if self.is_host_ready() {
                tracing::debug!("Pane {pane_id}: bridge handshake complete (attempt {attempt})");
                return Ok(PaneChannel {
                    pane_id,
                    bridge: self.clone(),
                });
            }
            if attempt == max_attempts {
                break;
            }
            tracing::debug!(
                "Pane {pane_id}: host channel not available yet (attempt {attempt}/{max_attempts})"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
                _ = tokio::time::sleep(policy.interval()) => {}
            }
        }
        tracing::warn!("Pane {pane_id}: bridge handshake failed after {max_attempts} attempts");
        Err(MirrorError::BridgeNotReady {
            pane_id,
            attempts: max_attempts,
        })
    }

    /// Pane to host: report a user edit.
    ///
    /// Fails with [`MirrorError::BridgeNotReady`] when no coordinator is
    /// connected; that is expected while a page is still loading and is only
    /// logged.
    pub fn on_user_input(&self, pane_id: PaneId, text: &str) -> Result<()> {
        let host = self.inner.host.read().clone();
        let Some(host) = host else {
            tracing::warn!("Pane {pane_id}: host channel not initialized, input not mirrored");
            return Err(MirrorError::BridgeNotReady {
                pane_id,
                attempts: 1,
            });
        };

        // Record the sequence before sending so the coordinator never sees
        // an event newer than `latest`.
        let seq = {
            let mut latest = self.inner.latest.lock();
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            latest.insert(pane_id, seq);
            seq
        };
        let event = MirrorEvent {
            source: pane_id,
            text: text.to_string(),
            timestamp: Instant::now(),
            seq,
        };
        host.send(event).map_err(|_| {
            tracing::warn!("Pane {pane_id}: host channel closed, input not mirrored");
            MirrorError::BridgeNotReady {
                pane_id,
                attempts: 1,
            }
        })
    }

    /// Host to pane: queue a text replacement. Fire-and-forget; returns
    /// `false` if the pane is gone or its queue is full.
    pub fn set_external_text(&self, pane_id: PaneId, text: &str) -> bool {
        let Some(slot) = self.slot(pane_id) else {
            tracing::debug!("set_external_text: pane {pane_id} is not registered");
            return false;
        };
        *slot.last_mirrored.lock() = Some(text.to_string());
        match slot.commands.try_send(PaneCommand::SetExternalText(text.to_string())) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("set_external_text: pane {pane_id} unavailable: {e}");
                false
            }
        }
    }

    /// Like [`set_external_text`](Self::set_external_text) but waits for
    /// queue space instead of failing when the pane is busy.
    pub(crate) async fn push_text(&self, slot: &PaneSlot, text: &str) -> bool {
        *slot.last_mirrored.lock() = Some(text.to_string());
        slot.commands
            .send_async(PaneCommand::SetExternalText(text.to_string()))
            .await
            .is_ok()
    }

    /// Ask every pane except `source` to submit its prompt. Returns the panes
    /// that accepted the command.
    pub fn broadcast_submit(&self, source: Option<PaneId>) -> Vec<PaneId> {
        self.snapshot()
            .into_iter()
            .filter(|slot| Some(slot.pane_id) != source)
            .filter(|slot| slot.commands.try_send(PaneCommand::Submit).is_ok())
            .map(|slot| slot.pane_id)
            .collect()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("panes", &self.pane_ids())
            .field("host_ready", &self.is_host_ready())
            .finish()
    }
}

/// The pane-side end of the bridge, handed out by a successful handshake.
#[derive(Debug, Clone)]
pub struct PaneChannel {
    pane_id: PaneId,
    bridge: Bridge,
}

impl PaneChannel {
    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    pub fn on_user_input(&self, text: &str) -> Result<()> {
        self.bridge.on_user_input(self.pane_id, text)
    }
}

/// Pane side of `set_external_text`: write `text` into `element`.
///
/// The write is bracketed by the pane's echo marker, which is released only
/// after `clear_delay` so notifications the page handles late are still
/// recognised as programmatic. The page receives the same notifications a
/// real edit would produce, and the element keeps its scroll offset.
///
/// Must be called from within a tokio runtime; otherwise the page is left
/// untouched and [`MirrorError::NoRuntime`] is returned.
pub fn apply_external_text(
    document: &dyn Document,
    pane_id: PaneId,
    element: ElementId,
    text: &str,
    guard: &EchoGuard,
    clear_delay: Duration,
) -> Result<()> {
    let runtime = Handle::try_current().map_err(|_| MirrorError::NoRuntime)?;
    guard.begin(pane_id);

    let Some(state) = document.element_state(element).filter(|s| s.connected) else {
        guard.end(pane_id);
        return Err(MirrorError::StaleElementReference { pane_id });
    };
    let scroll_top = document.scroll_top(element);

    document.focus(element);
    if !document.write_text(element, state.kind.text_property(), text) {
        guard.end(pane_id);
        return Err(MirrorError::StaleElementReference { pane_id });
    }

    for kind in EventKind::SYNTHETIC_EDIT {
        document.dispatch(element, kind);
    }
    if let ElementKind::ContentEditable { prose_mirror: true } = state.kind {
        document.dispatch(element, EventKind::KeyDown);
    }

    if let Some(offset) = scroll_top {
        document.set_scroll_top(element, offset);
    }

    guard.schedule_end(&runtime, pane_id, clear_delay);
    Ok(())
}
