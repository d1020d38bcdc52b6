//! Per-pane event loop.
//!
//! Each attached pane runs one task that plays the part of the page's script
//! context: it completes the bridge handshake, binds the input element,
//! applies text pushed by the host, forwards user edits and runs the periodic
//! resilience check. The task is cooperative; nothing in it blocks, and every
//! wait is a timer or channel receive that also watches the pane's
//! cancellation token.

use crate::bridge::{apply_external_text, Bridge, PaneChannel, PaneCommand};
use crate::config::{MirrorConfig, PaneKind, PaneProfile};
use crate::document::{Document, DomEvent, PaneId};
use crate::error::{MirrorError, Result};
use crate::listener::{AttachOutcome, ChangeDisposition, EchoGuard, InjectionListener};
use crate::monitor::{MonitorOutcome, ResilienceMonitor};
use crate::reply::{ReplyOutcome, ReplyWatcher};
use crate::runtime::ShellNotification;
use crate::selector::{resolve_once, Resolved, SelectorResolver};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Host-side state shared by every pane task.
#[derive(Clone)]
pub(crate) struct HostContext {
    pub bridge: Bridge,
    pub guard: EchoGuard,
    pub config: Arc<MirrorConfig>,
    pub notifications: flume::Sender<ShellNotification>,
}

impl HostContext {
    pub fn notify(&self, notification: ShellNotification) {
        // The shell may already be gone during shutdown.
        let _ = self.notifications.send(notification);
    }
}

/// Owner's handle on a running pane task.
#[derive(Debug)]
pub struct PaneHandle {
    pane_id: PaneId,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl PaneHandle {
    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel the pane and wait for its cleanup to finish.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::error!("Pane {}: task ended abnormally: {e}", self.pane_id);
        }
    }
}

/// Register `pane_id` with the bridge and start its task.
///
/// Registration happens before this returns, so fan-out started right after
/// attach already includes the pane.
pub(crate) fn spawn_pane(
    host: &HostContext,
    pane_id: PaneId,
    kind: PaneKind,
    document: Arc<dyn Document>,
    cancel: CancellationToken,
) -> Result<PaneHandle> {
    let commands = host.bridge.register(pane_id, kind)?;
    let profile = host.config.profile(kind);
    let resolver = SelectorResolver::new(
        pane_id,
        profile.input_selectors.clone(),
        host.config.selector_retry,
    );
    tracing::info!(
        "Pane {pane_id}: attaching {kind} at {} ({} input selectors)",
        document.url(),
        profile.input_selectors.len()
    );
    let task = PaneTask {
        pane_id,
        kind,
        profile,
        document,
        host: host.clone(),
        resolver,
        cancel: cancel.clone(),
    };
    let join = tokio::spawn(task.run(commands));
    Ok(PaneHandle {
        pane_id,
        cancel,
        join,
    })
}

/// A pending re-read of the input after an edit could not be forwarded.
#[derive(Debug, Clone, Copy)]
struct Recheck {
    at: Instant,
    attempts: u32,
}

enum Startup {
    /// Handshake done and input bound.
    Bound(PaneChannel, Resolved),
    /// Handshake done, no input element yet.
    Unbound(PaneChannel, MirrorError),
    /// No host channel; the pane only accepts inbound commands.
    Inert(MirrorError),
}

struct PaneTask {
    pane_id: PaneId,
    kind: PaneKind,
    profile: PaneProfile,
    document: Arc<dyn Document>,
    host: HostContext,
    resolver: SelectorResolver,
    cancel: CancellationToken,
}

impl PaneTask {
    async fn startup(&self) -> Startup {
        let channel = match self
            .host
            .bridge
            .handshake(self.pane_id, self.host.config.handshake_retry, &self.cancel)
            .await
        {
            Ok(channel) => channel,
            Err(e) => return Startup::Inert(e),
        };
        match self.resolver.resolve(self.document.as_ref(), &self.cancel).await {
            Ok(found) => Startup::Bound(channel, found),
            Err(e) => Startup::Unbound(channel, e),
        }
    }

    fn new_listener(
        &self,
        channel: PaneChannel,
        sink: flume::Sender<DomEvent>,
    ) -> InjectionListener {
        InjectionListener::new(
            self.pane_id,
            self.host.guard.clone(),
            sink,
            move |text: &str| channel.on_user_input(text),
        )
    }

    /// Schedule another look at the input when `disposition` may have left
    /// a user edit behind. Suppressed edits wait for the echo marker to
    /// clear, undelivered ones for the host channel.
    fn next_recheck(&self, disposition: &ChangeDisposition, attempts: u32) -> Option<Recheck> {
        let delay = match disposition {
            ChangeDisposition::Suppressed => self.host.config.echo_clear_delay(),
            ChangeDisposition::Undelivered => self.host.config.handshake_retry.interval(),
            _ => return None,
        };
        if attempts >= self.host.config.handshake_retry.max_attempts {
            tracing::warn!(
                "Pane {}: input still not mirrored after {attempts} rechecks",
                self.pane_id
            );
            return None;
        }
        Some(Recheck {
            at: Instant::now() + delay,
            attempts: attempts + 1,
        })
    }

    async fn run(self, commands: flume::Receiver<PaneCommand>) {
        let pane_id = self.pane_id;
        let document = Arc::clone(&self.document);
        let (dom_tx, dom_rx) = flume::unbounded::<DomEvent>();

        let mut listener: Option<InjectionListener> = None;
        let mut monitor = ResilienceMonitor::new(pane_id, self.resolver.clone());
        let mut monitoring = false;
        let mut reply_cancel: Option<CancellationToken> = None;
        let mut recheck: Option<Recheck> = None;

        let period = self.host.config.monitor_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let startup = self.startup();
        tokio::pin!(startup);
        let mut started = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                outcome = &mut startup, if !started => {
                    started = true;
                    match outcome {
                        Startup::Bound(channel, found) => {
                            let mut bound = self.new_listener(channel, dom_tx.clone());
                            let attached = bound.attach(document.as_ref(), found.element);
                            if attached != AttachOutcome::ElementGone {
                                monitor.mark_bound(found.element);
                            }
                            listener = Some(bound);
                            monitoring = true;
                            self.host.notify(ShellNotification::PaneReady {
                                pane_id,
                                selector: found.selector,
                            });
                        }
                        Startup::Unbound(_, MirrorError::Cancelled)
                        | Startup::Inert(MirrorError::Cancelled) => break,
                        Startup::Unbound(channel, _) => {
                            listener = Some(self.new_listener(channel, dom_tx.clone()));
                            monitoring = true;
                            self.host.notify(ShellNotification::ElementNotFound {
                                pane_id,
                                kind: self.kind,
                                candidate_texts: self.profile.candidate_texts.clone(),
                            });
                        }
                        Startup::Inert(e) => {
                            tracing::warn!(
                                "Pane {pane_id}: {e}; user input will not be mirrored"
                            );
                            self.host.notify(ShellNotification::BridgeUnavailable { pane_id });
                        }
                    }
                }

                command = commands.recv_async() => match command {
                    Ok(PaneCommand::SetExternalText(text)) => {
                        self.set_text(&text, listener.as_mut(), &mut monitor);
                    }
                    Ok(PaneCommand::Submit) => {
                        if let Some(previous) = reply_cancel.take() {
                            previous.cancel();
                        }
                        reply_cancel = self.submit();
                    }
                    Err(_) => {
                        tracing::debug!("Pane {pane_id}: command channel closed");
                        break;
                    }
                },

                Ok(event) = dom_rx.recv_async() => {
                    if let Some(listener) = listener.as_mut() {
                        match listener.handle(document.as_ref(), &event) {
                            disposition @ (ChangeDisposition::Suppressed
                            | ChangeDisposition::Undelivered) => {
                                if recheck.is_none() {
                                    recheck = self.next_recheck(&disposition, 0);
                                }
                            }
                            ChangeDisposition::Forwarded(_) | ChangeDisposition::Unchanged => {
                                recheck = None;
                            }
                            ChangeDisposition::Stale | ChangeDisposition::Foreign => {}
                        }
                    }
                }

                _ = tokio::time::sleep_until(recheck.map_or_else(Instant::now, |r| r.at)),
                    if recheck.is_some() =>
                {
                    let attempts = recheck.take().map_or(0, |r| r.attempts);
                    if let Some(listener) = listener.as_mut() {
                        let disposition = listener.recheck(document.as_ref());
                        recheck = self.next_recheck(&disposition, attempts);
                    }
                }

                _ = ticker.tick(), if monitoring => {
                    if let Some(listener) = listener.as_mut() {
                        match monitor.check(document.as_ref(), listener) {
                            MonitorOutcome::Rebound { selector, .. } => {
                                self.host.notify(ShellNotification::InputReattached {
                                    pane_id,
                                    selector,
                                });
                            }
                            MonitorOutcome::Lost { .. } => {
                                self.host.notify(ShellNotification::InputDetached { pane_id });
                            }
                            MonitorOutcome::Unchanged | MonitorOutcome::StillMissing => {}
                        }
                    }
                }
            }
        }

        if let Some(mut listener) = listener.take() {
            listener.detach(document.as_ref());
        }
        self.cancel.cancel();
        self.host.bridge.unregister(pane_id);
        self.host.guard.clear(pane_id);
        tracing::info!(
            "Pane {pane_id}: detached after {} resilience checks",
            monitor.checks()
        );
        self.host.notify(ShellNotification::PaneDetached { pane_id });
    }

    /// Apply text pushed by the host. Uses the bound element when it is
    /// still attached, otherwise resolves once more.
    fn set_text(
        &self,
        text: &str,
        mut listener: Option<&mut InjectionListener>,
        monitor: &mut ResilienceMonitor,
    ) {
        let document = self.document.as_ref();
        let delay = self.host.config.echo_clear_delay();
        let bound = listener.as_ref().and_then(|l| l.bound_element());

        let mut result = match bound {
            Some(element) => {
                apply_external_text(document, self.pane_id, element, text, &self.host.guard, delay)
            }
            None => Err(MirrorError::StaleElementReference {
                pane_id: self.pane_id,
            }),
        };

        if result.is_err() {
            if let Some(found) = self.resolver.resolve_now(document) {
                if let Some(listener) = listener.as_mut() {
                    if Some(found.element) != bound
                        && listener.attach(document, found.element) == AttachOutcome::Attached
                    {
                        monitor.mark_bound(found.element);
                        self.host.notify(ShellNotification::InputReattached {
                            pane_id: self.pane_id,
                            selector: found.selector.clone(),
                        });
                    }
                }
                result = apply_external_text(
                    document,
                    self.pane_id,
                    found.element,
                    text,
                    &self.host.guard,
                    delay,
                );
            }
        }

        match result {
            Ok(()) => {
                if let Some(listener) = listener {
                    listener.note_programmatic(text);
                }
            }
            Err(e) => {
                tracing::warn!("Pane {}: mirrored text not applied: {e}", self.pane_id);
            }
        }
    }

    /// Click the send button and watch for the reply in the background.
    fn submit(&self) -> Option<CancellationToken> {
        let document = self.document.as_ref();
        let Some(button) = resolve_once(document, &self.profile.send_button_selectors) else {
            tracing::warn!("Pane {}: no send button found", self.pane_id);
            self.host.notify(ShellNotification::Error(format!(
                "send button not found in pane {} ({})",
                self.pane_id, self.kind
            )));
            return None;
        };

        let mut watcher = ReplyWatcher::new(
            self.pane_id,
            self.profile.reply_selectors.clone(),
            self.host.config.reply,
        );
        watcher.capture_baseline(document);

        if !document.click(button.element) {
            tracing::warn!("Pane {}: send button vanished before click", self.pane_id);
            return None;
        }
        tracing::debug!("Pane {}: prompt submitted via `{}`", self.pane_id, button.selector);

        let cancel = self.cancel.child_token();
        let watch_cancel = cancel.clone();
        let document = Arc::clone(&self.document);
        let host = self.host.clone();
        let pane_id = self.pane_id;
        tokio::spawn(async move {
            match watcher.watch(document.as_ref(), &watch_cancel).await {
                ReplyOutcome::Ready(text) => {
                    host.notify(ShellNotification::AnswerReady { pane_id, text });
                }
                ReplyOutcome::TimedOut { last_text } => {
                    host.notify(ShellNotification::AnswerTimedOut { pane_id, last_text });
                }
                ReplyOutcome::Cancelled => {}
            }
        });
        Some(cancel)
    }
}
