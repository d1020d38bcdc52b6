//! Host-side mirror coordinator.
//!
//! Consumes [`MirrorEvent`]s one at a time. Each event starts an update cycle
//! that pushes the new text to every other registered pane, in registration
//! order, before the next event is looked at. Within a cycle the coordinator
//! re-checks whether the source has sent something newer; if so the rest of
//! the fan-out is abandoned in favour of the newer text (latest write wins).
//! Panes that already received the older text simply get a second update.
//!
//! Two different sources racing each other are not ordered beyond that:
//! whichever cycle touches a pane last decides what it shows.

use crate::bridge::{Bridge, MirrorEvent};
use crate::document::PaneId;
use tokio_util::sync::CancellationToken;

/// How an update cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every other pane was reached.
    Completed,
    /// A newer event from the same source arrived mid fan-out.
    Superseded,
    /// A newer event from the same source was already queued; nothing sent.
    Stale,
    /// The text equals what the host last pushed into the source pane.
    LoopBack,
}

/// Summary of one update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub source: PaneId,
    pub outcome: CycleOutcome,
    /// Panes that were sent the text, in send order.
    pub delivered: Vec<PaneId>,
}

/// Serializes fan-out of user input across panes.
pub struct MirrorCoordinator {
    bridge: Bridge,
    events: flume::Receiver<MirrorEvent>,
    cycles: u64,
}

impl MirrorCoordinator {
    /// Create the coordinator and connect it to `bridge` as its host side.
    pub fn new(bridge: &Bridge) -> Self {
        let (tx, events) = flume::unbounded();
        bridge.connect_host(tx);
        Self {
            bridge: bridge.clone(),
            events,
            cycles: 0,
        }
    }

    /// Number of cycles processed so far, whatever their outcome.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Process events until `cancel` fires or every pane-side sender is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Mirror coordinator started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            self.process(event).await;
        }
        self.bridge.disconnect_host();
        tracing::info!("Mirror coordinator stopped after {} cycles", self.cycles);
    }

    /// Run one update cycle for `event` to completion.
    pub async fn process(&mut self, event: MirrorEvent) -> CycleReport {
        self.cycles += 1;
        let source = event.source;
        let mut report = CycleReport {
            source,
            outcome: CycleOutcome::Completed,
            delivered: Vec::new(),
        };

        if self.is_superseded(&event) {
            tracing::trace!("Pane {source}: skipping stale event #{}", event.seq);
            report.outcome = CycleOutcome::Stale;
            return report;
        }

        if let Some(slot) = self.bridge.slot(source) {
            if slot.last_mirrored().as_deref() == Some(event.text.as_str()) {
                tracing::debug!("Pane {source}: dropping loop-back of mirrored text");
                report.outcome = CycleOutcome::LoopBack;
                return report;
            }
            // The source now shows its own text; a later echo of what it
            // was sent before is no longer a loop-back.
            slot.clear_last_mirrored();
        }

        tracing::debug!(
            "Pane {source}: mirroring {} chars (event #{}, queued {:?})",
            event.text.chars().count(),
            event.seq,
            event.timestamp.elapsed()
        );

        for slot in self.bridge.snapshot() {
            if slot.pane_id == source {
                continue;
            }
            if self.is_superseded(&event) {
                tracing::debug!(
                    "Pane {source}: fan-out of event #{} superseded after {} panes",
                    event.seq,
                    report.delivered.len()
                );
                report.outcome = CycleOutcome::Superseded;
                return report;
            }
            if self.bridge.push_text(&slot, &event.text).await {
                report.delivered.push(slot.pane_id);
            } else {
                tracing::debug!(
                    "Pane {} ({}): closed during fan-out, update dropped",
                    slot.pane_id,
                    slot.kind
                );
            }
        }
        report
    }

    fn is_superseded(&self, event: &MirrorEvent) -> bool {
        self.bridge.latest_seq(event.source) > event.seq
    }
}

impl std::fmt::Debug for MirrorCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorCoordinator")
            .field("cycles", &self.cycles)
            .field("pending", &self.events.len())
            .finish()
    }
}
