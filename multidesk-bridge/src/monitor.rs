//! Resilience monitor.
//!
//! Hosted pages replace their DOM whenever they like (client-side re-render,
//! SPA navigation) without telling the host. The monitor re-runs selector
//! resolution on a slow period and moves the pane's listener to whatever
//! element now matches.

use crate::document::{Document, ElementId, PaneId};
use crate::error::MirrorError;
use crate::listener::{AttachOutcome, InjectionListener};
use crate::selector::SelectorResolver;

/// Whether a pane's input element is currently bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    /// Never resolved since the pane started.
    Unbound,
    Bound(ElementId),
    /// Resolved at some point, lost since.
    Detached,
}

/// Result of one periodic check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The bound element still matches.
    Unchanged,
    /// The listener moved to a new element.
    Rebound {
        previous: Option<ElementId>,
        element: ElementId,
        selector: String,
    },
    /// The bound element is gone and nothing replaced it.
    Lost { previous: ElementId },
    /// Still nothing to bind to.
    StillMissing,
}

#[derive(Debug)]
pub struct ResilienceMonitor {
    pane_id: PaneId,
    resolver: SelectorResolver,
    status: InputStatus,
    checks: u64,
}

impl ResilienceMonitor {
    pub fn new(pane_id: PaneId, resolver: SelectorResolver) -> Self {
        Self {
            pane_id,
            resolver,
            status: InputStatus::Unbound,
            checks: 0,
        }
    }

    pub fn status(&self) -> InputStatus {
        self.status
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }

    /// Record the element bound by the initial resolution.
    pub fn mark_bound(&mut self, element: ElementId) {
        self.status = InputStatus::Bound(element);
    }

    /// Re-resolve once and rebind `listener` if the match moved.
    pub fn check(
        &mut self,
        document: &dyn Document,
        listener: &mut InjectionListener,
    ) -> MonitorOutcome {
        self.checks += 1;
        let previous = listener.bound_element();

        let Some(found) = self.resolver.resolve_now(document) else {
            return match self.status {
                InputStatus::Bound(element) => {
                    listener.detach(document);
                    self.status = InputStatus::Detached;
                    let stale = MirrorError::StaleElementReference {
                        pane_id: self.pane_id,
                    };
                    tracing::debug!("{stale}");
                    tracing::info!(
                        "Pane {}: input element {element} lost, will keep looking",
                        self.pane_id
                    );
                    MonitorOutcome::Lost { previous: element }
                }
                InputStatus::Unbound | InputStatus::Detached => MonitorOutcome::StillMissing,
            };
        };

        if previous == Some(found.element) {
            self.status = InputStatus::Bound(found.element);
            return MonitorOutcome::Unchanged;
        }

        match listener.attach(document, found.element) {
            AttachOutcome::Attached | AttachOutcome::AlreadyAttached => {
                tracing::info!(
                    "Pane {}: input rebound to {} via `{}` (was {:?})",
                    self.pane_id,
                    found.element,
                    found.selector,
                    previous
                );
                self.status = InputStatus::Bound(found.element);
                MonitorOutcome::Rebound {
                    previous,
                    element: found.element,
                    selector: found.selector,
                }
            }
            AttachOutcome::ElementGone => {
                // Matched and vanished within the same pass; next check retries.
                if let InputStatus::Bound(element) = self.status {
                    self.status = InputStatus::Detached;
                    MonitorOutcome::Lost { previous: element }
                } else {
                    MonitorOutcome::StillMissing
                }
            }
        }
    }
}
