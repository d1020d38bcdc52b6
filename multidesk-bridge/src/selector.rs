//! Selector resolution.
//!
//! Hosted chat pages render their composer late and rename its attributes
//! often, so each pane kind carries an ordered list of descriptors. The first
//! descriptor with an attached, visible match wins. While nothing matches the
//! resolver retries on a fixed interval until its budget is spent, then
//! reports [`MirrorError::ElementNotFound`] so the shell can fall back to OCR.

use crate::config::RetryPolicy;
use crate::document::{Document, ElementId, PaneId};
use crate::error::{MirrorError, Result};
use tokio_util::sync::CancellationToken;

/// An input element found by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub element: ElementId,
    /// Index of the descriptor that matched, in priority order.
    pub selector_index: usize,
    pub selector: String,
}

/// Single resolution pass over `selectors` in priority order.
///
/// Within one descriptor, hidden or detached matches are skipped in favour of
/// a later visible match. Lower-priority descriptors are not consulted once a
/// higher one produced a usable element.
pub fn resolve_once<S: AsRef<str>>(document: &dyn Document, selectors: &[S]) -> Option<Resolved> {
    for (index, selector) in selectors.iter().enumerate() {
        let selector = selector.as_ref();
        let usable = document.query_selector_all(selector).into_iter().find(|el| {
            document
                .element_state(*el)
                .is_some_and(|state| state.is_usable())
        });
        if let Some(element) = usable {
            return Some(Resolved {
                element,
                selector_index: index,
                selector: selector.to_string(),
            });
        }
    }
    None
}

/// Resolves the input element of one pane with bounded retries.
#[derive(Debug, Clone)]
pub struct SelectorResolver {
    pane_id: PaneId,
    selectors: Vec<String>,
    policy: RetryPolicy,
}

impl SelectorResolver {
    pub fn new(pane_id: PaneId, selectors: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            pane_id,
            selectors,
            policy,
        }
    }

    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// One pass, no retry.
    pub fn resolve_now(&self, document: &dyn Document) -> Option<Resolved> {
        resolve_once(document, &self.selectors)
    }

    /// Resolve, retrying every `policy.interval()` for at most
    /// `policy.max_attempts` passes in total.
    pub async fn resolve(
        &self,
        document: &dyn Document,
        cancel: &CancellationToken,
    ) -> Result<Resolved> {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            if let Some(found) = self.resolve_now(document) {
                tracing::debug!(
                    "Pane {}: input bound via selector {}/{} `{}` on attempt {attempt}",
                    self.pane_id,
                    found.selector_index + 1,
                    self.selectors.len(),
                    found.selector
                );
                return Ok(found);
            }
            if attempt == max_attempts {
                break;
            }
            tracing::debug!(
                "Pane {}: no input element yet ({:?}, attempt {attempt}/{max_attempts})",
                self.pane_id,
                document.ready_state()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
                _ = tokio::time::sleep(self.policy.interval()) => {}
            }
        }

        tracing::warn!(
            "Pane {}: none of {} input selectors matched after {max_attempts} attempts ({})",
            self.pane_id,
            self.selectors.len(),
            document.url()
        );
        Err(MirrorError::ElementNotFound {
            pane_id: self.pane_id,
            attempts: max_attempts,
        })
    }
}
