//! Reply stabilization.
//!
//! After a prompt is submitted the page streams its answer into the last
//! reply element. The answer is taken as complete once its text has stopped
//! changing for a number of consecutive polls.

use crate::config::ReplyConfig;
use crate::document::{extract_text, Document, ElementId, PaneId};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Ready(String),
    /// Gave up; carries the last non-empty text seen, possibly partial.
    TimedOut { last_text: String },
    Cancelled,
}

/// Last element matching the first descriptor that matches anything, with
/// its trimmed text.
pub fn last_reply<S: AsRef<str>>(
    document: &dyn Document,
    selectors: &[S],
) -> Option<(ElementId, String)> {
    selectors.iter().find_map(|selector| {
        let element = *document.query_selector_all(selector.as_ref()).last()?;
        let text = extract_text(document, element)?;
        Some((element, text.trim().to_string()))
    })
}

pub fn last_reply_text<S: AsRef<str>>(document: &dyn Document, selectors: &[S]) -> Option<String> {
    last_reply(document, selectors).map(|(_, text)| text)
}

#[derive(Debug, Clone)]
pub struct ReplyWatcher {
    pane_id: PaneId,
    selectors: Vec<String>,
    config: ReplyConfig,
    /// Reply element already on the page before the prompt went out.
    baseline: Option<ElementId>,
}

impl ReplyWatcher {
    pub fn new(pane_id: PaneId, selectors: Vec<String>, config: ReplyConfig) -> Self {
        Self {
            pane_id,
            selectors,
            config,
            baseline: None,
        }
    }

    /// Remember the current last reply element so it is not mistaken for
    /// the answer to the prompt about to be sent. The answer may well have
    /// the same text, so only the element identifies it.
    pub fn capture_baseline(&mut self, document: &dyn Document) {
        self.baseline = last_reply(document, &self.selectors).map(|(element, _)| element);
    }

    pub fn baseline(&self) -> Option<ElementId> {
        self.baseline
    }

    pub async fn watch(&self, document: &dyn Document, cancel: &CancellationToken) -> ReplyOutcome {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let needed = self.config.stable_checks.max(1);

        let mut previous = String::new();
        let mut stable = 0u32;
        let mut waited = Duration::ZERO;

        while stable < needed && waited < timeout {
            tokio::select! {
                _ = cancel.cancelled() => return ReplyOutcome::Cancelled,
                _ = tokio::time::sleep(poll) => {}
            }
            waited += poll;

            let Some((element, current)) = last_reply(document, &self.selectors) else {
                stable = 0;
                previous.clear();
                continue;
            };
            if self.baseline == Some(element) {
                continue;
            }

            if !current.is_empty() && current == previous {
                stable += 1;
            } else {
                previous = current;
                stable = 0;
            }
        }

        if stable < needed {
            tracing::warn!(
                "Pane {}: reply did not stabilize within {:?} ({} chars so far)",
                self.pane_id,
                timeout,
                previous.chars().count()
            );
            return ReplyOutcome::TimedOut { last_text: previous };
        }
        tracing::info!(
            "Pane {}: reply stabilized ({} chars)",
            self.pane_id,
            previous.chars().count()
        );
        ReplyOutcome::Ready(previous)
    }
}
