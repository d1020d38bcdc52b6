//! Error taxonomy for the mirroring core.
//!
//! Every failure here is recoverable locally (retry, re-resolve, OCR
//! fallback). Only permanent exhaustion leaves the core, and then as a
//! status the shell can act on, never as a process-terminating error.

use crate::document::PaneId;

/// Error type for bridge and mirroring operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    /// No selector descriptor produced a visible, attached element.
    #[error("input element not found in pane {pane_id} after {attempts} attempts")]
    ElementNotFound { pane_id: PaneId, attempts: u32 },

    /// The host side of the bridge was not available to the pane.
    #[error("bridge not ready for pane {pane_id} after {attempts} attempts")]
    BridgeNotReady { pane_id: PaneId, attempts: u32 },

    /// The bound element is no longer attached to its document.
    #[error("input element of pane {pane_id} is no longer attached")]
    StaleElementReference { pane_id: PaneId },

    /// The pane has been detached or is shutting down.
    #[error("pane {pane_id} is closed")]
    PaneClosed { pane_id: PaneId },

    /// The operation was cancelled because its pane is going away.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Called outside a tokio runtime, so the delayed echo-marker release
    /// could not be scheduled.
    #[error("no tokio runtime to schedule the echo marker release")]
    NoRuntime,
}

impl MirrorError {
    /// Whether the shell should offer the OCR fallback for this error.
    pub fn wants_ocr_fallback(&self) -> bool {
        matches!(self, Self::ElementNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
