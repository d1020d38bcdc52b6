//! Screen-text fallback for panes whose input element could not be found.
//!
//! The fallback itself (screen capture, text recognition, synthetic click)
//! lives in the shell. This module only defines the seam and the glue that
//! runs it when the runtime reports [`ShellNotification::ElementNotFound`].

use crate::document::PaneId;
use crate::runtime::ShellNotification;
use serde_json::{json, Map, Value};

/// Locates an input box on screen by its visible placeholder text.
pub trait OcrFallback: Send + Sync {
    fn is_available(&self) -> bool;

    /// Click the first on-screen occurrence of any of `candidate_texts`
    /// inside `pane_id`. Texts are tried in order.
    fn locate_and_click(&self, pane_id: PaneId, candidate_texts: &[String]) -> bool;

    fn debug_info(&self) -> Map<String, Value>;
}

/// Fallback used when the shell has no recognizer installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOcr;

impl OcrFallback for NoOcr {
    fn is_available(&self) -> bool {
        false
    }

    fn locate_and_click(&self, _pane_id: PaneId, _candidate_texts: &[String]) -> bool {
        false
    }

    fn debug_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("available".into(), json!(false));
        info.insert("backend".into(), json!("none"));
        info
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOutcome {
    Clicked,
    NotFound,
    Unavailable,
}

pub fn run_fallback(
    ocr: &dyn OcrFallback,
    pane_id: PaneId,
    candidate_texts: &[String],
) -> FallbackOutcome {
    if !ocr.is_available() {
        let info = Value::Object(ocr.debug_info());
        tracing::warn!("Pane {pane_id}: input not found and no OCR fallback available ({info})");
        return FallbackOutcome::Unavailable;
    }
    if ocr.locate_and_click(pane_id, candidate_texts) {
        tracing::info!("Pane {pane_id}: input box clicked via OCR");
        FallbackOutcome::Clicked
    } else {
        tracing::warn!(
            "Pane {pane_id}: OCR found none of {} candidate texts",
            candidate_texts.len()
        );
        FallbackOutcome::NotFound
    }
}

/// Run the fallback if `notification` asks for it.
pub fn on_notification(
    ocr: &dyn OcrFallback,
    notification: &ShellNotification,
) -> Option<FallbackOutcome> {
    match notification {
        ShellNotification::ElementNotFound {
            pane_id,
            candidate_texts,
            ..
        } => Some(run_fallback(ocr, *pane_id, candidate_texts)),
        _ => None,
    }
}
