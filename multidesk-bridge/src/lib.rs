//! # multidesk-bridge
//!
//! Cross-pane input mirroring for a desktop shell that embeds several hosted
//! AI chat pages side by side. Text typed into one pane's prompt box is
//! written into every other pane's prompt box, without the written text
//! bouncing back as a new edit.
//!
//! ## Architecture
//!
//! ```text
//! shell  ←→  MirrorRuntime (flume)  ←→  tokio thread
//!                                         ├─ MirrorCoordinator (host)
//!                                         ├─ Bridge (registration table)
//!                                         └─ pane task × N (script contexts)
//! ```
//!
//! - **Document**: the seam to one embedded page's DOM
//! - **SelectorResolver**: finds the prompt box via prioritized descriptors
//! - **InjectionListener**: forwards user edits, suppresses programmatic ones
//! - **Bridge**: pane ⇄ host message passing with a snapshot-read pane table
//! - **MirrorCoordinator**: serialized, latest-write-wins fan-out
//! - **ResilienceMonitor**: rebinds the prompt box after re-renders
//! - **OcrFallback**: shell-provided screen-text fallback when nothing matches

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod listener;
pub mod logging;
pub mod monitor;
pub mod ocr;
pub mod pane;
pub mod reply;
pub mod runtime;
pub mod selector;

#[cfg(test)]
mod testing;

pub use bridge::{apply_external_text, Bridge, MirrorEvent, PaneChannel, PaneCommand};
pub use config::{MirrorConfig, PaneKind, PaneProfile, RetryPolicy};
pub use coordinator::{CycleOutcome, CycleReport, MirrorCoordinator};
pub use document::{Document, DomEvent, ElementId, ElementKind, EventKind, PaneId};
pub use error::{MirrorError, Result};
pub use listener::{ChangeDisposition, EchoGuard, InjectionListener};
pub use monitor::{InputStatus, MonitorOutcome, ResilienceMonitor};
pub use ocr::{NoOcr, OcrFallback};
pub use runtime::{MirrorRuntime, ShellNotification, ShellRequest};
pub use selector::{Resolved, SelectorResolver};
