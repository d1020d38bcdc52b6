//! The embedded-document seam.
//!
//! Panes host third-party chat pages inside an embedded browser. The bridge
//! never renders or loads those pages itself; it talks to each page's script
//! context through the [`Document`] trait. A shell backed by a real webview
//! implements the trait by evaluating small scripts in the page; tests use an
//! in-memory DOM.
//!
//! Element handles are opaque and owned by the document. A handle may go
//! stale at any time (client-side re-render, SPA navigation), which is why
//! every accessor returns an `Option`.

use std::fmt;

/// Stable identifier of a pane, assigned by the shell when the pane is attached.
pub type PaneId = usize;

/// Opaque reference to an element inside one document.
///
/// Handles are never reused by a document for a different node, so comparing
/// two handles is enough to tell whether the bound input element changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "el#{}", self.0)
    }
}

/// Identifier for a listener registration returned by [`Document::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Loading state of a document, as reported by its script context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    #[default]
    Loading,
    Interactive,
    Complete,
}

/// The kind of input element, which decides how its text is read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// `<textarea>`.
    TextArea,
    /// `<input type="text">` or `<input type="search">`.
    TextInput,
    /// A contenteditable host. `prose_mirror` marks ProseMirror editors,
    /// which need an extra keydown before they pick up programmatic text.
    ContentEditable { prose_mirror: bool },
    /// Anything else a descriptor happened to match.
    Other,
}

impl ElementKind {
    /// The property that holds the user-visible text for this kind.
    pub fn text_property(self) -> TextProperty {
        match self {
            Self::TextArea | Self::TextInput => TextProperty::Value,
            Self::ContentEditable { .. } => TextProperty::InnerText,
            Self::Other => TextProperty::TextContent,
        }
    }
}

/// Which text-bearing property of an element to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextProperty {
    /// The form-control `value`.
    Value,
    /// The rendered inner text (no markup).
    InnerText,
    /// The raw text content of the node.
    TextContent,
}

/// Layout and style facts about an element at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementState {
    pub kind: ElementKind,
    /// Whether the node is still connected to the document.
    pub connected: bool,
    /// Rendered width in CSS pixels.
    pub width: f64,
    /// Rendered height in CSS pixels.
    pub height: f64,
    /// Computed `display: none` on the element or an ancestor.
    pub display_none: bool,
    /// Computed `visibility: hidden`.
    pub visibility_hidden: bool,
}

impl ElementState {
    /// Non-zero rendered area and not hidden through styling.
    pub fn is_visible(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && !self.display_none && !self.visibility_hidden
    }

    /// Attached to the document and visible.
    pub fn is_usable(&self) -> bool {
        self.connected && self.is_visible()
    }
}

/// Change notifications an element can emit or have synthesized on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Input,
    Change,
    KeyUp,
    KeyDown,
    Paste,
}

impl EventKind {
    /// The notifications that together capture typed, pasted and composed input.
    pub const TEXT_CHANGED: [EventKind; 3] = [EventKind::Input, EventKind::KeyUp, EventKind::Paste];

    /// The notifications synthesized after a programmatic write, in dispatch order.
    pub const SYNTHETIC_EDIT: [EventKind; 3] =
        [EventKind::Input, EventKind::Change, EventKind::KeyUp];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Change => "change",
            Self::KeyUp => "keyup",
            Self::KeyDown => "keydown",
            Self::Paste => "paste",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification delivered from a document to a registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomEvent {
    pub listener: ListenerId,
    pub element: ElementId,
    pub kind: EventKind,
}

/// The operations the bridge needs from one embedded document's script context.
///
/// Implementations must be cheap to call from the pane's event loop; none of
/// these methods may block on page I/O.
pub trait Document: Send + Sync {
    /// Current URL, for logging.
    fn url(&self) -> String;

    fn ready_state(&self) -> ReadyState;

    /// All elements matching `selector`, in document order.
    fn query_selector_all(&self, selector: &str) -> Vec<ElementId>;

    /// Layout facts for `element`, or `None` if the handle no longer refers
    /// to a live node.
    fn element_state(&self, element: ElementId) -> Option<ElementState>;

    fn read_text(&self, element: ElementId, property: TextProperty) -> Option<String>;

    /// Returns `false` if the element is gone.
    fn write_text(&self, element: ElementId, property: TextProperty, text: &str) -> bool;

    fn scroll_top(&self, element: ElementId) -> Option<f64>;

    fn set_scroll_top(&self, element: ElementId, offset: f64);

    fn focus(&self, element: ElementId);

    fn click(&self, element: ElementId) -> bool;

    /// Synthesize a bubbling, cancelable notification on `element`.
    ///
    /// Registered listeners observe synthesized notifications exactly like
    /// real ones, which is what makes echo suppression necessary.
    fn dispatch(&self, element: ElementId, kind: EventKind);

    /// Deliver `kinds` notifications fired on `element` to `sink`.
    fn add_listener(
        &self,
        element: ElementId,
        kinds: &[EventKind],
        sink: flume::Sender<DomEvent>,
    ) -> Option<ListenerId>;

    fn remove_listener(&self, listener: ListenerId);
}

/// Read the user-visible text of `element` according to its kind.
///
/// Text boxes report their value, rich editors their rendered inner text.
pub fn extract_text(document: &dyn Document, element: ElementId) -> Option<String> {
    let state = document.element_state(element)?;
    match state.kind {
        ElementKind::ContentEditable { .. } => document
            .read_text(element, TextProperty::InnerText)
            .or_else(|| document.read_text(element, TextProperty::TextContent)),
        kind => document.read_text(element, kind.text_property()),
    }
}
