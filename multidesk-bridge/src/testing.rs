//! In-memory [`Document`] used by the unit tests.
//!
//! Elements are registered together with the exact descriptor strings they
//! match; there is no selector engine. Simulated user edits fire the same
//! notifications a browser would (`input` then `keyup`), and programmatic
//! writes reset the scroll offset the way real editors tend to.

use crate::document::{
    Document, DomEvent, ElementId, ElementKind, ElementState, EventKind, ListenerId, ReadyState,
    TextProperty,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Node {
    id: ElementId,
    selectors: Vec<String>,
    kind: ElementKind,
    connected: bool,
    width: f64,
    height: f64,
    display_none: bool,
    value: String,
    inner_text: String,
    text_content: String,
    scroll_top: f64,
    clicks: usize,
}

struct Registration {
    element: ElementId,
    kinds: Vec<EventKind>,
    sink: flume::Sender<DomEvent>,
}

struct Inner {
    url: String,
    ready_state: ReadyState,
    next_id: u64,
    next_listener: u64,
    nodes: Vec<Node>,
    listeners: HashMap<ListenerId, Registration>,
    dispatched: Vec<(ElementId, EventKind)>,
    queries: usize,
    focused: Option<ElementId>,
}

pub(crate) struct FakeDocument {
    inner: Mutex<Inner>,
}

impl FakeDocument {
    pub fn new(url: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                url: url.to_string(),
                ready_state: ReadyState::Complete,
                next_id: 1,
                next_listener: 1,
                nodes: Vec::new(),
                listeners: HashMap::new(),
                dispatched: Vec::new(),
                queries: 0,
                focused: None,
            }),
        }
    }

    /// Append a visible element matching `selector`.
    pub fn insert(&self, selector: &str, kind: ElementKind) -> ElementId {
        let mut inner = self.inner.lock();
        let id = ElementId(inner.next_id);
        inner.next_id += 1;
        inner.nodes.push(Node {
            id,
            selectors: vec![selector.to_string()],
            kind,
            connected: true,
            width: 600.0,
            height: 40.0,
            display_none: false,
            value: String::new(),
            inner_text: String::new(),
            text_content: String::new(),
            scroll_top: 0.0,
            clicks: 0,
        });
        id
    }

    pub fn add_selector(&self, element: ElementId, selector: &str) {
        self.with_node(element, |n| n.selectors.push(selector.to_string()));
    }

    pub fn set_hidden(&self, element: ElementId, hidden: bool) {
        self.with_node(element, |n| n.display_none = hidden);
    }

    pub fn set_size(&self, element: ElementId, width: f64, height: f64) {
        self.with_node(element, |n| {
            n.width = width;
            n.height = height;
        });
    }

    /// Disconnect the node but keep its handle resolvable, like a node that
    /// was detached from the tree and is still referenced by script.
    pub fn detach(&self, element: ElementId) {
        self.with_node(element, |n| n.connected = false);
    }

    /// Remove the node entirely.
    pub fn remove(&self, element: ElementId) {
        let mut inner = self.inner.lock();
        inner.nodes.retain(|n| n.id != element);
        inner.listeners.retain(|_, r| r.element != element);
    }

    /// Drop every node and listener and switch to `url`.
    pub fn navigate(&self, url: &str) {
        let mut inner = self.inner.lock();
        inner.url = url.to_string();
        inner.nodes.clear();
        inner.listeners.clear();
        inner.focused = None;
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.inner.lock().ready_state = state;
    }

    pub fn set_value(&self, element: ElementId, text: &str) {
        self.with_node(element, |n| n.value = text.to_string());
    }

    pub fn set_inner_text(&self, element: ElementId, text: &str) {
        self.with_node(element, |n| {
            n.inner_text = text.to_string();
            n.text_content = text.to_string();
        });
    }

    /// The user-visible text of the element, according to its kind.
    pub fn text(&self, element: ElementId) -> Option<String> {
        let inner = self.inner.lock();
        let node = inner.nodes.iter().find(|n| n.id == element)?;
        Some(match node.kind {
            ElementKind::TextArea | ElementKind::TextInput => node.value.clone(),
            ElementKind::ContentEditable { .. } => node.inner_text.clone(),
            ElementKind::Other => node.text_content.clone(),
        })
    }

    /// Simulate a keystroke edit that leaves `text` in the element.
    pub fn type_text(&self, element: ElementId, text: &str) {
        self.store_text(element, text);
        self.fire(element, EventKind::Input);
        self.fire(element, EventKind::KeyUp);
    }

    /// Simulate a clipboard paste that leaves `text` in the element.
    pub fn paste(&self, element: ElementId, text: &str) {
        self.store_text(element, text);
        self.fire(element, EventKind::Paste);
        self.fire(element, EventKind::Input);
    }

    /// Fire a notification as the page itself would, without recording it
    /// as synthesized.
    pub fn fire(&self, element: ElementId, kind: EventKind) {
        let sinks: Vec<(ListenerId, flume::Sender<DomEvent>)> = {
            let inner = self.inner.lock();
            inner
                .listeners
                .iter()
                .filter(|(_, r)| r.element == element && r.kinds.contains(&kind))
                .map(|(id, r)| (*id, r.sink.clone()))
                .collect()
        };
        for (listener, sink) in sinks {
            let _ = sink.send(DomEvent {
                listener,
                element,
                kind,
            });
        }
    }

    /// Notifications synthesized on `element` through [`Document::dispatch`].
    pub fn dispatched(&self, element: ElementId) -> Vec<EventKind> {
        self.inner
            .lock()
            .dispatched
            .iter()
            .filter(|(el, _)| *el == element)
            .map(|(_, kind)| *kind)
            .collect()
    }

    pub fn query_count(&self) -> usize {
        self.inner.lock().queries
    }

    pub fn listener_count(&self, element: ElementId) -> usize {
        self.inner
            .lock()
            .listeners
            .values()
            .filter(|r| r.element == element)
            .count()
    }

    pub fn clicks(&self, element: ElementId) -> usize {
        self.inner
            .lock()
            .nodes
            .iter()
            .find(|n| n.id == element)
            .map_or(0, |n| n.clicks)
    }

    pub fn focused(&self) -> Option<ElementId> {
        self.inner.lock().focused
    }

    fn store_text(&self, element: ElementId, text: &str) {
        self.with_node(element, |n| match n.kind {
            ElementKind::TextArea | ElementKind::TextInput => n.value = text.to_string(),
            _ => {
                n.inner_text = text.to_string();
                n.text_content = text.to_string();
            }
        });
    }

    fn with_node(&self, element: ElementId, f: impl FnOnce(&mut Node)) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.iter_mut().find(|n| n.id == element) {
            f(node);
        }
    }
}

impl Document for FakeDocument {
    fn url(&self) -> String {
        self.inner.lock().url.clone()
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.lock().ready_state
    }

    fn query_selector_all(&self, selector: &str) -> Vec<ElementId> {
        let mut inner = self.inner.lock();
        inner.queries += 1;
        inner
            .nodes
            .iter()
            .filter(|n| n.connected && n.selectors.iter().any(|s| s == selector))
            .map(|n| n.id)
            .collect()
    }

    fn element_state(&self, element: ElementId) -> Option<ElementState> {
        let inner = self.inner.lock();
        inner.nodes.iter().find(|n| n.id == element).map(|n| ElementState {
            kind: n.kind,
            connected: n.connected,
            width: n.width,
            height: n.height,
            display_none: n.display_none,
            visibility_hidden: false,
        })
    }

    fn read_text(&self, element: ElementId, property: TextProperty) -> Option<String> {
        let inner = self.inner.lock();
        let node = inner.nodes.iter().find(|n| n.id == element)?;
        Some(match property {
            TextProperty::Value => node.value.clone(),
            TextProperty::InnerText => node.inner_text.clone(),
            TextProperty::TextContent => node.text_content.clone(),
        })
    }

    fn write_text(&self, element: ElementId, property: TextProperty, text: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.iter_mut().find(|n| n.id == element) else {
            return false;
        };
        match property {
            TextProperty::Value => node.value = text.to_string(),
            TextProperty::InnerText | TextProperty::TextContent => {
                node.inner_text = text.to_string();
                node.text_content = text.to_string();
            }
        }
        node.scroll_top = 0.0;
        true
    }

    fn scroll_top(&self, element: ElementId) -> Option<f64> {
        let inner = self.inner.lock();
        inner
            .nodes
            .iter()
            .find(|n| n.id == element)
            .map(|n| n.scroll_top)
    }

    fn set_scroll_top(&self, element: ElementId, offset: f64) {
        self.with_node(element, |n| n.scroll_top = offset);
    }

    fn focus(&self, element: ElementId) {
        self.inner.lock().focused = Some(element);
    }

    fn click(&self, element: ElementId) -> bool {
        let mut inner = self.inner.lock();
        match inner.nodes.iter_mut().find(|n| n.id == element) {
            Some(node) => {
                node.clicks += 1;
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, element: ElementId, kind: EventKind) {
        self.inner.lock().dispatched.push((element, kind));
        self.fire(element, kind);
    }

    fn add_listener(
        &self,
        element: ElementId,
        kinds: &[EventKind],
        sink: flume::Sender<DomEvent>,
    ) -> Option<ListenerId> {
        let mut inner = self.inner.lock();
        if !inner.nodes.iter().any(|n| n.id == element) {
            return None;
        }
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.insert(
            id,
            Registration {
                element,
                kinds: kinds.to_vec(),
                sink,
            },
        );
        Some(id)
    }

    fn remove_listener(&self, listener: ListenerId) {
        self.inner.lock().listeners.remove(&listener);
    }
}
