//! Injection listener and echo suppression.
//!
//! The listener subscribes to the text-changed notifications of a pane's
//! input element and forwards genuine user edits. Programmatic writes made by
//! the bridge fire the same notifications, so they are filtered through an
//! [`EchoGuard`]: a per-pane marker owned by the host, never a property
//! stored on the page's own DOM nodes.

use crate::document::{extract_text, Document, DomEvent, ElementId, EventKind, ListenerId, PaneId};
use crate::error::{MirrorError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Per-pane "programmatic update in progress" markers.
///
/// Each write increments the pane's depth and schedules a delayed decrement,
/// so overlapping writes keep the pane suppressed until the last one clears.
/// [`clear`](Self::clear) starts a new generation for the pane; releases
/// scheduled before it are ignored.
#[derive(Debug, Clone, Default)]
pub struct EchoGuard {
    state: Arc<Mutex<GuardState>>,
}

#[derive(Debug, Default)]
struct GuardState {
    depth: HashMap<PaneId, usize>,
    generation: HashMap<PaneId, u64>,
}

impl GuardState {
    fn generation(&self, pane_id: PaneId) -> u64 {
        self.generation.get(&pane_id).copied().unwrap_or(0)
    }

    fn release(&mut self, pane_id: PaneId) {
        if let Some(count) = self.depth.get_mut(&pane_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.depth.remove(&pane_id);
            }
        }
    }
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a programmatic update as started on `pane_id`.
    pub fn begin(&self, pane_id: PaneId) {
        *self.state.lock().depth.entry(pane_id).or_insert(0) += 1;
    }

    /// Mark one programmatic update as finished.
    pub fn end(&self, pane_id: PaneId) {
        self.state.lock().release(pane_id);
    }

    /// Finish one programmatic update after `delay`.
    ///
    /// Hosted pages may process synthesized notifications on a later tick,
    /// and those must still see the marker set. Fails with
    /// [`MirrorError::NoRuntime`] outside a tokio runtime.
    pub fn end_after(&self, pane_id: PaneId, delay: Duration) -> Result<JoinHandle<()>> {
        let runtime = Handle::try_current().map_err(|_| MirrorError::NoRuntime)?;
        Ok(self.schedule_end(&runtime, pane_id, delay))
    }

    pub(crate) fn schedule_end(
        &self,
        runtime: &Handle,
        pane_id: PaneId,
        delay: Duration,
    ) -> JoinHandle<()> {
        let guard = self.clone();
        let generation = self.state.lock().generation(pane_id);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = guard.state.lock();
            if state.generation(pane_id) == generation {
                state.release(pane_id);
            }
        })
    }

    pub fn is_suppressed(&self, pane_id: PaneId) -> bool {
        self.state.lock().depth.contains_key(&pane_id)
    }

    /// Drop any marker for a pane that is going away.
    pub fn clear(&self, pane_id: PaneId) {
        let mut state = self.state.lock();
        state.depth.remove(&pane_id);
        *state.generation.entry(pane_id).or_insert(0) += 1;
    }
}

/// What the listener did with one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDisposition {
    /// A genuine edit, delivered to the change callback.
    Forwarded(String),
    /// Arrived while a programmatic write was in progress; not forwarded.
    /// The owner should [`recheck`](InjectionListener::recheck) once the
    /// marker clears, in case the user typed during the write.
    Suppressed,
    /// The text did not change since the last observed notification.
    Unchanged,
    /// The callback rejected the text; a later notification or
    /// [`recheck`](InjectionListener::recheck) retries it.
    Undelivered,
    /// The bound element no longer exists.
    Stale,
    /// From a registration this listener no longer owns.
    Foreign,
}

/// Outcome of [`InjectionListener::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// The element already carries this listener; nothing was added.
    AlreadyAttached,
    /// The document refused the registration (element gone).
    ElementGone,
}

type ChangeCallback = Box<dyn FnMut(&str) -> Result<()> + Send>;

#[derive(Debug, Clone, Copy)]
struct Binding {
    element: ElementId,
    listener: ListenerId,
}

/// Watches one pane's input element and forwards user edits.
pub struct InjectionListener {
    pane_id: PaneId,
    guard: EchoGuard,
    sink: flume::Sender<DomEvent>,
    binding: Option<Binding>,
    /// Text seen at the last processed notification (or write).
    last_seen: Option<String>,
    on_change: ChangeCallback,
}

impl InjectionListener {
    /// `sink` is where the document delivers notifications; the owner drains
    /// it and feeds each event back through [`handle`](Self::handle).
    pub fn new<F>(
        pane_id: PaneId,
        guard: EchoGuard,
        sink: flume::Sender<DomEvent>,
        on_change: F,
    ) -> Self
    where
        F: FnMut(&str) -> Result<()> + Send + 'static,
    {
        Self {
            pane_id,
            guard,
            sink,
            binding: None,
            last_seen: None,
            on_change: Box::new(on_change),
        }
    }

    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    pub fn bound_element(&self) -> Option<ElementId> {
        self.binding.map(|b| b.element)
    }

    pub fn is_attached(&self) -> bool {
        self.binding.is_some()
    }

    /// Subscribe to `element`. Re-attaching to the element already bound is a
    /// no-op; attaching to another element first releases the old one.
    pub fn attach(&mut self, document: &dyn Document, element: ElementId) -> AttachOutcome {
        if self.bound_element() == Some(element) {
            return AttachOutcome::AlreadyAttached;
        }
        self.detach(document);

        let Some(listener) =
            document.add_listener(element, &EventKind::TEXT_CHANGED, self.sink.clone())
        else {
            return AttachOutcome::ElementGone;
        };
        self.binding = Some(Binding { element, listener });
        self.last_seen = extract_text(document, element);
        tracing::debug!("Pane {}: listener attached to {element}", self.pane_id);
        AttachOutcome::Attached
    }

    /// Release the current element, if any.
    pub fn detach(&mut self, document: &dyn Document) {
        if let Some(binding) = self.binding.take() {
            document.remove_listener(binding.listener);
            tracing::debug!(
                "Pane {}: listener detached from {}",
                self.pane_id,
                binding.element
            );
        }
        self.last_seen = None;
    }

    /// Record text written by the bridge, so the page's own follow-up
    /// notifications for it do not look like an edit.
    pub fn note_programmatic(&mut self, text: &str) {
        self.last_seen = Some(text.to_string());
    }

    /// Process one notification delivered to the sink.
    pub fn handle(&mut self, document: &dyn Document, event: &DomEvent) -> ChangeDisposition {
        let Some(binding) = self.binding else {
            return ChangeDisposition::Foreign;
        };
        if binding.listener != event.listener || binding.element != event.element {
            return ChangeDisposition::Foreign;
        }
        self.process(document, binding.element, event.kind)
    }

    /// Re-read the bound element and forward its text if it differs from
    /// what was last seen. Picks up edits whose notifications were
    /// suppressed or undelivered.
    pub fn recheck(&mut self, document: &dyn Document) -> ChangeDisposition {
        match self.binding {
            Some(binding) => self.process(document, binding.element, "recheck"),
            None => ChangeDisposition::Foreign,
        }
    }

    fn process(
        &mut self,
        document: &dyn Document,
        element: ElementId,
        via: impl Display,
    ) -> ChangeDisposition {
        let Some(text) = extract_text(document, element) else {
            return ChangeDisposition::Stale;
        };

        // `last_seen` is left alone here: the box may already hold a user
        // keystroke on top of the injected text.
        if self.guard.is_suppressed(self.pane_id) {
            tracing::trace!(
                "Pane {}: {via} suppressed during programmatic update",
                self.pane_id
            );
            return ChangeDisposition::Suppressed;
        }

        if self.last_seen.as_deref() == Some(text.as_str()) {
            return ChangeDisposition::Unchanged;
        }

        match (self.on_change)(&text) {
            Ok(()) => {
                tracing::debug!(
                    "Pane {}: user input via {via} ({} chars)",
                    self.pane_id,
                    text.chars().count()
                );
                self.last_seen = Some(text.clone());
                ChangeDisposition::Forwarded(text)
            }
            Err(e) => {
                tracing::debug!("Pane {}: could not forward input: {e}", self.pane_id);
                ChangeDisposition::Undelivered
            }
        }
    }
}

impl std::fmt::Debug for InjectionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionListener")
            .field("pane_id", &self.pane_id)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ElementKind;
    use crate::error::MirrorError;
    use crate::testing::FakeDocument;

    struct Fixture {
        doc: FakeDocument,
        element: ElementId,
        events: flume::Receiver<DomEvent>,
        forwarded: Arc<Mutex<Vec<String>>>,
        guard: EchoGuard,
        listener: InjectionListener,
    }

    fn fixture(kind: ElementKind) -> Fixture {
        let doc = FakeDocument::new("https://chat.example/");
        let element = doc.insert("#prompt", kind);
        let (tx, events) = flume::unbounded();
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&forwarded);
        let guard = EchoGuard::new();
        let listener = InjectionListener::new(1, guard.clone(), tx, move |text: &str| {
            sink.lock().push(text.to_string());
            Ok(())
        });
        Fixture {
            doc,
            element,
            events,
            forwarded,
            guard,
            listener,
        }
    }

    impl Fixture {
        fn drain(&mut self) -> Vec<ChangeDisposition> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(self.listener.handle(&self.doc, &event));
            }
            out
        }
    }

    #[test]
    fn test_one_forward_per_user_edit() {
        let mut f = fixture(ElementKind::TextArea);
        assert_eq!(f.listener.attach(&f.doc, f.element), AttachOutcome::Attached);

        // input + keyup for each edit
        f.doc.type_text(f.element, "h");
        let mut results = f.drain();
        f.doc.type_text(f.element, "he");
        results.extend(f.drain());

        assert_eq!(
            results,
            vec![
                ChangeDisposition::Forwarded("h".into()),
                ChangeDisposition::Unchanged,
                ChangeDisposition::Forwarded("he".into()),
                ChangeDisposition::Unchanged,
            ]
        );
        assert_eq!(*f.forwarded.lock(), vec!["h".to_string(), "he".to_string()]);
    }

    #[test]
    fn test_paste_is_captured() {
        let mut f = fixture(ElementKind::TextInput);
        f.listener.attach(&f.doc, f.element);
        f.doc.paste(f.element, "pasted prompt");
        f.drain();
        assert_eq!(*f.forwarded.lock(), vec!["pasted prompt".to_string()]);
    }

    #[test]
    fn test_contenteditable_reads_inner_text() {
        let mut f = fixture(ElementKind::ContentEditable { prose_mirror: false });
        f.listener.attach(&f.doc, f.element);
        f.doc.type_text(f.element, "rich");
        f.drain();
        assert_eq!(*f.forwarded.lock(), vec!["rich".to_string()]);
    }

    #[test]
    fn test_double_attach_forwards_once() {
        let mut f = fixture(ElementKind::TextArea);
        assert_eq!(f.listener.attach(&f.doc, f.element), AttachOutcome::Attached);
        assert_eq!(
            f.listener.attach(&f.doc, f.element),
            AttachOutcome::AlreadyAttached
        );
        assert_eq!(f.doc.listener_count(f.element), 1);

        f.doc.type_text(f.element, "once");
        f.drain();
        assert_eq!(*f.forwarded.lock(), vec!["once".to_string()]);
    }

    #[test]
    fn test_suppressed_while_guard_set() {
        let mut f = fixture(ElementKind::TextArea);
        f.listener.attach(&f.doc, f.element);

        f.guard.begin(1);
        f.doc.type_text(f.element, "injected");
        f.listener.note_programmatic("injected");
        let results = f.drain();
        assert!(results.iter().all(|r| *r == ChangeDisposition::Suppressed));
        assert!(f.forwarded.lock().is_empty());

        f.guard.end(1);
        // The page re-firing for the injected value is not an edit either.
        f.doc.fire(f.element, EventKind::Input);
        assert_eq!(f.drain(), vec![ChangeDisposition::Unchanged]);

        f.doc.type_text(f.element, "injected!");
        f.drain();
        assert_eq!(*f.forwarded.lock(), vec!["injected!".to_string()]);
    }

    #[test]
    fn test_events_after_rebind_are_foreign() {
        let mut f = fixture(ElementKind::TextArea);
        f.listener.attach(&f.doc, f.element);
        f.doc.type_text(f.element, "old");

        let replacement = f.doc.insert("#prompt", ElementKind::TextArea);
        assert_eq!(f.listener.attach(&f.doc, replacement), AttachOutcome::Attached);
        assert_eq!(f.doc.listener_count(f.element), 0);

        let results = f.drain();
        assert!(results.iter().all(|r| *r == ChangeDisposition::Foreign));
        assert!(f.forwarded.lock().is_empty());
    }

    #[test]
    fn test_attach_to_removed_element() {
        let mut f = fixture(ElementKind::TextArea);
        f.doc.remove(f.element);
        assert_eq!(f.listener.attach(&f.doc, f.element), AttachOutcome::ElementGone);
        assert!(!f.listener.is_attached());
    }

    #[test]
    fn test_undelivered_text_is_retried_on_next_event() {
        let doc = FakeDocument::new("https://chat.example/");
        let element = doc.insert("textarea", ElementKind::TextArea);
        let (tx, events) = flume::unbounded();
        let ready = Arc::new(Mutex::new(false));
        let host_ready = Arc::clone(&ready);
        let mut listener = InjectionListener::new(4, EchoGuard::new(), tx, move |_: &str| {
            if *host_ready.lock() {
                Ok(())
            } else {
                Err(MirrorError::BridgeNotReady {
                    pane_id: 4,
                    attempts: 1,
                })
            }
        });
        listener.attach(&doc, element);

        doc.fire(element, EventKind::Input);
        doc.set_value(element, "early");
        doc.fire(element, EventKind::Input);
        let first = events.try_recv().unwrap();
        let second = events.try_recv().unwrap();
        assert_eq!(listener.handle(&doc, &first), ChangeDisposition::Undelivered);

        *ready.lock() = true;
        assert_eq!(
            listener.handle(&doc, &second),
            ChangeDisposition::Forwarded("early".into())
        );
    }

    #[test]
    fn test_note_programmatic_hides_follow_up() {
        let mut f = fixture(ElementKind::TextArea);
        f.listener.attach(&f.doc, f.element);
        f.doc.set_value(f.element, "mirrored");
        f.listener.note_programmatic("mirrored");
        f.doc.fire(f.element, EventKind::KeyUp);
        assert_eq!(f.drain(), vec![ChangeDisposition::Unchanged]);
    }

    #[test]
    fn test_user_edit_during_write_is_forwarded_after() {
        let mut f = fixture(ElementKind::TextArea);
        f.listener.attach(&f.doc, f.element);

        f.guard.begin(1);
        f.doc.set_value(f.element, "mirrored");
        f.listener.note_programmatic("mirrored");
        // The user types while the marker is still set.
        f.doc.set_value(f.element, "mirrored!");
        f.doc.fire(f.element, EventKind::Input);
        assert_eq!(f.drain(), vec![ChangeDisposition::Suppressed]);

        f.guard.end(1);
        f.doc.fire(f.element, EventKind::KeyUp);
        assert_eq!(
            f.drain(),
            vec![ChangeDisposition::Forwarded("mirrored!".into())]
        );
        assert_eq!(*f.forwarded.lock(), vec!["mirrored!".to_string()]);
    }

    #[test]
    fn test_recheck_picks_up_suppressed_edit() {
        let mut f = fixture(ElementKind::TextArea);
        f.listener.attach(&f.doc, f.element);

        f.guard.begin(1);
        f.doc.set_value(f.element, "mirrored");
        f.listener.note_programmatic("mirrored");
        f.doc.type_text(f.element, "typed over");
        assert!(f.drain().iter().all(|r| *r == ChangeDisposition::Suppressed));
        assert_eq!(f.listener.recheck(&f.doc), ChangeDisposition::Suppressed);

        f.guard.end(1);
        assert_eq!(
            f.listener.recheck(&f.doc),
            ChangeDisposition::Forwarded("typed over".into())
        );
        assert_eq!(f.listener.recheck(&f.doc), ChangeDisposition::Unchanged);
    }

    #[test]
    fn test_recheck_without_binding() {
        let mut f = fixture(ElementKind::TextArea);
        assert_eq!(f.listener.recheck(&f.doc), ChangeDisposition::Foreign);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_clears_after_delay() {
        let guard = EchoGuard::new();
        guard.begin(2);
        guard.begin(2);
        let first = guard.end_after(2, Duration::from_millis(100)).unwrap();
        let second = guard.end_after(2, Duration::from_millis(150)).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        first.await.unwrap();
        assert!(guard.is_suppressed(2));

        second.await.unwrap();
        assert!(!guard.is_suppressed(2));
        assert!(!guard.is_suppressed(3));
    }

    #[test]
    fn test_guard_clear_and_underflow() {
        let guard = EchoGuard::new();
        guard.end(9);
        assert!(!guard.is_suppressed(9));
        guard.begin(9);
        guard.clear(9);
        assert!(!guard.is_suppressed(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_scheduled_before_clear_is_ignored() {
        let guard = EchoGuard::new();
        guard.begin(4);
        let stale = guard.end_after(4, Duration::from_millis(100)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.clear(4);
        // Same pane id attached again, with a write of its own.
        guard.begin(4);
        guard.end_after(4, Duration::from_millis(100)).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        stale.await.unwrap();
        assert!(guard.is_suppressed(4));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!guard.is_suppressed(4));
    }

    #[test]
    fn test_end_after_outside_runtime() {
        let guard = EchoGuard::new();
        guard.begin(1);
        assert_eq!(
            guard.end_after(1, Duration::from_millis(100)).unwrap_err(),
            MirrorError::NoRuntime
        );
        assert!(guard.is_suppressed(1));
    }
}
