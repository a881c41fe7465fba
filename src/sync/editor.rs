//! Editor-facing capabilities.
//!
//! The host editor implements `EditorBuffer` for each open document and feeds
//! its change/caret/selection events into an `EditorListener`. Nothing in the
//! synchronization logic depends on a particular UI toolkit.
//!
//! `MemoryBuffer` is a headless implementation for tools and tests.

use parking_lot::Mutex;
use std::sync::Arc;

use super::protocol::{ProtocolError, TextOperation};

/// A local edit: `old_len` characters at `offset` were replaced by `new_text`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub offset: usize,
    pub old_len: usize,
    pub new_text: String,
}

impl TextChange {
    pub fn new(offset: usize, old_len: usize, new_text: impl Into<String>) -> Self {
        Self {
            offset,
            old_len,
            new_text: new_text.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(offset, 0, text)
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self::new(offset, len, "")
    }
}

/// Caret position plus the anchor of the selection it extends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaretEvent {
    /// Where the selection started (equal to `head` without a selection)
    pub anchor: usize,
    /// Where the caret is
    pub head: usize,
}

impl CaretEvent {
    pub fn at(offset: usize) -> Self {
        Self {
            anchor: offset,
            head: offset,
        }
    }

    pub fn selection(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }
}

/// Write access to an editor's text buffer
pub trait EditorBuffer: Send + Sync {
    /// Current full text of the buffer
    fn text(&self) -> String;

    /// Replace the entire text of the buffer.
    ///
    /// Only called from within `run_write`. Implementations report the
    /// resulting change to their listeners like any other edit.
    fn set_text(&self, text: &str);

    /// Run `action` as one atomic write on the context that owns the buffer.
    ///
    /// The action either runs completely or not at all.
    fn run_write(&self, action: Box<dyn FnOnce() + Send>);
}

/// Receiver of editor events for one document
pub trait EditorListener: Send + Sync {
    fn on_text_changed(&self, change: &TextChange);

    fn on_caret_moved(&self, caret: CaretEvent);

    fn on_selection_changed(&self, caret: CaretEvent);
}

/// Headless editor buffer that reports its changes to an attached listener
#[derive(Default)]
pub struct MemoryBuffer {
    text: Mutex<String>,
    listener: Mutex<Option<Arc<dyn EditorListener>>>,
}

impl MemoryBuffer {
    pub fn new(text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            text: Mutex::new(text.into()),
            listener: Mutex::new(None),
        })
    }

    /// Report subsequent events to `listener`
    pub fn attach(&self, listener: Arc<dyn EditorListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Stop reporting events
    pub fn detach(&self) {
        self.listener.lock().take();
    }

    /// Apply a local edit and report it
    pub fn edit(&self, change: TextChange) -> Result<(), ProtocolError> {
        let operation = TextOperation::from_change(change.offset, change.old_len, change.new_text.clone());
        operation.apply_to(&mut self.text.lock())?;
        if let Some(listener) = self.listener() {
            listener.on_text_changed(&change);
        }
        Ok(())
    }

    /// Report a caret move
    pub fn move_caret(&self, caret: CaretEvent) {
        if let Some(listener) = self.listener() {
            listener.on_caret_moved(caret);
        }
    }

    /// Report a selection change
    pub fn select(&self, caret: CaretEvent) {
        if let Some(listener) = self.listener() {
            listener.on_selection_changed(caret);
        }
    }

    fn listener(&self) -> Option<Arc<dyn EditorListener>> {
        self.listener.lock().clone()
    }
}

impl EditorBuffer for MemoryBuffer {
    fn text(&self) -> String {
        self.text.lock().clone()
    }

    fn set_text(&self, text: &str) {
        let old_len = {
            let mut current = self.text.lock();
            let old_len = current.chars().count();
            *current = text.to_string();
            old_len
        };
        if let Some(listener) = self.listener() {
            listener.on_text_changed(&TextChange::new(0, old_len, text));
        }
    }

    fn run_write(&self, action: Box<dyn FnOnce() + Send>) {
        action();
    }
}
