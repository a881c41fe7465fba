//! Presence broadcasting for the local participant.
//!
//! Every caret move or selection change in a bound document is forwarded to the
//! remote session immediately. Re-sending an unchanged selection is harmless, so
//! there is no deduplication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::editor::CaretEvent;
use super::protocol::SelectionState;
use crate::service::RemoteSessionService;

/// Forwards local caret/selection state for one document
pub struct PresenceBroadcaster {
    path: String,
    service: Arc<dyn RemoteSessionService>,
    disposed: AtomicBool,
}

impl PresenceBroadcaster {
    pub fn new(path: impl Into<String>, service: Arc<dyn RemoteSessionService>) -> Self {
        Self {
            path: path.into(),
            service,
            disposed: AtomicBool::new(false),
        }
    }

    /// Path of the document whose selections are broadcast
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Caret moved, possibly extending a selection
    pub fn caret_moved(&self, caret: CaretEvent) {
        self.broadcast(caret);
    }

    /// Selection changed without the caret being the trigger
    pub fn selection_changed(&self, caret: CaretEvent) {
        self.broadcast(caret);
    }

    fn broadcast(&self, caret: CaretEvent) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let selection = SelectionState::from_anchor(caret.anchor, caret.head);
        trace!(
            "Selection in {}: {}..{} (reversed: {})",
            self.path,
            selection.range_start(),
            selection.range_end(),
            selection.is_reversed()
        );
        self.service.update_text_selection(&self.path, vec![selection]);
    }

    /// Stop broadcasting. Idempotent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
