//! Synchronization of open documents with the remote session.
//!
//! This module provides:
//! - The text operation model exchanged with the remote service
//! - Document synchronization with echo suppression
//! - Presence (caret/selection) broadcasting
//! - `FileBinding`, the editor listener tying both to one open file

pub mod document;
pub mod editor;
pub mod presence;
pub mod protocol;

pub use document::DocumentSync;
pub use editor::{CaretEvent, EditorBuffer, EditorListener, MemoryBuffer, TextChange};
pub use presence::PresenceBroadcaster;
pub use protocol::{ProtocolError, SelectionState, TextOperation};

use std::sync::Arc;
use tokio::runtime::Handle;

use crate::service::RemoteSessionService;

/// Document and presence synchronization for one open file
pub struct FileBinding {
    document: DocumentSync,
    presence: PresenceBroadcaster,
}

impl FileBinding {
    pub fn new(
        path: impl Into<String>,
        service: Arc<dyn RemoteSessionService>,
        buffer: Arc<dyn EditorBuffer>,
        runtime: Handle,
    ) -> Self {
        let path = path.into();
        Self {
            presence: PresenceBroadcaster::new(path.clone(), service.clone()),
            document: DocumentSync::new(path, service, buffer, runtime),
        }
    }

    /// Path of the bound file
    pub fn path(&self) -> &str {
        self.document.path()
    }

    /// Document synchronization half
    pub fn document(&self) -> &DocumentSync {
        &self.document
    }

    /// Presence half
    pub fn presence(&self) -> &PresenceBroadcaster {
        &self.presence
    }

    /// Whether the binding was detached
    pub fn is_disposed(&self) -> bool {
        self.document.is_disposed()
    }

    /// Detach from the editor. Idempotent.
    pub fn dispose(&self) {
        self.document.dispose();
        self.presence.dispose();
    }
}

impl EditorListener for FileBinding {
    fn on_text_changed(&self, change: &TextChange) {
        self.document.document_changed(change);
    }

    fn on_caret_moved(&self, caret: CaretEvent) {
        self.presence.caret_moved(caret);
    }

    fn on_selection_changed(&self, caret: CaretEvent) {
        self.presence.selection_changed(caret);
    }
}
