//! Document synchronization between a local editor buffer and the remote
//! authoritative copy.
//!
//! Local edits are forwarded upstream as `TextOperation`s. After each local
//! edit a reconciliation pass fetches the remote content and, when it
//! diverges, overwrites the buffer. The overwrite happens with `send_updates`
//! off so it is not echoed back upstream, and `is_syncing` keeps at most one
//! pass in flight per document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::editor::{EditorBuffer, TextChange};
use super::protocol::TextOperation;
use crate::service::RemoteSessionService;

/// Synchronization state of one bound document
pub struct DocumentSync {
    path: String,
    service: Arc<dyn RemoteSessionService>,
    buffer: Arc<dyn EditorBuffer>,
    /// Runtime used for reconciliation fetches (edits arrive on editor threads)
    runtime: Handle,
    state: Arc<SyncFlags>,
}

/// Flags shared with in-flight reconciliation passes
#[derive(Debug)]
struct SyncFlags {
    send_updates: AtomicBool,
    is_syncing: AtomicBool,
    disposed: AtomicBool,
}

impl DocumentSync {
    /// Bind `buffer` to the remote document at `path`.
    ///
    /// Reconciliation passes are spawned on `runtime`.
    pub fn new(
        path: impl Into<String>,
        service: Arc<dyn RemoteSessionService>,
        buffer: Arc<dyn EditorBuffer>,
        runtime: Handle,
    ) -> Self {
        Self {
            path: path.into(),
            service,
            buffer,
            runtime,
            state: Arc::new(SyncFlags {
                send_updates: AtomicBool::new(true),
                is_syncing: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Path of the bound document
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether local edits are currently forwarded upstream
    pub fn sends_updates(&self) -> bool {
        self.state.send_updates.load(Ordering::SeqCst)
    }

    /// Whether a reconciliation pass is in flight
    pub fn is_syncing(&self) -> bool {
        self.state.is_syncing.load(Ordering::SeqCst)
    }

    /// Whether the binding was detached
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Handle a change reported by the editor
    pub fn document_changed(&self, change: &TextChange) {
        if self.is_disposed() {
            return;
        }

        if self.sends_updates() {
            let operation = TextOperation::from_change(change.offset, change.old_len, change.new_text.clone());
            debug!(
                "Sending update for {}: {}..{}",
                self.path,
                operation.range_start(),
                operation.range_end()
            );
            self.service.update_document(&self.path, vec![operation]);
        }

        if self
            .state
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.reconcile();
        }
    }

    /// Fetch the remote content and overwrite the buffer if it diverged.
    ///
    /// `is_syncing` must already be set by the caller.
    fn reconcile(&self) {
        let path = self.path.clone();
        let service = self.service.clone();
        let buffer = self.buffer.clone();
        let state = self.state.clone();

        self.runtime.spawn(async move {
            let content = match service.document_content(&path).await {
                Ok(content) => content.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    warn!("Failed to fetch content of {}: {}", path, e);
                    None
                }
            };

            let content = match content {
                Some(content) if !state.disposed.load(Ordering::SeqCst) && content != buffer.text() => content,
                _ => {
                    state.is_syncing.store(false, Ordering::SeqCst);
                    return;
                }
            };

            debug!("Reconciling {} with remote content", path);
            let target = buffer.clone();
            buffer.run_write(Box::new(move || {
                state.send_updates.store(false, Ordering::SeqCst);
                target.set_text(&content);
                state.send_updates.store(true, Ordering::SeqCst);
                state.is_syncing.store(false, Ordering::SeqCst);
            }));
        });
    }

    /// Stop forwarding edits and applying remote content. Idempotent.
    pub fn dispose(&self) {
        self.state.disposed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceResult, SessionCreationResult, Workspace};
    use crate::sync::protocol::SelectionState;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Remote document whose content fetches can be held back
    struct FakeRemote {
        content: Mutex<Option<String>>,
        sent: Mutex<Vec<TextOperation>>,
        fetches: Mutex<usize>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeRemote {
        fn new(content: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                content: Mutex::new(content.map(str::to_string)),
                sent: Mutex::new(Vec::new()),
                fetches: Mutex::new(0),
                gate: None,
            })
        }

        fn gated(content: &str, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                content: Mutex::new(Some(content.to_string())),
                sent: Mutex::new(Vec::new()),
                fetches: Mutex::new(0),
                gate: Some(gate),
            })
        }

        fn sent(&self) -> Vec<TextOperation> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteSessionService for FakeRemote {
        async fn create_room(&self, _workspace: &Workspace) -> ServiceResult<SessionCreationResult> {
            unimplemented!()
        }

        async fn join_room(&self, _room_id: &str) -> ServiceResult<SessionCreationResult> {
            unimplemented!()
        }

        async fn close_session(&self) -> ServiceResult<()> {
            Ok(())
        }

        fn update_document(&self, _path: &str, operations: Vec<TextOperation>) {
            self.sent.lock().extend(operations);
        }

        async fn document_content(&self, _path: &str) -> ServiceResult<Option<Bytes>> {
            *self.fetches.lock() += 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.content.lock().clone().map(Bytes::from))
        }

        fn update_text_selection(&self, _path: &str, _selections: Vec<SelectionState>) {}
    }

    /// Buffer that reports its own mutations back to the bound listener,
    /// like a real editor does
    struct TestBuffer {
        text: Mutex<String>,
        listener: Mutex<Option<Arc<DocumentSync>>>,
        writes: Mutex<usize>,
    }

    impl TestBuffer {
        fn new(text: &str) -> Arc<Self> {
            Arc::new(Self {
                text: Mutex::new(text.to_string()),
                listener: Mutex::new(None),
                writes: Mutex::new(0),
            })
        }

        /// Simulate the user typing
        fn edit(&self, change: TextChange) {
            let op = TextOperation::from_change(change.offset, change.old_len, change.new_text.clone());
            op.apply_to(&mut self.text.lock()).unwrap();
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener.document_changed(&change);
            }
        }
    }

    impl EditorBuffer for TestBuffer {
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
            *self.writes.lock() += 1;
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener.document_changed(&TextChange::new(0, old_len, text));
            }
        }

        fn run_write(&self, action: Box<dyn FnOnce() + Send>) {
            action();
        }
    }

    fn bind(remote: Arc<FakeRemote>, buffer: Arc<TestBuffer>) -> Arc<DocumentSync> {
        let sync = Arc::new(DocumentSync::new("src/main.rs", remote, buffer.clone(), Handle::current()));
        *buffer.listener.lock() = Some(sync.clone());
        sync
    }

    async fn wait_idle(sync: &DocumentSync) {
        for _ in 0..200 {
            if !sync.is_syncing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("reconciliation did not finish");
    }

    #[tokio::test]
    async fn test_local_edit_sends_one_operation() {
        let remote = FakeRemote::new(Some("hello!"));
        let buffer = TestBuffer::new("hello");
        let sync = bind(remote.clone(), buffer.clone());

        buffer.edit(TextChange::insert(5, "!"));
        wait_idle(&sync).await;

        let sent = remote.sent();
        assert_eq!(sent, vec![TextOperation::new(5, 5, "!").unwrap()]);
        assert_eq!(*buffer.writes.lock(), 0);
    }

    #[tokio::test]
    async fn test_replacement_operation_covers_old_range() {
        let remote = FakeRemote::new(None);
        let buffer = TestBuffer::new("let x = 1;");
        let sync = bind(remote.clone(), buffer.clone());

        buffer.edit(TextChange::new(4, 1, "value"));
        wait_idle(&sync).await;

        assert_eq!(remote.sent(), vec![TextOperation::new(4, 5, "value").unwrap()]);
    }

    #[tokio::test]
    async fn test_reconcile_overwrites_without_echo() {
        let remote = FakeRemote::new(Some("remote text"));
        let buffer = TestBuffer::new("local");
        let sync = bind(remote.clone(), buffer.clone());

        buffer.edit(TextChange::insert(5, "!"));
        wait_idle(&sync).await;

        assert_eq!(buffer.text(), "remote text");
        assert_eq!(*buffer.writes.lock(), 1);
        // Only the user's own edit went upstream
        assert_eq!(remote.sent().len(), 1);
        assert!(sync.sends_updates());
    }

    #[tokio::test]
    async fn test_reconcile_with_equal_content_is_noop() {
        let remote = FakeRemote::new(Some("abc!"));
        let buffer = TestBuffer::new("abc");
        let sync = bind(remote.clone(), buffer.clone());

        buffer.edit(TextChange::insert(3, "!"));
        wait_idle(&sync).await;

        assert_eq!(*buffer.writes.lock(), 0);
        assert_eq!(buffer.text(), "abc!");
        assert_eq!(remote.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_remote_content_is_noop() {
        let remote = FakeRemote::new(None);
        let buffer = TestBuffer::new("abc");
        let sync = bind(remote.clone(), buffer.clone());

        buffer.edit(TextChange::delete(0, 1));
        wait_idle(&sync).await;

        assert_eq!(buffer.text(), "bc");
        assert_eq!(*buffer.writes.lock(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_edits_share_one_pass() {
        let gate = Arc::new(Notify::new());
        let remote = FakeRemote::gated("xyz", gate.clone());
        let buffer = TestBuffer::new("ab");
        let sync = bind(remote.clone(), buffer.clone());

        buffer.edit(TextChange::insert(2, "c"));
        assert!(sync.is_syncing());
        buffer.edit(TextChange::insert(3, "d"));

        // Give the first pass time to reach the gated fetch
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*remote.fetches.lock(), 1);
        assert_eq!(remote.sent().len(), 2);

        gate.notify_one();
        wait_idle(&sync).await;

        assert_eq!(*remote.fetches.lock(), 1);
        assert_eq!(buffer.text(), "xyz");
        assert_eq!(remote.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_disposed_binding_ignores_edits() {
        let remote = FakeRemote::new(Some("remote"));
        let buffer = TestBuffer::new("local");
        let sync = bind(remote.clone(), buffer.clone());

        sync.dispose();
        sync.dispose();
        buffer.edit(TextChange::insert(0, "x"));

        assert!(remote.sent().is_empty());
        assert!(!sync.is_syncing());
        assert_eq!(buffer.text(), "xlocal");
    }
}
