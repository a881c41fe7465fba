//! Collaboration sessions and their lifecycle.
//!
//! This module handles:
//! - The `Session` bound to one locally opened target
//! - Cancellable creation tasks for create/join calls
//! - Backing process handles owning the remote service connection
//! - The `SessionManager` registry tying them together

mod manager;
mod process;
mod task;

pub use manager::{PendingSession, SessionManager};
pub use process::{BackingProcess, LoginHandler, MessageHandler};
pub use task::{CancellableTask, TaskState};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::host::HostError;
use crate::service::{RemoteSessionService, RoomId, ServiceError, SessionCreationResult, Workspace};
use crate::sync::{EditorBuffer, FileBinding};

/// Errors that can occur during session operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Remote call failed: {0}")]
    Service(#[from] ServiceError),

    #[error("Could not create project for session: {0}")]
    Workspace(#[from] HostError),

    #[error("Invalid session state: {0}")]
    StateViolation(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of a locally opened target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(uuid::Uuid);

impl TargetId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A project opened in the host, the unit a session is scoped to
#[derive(Debug, Clone)]
pub struct Target {
    id: TargetId,
    name: String,
    root: PathBuf,
}

impl Target {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: TargetId::new(),
            name: name.into(),
            root: root.into(),
        }
    }

    /// Identity used to key the manager's registries
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Display name of the project
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root directory of the project
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

/// Notifications published by the session manager
#[derive(Clone)]
pub enum SessionEvent {
    /// A session was established; bind its open files
    Created(Arc<Session>),
    /// The session of a target was closed
    Closed { target: TargetId, room_id: RoomId },
}

/// A live collaboration session for one target
pub struct Session {
    room_id: RoomId,
    server_url: String,
    is_host: bool,
    target: Target,
    workspace: Workspace,
    service: Arc<dyn RemoteSessionService>,
    /// Runtime for reconciliation passes of bound files
    runtime: Handle,
    created_at: i64,
    bindings: Mutex<Bindings>,
}

#[derive(Default)]
struct Bindings {
    files: HashMap<String, Arc<FileBinding>>,
    disposed: bool,
}

impl Session {
    pub(crate) fn new(
        data: SessionCreationResult,
        server_url: impl Into<String>,
        target: Target,
        service: Arc<dyn RemoteSessionService>,
        is_host: bool,
        runtime: Handle,
    ) -> Self {
        Self {
            room_id: data.room_id,
            server_url: server_url.into(),
            is_host,
            target,
            workspace: data.workspace,
            service,
            runtime,
            created_at: chrono::Utc::now().timestamp(),
            bindings: Mutex::new(Bindings::default()),
        }
    }

    /// Remote room identifier
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Server hosting the room
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether this process created the room
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Local target the session is scoped to
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Workspace as advertised to the room
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Remote service of the owning backing process
    pub fn service(&self) -> &Arc<dyn RemoteSessionService> {
        &self.service
    }

    /// Unix timestamp of establishment
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Whether the session has not been disposed
    pub fn is_active(&self) -> bool {
        !self.bindings.lock().disposed
    }

    /// Start synchronizing an opened file.
    ///
    /// Rebinding a path replaces (and disposes) the previous binding.
    pub fn bind_file(
        &self,
        path: impl Into<String>,
        buffer: Arc<dyn EditorBuffer>,
    ) -> Result<Arc<FileBinding>, SessionError> {
        let path = path.into();
        let mut bindings = self.bindings.lock();
        if bindings.disposed {
            return Err(SessionError::SessionClosed);
        }

        let binding = Arc::new(FileBinding::new(
            path.clone(),
            self.service.clone(),
            buffer,
            self.runtime.clone(),
        ));
        if let Some(previous) = bindings.files.insert(path.clone(), binding.clone()) {
            previous.dispose();
        }

        debug!("Bound {} in room {}", path, self.room_id);
        Ok(binding)
    }

    /// Stop synchronizing a closed file
    pub fn unbind_file(&self, path: &str) -> bool {
        match self.bindings.lock().files.remove(path) {
            Some(binding) => {
                binding.dispose();
                debug!("Unbound {} in room {}", path, self.room_id);
                true
            }
            None => false,
        }
    }

    /// Active binding of `path`
    pub fn binding(&self, path: &str) -> Option<Arc<FileBinding>> {
        self.bindings.lock().files.get(path).cloned()
    }

    /// Paths with active bindings
    pub fn bound_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.bindings.lock().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Dispose all bindings and deactivate the session. Idempotent.
    pub fn dispose(&self) {
        let files = {
            let mut bindings = self.bindings.lock();
            if bindings.disposed {
                return;
            }
            bindings.disposed = true;
            std::mem::take(&mut bindings.files)
        };

        for binding in files.values() {
            binding.dispose();
        }

        info!(
            "Disposed session {} for {} ({} bindings)",
            self.room_id,
            self.target.name(),
            files.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::memory::{MemoryConnector, MemoryServer};
    use crate::service::ServiceConnector;
    use crate::sync::{CaretEvent, EditorListener};

    struct NullBuffer;

    impl EditorBuffer for NullBuffer {
        fn text(&self) -> String {
            String::new()
        }

        fn set_text(&self, _text: &str) {}

        fn run_write(&self, action: Box<dyn FnOnce() + Send>) {
            action();
        }
    }

    fn session(is_host: bool) -> Session {
        let connector = MemoryConnector::new(MemoryServer::new("http://collab.test"));
        let service = connector.connect("http://collab.test", None).unwrap().service;
        let data = SessionCreationResult {
            room_id: "room-1".to_string(),
            workspace: Workspace::new("proj"),
            auth_token: None,
        };
        Session::new(
            data,
            "http://collab.test",
            Target::new("proj", "/tmp/proj"),
            service,
            is_host,
            Handle::current(),
        )
    }

    #[test]
    fn test_target_identity() {
        let a = Target::new("proj", "/tmp/proj");
        let b = Target::new("proj", "/tmp/proj");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let session = session(true);
        assert!(session.is_host());
        assert_eq!(session.room_id(), "room-1");

        let binding = session.bind_file("b.rs", Arc::new(NullBuffer)).unwrap();
        session.bind_file("a.rs", Arc::new(NullBuffer)).unwrap();
        assert_eq!(session.bound_paths(), vec!["a.rs".to_string(), "b.rs".to_string()]);

        assert!(session.unbind_file("b.rs"));
        assert!(!session.unbind_file("b.rs"));
        assert!(binding.is_disposed());
        assert!(session.binding("b.rs").is_none());
    }

    #[tokio::test]
    async fn test_rebind_disposes_previous() {
        let session = session(false);
        let first = session.bind_file("a.rs", Arc::new(NullBuffer)).unwrap();
        let second = session.bind_file("a.rs", Arc::new(NullBuffer)).unwrap();

        assert!(first.is_disposed());
        assert!(!second.is_disposed());
        assert_eq!(session.bound_paths().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_final() {
        let session = session(true);
        let binding = session.bind_file("a.rs", Arc::new(NullBuffer)).unwrap();

        session.dispose();
        session.dispose();

        assert!(!session.is_active());
        assert!(binding.is_disposed());
        assert!(session.bound_paths().is_empty());
        assert!(matches!(
            session.bind_file("a.rs", Arc::new(NullBuffer)),
            Err(SessionError::SessionClosed)
        ));

        // Events on a detached binding are ignored
        binding.on_caret_moved(CaretEvent::at(0));
    }
}
