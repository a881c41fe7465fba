//! Collab Session - session lifecycle for collaborative editing clients
//!
//! A client-side library that manages collaboration sessions on behalf of a
//! host editor:
//! - Creating and joining rooms on a remote session service
//! - Cancellable, progress-reporting create/join calls
//! - Backing process handles owning the service connection
//! - Document synchronization with echo suppression and reconciliation
//! - Caret and selection broadcasting

pub mod config;
pub mod host;
pub mod service;
pub mod session;
pub mod sync;

pub use config::{ConfigError, SessionConfig};
pub use host::{HostError, HostServices};
pub use service::{
    RemoteSessionService, RoomInvite, RoomToken, ServiceConnector, ServiceError, ServiceNotification,
    SessionCreationResult, Workspace,
};
pub use session::{PendingSession, Session, SessionError, SessionEvent, SessionManager, Target, TargetId, TaskState};
pub use sync::{EditorBuffer, EditorListener, FileBinding, MemoryBuffer, TextChange};
