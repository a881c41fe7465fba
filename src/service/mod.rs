//! Contract of the remote session service.
//!
//! The session manager talks to the collaboration backend only through the
//! traits in this module:
//! - `ServiceConnector` establishes a backing service connection per server URL
//! - `RemoteSessionService` exposes the room and document operations
//! - `ServiceNotification` carries unsolicited messages from the backend
//!
//! `memory` provides an in-process implementation used by the demo binary and tests.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sync::protocol::{SelectionState, TextOperation};

/// Identifier of a room on the remote service
pub type RoomId = String;

/// Result type for remote service calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failures surfaced by the remote service or its transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Not part of a session")]
    NotInSession,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Description of a collaborative workspace as advertised to the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Declared workspace name
    pub name: String,
    /// Paths of the files open in the workspace
    #[serde(default)]
    pub files: Vec<String>,
}

impl Workspace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !self.files.contains(&path) {
            self.files.push(path);
        }
        self
    }
}

/// Payload of a successful create/join call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreationResult {
    pub room_id: RoomId,
    pub workspace: Workspace,
    /// Token issued by the server when the call authenticated the user
    pub auth_token: Option<String>,
}

/// Unsolicited messages delivered by the backing service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceNotification {
    /// The server requires a login before the pending request can proceed
    LoginRequired {
        token: String,
        login_url: Option<String>,
    },
    /// Another participant joined the room
    PeerJoined { room_id: RoomId, peer_id: String },
    /// Another participant left the room
    PeerLeft { room_id: RoomId, peer_id: String },
    /// The room was closed by its host
    RoomClosed { room_id: RoomId },
}

/// Operations offered by the remote session service
#[async_trait]
pub trait RemoteSessionService: Send + Sync {
    /// Create a room hosting `workspace`
    async fn create_room(&self, workspace: &Workspace) -> ServiceResult<SessionCreationResult>;

    /// Join an existing room
    async fn join_room(&self, room_id: &str) -> ServiceResult<SessionCreationResult>;

    /// Leave (or, for the host, close) the current room
    async fn close_session(&self) -> ServiceResult<()>;

    /// Forward local edits; delivery and ordering are the service's concern
    fn update_document(&self, path: &str, operations: Vec<TextOperation>);

    /// Fetch the authoritative content of a document
    async fn document_content(&self, path: &str) -> ServiceResult<Option<Bytes>>;

    /// Forward local caret/selection state
    fn update_text_selection(&self, path: &str, selections: Vec<SelectionState>);
}

/// An established backing service connection
pub struct Connection {
    pub service: Arc<dyn RemoteSessionService>,
    pub notifications: mpsc::UnboundedReceiver<ServiceNotification>,
}

/// Establishes backing service connections
pub trait ServiceConnector: Send + Sync {
    /// Connect to `server_url`, presenting a previously stored auth token if any
    fn connect(&self, server_url: &str, auth_token: Option<String>) -> ServiceResult<Connection>;
}

/// A room reference pasted by a user: a bare room id or `<serverUrl>#<roomId>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomToken {
    pub server_url: Option<String>,
    pub room_id: RoomId,
}

impl RoomToken {
    pub fn parse(input: &str) -> Result<Self, ServiceError> {
        let input = input.trim();
        let (server_url, room_id) = match input.rsplit_once('#') {
            Some((server, room)) => {
                let server = server.trim_end_matches('/');
                (Some(server.to_string()).filter(|s| !s.is_empty()), room)
            }
            None => (None, input),
        };

        if room_id.is_empty() {
            return Err(ServiceError::Rejected(format!("Invalid room token: {:?}", input)));
        }

        Ok(Self {
            server_url,
            room_id: room_id.to_string(),
        })
    }

    /// Server URL to connect to, falling back to `default_url`
    pub fn server_url_or<'a>(&'a self, default_url: &'a str) -> &'a str {
        self.server_url.as_deref().unwrap_or(default_url)
    }
}

/// What the host shares so others can join a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInvite {
    pub room_id: RoomId,
    /// `<serverUrl>#<roomId>`, accepted by `RoomToken::parse`
    pub url: String,
}

impl RoomInvite {
    pub fn new(server_url: &str, room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self {
            url: format!("{}#{}", server_url.trim_end_matches('/'), room_id),
            room_id,
        }
    }
}
