//! In-process implementation of the remote session service.
//!
//! `MemoryServer` plays the role of the collaboration backend: it keeps rooms,
//! their authoritative documents and participant selections in memory.
//! `MemoryConnector` hands out one `MemoryClient` per backing connection.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    Connection, RemoteSessionService, RoomId, ServiceConnector, ServiceError, ServiceNotification,
    ServiceResult, SessionCreationResult, Workspace,
};
use crate::sync::protocol::{SelectionState, TextOperation};

/// A room hosted by the in-memory server
struct MemoryRoom {
    workspace: Workspace,
    /// Participant id of the host
    host_id: String,
    /// Document path -> authoritative text
    documents: DashMap<String, String>,
    /// (document path, participant id) -> selection
    selections: DashMap<(String, String), SelectionState>,
    /// Participant id -> notification channel
    participants: DashMap<String, mpsc::UnboundedSender<ServiceNotification>>,
}

impl MemoryRoom {
    fn new(workspace: Workspace, host_id: &str) -> Self {
        let documents = DashMap::new();
        for path in &workspace.files {
            documents.insert(path.clone(), String::new());
        }

        Self {
            workspace,
            host_id: host_id.to_string(),
            documents,
            selections: DashMap::new(),
            participants: DashMap::new(),
        }
    }

    /// Send a notification to every participant except `exclude`
    fn notify_others(&self, exclude: &str, notification: ServiceNotification) {
        for entry in self.participants.iter() {
            if entry.key() != exclude {
                let _ = entry.value().send(notification.clone());
            }
        }
    }
}

/// In-memory collaboration backend shared by all connections
pub struct MemoryServer {
    url: String,
    rooms: DashMap<RoomId, Arc<MemoryRoom>>,
    /// Issued auth token -> participant id
    issued_tokens: DashMap<String, String>,
    /// Login page advertised to unauthenticated connections
    login_url: Option<String>,
}

impl MemoryServer {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            rooms: DashMap::new(),
            issued_tokens: DashMap::new(),
            login_url: None,
        })
    }

    /// Ask unauthenticated connections to log in through `login_url`
    pub fn with_login(url: impl Into<String>, login_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            rooms: DashMap::new(),
            issued_tokens: DashMap::new(),
            login_url: Some(login_url.into()),
        })
    }

    /// URL clients connect with
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the number of open rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Check if a room exists
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Number of participants currently in a room
    pub fn participant_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.participants.len())
            .unwrap_or(0)
    }

    /// Authoritative text of a document
    pub fn document(&self, room_id: &str, path: &str) -> Option<String> {
        let room = self.rooms.get(room_id)?;
        let text = room.documents.get(path)?;
        Some(text.clone())
    }

    /// Apply an edit made by a participant outside of any local editor
    pub fn edit_document(&self, room_id: &str, path: &str, operation: &TextOperation) -> ServiceResult<()> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| ServiceError::RoomNotFound(room_id.to_string()))?;

        let mut text = room.documents.entry(path.to_string()).or_default();
        operation
            .apply_to(&mut text)
            .map_err(|e| ServiceError::Rejected(e.to_string()))
    }

    /// All selections currently published in a document
    pub fn selections(&self, room_id: &str, path: &str) -> Vec<SelectionState> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.selections
                    .iter()
                    .filter(|entry| entry.key().0 == path)
                    .map(|entry| entry.value().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `token` was issued by this server
    pub fn is_issued(&self, token: &str) -> bool {
        self.issued_tokens.contains_key(token)
    }

    fn issue_token(&self, participant_id: &str) -> String {
        let token = generate_auth_token();
        self.issued_tokens
            .insert(token.clone(), participant_id.to_string());
        token
    }
}

/// Connector handing out clients of a shared `MemoryServer`
#[derive(Clone)]
pub struct MemoryConnector {
    server: Arc<MemoryServer>,
}

impl MemoryConnector {
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self { server }
    }

    /// Server backing every client of this connector
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }
}

impl ServiceConnector for MemoryConnector {
    fn connect(&self, server_url: &str, auth_token: Option<String>) -> ServiceResult<Connection> {
        if server_url.trim_end_matches('/') != self.server.url.trim_end_matches('/') {
            return Err(ServiceError::Transport(format!("Unknown server: {}", server_url)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let authenticated = auth_token
            .as_deref()
            .map(|token| self.server.is_issued(token))
            .unwrap_or(false);

        let client = MemoryClient {
            server: self.server.clone(),
            participant_id: short_id(),
            room: Mutex::new(None),
            authenticated: Mutex::new(authenticated),
            tx,
        };

        if !authenticated {
            if let Some(login_url) = &self.server.login_url {
                let _ = client.tx.send(ServiceNotification::LoginRequired {
                    token: client.participant_id.clone(),
                    login_url: Some(login_url.clone()),
                });
            }
        }

        debug!("Memory client {} connected to {}", client.participant_id, server_url);

        Ok(Connection {
            service: Arc::new(client),
            notifications: rx,
        })
    }
}

/// One participant's connection to a `MemoryServer`
pub struct MemoryClient {
    server: Arc<MemoryServer>,
    participant_id: String,
    room: Mutex<Option<RoomId>>,
    authenticated: Mutex<bool>,
    tx: mpsc::UnboundedSender<ServiceNotification>,
}

impl MemoryClient {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    fn current_room(&self) -> Option<Arc<MemoryRoom>> {
        let room_id = self.room.lock().clone()?;
        self.server.rooms.get(&room_id).map(|room| room.clone())
    }

    /// Issue a token on first successful call of an unauthenticated client
    fn take_auth_token(&self) -> Option<String> {
        let mut authenticated = self.authenticated.lock();
        if *authenticated {
            return None;
        }
        *authenticated = true;
        Some(self.server.issue_token(&self.participant_id))
    }

    fn enter_room(&self, room_id: &str, room: &MemoryRoom) -> ServiceResult<()> {
        let mut current = self.room.lock();
        if current.is_some() {
            return Err(ServiceError::Rejected("Already in a session".to_string()));
        }
        room.participants
            .insert(self.participant_id.clone(), self.tx.clone());
        *current = Some(room_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl RemoteSessionService for MemoryClient {
    async fn create_room(&self, workspace: &Workspace) -> ServiceResult<SessionCreationResult> {
        let room_id = short_id();
        let room = Arc::new(MemoryRoom::new(workspace.clone(), &self.participant_id));

        self.enter_room(&room_id, &room)?;
        self.server.rooms.insert(room_id.clone(), room);

        info!("Created room: {} ({})", workspace.name, room_id);

        Ok(SessionCreationResult {
            room_id,
            workspace: workspace.clone(),
            auth_token: self.take_auth_token(),
        })
    }

    async fn join_room(&self, room_id: &str) -> ServiceResult<SessionCreationResult> {
        let room = self
            .server
            .rooms
            .get(room_id)
            .map(|room| room.clone())
            .ok_or_else(|| ServiceError::RoomNotFound(room_id.to_string()))?;

        self.enter_room(room_id, &room)?;
        room.notify_others(
            &self.participant_id,
            ServiceNotification::PeerJoined {
                room_id: room_id.to_string(),
                peer_id: self.participant_id.clone(),
            },
        );

        info!("Participant {} joined room {}", self.participant_id, room_id);

        Ok(SessionCreationResult {
            room_id: room_id.to_string(),
            workspace: room.workspace.clone(),
            auth_token: self.take_auth_token(),
        })
    }

    async fn close_session(&self) -> ServiceResult<()> {
        let room_id = self.room.lock().take().ok_or(ServiceError::NotInSession)?;
        let Some(room) = self.server.rooms.get(&room_id).map(|room| room.clone()) else {
            // The host already closed the room
            return Ok(());
        };

        room.participants.remove(&self.participant_id);
        room.selections
            .retain(|(_, participant), _| participant != &self.participant_id);

        if room.host_id == self.participant_id {
            self.server.rooms.remove(&room_id);
            room.notify_others(
                &self.participant_id,
                ServiceNotification::RoomClosed {
                    room_id: room_id.clone(),
                },
            );
            info!("Closed room: {}", room_id);
        } else {
            room.notify_others(
                &self.participant_id,
                ServiceNotification::PeerLeft {
                    room_id: room_id.clone(),
                    peer_id: self.participant_id.clone(),
                },
            );
            info!("Participant {} left room {}", self.participant_id, room_id);
        }

        Ok(())
    }

    fn update_document(&self, path: &str, operations: Vec<TextOperation>) {
        let Some(room) = self.current_room() else {
            warn!("Dropping update for {}: not in a session", path);
            return;
        };

        let mut text = room.documents.entry(path.to_string()).or_default();
        for operation in &operations {
            if let Err(e) = operation.apply_to(&mut text) {
                warn!("Rejected operation on {}: {}", path, e);
            }
        }
    }

    async fn document_content(&self, path: &str) -> ServiceResult<Option<Bytes>> {
        let room = self.current_room().ok_or(ServiceError::NotInSession)?;
        let content = room
            .documents
            .get(path)
            .map(|text| Bytes::from(text.clone()));
        Ok(content)
    }

    fn update_text_selection(&self, path: &str, selections: Vec<SelectionState>) {
        let Some(room) = self.current_room() else {
            return;
        };

        for selection in selections {
            let selection = selection.with_participant(self.participant_id.clone());
            room.selections.insert(
                (path.to_string(), self.participant_id.clone()),
                selection,
            );
        }
    }
}

/// Short room/participant identifier
fn short_id() -> String {
    uuid::Uuid::new_v4().to_string().chars().take(8).collect()
}

/// Generate an opaque auth token
fn generate_auth_token() -> String {
    use sha2::{Digest, Sha256};
    let random_bytes: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hex::encode(hasher.finalize())
}
