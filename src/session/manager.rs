//! Session manager.
//!
//! Owns the per-target registries (backing processes, sessions, pending
//! creation tasks and workspaces marked for deletion) and drives the
//! create/join/close lifecycle:
//!
//! ```text
//! NoSession --create/join--> Pending --resolved--> Active --close--> NoSession
//!                               |
//!                               +--cancelled/failed--> NoSession
//! ```
//!
//! Registry locks are never held across an `.await` or while calling into
//! host collaborators.

use futures_util::{FutureExt, TryFutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::process::{BackingProcess, LoginHandler, MessageHandler};
use super::task::{CancellableTask, TaskState};
use super::{Session, SessionError, SessionEvent, Target, TargetId};
use crate::config::SessionConfig;
use crate::host::HostServices;
use crate::service::{
    RoomInvite, RoomToken, ServiceConnector, ServiceError, SessionCreationResult, Workspace,
};

const CREATE_TITLE: &str = "Creating room...";
const JOIN_TITLE: &str = "Joining room...";
const CREATE_ERROR_TITLE: &str = "Error Creating Room";
const JOIN_ERROR_TITLE: &str = "Error Joining Room";
const OPEN_ERROR_TITLE: &str = "Could not create project for session";
const CLOSE_ERROR_TITLE: &str = "Error Closing Session";

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 64;

/// Handle on a pending create/join call
pub struct PendingSession {
    cancel: CancellationToken,
    handle: JoinHandle<TaskState>,
}

impl PendingSession {
    /// Request cancellation; a no-op once the call resolved
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling the call, for progress surfaces
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the call and its completion handling finished
    pub async fn wait(self) -> TaskState {
        match self.handle.await {
            Ok(state) => state,
            Err(e) => {
                warn!("Session task did not finish: {}", e);
                TaskState::Failed
            }
        }
    }
}

struct PendingEntry {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    processes: HashMap<TargetId, Arc<BackingProcess>>,
    sessions: HashMap<TargetId, Arc<Session>>,
    pending: HashMap<TargetId, PendingEntry>,
    to_delete: HashMap<TargetId, PathBuf>,
}

impl Registry {
    fn is_busy(&self, id: &TargetId) -> bool {
        self.sessions.contains_key(id) || self.pending.contains_key(id)
    }

    /// Remove the pending entry of `task_id`; `false` if a close already took it
    fn claim_pending(&mut self, id: &TargetId, task_id: u64) -> bool {
        if self.pending.get(id).map(|entry| entry.id) == Some(task_id) {
            self.pending.remove(id);
            true
        } else {
            false
        }
    }
}

/// What to do after a create/join call resolved
enum Outcome {
    Established,
    /// Leave the remote session, release the process and remove the directory
    Abandoned(Option<PathBuf>),
}

/// Registry and lifecycle of collaboration sessions
pub struct SessionManager {
    config: SessionConfig,
    connector: Arc<dyn ServiceConnector>,
    host: HostServices,
    handlers: Vec<Arc<dyn MessageHandler>>,
    runtime: Handle,
    registry: Mutex<Registry>,
    next_task_id: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Create a manager bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; use `with_runtime` there.
    pub fn new(config: SessionConfig, connector: Arc<dyn ServiceConnector>, host: HostServices) -> Self {
        Self::with_runtime(config, connector, host, Handle::current())
    }

    /// Create a manager spawning its tasks on `runtime`
    pub fn with_runtime(
        config: SessionConfig,
        connector: Arc<dyn ServiceConnector>,
        host: HostServices,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let login: Arc<dyn MessageHandler> = Arc::new(LoginHandler::new(host.auth.clone()));

        Self {
            config,
            connector,
            host,
            handlers: vec![login],
            runtime,
            registry: Mutex::new(Registry::default()),
            next_task_id: AtomicU64::new(1),
            events,
        }
    }

    /// Route backing service notifications to an additional handler
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Configuration the manager was created with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session created/closed events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether `target` has an established session
    pub fn has_open_session(&self, target: &Target) -> bool {
        self.registry.lock().sessions.contains_key(&target.id())
    }

    /// Established session of `target`
    pub fn session(&self, target: &Target) -> Option<Arc<Session>> {
        self.registry.lock().sessions.get(&target.id()).cloned()
    }

    /// All established sessions
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry.lock().sessions.values().cloned().collect()
    }

    /// Whether a create/join call started from `target` is still pending
    pub fn is_pending(&self, target: &Target) -> bool {
        self.registry.lock().pending.contains_key(&target.id())
    }

    /// Backing process registered for `target`
    pub fn process(&self, target: &Target) -> Option<Arc<BackingProcess>> {
        self.registry.lock().processes.get(&target.id()).cloned()
    }

    /// Number of registered backing processes
    pub fn process_count(&self) -> usize {
        self.registry.lock().processes.len()
    }

    /// Host `target` in a new room.
    ///
    /// Returns `None` without contacting the service when the target already
    /// has an open or pending session, or when no connection could be made.
    pub fn create_room(self: &Arc<Self>, workspace: Workspace, target: &Target) -> Option<PendingSession> {
        let id = target.id();
        let server_url = self.config.server_url.clone();

        let (process, cancel, task_id) = {
            let mut registry = self.registry.lock();
            if registry.is_busy(&id) {
                debug!("Target {} already has a session, ignoring create", target.name());
                return None;
            }

            let existing = registry.processes.get(&id).cloned();
            let process = match existing {
                Some(process) => process,
                None => match self.start_process(&server_url) {
                    Ok(process) => {
                        registry.processes.insert(id, process.clone());
                        process
                    }
                    Err(e) => {
                        drop(registry);
                        self.report(&e, CREATE_ERROR_TITLE);
                        return None;
                    }
                },
            };

            let cancel = CancellationToken::new();
            let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
            registry.pending.insert(
                id,
                PendingEntry {
                    id: task_id,
                    cancel: cancel.clone(),
                },
            );
            (process, cancel, task_id)
        };

        info!("Creating room for {} on {}", target.name(), server_url);

        let service = process.service();
        let notifier = self.host.notifier.clone();
        let future = async move { service.create_room(&workspace).await }
            .inspect_err(move |e| {
                warn!("{}: {}", CREATE_ERROR_TITLE, e);
                notifier.error(e, CREATE_ERROR_TITLE);
            })
            .boxed();
        let task = CancellableTask::new(CREATE_TITLE, future, self.config.poll_interval)
            .with_cancel_token(cancel.clone());

        let manager = self.clone();
        let target = target.clone();
        let handle = self.runtime.spawn(async move {
            let mut outcome = Outcome::Established;
            let state = task
                .run(manager.host.progress.as_ref(), |data| {
                    outcome = manager.room_created(data, &server_url, &target, task_id);
                })
                .await;

            if state != TaskState::Resolved {
                manager.registry.lock().claim_pending(&target.id(), task_id);
            } else if let Outcome::Abandoned(root) = outcome {
                manager.abandon(&process, root).await;
            }
            state
        });

        Some(PendingSession { cancel, handle })
    }

    /// Join the room named by `token` (`<roomId>` or `<serverUrl>#<roomId>`).
    ///
    /// The joined workspace is opened as a new target in a fresh temporary
    /// directory. `origin` is the target the request was issued from; the
    /// call is ignored while that target has an open or pending session.
    pub fn join_room(self: &Arc<Self>, token: &str, origin: Option<&Target>) -> Option<PendingSession> {
        let room_token = match RoomToken::parse(token) {
            Ok(room_token) => room_token,
            Err(e) => {
                self.report(&e, JOIN_ERROR_TITLE);
                return None;
            }
        };
        let server_url = room_token.server_url_or(&self.config.server_url).to_string();

        let cancel = CancellationToken::new();
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let origin_id = origin.map(Target::id);

        if let Some(origin_id) = origin_id {
            let mut registry = self.registry.lock();
            if registry.is_busy(&origin_id) {
                debug!("Origin target already has a session, ignoring join");
                return None;
            }
            registry.pending.insert(
                origin_id,
                PendingEntry {
                    id: task_id,
                    cancel: cancel.clone(),
                },
            );
        }

        let process = match self.start_process(&server_url) {
            Ok(process) => process,
            Err(e) => {
                if let Some(origin_id) = origin_id {
                    self.registry.lock().claim_pending(&origin_id, task_id);
                }
                self.report(&e, JOIN_ERROR_TITLE);
                return None;
            }
        };

        info!("Joining room {} on {}", room_token.room_id, server_url);

        let service = process.service();
        let notifier = self.host.notifier.clone();
        let room_id = room_token.room_id;
        let future = async move { service.join_room(&room_id).await }
            .inspect_err(move |e| {
                warn!("{}: {}", JOIN_ERROR_TITLE, e);
                notifier.error(e, JOIN_ERROR_TITLE);
            })
            .boxed();
        let task = CancellableTask::new(JOIN_TITLE, future, self.config.poll_interval)
            .with_cancel_token(cancel.clone());

        let manager = self.clone();
        let handle = self.runtime.spawn(async move {
            let mut outcome = Outcome::Established;
            let claim = origin_id.map(|origin_id| (origin_id, task_id));
            let state = task
                .run(manager.host.progress.as_ref(), |data| {
                    outcome = manager.room_joined(data, &server_url, &process, claim);
                })
                .await;

            if state != TaskState::Resolved {
                process.dispose();
            } else if let Outcome::Abandoned(root) = outcome {
                manager.abandon(&process, root).await;
            }

            if let Some(origin_id) = origin_id {
                manager.registry.lock().claim_pending(&origin_id, task_id);
            }
            state
        });

        Some(PendingSession { cancel, handle })
    }

    /// Close the session of `target`, cancelling a pending create/join first.
    ///
    /// Local resources are released even when the remote close fails or
    /// times out. A joined workspace is marked for deletion once the target
    /// itself is closed.
    pub async fn close_current_session(&self, target: &Target) -> Result<(), SessionError> {
        let id = target.id();
        let (process, session) = {
            let mut registry = self.registry.lock();
            if let Some(pending) = registry.pending.remove(&id) {
                pending.cancel.cancel();
                debug!("Cancelled pending session task for {}", target.name());
            }
            (registry.processes.remove(&id), registry.sessions.remove(&id))
        };

        let result = match (process, session) {
            (Some(process), session) => {
                if let Some(session) = &session {
                    self.close_remote(&process, session).await;
                }
                process.dispose();

                if let Some(session) = session {
                    session.dispose();
                    if !session.is_host() {
                        self.registry
                            .lock()
                            .to_delete
                            .insert(id, target.root().to_path_buf());
                    }
                    info!("Closed session {} for {}", session.room_id(), target.name());
                    let _ = self.events.send(SessionEvent::Closed {
                        target: id,
                        room_id: session.room_id().to_string(),
                    });
                }
                Ok(())
            }
            (None, Some(session)) => {
                session.dispose();
                let e = SessionError::StateViolation(format!(
                    "session {} has no backing process",
                    session.room_id()
                ));
                self.report(&e, CLOSE_ERROR_TITLE);
                Err(e)
            }
            (None, None) => Ok(()),
        };

        self.host.status.refresh(target);
        result
    }

    /// The host closed `target`; delete its workspace if it was marked
    pub fn target_closed(&self, target: &Target) -> Result<(), SessionError> {
        let root = self.registry.lock().to_delete.remove(&target.id());
        if let Some(root) = root {
            info!("Deleting joined workspace {}", root.display());
            self.host.fs.remove_dir_all(&root)?;
        }
        Ok(())
    }

    /// Close every open session
    pub async fn close_all(&self) {
        for session in self.sessions() {
            if let Err(e) = self.close_current_session(session.target()).await {
                warn!("Failed to close session {}: {}", session.room_id(), e);
            }
        }

        let processes: Vec<_> = self.registry.lock().processes.drain().collect();
        for (_, process) in processes {
            process.dispose();
        }
    }

    fn start_process(&self, server_url: &str) -> Result<Arc<BackingProcess>, ServiceError> {
        let token = self.host.auth.auth_token(server_url);
        let connection = self.connector.connect(server_url, token)?;
        Ok(BackingProcess::start(
            server_url,
            connection,
            self.handlers.clone(),
            &self.runtime,
        ))
    }

    fn room_created(&self, data: SessionCreationResult, server_url: &str, target: &Target, task_id: u64) -> Outcome {
        let invite = RoomInvite::new(server_url, data.room_id.as_str());

        match self.session_established(data, server_url, target, true, Some(task_id)) {
            Ok(_) => {
                self.host.notifier.room_hosted(&invite);
                Outcome::Established
            }
            Err(SessionError::SessionClosed) => {
                info!("Room {} was closed before it was established", invite.room_id);
                Outcome::Abandoned(None)
            }
            Err(e) => {
                self.report(&e, CREATE_ERROR_TITLE);
                Outcome::Abandoned(None)
            }
        }
    }

    fn room_joined(
        &self,
        data: SessionCreationResult,
        server_url: &str,
        process: &Arc<BackingProcess>,
        origin: Option<(TargetId, u64)>,
    ) -> Outcome {
        if let Some((origin_id, task_id)) = origin {
            if !self.registry.lock().claim_pending(&origin_id, task_id) {
                info!("Join of room {} was closed before it completed", data.room_id);
                return Outcome::Abandoned(None);
            }
        }

        let name = data.workspace.name.clone();

        let root = match self.host.fs.create_temp_dir(&name) {
            Ok(root) => root,
            Err(e) => {
                self.report(&SessionError::Io(e), OPEN_ERROR_TITLE);
                return Outcome::Abandoned(None);
            }
        };

        let target = match self.host.projects.open(&root, &name) {
            Ok(target) => target,
            Err(e) => {
                self.report(&SessionError::Workspace(e), OPEN_ERROR_TITLE);
                return Outcome::Abandoned(Some(root));
            }
        };

        self.registry.lock().processes.insert(target.id(), process.clone());

        match self.session_established(data, server_url, &target, false, None) {
            Ok(_) => Outcome::Established,
            Err(e) => {
                self.registry.lock().processes.remove(&target.id());
                self.report(&e, JOIN_ERROR_TITLE);
                Outcome::Abandoned(None)
            }
        }
    }

    fn session_established(
        &self,
        data: SessionCreationResult,
        server_url: &str,
        target: &Target,
        is_host: bool,
        task_id: Option<u64>,
    ) -> Result<Arc<Session>, SessionError> {
        if let Some(token) = &data.auth_token {
            self.host.auth.on_authenticated(token, server_url);
        }

        let id = target.id();
        let session = {
            let mut registry = self.registry.lock();
            // A close that ran while the call resolved already took the entry
            if let Some(task_id) = task_id {
                if !registry.claim_pending(&id, task_id) {
                    return Err(SessionError::SessionClosed);
                }
            }

            let process = registry.processes.get(&id).cloned().ok_or_else(|| {
                error!("No backing process registered for {}", target.name());
                SessionError::StateViolation(format!(
                    "no backing process registered for {}",
                    target.name()
                ))
            })?;

            let session = Arc::new(Session::new(
                data,
                server_url,
                target.clone(),
                process.service(),
                is_host,
                self.runtime.clone(),
            ));
            process.register(session.clone())?;
            registry.sessions.insert(id, session.clone());
            session
        };

        info!(
            "Session {} established for {} (host: {})",
            session.room_id(),
            target.name(),
            is_host
        );

        let _ = self.events.send(SessionEvent::Created(session.clone()));
        self.host.status.refresh(target);
        Ok(session)
    }

    /// Leave a resolved session that has no local owner
    async fn abandon(&self, process: &Arc<BackingProcess>, root: Option<PathBuf>) {
        match tokio::time::timeout(self.config.close_timeout, process.service().close_session()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to leave abandoned session: {}", e),
            Err(_) => warn!("Timed out leaving abandoned session"),
        }
        process.dispose();

        if let Some(root) = root {
            if let Err(e) = self.host.fs.remove_dir_all(&root) {
                warn!("Failed to remove {}: {}", root.display(), e);
            }
        }
    }

    async fn close_remote(&self, process: &BackingProcess, session: &Session) {
        let closing = process.service();
        match tokio::time::timeout(self.config.close_timeout, closing.close_session()).await {
            Ok(Ok(())) => debug!("Remote session {} closed", session.room_id()),
            Ok(Err(e)) => self.report(&SessionError::Service(e), CLOSE_ERROR_TITLE),
            Err(_) => {
                let e = ServiceError::Timeout("session close");
                self.report(&SessionError::Service(e), CLOSE_ERROR_TITLE);
            }
        }
    }

    fn report(&self, err: &(dyn std::error::Error + 'static), title: &str) {
        error!("{}: {}", title, err);
        self.host.notifier.error(err, title);
    }
}
