//! Backing process handles.
//!
//! A `BackingProcess` owns one connection to the remote session service. It
//! routes the service's notifications to the registered message handlers and
//! owns the sessions established through it: disposing the handle disposes
//! those sessions (and their file bindings) first, then stops routing.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Session, SessionError};
use crate::host::AuthenticationService;
use crate::service::{Connection, RemoteSessionService, ServiceNotification};

/// Receiver of notifications from a backing service
pub trait MessageHandler: Send + Sync {
    /// Returns `true` when the notification was handled
    fn handle(&self, server_url: &str, notification: &ServiceNotification) -> bool;
}

/// Routes login requests to the authentication collaborator
pub struct LoginHandler {
    auth: Arc<dyn AuthenticationService>,
}

impl LoginHandler {
    pub fn new(auth: Arc<dyn AuthenticationService>) -> Self {
        Self { auth }
    }
}

impl MessageHandler for LoginHandler {
    fn handle(&self, server_url: &str, notification: &ServiceNotification) -> bool {
        match notification {
            ServiceNotification::LoginRequired { token, login_url } => {
                self.auth.authenticate(server_url, token, login_url.as_deref());
                true
            }
            _ => false,
        }
    }
}

/// Owned connection to the remote session service
pub struct BackingProcess {
    id: uuid::Uuid,
    server_url: String,
    service: Arc<dyn RemoteSessionService>,
    sessions: Mutex<Vec<Arc<Session>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl BackingProcess {
    /// Take ownership of `connection` and start routing its notifications
    pub fn start(
        server_url: impl Into<String>,
        connection: Connection,
        handlers: Vec<Arc<dyn MessageHandler>>,
        runtime: &Handle,
    ) -> Arc<Self> {
        let server_url = server_url.into();
        let Connection {
            service,
            mut notifications,
        } = connection;

        let router_url = server_url.clone();
        let router = runtime.spawn(async move {
            while let Some(notification) = notifications.recv().await {
                route(&router_url, &handlers, &notification);
            }
            debug!("Notification stream of {} ended", router_url);
        });

        let process = Arc::new(Self {
            id: uuid::Uuid::new_v4(),
            server_url,
            service,
            sessions: Mutex::new(Vec::new()),
            router: Mutex::new(Some(router)),
            disposed: AtomicBool::new(false),
        });

        info!("Started backing process {} for {}", process.id, process.server_url);
        process
    }

    /// Unique handle identifier
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Server the connection was made to
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Remote service of this connection
    pub fn service(&self) -> Arc<dyn RemoteSessionService> {
        self.service.clone()
    }

    /// Whether `dispose` has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tie `session` to this handle so disposing the handle disposes it
    pub fn register(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        if self.is_disposed() {
            session.dispose();
            return Err(SessionError::StateViolation(format!(
                "backing process {} is already disposed",
                self.id
            )));
        }
        sessions.push(session);
        Ok(())
    }

    /// Number of sessions owned by this handle
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Dispose owned sessions, then stop routing notifications. Idempotent.
    pub fn dispose(&self) {
        let sessions = {
            let mut sessions = self.sessions.lock();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *sessions)
        };

        for session in &sessions {
            session.dispose();
        }

        if let Some(router) = self.router.lock().take() {
            router.abort();
        }

        info!("Disposed backing process {} for {}", self.id, self.server_url);
    }
}

impl Drop for BackingProcess {
    fn drop(&mut self) {
        if let Some(router) = self.router.get_mut().take() {
            router.abort();
        }
    }
}

/// Offer a notification to every handler
fn route(server_url: &str, handlers: &[Arc<dyn MessageHandler>], notification: &ServiceNotification) {
    let mut handled = false;
    for handler in handlers {
        handled |= handler.handle(server_url, notification);
    }

    if !handled {
        debug!("Unhandled notification from {}: {:?}", server_url, notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::memory::{MemoryConnector, MemoryServer};
    use crate::service::{ServiceConnector, SessionCreationResult, Workspace};
    use crate::session::Target;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const URL: &str = "http://collab.test";

    #[derive(Default)]
    struct LoginRecorder {
        requests: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl AuthenticationService for LoginRecorder {
        fn on_authenticated(&self, _token: &str, _server_url: &str) {}

        fn auth_token(&self, _server_url: &str) -> Option<String> {
            None
        }

        fn authenticate(&self, server_url: &str, token: &str, login_url: Option<&str>) {
            self.requests.lock().push((
                server_url.to_string(),
                token.to_string(),
                login_url.map(str::to_string),
            ));
        }
    }

    fn session_for(process: &BackingProcess) -> Arc<Session> {
        Arc::new(Session::new(
            SessionCreationResult {
                room_id: "room".to_string(),
                workspace: Workspace::new("proj"),
                auth_token: None,
            },
            URL,
            Target::new("proj", "/tmp/proj"),
            process.service(),
            true,
            Handle::current(),
        ))
    }

    #[tokio::test]
    async fn test_login_notification_is_routed() {
        let auth = Arc::new(LoginRecorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector::new(MemoryServer::new(URL));
        let service = connector.connect(URL, None).unwrap().service;
        let handler: Arc<dyn MessageHandler> = Arc::new(LoginHandler::new(auth.clone()));

        let process = BackingProcess::start(
            URL,
            Connection {
                service,
                notifications: rx,
            },
            vec![handler],
            &Handle::current(),
        );

        tx.send(ServiceNotification::RoomClosed { room_id: "r".into() }).unwrap();
        tx.send(ServiceNotification::LoginRequired {
            token: "req-1".into(),
            login_url: Some("http://collab.test/login".into()),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *auth.requests.lock(),
            vec![(URL.to_string(), "req-1".to_string(), Some("http://collab.test/login".to_string()))]
        );
        process.dispose();
    }

    #[tokio::test]
    async fn test_dispose_cascades_to_sessions() {
        let connector = MemoryConnector::new(MemoryServer::new(URL));
        let process = BackingProcess::start(URL, connector.connect(URL, None).unwrap(), Vec::new(), &Handle::current());

        let session = session_for(&process);
        process.register(session.clone()).unwrap();
        assert_eq!(process.session_count(), 1);

        process.dispose();
        process.dispose();

        assert!(process.is_disposed());
        assert!(!session.is_active());
        assert_eq!(process.session_count(), 0);
    }

    #[tokio::test]
    async fn test_register_after_dispose_fails() {
        let connector = MemoryConnector::new(MemoryServer::new(URL));
        let process = BackingProcess::start(URL, connector.connect(URL, None).unwrap(), Vec::new(), &Handle::current());
        process.dispose();

        let session = session_for(&process);
        assert!(matches!(
            process.register(session.clone()),
            Err(SessionError::StateViolation(_))
        ));
        assert!(!session.is_active());
    }
}
