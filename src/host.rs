//! Collaborators provided by the host editor.
//!
//! The session manager depends on these traits for everything outside its core:
//! - Authentication token storage and the login flow
//! - User-facing notifications and progress indication
//! - Session status presentation
//! - Temporary workspace directories and opening projects
//!
//! `TracingHost`, `MemoryCredentials`, `LocalFs` and `LocalProjects` are
//! headless defaults suitable for the demo binary and tests.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::service::RoomInvite;
use crate::session::Target;

/// Errors reported by host collaborators
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Could not open workspace at {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Stores auth tokens per server and drives the login flow
pub trait AuthenticationService: Send + Sync {
    /// A server issued `token`; persist it for `server_url`
    fn on_authenticated(&self, token: &str, server_url: &str);

    /// Previously stored token for `server_url`
    fn auth_token(&self, server_url: &str) -> Option<String>;

    /// The server asked for a login to complete the request identified by `token`
    fn authenticate(&self, server_url: &str, token: &str, login_url: Option<&str>) {
        info!(
            "Login required for {} (request {}): {}",
            server_url,
            token,
            login_url.unwrap_or("no login page")
        );
    }
}

/// User-facing notifications
pub trait Notifier: Send + Sync {
    fn error(&self, error: &dyn std::error::Error, title: &str);

    /// A room was created; offer the invite for copying
    fn room_hosted(&self, invite: &RoomInvite);
}

/// Progress indication for long-running, cancellable operations
pub trait ProgressSurface: Send + Sync {
    /// `cancel` lets the surface abort the operation
    fn begin(&self, title: &str, cancel: CancellationToken);

    fn end(&self, title: &str);
}

/// Session status presentation (status bar widgets and the like)
pub trait StatusPresenter: Send + Sync {
    fn refresh(&self, target: &Target);
}

/// Filesystem operations on local workspaces
pub trait WorkspaceFs: Send + Sync {
    /// Create a fresh temporary directory whose name contains `name`
    fn create_temp_dir(&self, name: &str) -> io::Result<PathBuf>;

    /// Recursively delete `path`
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Opens a directory as a project in the host
pub trait ProjectOpener: Send + Sync {
    fn open(&self, root: &Path, name: &str) -> Result<Target, HostError>;
}

/// Bundle of host collaborators handed to the session manager
#[derive(Clone)]
pub struct HostServices {
    pub auth: Arc<dyn AuthenticationService>,
    pub notifier: Arc<dyn Notifier>,
    pub progress: Arc<dyn ProgressSurface>,
    pub status: Arc<dyn StatusPresenter>,
    pub fs: Arc<dyn WorkspaceFs>,
    pub projects: Arc<dyn ProjectOpener>,
}

impl HostServices {
    /// Headless collaborators that log instead of presenting UI
    pub fn headless() -> Self {
        let host = Arc::new(TracingHost);
        Self {
            auth: Arc::new(MemoryCredentials::new()),
            notifier: host.clone(),
            progress: host.clone(),
            status: host,
            fs: Arc::new(LocalFs),
            projects: Arc::new(LocalProjects),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthenticationService>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSurface>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_status(mut self, status: Arc<dyn StatusPresenter>) -> Self {
        self.status = status;
        self
    }

    pub fn with_fs(mut self, fs: Arc<dyn WorkspaceFs>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_projects(mut self, projects: Arc<dyn ProjectOpener>) -> Self {
        self.projects = projects;
        self
    }
}

/// In-memory token store
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthenticationService for MemoryCredentials {
    fn on_authenticated(&self, token: &str, server_url: &str) {
        self.tokens
            .write()
            .insert(server_url.to_string(), token.to_string());
        info!("Stored auth token for {}", server_url);
    }

    fn auth_token(&self, server_url: &str) -> Option<String> {
        self.tokens.read().get(server_url).cloned()
    }
}

/// Notifier, progress surface and status presenter that only log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHost;

impl Notifier for TracingHost {
    fn error(&self, err: &dyn std::error::Error, title: &str) {
        error!("{}: {}", title, err);
    }

    fn room_hosted(&self, invite: &RoomInvite) {
        info!("Hosted session {} - share {}", invite.room_id, invite.url);
    }
}

impl ProgressSurface for TracingHost {
    fn begin(&self, title: &str, _cancel: CancellationToken) {
        info!("{}", title);
    }

    fn end(&self, _title: &str) {}
}

impl StatusPresenter for TracingHost {
    fn refresh(&self, target: &Target) {
        info!("Session status changed for {}", target.name());
    }
}

/// Workspace directories on the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl WorkspaceFs for LocalFs {
    fn create_temp_dir(&self, name: &str) -> io::Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(name).tempdir()?;
        Ok(dir.keep())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }
}

/// Opens any existing directory as a project
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProjects;

impl ProjectOpener for LocalProjects {
    fn open(&self, root: &Path, name: &str) -> Result<Target, HostError> {
        if !root.is_dir() {
            return Err(HostError::OpenFailed {
                path: root.to_string_lossy().to_string(),
                reason: "not a directory".to_string(),
            });
        }

        Ok(Target::new(name, root.to_path_buf()))
    }
}
