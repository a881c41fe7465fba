//! Collab Session demo
//!
//! Runs a host and a guest against an in-process session service:
//! the host shares a workspace, the guest joins it through the invite link,
//! both edit the same file and finally leave the room.

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use collab_session::host::Notifier;
use collab_session::service::memory::{MemoryConnector, MemoryServer};
use collab_session::{
    EditorBuffer, HostServices, MemoryBuffer, RoomInvite, SessionConfig, SessionEvent, SessionManager, Target,
    TextChange, Workspace,
};

/// Keeps the last invite so the guest can use it
#[derive(Default)]
struct InviteBox {
    invite: Mutex<Option<RoomInvite>>,
}

impl Notifier for InviteBox {
    fn error(&self, error: &dyn std::error::Error, title: &str) {
        tracing::error!("{}: {}", title, error);
    }

    fn room_hosted(&self, invite: &RoomInvite) {
        info!("Share this link to collaborate: {}", invite.url);
        *self.invite.lock() = Some(invite.clone());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_session=info".into()),
        )
        .init();

    let config = SessionConfig::from_env().context("Invalid configuration")?;
    info!("Using collaboration server {}", config.server_url);

    let server = MemoryServer::new(config.server_url.clone());
    let invites = Arc::new(InviteBox::default());

    let host = Arc::new(SessionManager::new(
        config.clone(),
        Arc::new(MemoryConnector::new(server.clone())),
        HostServices::headless().with_notifier(invites.clone()),
    ));
    let guest = Arc::new(SessionManager::new(
        config.clone(),
        Arc::new(MemoryConnector::new(server.clone())),
        HostServices::headless(),
    ));

    // Host shares the current directory
    let project = Target::new("demo", std::env::current_dir()?);
    let workspace = Workspace::new("demo").with_file("main.rs");
    let pending = host
        .create_room(workspace, &project)
        .ok_or_else(|| anyhow!("Could not start creating a room"))?;
    pending.wait().await;

    let host_session = host
        .session(&project)
        .ok_or_else(|| anyhow!("Room was not created"))?;
    let host_buffer = MemoryBuffer::new("");
    host_buffer.attach(host_session.bind_file("main.rs", host_buffer.clone())?);
    host_buffer.edit(TextChange::insert(0, "fn main() {}"))?;

    // Guest joins through the invite link
    let invite = invites
        .invite
        .lock()
        .clone()
        .ok_or_else(|| anyhow!("No invite was issued"))?;
    let mut guest_events = guest.subscribe();
    guest
        .join_room(&invite.url, None)
        .ok_or_else(|| anyhow!("Could not start joining the room"))?
        .wait()
        .await;

    let guest_session = match guest_events.recv().await? {
        SessionEvent::Created(session) => session,
        SessionEvent::Closed { .. } => return Err(anyhow!("Join did not establish a session")),
    };
    info!(
        "Guest opened {} at {}",
        guest_session.workspace().name,
        guest_session.target().root().display()
    );

    let guest_buffer = MemoryBuffer::new("");
    guest_buffer.attach(guest_session.bind_file("main.rs", guest_buffer.clone())?);
    guest_buffer.edit(TextChange::insert(0, "// shared\n"))?;
    tokio::time::sleep(config.poll_interval).await;

    info!(
        "Document on server: {:?}",
        server.document(host_session.room_id(), "main.rs")
    );
    info!("Guest buffer: {:?}", guest_buffer.text());

    // Guest leaves, then the host closes the room
    let guest_target = guest_session.target().clone();
    guest.close_current_session(&guest_target).await?;
    guest.target_closed(&guest_target)?;
    host.close_current_session(&project).await?;

    info!("Rooms left on server: {}", server.room_count());
    Ok(())
}

