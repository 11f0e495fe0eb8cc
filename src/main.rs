//! peerdrop - serverless device discovery and file-transfer coordination.
//!
//! Headless session daemon: joins the presence room, connects a relay when
//! one is configured, and logs session events until interrupted. Channel
//! failures degrade the session, they never end it; only an interrupt does.
//!
//! ## Testing with multiple instances on one machine
//!
//! Run two instances with different config directories:
//! ```bash
//! # Terminal 1
//! PEERDROP_CONFIG_DIR=/tmp/pd1 cargo run
//!
//! # Terminal 2
//! PEERDROP_CONFIG_DIR=/tmp/pd2 cargo run
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use peerdrop::app::state::{NoticeLevel, SessionEvent, SessionState};
use peerdrop::net::identity::{PeerIdentity, ProfileStore};
use peerdrop::net::presence::{LocalRoom, PresenceChannel};
use peerdrop::net::relay::{validate_endpoint, RelayClient, ValidatedEndpoint};
use peerdrop::net::transfer::{format_size, format_speed};

/// Relay endpoint override; takes precedence over the saved address.
const RELAY_ENV: &str = "PEERDROP_RELAY";

/// Capacity of the session event stream.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let store = ProfileStore::open().await?;
    let identity = PeerIdentity::load_or_create(&store).await?;

    let (session, events) = SessionState::new(identity, store, EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let presence_task = tokio::spawn(PresenceChannel::run(
        Arc::clone(&session.presence),
        Arc::clone(&session),
        Arc::new(LocalRoom::new()),
        cancel.clone(),
    ));

    let relay_task = match relay_endpoint(&session).await {
        Some(endpoint) => Some(tokio::spawn(RelayClient::run(
            Arc::clone(&session.relay),
            Arc::clone(&session),
            endpoint,
            cancel.clone(),
        ))),
        None => {
            info!("No relay endpoint configured, staying serverless");
            None
        }
    };

    let event_task = tokio::spawn(drain_events(events, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    session.begin_shutdown();
    cancel.cancel();

    // Give tasks a moment to leave their rooms and close sockets.
    tokio::time::sleep(Duration::from_millis(100)).await;

    presence_task.await?;
    if let Some(task) = relay_task {
        task.await?;
    }
    event_task.await?;

    info!("Session closed");
    Ok(())
}

/// Resolves the relay endpoint: env override first, then the saved address.
/// An invalid address is skipped with a warning rather than aborting startup.
async fn relay_endpoint(session: &SessionState) -> Option<ValidatedEndpoint> {
    let raw = match std::env::var(RELAY_ENV) {
        Ok(value) => Some(value),
        Err(_) => session.store.saved_relay_addr().await,
    }?;
    match validate_endpoint(&raw) {
        Ok(endpoint) => Some(endpoint),
        Err(error) => {
            warn!(%error, address = %raw, "Ignoring unusable relay address");
            None
        }
    }
}

/// Logs session events; the headless stand-in for a UI surface.
async fn drain_events(mut events: mpsc::Receiver<SessionEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            }
        }
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Notice { level, text } => match level {
            NoticeLevel::Warning => warn!(notice = %text, "Session notice"),
            NoticeLevel::Error => error!(notice = %text, "Session notice"),
            _ => info!(notice = %text, "Session notice"),
        },
        SessionEvent::RequestReceived { request } => {
            info!(
                peer = %request.peer.peer_id,
                name = %request.peer.name,
                password = request.requires_password,
                "Connection request awaiting consent"
            );
        }
        SessionEvent::ConnectionAdded { connection_id } => {
            info!(connection = %connection_id, "Connection added");
        }
        SessionEvent::ConnectionRemoved { connection_id } => {
            info!(connection = %connection_id, "Connection removed");
        }
        SessionEvent::TransferReady { connection_id } => {
            info!(connection = %connection_id, "Ready for file transfer");
        }
        SessionEvent::RosterChanged { channel, count } => {
            debug!(%channel, count, "Roster changed");
        }
        SessionEvent::FileOffered {
            peer_id,
            file_name,
            file_size,
            ..
        } => {
            info!(
                peer = %peer_id,
                file = %file_name,
                size = %format_size(*file_size),
                "Incoming file offer"
            );
        }
        SessionEvent::TransferProgress {
            file_id,
            percent,
            speed_bps,
        } => {
            debug!(file = file_id, percent, speed = %format_speed(*speed_bps), "Transfer progress");
        }
        SessionEvent::BatchFinished {
            connection_id,
            report,
        } => {
            info!(
                connection = %connection_id,
                completed = report.completed,
                errored = report.errored,
                declined = report.declined,
                cancelled = report.cancelled,
                "Batch finished"
            );
        }
    }
}

/// Initialize logging with tracing.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peerdrop=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
