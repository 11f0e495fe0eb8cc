//! Session state and the unified inbound dispatcher
//!
//! A [`SessionState`] ties one local identity to everything that acts on its
//! behalf: the connection registry, the file queue, the consent gate, the
//! discovery channels, and the transfer coordinator. Channels stay dumb on
//! purpose. They decode frames, attribute a sender, and hand everything that
//! is not channel bookkeeping to [`SessionState::dispatch`], the single
//! place where protocol messages change session state.
//!
//! Sender attribution is the dispatcher's one hard rule: the id the channel
//! vouches for wins over whatever the payload claims about itself. A room
//! transport passes the room member id it received the frame from; the
//! relay passes the payload id because that is all a relayed frame carries.
//! Either way the payload's self-reported id is overwritten before anything
//! downstream sees it.
//!
//! Everything user-facing leaves through the [`EventSink`] as
//! [`SessionEvent`]s. The sink never blocks a network task: when the
//! consumer lags, events are dropped and counted instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::files::FileQueue;
use crate::net::connection::{ChannelKind, Connection, ConnectionRegistry};
use crate::net::identity::{PeerIdentity, ProfileStore};
use crate::net::message::PeerMessage;
use crate::net::negotiation::{ConnectionRequest, Negotiator, Responder};
use crate::net::presence::PresenceChannel;
use crate::net::relay::RelayClient;
use crate::net::transfer::{BatchReport, TransferCoordinator, TransferError};

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NoticeLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the session reports outward.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A transient user-facing message.
    Notice { level: NoticeLevel, text: String },
    /// An inbound connection request took the pending slot.
    RequestReceived { request: ConnectionRequest },
    /// A connection was registered, either side of the handshake.
    ConnectionAdded { connection_id: String },
    /// A connection was dropped on request.
    ConnectionRemoved { connection_id: String },
    /// The registered connection is ready to carry files.
    TransferReady { connection_id: String },
    /// A discovery roster was replaced or changed size.
    RosterChanged { channel: ChannelKind, count: usize },
    /// A peer announced a file it wants to send us.
    FileOffered {
        peer_id: String,
        channel: ChannelKind,
        file_id: u64,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    /// Chunk-level progress of an outgoing file.
    TransferProgress {
        file_id: u64,
        percent: u8,
        speed_bps: f64,
    },
    /// A transfer batch ran to its end.
    BatchFinished {
        connection_id: String,
        report: BatchReport,
    },
}

/// Non-blocking fan-in for [`SessionEvent`]s.
///
/// Cloned into every task that produces events. `emit` never waits; a full
/// or missing consumer costs the event, not the sender.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Creates a sink and its consumer end.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queues an event, dropping it when the consumer cannot keep up.
    pub fn emit(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(total, "Event consumer lagging, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("No event consumer, event dropped");
            }
        }
    }

    /// Events lost to a lagging consumer so far.
    #[inline]
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(SessionEvent::Notice {
            level,
            text: text.into(),
        });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.notice(NoticeLevel::Info, text);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.notice(NoticeLevel::Success, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.notice(NoticeLevel::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.notice(NoticeLevel::Error, text);
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

/// One running session: identity, registries, channels, coordinator.
pub struct SessionState {
    pub identity: Arc<RwLock<PeerIdentity>>,
    pub store: ProfileStore,
    pub connections: ConnectionRegistry,
    pub files: FileQueue,
    pub events: EventSink,
    pub negotiator: Negotiator,
    pub presence: Arc<PresenceChannel>,
    pub relay: Arc<RelayClient>,
    pub transfers: TransferCoordinator,
    shutdown: AtomicBool,
}

impl SessionState {
    /// Builds a session over the pacing-only transport.
    #[must_use]
    pub fn new(
        identity: PeerIdentity,
        store: ProfileStore,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        Self::with_transport(identity, store, capacity, TransferCoordinator::simulated())
    }

    /// Builds a session with a specific transfer coordinator.
    #[must_use]
    pub fn with_transport(
        identity: PeerIdentity,
        store: ProfileStore,
        capacity: usize,
        transfers: TransferCoordinator,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let identity = Arc::new(RwLock::new(identity));
        let connections = ConnectionRegistry::new();
        let (events, receiver) = EventSink::bounded(capacity);
        let negotiator = Negotiator::new(
            Arc::clone(&identity),
            store.clone(),
            connections.clone(),
            events.clone(),
        );
        let state = Arc::new(Self {
            identity,
            store,
            connections,
            files: FileQueue::new(),
            events,
            negotiator,
            presence: Arc::new(PresenceChannel::new()),
            relay: Arc::new(RelayClient::new()),
            transfers,
            shutdown: AtomicBool::new(false),
        });
        (state, receiver)
    }

    /// Marks the session as shutting down. Inbound frames are dropped from
    /// here on; running tasks stop through their cancellation tokens.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("Session shutdown requested");
    }

    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Routes one inbound protocol message from any channel.
    ///
    /// `from` is the sender id the channel itself attributes; it overwrites
    /// the payload's self-reported id before anything else runs. `responder`
    /// answers back over the originating channel and is consumed by the
    /// request path.
    #[instrument(skip(self, msg, responder), fields(%channel, %from))]
    pub async fn dispatch(
        &self,
        channel: ChannelKind,
        from: &str,
        mut msg: PeerMessage,
        responder: Responder,
    ) {
        if self.is_shutdown() {
            debug!(tag = msg.tag(), "Session shutting down, frame dropped");
            return;
        }

        match msg {
            PeerMessage::ConnectionRequest { .. } => {
                let Some(mut peer) = msg.peer_info() else {
                    warn!("Connection request without sender info");
                    return;
                };
                peer.peer_id = from.to_string();
                // SlotBusy was already answered through the responder.
                let _ = self.negotiator.offer(peer, channel, responder).await;
            }
            PeerMessage::ConnectionResponse { .. } => {
                if let PeerMessage::ConnectionResponse { ref mut peer_id, .. } = msg {
                    *peer_id = from.to_string();
                }
                self.negotiator.handle_response(&msg);
            }
            PeerMessage::FileOffer {
                file_id,
                file_name,
                file_size,
                file_type,
            } => {
                info!(file = %file_name, size = file_size, "Incoming file offer");
                self.events.emit(SessionEvent::FileOffered {
                    peer_id: from.to_string(),
                    channel,
                    file_id,
                    file_name,
                    file_size,
                    file_type,
                });
            }
            PeerMessage::FileAccept { file_id } => {
                if !self.transfers.resolve_offer(file_id, true) {
                    debug!(file = file_id, "Acceptance for a file nobody offered");
                }
            }
            PeerMessage::FileReject { file_id, file_name } => {
                // A waiting batch surfaces the refusal itself.
                if !self.transfers.resolve_offer(file_id, false) {
                    self.events.warning(format!("{file_name} was declined"));
                }
            }
            other => {
                debug!(tag = other.tag(), "Frame outside the dispatch set dropped");
            }
        }
    }

    /// Reply path for announcing files on this connection, where one
    /// exists. Presence peers are reachable in the room; the relay never
    /// carries file frames and the offline channels are one-shot, so files
    /// to those go without asking first.
    #[must_use]
    pub fn file_offer_path(&self, connection: &Connection) -> Option<Responder> {
        match connection.channel {
            ChannelKind::Presence => {
                let peer_id = connection
                    .id
                    .strip_prefix("P2P-")
                    .unwrap_or(&connection.id);
                Some(self.presence.responder_to(peer_id))
            }
            _ => None,
        }
    }

    /// Drops a registered connection. Removal is the only disconnect in
    /// this system; there is no teardown handshake to run.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        match self.connections.remove(connection_id) {
            Some(connection) => {
                self.events
                    .info(format!("Disconnected from {}", connection.name));
                self.events.emit(SessionEvent::ConnectionRemoved {
                    connection_id: connection_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Sends every pending file to one connection, announcing each file
    /// first when the channel supports it.
    pub async fn send_files_to(
        &self,
        connection_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, TransferError> {
        let offer = self
            .connections
            .get(connection_id)
            .and_then(|conn| self.file_offer_path(&conn));
        self.transfers
            .send_files(self, connection_id, offer, cancel)
            .await
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("connections", &self.connections.len())
            .field("files", &self.files.len())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
