//! Connection negotiation
//!
//! Inbound connection requests flow through a single consent gate. Exactly
//! one request may be pending at a time: while the slot is occupied, further
//! requesters are refused immediately with `accepted: false` and the holder
//! keeps its place. A pending request either times out with its channel,
//! gets rejected, or gets accepted, optionally after a password check.
//!
//! A wrong or missing password leaves the request pending so the user can
//! retry; the requester is not notified of failed attempts. Acceptance
//! registers the connection and answers `accepted: true` with the local
//! identity; rejection answers `accepted: false`. Responses travel back
//! through whatever channel carried the request, so the caller hands the
//! negotiator a responder closure along with each offer.
//!
//! Outbound requests are tracked symmetrically: a positive response from a
//! peer we actually asked registers the same prefixed connection id on this
//! side. Responses from peers we never asked are ignored.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::app::state::{EventSink, SessionEvent};
use crate::net::connection::{ChannelKind, Connection, ConnectionRegistry, DiscoveredPeer};
use crate::net::identity::{PeerIdentity, ProfileStore};
use crate::net::message::PeerMessage;

/// Sends a reply back to a requesting peer over its originating channel.
/// Best effort; delivery failures are the channel's problem.
pub type Responder = Box<dyn Fn(PeerMessage) + Send + Sync>;

/// Negotiation errors. None of them disturb registered connections.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NegotiationError {
    /// A request is already pending; the new one was refused.
    #[error("another connection request is already pending")]
    SlotBusy,

    /// Accept or reject called with nothing pending.
    #[error("no connection request is pending")]
    NoPending,

    /// Password missing or wrong. The request stays pending for a retry.
    #[error("connection password missing or wrong")]
    PasswordMismatch,
}

/// An inbound request awaiting the user's decision.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub peer: DiscoveredPeer,
    pub channel: ChannelKind,
    /// Whether acceptance will demand the local connection password.
    pub requires_password: bool,
}

struct PendingRequest {
    request: ConnectionRequest,
    responder: Responder,
}

/// The consent gate. One per session; every channel feeds it.
pub struct Negotiator {
    identity: Arc<RwLock<PeerIdentity>>,
    store: ProfileStore,
    registry: ConnectionRegistry,
    events: EventSink,
    pending: Mutex<Option<PendingRequest>>,
    /// Outbound requests in flight, keyed by target peer id.
    outbound: DashMap<String, ChannelKind>,
}

impl Negotiator {
    #[must_use]
    pub fn new(
        identity: Arc<RwLock<PeerIdentity>>,
        store: ProfileStore,
        registry: ConnectionRegistry,
        events: EventSink,
    ) -> Self {
        Self {
            identity,
            store,
            registry,
            events,
            pending: Mutex::new(None),
            outbound: DashMap::new(),
        }
    }

    /// Snapshot of the pending request, if any.
    #[must_use]
    pub fn pending(&self) -> Option<ConnectionRequest> {
        self.pending.lock().as_ref().map(|p| p.request.clone())
    }

    /// Offers an inbound request to the gate.
    ///
    /// While another request is pending the new one is refused: its
    /// responder receives `accepted: false` and `SlotBusy` is returned. The
    /// slot holder is never displaced.
    #[instrument(skip(self, responder), fields(peer = %peer.peer_id, %channel))]
    pub async fn offer(
        &self,
        peer: DiscoveredPeer,
        channel: ChannelKind,
        responder: Responder,
    ) -> Result<(), NegotiationError> {
        let requires_password = self.store.has_password().await;
        let request = ConnectionRequest {
            peer: peer.sanitized(),
            channel,
            requires_password,
        };

        {
            let mut slot = self.pending.lock();
            if slot.is_some() {
                drop(slot);
                warn!("Refused connection request while another is pending");
                responder(self.response(false));
                return Err(NegotiationError::SlotBusy);
            }
            *slot = Some(PendingRequest {
                request: request.clone(),
                responder,
            });
        }

        info!(name = %request.peer.name, "Connection request pending");
        self.events.emit(SessionEvent::RequestReceived { request });
        Ok(())
    }

    /// Accepts the pending request, checking the connection password first
    /// when one is configured. A failed check keeps the request pending.
    #[instrument(skip_all)]
    pub async fn accept(
        &self,
        password_attempt: Option<&str>,
    ) -> Result<Connection, NegotiationError> {
        if self.pending.lock().is_none() {
            return Err(NegotiationError::NoPending);
        }

        // Verify against the password as currently stored, not as it was
        // when the request arrived.
        if self.store.has_password().await {
            let Some(attempt) = password_attempt else {
                warn!("Accept without a password attempt");
                return Err(NegotiationError::PasswordMismatch);
            };
            if !self.store.verify_password(attempt).await {
                warn!("Wrong connection password, request stays pending");
                self.events.warning("Wrong connection password");
                return Err(NegotiationError::PasswordMismatch);
            }
        }

        let Some(pending) = self.pending.lock().take() else {
            return Err(NegotiationError::NoPending);
        };

        let connection = Connection::from_peer(pending.request.channel, &pending.request.peer);
        self.registry.insert(connection.clone());
        (pending.responder)(self.response(true));

        info!(connection = %connection.id, "Connection request accepted");
        self.events.emit(SessionEvent::ConnectionAdded {
            connection_id: connection.id.clone(),
        });
        self.events.emit(SessionEvent::TransferReady {
            connection_id: connection.id.clone(),
        });
        Ok(connection)
    }

    /// Rejects the pending request, answering `accepted: false`.
    pub fn reject(&self) -> Result<(), NegotiationError> {
        let Some(pending) = self.pending.lock().take() else {
            return Err(NegotiationError::NoPending);
        };
        (pending.responder)(self.response(false));
        info!(peer = %pending.request.peer.peer_id, "Connection request rejected");
        Ok(())
    }

    /// Records an outbound request so the eventual response is recognized.
    pub fn track_outbound(&self, target_peer_id: impl Into<String>, channel: ChannelKind) {
        let target = target_peer_id.into();
        debug!(peer = %target, %channel, "Outbound connection request in flight");
        self.outbound.insert(target, channel);
    }

    /// Whether an outbound request to this peer is still unanswered.
    #[must_use]
    pub fn has_outbound(&self, peer_id: &str) -> bool {
        self.outbound.contains_key(peer_id)
    }

    /// Handles a `connection-response`. A positive answer to a tracked
    /// request registers the connection on this side too; responses nobody
    /// asked for are dropped.
    pub fn handle_response(&self, msg: &PeerMessage) -> Option<Connection> {
        let PeerMessage::ConnectionResponse { accepted, .. } = msg else {
            return None;
        };
        let peer = msg.peer_info()?;

        let Some((_, channel)) = self.outbound.remove(&peer.peer_id) else {
            debug!(peer = %peer.peer_id, "Dropped response to a request we never sent");
            return None;
        };

        if !*accepted {
            info!(peer = %peer.peer_id, "Peer declined the connection");
            self.events
                .warning(format!("{} declined the connection", peer.name));
            return None;
        }

        let connection = Connection::from_peer(channel, &peer);
        self.registry.insert(connection.clone());
        info!(connection = %connection.id, "Peer accepted our connection request");
        self.events.success(format!("Connected to {}", peer.name));
        self.events.emit(SessionEvent::ConnectionAdded {
            connection_id: connection.id.clone(),
        });
        self.events.emit(SessionEvent::TransferReady {
            connection_id: connection.id.clone(),
        });
        Some(connection)
    }

    fn response(&self, accepted: bool) -> PeerMessage {
        PeerMessage::connection_response(accepted, &self.identity.read())
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("pending", &self.pending.lock().is_some())
            .field("outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}
