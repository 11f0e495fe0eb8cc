//! Relay channel: signaling through an operator-run server
//!
//! A WebSocket client that registers the local identity with a relay, keeps
//! a roster of other registered peers, and carries connection negotiation
//! when no direct channel exists. The server routes targeted frames by a
//! top-level `targetPeerId` field; that field is transport addressing, not
//! part of the payload a peer reads.
//!
//! Endpoints are validated before dialing: `wss` (or `https`, rewritten) is
//! required except for loopback hosts, where plain `ws`/`http` is accepted
//! for local development.
//!
//! Relay loss is never fatal to the session. A closed socket downgrades the
//! status and clears the roster; everything reached over other channels
//! keeps working.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http::Uri;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::state::{SessionEvent, SessionState};
use crate::net::connection::{ChannelKind, DiscoveredPeer, UNKNOWN_NAME};
use crate::net::message::PeerMessage;
use crate::net::negotiation::Responder;

/// Relay channel errors. All recoverable; the worst outcome is a degraded
/// status plus a notice.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RelayError {
    /// The endpoint string is not a URL with a scheme and host.
    #[error("relay address is not a valid url")]
    InvalidAddress,

    /// Plaintext scheme on a non-loopback host, or a scheme that cannot
    /// carry a WebSocket at all.
    #[error("relay endpoints must use wss (plain ws is allowed for loopback only)")]
    InsecureEndpoint,

    /// An operation that needs a live relay socket was called without one.
    #[error("not connected to a relay")]
    NotConnected,
}

/// A relay address that passed scheme validation, ready to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEndpoint {
    url: String,
}

impl ValidatedEndpoint {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for ValidatedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Validates and normalizes a relay address.
///
/// `https` becomes `wss` (the operator pasted the browser URL); `http`
/// becomes `ws` but only for loopback hosts. Anything plaintext pointed at
/// a real host is refused rather than silently downgraded.
pub fn validate_endpoint(raw: &str) -> Result<ValidatedEndpoint, RelayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidAddress);
    }
    let uri: Uri = trimmed.parse().map_err(|_| RelayError::InvalidAddress)?;
    let scheme = uri.scheme_str().ok_or(RelayError::InvalidAddress)?;
    let host = uri.host().ok_or(RelayError::InvalidAddress)?;
    let rest = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or(RelayError::InvalidAddress)?;

    let url = match scheme {
        "wss" => trimmed.to_string(),
        "https" => format!("wss://{rest}"),
        "ws" if is_loopback_host(host) => trimmed.to_string(),
        "http" if is_loopback_host(host) => format!("ws://{rest}"),
        _ => return Err(RelayError::InsecureEndpoint),
    };
    Ok(ValidatedEndpoint { url })
}

fn is_loopback_host(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.eq_ignore_ascii_case("localhost") || bare == "127.0.0.1" || bare == "::1"
}

/// Connection state of the relay socket, mirrored to the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl RelayStatus {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// Serializes a frame with the routing field the server switches on.
fn routed_text(target: &str, msg: &PeerMessage) -> Option<String> {
    let mut value = serde_json::to_value(msg).ok()?;
    let map = value.as_object_mut()?;
    map.insert(
        "targetPeerId".to_string(),
        serde_json::Value::String(target.to_string()),
    );
    Some(value.to_string())
}

/// Client side of the relay channel: roster, status, and the outbound frame
/// queue feeding the socket writer task.
pub struct RelayClient {
    roster: DashMap<String, DiscoveredPeer>,
    status: RwLock<RelayStatus>,
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            roster: DashMap::new(),
            status: RwLock::new(RelayStatus::Disconnected),
            outbound: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn status(&self) -> RelayStatus {
        *self.status.read()
    }

    /// Roster snapshot sorted by peer id.
    #[must_use]
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> =
            self.roster.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.roster.len()
    }

    /// Asks the server to forward a connection request to another member.
    pub fn connect_request(
        &self,
        state: &SessionState,
        target_peer_id: &str,
    ) -> Result<(), RelayError> {
        let identity = state.identity.read().clone();
        self.send_text(&PeerMessage::connect_request(target_peer_id, &identity))?;
        state
            .negotiator
            .track_outbound(target_peer_id, ChannelKind::Relay);
        state.events.info("Connection request sent");
        Ok(())
    }

    /// Dials the relay and runs the socket until cancellation, close, or a
    /// transport error.
    #[instrument(skip_all, fields(endpoint = endpoint.as_str()))]
    pub async fn run(
        self: Arc<Self>,
        state: Arc<SessionState>,
        endpoint: ValidatedEndpoint,
        cancel: CancellationToken,
    ) {
        *self.status.write() = RelayStatus::Connecting;
        state.events.info("Connecting to the relay...");

        let (socket, _response) = match tokio_tungstenite::connect_async(endpoint.as_str()).await
        {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "Relay dial failed");
                *self.status.write() = RelayStatus::Error;
                state.events.error("Relay connection failed");
                return;
            }
        };
        let (mut sink, mut reader) = socket.split();

        // Register before anything else; the server answers with peers-list.
        let identity = state.identity.read().clone();
        let registered = match PeerMessage::register(&identity).encode() {
            Ok(frame) => sink.send(Message::Text(frame)).await,
            Err(error) => {
                warn!(%error, "Frame encoding failed");
                return;
            }
        };
        if let Err(error) = registered {
            warn!(%error, "Relay registration failed");
            *self.status.write() = RelayStatus::Error;
            state.events.error("Relay connection failed");
            return;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.write() = Some(out_tx);
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        *self.status.write() = RelayStatus::Connected;
        info!("Relay connected");
        state.events.success("Connected to the relay");

        let mut failed = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&state, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "Relay socket error");
                        failed = true;
                        break;
                    }
                }
            }
        }

        // Dropping the queue sender lets the writer drain and close the
        // socket.
        *self.outbound.write() = None;
        let had_peers = !self.roster.is_empty();
        self.roster.clear();
        if had_peers {
            self.emit_roster(&state);
        }

        if cancel.is_cancelled() {
            *self.status.write() = RelayStatus::Disconnected;
            debug!("Relay loop stopped");
        } else if failed {
            *self.status.write() = RelayStatus::Error;
            state.events.error("Relay connection failed");
        } else {
            *self.status.write() = RelayStatus::Disconnected;
            state.events.warning("Relay connection lost");
        }

        let _ = writer.await;
    }

    /// Handles one inbound text frame.
    pub(crate) async fn handle_frame(&self, state: &Arc<SessionState>, text: &str) {
        let Some(msg) = PeerMessage::decode(text) else {
            return;
        };
        match msg {
            PeerMessage::PeersList { peers } => {
                let local_id = state.identity.read().id.clone();
                self.roster.clear();
                for peer in peers {
                    if !peer.peer_id.is_empty() && peer.peer_id != local_id {
                        self.roster.insert(peer.peer_id.clone(), peer);
                    }
                }
                self.emit_roster(state);
            }
            PeerMessage::PeerJoined { name, peer } => {
                let label = if name.trim().is_empty() {
                    UNKNOWN_NAME
                } else {
                    name.as_str()
                };
                state.events.info(format!("{label} is online"));
                if let Some(peer) = peer {
                    let local_id = state.identity.read().id.clone();
                    if !peer.peer_id.is_empty() && peer.peer_id != local_id {
                        self.roster.insert(peer.peer_id.clone(), peer);
                        self.emit_roster(state);
                    }
                }
            }
            PeerMessage::PeerLeft { peer_id } => {
                if self.roster.remove(&peer_id).is_some() {
                    self.emit_roster(state);
                }
            }
            PeerMessage::ConnectionRequest { .. } | PeerMessage::ConnectionResponse { .. } => {
                // The payload peer id is the only sender attribution the
                // relay provides.
                let Some(from) = msg.peer_info().map(|peer| peer.peer_id) else {
                    return;
                };
                if from.is_empty() {
                    debug!(tag = msg.tag(), "Relay frame without a sender id");
                    return;
                }
                let responder = self.responder_to(&from);
                state
                    .dispatch(ChannelKind::Relay, &from, msg, responder)
                    .await;
            }
            other => {
                debug!(tag = other.tag(), "Dropping relay frame");
            }
        }
    }

    fn emit_roster(&self, state: &Arc<SessionState>) {
        state.events.emit(SessionEvent::RosterChanged {
            channel: ChannelKind::Relay,
            count: self.roster.len(),
        });
    }

    /// Builds a best-effort reply path routed through the server.
    fn responder_to(&self, peer_id: &str) -> Responder {
        let outbound = self.outbound.read().clone();
        let target = peer_id.to_string();
        Box::new(move |msg| {
            let Some(tx) = outbound.as_ref() else {
                return;
            };
            if let Some(text) = routed_text(&target, &msg) {
                let _ = tx.send(text);
            }
        })
    }

    fn send_text(&self, msg: &PeerMessage) -> Result<(), RelayError> {
        let Some(tx) = self.outbound.read().clone() else {
            return Err(RelayError::NotConnected);
        };
        match msg.encode() {
            Ok(text) => tx.send(text).map_err(|_| RelayError::NotConnected),
            Err(error) => {
                warn!(%error, tag = msg.tag(), "Frame encoding failed");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("status", &self.status())
            .field("roster", &self.roster.len())
            .finish()
    }
}
