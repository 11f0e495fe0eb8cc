//! Presence channel: zero-config nearby discovery
//!
//! Devices meet in a named room (`peerdrop-p2p`) and exchange identity
//! broadcasts. The room itself is behind the [`RoomSubstrate`] trait so the
//! discovery logic is independent of what carries it; [`LocalRoom`] is the
//! in-process substrate used by the binary and by two-peer tests. If the
//! substrate cannot join, the channel reports [`PresenceStatus::Unavailable`]
//! and takes no further action; there is no retry loop.
//!
//! Wire frames are JSON [`PeerMessage`]s. The channel keeps its own roster
//! (presence is per channel; the same peer may also appear via the relay)
//! and forwards negotiation and file messages to the session dispatcher.
//! Peer identity on this channel is the transport-level sender id, not
//! whatever id a payload claims.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::state::{SessionEvent, SessionState};
use crate::net::connection::{ChannelKind, DiscoveredPeer};
use crate::net::identity::PeerIdentity;
use crate::net::message::PeerMessage;
use crate::net::negotiation::Responder;

/// Room every instance joins for nearby discovery.
pub const ROOM_NAME: &str = "peerdrop-p2p";

/// Application id namespacing the room substrate.
pub const APP_ID: &str = "peerdrop-serverless";

/// Presence errors. Unavailability is terminal for the channel but not for
/// the session.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PresenceError {
    /// The substrate could not join the room.
    #[error("presence substrate unavailable")]
    Unavailable,

    /// Sent before joining or after leaving.
    #[error("not joined to the presence room")]
    NotJoined,
}

/// Substrate-level room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub app_id: String,
    pub password: Option<String>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            app_id: APP_ID.to_string(),
            password: None,
        }
    }
}

/// What a joined room reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    PeerJoined(String),
    PeerLeft(String),
    Message { from: String, text: String },
}

/// Outbound half of a joined room.
pub trait RoomTransport: Send + Sync {
    /// Sends a frame to one member, or to everyone else when `to` is None.
    /// Sending to an absent member is a silent no-op.
    fn send(&self, text: &str, to: Option<&str>) -> Result<(), PresenceError>;

    /// Leaves the room, notifying remaining members.
    fn leave(&self);
}

/// A successful join: the send half plus the room event stream.
pub struct JoinedRoom {
    pub transport: Arc<dyn RoomTransport>,
    pub events: mpsc::UnboundedReceiver<RoomEvent>,
}

/// Something that can place a peer into a named room.
pub trait RoomSubstrate: Send + Sync {
    fn join_room(
        &self,
        config: &RoomConfig,
        room_name: &str,
        peer_id: &str,
    ) -> Result<JoinedRoom, PresenceError>;
}

// ===== In-process substrate =====

type RoomMembers = HashMap<String, mpsc::UnboundedSender<RoomEvent>>;

/// In-process room table. Every clone shares the same rooms, so two
/// channels built over clones of one `LocalRoom` can discover each other.
#[derive(Clone, Default)]
pub struct LocalRoom {
    rooms: Arc<Mutex<HashMap<String, RoomMembers>>>,
}

impl LocalRoom {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomSubstrate for LocalRoom {
    fn join_room(
        &self,
        _config: &RoomConfig,
        room_name: &str,
        peer_id: &str,
    ) -> Result<JoinedRoom, PresenceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock();
        let members = rooms.entry(room_name.to_string()).or_default();

        // Join events fire in both directions, like pairwise connection
        // establishment would.
        for (existing_id, existing_tx) in members.iter() {
            let _ = existing_tx.send(RoomEvent::PeerJoined(peer_id.to_string()));
            let _ = tx.send(RoomEvent::PeerJoined(existing_id.clone()));
        }
        members.insert(peer_id.to_string(), tx);

        debug!(room = room_name, peer = peer_id, "Joined local room");
        Ok(JoinedRoom {
            transport: Arc::new(LocalTransport {
                rooms: Arc::clone(&self.rooms),
                room_name: room_name.to_string(),
                peer_id: peer_id.to_string(),
            }),
            events: rx,
        })
    }
}

struct LocalTransport {
    rooms: Arc<Mutex<HashMap<String, RoomMembers>>>,
    room_name: String,
    peer_id: String,
}

impl RoomTransport for LocalTransport {
    fn send(&self, text: &str, to: Option<&str>) -> Result<(), PresenceError> {
        let rooms = self.rooms.lock();
        let members = rooms.get(&self.room_name).ok_or(PresenceError::NotJoined)?;
        if !members.contains_key(&self.peer_id) {
            return Err(PresenceError::NotJoined);
        }

        let event = |_: &str| RoomEvent::Message {
            from: self.peer_id.clone(),
            text: text.to_string(),
        };

        match to {
            Some(target) => {
                if let Some(tx) = members.get(target) {
                    let _ = tx.send(event(target));
                }
            }
            None => {
                for (id, tx) in members.iter() {
                    if id != &self.peer_id {
                        let _ = tx.send(event(id));
                    }
                }
            }
        }
        Ok(())
    }

    fn leave(&self) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(&self.room_name) {
            members.remove(&self.peer_id);
            for tx in members.values() {
                let _ = tx.send(RoomEvent::PeerLeft(self.peer_id.clone()));
            }
            if members.is_empty() {
                rooms.remove(&self.room_name);
            }
        }
    }
}

// ===== Presence channel =====

/// Channel status, mirrored to the UI indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Connected,
    Disconnected,
    Searching,
    Unavailable,
    Error,
}

impl PresenceStatus {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Searching => "searching",
            Self::Unavailable => "unavailable",
            Self::Error => "error",
        }
    }
}

/// Nearby-discovery channel state: roster, status, and the send half of the
/// joined room.
pub struct PresenceChannel {
    peers: DashMap<String, DiscoveredPeer>,
    status: RwLock<PresenceStatus>,
    transport: RwLock<Option<Arc<dyn RoomTransport>>>,
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            status: RwLock::new(PresenceStatus::Disconnected),
            transport: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn status(&self) -> PresenceStatus {
        *self.status.read()
    }

    /// Roster snapshot sorted by peer id.
    #[must_use]
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> =
            self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Joins the room and broadcasts our presence. On failure the channel
    /// becomes `Unavailable` and stays that way.
    #[instrument(skip_all)]
    pub fn join(
        &self,
        substrate: &dyn RoomSubstrate,
        identity: &PeerIdentity,
    ) -> Result<mpsc::UnboundedReceiver<RoomEvent>, PresenceError> {
        *self.status.write() = PresenceStatus::Searching;

        let joined = match substrate.join_room(&RoomConfig::default(), ROOM_NAME, &identity.id) {
            Ok(joined) => joined,
            Err(error) => {
                warn!(%error, "Presence substrate unavailable");
                *self.status.write() = PresenceStatus::Unavailable;
                return Err(PresenceError::Unavailable);
            }
        };

        *self.transport.write() = Some(Arc::clone(&joined.transport));
        *self.status.write() = PresenceStatus::Connected;
        info!(room = ROOM_NAME, "Presence room joined");

        self.send_message(&PeerMessage::presence(identity), None);
        Ok(joined.events)
    }

    /// Leaves the room and clears the roster.
    pub fn leave(&self) {
        if let Some(transport) = self.transport.write().take() {
            transport.leave();
        }
        self.peers.clear();
        *self.status.write() = PresenceStatus::Disconnected;
    }

    /// Sends a targeted `connection-request` to a discovered peer and
    /// tracks it for the eventual response.
    pub fn request_connection(
        &self,
        state: &SessionState,
        peer_id: &str,
    ) -> Result<(), PresenceError> {
        if self.transport.read().is_none() {
            return Err(PresenceError::NotJoined);
        }
        let identity = state.identity.read().clone();
        state
            .negotiator
            .track_outbound(peer_id, ChannelKind::Presence);
        self.send_message(&PeerMessage::connection_request(&identity), Some(peer_id));
        state.events.info("Connection request sent");
        Ok(())
    }

    /// Answers a file offer from a peer on this channel.
    pub fn respond_to_file_offer(
        &self,
        peer_id: &str,
        file_id: u64,
        file_name: &str,
        accept: bool,
    ) {
        let msg = if accept {
            PeerMessage::FileAccept { file_id }
        } else {
            PeerMessage::FileReject {
                file_id,
                file_name: file_name.to_string(),
            }
        };
        self.send_message(&msg, Some(peer_id));
    }

    /// Event-loop task: drains room events until cancellation or the room
    /// closes underneath us.
    pub async fn run(
        self: Arc<Self>,
        state: Arc<SessionState>,
        substrate: Arc<dyn RoomSubstrate>,
        cancel: CancellationToken,
    ) {
        let identity = state.identity.read().clone();
        let mut events = match self.join(substrate.as_ref(), &identity) {
            Ok(events) => events,
            Err(_) => {
                state.events.warning("Nearby discovery unavailable");
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.leave();
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(&state, event).await,
                    None => {
                        warn!("Presence room closed");
                        *self.status.write() = PresenceStatus::Disconnected;
                        break;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, state: &Arc<SessionState>, event: RoomEvent) {
        match event {
            RoomEvent::PeerJoined(peer_id) => {
                debug!(peer = %peer_id, "Peer joined the room");
                // Introduce ourselves to the newcomer; they do the same, so
                // both rosters fill in.
                let identity = state.identity.read().clone();
                self.send_message(&PeerMessage::presence(&identity), Some(&peer_id));
                state.events.info("Discovered a new device");
            }
            RoomEvent::PeerLeft(peer_id) => {
                if self.peers.remove(&peer_id).is_some() {
                    state.events.info("A device went offline");
                    self.emit_roster(state);
                }
            }
            RoomEvent::Message { from, text } => {
                let Some(msg) = PeerMessage::decode(&text) else {
                    return;
                };
                match msg {
                    PeerMessage::Presence { .. } => {
                        if let Some(mut peer) = msg.peer_info() {
                            // Keyed by the transport id, which is the one we
                            // can actually reach the sender at.
                            peer.peer_id = from.clone();
                            self.peers.insert(from, peer);
                            self.emit_roster(state);
                        }
                    }
                    other => {
                        let responder = self.responder_to(&from);
                        state
                            .dispatch(ChannelKind::Presence, &from, other, responder)
                            .await;
                    }
                }
            }
        }
    }

    fn emit_roster(&self, state: &Arc<SessionState>) {
        state.events.emit(SessionEvent::RosterChanged {
            channel: ChannelKind::Presence,
            count: self.peers.len(),
        });
    }

    /// Builds a best-effort reply path to one room member.
    pub(crate) fn responder_to(&self, peer_id: &str) -> Responder {
        let transport = self.transport.read().clone();
        let target = peer_id.to_string();
        Box::new(move |msg| {
            if let (Some(transport), Ok(text)) = (transport.as_ref(), msg.encode()) {
                let _ = transport.send(&text, Some(&target));
            }
        })
    }

    fn send_message(&self, msg: &PeerMessage, to: Option<&str>) {
        let Some(transport) = self.transport.read().clone() else {
            return;
        };
        match msg.encode() {
            Ok(text) => {
                if let Err(error) = transport.send(&text, to) {
                    debug!(%error, tag = msg.tag(), "Presence send failed");
                }
            }
            Err(error) => warn!(%error, tag = msg.tag(), "Frame encoding failed"),
        }
    }
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceChannel")
            .field("status", &self.status())
            .field("peers", &self.peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::DeviceClass;

    fn identity(id: &str, name: &str) -> PeerIdentity {
        PeerIdentity {
            id: id.to_string(),
            token: "AAAABBBBCCCC".to_string(),
            name: name.to_string(),
            device_class: DeviceClass::Desktop,
            browser_name: "PeerDrop".to_string(),
            os_name: "Linux".to_string(),
        }
    }

    mod local_room_tests {
        use super::*;

        #[tokio::test]
        async fn join_events_fire_in_both_directions() {
            let room = LocalRoom::new();
            let config = RoomConfig::default();

            let mut alpha = room.join_room(&config, "r", "alpha").unwrap();
            let mut beta = room.join_room(&config, "r", "beta").unwrap();

            assert_eq!(
                alpha.events.recv().await.unwrap(),
                RoomEvent::PeerJoined("beta".to_string())
            );
            assert_eq!(
                beta.events.recv().await.unwrap(),
                RoomEvent::PeerJoined("alpha".to_string())
            );
        }

        #[tokio::test]
        async fn broadcast_skips_the_sender() {
            let room = LocalRoom::new();
            let config = RoomConfig::default();

            let alpha = room.join_room(&config, "r", "alpha").unwrap();
            let mut beta = room.join_room(&config, "r", "beta").unwrap();
            let mut gamma = room.join_room(&config, "r", "gamma").unwrap();

            alpha.transport.send("hello", None).unwrap();

            // Skip join noise, find the message.
            let find_message = |events: &mut mpsc::UnboundedReceiver<RoomEvent>| loop {
                match events.try_recv() {
                    Ok(RoomEvent::Message { from, text }) => break Some((from, text)),
                    Ok(_) => continue,
                    Err(_) => break None,
                }
            };

            assert_eq!(
                find_message(&mut beta.events).unwrap(),
                ("alpha".to_string(), "hello".to_string())
            );
            assert_eq!(
                find_message(&mut gamma.events).unwrap(),
                ("alpha".to_string(), "hello".to_string())
            );
        }

        #[tokio::test]
        async fn targeted_send_reaches_only_the_target() {
            let room = LocalRoom::new();
            let config = RoomConfig::default();

            let alpha = room.join_room(&config, "r", "alpha").unwrap();
            let mut beta = room.join_room(&config, "r", "beta").unwrap();
            let mut gamma = room.join_room(&config, "r", "gamma").unwrap();

            alpha.transport.send("psst", Some("beta")).unwrap();

            let mut beta_texts = Vec::new();
            while let Ok(event) = beta.events.try_recv() {
                if let RoomEvent::Message { text, .. } = event {
                    beta_texts.push(text);
                }
            }
            assert_eq!(beta_texts, vec!["psst".to_string()]);

            while let Ok(event) = gamma.events.try_recv() {
                assert!(!matches!(event, RoomEvent::Message { .. }));
            }
        }

        #[tokio::test]
        async fn sending_to_an_absent_member_is_a_silent_no_op() {
            let room = LocalRoom::new();
            let alpha = room
                .join_room(&RoomConfig::default(), "r", "alpha")
                .unwrap();
            assert!(alpha.transport.send("void", Some("nobody")).is_ok());
        }

        #[tokio::test]
        async fn leave_notifies_the_rest() {
            let room = LocalRoom::new();
            let config = RoomConfig::default();

            let alpha = room.join_room(&config, "r", "alpha").unwrap();
            let mut beta = room.join_room(&config, "r", "beta").unwrap();

            alpha.transport.leave();

            let left = loop {
                match beta.events.try_recv() {
                    Ok(RoomEvent::PeerLeft(id)) => break id,
                    Ok(_) => continue,
                    Err(_) => panic!("no PeerLeft event"),
                }
            };
            assert_eq!(left, "alpha");

            // Sending after leaving fails.
            assert_eq!(
                alpha.transport.send("late", None).unwrap_err(),
                PresenceError::NotJoined
            );
        }
    }

    mod channel_tests {
        use super::*;

        struct DownSubstrate;

        impl RoomSubstrate for DownSubstrate {
            fn join_room(
                &self,
                _config: &RoomConfig,
                _room_name: &str,
                _peer_id: &str,
            ) -> Result<JoinedRoom, PresenceError> {
                Err(PresenceError::Unavailable)
            }
        }

        #[tokio::test]
        async fn joining_broadcasts_our_presence() {
            let room = LocalRoom::new();
            let mut other = room
                .join_room(&RoomConfig::default(), ROOM_NAME, "otherpeer0001")
                .unwrap();

            let channel = PresenceChannel::new();
            let me = identity("localpeer0001", "Broadcaster");
            channel.join(&room, &me).unwrap();
            assert_eq!(channel.status(), PresenceStatus::Connected);

            // The other member sees our join, then our presence frame.
            let mut saw_presence = false;
            while let Ok(event) = other.events.try_recv() {
                if let RoomEvent::Message { from, text } = event {
                    assert_eq!(from, "localpeer0001");
                    match PeerMessage::decode(&text) {
                        Some(PeerMessage::Presence { name, .. }) => {
                            assert_eq!(name, "Broadcaster");
                            saw_presence = true;
                        }
                        other => panic!("unexpected frame: {other:?}"),
                    }
                }
            }
            assert!(saw_presence);
        }

        #[tokio::test]
        async fn unavailable_substrate_parks_the_channel() {
            let channel = PresenceChannel::new();
            let me = identity("localpeer0001", "Lonely");

            assert_eq!(
                channel.join(&DownSubstrate, &me).unwrap_err(),
                PresenceError::Unavailable
            );
            assert_eq!(channel.status(), PresenceStatus::Unavailable);
        }

        #[tokio::test]
        async fn leave_clears_roster_and_status() {
            let room = LocalRoom::new();
            let channel = PresenceChannel::new();
            let me = identity("localpeer0001", "Leaver");

            channel.join(&room, &me).unwrap();
            channel.leave();

            assert_eq!(channel.status(), PresenceStatus::Disconnected);
            assert_eq!(channel.peer_count(), 0);
        }
    }
}
