//! Connection records and the connection registry
//!
//! Every rendezvous channel, once negotiation succeeds, lands here: a
//! [`Connection`] is the durable (session-lifetime) record of an authorized
//! peer relationship, keyed by a channel-prefixed id. Removing the record is
//! the only way to disconnect.
//!
//! # Id scheme
//!
//! Connection ids combine a channel prefix with the peer identifier so the
//! same peer reached over two channels yields two independent records:
//!
//! - `P2P-{peer}` for room presence
//! - `SERVER-{peer}` for relay signaling
//! - `MANUAL-{peer}` for offline blob exchange
//! - `QR-{peer}` for scanned payloads carrying a peer id
//! - `TOKEN-{token}` for bare access codes (the code is the identifier)
//! - `LAN-{a-b-c-d}` for raw addresses (dots become dashes)
//! - `BT-{device}` for bluetooth discovery

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

/// Fallback display name for peers that sent an empty or missing name.
pub const UNKNOWN_NAME: &str = "Unknown device";

/// Fallback browser label.
pub const UNKNOWN_BROWSER: &str = "Unknown browser";

/// Fallback operating system label.
pub const UNKNOWN_OS: &str = "Unknown OS";

/// Broad device category advertised alongside a peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceClass {
    /// Wire label for this class.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
        }
    }

    /// Parses a wire label leniently; anything unrecognized is a desktop.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobile" | "phone" => Self::Mobile,
            "tablet" => Self::Tablet,
            _ => Self::Desktop,
        }
    }

    /// Display icon. Phones get the phone glyph, everything else a computer.
    #[inline]
    #[must_use]
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Mobile => "📱",
            _ => "💻",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Lenient on the wire: unknown labels deserialize as Desktop instead of
// failing the whole frame.
impl Serialize for DeviceClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeviceClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// The discovery/signaling strategy a connection was reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Room-based decentralized presence.
    Presence,
    /// Copy/paste offline signaling blob.
    Manual,
    /// Operator-run relay signaling server.
    Relay,
    /// Scanned QR payload.
    Qr,
    /// Typed access code.
    Token,
    /// Raw LAN address entry.
    Lan,
    /// Bluetooth proximity discovery.
    Bluetooth,
}

impl ChannelKind {
    /// Stable lowercase name used in logs and persisted records.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Manual => "manual",
            Self::Relay => "relay",
            Self::Qr => "qr",
            Self::Token => "token",
            Self::Lan => "lan",
            Self::Bluetooth => "bluetooth",
        }
    }

    /// Connection-id prefix for this channel.
    #[inline]
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Presence => "P2P",
            Self::Manual => "MANUAL",
            Self::Relay => "SERVER",
            Self::Qr => "QR",
            Self::Token => "TOKEN",
            Self::Lan => "LAN",
            Self::Bluetooth => "BT",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer observed by one rendezvous channel.
///
/// Ephemeral: owned by whichever channel saw it, evicted when that channel
/// loses the peer. The same peer may appear in several channels at once with
/// independent lifecycles. The serde shape matches the signaling wire
/// (`peers-list` entries and presence payloads).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "deviceType", default)]
    pub device_class: DeviceClass,
    #[serde(rename = "browser", default)]
    pub browser_name: String,
    #[serde(rename = "os", default)]
    pub os_name: String,
}

impl DiscoveredPeer {
    #[must_use]
    pub fn new(
        peer_id: impl Into<String>,
        name: impl Into<String>,
        device_class: DeviceClass,
        browser_name: impl Into<String>,
        os_name: impl Into<String>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            device_class,
            browser_name: browser_name.into(),
            os_name: os_name.into(),
        }
    }

    /// Replaces empty display fields with the standard fallbacks.
    ///
    /// Remote payloads routinely omit fields; records entering a roster or a
    /// connection go through this first.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.name.trim().is_empty() {
            self.name = UNKNOWN_NAME.to_string();
        }
        if self.browser_name.trim().is_empty() {
            self.browser_name = UNKNOWN_BROWSER.to_string();
        }
        if self.os_name.trim().is_empty() {
            self.os_name = UNKNOWN_OS.to_string();
        }
        self
    }
}

/// A registered, named peer relationship authorized for file transfer.
///
/// Exists iff negotiation reached its accepted terminal state.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Channel-prefixed unique id (see module docs).
    pub id: String,
    /// Display name of the remote peer.
    pub name: Arc<str>,
    /// Remote device category.
    pub device_class: DeviceClass,
    /// Remote browser label.
    pub browser_name: Arc<str>,
    /// Remote OS label.
    pub os_name: Arc<str>,
    /// Display icon chosen at registration time.
    pub icon: &'static str,
    /// Which rendezvous channel produced this connection.
    pub channel: ChannelKind,
    /// Whether chunk traffic on this connection is sealed.
    pub encrypted: bool,
    /// When negotiation completed.
    pub established_at: Instant,
}

impl Connection {
    /// Builds a connection for a peer reached over `channel`.
    ///
    /// The id becomes `{PREFIX}-{peer_id}`. Display fields are sanitized.
    #[must_use]
    pub fn from_peer(channel: ChannelKind, peer: &DiscoveredPeer) -> Self {
        let peer = peer.clone().sanitized();
        let id = format!("{}-{}", channel.prefix(), peer.peer_id);
        Self::build(id, channel, peer)
    }

    /// Builds a connection keyed by a bare access code.
    ///
    /// No peer id is known at this point, so the code itself is the
    /// identifier and `template` supplies the local device's class/browser/OS
    /// as placeholders.
    #[must_use]
    pub fn for_token(token: &str, template: &DiscoveredPeer) -> Self {
        let id = format!("{}-{}", ChannelKind::Token.prefix(), token);
        let mut peer = template.clone().sanitized();
        peer.name = "Access code peer".to_string();
        Self::build(id, ChannelKind::Token, peer)
    }

    /// Builds a connection for a raw LAN address.
    ///
    /// The id replaces dots with dashes (`LAN-192-168-1-10`) and the address
    /// doubles as the display name.
    #[must_use]
    pub fn for_lan(addr: Ipv4Addr, template: &DiscoveredPeer) -> Self {
        let dashed = addr.to_string().replace('.', "-");
        let id = format!("{}-{}", ChannelKind::Lan.prefix(), dashed);
        let mut peer = template.clone().sanitized();
        peer.name = addr.to_string();
        Self::build(id, ChannelKind::Lan, peer)
    }

    fn build(id: String, channel: ChannelKind, peer: DiscoveredPeer) -> Self {
        let icon = if channel == ChannelKind::Bluetooth {
            "📡"
        } else {
            peer.device_class.icon()
        };

        Self {
            id,
            name: peer.name.into(),
            device_class: peer.device_class,
            browser_name: peer.browser_name.into(),
            os_name: peer.os_name.into(),
            icon,
            channel,
            encrypted: true,
            established_at: Instant::now(),
        }
    }

    /// Time since negotiation completed.
    #[inline]
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.established_at.elapsed()
    }
}

/// Session-lifetime mapping of connection id to [`Connection`].
///
/// Cheap to clone; all clones share the same table. Insertion order is
/// irrelevant, so snapshots sort by id for stable iteration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<String, Connection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, returning the previous record if the same id
    /// was already present (a re-established connection refreshes in place).
    pub fn insert(&self, conn: Connection) -> Option<Connection> {
        let id = conn.id.clone();
        let previous = self.inner.insert(id.clone(), conn);
        if previous.is_some() {
            debug!(connection = %id, "Refreshed existing connection");
        } else {
            info!(connection = %id, total = self.inner.len(), "Connection registered");
        }
        previous
    }

    /// Removes a connection. This is the only disconnect mechanism.
    pub fn remove(&self, id: &str) -> Option<Connection> {
        let removed = self.inner.remove(id).map(|(_, conn)| conn);
        if removed.is_some() {
            info!(connection = %id, total = self.inner.len(), "Connection removed");
        }
        removed
    }

    /// Looks up a connection by id, cloning it out.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Connection> {
        self.inner.get(id).map(|entry| entry.value().clone())
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// All current connections, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self
            .inner
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
