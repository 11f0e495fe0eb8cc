//! Unified wire messages
//!
//! Every channel speaks the same JSON protocol: one [`PeerMessage`] enum
//! tagged by a `"type"` field, with kebab-case tags. Channels decode wire
//! text here and forward to a single dispatch point instead of each keeping
//! a private message zoo.
//!
//! Relay traffic historically spelled sender fields `fromPeerId`,
//! `fromName`, `fromDeviceType`, `fromBrowser` and `fromOS`; the decoder
//! accepts those as aliases so both spellings land on the same variants.
//! Encoding always uses the canonical spelling, except for the
//! client-to-relay `connect-request` frame which keeps its legacy field
//! names on purpose.
//!
//! Unknown tags and malformed frames are logged at debug level and dropped;
//! a bad frame never aborts a channel.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::net::connection::{DeviceClass, DiscoveredPeer};
use crate::net::identity::PeerIdentity;

/// Every message any channel sends or receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    /// Identity broadcast on a presence room.
    Presence {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(default)]
        name: String,
        #[serde(rename = "deviceType", default)]
        device_class: DeviceClass,
        #[serde(rename = "browser", default)]
        browser_name: String,
        #[serde(rename = "os", default)]
        os_name: String,
    },

    /// Ask a peer for consent to connect.
    ConnectionRequest {
        #[serde(rename = "peerId", alias = "fromPeerId")]
        peer_id: String,
        #[serde(default, alias = "fromName")]
        name: String,
        #[serde(rename = "deviceType", alias = "fromDeviceType", default)]
        device_class: DeviceClass,
        #[serde(rename = "browser", alias = "fromBrowser", default)]
        browser_name: String,
        #[serde(rename = "os", alias = "fromOS", default)]
        os_name: String,
    },

    /// Answer to a connection request.
    ConnectionResponse {
        accepted: bool,
        #[serde(rename = "peerId", alias = "fromPeerId")]
        peer_id: String,
        #[serde(default, alias = "fromName")]
        name: String,
        #[serde(rename = "deviceType", alias = "fromDeviceType", default)]
        device_class: DeviceClass,
        #[serde(rename = "browser", alias = "fromBrowser", default)]
        browser_name: String,
        #[serde(rename = "os", alias = "fromOS", default)]
        os_name: String,
    },

    /// Announce a file before sending it.
    FileOffer {
        #[serde(rename = "fileId")]
        file_id: u64,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileType", default)]
        file_type: String,
    },

    /// Receiver consents to an offered file.
    FileAccept {
        #[serde(rename = "fileId")]
        file_id: u64,
    },

    /// Receiver declines an offered file.
    FileReject {
        #[serde(rename = "fileId")]
        file_id: u64,
        #[serde(rename = "fileName", default)]
        file_name: String,
    },

    /// Client-to-relay: announce this device to the roster.
    Register {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(default)]
        name: String,
        #[serde(rename = "deviceType", default)]
        device_class: DeviceClass,
        #[serde(rename = "browser", default)]
        browser_name: String,
        #[serde(rename = "os", default)]
        os_name: String,
    },

    /// Client-to-relay: ask the relay to forward a connection request.
    /// Field names are the legacy relay spelling.
    ConnectRequest {
        #[serde(rename = "targetPeerId")]
        target_peer_id: String,
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "fromName", default)]
        from_name: String,
        #[serde(rename = "fromDeviceType", default)]
        from_device_class: DeviceClass,
        #[serde(rename = "fromBrowser", default)]
        from_browser: String,
        #[serde(rename = "fromOS", default)]
        from_os: String,
    },

    /// Relay-to-client: full roster snapshot, self included.
    PeersList { peers: Vec<DiscoveredPeer> },

    /// Relay-to-client: a device joined the roster.
    PeerJoined {
        #[serde(default)]
        name: String,
        #[serde(default)]
        peer: Option<DiscoveredPeer>,
    },

    /// Relay-to-client: a device left the roster.
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

impl PeerMessage {
    /// Parses a wire frame. Unknown tags and malformed JSON are dropped
    /// with a debug log.
    #[must_use]
    pub fn decode(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Some(msg),
            Err(error) => {
                debug!(%error, frame = %text.chars().take(120).collect::<String>(),
                    "Dropped undecodable frame");
                None
            }
        }
    }

    /// Serializes for the wire.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// The wire tag, for logging.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Presence { .. } => "presence",
            Self::ConnectionRequest { .. } => "connection-request",
            Self::ConnectionResponse { .. } => "connection-response",
            Self::FileOffer { .. } => "file-offer",
            Self::FileAccept { .. } => "file-accept",
            Self::FileReject { .. } => "file-reject",
            Self::Register { .. } => "register",
            Self::ConnectRequest { .. } => "connect-request",
            Self::PeersList { .. } => "peers-list",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
        }
    }

    // ===== Constructors from the local identity =====

    #[must_use]
    pub fn presence(identity: &PeerIdentity) -> Self {
        let peer = identity.as_peer();
        Self::Presence {
            peer_id: peer.peer_id,
            name: peer.name,
            device_class: peer.device_class,
            browser_name: peer.browser_name,
            os_name: peer.os_name,
        }
    }

    #[must_use]
    pub fn connection_request(identity: &PeerIdentity) -> Self {
        let peer = identity.as_peer();
        Self::ConnectionRequest {
            peer_id: peer.peer_id,
            name: peer.name,
            device_class: peer.device_class,
            browser_name: peer.browser_name,
            os_name: peer.os_name,
        }
    }

    #[must_use]
    pub fn connection_response(accepted: bool, identity: &PeerIdentity) -> Self {
        let peer = identity.as_peer();
        Self::ConnectionResponse {
            accepted,
            peer_id: peer.peer_id,
            name: peer.name,
            device_class: peer.device_class,
            browser_name: peer.browser_name,
            os_name: peer.os_name,
        }
    }

    #[must_use]
    pub fn register(identity: &PeerIdentity) -> Self {
        let peer = identity.as_peer();
        Self::Register {
            peer_id: peer.peer_id,
            name: peer.name,
            device_class: peer.device_class,
            browser_name: peer.browser_name,
            os_name: peer.os_name,
        }
    }

    #[must_use]
    pub fn connect_request(target_peer_id: impl Into<String>, identity: &PeerIdentity) -> Self {
        let peer = identity.as_peer();
        Self::ConnectRequest {
            target_peer_id: target_peer_id.into(),
            from_peer_id: peer.peer_id,
            from_name: peer.name,
            from_device_class: peer.device_class,
            from_browser: peer.browser_name,
            from_os: peer.os_name,
        }
    }

    /// Extracts the embedded peer info from identity-bearing variants.
    #[must_use]
    pub fn peer_info(&self) -> Option<DiscoveredPeer> {
        match self {
            Self::Presence {
                peer_id,
                name,
                device_class,
                browser_name,
                os_name,
            }
            | Self::ConnectionRequest {
                peer_id,
                name,
                device_class,
                browser_name,
                os_name,
            }
            | Self::ConnectionResponse {
                peer_id,
                name,
                device_class,
                browser_name,
                os_name,
                ..
            }
            | Self::Register {
                peer_id,
                name,
                device_class,
                browser_name,
                os_name,
            } => Some(
                DiscoveredPeer::new(
                    peer_id.clone(),
                    name.clone(),
                    *device_class,
                    browser_name.clone(),
                    os_name.clone(),
                )
                .sanitized(),
            ),
            Self::ConnectRequest {
                from_peer_id,
                from_name,
                from_device_class,
                from_browser,
                from_os,
                ..
            } => Some(
                DiscoveredPeer::new(
                    from_peer_id.clone(),
                    from_name.clone(),
                    *from_device_class,
                    from_browser.clone(),
                    from_os.clone(),
                )
                .sanitized(),
            ),
            _ => None,
        }
    }
}
