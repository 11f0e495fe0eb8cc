//! Networking module for peerdrop
//!
//! This module provides every channel a session can reach a peer over,
//! plus the shared plumbing between them:
//!
//! - **Identity**: Persistent peer identity and profile storage
//! - **Presence**: Serverless room discovery with live peer rosters
//! - **Relay**: Optional WebSocket relay for peers outside the room
//! - **Manual**: Copy-paste signal blobs for link-less pairing
//! - **Rendezvous**: Token, QR, and LAN address connection paths
//! - **Negotiation**: Consent-gated connection offers and answers
//! - **Secure**: PAKE handshake and payload encryption for tokens
//! - **Transfer**: Sequential chunked file batches over any channel
//!
//! # Architecture
//!
//! Every channel parses inbound frames into the same [`PeerMessage`]
//! enum and hands them to the session dispatcher, so negotiation and
//! transfer logic never know which wire a frame arrived on.
//!
//! # Example
//!
//! ```rust,ignore
//! use peerdrop::net::identity::{PeerIdentity, ProfileStore};
//! use peerdrop::net::presence::{LocalRoom, PresenceChannel};
//!
//! // Load the persistent identity (creates one on first run)
//! let store = ProfileStore::open().await?;
//! let identity = PeerIdentity::load_or_create(&store).await?;
//!
//! // Join the shared presence room
//! let (session, events) = SessionState::new(identity, store, 256);
//! tokio::spawn(PresenceChannel::run(
//!     session.presence.clone(),
//!     session.clone(),
//!     Arc::new(LocalRoom::new()),
//!     cancel.clone(),
//! ));
//! ```

pub mod connection;
pub mod identity;
pub mod manual;
pub mod message;
pub mod negotiation;
pub mod presence;
pub mod relay;
pub mod rendezvous;
pub mod secure;
pub mod transfer;

pub use connection::{ChannelKind, Connection, ConnectionRegistry, DeviceClass, DiscoveredPeer};
pub use identity::{PeerIdentity, ProfileStore};
pub use message::PeerMessage;
pub use negotiation::{ConnectionRequest, NegotiationError, Negotiator, Responder};
pub use presence::{LocalRoom, PresenceChannel, PresenceStatus, RoomSubstrate};
pub use relay::{validate_endpoint, RelayClient, RelayStatus, ValidatedEndpoint};
pub use transfer::{
    format_size, format_speed, BatchReport, ChunkChannel, ChunkTransport, TransferCoordinator,
    TransferProfile,
};
