//! peerdrop - serverless device discovery and file-transfer coordination
//!
//! A session discovers nearby devices over a shared presence room, asks
//! for explicit consent before any connection forms, and then pushes
//! files one at a time through whichever channel the two peers share.
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - [`app`]: Session state, the file queue, and the event stream
//! - [`net`]: Discovery channels, negotiation, security, and transfer
//!
//! Every channel feeds inbound frames through one dispatcher on
//! [`SessionState`], and everything the session wants a surface to show
//! arrives on one [`SessionEvent`] stream, so embedders integrate a
//! single receiver rather than one callback per subsystem.
//!
//! # Example
//!
//! ```rust,ignore
//! use peerdrop::net::identity::{PeerIdentity, ProfileStore};
//! use peerdrop::SessionState;
//!
//! // Load the persistent identity (creates one on first run)
//! let store = ProfileStore::open().await?;
//! let identity = PeerIdentity::load_or_create(&store).await?;
//!
//! // Build the session and watch its events
//! let (session, mut events) = SessionState::new(identity, store, 256);
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod app;
pub mod net;

pub use app::state::{SessionEvent, SessionState};
