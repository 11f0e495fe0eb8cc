//! Manual signaling exchange
//!
//! When no shared room or relay exists, two devices can still pair by
//! passing a small text blob out of band (chat, email, a QR on paper). The
//! blob is standard base64 over a JSON payload carrying the sender's access
//! token and identity:
//!
//! ```json
//! { "token": "...", "peerId": "...", "name": "...",
//!   "deviceType": "...", "browser": "...", "os": "...", "timestamp": 0 }
//! ```
//!
//! The creator shares its blob and waits up to [`WAIT_TIMEOUT`] for the
//! joiner's answer blob (same format, the joiner's identity). Each side
//! registers a `MANUAL-{other peer id}` connection, so a completed exchange
//! is symmetric. The wait is cancellable; an expired or cancelled exchange
//! registers nothing and can simply be started again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::app::state::EventSink;
use crate::net::connection::{
    ChannelKind, Connection, ConnectionRegistry, DeviceClass, DiscoveredPeer,
};
use crate::net::identity::PeerIdentity;

/// How long the creator waits for an answer blob.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Manual-exchange errors. All user-visible and recoverable.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ManualError {
    /// Not base64, not UTF-8, or not the expected JSON.
    #[error("connection data is not valid")]
    Malformed,

    /// Payload decoded but a required field is missing or empty.
    #[error("connection data is missing {0}")]
    MissingField(&'static str),

    /// The 60-second wait elapsed before the answer arrived.
    #[error("manual connection wait timed out")]
    Expired,

    /// The wait was cancelled locally.
    #[error("manual connection cancelled")]
    Cancelled,
}

/// The decoded signaling payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default)]
    pub token: String,
    #[serde(rename = "peerId", default)]
    pub peer_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "deviceType", default)]
    pub device_class: DeviceClass,
    #[serde(rename = "browser", default)]
    pub browser_name: String,
    #[serde(rename = "os", default)]
    pub os_name: String,
    /// Milliseconds since the Unix epoch at creation. Informational only;
    /// freshness is enforced by the creator's wait timer, not the payload.
    #[serde(default)]
    pub timestamp: u64,
}

impl SignalPayload {
    /// Builds the payload advertising the given identity.
    #[must_use]
    pub fn for_identity(identity: &PeerIdentity, timestamp: u64) -> Self {
        Self {
            token: identity.token.clone(),
            peer_id: identity.id.clone(),
            name: identity.name.clone(),
            device_class: identity.device_class,
            browser_name: identity.browser_name.clone(),
            os_name: identity.os_name.clone(),
            timestamp,
        }
    }

    /// The peer info carried by this payload.
    #[must_use]
    pub fn peer_info(&self) -> DiscoveredPeer {
        DiscoveredPeer::new(
            self.peer_id.clone(),
            self.name.clone(),
            self.device_class,
            self.browser_name.clone(),
            self.os_name.clone(),
        )
        .sanitized()
    }
}

/// Encodes a copy/paste-safe blob for the given identity.
#[must_use]
pub fn create_blob(identity: &PeerIdentity, timestamp: u64) -> String {
    let payload = SignalPayload::for_identity(identity, timestamp);
    // Serialization of a plain struct with string and integer fields cannot
    // fail; fall back to an empty object rather than propagating.
    let json = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    BASE64.encode(json)
}

/// Decodes and validates pasted connection data.
///
/// Surrounding whitespace is tolerated. `token` and `peerId` must be present
/// and non-empty; everything else defaults.
pub fn parse_blob(text: &str) -> Result<SignalPayload, ManualError> {
    let bytes = BASE64
        .decode(text.trim())
        .map_err(|_| ManualError::Malformed)?;
    let json = String::from_utf8(bytes).map_err(|_| ManualError::Malformed)?;
    let payload: SignalPayload =
        serde_json::from_str(&json).map_err(|_| ManualError::Malformed)?;

    if payload.token.trim().is_empty() {
        return Err(ManualError::MissingField("token"));
    }
    if payload.peer_id.trim().is_empty() {
        return Err(ManualError::MissingField("peerId"));
    }
    Ok(payload)
}

/// Milliseconds since the Unix epoch, for payload timestamps.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Result of joining with a pasted blob: the registered connection plus the
/// answer blob to hand back to the creator.
#[derive(Debug)]
pub struct ManualJoin {
    pub connection: Connection,
    pub answer_blob: String,
}

/// Joins an exchange from the other side: registers `MANUAL-{creator}` and
/// produces the answer blob that completes the creator's wait.
#[instrument(skip(identity, registry, blob_text))]
pub fn join_with_blob(
    identity: &PeerIdentity,
    registry: &ConnectionRegistry,
    blob_text: &str,
) -> Result<ManualJoin, ManualError> {
    let payload = parse_blob(blob_text)?;
    let connection = Connection::from_peer(ChannelKind::Manual, &payload.peer_info());
    registry.insert(connection.clone());
    info!(peer = %payload.peer_id, "Joined manual exchange");

    Ok(ManualJoin {
        connection,
        answer_blob: create_blob(identity, now_ms()),
    })
}

struct ExchangeInner {
    deadline: Instant,
    completed: AtomicBool,
    cancel: CancellationToken,
}

/// The creator's side of a manual exchange: a shared blob plus a bounded,
/// cancellable wait for the answer.
#[derive(Clone)]
pub struct ManualExchange {
    inner: Arc<ExchangeInner>,
}

impl ManualExchange {
    /// Starts an exchange, returning the wait handle and the blob to share.
    #[must_use]
    pub fn start(identity: &PeerIdentity) -> (Self, String) {
        let blob = create_blob(identity, now_ms());
        let exchange = Self {
            inner: Arc::new(ExchangeInner {
                deadline: Instant::now() + WAIT_TIMEOUT,
                completed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };
        debug!("Manual exchange started");
        (exchange, blob)
    }

    /// Completes the exchange with the joiner's answer payload, registering
    /// `MANUAL-{joiner}` locally.
    #[instrument(skip(self, registry, answer))]
    pub fn complete(
        &self,
        registry: &ConnectionRegistry,
        answer: SignalPayload,
    ) -> Result<Connection, ManualError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ManualError::Cancelled);
        }
        if Instant::now() > self.inner.deadline {
            return Err(ManualError::Expired);
        }

        let connection = Connection::from_peer(ChannelKind::Manual, &answer.peer_info());
        registry.insert(connection.clone());
        self.inner.completed.store(true, Ordering::Relaxed);
        info!(peer = %answer.peer_id, "Manual exchange completed");
        Ok(connection)
    }

    /// Stops the wait. Completing afterwards fails with `Cancelled`.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        debug!("Manual exchange cancelled");
    }

    /// Whether the wait has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Spawns the timeout watcher: if the wait expires uncancelled and
    /// uncompleted, a warning notice is emitted. Cancellation ends the task
    /// silently.
    pub fn watch(&self, events: EventSink) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(inner.deadline) => {
                    if !inner.completed.load(Ordering::Relaxed) {
                        events.warning("Manual connection wait timed out");
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for ManualExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualExchange")
            .field("completed", &self.inner.completed.load(Ordering::Relaxed))
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}
