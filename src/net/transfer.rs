//! Transfer coordination: batches, pacing, and progress
//!
//! The coordinator walks the pending slice of the file queue for one
//! connection at a time, strictly sequentially: a file reaches a terminal
//! state before the next one starts. Chunk pacing follows a per-channel
//! profile table seeded from rough channel-class throughput; a transport
//! that has measured better can override it through
//! [`ChunkChannel::throughput_hint`].
//!
//! Moving actual bytes is behind the [`ChunkTransport`] trait. The bundled
//! [`SimulatedTransport`] paces ticks and moves nothing, which keeps every
//! status, progress, and speed code path honest without a wire. A live
//! transport slots in at `open_channel`, which is also where a session
//! handshake would run before the first chunk.
//!
//! Batches addressed to distinct connections may run concurrently; all
//! per-batch state lives on the stack.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::files::{FileEntry, FileQueue, FileStatus};
use crate::app::state::{EventSink, SessionEvent, SessionState};
use crate::net::connection::{ChannelKind, Connection};
use crate::net::message::PeerMessage;
use crate::net::negotiation::Responder;

/// Floor for the chunk pacing interval.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Transfer failures. A channel failure marks one file and the batch moves
/// on; only an unknown connection aborts before any state changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The target connection id is not registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// The chunk channel refused a write.
    #[error("chunk channel failed: {0}")]
    Channel(Arc<str>),
}

/// Chunking and pacing parameters for one channel class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProfile {
    /// Bytes per chunk.
    pub chunk_size: u64,
    /// Nominal throughput in bytes per second.
    pub rate_bps: u64,
}

/// 128 KiB chunks at ~10 MB/s.
pub const LAN_PROFILE: TransferProfile = TransferProfile::new(131_072, 10_485_760);

/// 64 KiB chunks at ~2 MB/s. No channel maps here by default; a transport
/// that has measured WAN-class throughput returns it as a hint.
pub const WAN_PROFILE: TransferProfile = TransferProfile::new(65_536, 2_097_152);

/// 16 KiB chunks at ~500 KB/s.
pub const BLUETOOTH_PROFILE: TransferProfile = TransferProfile::new(16_384, 524_288);

/// 8 KiB chunks at ~1 MB/s. Relayed traffic is the slowest class.
pub const RELAY_PROFILE: TransferProfile = TransferProfile::new(8_192, 1_048_576);

/// 32 KiB chunks at ~3 MB/s, for every channel without a dedicated profile.
pub const DEFAULT_PROFILE: TransferProfile = TransferProfile::new(32_768, 3_145_728);

impl TransferProfile {
    #[must_use]
    pub const fn new(chunk_size: u64, rate_bps: u64) -> Self {
        Self {
            chunk_size,
            rate_bps,
        }
    }

    /// Pacing interval for one chunk: `chunk_size / rate`, floored at 10 ms.
    #[must_use]
    pub fn tick(&self) -> Duration {
        if self.rate_bps == 0 {
            return MIN_TICK;
        }
        let paced = Duration::from_secs_f64(self.chunk_size as f64 / self.rate_bps as f64);
        paced.max(MIN_TICK)
    }
}

/// Initial pacing profile for a channel class.
///
/// These are heuristics, not measurements; see
/// [`ChunkChannel::throughput_hint`] for the override path.
#[must_use]
pub fn profile_for(channel: ChannelKind) -> TransferProfile {
    match channel {
        ChannelKind::Lan => LAN_PROFILE,
        ChannelKind::Bluetooth => BLUETOOTH_PROFILE,
        ChannelKind::Relay => RELAY_PROFILE,
        ChannelKind::Presence | ChannelKind::Manual | ChannelKind::Qr | ChannelKind::Token => {
            DEFAULT_PROFILE
        }
    }
}

/// Opens chunk channels to registered connections.
pub trait ChunkTransport: Send + Sync {
    fn open_channel(&self, connection: &Connection) -> Result<Box<dyn ChunkChannel>, TransferError>;
}

/// One open chunk stream to a peer.
pub trait ChunkChannel: Send {
    /// Writes one chunk. An error here fails the current file only.
    fn send(&mut self, chunk: &[u8]) -> Result<(), TransferError>;

    /// Releases the channel. Called after the last chunk of a completed
    /// file; errored files just drop theirs.
    fn close(&mut self) {}

    /// A measured profile that beats the table heuristic, if the transport
    /// has one.
    fn throughput_hint(&self) -> Option<TransferProfile> {
        None
    }
}

/// Transport that paces like a real channel but moves no bytes.
#[derive(Debug, Default)]
pub struct SimulatedTransport;

impl ChunkTransport for SimulatedTransport {
    fn open_channel(
        &self,
        _connection: &Connection,
    ) -> Result<Box<dyn ChunkChannel>, TransferError> {
        Ok(Box::new(SimulatedChannel { chunks_sent: 0 }))
    }
}

/// Channel half of [`SimulatedTransport`]; counts chunks and discards them.
#[derive(Debug)]
pub struct SimulatedChannel {
    chunks_sent: u64,
}

impl ChunkChannel for SimulatedChannel {
    fn send(&mut self, _chunk: &[u8]) -> Result<(), TransferError> {
        self.chunks_sent += 1;
        Ok(())
    }

    fn close(&mut self) {
        debug!(chunks = self.chunks_sent, "Simulated channel closed");
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchReport {
    /// Files whose chunk loop started.
    pub attempted: usize,
    /// Files that reached `Completed`.
    pub completed: usize,
    /// Files that failed mid-transfer.
    pub errored: usize,
    /// Files the receiver turned down; they stay `Pending`.
    pub declined: usize,
    /// True when cancellation stopped the batch before its natural end.
    pub cancelled: bool,
}

impl BatchReport {
    /// The report for a batch that found nothing to do.
    #[must_use]
    pub fn no_op() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn is_no_op(&self) -> bool {
        self.attempted == 0 && self.declined == 0 && !self.cancelled
    }
}

enum OfferOutcome {
    Accepted,
    Declined,
    Cancelled,
}

/// Runs transfer batches and resolves file offers.
///
/// `&self` everywhere: batches to distinct connections can overlap freely.
pub struct TransferCoordinator {
    transport: Arc<dyn ChunkTransport>,
    waiters: DashMap<u64, oneshot::Sender<bool>>,
}

impl TransferCoordinator {
    #[must_use]
    pub fn new(transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            transport,
            waiters: DashMap::new(),
        }
    }

    /// A coordinator over the pacing-only transport.
    #[must_use]
    pub fn simulated() -> Self {
        Self::new(Arc::new(SimulatedTransport))
    }

    /// Answers an outstanding file offer. Returns false when no batch is
    /// waiting on that file.
    pub fn resolve_offer(&self, file_id: u64, accepted: bool) -> bool {
        if let Some((_, tx)) = self.waiters.remove(&file_id) {
            debug!(file = file_id, accepted, "File offer resolved");
            let _ = tx.send(accepted);
            true
        } else {
            debug!(file = file_id, "No batch waiting on this offer");
            false
        }
    }

    /// Whether a batch is currently waiting for an answer on this file.
    #[must_use]
    pub fn has_waiter(&self, file_id: u64) -> bool {
        self.waiters.contains_key(&file_id)
    }

    /// Sends every pending file to one connection, strictly in order.
    ///
    /// With an `offer` path each file is announced first and starts only on
    /// acceptance; declined files stay `Pending`. Without one, files go
    /// immediately. Cancellation is honored between files and while waiting
    /// on an offer; a file mid-chunk always runs to its terminal state.
    #[instrument(skip_all, fields(connection = connection_id))]
    pub async fn send_files(
        &self,
        state: &SessionState,
        connection_id: &str,
        offer: Option<Responder>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, TransferError> {
        let Some(connection) = state.connections.get(connection_id) else {
            state.events.error("Unknown device");
            return Err(TransferError::UnknownConnection(connection_id.to_string()));
        };

        let pending = state.files.pending_ids();
        if pending.is_empty() {
            state.events.warning("No files ready to send");
            return Ok(BatchReport::no_op());
        }
        let batch_size = pending.len();

        state.events.info(format!(
            "Sending {batch_size} file(s) to {}...",
            connection.name
        ));
        info!(files = batch_size, channel = %connection.channel, "Batch started");

        let mut report = BatchReport::default();
        for file_id in pending {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            // Entries can be removed or change hands between batch start
            // and their turn.
            let Some(entry) = state.files.entry(file_id) else {
                continue;
            };
            if entry.status != FileStatus::Pending {
                continue;
            }

            if let Some(offer) = offer.as_ref() {
                match self.offer_and_wait(offer, &entry, cancel).await {
                    OfferOutcome::Accepted => {}
                    OfferOutcome::Declined => {
                        state.events.warning(format!("{} was declined", entry.name));
                        report.declined += 1;
                        continue;
                    }
                    OfferOutcome::Cancelled => {
                        report.cancelled = true;
                        break;
                    }
                }
            }

            report.attempted += 1;
            let mut channel = match self.transport.open_channel(&connection) {
                Ok(channel) => channel,
                Err(error) => {
                    warn!(%error, file = %entry.name, "Chunk channel open failed");
                    state.files.update(file_id, |e| e.status = FileStatus::Error);
                    state.events.error(format!("Failed to send {}", entry.name));
                    report.errored += 1;
                    continue;
                }
            };
            let profile = channel
                .throughput_hint()
                .unwrap_or_else(|| profile_for(connection.channel));

            match run_file(&state.files, &state.events, channel.as_mut(), profile, &entry).await {
                Ok(final_speed) => {
                    state.files.update(file_id, |e| {
                        e.status = FileStatus::Completed;
                        e.progress_percent = 100;
                        e.speed_bps = final_speed;
                    });
                    state.events.emit(SessionEvent::TransferProgress {
                        file_id,
                        percent: 100,
                        speed_bps: final_speed,
                    });
                    channel.close();
                    report.completed += 1;
                    debug!(file = %entry.name, "File sent");
                }
                Err(error) => {
                    warn!(%error, file = %entry.name, "File transfer failed");
                    state.files.update(file_id, |e| e.status = FileStatus::Error);
                    state.events.error(format!("Failed to send {}", entry.name));
                    report.errored += 1;
                }
            }
        }

        if report.cancelled && report.completed == 0 {
            state.events.info("Transfer cancelled");
        } else if report.completed == batch_size {
            state.events.success(format!(
                "Sent {} file(s) to {}",
                report.completed, connection.name
            ));
        } else if report.completed > 0 {
            state
                .events
                .warning(format!("Sent {}/{batch_size} file(s)", report.completed));
        } else if report.attempted == 0 && report.declined > 0 {
            state.events.warning("Every file was declined");
        } else {
            state.events.error("All file transfers failed");
        }

        state.events.emit(SessionEvent::BatchFinished {
            connection_id: connection_id.to_string(),
            report: report.clone(),
        });
        info!(
            attempted = report.attempted,
            completed = report.completed,
            errored = report.errored,
            declined = report.declined,
            cancelled = report.cancelled,
            "Batch finished"
        );
        Ok(report)
    }

    async fn offer_and_wait(
        &self,
        offer: &Responder,
        entry: &FileEntry,
        cancel: &CancellationToken,
    ) -> OfferOutcome {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(entry.id, tx);
        offer(PeerMessage::FileOffer {
            file_id: entry.id,
            file_name: entry.name.clone(),
            file_size: entry.size_bytes,
            file_type: entry.mime.clone(),
        });
        debug!(file = entry.id, name = %entry.name, "File offered");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => OfferOutcome::Cancelled,
            answer = rx => match answer {
                Ok(true) => OfferOutcome::Accepted,
                Ok(false) | Err(_) => OfferOutcome::Declined,
            },
        };
        self.waiters.remove(&entry.id);
        outcome
    }
}

impl std::fmt::Debug for TransferCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("waiters", &self.waiters.len())
            .finish_non_exhaustive()
    }
}

/// Streams one file's chunks, updating progress and speed per tick.
///
/// Returns the final measured speed. Progress is capped at 99 until the
/// caller commits the terminal state.
async fn run_file(
    queue: &FileQueue,
    events: &EventSink,
    channel: &mut dyn ChunkChannel,
    profile: TransferProfile,
    entry: &FileEntry,
) -> Result<f64, TransferError> {
    queue.update(entry.id, |e| {
        e.status = FileStatus::Sending;
        e.progress_percent = 0;
        e.speed_bps = 0.0;
    });

    let started = Instant::now();
    let total_chunks = entry.size_bytes.div_ceil(profile.chunk_size).max(1);
    let tick = profile.tick();
    let buffer = vec![0u8; profile.chunk_size as usize];

    for current in 1..=total_chunks {
        sleep(tick).await;

        let chunk_len = if current == total_chunks {
            entry.size_bytes - (total_chunks - 1) * profile.chunk_size
        } else {
            profile.chunk_size
        };
        channel.send(&buffer[..chunk_len as usize])?;

        let transferred = (current * profile.chunk_size).min(entry.size_bytes);
        let percent = ((current as f64 / total_chunks as f64) * 100.0).min(99.0) as u8;
        let speed = transfer_speed(transferred, started.elapsed());
        queue.update(entry.id, |e| {
            e.progress_percent = percent;
            e.speed_bps = speed;
        });
        events.emit(SessionEvent::TransferProgress {
            file_id: entry.id,
            percent,
            speed_bps: speed,
        });
    }

    Ok(transfer_speed(entry.size_bytes, started.elapsed()))
}

/// Bytes per second over an elapsed window; zero elapsed reads as zero,
/// never infinity.
fn transfer_speed(bytes: u64, elapsed: Duration) -> f64 {
    let millis = elapsed.as_millis();
    if millis == 0 {
        return 0.0;
    }
    (bytes as f64 / millis as f64) * 1000.0
}

const SIZE_UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Human-readable byte count: `1.5 KB`, `2 MB`. Two decimals, trailing
/// zeros trimmed, capped at GB.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    format_size_f(bytes as f64)
}

/// Human-readable transfer speed: `512 KB/s`.
#[must_use]
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_size_f(bytes_per_second))
}

fn format_size_f(bytes: f64) -> String {
    if bytes <= 0.0 {
        return "0 B".to_string();
    }
    let exp = ((bytes.ln() / 1024_f64.ln()).floor() as usize).min(SIZE_UNITS.len() - 1);
    let value = bytes / 1024_f64.powi(exp as i32);
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", SIZE_UNITS[exp])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::state::{NoticeLevel, SessionState};
    use crate::net::connection::{ConnectionRegistry, DeviceClass, DiscoveredPeer};
    use crate::net::identity::{PeerIdentity, ProfileStore};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn identity(id: &str) -> PeerIdentity {
        PeerIdentity {
            id: id.to_string(),
            token: "AAAABBBBCCCC".to_string(),
            name: "Transfer tester".to_string(),
            device_class: DeviceClass::Desktop,
            browser_name: "PeerDrop".to_string(),
            os_name: "Linux".to_string(),
        }
    }

    fn session() -> (TempDir, Arc<SessionState>, mpsc::Receiver<SessionEvent>) {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::at(dir.path());
        let (state, events) = SessionState::new(identity("localpeer0001"), store, 256);
        (dir, state, events)
    }

    /// Registers a connection over `channel` and returns its id.
    fn register(registry: &ConnectionRegistry, channel: ChannelKind) -> String {
        let peer = DiscoveredPeer::new(
            "remotepeer001",
            "Remote",
            DeviceClass::Desktop,
            "Firefox",
            "Linux",
        );
        let conn = Connection::from_peer(channel, &peer);
        let id = conn.id.clone();
        registry.insert(conn);
        id
    }

    fn notices(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<(NoticeLevel, String)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Notice { level, text } = event {
                out.push((level, text));
            }
        }
        out
    }

    fn progress_percents(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::TransferProgress { percent, .. } = event {
                out.push(percent);
            }
        }
        out
    }

    /// Fails one of its channels after a set number of chunks.
    struct FailingTransport {
        opens: AtomicUsize,
        fail_open_index: usize,
        fail_after_chunks: usize,
    }

    impl FailingTransport {
        fn new(fail_open_index: usize, fail_after_chunks: usize) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                fail_open_index,
                fail_after_chunks,
            }
        }
    }

    impl ChunkTransport for FailingTransport {
        fn open_channel(
            &self,
            _connection: &Connection,
        ) -> Result<Box<dyn ChunkChannel>, TransferError> {
            let index = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(FailingChannel {
                healthy: index != self.fail_open_index,
                remaining: self.fail_after_chunks,
            }))
        }
    }

    struct FailingChannel {
        healthy: bool,
        remaining: usize,
    }

    impl ChunkChannel for FailingChannel {
        fn send(&mut self, _chunk: &[u8]) -> Result<(), TransferError> {
            if self.healthy {
                return Ok(());
            }
            if self.remaining == 0 {
                return Err(TransferError::Channel("synthetic failure".into()));
            }
            self.remaining -= 1;
            Ok(())
        }
    }

    /// Logs channel opens and chunk writes into a shared trace.
    struct RecordingTransport {
        opens: AtomicUsize,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChunkTransport for RecordingTransport {
        fn open_channel(
            &self,
            _connection: &Connection,
        ) -> Result<Box<dyn ChunkChannel>, TransferError> {
            let index = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.lock().push(format!("open:{index}"));
            Ok(Box::new(RecordingChannel {
                index,
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct RecordingChannel {
        index: usize,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChunkChannel for RecordingChannel {
        fn send(&mut self, _chunk: &[u8]) -> Result<(), TransferError> {
            self.log.lock().push(format!("chunk:{}", self.index));
            Ok(())
        }
    }

    mod profile_tests {
        use super::*;

        #[test]
        fn table_matches_channel_classes() {
            assert_eq!(profile_for(ChannelKind::Lan), LAN_PROFILE);
            assert_eq!(profile_for(ChannelKind::Bluetooth), BLUETOOTH_PROFILE);
            assert_eq!(profile_for(ChannelKind::Relay), RELAY_PROFILE);
            for kind in [
                ChannelKind::Presence,
                ChannelKind::Manual,
                ChannelKind::Qr,
                ChannelKind::Token,
            ] {
                assert_eq!(profile_for(kind), DEFAULT_PROFILE, "{kind}");
            }
        }

        #[test]
        fn profile_numbers() {
            assert_eq!(LAN_PROFILE, TransferProfile::new(131_072, 10_485_760));
            assert_eq!(WAN_PROFILE, TransferProfile::new(65_536, 2_097_152));
            assert_eq!(BLUETOOTH_PROFILE, TransferProfile::new(16_384, 524_288));
            assert_eq!(RELAY_PROFILE, TransferProfile::new(8_192, 1_048_576));
            assert_eq!(DEFAULT_PROFILE, TransferProfile::new(32_768, 3_145_728));
        }

        #[test]
        fn tick_is_floored_at_ten_millis() {
            // 8192 / 1048576 would pace at 7.8 ms.
            assert_eq!(RELAY_PROFILE.tick(), Duration::from_millis(10));
            assert_eq!(LAN_PROFILE.tick(), Duration::from_micros(12_500));
            assert!(DEFAULT_PROFILE.tick() > Duration::from_millis(10));
            assert!(DEFAULT_PROFILE.tick() < Duration::from_millis(11));
        }

        #[test]
        fn zero_rate_falls_back_to_the_floor() {
            assert_eq!(
                TransferProfile::new(1024, 0).tick(),
                Duration::from_millis(10)
            );
        }
    }

    mod speed_tests {
        use super::*;

        #[test]
        fn zero_elapsed_reads_as_zero() {
            assert_eq!(transfer_speed(1_000_000, Duration::ZERO), 0.0);
        }

        #[test]
        fn steady_rate() {
            let speed = transfer_speed(1_048_576, Duration::from_secs(1));
            assert!((speed - 1_048_576.0).abs() < f64::EPSILON);

            let speed = transfer_speed(1000, Duration::from_millis(500));
            assert!((speed - 2000.0).abs() < f64::EPSILON);
        }
    }

    mod format_tests {
        use super::*;

        #[test]
        fn size_units_and_trimming() {
            assert_eq!(format_size(0), "0 B");
            assert_eq!(format_size(512), "512 B");
            assert_eq!(format_size(1023), "1023 B");
            assert_eq!(format_size(1024), "1 KB");
            assert_eq!(format_size(1536), "1.5 KB");
            assert_eq!(format_size(1234), "1.21 KB");
            assert_eq!(format_size(1_048_576), "1 MB");
            assert_eq!(format_size(2_621_440), "2.5 MB");
            assert_eq!(format_size(1_073_741_824), "1 GB");
        }

        #[test]
        fn very_large_sizes_stay_in_gigabytes() {
            assert_eq!(format_size(5_497_558_138_880), "5120 GB");
        }

        #[test]
        fn speed_formatting() {
            assert_eq!(format_speed(0.0), "0 B/s");
            assert_eq!(format_speed(1536.0), "1.5 KB/s");
            assert_eq!(format_speed(1_048_576.0), "1 MB/s");
        }
    }

    mod batch_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn unknown_connection_changes_nothing() {
            let (_dir, state, _events) = session();
            let file_id = state.files.add("a.txt", 1000, "text/plain");
            let coordinator = TransferCoordinator::simulated();

            let err = coordinator
                .send_files(&state, "P2P-nobody", None, &CancellationToken::new())
                .await
                .unwrap_err();

            assert_eq!(err, TransferError::UnknownConnection("P2P-nobody".into()));
            assert_eq!(
                state.files.entry(file_id).unwrap().status,
                FileStatus::Pending
            );
        }

        #[tokio::test(start_paused = true)]
        async fn empty_queue_is_a_no_op_with_a_warning() {
            let (_dir, state, mut events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let coordinator = TransferCoordinator::simulated();

            let report = coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            assert!(report.is_no_op());
            let texts = notices(&mut events);
            assert!(
                texts
                    .iter()
                    .any(|(level, text)| *level == NoticeLevel::Warning
                        && text.contains("No files")),
                "{texts:?}"
            );
        }

        #[tokio::test(start_paused = true)]
        async fn single_file_completes_with_final_speed() {
            let (_dir, state, _events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let file_id = state.files.add("photo.jpg", 100_000, "image/jpeg");
            let coordinator = TransferCoordinator::simulated();

            let report = coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(report.attempted, 1);
            assert_eq!(report.completed, 1);
            assert_eq!(report.errored, 0);
            assert!(!report.cancelled);

            let entry = state.files.entry(file_id).unwrap();
            assert_eq!(entry.status, FileStatus::Completed);
            assert_eq!(entry.progress_percent, 100);
            assert!(entry.speed_bps > 0.0);
        }

        #[tokio::test(start_paused = true)]
        async fn progress_caps_at_99_until_the_final_commit() {
            let (_dir, state, mut events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            // Four chunks under the default profile.
            state.files.add("doc.pdf", 100_000, "application/pdf");
            let coordinator = TransferCoordinator::simulated();

            coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(progress_percents(&mut events), vec![25, 50, 75, 99, 100]);
        }

        #[tokio::test(start_paused = true)]
        async fn a_zero_byte_file_still_takes_one_tick() {
            let (_dir, state, _events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let file_id = state.files.add("empty.bin", 0, "application/octet-stream");
            let coordinator = TransferCoordinator::simulated();

            let report = coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(report.completed, 1);
            let entry = state.files.entry(file_id).unwrap();
            assert_eq!(entry.status, FileStatus::Completed);
            assert_eq!(entry.progress_percent, 100);
        }

        #[tokio::test(start_paused = true)]
        async fn completed_entries_are_never_reprocessed() {
            let (_dir, state, mut events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let file_id = state.files.add("a.txt", 1000, "text/plain");
            let coordinator = TransferCoordinator::simulated();

            coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();
            let _ = notices(&mut events);

            let report = coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            assert!(report.is_no_op());
            let entry = state.files.entry(file_id).unwrap();
            assert_eq!(entry.status, FileStatus::Completed);
            assert_eq!(entry.progress_percent, 100);
        }

        #[tokio::test(start_paused = true)]
        async fn mid_file_failure_marks_the_file_and_continues() {
            let (_dir, state, mut events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let first = state.files.add("a.txt", 1000, "text/plain");
            // Four chunks; the failing channel allows one then errors.
            let second = state
                .files
                .add("b.bin", 100_000, "application/octet-stream");
            let third = state.files.add("c.txt", 1000, "text/plain");

            let coordinator = TransferCoordinator::new(Arc::new(FailingTransport::new(2, 1)));
            let report = coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(report.attempted, 3);
            assert_eq!(report.completed, 2);
            assert_eq!(report.errored, 1);
            assert!(!report.cancelled);

            assert_eq!(
                state.files.entry(first).unwrap().status,
                FileStatus::Completed
            );
            assert_eq!(state.files.entry(second).unwrap().status, FileStatus::Error);
            assert_eq!(
                state.files.entry(third).unwrap().status,
                FileStatus::Completed
            );

            let texts = notices(&mut events);
            assert!(texts
                .iter()
                .any(|(level, text)| *level == NoticeLevel::Error && text.contains("b.bin")));
            assert!(texts
                .iter()
                .any(|(level, text)| *level == NoticeLevel::Warning && text.contains("2/3")));
        }

        #[tokio::test(start_paused = true)]
        async fn files_go_strictly_one_after_another() {
            let (_dir, state, _events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            state.files.add("a.txt", 1000, "text/plain");
            state.files.add("b.bin", 100_000, "application/octet-stream");
            state.files.add("c.txt", 1000, "text/plain");

            let log = Arc::new(Mutex::new(Vec::new()));
            let coordinator = TransferCoordinator::new(Arc::new(RecordingTransport {
                opens: AtomicUsize::new(0),
                log: Arc::clone(&log),
            }));
            coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            let trace = log.lock().clone();
            assert_eq!(
                trace,
                vec![
                    "open:1", "chunk:1", "open:2", "chunk:2", "chunk:2", "chunk:2", "chunk:2",
                    "open:3", "chunk:3",
                ]
            );
        }

        #[tokio::test(start_paused = true)]
        async fn cancel_before_start_leaves_everything_pending() {
            let (_dir, state, mut events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let file_id = state.files.add("a.txt", 1000, "text/plain");

            let cancel = CancellationToken::new();
            cancel.cancel();
            let coordinator = TransferCoordinator::simulated();
            let report = coordinator
                .send_files(&state, &conn_id, None, &cancel)
                .await
                .unwrap();

            assert!(report.cancelled);
            assert_eq!(report.attempted, 0);
            assert_eq!(
                state.files.entry(file_id).unwrap().status,
                FileStatus::Pending
            );
            let texts = notices(&mut events);
            assert!(texts.iter().any(|(_, text)| text.contains("cancelled")));
        }

        #[tokio::test(start_paused = true)]
        async fn cancel_mid_batch_finishes_the_current_file_only() {
            let (_dir, state, _events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let first = state.files.add("a.txt", 1000, "text/plain");
            let second = state
                .files
                .add("b.bin", 100_000, "application/octet-stream");
            let third = state.files.add("c.txt", 1000, "text/plain");

            let coordinator = Arc::new(TransferCoordinator::simulated());
            let cancel = CancellationToken::new();
            let batch = {
                let coordinator = Arc::clone(&coordinator);
                let state = Arc::clone(&state);
                let conn_id = conn_id.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    coordinator
                        .send_files(state.as_ref(), &conn_id, None, &cancel)
                        .await
                })
            };

            // First file finishes around 10 ms; the second runs well past
            // this point and must still complete after the cancel.
            tokio::time::sleep(Duration::from_millis(15)).await;
            cancel.cancel();
            let report = batch.await.unwrap().unwrap();

            assert!(report.cancelled);
            assert_eq!(report.attempted, 2);
            assert_eq!(report.completed, 2);
            assert_eq!(
                state.files.entry(first).unwrap().status,
                FileStatus::Completed
            );
            assert_eq!(
                state.files.entry(second).unwrap().status,
                FileStatus::Completed
            );
            assert_eq!(state.files.entry(third).unwrap().status, FileStatus::Pending);
        }

        #[tokio::test(start_paused = true)]
        async fn a_throughput_hint_overrides_the_table() {
            struct HintedTransport;
            struct HintedChannel;

            impl ChunkTransport for HintedTransport {
                fn open_channel(
                    &self,
                    _connection: &Connection,
                ) -> Result<Box<dyn ChunkChannel>, TransferError> {
                    Ok(Box::new(HintedChannel))
                }
            }
            impl ChunkChannel for HintedChannel {
                fn send(&mut self, _chunk: &[u8]) -> Result<(), TransferError> {
                    Ok(())
                }
                fn throughput_hint(&self) -> Option<TransferProfile> {
                    Some(WAN_PROFILE)
                }
            }

            let (_dir, state, mut events) = session();
            // LAN would move this in one 128 KiB chunk; the hint's 64 KiB
            // chunks need two.
            let conn_id = register(&state.connections, ChannelKind::Lan);
            state.files.add("a.bin", 100_000, "application/octet-stream");

            let coordinator = TransferCoordinator::new(Arc::new(HintedTransport));
            coordinator
                .send_files(&state, &conn_id, None, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(progress_percents(&mut events), vec![50, 99, 100]);
        }
    }

    mod offer_tests {
        use super::*;

        fn capturing_offer() -> (Responder, Arc<Mutex<Vec<PeerMessage>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let responder: Responder = Box::new(move |msg| sink.lock().push(msg));
            (responder, seen)
        }

        async fn wait_for_waiter(coordinator: &TransferCoordinator, file_id: u64) {
            while !coordinator.has_waiter(file_id) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        #[tokio::test(start_paused = true)]
        async fn accepted_offer_starts_the_file() {
            let (_dir, state, _events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let file_id = state.files.add("a.txt", 1000, "text/plain");

            let (offer, seen) = capturing_offer();
            let coordinator = Arc::new(TransferCoordinator::simulated());
            let batch = {
                let coordinator = Arc::clone(&coordinator);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    coordinator
                        .send_files(
                            state.as_ref(),
                            &conn_id,
                            Some(offer),
                            &CancellationToken::new(),
                        )
                        .await
                })
            };

            wait_for_waiter(&coordinator, file_id).await;
            let offers = seen.lock().clone();
            assert!(matches!(
                offers.as_slice(),
                [PeerMessage::FileOffer { file_id: id, file_name, file_size: 1000, .. }]
                    if *id == file_id && file_name == "a.txt"
            ));

            assert!(coordinator.resolve_offer(file_id, true));
            let report = batch.await.unwrap().unwrap();

            assert_eq!(report.completed, 1);
            assert_eq!(report.declined, 0);
            assert_eq!(
                state.files.entry(file_id).unwrap().status,
                FileStatus::Completed
            );
        }

        #[tokio::test(start_paused = true)]
        async fn declined_offer_leaves_the_entry_pending() {
            let (_dir, state, mut events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let file_id = state.files.add("a.txt", 1000, "text/plain");

            let (offer, _seen) = capturing_offer();
            let coordinator = Arc::new(TransferCoordinator::simulated());
            let batch = {
                let coordinator = Arc::clone(&coordinator);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    coordinator
                        .send_files(
                            state.as_ref(),
                            &conn_id,
                            Some(offer),
                            &CancellationToken::new(),
                        )
                        .await
                })
            };

            wait_for_waiter(&coordinator, file_id).await;
            assert!(coordinator.resolve_offer(file_id, false));
            let report = batch.await.unwrap().unwrap();

            assert_eq!(report.attempted, 0);
            assert_eq!(report.declined, 1);
            assert_eq!(
                state.files.entry(file_id).unwrap().status,
                FileStatus::Pending
            );
            let texts = notices(&mut events);
            assert!(
                texts
                    .iter()
                    .any(|(level, text)| *level == NoticeLevel::Warning
                        && text.contains("declined")),
                "{texts:?}"
            );
        }

        #[tokio::test(start_paused = true)]
        async fn cancel_during_the_offer_wait_stops_the_batch() {
            let (_dir, state, _events) = session();
            let conn_id = register(&state.connections, ChannelKind::Presence);
            let file_id = state.files.add("a.txt", 1000, "text/plain");

            let (offer, _seen) = capturing_offer();
            let coordinator = Arc::new(TransferCoordinator::simulated());
            let cancel = CancellationToken::new();
            let batch = {
                let coordinator = Arc::clone(&coordinator);
                let state = Arc::clone(&state);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    coordinator
                        .send_files(state.as_ref(), &conn_id, Some(offer), &cancel)
                        .await
                })
            };

            wait_for_waiter(&coordinator, file_id).await;
            cancel.cancel();
            let report = batch.await.unwrap().unwrap();

            assert!(report.cancelled);
            assert_eq!(report.attempted, 0);
            assert!(!coordinator.has_waiter(file_id));
            assert_eq!(
                state.files.entry(file_id).unwrap().status,
                FileStatus::Pending
            );
        }

        #[tokio::test]
        async fn resolving_without_a_waiter_reports_false() {
            let coordinator = TransferCoordinator::simulated();
            assert!(!coordinator.resolve_offer(999, true));
        }
    }
}
