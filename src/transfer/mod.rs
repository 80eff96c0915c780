//! File/directory/big-file transfer (C11, C12). All three protocols share
//! one length-prefixed framing, the pause/resume/cancel state machine, and a
//! frequency-bounded status reporter (spec.md §4.11's `StatusMixIn`).

pub mod bigfile;
pub mod dir;
pub mod file;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::envelope::{Envelope, Header};
use crate::error::TransferError;
use crate::net::acceptor::{AcceptedConnection, Acceptor};
use crate::peer::PeerId;
use crate::ui_bridge::{UiBridge, UiEvent};

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_transfer_id() -> u64 {
    NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Caps a single transfer frame; generous enough for a big-file chunk header
/// or a directory listing frame, nowhere near `BIG_CHUNK_SIZE` itself (chunk
/// bodies are streamed raw, not framed as one value).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// The same `[len: u32 BE][body]` framing the envelope codec uses (spec.md
/// §4.1), generalized to any serializable type: transfer messages aren't
/// routed through the header dispatch table, so they don't need to be
/// `Envelope`s.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = postcard::to_stdvec(value).map_err(|e| TransferError::Io(std::io::Error::other(e)))?;
    let len = u32::try_from(body.len()).map_err(|_| TransferError::Io(std::io::Error::other("frame too large")))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransferError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(TransferError::Io(std::io::Error::other("frame too large")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    postcard::from_bytes(&body).map_err(|e| TransferError::Io(std::io::Error::other(e)))
}

/// Transfer lifecycle state (spec.md §4.11 "Pause/resume/cancel").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Running,
    Paused,
    Aborting,
    Completed,
}

/// Shared pause/resume/cancel signal for one transfer, read by the state
/// machine's loop body between chunks and written by whatever owns the
/// transfer from the UI side.
pub struct TransferControl {
    state: Mutex<TransferState>,
    cancel: Notify,
}

impl TransferControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransferState::Running),
            cancel: Notify::new(),
        })
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap()
    }

    pub fn is_aborting(&self) -> bool {
        self.state() == TransferState::Aborting
    }

    /// Pause: spec.md §4.11 "sets state to PAUSED; saves `current_file.seeked`;
    /// stops the read/write loop; the connection is released". Saving the
    /// offset and releasing the connection are the caller's job — this just
    /// flips the flag the running loop polls.
    pub fn pause(&self) {
        *self.state.lock().unwrap() = TransferState::Paused;
    }

    pub fn resume(&self) {
        *self.state.lock().unwrap() = TransferState::Running;
    }

    /// Cancel: sets state to ABORTING and wakes anything waiting on it. The
    /// running loop observes `is_aborting()` on its own next poll and returns
    /// `TransferError::Cancelled` (spec.md §4.11 "injects a cancellation
    /// exception into the main task").
    pub fn cancel(&self) {
        *self.state.lock().unwrap() = TransferState::Aborting;
        self.cancel.notify_waiters();
    }

    pub fn complete(&self) {
        *self.state.lock().unwrap() = TransferState::Completed;
    }
}

/// `StatusMixIn` (spec.md §4.11): throttles `transfer_update` emission to at
/// most once per `freq`, regardless of how often `report` is called.
pub struct StatusReporter {
    ui: Arc<UiBridge>,
    peer_id: PeerId,
    transfer_id: u64,
    freq: Duration,
    last_emit: Mutex<Instant>,
}

impl StatusReporter {
    pub fn new(ui: Arc<UiBridge>, peer_id: PeerId, transfer_id: u64, freq: Duration) -> Self {
        Self {
            ui,
            peer_id,
            transfer_id,
            freq,
            last_emit: Mutex::new(Instant::now() - freq),
        }
    }

    pub fn transfer_id(&self) -> u64 {
        self.transfer_id
    }

    /// Report progress, subject to the bounded-frequency throttle.
    pub async fn report(&self, bytes_done: u64, bytes_total: u64) {
        let should_emit = {
            let mut last = self.last_emit.lock().unwrap();
            if last.elapsed() >= self.freq {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if should_emit {
            self.emit(bytes_done, bytes_total).await;
        }
    }

    /// Unconditional emission, used for the first and last update of a
    /// transfer so the frontend always sees 0% and 100% regardless of the
    /// throttle window.
    pub async fn force(&self, bytes_done: u64, bytes_total: u64) {
        *self.last_emit.lock().unwrap() = Instant::now();
        self.emit(bytes_done, bytes_total).await;
    }

    async fn emit(&self, bytes_done: u64, bytes_total: u64) {
        let _ = self.peer_id;
        self.ui
            .emit(UiEvent::TransferUpdate {
                transfer_id: self.transfer_id,
                bytes_done,
                bytes_total,
            })
            .await;
    }
}

/// Chunks received so far for one big-file transfer, keyed by the sending
/// peer and file name — a single file can arrive over several concurrently
/// held `OTM_UPDATE_STREAM_LINK` connections (spec.md §4.12).
struct BigFileReceiveState {
    expected: usize,
    got: Vec<u64>,
}

/// Registers the inbound handlers spec.md §4.7/§4.11/§4.12 name on
/// `acceptor`: `CMD_FILE_CONN` (single file), `CMD_RECV_DIR` (directory),
/// `OTM_UPDATE_STREAM_LINK` (one connection's share of a big file's chunks),
/// and the acceptor-level `PING` echo.
pub fn register_inbound_handlers(
    acceptor: &Acceptor,
    ui: Arc<UiBridge>,
    download_dir: PathBuf,
    status_report_freq: Duration,
) {
    let ui_file = ui.clone();
    let download_dir_file = download_dir.clone();
    acceptor.register_handler(
        "CmdFileConn",
        Box::new(move |accepted: AcceptedConnection| {
            let ui = ui_file.clone();
            let download_dir = download_dir_file.clone();
            Box::pin(async move {
                let control = TransferControl::new();
                let transfer_id = next_transfer_id();
                let status = StatusReporter::new(ui.clone(), accepted.peer_id, transfer_id, status_report_freq);
                match file::receive_file(&accepted.connection, &download_dir, &control, &status).await {
                    Ok((path, file::FileOutcome::Completed)) => {
                        tracing::info!(peer = %accepted.peer_id, ?path, "file received");
                    }
                    Ok((_, file::FileOutcome::Paused { seeked })) => {
                        ui.emit(UiEvent::TransferIncomplete { transfer_id, seeked }).await;
                    }
                    Err(err) => {
                        tracing::warn!(peer = %accepted.peer_id, %err, "file receive failed");
                    }
                }
            })
        }),
    );

    let ui_dir = ui.clone();
    let download_dir_dir = download_dir.clone();
    acceptor.register_handler(
        "CmdRecvDir",
        Box::new(move |accepted: AcceptedConnection| {
            let ui = ui_dir.clone();
            let download_dir = download_dir_dir.clone();
            Box::pin(async move {
                let control = TransferControl::new();
                let transfer_id = next_transfer_id();
                let status = StatusReporter::new(ui, accepted.peer_id, transfer_id, status_report_freq);
                match dir::receive_dir(&accepted.connection, &download_dir, &control, &status).await {
                    Ok(root) => tracing::info!(peer = %accepted.peer_id, ?root, "directory received"),
                    Err(err) => tracing::warn!(peer = %accepted.peer_id, %err, "directory receive failed"),
                }
            })
        }),
    );

    let pending: Arc<Mutex<HashMap<(PeerId, String), BigFileReceiveState>>> = Arc::new(Mutex::new(HashMap::new()));
    acceptor.register_handler(
        "OtmUpdateStreamLink",
        Box::new(move |accepted: AcceptedConnection| {
            let download_dir = download_dir.clone();
            let pending = pending.clone();
            Box::pin(async move {
                let control = TransferControl::new();
                let meta = match bigfile::stream_negotiate_receiver(&accepted.connection).await {
                    Ok(meta) => meta,
                    Err(err) => {
                        tracing::warn!(peer = %accepted.peer_id, %err, "big-file handshake failed");
                        return;
                    }
                };
                let expected = bigfile::chunk_plan(meta.size).len();
                let key = (accepted.peer_id, meta.name.clone());
                pending
                    .lock()
                    .unwrap()
                    .entry(key.clone())
                    .or_insert_with(|| BigFileReceiveState { expected, got: Vec::new() });

                loop {
                    match bigfile::receive_chunk(&accepted.connection, &download_dir, &meta.name, &control).await {
                        Ok(Some(chunk_id)) => {
                            let completed_chunks = {
                                let mut pending = pending.lock().unwrap();
                                let Some(state) = pending.get_mut(&key) else { return };
                                state.got.push(chunk_id);
                                if state.got.len() >= state.expected {
                                    pending.remove(&key).map(|s| s.got)
                                } else {
                                    None
                                }
                            };
                            if let Some(chunk_ids) = completed_chunks {
                                match bigfile::merge_parts(&download_dir, &meta.name, &chunk_ids, &download_dir).await {
                                    Ok(path) => tracing::info!(peer = %accepted.peer_id, ?path, "big file received"),
                                    Err(err) => tracing::warn!(peer = %accepted.peer_id, %err, "big file merge failed"),
                                }
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(err) => {
                            tracing::warn!(peer = %accepted.peer_id, %err, "big-file chunk read failed");
                            return;
                        }
                    }
                }
            })
        }),
    );

    acceptor.register_handler(
        "Ping",
        Box::new(move |accepted: AcceptedConnection| {
            Box::pin(async move {
                let Some(msg_id) = accepted.msg_id else { return };
                let reply = Envelope::new(Header::Unping).with_msg_id(msg_id);
                let _ = accepted.connection.write_envelope(&reply).await;
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::net::watcher::BandwidthWatcher;

    async fn bound_acceptor() -> Arc<Acceptor> {
        let mut cfg = Config::default();
        cfg.bind_addr = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        cfg.connection_port = 0;
        let watcher = BandwidthWatcher::new(100, Duration::from_secs(60));
        Arc::new(Acceptor::bind(&cfg, watcher).await.unwrap())
    }

    #[tokio::test]
    async fn acceptor_level_ping_is_echoed_as_unping_with_the_same_msg_id() {
        let acceptor = bound_acceptor().await;
        let addr = acceptor.local_addr().unwrap();
        let (ui, _events) = UiBridge::new(8);
        register_inbound_handlers(&acceptor, ui, std::env::temp_dir(), Duration::from_secs(1));

        let acceptor_clone = acceptor.clone();
        let run_task = tokio::spawn(async move {
            acceptor_clone.run(PeerId::from_seed(1)).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let handshake = Envelope::new(Header::Ping).with_msg_id(42);
        crate::envelope::write_tcp_frame(&mut client, &handshake).await.unwrap();

        let reply = tokio::time::timeout(
            Duration::from_millis(500),
            crate::envelope::read_tcp_frame(&mut client, crate::envelope::DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(reply.header, Header::Unping);
        assert_eq!(reply.msg_id, Some(42));
        run_task.abort();
    }

    #[tokio::test]
    async fn frame_roundtrips_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &("hello".to_string(), 7u64)).await.unwrap();
        let (s, n): (String, u64) = read_frame(&mut b).await.unwrap();
        assert_eq!(s, "hello");
        assert_eq!(n, 7);
    }

    #[test]
    fn pause_then_cancel_overrides_state() {
        let control = TransferControl::new();
        control.pause();
        assert_eq!(control.state(), TransferState::Paused);
        control.cancel();
        assert!(control.is_aborting());
    }

    #[tokio::test]
    async fn status_reporter_throttles_by_frequency() {
        let (ui, mut rx) = UiBridge::new(16);
        let reporter = StatusReporter::new(ui, PeerId::from_seed(1), 42, Duration::from_millis(50));
        reporter.report(10, 100).await;
        reporter.report(20, 100).await; // too soon, suppressed
        tokio::time::sleep(Duration::from_millis(60)).await;
        reporter.report(30, 100).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, UiEvent::TransferUpdate { bytes_done: 10, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, UiEvent::TransferUpdate { bytes_done: 30, .. }));
    }
}
