//! Single-file transfer (C11): metadata frame, resume negotiation, chunked
//! body, per-file ack (spec.md §4.11 steps 1-4).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::TransferError;
use crate::net::connection::Connection;
use crate::transfer::{read_frame, write_frame, StatusReporter, TransferControl, TransferState};

pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub seeked: u64,
}

/// Receiver's reply to the metadata frame: either the offset to resume from
/// (0 for a fresh download), or an outright rejection (spec.md §4.11 step 4:
/// "0x00 rejecting at step 1").
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ResumeReply {
    Resume { seeked: u64 },
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Completed,
    Paused { seeked: u64 },
}

/// Sends one file over an already-acquired connection. `start_seeked` lets
/// `continue_transfer()` (resume) replay the handshake at a previously saved
/// offset instead of always starting from zero.
pub async fn send_file(
    conn: &Connection,
    path: &Path,
    start_seeked: u64,
    control: &TransferControl,
    status: &StatusReporter,
) -> Result<FileOutcome, TransferError> {
    let metadata = tokio::fs::metadata(path).await?;
    let size = metadata.len();
    let name = file_name_of(path);

    let mut guard = conn.lock().await;
    write_frame(
        &mut *guard,
        &FileMeta {
            name,
            size,
            seeked: start_seeked,
        },
    )
    .await?;

    let reply: ResumeReply = read_frame(&mut *guard).await?;
    let mut seeked = match reply {
        ResumeReply::Resume { seeked } => seeked,
        ResumeReply::Reject => return Err(TransferError::Rejected),
    };

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(seeked)).await?;

    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    while seeked < size {
        if control.is_aborting() {
            return Err(TransferError::Cancelled);
        }
        if control.state() == TransferState::Paused {
            return Ok(FileOutcome::Paused { seeked });
        }
        let to_read = FILE_CHUNK_SIZE.min((size - seeked) as usize);
        file.read_exact(&mut buf[..to_read]).await?;
        guard.write_all(&buf[..to_read]).await?;
        seeked += to_read as u64;
        status.report(seeked, size).await;
    }
    guard.flush().await?;

    let ack = guard.read_u8().await?;
    if ack != 0x01 {
        return Err(TransferError::Incomplete { seeked });
    }
    status.force(size, size).await;
    Ok(FileOutcome::Completed)
}

/// Receives one file, writing it under `download_dir` with a `.part` suffix
/// until complete, then renaming (collision-avoiding) to its final name.
pub async fn receive_file(
    conn: &Connection,
    download_dir: &Path,
    control: &TransferControl,
    status: &StatusReporter,
) -> Result<(PathBuf, FileOutcome), TransferError> {
    let mut guard = conn.lock().await;
    let meta: FileMeta = read_frame(&mut *guard).await?;

    tokio::fs::create_dir_all(download_dir).await?;
    let part_path = download_dir.join(format!("{}.{}", meta.name, crate::config::FILE_ERROR_EXT));
    let existing = tokio::fs::metadata(&part_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let seeked = existing.min(meta.size);

    write_frame(&mut *guard, &ResumeReply::Resume { seeked }).await?;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&part_path)
        .await?;
    file.seek(std::io::SeekFrom::Start(seeked)).await?;

    let mut received = seeked;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    while received < meta.size {
        if control.is_aborting() {
            return Err(TransferError::Cancelled);
        }
        if control.state() == TransferState::Paused {
            return Ok((part_path, FileOutcome::Paused { seeked: received }));
        }
        let to_read = FILE_CHUNK_SIZE.min((meta.size - received) as usize);
        guard.read_exact(&mut buf[..to_read]).await?;
        file.write_all(&buf[..to_read]).await?;
        received += to_read as u64;
        status.report(received, meta.size).await;
    }
    file.flush().await?;
    guard.write_u8(0x01).await?;
    status.force(meta.size, meta.size).await;

    let final_path = unique_file_destination(download_dir, &meta.name).await;
    tokio::fs::rename(&part_path, &final_path).await?;
    Ok((final_path, FileOutcome::Completed))
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// Avoids clobbering an existing file of the same name by appending `(n)`
/// before the extension (spec.md §6 supplemented collision-renaming
/// feature).
pub async fn unique_file_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return candidate;
    }
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = Path::new(name).extension().map(|e| e.to_string_lossy().into_owned());
    for n in 1u32.. {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(candidate_name);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
    }
    unreachable!("collision loop is unbounded in practice, n fits u32")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::ui_bridge::UiBridge;
    use std::sync::Arc;
    use std::time::Duration;

    fn control() -> Arc<TransferControl> {
        TransferControl::new()
    }

    fn status() -> StatusReporter {
        let (ui, _rx) = UiBridge::new(16);
        StatusReporter::new(ui, PeerId::from_seed(1), 1, Duration::from_millis(10))
    }

    async fn paired_connections() -> (Arc<Connection>, Arc<Connection>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server = accept_task.await.unwrap();
        (
            Connection::new(PeerId::from_seed(1), client),
            Connection::new(PeerId::from_seed(2), server),
        )
    }

    #[tokio::test]
    async fn a_small_file_transfers_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("hello.txt");
        tokio::fs::write(&src_path, b"hello, world").await.unwrap();
        let dst_dir = dir.path().join("downloads");

        let (sender_conn, receiver_conn) = paired_connections().await;
        let control = control();
        let stat = status();

        let receiver = tokio::spawn(async move {
            let control = TransferControl::new();
            let (ui, _rx) = UiBridge::new(16);
            let stat = StatusReporter::new(ui, PeerId::from_seed(9), 1, Duration::from_millis(10));
            receive_file(&receiver_conn, &dst_dir, &control, &stat).await.map(|(p, _)| p)
        });

        let outcome = send_file(&sender_conn, &src_path, 0, &control, &stat).await.unwrap();
        assert_eq!(outcome, FileOutcome::Completed);

        let final_path = receiver.await.unwrap().unwrap();
        let contents = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(contents, b"hello, world");
    }

    #[tokio::test]
    async fn unique_destination_appends_a_counter_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"1").await.unwrap();
        let picked = unique_file_destination(dir.path(), "a.txt").await;
        assert_eq!(picked.file_name().unwrap().to_str().unwrap(), "a (1).txt");
    }
}
