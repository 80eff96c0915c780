//! Big-file transfer (C12): a file above `BIG_CHUNK_SIZE` is split into
//! fixed-size chunks and streamed across several concurrently-held
//! connections, each chunk independently acked (spec.md §4.12).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::BIG_CHUNK_SIZE;
use crate::error::TransferError;
use crate::net::connection::Connection;
use crate::transfer::file::{file_name_of, unique_file_destination, FILE_CHUNK_SIZE};
use crate::transfer::{read_frame, write_frame, StatusReporter, TransferControl, TransferState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigFileMeta {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunk_id: u64,
    pub start: u64,
    pub end: u64,
}

type ChunkHeader = ChunkPlan;

/// Splits `size` bytes into `BIG_CHUNK_SIZE`-sized chunks.
pub fn chunk_plan(size: u64) -> Vec<ChunkPlan> {
    let mut chunks = Vec::new();
    let mut start = 0u64;
    let mut chunk_id = 0u64;
    while start < size {
        let end = (start + BIG_CHUNK_SIZE).min(size);
        chunks.push(ChunkPlan { chunk_id, start, end });
        start = end;
        chunk_id += 1;
    }
    chunks
}

/// Streams `path` across `conns`, one worker per connection pulling from a
/// shared work queue so a slow or dropped stream doesn't stall the others
/// (spec.md §4.12's `OTM_UPDATE_STREAM_LINK` fan-out).
pub async fn send_big_file(
    conns: Vec<Arc<Connection>>,
    path: &Path,
    control: &Arc<TransferControl>,
    status: Arc<StatusReporter>,
) -> Result<(), TransferError> {
    let metadata = tokio::fs::metadata(path).await?;
    let size = metadata.len();
    let name = file_name_of(path);
    let meta = BigFileMeta { name, size };

    for conn in &conns {
        let mut guard = conn.lock().await;
        guard.write_u8(0x01).await?;
        write_frame(&mut *guard, &meta).await?;
        let ack = guard.read_u8().await?;
        if ack != 0x01 {
            return Err(TransferError::Rejected);
        }
    }

    let plan = chunk_plan(size);
    let total_chunks = plan.len();
    let queue = Arc::new(Mutex::new(VecDeque::from(plan)));
    let remaining = Arc::new(AtomicUsize::new(total_chunks));
    let sent_bytes = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for conn in conns {
        let queue = Arc::clone(&queue);
        let remaining = Arc::clone(&remaining);
        let sent_bytes = Arc::clone(&sent_bytes);
        let control = Arc::clone(control);
        let status = Arc::clone(&status);
        let path = path.to_path_buf();
        workers.push(tokio::spawn(async move {
            loop {
                if control.is_aborting() {
                    return;
                }
                let chunk = { queue.lock().unwrap().pop_front() };
                let Some(chunk) = chunk else { return };
                match send_chunk(&conn, &path, chunk, &control).await {
                    Ok(()) => {
                        remaining.fetch_sub(1, Ordering::SeqCst);
                        let done = sent_bytes.fetch_add(
                            (chunk.end - chunk.start) as usize,
                            Ordering::SeqCst,
                        ) + (chunk.end - chunk.start) as usize;
                        status.report(done as u64, size).await;
                    }
                    Err(_) => {
                        // This stream is broken; put the chunk back for
                        // another worker and stop using this connection.
                        queue.lock().unwrap().push_back(chunk);
                        return;
                    }
                }
            }
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }

    if remaining.load(Ordering::SeqCst) > 0 {
        return Err(TransferError::Incomplete { seeked: 0 });
    }
    status.force(size, size).await;
    Ok(())
}

async fn send_chunk(
    conn: &Connection,
    path: &Path,
    chunk: ChunkPlan,
    control: &TransferControl,
) -> Result<(), TransferError> {
    let mut guard = conn.lock().await;
    write_frame(&mut *guard, &ChunkHeader { ..chunk }).await?;

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(chunk.start)).await?;

    let mut remaining = chunk.end - chunk.start;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    while remaining > 0 {
        if control.is_aborting() {
            return Err(TransferError::Cancelled);
        }
        let to_read = FILE_CHUNK_SIZE.min(remaining as usize);
        file.read_exact(&mut buf[..to_read]).await?;
        guard.write_all(&buf[..to_read]).await?;
        remaining -= to_read as u64;
    }
    guard.flush().await?;

    let ack = guard.read_u8().await?;
    if ack != 0x01 {
        return Err(TransferError::Incomplete { seeked: chunk.start });
    }
    Ok(())
}

/// Receiver-side negotiation for one incoming big-file stream.
pub async fn stream_negotiate_receiver(conn: &Connection) -> Result<BigFileMeta, TransferError> {
    let mut guard = conn.lock().await;
    let marker = guard.read_u8().await?;
    if marker != 0x01 {
        return Err(TransferError::Rejected);
    }
    let meta: BigFileMeta = read_frame(&mut *guard).await?;
    guard.write_u8(0x01).await?;
    Ok(meta)
}

/// Reads one chunk off `conn` into a `<name>.<chunk_id>.part` part file.
/// Returns `Ok(None)` once the peer closes the stream (no more chunks for
/// this connection).
pub async fn receive_chunk(
    conn: &Connection,
    download_dir: &Path,
    name: &str,
    control: &TransferControl,
) -> Result<Option<u64>, TransferError> {
    let mut guard = conn.lock().await;
    let header: ChunkHeader = match read_frame(&mut *guard).await {
        Ok(header) => header,
        Err(_) => return Ok(None),
    };

    tokio::fs::create_dir_all(download_dir).await?;
    let part_path = part_path_for(download_dir, name, header.chunk_id);
    let mut file = tokio::fs::File::create(&part_path).await?;

    let mut remaining = header.end - header.start;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    while remaining > 0 {
        if control.is_aborting() {
            return Err(TransferError::Cancelled);
        }
        if control.state() == TransferState::Paused {
            return Err(TransferError::Incomplete { seeked: header.start });
        }
        let to_read = FILE_CHUNK_SIZE.min(remaining as usize);
        guard.read_exact(&mut buf[..to_read]).await?;
        file.write_all(&buf[..to_read]).await?;
        remaining -= to_read as u64;
    }
    file.flush().await?;
    guard.write_u8(0x01).await?;
    Ok(Some(header.chunk_id))
}

fn part_path_for(download_dir: &Path, name: &str, chunk_id: u64) -> PathBuf {
    download_dir.join(format!("{name}.{chunk_id}.{}", crate::config::FILE_ERROR_EXT))
}

/// Concatenates chunk parts into the final file, in order, and removes them.
/// Uses a portable `tokio::io::copy` rather than a platform-specific
/// `sendfile`/mmap path.
pub async fn merge_parts(
    download_dir: &Path,
    name: &str,
    chunk_ids: &[u64],
    dest_dir: &Path,
) -> Result<PathBuf, TransferError> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let final_path = unique_file_destination(dest_dir, name).await;
    let mut dest = tokio::fs::File::create(&final_path).await?;

    let mut ordered = chunk_ids.to_vec();
    ordered.sort_unstable();
    for chunk_id in &ordered {
        let part_path = part_path_for(download_dir, name, *chunk_id);
        let mut part = tokio::fs::File::open(&part_path).await?;
        tokio::io::copy(&mut part, &mut dest).await?;
    }
    dest.flush().await?;

    delete_parts(download_dir, name, &ordered).await;
    Ok(final_path)
}

pub async fn delete_parts(download_dir: &Path, name: &str, chunk_ids: &[u64]) {
    for chunk_id in chunk_ids {
        let part_path = part_path_for(download_dir, name, *chunk_id);
        let _ = tokio::fs::remove_file(&part_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::ui_bridge::UiBridge;
    use std::time::Duration;

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

    #[test]
    fn chunk_plan_covers_the_whole_file() {
        let size = BIG_CHUNK_SIZE * 2 + 100;
        let plan = chunk_plan(size);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan.last().unwrap().end, size);
        for w in plan.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
    }

    #[tokio::test]
    async fn a_big_file_streams_over_two_connections_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("movie.bin");
        let size = (BIG_CHUNK_SIZE as usize) + 4096;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&src_path, &data).await.unwrap();

        let (s1, r1) = paired_connections().await;
        let (s2, r2) = paired_connections().await;

        let dst_dir = dir.path().join("downloads").join("work");
        let dst_dir_clone = dst_dir.clone();
        let receiver = tokio::spawn(async move {
            let control = TransferControl::new();
            let meta1 = stream_negotiate_receiver(&r1).await.unwrap();
            let mut ids = Vec::new();
            loop {
                match receive_chunk(&r1, &dst_dir_clone, &meta1.name, &control).await.unwrap() {
                    Some(id) => ids.push(id),
                    None => break,
                }
            }
            loop {
                match receive_chunk(&r2, &dst_dir_clone, &meta1.name, &control).await.unwrap() {
                    Some(id) => ids.push(id),
                    None => break,
                }
            }
            (meta1, ids)
        });

        let control = TransferControl::new();
        let (ui, _rx) = UiBridge::new(16);
        let status = Arc::new(StatusReporter::new(ui, PeerId::from_seed(1), 1, Duration::from_millis(10)));
        send_big_file(vec![s1, s2], &src_path, &control, status).await.unwrap();

        let (meta, ids) = receiver.await.unwrap();
        let final_dir = dir.path().join("downloads");
        let final_path = merge_parts(&dst_dir, &meta.name, &ids, &final_dir).await.unwrap();
        let merged = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(merged, data);
    }
}
