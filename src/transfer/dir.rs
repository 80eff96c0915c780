//! Directory transfer (C11): root name + accept/reject confirmation, then a
//! depth-first repeat of the single-file protocol per entry, terminated by a
//! sentinel frame (spec.md §4.11).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::net::connection::Connection;
use crate::transfer::file::{self, FileOutcome};
use crate::transfer::{read_frame, write_frame, StatusReporter, TransferControl};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirHeader {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum DirConfirm {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum DirEntryFrame {
    File { rel_path: String },
    EndOfDir,
}

/// Sends the directory rooted at `root`, depth-first, over `conn`.
pub async fn send_dir(
    conn: &Connection,
    root: &Path,
    control: &TransferControl,
    status: &StatusReporter,
) -> Result<(), TransferError> {
    let name = file::file_name_of(root);
    {
        let mut guard = conn.lock().await;
        write_frame(&mut *guard, &DirHeader { name }).await?;
        let confirm: DirConfirm = read_frame(&mut *guard).await?;
        if matches!(confirm, DirConfirm::Reject) {
            return Err(TransferError::Rejected);
        }
    }

    let root_owned = root.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || list_files_relative(&root_owned))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;

    for rel_path in entries {
        if control.is_aborting() {
            return Err(TransferError::Cancelled);
        }
        {
            let mut guard = conn.lock().await;
            write_frame(
                &mut *guard,
                &DirEntryFrame::File {
                    rel_path: rel_path.to_string_lossy().into_owned(),
                },
            )
            .await?;
        }
        let full_path = root.join(&rel_path);
        match file::send_file(conn, &full_path, 0, control, status).await? {
            FileOutcome::Completed => {}
            // A pause mid-directory stops the whole walk; resuming a
            // directory transfer restarts from the paused file, handled by
            // the caller re-invoking `send_dir` with the saved progress.
            FileOutcome::Paused { .. } => return Ok(()),
        }
    }

    let mut guard = conn.lock().await;
    write_frame(&mut *guard, &DirEntryFrame::EndOfDir).await?;
    Ok(())
}

/// Receives a directory into `download_dir`, reconstructing its tree under a
/// collision-renamed root (spec.md §4.11: "under
/// `PATH_DOWNLOAD/<renamed-if-collision>/`"). Returns the root it wrote to.
pub async fn receive_dir(
    conn: &Connection,
    download_dir: &Path,
    control: &TransferControl,
    status: &StatusReporter,
) -> Result<PathBuf, TransferError> {
    let header: DirHeader = {
        let mut guard = conn.lock().await;
        let header: DirHeader = read_frame(&mut *guard).await?;
        write_frame(&mut *guard, &DirConfirm::Accept).await?;
        header
    };

    tokio::fs::create_dir_all(download_dir).await?;
    let root_dest = unique_dir_destination(download_dir, &header.name).await;
    tokio::fs::create_dir_all(&root_dest).await?;

    loop {
        let frame: DirEntryFrame = {
            let mut guard = conn.lock().await;
            read_frame(&mut *guard).await?
        };
        match frame {
            DirEntryFrame::EndOfDir => return Ok(root_dest),
            DirEntryFrame::File { rel_path } => {
                let rel = PathBuf::from(rel_path);
                let parent = rel
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| root_dest.join(p))
                    .unwrap_or_else(|| root_dest.clone());
                tokio::fs::create_dir_all(&parent).await?;
                match file::receive_file(conn, &parent, control, status).await? {
                    (_, FileOutcome::Completed) => {}
                    (_, FileOutcome::Paused { .. }) => return Ok(root_dest),
                }
            }
        }
    }
}

/// Collision-avoiding directory name, the directory analogue of
/// [`file::unique_file_destination`].
async fn unique_dir_destination(parent: &Path, name: &str) -> PathBuf {
    let candidate = parent.join(name);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return candidate;
    }
    for n in 1u32.. {
        let candidate = parent.join(format!("{name} ({n})"));
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
    }
    unreachable!("collision loop is unbounded in practice, n fits u32")
}

/// Recursively lists every regular file under `root`, relative to it, in a
/// deterministic (sorted) depth-first order. Synchronous: run via
/// `spawn_blocking` since directory walks are disk I/O (spec.md §5: "a
/// bounded worker pool exists only for blocking disk I/O").
fn list_files_relative(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let dir = root.join(&rel);
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let rel_child = rel.join(entry.file_name());
            if file_type.is_dir() {
                stack.push(rel_child);
            } else if file_type.is_file() {
                out.push(rel_child);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::ui_bridge::UiBridge;
    use std::sync::Arc;
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
    fn list_files_relative_finds_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"2").unwrap();

        let mut files = list_files_relative(dir.path()).unwrap();
        files.sort();
        assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")]);
    }

    #[tokio::test]
    async fn a_small_directory_transfers_end_to_end() {
        let src_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src_dir.path().join("photos")).unwrap();
        tokio::fs::write(src_dir.path().join("readme.txt"), b"top level")
            .await
            .unwrap();
        tokio::fs::write(src_dir.path().join("photos/pic.bin"), b"binary data")
            .await
            .unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst_path = dst_dir.path().to_path_buf();

        let (sender_conn, receiver_conn) = paired_connections().await;
        let src_path = src_dir.path().to_path_buf();

        let receiver = tokio::spawn(async move {
            let control = TransferControl::new();
            let (ui, _rx) = UiBridge::new(16);
            let stat = StatusReporter::new(ui, PeerId::from_seed(9), 1, Duration::from_millis(10));
            receive_dir(&receiver_conn, &dst_path, &control, &stat).await
        });

        let control = TransferControl::new();
        let (ui, _rx) = UiBridge::new(16);
        let stat = StatusReporter::new(ui, PeerId::from_seed(1), 1, Duration::from_millis(10));
        send_dir(&sender_conn, &src_path, &control, &stat).await.unwrap();

        let root = receiver.await.unwrap().unwrap();
        let readme = tokio::fs::read(root.join("readme.txt")).await.unwrap();
        assert_eq!(readme, b"top level");
        let pic = tokio::fs::read(root.join("photos/pic.bin")).await.unwrap();
        assert_eq!(pic, b"binary data");
    }
}
