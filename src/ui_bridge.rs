//! Frontend boundary (spec.md §6): the one collaborator interface this core
//! exposes. Two logical channels, `DATA` and `SIGNALS` in the original, are
//! modeled here as a single outbound event channel and a single inbound
//! command channel — both plain `mpsc`, since the frontend is out of process
//! boundary only in the sense that it's a different crate, not a different
//! machine.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::peer::{Peer, PeerId};

/// Outbound notifications the core raises for the frontend to render
/// (spec.md §6: `msg_arrived, peer_connected, failed_to_reach, update_peer,
/// transfer_update, transfer_incomplete, search_response, sync_users,
/// peer_list`).
#[derive(Debug, Clone)]
pub enum UiEvent {
    MsgArrived { from: PeerId, text: String },
    PeerConnected { peer: Peer },
    FailedToReach { peer: PeerId, reason: String },
    UpdatePeer { peer: Peer },
    TransferUpdate {
        transfer_id: u64,
        bytes_done: u64,
        bytes_total: u64,
    },
    TransferIncomplete { transfer_id: u64, seeked: u64 },
    SearchResponse { query_id: u64, peer: Peer },
    SyncUsers { peers: Vec<Peer> },
    PeerList { peers: Vec<Peer> },
}

/// Inbound requests from the frontend (spec.md §6: `SEND_DIR, SEND_FILE,
/// SEND_TEXT, CONNECT_USER, SYNC_USERS, SEND_PROFILES, SET_PROFILE,
/// SEARCH_FOR_NAME, SEND_PEER_LIST, GOSSIP_SEARCH`).
#[derive(Debug, Clone)]
pub enum UiCommand {
    SendDir { peer: PeerId, path: PathBuf },
    SendFile { peer: PeerId, path: PathBuf },
    SendText { peer: PeerId, text: String },
    ConnectUser { peer: PeerId },
    SyncUsers,
    SendProfiles,
    SetProfile { name: String },
    SearchForName { query_id: u64, substring: String },
    SendPeerList,
    GossipSearch { query_id: u64, substring: String },
}

/// Anything in the core that wants to tell the frontend something holds an
/// `Arc<UiBridge>` and calls `emit`; the frontend holds the same `Arc` and
/// calls `submit_command` to drive the core.
pub struct UiBridge {
    outbound: mpsc::Sender<UiEvent>,
    inbound: mpsc::Sender<UiCommand>,
}

impl UiBridge {
    /// Create the bridge and its outbound receiver, handed to whatever
    /// adapts it to the actual frontend transport (stdout, a websocket, a
    /// TUI's own channel — all out of scope here). The inbound command
    /// channel is created but its receiver discarded; call
    /// [`Self::new_with_commands`] to actually drive commands.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<UiEvent>) {
        let (bridge, events, _commands) = Self::new_with_commands(capacity);
        (bridge, events)
    }

    /// Like [`Self::new`], but also returns the command receiver so a boot
    /// step can actually dispatch `UiCommand`s (spec.md §6).
    pub fn new_with_commands(capacity: usize) -> (Arc<Self>, mpsc::Receiver<UiEvent>, mpsc::Receiver<UiCommand>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                outbound: out_tx,
                inbound: in_tx,
            }),
            out_rx,
            in_rx,
        )
    }

    pub async fn emit(&self, event: UiEvent) {
        if self.outbound.send(event).await.is_err() {
            tracing::debug!("ui event dropped, frontend channel closed");
        }
    }

    /// Non-blocking emit for call sites that can't await (e.g. inside a
    /// `Drop` impl or a tight loop); drops the event under backpressure
    /// rather than block.
    pub fn try_emit(&self, event: UiEvent) {
        if self.outbound.try_send(event).is_err() {
            tracing::debug!("ui event dropped, channel full or closed");
        }
    }

    /// Submit a command from the frontend for the core to act on.
    pub async fn submit_command(&self, command: UiCommand) -> Result<(), UiCommand> {
        self.inbound.send(command).await.map_err(|e| e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_are_received_in_order() {
        let (bridge, mut rx) = UiBridge::new(8);
        bridge
            .emit(UiEvent::FailedToReach {
                peer: PeerId::from_seed(1),
                reason: "timeout".into(),
            })
            .await;
        bridge
            .emit(UiEvent::SyncUsers { peers: vec![] })
            .await;

        assert!(matches!(rx.recv().await, Some(UiEvent::FailedToReach { .. })));
        assert!(matches!(rx.recv().await, Some(UiEvent::SyncUsers { .. })));
    }

    #[test]
    fn try_emit_does_not_panic_once_receiver_is_dropped() {
        let (bridge, rx) = UiBridge::new(1);
        drop(rx);
        bridge.try_emit(UiEvent::PeerList { peers: vec![] });
    }

    #[tokio::test]
    async fn submitted_commands_are_received_in_order() {
        let (bridge, _events, mut commands) = UiBridge::new_with_commands(8);
        bridge.submit_command(UiCommand::SyncUsers).await.unwrap();
        bridge
            .submit_command(UiCommand::SendText {
                peer: PeerId::from_seed(1),
                text: "hi".into(),
            })
            .await
            .unwrap();

        assert!(matches!(commands.recv().await, Some(UiCommand::SyncUsers)));
        assert!(matches!(commands.recv().await, Some(UiCommand::SendText { .. })));
    }
}
