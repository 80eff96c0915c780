//! Entry point: parses a handful of CLI overrides, builds the shared
//! `AppContext`, and wires every component onto the state manager's FIFO
//! (spec.md §4.14) before blocking on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use clap::Parser;
use peerconnect::config::Config;
use peerconnect::dht::{self, DhtHandle};
use peerconnect::discovery::Discovery;
use peerconnect::envelope::{Header, RootCode};
use peerconnect::gossip::Gossip;
use peerconnect::messaging::{self, MsgSender};
use peerconnect::net::acceptor::Acceptor;
use peerconnect::net::connectivity::ConnectivityChecker;
use peerconnect::net::connector::Connector;
use peerconnect::net::requests::RequestsEndpoint;
use peerconnect::net::watcher::BandwidthWatcher;
use peerconnect::peer::{PeerId, PeerRegistry};
use peerconnect::state::StateManager;
use peerconnect::transfer::{self, dir, file, StatusReporter, TransferControl};
use peerconnect::ui_bridge::{UiBridge, UiCommand, UiEvent};

/// Overrides layered on top of `Config::load_or_default()` — everything else
/// lives in the TOML config file (spec.md §6 external interfaces).
#[derive(Parser)]
#[command(name = "peerconnect")]
struct Cli {
    /// Display name to announce to the network; falls back to the saved
    /// config value, then "anonymous".
    #[arg(short, long)]
    name: Option<String>,

    /// Directory incoming files and directories land in.
    #[arg(long)]
    download_dir: Option<std::path::PathBuf>,
}

/// Everything wired once in `main` and handed to the components that need
/// it — a plain value, not a process-wide singleton (spec.md §9 Open
/// Questions: `App`-as-metaclass-singleton becomes a constructed value).
struct AppContext {
    config: Config,
    our_id: PeerId,
    registry: Arc<PeerRegistry>,
    requests: Arc<RequestsEndpoint>,
    acceptor: Arc<Acceptor>,
    connector: Arc<Connector>,
    watcher: Arc<BandwidthWatcher>,
    gossip: Arc<Gossip>,
    discovery: Arc<Discovery>,
    connectivity: Arc<ConnectivityChecker>,
    dht: DhtHandle,
    ui: Arc<UiBridge>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default();
    if let Some(name) = cli.name {
        config.display_name = name;
    }
    if let Some(dir) = cli.download_dir {
        config.download_dir = dir;
    }
    if let Err(err) = config.save() {
        tracing::warn!(%err, "failed to persist config");
    }

    let our_id = PeerId::from_seed(config.numeric_seed);
    tracing::info!(id = %our_id, name = %config.display_name, "starting peerconnect");

    let registry = Arc::new(PeerRegistry::new());
    let watcher = BandwidthWatcher::new(config.max_total_connections, config.max_idle_time_for_conn);
    let requests = RequestsEndpoint::bind(&config).await?;
    let acceptor = Arc::new(Acceptor::bind(&config, watcher.clone()).await?);
    let connector = Connector::new(config.max_connections_between_peers, config.server_timeout, watcher.clone());
    let gossip = Gossip::new(requests.clone(), registry.clone(), &config);
    let discovery = Arc::new(Discovery::new(requests.clone(), registry.clone(), our_id, &config));
    let connectivity = ConnectivityChecker::new(requests.clone(), registry.clone(), &config);

    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let dht = dht::spawn(&config, keypair)?;

    let (ui, ui_events, ui_commands) = UiBridge::new_with_commands(256);

    let ctx = AppContext {
        config,
        our_id,
        registry,
        requests,
        acceptor,
        connector,
        watcher,
        gossip,
        discovery,
        connectivity,
        dht,
        ui,
    };

    let mut manager = StateManager::new();
    register_boot_steps(&mut manager, ctx, ui_events, ui_commands);
    manager.run().await?;
    manager.run_until_shutdown().await
}

/// Assembles the state manager's FIFO (spec.md §4.14): handler registration
/// runs blocking (it must finish before anything starts accepting traffic),
/// every long-lived loop is queued non-blocking so it's tied to the exit
/// stack automatically by `StateManager::run`.
fn register_boot_steps(
    manager: &mut StateManager,
    ctx: AppContext,
    mut ui_events: tokio::sync::mpsc::Receiver<UiEvent>,
    mut ui_commands: tokio::sync::mpsc::Receiver<UiCommand>,
) {
    let local_req_addr = ctx.requests.local_addr().expect("requests endpoint is bound");
    let connection_port = ctx.acceptor.local_addr().expect("acceptor is bound").port();

    let discovery_handler = ctx.discovery.handle_event(local_req_addr, connection_port);
    ctx.requests
        .register_root_handler(RootCode::Discovery, Box::new(discovery_handler));

    let gossip_for_handler = ctx.gossip.clone();
    ctx.requests.register_root_handler(
        RootCode::Gossip,
        Box::new(move |event| gossip_for_handler.handle_event(event)),
    );

    let our_peer = Arc::new(peerconnect::peer::Peer {
        id: ctx.our_id,
        name: ctx.config.display_name.clone(),
        addr: local_req_addr.ip(),
        request_port: local_req_addr.port(),
        connection_port,
        status: peerconnect::peer::PeerStatus::Online,
    });

    let search = peerconnect::search::SearchEngine::new(
        our_peer,
        ctx.registry.clone(),
        ctx.requests.clone(),
        ctx.gossip.clone(),
        Some(ctx.dht.clone()),
    );
    search.register_search_peers_handler();
    ctx.gossip.subscribe(search.gossip_handler());
    ctx.connectivity.register_removal_ping_handler();

    messaging::register_message_handler(&ctx.acceptor, ctx.ui.clone(), ctx.config.msg_recv_timeout);
    transfer::register_inbound_handlers(
        &ctx.acceptor,
        ctx.ui.clone(),
        ctx.config.download_dir.clone(),
        ctx.config.transfer_status_update_freq,
    );

    let multicast_addr = SocketAddr::new(std::net::IpAddr::V4(ctx.config.multicast_v4), ctx.config.request_port);
    let discovery_for_bootstrap = ctx.discovery.clone();
    manager.push_blocking("discovery bootstrap", move || async move {
        discovery_for_bootstrap.bootstrap(multicast_addr).await;
        Ok(())
    });

    let requests_for_loop = ctx.requests.clone();
    manager.push_background("requests endpoint loop", move || async move {
        requests_for_loop.run().await;
        Ok(())
    });

    let acceptor_for_loop = ctx.acceptor.clone();
    let our_id = ctx.our_id;
    manager.push_background("acceptor loop", move || async move {
        acceptor_for_loop.run(our_id).await;
        Ok(())
    });

    let watcher_for_loop = ctx.watcher.clone();
    manager.push_background("bandwidth watcher maintenance", move || async move {
        watcher_for_loop.maintenance_loop().await;
        Ok(())
    });

    let connectivity_for_loop = ctx.connectivity.clone();
    let registry_for_loop = ctx.registry.clone();
    let check_window = ctx.config.ping_time_check_window;
    manager.push_background("connectivity sweep", move || async move {
        let mut interval = tokio::time::interval(check_window);
        loop {
            interval.tick().await;
            for peer in registry_for_loop.online_peers() {
                connectivity_for_loop.check(&peer).await;
            }
        }
    });

    manager.push_background("ui event drain", move || async move {
        while let Some(event) = ui_events.recv().await {
            tracing::debug!(?event, "ui event");
        }
        Ok(())
    });

    let registry_for_cmds = ctx.registry.clone();
    let connector_for_cmds = ctx.connector.clone();
    let ui_for_cmds = ctx.ui.clone();
    let search_for_cmds = search.clone();
    let our_id_for_cmds = ctx.our_id;
    let status_freq = ctx.config.transfer_status_update_freq;
    manager.push_background("ui command dispatch", move || async move {
        let senders: Mutex<HashMap<PeerId, Arc<MsgSender>>> = Mutex::new(HashMap::new());
        while let Some(command) = ui_commands.recv().await {
            dispatch_ui_command(
                command,
                &registry_for_cmds,
                &connector_for_cmds,
                &ui_for_cmds,
                &search_for_cmds,
                our_id_for_cmds,
                status_freq,
                &senders,
            )
            .await;
        }
        Ok(())
    });
}

/// One frontend command (spec.md §6) acted on. Long-running transfers are
/// spawned off this loop so one slow peer never blocks another command.
#[allow(clippy::too_many_arguments)]
async fn dispatch_ui_command(
    command: UiCommand,
    registry: &Arc<PeerRegistry>,
    connector: &Arc<Connector>,
    ui: &Arc<UiBridge>,
    search: &Arc<peerconnect::search::SearchEngine>,
    our_id: PeerId,
    status_freq: std::time::Duration,
    senders: &Mutex<HashMap<PeerId, Arc<MsgSender>>>,
) {
    match command {
        UiCommand::SendText { peer, text } => {
            let Some(peer_rec) = registry.get(&peer) else {
                ui.emit(UiEvent::FailedToReach { peer, reason: "unknown peer".into() }).await;
                return;
            };
            let sender = senders
                .lock()
                .unwrap()
                .entry(peer)
                .or_insert_with(|| MsgSender::spawn(peer_rec, our_id, registry.clone(), connector.clone(), ui.clone()))
                .clone();
            if let Err(err) = sender.send_text(text).await {
                ui.emit(UiEvent::FailedToReach { peer, reason: err.to_string() }).await;
            }
        }
        UiCommand::SendFile { peer, path } => {
            let Some(peer_rec) = registry.get(&peer) else {
                ui.emit(UiEvent::FailedToReach { peer, reason: "unknown peer".into() }).await;
                return;
            };
            let connector = connector.clone();
            let ui = ui.clone();
            tokio::spawn(async move {
                match connector.connect(&peer_rec, our_id, Header::CmdFileConn, false).await {
                    Ok(conn) => {
                        let control = TransferControl::new();
                        let transfer_id = transfer::next_transfer_id();
                        let status = StatusReporter::new(ui.clone(), peer, transfer_id, status_freq);
                        if let Err(err) = file::send_file(&conn, &path, 0, &control, &status).await {
                            ui.emit(UiEvent::FailedToReach { peer, reason: err.to_string() }).await;
                        }
                    }
                    Err(err) => ui.emit(UiEvent::FailedToReach { peer, reason: err.to_string() }).await,
                }
            });
        }
        UiCommand::SendDir { peer, path } => {
            let Some(peer_rec) = registry.get(&peer) else {
                ui.emit(UiEvent::FailedToReach { peer, reason: "unknown peer".into() }).await;
                return;
            };
            let connector = connector.clone();
            let ui = ui.clone();
            tokio::spawn(async move {
                match connector.connect(&peer_rec, our_id, Header::CmdRecvDir, false).await {
                    Ok(conn) => {
                        let control = TransferControl::new();
                        let transfer_id = transfer::next_transfer_id();
                        let status = StatusReporter::new(ui.clone(), peer, transfer_id, status_freq);
                        if let Err(err) = dir::send_dir(&conn, &path, &control, &status).await {
                            ui.emit(UiEvent::FailedToReach { peer, reason: err.to_string() }).await;
                        }
                    }
                    Err(err) => ui.emit(UiEvent::FailedToReach { peer, reason: err.to_string() }).await,
                }
            });
        }
        UiCommand::ConnectUser { peer } => match registry.get(&peer) {
            Some(peer_rec) => ui.emit(UiEvent::PeerConnected { peer: (*peer_rec).clone() }).await,
            None => ui.emit(UiEvent::FailedToReach { peer, reason: "unknown peer".into() }).await,
        },
        UiCommand::SyncUsers => {
            let peers = registry.all_peers().iter().map(|p| (**p).clone()).collect();
            ui.emit(UiEvent::SyncUsers { peers }).await;
        }
        UiCommand::SendProfiles | UiCommand::SendPeerList => {
            let peers = registry.all_peers().iter().map(|p| (**p).clone()).collect();
            ui.emit(UiEvent::PeerList { peers }).await;
        }
        UiCommand::SetProfile { name } => {
            // Display name is fixed for the lifetime of a running node; the
            // frontend can still ask, but it takes effect on next restart via
            // the persisted config, not live.
            tracing::info!(name = %name, "profile update requested; not applied to the running node");
        }
        UiCommand::SearchForName { query_id, substring } | UiCommand::GossipSearch { query_id, substring } => {
            let mut results = search.search_for_nodes(substring);
            let ui = ui.clone();
            tokio::spawn(async move {
                while let Some(peer) = results.recv().await {
                    ui.emit(UiEvent::SearchResponse { query_id, peer: (*peer).clone() }).await;
                }
            });
        }
    }
}
