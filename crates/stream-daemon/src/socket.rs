use crate::core::DaemonEvent;
use crate::entries;
use crate::player::validate_url;
use crate::store::SharedDatabase;
use crate::BroadcastMessage;
use std::sync::Arc;
use stream_proto::protocol::{Broadcast, Command, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
use stream_proto::state::StateManager;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info, warn};

pub struct ClientHandle {
    pub id: usize,
}

/// What a client connection needs from the daemon.
#[derive(Clone)]
pub struct SocketContext {
    pub state_manager: Arc<StateManager>,
    pub store: SharedDatabase,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    ctx: SocketContext,
    clients: Arc<RwLock<Vec<ClientHandle>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;

                    let client_count = {
                        let mut guard = clients.write().await;
                        guard.push(ClientHandle { id });
                        guard.len()
                    };
                    info!("Client {} connected from {} ({} connected)", id, peer, client_count);

                    let ctx = ctx.clone();
                    let clients_ref = clients.clone();

                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        let bcast_rx = ctx.broadcast_tx.subscribe();
                        handle_client(read_half, write_half, &ctx, id, bcast_rx).await;

                        let client_count = {
                            let mut guard = clients_ref.write().await;
                            guard.retain(|c| c.id != id);
                            guard.len()
                        };
                        info!("Client {} disconnected ({} connected)", id, client_count);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

/// Serve one client until it hangs up or the daemon goes away.
pub async fn handle_client<R, W>(
    mut read_half: R,
    mut write_half: W,
    ctx: &SocketContext,
    client_id: usize,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current state snapshot on connect
    if let Ok(encoded) = encode_hello(&ctx.state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let Some(len) = Message::frame_len(&read_buf) else { break };
                            if len > MAX_FRAME_LEN {
                                warn!(
                                    "Client {} announced a {} byte frame (max {}), dropping it",
                                    client_id, len, MAX_FRAME_LEN
                                );
                                return;
                            }
                            if read_buf.len() < 4 + len { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    let Some(reply) = dispatch(ctx, cmd).await else {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    };
                                    if let Ok(encoded) = Message::Broadcast(reply).encode() {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    warn!("Client {} sent an unreadable frame: {}", client_id, e);
                                    read_buf.drain(..4 + len);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::StateUpdated) => None,
                    Ok(BroadcastMessage::Playback(event)) => Some(Broadcast::Playback { event }),
                    Ok(BroadcastMessage::Log(message)) => Some(Broadcast::Log { message }),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        None
                    }
                    Err(_) => break,
                };
                let encoded = match broadcast {
                    Some(b) => Message::Broadcast(b).encode(),
                    None => encode_state(&ctx.state_manager).await,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Answer a command.  Store commands and refused play requests are answered
/// here; everything else goes to the core and is answered with a state
/// snapshot.  `None` when the core is gone.
async fn dispatch(ctx: &SocketContext, cmd: Command) -> Option<Broadcast> {
    if let Some(reply) = entries::apply(&ctx.store, &cmd) {
        return Some(reply);
    }
    if let Command::Play { url } = &cmd {
        if let Err(e) = validate_url(url) {
            let kind = e.kind();
            return Some(Broadcast::Rejected {
                kind,
                message: kind.to_string(),
            });
        }
    }
    ctx.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.ok()?;
    Some(Broadcast::State {
        data: ctx.state_manager.get_state().await,
    })
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
