use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use pax_proto::protocol::{Broadcast, Message, PROTOCOL_VERSION};
use pax_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind control socket {}: {}", addr, e);
                return;
            }
        };

        info!("Control socket listening at {}", addr);
        serve(listener, state_manager, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let sm = state_manager.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();
                tokio::spawn(async move {
                    let (read_half, write_half) = stream.into_split();
                    handle_client(read_half, write_half, sm, id, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client<R, W>(
    mut read_half: R,
    mut write_half: W,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    match encode_hello(&state_manager).await {
        Ok(encoded) => {
            if write_half.write_all(&encoded).await.is_err() {
                return;
            }
        }
        Err(e) => warn!("Client {}: could not encode hello: {}", client_id, e),
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        debug!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::decode(&read_buf) {
                                Ok(Some((Message::Command(cmd), consumed))) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent command: {:?}", client_id, cmd);
                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok(Some((_, consumed))) => {
                                    read_buf.drain(..consumed);
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Client {} sent a bad frame: {}", client_id, e);
                                    return;
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
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(BroadcastMessage::Toast(message)) => {
                        Message::Broadcast(Broadcast::Toast { message }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match encoded {
                    Ok(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Client {}: encode failed: {}", client_id, e),
                }
            }
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use pax_proto::protocol::Command;

    async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Message {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    struct Client {
        remote: tokio::io::DuplexStream,
        events: mpsc::Receiver<DaemonEvent>,
        bcast: broadcast::Sender<BroadcastMessage>,
        task: tokio::task::JoinHandle<()>,
    }

    fn connect(dir: &std::path::Path) -> Client {
        let sm = Arc::new(StateManager::new(dir.join("state.json"), 0.5));
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (event_tx, events) = mpsc::channel(8);
        let (bcast, bcast_rx) = broadcast::channel(8);
        let task = tokio::spawn(async move {
            let (r, w) = tokio::io::split(local);
            handle_client(r, w, sm, 1, event_tx, bcast_rx).await;
        });
        Client {
            remote,
            events,
            bcast,
            task,
        }
    }

    #[tokio::test]
    async fn test_hello_then_commands_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = connect(dir.path());

        match read_frame(&mut c.remote).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version, ..
            }) => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("expected hello, got {:?}", other),
        }

        // Two commands in one write, the second split across writes.
        let mut bytes = Message::Command(Command::Next).encode().unwrap();
        let second = Message::Command(Command::Volume { value: 0.25 }).encode().unwrap();
        bytes.extend_from_slice(&second[..3]);
        c.remote.write_all(&bytes).await.unwrap();
        c.remote.write_all(&second[3..]).await.unwrap();

        match c.events.recv().await.unwrap() {
            DaemonEvent::ClientCommand(cmd) => assert_eq!(cmd, Command::Next),
            other => panic!("unexpected {:?}", other),
        }
        match c.events.recv().await.unwrap() {
            DaemonEvent::ClientCommand(cmd) => assert_eq!(cmd, Command::Volume { value: 0.25 }),
            other => panic!("unexpected {:?}", other),
        }

        c.bcast
            .send(BroadcastMessage::Toast("Alarm canceled".into()))
            .unwrap();
        match read_frame(&mut c.remote).await {
            Message::Broadcast(Broadcast::Toast { message }) => assert_eq!(message, "Alarm canceled"),
            other => panic!("expected toast, got {:?}", other),
        }

        c.bcast.send(BroadcastMessage::StateUpdated).unwrap();
        assert!(matches!(
            read_frame(&mut c.remote).await,
            Message::Broadcast(Broadcast::State { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_frame_closes_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = connect(dir.path());
        read_frame(&mut c.remote).await;

        let body = b"{\"cmd\":\"NoSuchCommand\"}";
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        c.remote.write_all(&bytes).await.unwrap();

        c.task.await.unwrap();
        assert!(c.events.try_recv().is_err());
    }
}
