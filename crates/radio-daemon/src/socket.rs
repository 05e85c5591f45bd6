use crate::core::DaemonEvent;
use crate::state::StateManager;
use crate::BroadcastMessage;
use radio_library::protocol::{Broadcast, Message, PROTOCOL_VERSION};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Largest frame body a client may declare.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn start_server(
    bind_address: String,
    port: u16,
    state: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
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
        serve(listener, state, event_tx, broadcast_tx).await;
    })
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<StateManager>,
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

                let state = state.clone();
                let event_tx = event_tx.clone();
                let broadcast_rx = broadcast_tx.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, state, id, event_tx, broadcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    match encode_hello(&state).await {
        Ok(encoded) => {
            if write_half.write_all(&encoded).await.is_err() {
                return;
            }
        }
        Err(e) => warn!("Client {}: cannot encode hello: {}", client_id, e),
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);
                        // the core answers with a state broadcast once the command is applied
                        while read_buf.len() >= 4 {
                            if frame_len(&read_buf) > MAX_FRAME_LEN {
                                warn!(
                                    "Client {} declared a {} byte frame, closing",
                                    client_id,
                                    frame_len(&read_buf)
                                );
                                let reply = Broadcast::Error {
                                    message: format!("Frame exceeds {} bytes", MAX_FRAME_LEN),
                                };
                                let _ = send(&mut write_half, reply).await;
                                return;
                            }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent command: {:?}", client_id, cmd);
                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(_) if !frame_complete(&read_buf) => break,
                                Err(e) => {
                                    warn!("Client {} sent an unreadable frame: {}", client_id, e);
                                    let len = frame_len(&read_buf);
                                    read_buf.drain(..4 + len);
                                    let reply = Broadcast::Error {
                                        message: format!("Bad command: {}", e),
                                    };
                                    if send(&mut write_half, reply).await.is_err() {
                                        return;
                                    }
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
                let outgoing = match msg {
                    Ok(BroadcastMessage::StateUpdated) => Broadcast::State { data: state.get_state().await },
                    Ok(BroadcastMessage::Reply(reply)) => reply,
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::State { data: state.get_state().await }
                    }
                    Err(_) => break,
                };
                if send(&mut write_half, outgoing).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn frame_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

fn frame_complete(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf.len() >= 4 + frame_len(buf)
}

async fn send<W>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

async fn encode_hello(state: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state.get_state().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: state.rev,
        state,
    })
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use radio_library::protocol::{Command, DaemonState};
    use std::time::Duration;

    async fn read_frame(stream: &mut TcpStream) -> Message {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().0
    }

    async fn connected() -> (
        TcpStream,
        Arc<StateManager>,
        mpsc::Receiver<DaemonEvent>,
        broadcast::Sender<BroadcastMessage>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(StateManager::new());
        state
            .publish(
                DaemonState {
                    filter: "jazz".into(),
                    ..Default::default()
                },
                Vec::new(),
            )
            .await;
        let (event_tx, event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);
        tokio::spawn(serve(listener, state.clone(), event_tx, broadcast_tx.clone()));
        let stream = TcpStream::connect(addr).await.unwrap();
        (stream, state, event_rx, broadcast_tx)
    }

    #[tokio::test]
    async fn hello_then_commands_reach_the_core() {
        let (mut stream, _state, mut events, _tx) = connected().await;

        match read_frame(&mut stream).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 1);
                assert_eq!(state.filter, "jazz");
            }
            other => panic!("expected hello, got {:?}", other),
        }

        // two frames in one write
        let mut bytes = Message::Command(Command::Stop).encode().unwrap();
        bytes.extend(Message::Command(Command::ToggleMute).encode().unwrap());
        stream.write_all(&bytes).await.unwrap();

        for expected in ["Stop", "ToggleMute"] {
            let evt = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match evt {
                DaemonEvent::ClientCommand(cmd) => assert!(format!("{:?}", cmd).starts_with(expected)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn broadcasts_are_forwarded() {
        let (mut stream, _state, _events, tx) = connected().await;
        read_frame(&mut stream).await;

        tx.send(BroadcastMessage::Reply(Broadcast::Notice {
            message: "hi".into(),
        }))
        .unwrap();
        tx.send(BroadcastMessage::StateUpdated).unwrap();

        assert!(matches!(
            read_frame(&mut stream).await,
            Message::Broadcast(Broadcast::Notice { message }) if message == "hi"
        ));
        assert!(matches!(
            read_frame(&mut stream).await,
            Message::Broadcast(Broadcast::State { data }) if data.filter == "jazz"
        ));
    }

    #[tokio::test]
    async fn unreadable_frame_gets_an_error_reply() {
        let (mut stream, _state, _events, _tx) = connected().await;
        read_frame(&mut stream).await;

        let body = br#"{"cmd":"Launch"}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        stream.write_all(&frame).await.unwrap();

        assert!(matches!(
            read_frame(&mut stream).await,
            Message::Broadcast(Broadcast::Error { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_connection() {
        let (mut stream, _state, mut events, _tx) = connected().await;
        read_frame(&mut stream).await;

        stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut stream).await,
            Message::Broadcast(Broadcast::Error { .. })
        ));
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(events.try_recv().is_err());
    }
}
