use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use hitl_protocol::{HITL_ERROR_TOPIC, HITL_RESPONSE_TOPIC, WsEvent};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMsg};
use tracing::{debug, info, warn};

use crate::broker::{DeliveryStatus, ReviewBroker};
use crate::transport::{Transport, TransportError, TransportType};

/// Commands sent to the manager task
#[derive(Debug)]
enum Command {
    Register {
        peer: String,
        sender: UnboundedSender<WsMsg>,
    },
    Unregister {
        peer: String,
    },
    Broadcast {
        frame: String,
    },
}

/// Plain WebSocket server reviewers connect to.
///
/// Review requests go out to every peer as `{"event": "hitl_request", ...}`
/// frames; `hitl_response` frames coming back are handed to the broker.
pub struct WsServer {
    addr: SocketAddr,
    cmd_tx: UnboundedSender<Command>,
    peers: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    manager_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
}

impl WsServer {
    pub async fn start(addr: &str, broker: Arc<ReviewBroker>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind HITL WebSocket on {}", addr))?;
        let local = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let peers = Arc::new(AtomicUsize::new(0));

        let manager_task = tokio::spawn(WsServer::manager_loop(
            cmd_rx,
            peers.clone(),
            shutdown_tx.subscribe(),
        ));

        let accept_task = {
            let cmd_tx = cmd_tx.clone();
            let shutdown_tx = shutdown_tx.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => WsServer::spawn_connection(
                                cmd_tx.clone(),
                                broker.clone(),
                                stream,
                                peer,
                                shutdown_tx.subscribe(),
                            ),
                            Err(err) => warn!("ws: accept failed: {}", err),
                        }
                    }
                }
            })
        };

        info!("HITL WebSocket listening on {}", local);
        Ok(Self {
            addr: local,
            cmd_tx,
            peers,
            shutdown_tx,
            manager_task,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    /// The handle to register with [`ReviewBroker::set_transport`].
    pub fn broadcaster(&self) -> Transport {
        Arc::new(WsBroadcaster {
            cmd_tx: self.cmd_tx.clone(),
            peers: self.peers.clone(),
        })
    }

    pub async fn shutdown(self) {
        info!("HITL WebSocket on {} shutting down", self.addr);
        let _ = self.shutdown_tx.send(());
        let _ = self.accept_task.await;
        let _ = self.manager_task.await;
    }

    /// Owns the peer map; every other task talks to it through `Command`s.
    async fn manager_loop(
        mut cmd_rx: UnboundedReceiver<Command>,
        peers: Arc<AtomicUsize>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let map: DashMap<String, UnboundedSender<WsMsg>> = DashMap::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Register { peer, sender } => {
                            map.insert(peer, sender);
                        }
                        Command::Unregister { peer } => {
                            map.remove(&peer);
                        }
                        Command::Broadcast { frame } => {
                            debug!("ws: broadcasting to {} peers", map.len());
                            map.retain(|peer, tx| {
                                let alive = tx.send(WsMsg::Text(frame.clone().into())).is_ok();
                                if !alive {
                                    debug!("ws: dropping dead peer {}", peer);
                                }
                                alive
                            });
                        }
                    }
                    peers.store(map.len(), Ordering::SeqCst);
                }
            }
        }
        peers.store(0, Ordering::SeqCst);
    }

    fn spawn_connection(
        cmd_tx: UnboundedSender<Command>,
        broker: Arc<ReviewBroker>,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let peer = peer.to_string();
            let ws_stream = match accept_async(stream).await {
                Ok(ws_stream) => ws_stream,
                Err(err) => {
                    warn!("ws: handshake with {} failed: {}", peer, err);
                    return;
                }
            };
            let (mut write, mut read) = ws_stream.split();
            let (tx_out, mut rx_out) = unbounded_channel();
            let _ = cmd_tx.send(Command::Register {
                peer: peer.clone(),
                sender: tx_out.clone(),
            });
            info!("ws: reviewer {} connected", peer);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        let _ = write.send(WsMsg::Close(None)).await;
                        break;
                    }
                    msg = read.next() => match msg {
                        Some(Ok(WsMsg::Text(txt))) => {
                            if let Some(reply) = handle_inbound(&broker, txt.as_str()) {
                                let _ = tx_out.send(WsMsg::Text(reply.into()));
                            }
                        }
                        Some(Ok(WsMsg::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!("ws: read from {} failed: {}", peer, err);
                            break;
                        }
                    },
                    frame = rx_out.recv() => match frame {
                        Some(frame) => {
                            if write.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = cmd_tx.send(Command::Unregister { peer: peer.clone() });
            info!("ws: reviewer {} disconnected", peer);
        });
    }
}

/// Route one inbound text frame. Returns the error frame to send back to the
/// peer, if any.
fn handle_inbound(broker: &ReviewBroker, text: &str) -> Option<String> {
    let event = match serde_json::from_str::<WsEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            warn!("ws: unreadable frame: {}", err);
            return error_frame(&format!("Failed to process HITL response: {}", err));
        }
    };
    if event.event != HITL_RESPONSE_TOPIC {
        debug!("ws: ignoring event '{}'", event.event);
        return None;
    }
    match broker.deliver_raw(event.data) {
        DeliveryStatus::Malformed => {
            error_frame("Failed to process HITL response: malformed payload")
        }
        _ => None,
    }
}

fn error_frame(message: &str) -> Option<String> {
    serde_json::to_string(&WsEvent::new(HITL_ERROR_TOPIC, json!({ "message": message }))).ok()
}

/// Transport handle backed by a running [`WsServer`].
#[derive(Debug, Clone)]
pub struct WsBroadcaster {
    cmd_tx: UnboundedSender<Command>,
    peers: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportType for WsBroadcaster {
    async fn broadcast(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&WsEvent::new(topic, payload))?;
        debug!(
            topic,
            peers = self.peers.load(Ordering::SeqCst),
            "ws: queueing broadcast"
        );
        self.cmd_tx
            .send(Command::Broadcast { frame })
            .map_err(|_| TransportError::Closed(self.name()))
    }

    fn name(&self) -> String {
        "ws".into()
    }
}
