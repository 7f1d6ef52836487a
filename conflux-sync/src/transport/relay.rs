//! Server-relay backend: one WebSocket to the relay, topics multiplexed
//! over it.
//!
//! A single driver task owns the socket. Callers talk to it through a
//! command channel, so `send` never waits on the network. When the link
//! drops the driver reconnects with capped exponential backoff, replays
//! the offline outbox, and re-subscribes every desired topic; envelopes
//! published in the gap are queued, oldest dropped first.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use async_trait::async_trait;

use conflux_graph::PeerId;

use super::{
    Backoff, LinkHealth, Membership, Outbox, SubscriberTable, Subscription, Transport,
    TransportError,
};
use crate::config::SyncConfig;
use crate::protocol::{Envelope, EventKind, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

enum Command {
    Send(Envelope),
    Subscribe(String),
    Shutdown,
}

/// Transport over a relay server.
pub struct RelayTransport {
    peer: PeerId,
    url: String,
    command_tx: mpsc::UnboundedSender<Command>,
    table: Arc<SubscriberTable>,
    membership_tx: broadcast::Sender<Membership>,
    known_peers: Arc<StdMutex<HashSet<PeerId>>>,
    health_rx: watch::Receiver<LinkHealth>,
    seq: AtomicU64,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayTransport {
    /// Connect to a relay. Fails fast when the first connect is refused;
    /// later drops are handled by the reconnect loop.
    pub async fn connect(
        url: impl Into<String>,
        peer: PeerId,
        config: &SyncConfig,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let table = SubscriberTable::new();
        let (membership_tx, _) = broadcast::channel(64);
        let (health_tx, health_rx) = watch::channel(LinkHealth::Connected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let known_peers = Arc::new(StdMutex::new(HashSet::new()));

        let driver = tokio::spawn(drive(
            DriverContext {
                url: url.clone(),
                peer,
                table: table.clone(),
                membership_tx: membership_tx.clone(),
                known_peers: known_peers.clone(),
                health_tx,
                outbox: Outbox::new(config.outbox_capacity),
                backoff: Backoff::new(config.backoff_base(), config.backoff_cap()),
            },
            command_rx,
            ws,
        ));

        Ok(Self {
            peer,
            url,
            command_tx,
            table,
            membership_tx,
            known_peers,
            health_rx,
            seq: AtomicU64::new(0),
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send(&self, topic: &str, event: EventKind, payload: Vec<u8>) -> Result<(), TransportError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(topic, event, self.peer, seq, payload);
        self.command_tx
            .send(Command::Send(envelope))
            .map_err(|_| TransportError::Closed)
    }

    async fn subscribe(
        &self,
        topic: &str,
        event: EventKind,
    ) -> Result<Subscription, TransportError> {
        let subscription = self.table.register(topic, event);
        self.command_tx
            .send(Command::Subscribe(topic.to_string()))
            .map_err(|_| TransportError::Closed)?;
        Ok(subscription)
    }

    fn membership(&self) -> broadcast::Receiver<Membership> {
        self.membership_tx.subscribe()
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.known_peers.lock().unwrap().iter().copied().collect();
        peers.sort();
        peers
    }

    fn health(&self) -> watch::Receiver<LinkHealth> {
        self.health_rx.clone()
    }

    async fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct DriverContext {
    url: String,
    peer: PeerId,
    table: Arc<SubscriberTable>,
    membership_tx: broadcast::Sender<Membership>,
    known_peers: Arc<StdMutex<HashSet<PeerId>>>,
    health_tx: watch::Sender<LinkHealth>,
    outbox: Outbox,
    backoff: Backoff,
}

/// Connection lifecycle loop: connected phase until the socket drops,
/// then backoff-gated reconnects. Commands arriving while down feed the
/// outbox (sends) or the desired-topic set (subscribes).
async fn drive(mut ctx: DriverContext, mut commands: mpsc::UnboundedReceiver<Command>, ws: WsStream) {
    let mut ws = Some(ws);
    let mut desired: BTreeSet<String> = BTreeSet::new();

    'outer: loop {
        let stream = match ws.take() {
            Some(stream) => stream,
            None => {
                let _ = ctx.health_tx.send(LinkHealth::Reconnecting);
                let delay = ctx.backoff.next_delay();
                log::info!("relay transport: reconnecting in {delay:?}");

                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = commands.recv() => match cmd {
                            Some(Command::Send(envelope)) => {
                                if !ctx.outbox.enqueue(envelope) {
                                    log::warn!(
                                        "relay transport: outbox full, dropped oldest ({} total)",
                                        ctx.outbox.dropped()
                                    );
                                }
                            }
                            Some(Command::Subscribe(topic)) => {
                                desired.insert(topic);
                            }
                            Some(Command::Shutdown) | None => {
                                let _ = ctx.health_tx.send(LinkHealth::Down);
                                return;
                            }
                        }
                    }
                }

                match tokio_tungstenite::connect_async(&ctx.url).await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        log::warn!("relay transport: reconnect failed: {e}");
                        continue 'outer;
                    }
                }
            }
        };

        let (mut sink, mut source) = stream.split();
        if let Err(e) = establish(&mut sink, ctx.peer, &desired, &mut ctx.outbox).await {
            log::warn!("relay transport: handshake failed: {e}");
            continue 'outer;
        }
        ctx.backoff.reset();
        let _ = ctx.health_tx.send(LinkHealth::Connected);
        log::info!(
            "relay transport: connected to {} ({} topics)",
            ctx.url,
            desired.len()
        );

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Send(envelope)) => {
                        let encoded = match Frame::Publish(envelope.clone()).encode() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                log::error!("relay transport: encode failed: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Binary(encoded.into())).await {
                            log::warn!("relay transport: send failed: {e}");
                            ctx.outbox.enqueue(envelope);
                            continue 'outer;
                        }
                    }
                    Some(Command::Subscribe(topic)) => {
                        if desired.insert(topic.clone())
                            && send_frame(&mut sink, &Frame::Subscribe { topic }).await.is_err()
                        {
                            // Still in `desired`; replayed by the next handshake.
                            continue 'outer;
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = ctx.health_tx.send(LinkHealth::Down);
                        log::info!("relay transport: disconnected");
                        return;
                    }
                },

                incoming = source.next() => {
                    if handle_incoming(incoming, &mut sink, &ctx).await.is_err() {
                        continue 'outer;
                    }
                }
            }
        }
    }
}

/// Hello, resubscribe, replay the outbox. Any failure reconnects.
async fn establish(
    sink: &mut WsSink,
    peer: PeerId,
    desired: &BTreeSet<String>,
    outbox: &mut Outbox,
) -> Result<(), BoxError> {
    send_frame(sink, &Frame::Hello { peer }).await?;
    for topic in desired {
        send_frame(sink, &Frame::Subscribe { topic: topic.clone() }).await?;
    }

    let queued = outbox.drain();
    if !queued.is_empty() {
        log::info!("relay transport: replaying {} queued envelopes", queued.len());
    }
    let mut queued = queued.into_iter();
    while let Some(envelope) = queued.next() {
        if let Err(e) = send_frame(sink, &Frame::Publish(envelope.clone())).await {
            outbox.enqueue(envelope);
            for rest in queued {
                outbox.enqueue(rest);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// One socket event. `Err` means the connection is gone.
async fn handle_incoming(
    incoming: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    sink: &mut WsSink,
    ctx: &DriverContext,
) -> Result<(), BoxError> {
    match incoming {
        Some(Ok(Message::Binary(data))) => {
            let bytes: Vec<u8> = data.into();
            match Frame::decode(&bytes) {
                Ok(Frame::Publish(envelope)) => {
                    if envelope.sender != ctx.peer {
                        ctx.table.dispatch(&envelope);
                    }
                }
                Ok(Frame::PeerJoined { topic, peer }) => {
                    if peer != ctx.peer {
                        ctx.known_peers.lock().unwrap().insert(peer);
                        let _ = ctx.membership_tx.send(Membership::Joined { topic, peer });
                    }
                }
                Ok(Frame::PeerLeft { topic, peer }) => {
                    if peer != ctx.peer {
                        ctx.known_peers.lock().unwrap().remove(&peer);
                        let _ = ctx.membership_tx.send(Membership::Left { topic, peer });
                    }
                }
                Ok(Frame::Ping) => {
                    send_frame(sink, &Frame::Pong).await?;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("relay transport: undecodable frame: {e}");
                }
            }
            Ok(())
        }
        Some(Ok(Message::Ping(data))) => {
            sink.send(Message::Pong(data)).await?;
            Ok(())
        }
        Some(Ok(Message::Close(_))) | None => {
            log::info!("relay transport: connection lost");
            Err("connection closed".into())
        }
        Some(Err(e)) => {
            log::warn!("relay transport: socket error: {e}");
            Err(e.into())
        }
        _ => Ok(()),
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), BoxError> {
    let bytes = frame.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(5);

    fn peer(n: u128) -> PeerId {
        PeerId::from_uuid(Uuid::from_u128(n))
    }

    #[tokio::test]
    async fn test_connect_fails_fast_when_unreachable() {
        let config = SyncConfig::for_testing();
        let result = RelayTransport::connect("ws://127.0.0.1:1", peer(1), &config).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_closed() {
        let server = crate::relay::RelayServer::new(crate::relay::RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        });
        let addr = server.serve().await.unwrap();

        let config = SyncConfig::for_testing();
        let transport = RelayTransport::connect(format!("ws://{addr}"), peer(1), &config)
            .await
            .unwrap();
        transport.disconnect().await;

        assert!(matches!(
            transport.send("t", EventKind::Message, vec![]),
            Err(TransportError::Closed)
        ));
        assert_eq!(*transport.health().borrow(), LinkHealth::Down);
    }

    #[tokio::test]
    async fn test_envelopes_sent_while_down_replay_after_reconnect() {
        // Scripted relay: the first connection hangs up on command, the
        // second records the handshake replay.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (first_tx, mut first_rx) = mpsc::unbounded_channel::<Frame>();
        let (sever_tx, mut sever_rx) = oneshot::channel::<()>();
        let (replay_tx, mut replay_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    _ = &mut sever_rx => break,
                    incoming = ws.next() => match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let _ = first_tx.send(Frame::decode(&bytes).unwrap());
                        }
                        _ => break,
                    },
                }
            }
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Binary(data))) = ws.next().await {
                let bytes: Vec<u8> = data.into();
                if replay_tx.send(Frame::decode(&bytes).unwrap()).is_err() {
                    break;
                }
            }
        });

        // A wide backoff keeps the link down until both publishes are queued.
        let mut config = SyncConfig::for_testing();
        config.backoff_base_ms = 400;
        config.backoff_cap_ms = 400;

        let transport = RelayTransport::connect(format!("ws://{addr}"), peer(1), &config)
            .await
            .unwrap();
        let _sub = transport.subscribe("doc", EventKind::Message).await.unwrap();

        // The driver has processed the subscribe once its frame arrives.
        timeout(WAIT, async {
            loop {
                if let Some(Frame::Subscribe { topic }) = first_rx.recv().await {
                    assert_eq!(topic, "doc");
                    break;
                }
            }
        })
        .await
        .expect("subscribe never reached the wire");

        let mut health = transport.health();
        sever_tx.send(()).unwrap();
        timeout(WAIT, health.wait_for(|h| *h != LinkHealth::Connected))
            .await
            .expect("link drop never noticed")
            .unwrap();

        transport.send("doc", EventKind::Message, vec![1]).unwrap();
        transport.send("doc", EventKind::Message, vec![2]).unwrap();

        let replay = timeout(WAIT, async {
            let mut frames = Vec::new();
            while frames.len() < 4 {
                frames.push(replay_rx.recv().await.unwrap());
            }
            frames
        })
        .await
        .expect("handshake replay timed out");

        assert_eq!(replay[0], Frame::Hello { peer: peer(1) });
        assert_eq!(replay[1], Frame::Subscribe { topic: "doc".to_string() });
        match (&replay[2], &replay[3]) {
            (Frame::Publish(first), Frame::Publish(second)) => {
                assert_eq!(first.payload, vec![1]);
                assert_eq!(second.payload, vec![2]);
                assert_eq!(first.seq, 0);
                assert_eq!(second.seq, 1);
            }
            other => panic!("expected the queued publishes, got {other:?}"),
        }

        timeout(WAIT, health.wait_for(|h| *h == LinkHealth::Connected))
            .await
            .expect("reconnect never completed")
            .unwrap();
        transport.disconnect().await;
    }
}
