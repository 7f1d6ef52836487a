//! Peer-mesh backend: direct WebSocket links between peers, bootstrapped
//! by a signaling server.
//!
//! ```text
//!            Register/Roster           PeerUp/PeerDown
//! MeshTransport ◀──────▶ SignalingServer ◀──────▶ other peers
//!      │
//!      ├── link to B ──▶ fan-out on send, dispatch on receive
//!      └── link to C
//! ```
//!
//! Each pair of peers holds exactly one link: the smaller peer id dials.
//! The signaling connection is bootstrap and membership only; after link
//! establishment all document and presence traffic is peer-to-peer. If
//! the signaling link drops, the mesh reconnects with backoff and
//! re-registers; envelopes published meanwhile queue in the outbox.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
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
use crate::signal::SignalFrame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// One established peer link: the writer task's queue plus both task
/// handles for teardown.
struct Link {
    tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    writer: tokio::task::JoinHandle<()>,
    reader: tokio::task::JoinHandle<()>,
}

struct MeshShared {
    peer: PeerId,
    room: String,
    table: Arc<SubscriberTable>,
    membership_tx: broadcast::Sender<Membership>,
    health_tx: watch::Sender<LinkHealth>,
    links: Mutex<HashMap<PeerId, Link>>,
    roster: Mutex<HashMap<PeerId, String>>,
    outbox: Mutex<Outbox>,
    shutdown_tx: watch::Sender<bool>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl MeshShared {
    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn has_link(&self, peer: PeerId) -> bool {
        self.links.lock().unwrap().contains_key(&peer)
    }

    fn roster_addr(&self, peer: PeerId) -> Option<String> {
        self.roster.lock().unwrap().get(&peer).cloned()
    }

    /// Broadcast encoded frame bytes to every live link.
    fn fan_out(&self, bytes: Arc<Vec<u8>>) -> usize {
        let mut links = self.links.lock().unwrap();
        links.retain(|_, link| link.tx.send(bytes.clone()).is_ok());
        links.len()
    }

    /// Install a link, keeping the existing one when a duplicate races in.
    fn add_link(self: &Arc<Self>, peer: PeerId, ws: WsStream) -> bool {
        let (sink, source) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_link(sink, rx));
        let reader = tokio::spawn(read_link(self.clone(), peer, source));

        let mut links = self.links.lock().unwrap();
        if links.contains_key(&peer) {
            writer.abort();
            reader.abort();
            return false;
        }
        links.insert(peer, Link { tx, writer, reader });
        drop(links);

        log::info!("mesh: link established with {peer}");
        if !self.roster.lock().unwrap().contains_key(&peer) {
            // Inbound link raced ahead of the PeerUp announcement.
            let _ = self.membership_tx.send(Membership::Joined {
                topic: self.room.clone(),
                peer,
            });
        }
        true
    }

    fn remove_link(&self, peer: PeerId) {
        let link = self.links.lock().unwrap().remove(&peer);
        if let Some(link) = link {
            link.writer.abort();
            link.reader.abort();
            log::info!("mesh: link to {peer} closed");
        }
    }

    /// A peer registered. Record it, announce it, dial if it is ours to dial.
    fn peer_up(self: &Arc<Self>, peer: PeerId, addr: String) {
        if peer == self.peer {
            return;
        }
        self.roster.lock().unwrap().insert(peer, addr.clone());
        let _ = self.membership_tx.send(Membership::Joined {
            topic: self.room.clone(),
            peer,
        });
        self.dial_if_ours(peer);
    }

    fn peer_down(&self, peer: PeerId) {
        if self.roster.lock().unwrap().remove(&peer).is_none() {
            return;
        }
        self.remove_link(peer);
        let _ = self.membership_tx.send(Membership::Left {
            topic: self.room.clone(),
            peer,
        });
    }

    /// Replace the roster with a fresh one from (re-)registration.
    fn reconcile(self: &Arc<Self>, fresh: Vec<(PeerId, String)>) {
        let previous: Vec<PeerId> = self.roster.lock().unwrap().keys().copied().collect();
        for gone in previous
            .iter()
            .filter(|p| !fresh.iter().any(|(id, _)| id == *p))
        {
            self.peer_down(*gone);
        }
        for (peer, addr) in fresh {
            if !previous.contains(&peer) {
                self.peer_up(peer, addr);
            }
        }
    }

    /// Smaller peer id dials, so each pair ends up with exactly one link.
    fn dial_if_ours(self: &Arc<Self>, peer: PeerId) {
        if self.peer >= peer || self.has_link(peer) {
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(shared.backoff_base, shared.backoff_cap);
            loop {
                if shared.is_shutdown() || shared.has_link(peer) {
                    return;
                }
                let Some(addr) = shared.roster_addr(peer) else { return };
                match dial(&shared, peer, &addr).await {
                    Ok(()) => return,
                    Err(e) => log::debug!("mesh: dial {peer} at {addr} failed: {e}"),
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
        });
    }

    fn drain_outbox(&self) {
        let queued = self.outbox.lock().unwrap().drain();
        if queued.is_empty() {
            return;
        }
        log::info!("mesh: replaying {} queued envelopes", queued.len());
        for envelope in queued {
            match Frame::Publish(envelope).encode() {
                Ok(bytes) => {
                    self.fan_out(Arc::new(bytes));
                }
                Err(e) => log::error!("mesh: encode failed during replay: {e}"),
            }
        }
    }

    fn close_all_links(&self) {
        let links: Vec<(PeerId, Link)> = self.links.lock().unwrap().drain().collect();
        for (peer, link) in links {
            link.writer.abort();
            link.reader.abort();
            log::debug!("mesh: link to {peer} torn down");
        }
    }
}

/// Transport over direct peer links.
pub struct MeshTransport {
    shared: Arc<MeshShared>,
    listen_addr: SocketAddr,
    health_rx: watch::Receiver<LinkHealth>,
    seq: AtomicU64,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeshTransport {
    /// Join `room` via the signaling server, advertise a fresh listener,
    /// and dial every roster peer the dial rule assigns to us.
    pub async fn connect(
        room: impl Into<String>,
        peer: PeerId,
        config: &SyncConfig,
    ) -> Result<Self, TransportError> {
        let room = room.into();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let listen_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut ws, _) = tokio_tungstenite::connect_async(&config.signal_url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let advertise = listen_addr.to_string();
        let roster = register(&mut ws, &room, peer, &advertise)
            .await
            .map_err(TransportError::Connect)?;

        let (health_tx, health_rx) = watch::channel(LinkHealth::Connected);
        let (membership_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(MeshShared {
            peer,
            room,
            table: SubscriberTable::new(),
            membership_tx,
            health_tx,
            links: Mutex::new(HashMap::new()),
            roster: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Outbox::new(config.outbox_capacity)),
            shutdown_tx,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
        });
        shared.reconcile(roster);

        let accept_task = tokio::spawn(listen(shared.clone(), listener, shutdown_rx.clone()));
        let signal_task = tokio::spawn(drive_signal(
            shared.clone(),
            config.signal_url.clone(),
            advertise,
            ws,
            shutdown_rx,
        ));

        Ok(Self {
            shared,
            listen_addr,
            health_rx,
            seq: AtomicU64::new(0),
            tasks: tokio::sync::Mutex::new(vec![accept_task, signal_task]),
        })
    }

    /// Address other peers dial for this mesh endpoint.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Established direct links right now.
    pub fn link_count(&self) -> usize {
        self.shared.links.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn local_peer(&self) -> PeerId {
        self.shared.peer
    }

    fn send(&self, topic: &str, event: EventKind, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.shared.is_shutdown() {
            return Err(TransportError::Closed);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(topic, event, self.shared.peer, seq, payload);

        if *self.shared.health_tx.borrow() == LinkHealth::Connected {
            let bytes = Frame::Publish(envelope).encode()?;
            self.shared.fan_out(Arc::new(bytes));
        } else {
            self.shared.outbox.lock().unwrap().enqueue(envelope);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        event: EventKind,
    ) -> Result<Subscription, TransportError> {
        if self.shared.is_shutdown() {
            return Err(TransportError::Closed);
        }
        // Every room member receives every broadcast; routing by (topic,
        // event) happens locally at dispatch.
        Ok(self.shared.table.register(topic, event))
    }

    fn membership(&self) -> broadcast::Receiver<Membership> {
        self.shared.membership_tx.subscribe()
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.shared.roster.lock().unwrap().keys().copied().collect();
        peers.sort();
        peers
    }

    fn health(&self) -> watch::Receiver<LinkHealth> {
        self.health_rx.clone()
    }

    async fn disconnect(&self) {
        if self.shared.shutdown_tx.send_replace(true) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.shared.close_all_links();
        let _ = self.shared.health_tx.send(LinkHealth::Down);
        log::info!("mesh: disconnected");
    }
}

/// Send `Register`, await the `Roster` reply.
async fn register(
    ws: &mut WsStream,
    room: &str,
    peer: PeerId,
    advertise: &str,
) -> Result<Vec<(PeerId, String)>, String> {
    let frame = SignalFrame::Register {
        room: room.to_string(),
        peer,
        addr: advertise.to_string(),
    }
    .encode()
    .map_err(|e| e.to_string())?;
    ws.send(Message::Binary(frame.into()))
        .await
        .map_err(|e| e.to_string())?;

    let deadline = timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match SignalFrame::decode(&bytes) {
                        Ok(SignalFrame::Roster { peers }) => return Ok(peers),
                        Ok(_) => continue,
                        Err(e) => return Err(e.to_string()),
                    }
                }
                Ok(_) => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
        Err("signaling closed before roster".to_string())
    })
    .await;

    match deadline {
        Ok(result) => result,
        Err(_) => Err("roster timeout".to_string()),
    }
}

/// Accept inbound peer links.
async fn listen(
    shared: Arc<MeshShared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { return };
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_link(shared, stream).await {
                        log::debug!("mesh: inbound link failed: {e}");
                    }
                });
            }
        }
    }
}

/// Inbound handshake: the dialer's first frame must be Hello.
async fn accept_link(
    shared: Arc<MeshShared>,
    stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream)).await?;
    let hello = timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .map_err(|_| "hello timeout")?;
    match hello {
        Some(Ok(Message::Binary(data))) => {
            let bytes: Vec<u8> = data.into();
            match Frame::decode(&bytes)? {
                Frame::Hello { peer } => {
                    shared.add_link(peer, ws);
                    Ok(())
                }
                other => Err(format!("expected hello, got {other:?}").into()),
            }
        }
        _ => Err("link closed during handshake".into()),
    }
}

/// Outbound handshake: connect, send Hello, install the link.
async fn dial(
    shared: &Arc<MeshShared>,
    peer: PeerId,
    addr: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!("ws://{addr}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await?;
    let hello = Frame::Hello { peer: shared.peer }.encode()?;
    ws.send(Message::Binary(hello.into())).await?;
    shared.add_link(peer, ws);
    Ok(())
}

async fn write_link(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
    loop {
        match rx.recv().await {
            Some(bytes) => {
                if sink
                    .send(Message::Binary(bytes.as_ref().clone().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            None => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn read_link(shared: Arc<MeshShared>, peer: PeerId, mut source: WsSource) {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                match Frame::decode(&bytes) {
                    Ok(Frame::Publish(envelope)) => {
                        if envelope.sender != shared.peer {
                            shared.table.dispatch(&envelope);
                        }
                    }
                    Ok(Frame::Hello { .. }) => {}
                    Ok(_) => {}
                    Err(e) => log::warn!("mesh: undecodable frame from {peer}: {e}"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    shared.remove_link(peer);
    // The other end may simply have restarted its socket; if the peer is
    // still registered and the dial rule points at us, re-establish.
    if !shared.is_shutdown() && shared.peer < peer && shared.roster_addr(peer).is_some() {
        shared.dial_if_ours(peer);
    }
}

/// Signaling connection lifecycle: membership events while up, backoff
/// reconnect + re-register when it drops.
async fn drive_signal(
    shared: Arc<MeshShared>,
    url: String,
    advertise: String,
    ws: WsStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ws = Some(ws);
    let mut backoff = Backoff::new(shared.backoff_base, shared.backoff_cap);

    'outer: loop {
        let stream = match ws.take() {
            Some(stream) => stream,
            None => {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shared.health_tx.send(LinkHealth::Reconnecting);
                let delay = backoff.next_delay();
                log::info!("mesh: signaling reconnect in {delay:?}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
                match tokio_tungstenite::connect_async(&url).await {
                    Ok((mut stream, _)) => {
                        match register(&mut stream, &shared.room, shared.peer, &advertise).await {
                            Ok(roster) => {
                                shared.reconcile(roster);
                                stream
                            }
                            Err(e) => {
                                log::warn!("mesh: re-register failed: {e}");
                                continue 'outer;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("mesh: signaling reconnect failed: {e}");
                        continue 'outer;
                    }
                }
            }
        };

        backoff.reset();
        let _ = shared.health_tx.send(LinkHealth::Connected);
        shared.drain_outbox();
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match SignalFrame::decode(&bytes) {
                            Ok(SignalFrame::PeerUp { peer, addr }) => shared.peer_up(peer, addr),
                            Ok(SignalFrame::PeerDown { peer }) => shared.peer_down(peer),
                            Ok(SignalFrame::Roster { peers }) => shared.reconcile(peers),
                            Ok(SignalFrame::Register { .. }) => {}
                            Err(e) => log::warn!("mesh: bad signaling frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("mesh: signaling connection lost");
                        continue 'outer;
                    }
                    Some(Err(e)) => {
                        log::warn!("mesh: signaling socket error: {e}");
                        continue 'outer;
                    }
                    _ => {}
                }
            }
        }
    }
}
