//! RelayTransport against a live relay server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use conflux_graph::PeerId;
use conflux_sync::protocol::EventKind;
use conflux_sync::relay::{RelayConfig, RelayServer};
use conflux_sync::transport::{Membership, RelayTransport, Transport};
use conflux_sync::SyncConfig;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (Arc<RelayServer>, SyncConfig) {
    let server = RelayServer::new(RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..RelayConfig::default()
    });
    let addr = server.serve().await.unwrap();
    let mut config = SyncConfig::for_testing();
    config.relay_url = format!("ws://{addr}");
    (server, config)
}

async fn connect(config: &SyncConfig) -> (RelayTransport, PeerId) {
    let peer = PeerId::generate();
    let transport = RelayTransport::connect(&config.relay_url, peer, config)
        .await
        .unwrap();
    (transport, peer)
}

#[tokio::test]
async fn test_publish_reaches_other_subscriber_not_self() {
    let (_server, config) = start_relay().await;
    let (alpha, alpha_id) = connect(&config).await;
    let (beta, _) = connect(&config).await;

    let mut alpha_sub = alpha.subscribe("doc", EventKind::Message).await.unwrap();
    let mut beta_sub = beta.subscribe("doc", EventKind::Message).await.unwrap();

    alpha.send("doc", EventKind::Message, b"hello".to_vec()).unwrap();

    let envelope = timeout(WAIT, beta_sub.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(envelope.sender, alpha_id);
    assert_eq!(envelope.topic, "doc");
    assert_eq!(envelope.payload, b"hello");

    // The sender's own route must stay quiet.
    sleep(Duration::from_millis(100)).await;
    assert!(alpha_sub.try_recv().is_none());

    alpha.disconnect().await;
    beta.disconnect().await;
}

#[tokio::test]
async fn test_fifo_order_preserved_per_sender() {
    let (_server, config) = start_relay().await;
    let (alpha, _) = connect(&config).await;
    let (beta, beta_id) = connect(&config).await;

    let mut beta_sub = beta.subscribe("doc", EventKind::Message).await.unwrap();
    let _alpha_sub = alpha.subscribe("doc", EventKind::Message).await.unwrap();
    // Beta must be in the room before the burst starts.
    timeout(WAIT, async {
        while !alpha.peers().contains(&beta_id) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room never filled");

    for i in 0u8..20 {
        alpha.send("doc", EventKind::Message, vec![i]).unwrap();
    }

    for i in 0u8..20 {
        let envelope = timeout(WAIT, beta_sub.recv())
            .await
            .expect("burst delivery timed out")
            .unwrap();
        assert_eq!(envelope.payload, vec![i]);
        assert_eq!(envelope.seq, u64::from(i));
    }

    alpha.disconnect().await;
    beta.disconnect().await;
}

#[tokio::test]
async fn test_roster_fills_for_late_joiner_and_events_fire() {
    let (_server, config) = start_relay().await;
    let (alpha, alpha_id) = connect(&config).await;
    let _alpha_sub = alpha.subscribe("doc", EventKind::Message).await.unwrap();

    let mut alpha_members = alpha.membership();
    let (beta, beta_id) = connect(&config).await;
    let _beta_sub = beta.subscribe("doc", EventKind::Message).await.unwrap();

    // Existing member hears the join.
    let joined = timeout(WAIT, async {
        loop {
            if let Ok(Membership::Joined { peer, topic }) = alpha_members.recv().await {
                break (peer, topic);
            }
        }
    })
    .await
    .expect("existing member heard nothing");
    assert_eq!(joined, (beta_id, "doc".to_string()));

    // Late joiner learns the current roster.
    timeout(WAIT, async {
        while !beta.peers().contains(&alpha_id) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late joiner never saw the roster");

    alpha.disconnect().await;
    beta.disconnect().await;
}

#[tokio::test]
async fn test_dropped_subscription_stops_local_delivery() {
    let (_server, config) = start_relay().await;
    let (alpha, _) = connect(&config).await;
    let (beta, _) = connect(&config).await;

    let presence_sub = beta.subscribe("p", EventKind::Awareness).await.unwrap();
    let mut message_sub = beta.subscribe("p", EventKind::Message).await.unwrap();
    let _alpha_sub = alpha.subscribe("p", EventKind::Message).await.unwrap();

    drop(presence_sub);

    // Same connection, same topic: the awareness frame is forwarded first,
    // finds no route, and is dropped; the message frame lands.
    alpha.send("p", EventKind::Awareness, b"gone".to_vec()).unwrap();
    alpha.send("p", EventKind::Message, b"kept".to_vec()).unwrap();

    let envelope = timeout(WAIT, message_sub.recv())
        .await
        .expect("message delivery timed out")
        .unwrap();
    assert_eq!(envelope.payload, b"kept");

    alpha.disconnect().await;
    beta.disconnect().await;
}

#[tokio::test]
async fn test_stats_track_connections_and_forwards() {
    let (server, config) = start_relay().await;
    let (alpha, _) = connect(&config).await;
    let (beta, _) = connect(&config).await;

    let _a = alpha.subscribe("doc", EventKind::Message).await.unwrap();
    let mut b = beta.subscribe("doc", EventKind::Message).await.unwrap();
    alpha.send("doc", EventKind::Message, b"x".to_vec()).unwrap();
    timeout(WAIT, b.recv()).await.expect("delivery timed out").unwrap();

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert!(stats.frames_forwarded >= 1);
    assert!(stats.bytes_in > 0);
    assert!(stats.active_rooms >= 1);

    alpha.disconnect().await;
    beta.disconnect().await;

    let mut drained = false;
    for _ in 0..500 {
        if server.stats().await.active_connections == 0 {
            drained = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(drained, "connections never drained");
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_traffic() {
    let (server, config) = start_relay().await;
    let (alpha, _) = connect(&config).await;
    let (beta, _) = connect(&config).await;

    let _alpha_sub = alpha.subscribe("doc", EventKind::Message).await.unwrap();
    alpha.send("doc", EventKind::Message, b"early".to_vec()).unwrap();

    // Rooms are fire-and-forget: wait until the relay has seen the frame,
    // then join.
    timeout(WAIT, async {
        while server.stats().await.frames_forwarded == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("frame never reached the relay");

    let mut beta_sub = beta.subscribe("doc", EventKind::Message).await.unwrap();
    alpha.send("doc", EventKind::Message, b"late".to_vec()).unwrap();

    let envelope = timeout(WAIT, beta_sub.recv())
        .await
        .expect("second frame timed out")
        .unwrap();
    assert_eq!(envelope.payload, b"late", "missed traffic must not replay");

    alpha.disconnect().await;
    beta.disconnect().await;
}
