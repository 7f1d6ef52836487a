//! MeshTransport pairs bootstrapped through a live signaling server.

use std::time::Duration;

use tokio::time::{sleep, timeout};

use conflux_graph::PeerId;
use conflux_sync::protocol::EventKind;
use conflux_sync::signal::SignalingServer;
use conflux_sync::transport::{Membership, MeshTransport, Transport};
use conflux_sync::SyncConfig;

const WAIT: Duration = Duration::from_secs(5);

async fn start_signaling() -> SyncConfig {
    let server = SignalingServer::new("127.0.0.1:0");
    let addr = server.serve().await.unwrap();
    let mut config = SyncConfig::for_testing();
    config.signal_url = format!("ws://{addr}");
    config
}

async fn wait_for_link(transport: &MeshTransport) {
    timeout(WAIT, async {
        while transport.link_count() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no direct link formed");
}

#[tokio::test]
async fn test_pair_links_up_and_exchanges_envelopes() {
    let config = start_signaling().await;
    let alpha_id = PeerId::generate();
    let beta_id = PeerId::generate();

    let alpha = MeshTransport::connect("studio", alpha_id, &config).await.unwrap();
    let beta = MeshTransport::connect("studio", beta_id, &config).await.unwrap();

    wait_for_link(&alpha).await;
    wait_for_link(&beta).await;
    // Exactly one socket between two peers, whoever dialed.
    assert_eq!(alpha.link_count(), 1);
    assert_eq!(beta.link_count(), 1);

    let mut beta_sub = beta.subscribe("doc", EventKind::Message).await.unwrap();
    let mut alpha_sub = alpha.subscribe("doc", EventKind::Message).await.unwrap();

    alpha.send("doc", EventKind::Message, b"direct".to_vec()).unwrap();

    let envelope = timeout(WAIT, beta_sub.recv())
        .await
        .expect("delivery timed out")
        .unwrap();
    assert_eq!(envelope.sender, alpha_id);
    assert_eq!(envelope.payload, b"direct");

    sleep(Duration::from_millis(100)).await;
    assert!(alpha_sub.try_recv().is_none(), "sender echoed its own frame");

    alpha.disconnect().await;
    beta.disconnect().await;
}

#[tokio::test]
async fn test_roster_and_join_events_flow_from_signaling() {
    let config = start_signaling().await;
    let alpha_id = PeerId::generate();
    let beta_id = PeerId::generate();

    let alpha = MeshTransport::connect("studio", alpha_id, &config).await.unwrap();
    let mut alpha_members = alpha.membership();

    let beta = MeshTransport::connect("studio", beta_id, &config).await.unwrap();

    let joined = timeout(WAIT, async {
        loop {
            if let Ok(Membership::Joined { peer, .. }) = alpha_members.recv().await {
                break peer;
            }
        }
    })
    .await
    .expect("join never announced");
    assert_eq!(joined, beta_id);

    // The late joiner got the roster in its Register reply.
    assert_eq!(beta.peers(), vec![alpha_id]);

    alpha.disconnect().await;
    beta.disconnect().await;
}

#[tokio::test]
async fn test_departure_tears_down_links_and_roster() {
    let config = start_signaling().await;
    let alpha = MeshTransport::connect("studio", PeerId::generate(), &config)
        .await
        .unwrap();
    let beta = MeshTransport::connect("studio", PeerId::generate(), &config)
        .await
        .unwrap();
    wait_for_link(&alpha).await;
    wait_for_link(&beta).await;

    let mut alpha_members = alpha.membership();
    let beta_id = beta.local_peer();
    beta.disconnect().await;

    let left = timeout(WAIT, async {
        loop {
            if let Ok(Membership::Left { peer, .. }) = alpha_members.recv().await {
                break peer;
            }
        }
    })
    .await
    .expect("departure never announced");
    assert_eq!(left, beta_id);

    timeout(WAIT, async {
        while !alpha.peers().is_empty() || alpha.link_count() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("roster or links never drained");

    alpha.disconnect().await;
}

#[tokio::test]
async fn test_three_peers_form_a_full_mesh() {
    let config = start_signaling().await;
    let transports: Vec<MeshTransport> = {
        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(
                MeshTransport::connect("studio", PeerId::generate(), &config)
                    .await
                    .unwrap(),
            );
        }
        out
    };

    timeout(WAIT, async {
        loop {
            if transports.iter().all(|t| t.link_count() == 2) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("full mesh never formed");

    let mut subs = Vec::new();
    for transport in &transports[1..] {
        subs.push(transport.subscribe("doc", EventKind::Message).await.unwrap());
    }
    transports[0]
        .send("doc", EventKind::Message, b"fan".to_vec())
        .unwrap();

    for sub in &mut subs {
        let envelope = timeout(WAIT, sub.recv())
            .await
            .expect("broadcast timed out")
            .unwrap();
        assert_eq!(envelope.payload, b"fan");
    }

    for transport in transports {
        transport.disconnect().await;
    }
}
