//! Two-swarm integration: dial, keep-alive mesh bookkeeping, and the
//! one-shot direct protocol over real TCP sockets.

use std::time::Duration;

use diiisco_network::{DiiiscoSwarm, NetworkConfig, NetworkEvent, TransportKind};
use diiisco_protocol::envelope::Role;
use diiisco_protocol::Envelope;
use diiisco_types::SessionId;

fn quiet_config() -> NetworkConfig {
    NetworkConfig {
        listen_addr: "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
        enable_mdns: false,
        enable_relay_server: false,
        enable_dcutr: false,
        ..NetworkConfig::default()
    }
}

fn test_envelope(id: &str) -> Envelope {
    Envelope::new(
        Role::QuoteAccepted,
        SessionId::new(id).unwrap(),
        1_720_000_000_000,
        "SENDER",
        Some("receiver".into()),
        Some(serde_json::json!({ "quote": { "totalPrice": 0.017 } })),
    )
}

/// Polls `a` until it reports a listen address.
async fn wait_for_listener(swarm: &mut DiiiscoSwarm) -> libp2p::Multiaddr {
    for _ in 0..200 {
        if let Some(addr) = swarm.listeners().into_iter().next() {
            return addr;
        }
        let _ = tokio::time::timeout(Duration::from_millis(50), swarm.poll_next()).await;
    }
    panic!("listener never came up");
}

#[tokio::test]
async fn dial_connects_and_direct_envelope_round_trips() {
    let (mut a, mut a_events, _a_mesh) =
        DiiiscoSwarm::new(quiet_config(), libp2p::identity::Keypair::generate_ed25519())
            .unwrap();
    let (mut b, mut b_events, _b_mesh) =
        DiiiscoSwarm::new(quiet_config(), libp2p::identity::Keypair::generate_ed25519())
            .unwrap();

    a.start_listening().unwrap();
    let a_addr = wait_for_listener(&mut a).await;
    let a_peer = *a.local_peer_id();

    b.dial_addr(a_addr).unwrap();

    // Drive both swarms until b observes the connection.
    let connected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            tokio::select! {
                _ = a.poll_next() => {}
                _ = b.poll_next() => {}
                Some(event) = b_events.recv() => {
                    if let NetworkEvent::PeerConnected { peer, .. } = event {
                        if peer == a_peer {
                            break;
                        }
                    }
                }
            }
        }
    })
    .await;
    assert!(connected.is_ok(), "dial never completed");

    // One envelope on a fresh direct stream, acknowledged end-to-end.
    let sent = test_envelope("direct-1");
    let request = b.send_direct(&a_peer, sent.clone());

    let exchanged = tokio::time::timeout(Duration::from_secs(10), async {
        let mut received = false;
        let mut acked = false;
        loop {
            tokio::select! {
                _ = a.poll_next() => {}
                _ = b.poll_next() => {}
                Some(event) = a_events.recv() => {
                    if let NetworkEvent::EnvelopeReceived { envelope, transport, .. } = event {
                        assert_eq!(transport, TransportKind::Direct);
                        assert_eq!(envelope, sent);
                        received = true;
                    }
                }
                Some(event) = b_events.recv() => {
                    if let NetworkEvent::DirectDelivered { request: req } = event {
                        assert_eq!(req, request);
                        acked = true;
                    }
                }
            }
            if received && acked {
                break;
            }
        }
    })
    .await;
    assert!(exchanged.is_ok(), "direct exchange never completed");
}

#[tokio::test]
async fn subscription_count_tracks_the_remote_peer() {
    let (mut a, _a_events, _a_mesh) =
        DiiiscoSwarm::new(quiet_config(), libp2p::identity::Keypair::generate_ed25519())
            .unwrap();
    let (mut b, _b_events, b_mesh) =
        DiiiscoSwarm::new(quiet_config(), libp2p::identity::Keypair::generate_ed25519())
            .unwrap();

    a.start_listening().unwrap();
    let a_addr = wait_for_listener(&mut a).await;
    b.dial_addr(a_addr).unwrap();

    // Both nodes subscribe at construction; after the connection the
    // subscription exchange must raise b's mesh count to one.
    let meshed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if *b_mesh.borrow() >= 1 {
                break;
            }
            tokio::select! {
                _ = a.poll_next() => {}
                _ = b.poll_next() => {}
            }
        }
    })
    .await;
    assert!(meshed.is_ok(), "subscription never propagated");
}
