//! Secure node tests: key exchange over a bus, authenticated traffic,
//! transport pacing and the Component ID answer.
mod helpers {
    include!("../../helpers/mod.rs");
}

use helpers::{frame, run_scenario, stack, MockCanBus, MockTimer, DEVICE, PEER};
use rand::rngs::StdRng;
use rand::SeedableRng;
use secure_j1939::config::SecureConfig;
use secure_j1939::protocol::managment::secure_node::SecureNode;
use secure_j1939::protocol::managment::secure_stack::{SecureStack, StackEvent};
use secure_j1939::protocol::messages::{ComponentIdentity, COMPONENT_ID_PGN, REQUEST_PGN};
use secure_j1939::protocol::security::crypto::SoftwareKeyAgreement;
use secure_j1939::protocol::security::router::SecurityEvent;
use secure_j1939::protocol::transport::tp::{TpControl, CM_BAM};
use secure_j1939::protocol::transport::traits::can_bus::CanBus;
use secure_j1939::protocol::transport::{TP_CM_PGN, TP_DT_PGN};
use tokio::time::{timeout, Duration};

type Node = SecureNode<MockCanBus, MockTimer, SoftwareKeyAgreement, StdRng>;

fn nodes() -> (Node, Node) {
    let (device_bus, peer_bus) = MockCanBus::create_pair();
    let device = SecureNode::new(
        device_bus,
        MockTimer::new(),
        StdRng::seed_from_u64(100),
        stack(DEVICE, PEER, 1),
    );
    let peer = SecureNode::new(
        peer_bus,
        MockTimer::new(),
        StdRng::seed_from_u64(200),
        stack(PEER, DEVICE, 2),
    );
    (device, peer)
}

/// Receive on `node` until `wanted` surfaces, while `other` keeps answering.
async fn wait_for(node: &mut Node, other: &mut Node, wanted: SecurityEvent) -> Vec<StackEvent> {
    let mut events = Vec::new();
    tokio::select! {
        _ = async {
            loop {
                let event = node.recv().await.expect("bus open");
                let done = matches!(event, StackEvent::Security { event, .. } if event == wanted);
                events.push(event);
                if done {
                    break;
                }
            }
        } => {}
        _ = async {
            loop {
                other.recv().await.expect("bus open");
            }
        } => unreachable!(),
    }
    events
}

#[test]
fn test_node_key_exchange_and_authentication() {
    run_scenario(|| async {
        let (mut device, mut peer) = nodes();

        device.begin_key_exchange(PEER).await.unwrap();
        timeout(
            Duration::from_secs(5),
            wait_for(&mut device, &mut peer, SecurityEvent::ConfirmationMatched),
        )
        .await
        .expect("handshake must finish");
        assert!(device.is_established(PEER));
        assert!(peer.is_established(DEVICE));
        assert!(device.session_age(PEER).is_some());

        // One application frame each way, then the peer checks the tags.
        device.send_message(PEER, 61184, &[1, 2, 3]).await.unwrap();
        match peer.recv().await.unwrap() {
            StackEvent::Message(message) => assert_eq!(message.data(), &[1, 2, 3]),
            other => panic!("unexpected event {:?}", other),
        }
        peer.send_message(DEVICE, 61184, &[4, 5]).await.unwrap();
        assert!(matches!(device.recv().await.unwrap(), StackEvent::Message(_)));

        peer.send_authenticator(DEVICE).await.unwrap();
        let events = timeout(
            Duration::from_secs(5),
            wait_for(&mut device, &mut peer, SecurityEvent::AuthenticatorMatched),
        )
        .await
        .expect("tag must arrive");
        assert_eq!(events.len(), 1);
    });
}

#[test]
fn test_node_reset() {
    run_scenario(|| async {
        let (mut device, mut peer) = nodes();
        device.begin_key_exchange(PEER).await.unwrap();
        timeout(
            Duration::from_secs(5),
            wait_for(&mut device, &mut peer, SecurityEvent::ConfirmationMatched),
        )
        .await
        .unwrap();

        device.request_reset(PEER).await.unwrap();
        assert_eq!(
            peer.recv().await.unwrap(),
            StackEvent::Security {
                address: DEVICE,
                event: SecurityEvent::SessionReset,
            }
        );
        assert!(!device.is_established(PEER));
        assert!(!peer.is_established(DEVICE));
    });
}

#[test]
fn test_node_broadcast_frames() {
    run_scenario(|| async {
        let (dut_bus, mut host_bus) = MockCanBus::create_pair();
        let mut node = SecureNode::new(
            dut_bus,
            MockTimer::new(),
            StdRng::seed_from_u64(3),
            stack(DEVICE, PEER, 3),
        );
        let payload: Vec<u8> = (0..20).collect();
        node.send_message(255, 65280, &payload).await.unwrap();

        let announce = host_bus.recv().await.unwrap();
        assert_eq!(announce.id.pgn(), TP_CM_PGN);
        assert_eq!(
            TpControl::parse(&announce.data),
            Ok(TpControl::Bam {
                total_bytes: 20,
                total_packets: 3,
                pgn: 65280,
            })
        );
        for sequence in 1..=3u8 {
            let data = host_bus.recv().await.unwrap();
            assert_eq!(data.id.pgn(), TP_DT_PGN);
            assert_eq!(data.data[0], sequence);
        }
    });
}

#[test]
fn test_node_answers_component_id_request() {
    run_scenario(|| async {
        let (dut_bus, mut host_bus) = MockCanBus::create_pair();
        let config = SecureConfig::new(DEVICE)
            .with_identity(ComponentIdentity::new("SSS2", "SN0042").unwrap());
        let mut rng = StdRng::seed_from_u64(4);
        let key = SoftwareKeyAgreement::random(&mut rng);
        let mut node = SecureNode::new(
            dut_bus,
            MockTimer::new(),
            rng,
            SecureStack::new(config, key),
        );

        let request = frame(REQUEST_PGN, PEER, DEVICE, &[0xEB, 0xFE, 0x00]);
        host_bus.send(&request).await.unwrap();

        tokio::select! {
            _ = node.recv() => panic!("a Component ID request is not an application event"),
            announce = host_bus.recv() => {
                let announce = announce.unwrap();
                assert_eq!(announce.data[0], CM_BAM);
                assert_eq!(
                    TpControl::parse(&announce.data).map(|control| control.pgn()),
                    Ok(COMPONENT_ID_PGN)
                );
            }
        }
    });
}
