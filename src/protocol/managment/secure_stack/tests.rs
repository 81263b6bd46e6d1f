//! Two stacks wired back to back: handshake, authentication, transport and
//! the messages the stack answers on its own.
extern crate std;

use std::vec::Vec;

use super::*;
use crate::protocol::managment::address_registry::N_SOURCE_ADDRESSES;
use crate::protocol::messages::ComponentIdentity;
use crate::protocol::security::crypto::SoftwareKeyAgreement;
use crate::protocol::transport::tp::ABORT_TIMEOUT;
use crate::protocol::transport::TP_RESPONSE_TIMEOUT_MS;
use rand::rngs::StdRng;
use rand::SeedableRng;

type Stack = SecureStack<SoftwareKeyAgreement>;
type Outbox = heapless::Deque<CanFrame, 512>;

const DEVICE: u8 = 0x25;
const PEER: u8 = 0x0B;
const PROPRIETARY_A: u32 = 61184;
const OTHER_PDU1: u32 = 0xDF00;

/// Stacks hold every reassembly buffer inline; give them room.
fn run<F: FnOnce() + Send + 'static>(test: F) {
    std::thread::Builder::new()
        .stack_size(32 * 1024 * 1024)
        .spawn(test)
        .unwrap()
        .join()
        .unwrap();
}

fn stacks(rng: &mut StdRng) -> (Stack, Stack) {
    let device = SecureConfig::new(DEVICE)
        .with_vehicle_addresses(&[PEER])
        .unwrap()
        .with_identity(ComponentIdentity::new("SSS2", "SN0042").unwrap());
    let peer = SecureConfig::new(PEER)
        .with_vehicle_addresses(&[DEVICE])
        .unwrap();
    (
        SecureStack::new(device, SoftwareKeyAgreement::random(rng)),
        SecureStack::new(peer, SoftwareKeyAgreement::random(rng)),
    )
}

fn frame(pgn: u32, source: u8, destination: u8, payload: &[u8]) -> CanFrame {
    let id = CanId::builder(pgn, source)
        .routed_to(destination)
        .build()
        .unwrap();
    CanFrame::from_payload(id, payload).unwrap()
}

fn security_events(events: &[StackEvent]) -> Vec<SecurityEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            StackEvent::Security { event, .. } => Some(*event),
            _ => None,
        })
        .collect()
}

/// Bus between two stacks.
struct Link {
    device: Stack,
    device_out: Outbox,
    peer: Stack,
    peer_out: Outbox,
    rng: StdRng,
    now: Instant,
}

impl Link {
    fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (device, peer) = stacks(&mut rng);
        Self {
            device,
            device_out: Outbox::new(),
            peer,
            peer_out: Outbox::new(),
            rng,
            now: Instant::from_millis(5),
        }
    }

    /// Deliver queued frames until both sides are quiet. Returns the events
    /// of the device and of the peer.
    fn settle(&mut self) -> (Vec<StackEvent>, Vec<StackEvent>) {
        let mut device_events = Vec::new();
        let mut peer_events = Vec::new();
        loop {
            if let Some(frame) = self.device_out.pop_front() {
                let event = self
                    .peer
                    .process_frame(&frame, self.now, &mut self.rng, &mut self.peer_out)
                    .unwrap();
                peer_events.extend(event);
            } else if let Some(frame) = self.peer_out.pop_front() {
                let event = self
                    .device
                    .process_frame(&frame, self.now, &mut self.rng, &mut self.device_out)
                    .unwrap();
                device_events.extend(event);
            } else {
                return (device_events, peer_events);
            }
        }
    }

    fn handshake(&mut self) -> (Vec<StackEvent>, Vec<StackEvent>) {
        self.device
            .begin_key_exchange(PEER, self.now, &mut self.device_out)
            .unwrap();
        self.settle()
    }
}

#[test]
/// Device-initiated exchange: key request, both public keys, key delivery, confirmation.
fn test_key_exchange() {
    run(|| {
        let mut link = Link::new(1);
        let (device_events, peer_events) = link.handshake();

        assert_eq!(
            security_events(&device_events),
            [
                SecurityEvent::SessionEstablished,
                SecurityEvent::ConfirmationMatched
            ]
        );
        assert_eq!(
            security_events(&peer_events),
            [
                SecurityEvent::PublicKeyRequested,
                SecurityEvent::PeerPublicKeyStored,
                SecurityEvent::SessionEstablished
            ]
        );
        assert!(link.device.is_established(PEER));
        assert!(link.peer.is_established(DEVICE));
        assert_eq!(
            link.device.session_age(PEER, Instant::from_millis(1005)),
            Some(Duration::from_millis(1000))
        );
    });
}

#[test]
/// Traffic in both directions, addressed and broadcast, keeps the tags equal.
fn test_authenticated_traffic() {
    run(|| {
        let mut link = Link::new(2);
        link.handshake();

        // Both ends must fold frames in the same order, so each send settles first.
        link.device
            .send_message(PEER, PROPRIETARY_A, &[1, 2, 3], link.now, &mut link.device_out)
            .unwrap();
        let (_, peer_events) = link.settle();
        assert!(matches!(
            peer_events.as_slice(),
            [StackEvent::Message(message)] if message.pgn == PROPRIETARY_A && message.data() == [1, 2, 3]
        ));

        link.peer
            .send_message(
                GLOBAL_ADDRESS,
                65280,
                &[4, 5, 6, 7, 8, 9, 10, 11],
                link.now,
                &mut link.peer_out,
            )
            .unwrap();
        let (device_events, _) = link.settle();
        assert!(matches!(
            device_events.as_slice(),
            [StackEvent::Message(message)] if message.pgn == 65280 && message.destination_address == GLOBAL_ADDRESS
        ));

        // The device answers with its own tag, and the first matched tag
        // also releases the device confirmation.
        link.peer
            .send_authenticator(DEVICE, link.now, &mut link.peer_out)
            .unwrap();
        let (device_events, peer_events) = link.settle();
        assert_eq!(
            security_events(&device_events),
            [SecurityEvent::AuthenticatorMatched]
        );
        assert_eq!(
            security_events(&peer_events),
            [
                SecurityEvent::AuthenticatorMatched,
                SecurityEvent::ConfirmationMatched
            ]
        );

        // No second confirmation for the same key; the tags still cross once.
        link.peer
            .send_authenticator(DEVICE, link.now, &mut link.peer_out)
            .unwrap();
        let (device_events, peer_events) = link.settle();
        assert_eq!(
            security_events(&device_events),
            [SecurityEvent::AuthenticatorMatched]
        );
        assert_eq!(
            security_events(&peer_events),
            [SecurityEvent::AuthenticatorMatched]
        );
    });
}

#[test]
/// An unsolicited tag is answered with ours; the answer is not answered again.
fn test_authenticator_answered_once() {
    run(|| {
        let mut link = Link::new(12);
        link.handshake();

        link.peer
            .send_authenticator(DEVICE, link.now, &mut link.peer_out)
            .unwrap();
        let tag = link.peer_out.pop_front().expect("tag frame");
        link.device
            .process_frame(&tag, link.now, &mut link.rng, &mut link.device_out)
            .unwrap();

        // Own tag first, then the RTS carrying the confirmation released by the match.
        let expected = link
            .device
            .sessions()
            .emit_authenticator(link.device.registry().cmac_index_for(PEER).unwrap())
            .unwrap();
        assert_eq!(link.device_out.len(), 2);
        let own = link.device_out.front().unwrap();
        assert_eq!(own.id.pgn(), DM18_PGN);
        assert_eq!(
            SecurityMessage::decode(own.payload()),
            Ok(SecurityMessage::Authenticator(expected))
        );
        let confirmation = link.device_out.back().unwrap();
        assert!(matches!(
            TpControl::parse(confirmation.payload()),
            Ok(TpControl::RequestToSend { pgn: DM18_PGN, .. })
        ));

        let (device_events, peer_events) = link.settle();
        assert!(device_events.is_empty());
        assert_eq!(
            security_events(&peer_events),
            [
                SecurityEvent::AuthenticatorMatched,
                SecurityEvent::ConfirmationMatched
            ]
        );
    });
}

#[test]
/// A frame the peer never sent makes the device tag diverge; the session survives.
fn test_authenticator_mismatch() {
    run(|| {
        let mut link = Link::new(3);
        link.handshake();

        let forged = frame(PROPRIETARY_A, PEER, DEVICE, &[0xDE, 0xAD]);
        let event = link
            .device
            .process_frame(&forged, link.now, &mut link.rng, &mut link.device_out)
            .unwrap();
        assert!(matches!(event, Some(StackEvent::Message(_))));

        link.peer
            .send_authenticator(DEVICE, link.now, &mut link.peer_out)
            .unwrap();
        let (device_events, peer_events) = link.settle();
        assert_eq!(
            security_events(&device_events),
            [SecurityEvent::Fault(SecurityError::AuthenticatorMismatch)]
        );
        // The device's answer lets the peer see the divergence too.
        assert_eq!(
            security_events(&peer_events),
            [SecurityEvent::Fault(SecurityError::AuthenticatorMismatch)]
        );
        assert!(link.device.is_established(PEER));
    });
}

#[test]
/// Reset drops both sides of the session.
fn test_reset() {
    run(|| {
        let mut link = Link::new(4);
        link.handshake();

        link.device
            .request_reset(PEER, link.now, &mut link.device_out)
            .unwrap();
        let (_, peer_events) = link.settle();
        assert_eq!(security_events(&peer_events), [SecurityEvent::SessionReset]);
        assert!(!link.device.is_established(PEER));
        assert!(!link.peer.is_established(DEVICE));
        assert_eq!(link.device.session_age(PEER, link.now), None);

        assert_eq!(
            link.device.send_authenticator(PEER, link.now, &mut link.device_out),
            Err(StackError::Security(SecurityError::NotEstablished))
        );
    });
}

#[test]
/// Long addressed payloads go through RTS/CTS and arrive intact.
fn test_connection_mode_message() {
    run(|| {
        let mut link = Link::new(5);
        let payload: [u8; 100] = core::array::from_fn(|i| i as u8);

        link.device
            .send_message(PEER, PROPRIETARY_A, &payload, link.now, &mut link.device_out)
            .unwrap();
        let (device_events, peer_events) = link.settle();
        assert!(device_events.is_empty());
        match peer_events.as_slice() {
            [StackEvent::Message(message)] => {
                assert_eq!(message.source_address, DEVICE);
                assert_eq!(message.destination_address, PEER);
                assert_eq!(message.data(), payload);
            }
            other => panic!("unexpected events {:?}", other),
        }
    });
}

#[test]
/// A Component ID request is answered with a BAM carrying the identity.
fn test_component_id_request() {
    run(|| {
        let mut link = Link::new(6);
        link.peer
            .send_message(DEVICE, REQUEST_PGN, &[0xEB, 0xFE, 0x00], link.now, &mut link.peer_out)
            .unwrap();
        let (device_events, peer_events) = link.settle();

        assert!(device_events.is_empty());
        match peer_events.as_slice() {
            [StackEvent::Message(message)] => {
                assert_eq!(message.pgn, COMPONENT_ID_PGN);
                assert_eq!(message.source_address, DEVICE);
                assert_eq!(message.data(), b"CSU*SSS2*SN0042*");
            }
            other => panic!("unexpected events {:?}", other),
        }

        // Without an identity the request reaches the application.
        link.device
            .send_message(PEER, REQUEST_PGN, &[0xEB, 0xFE, 0x00], link.now, &mut link.device_out)
            .unwrap();
        let (_, peer_events) = link.settle();
        assert!(matches!(
            peer_events.as_slice(),
            [StackEvent::Message(message)] if message.pgn == REQUEST_PGN
        ));
    });
}

#[test]
/// DM18 from an address outside the vehicle list is reported and not answered.
fn test_unknown_peer() {
    run(|| {
        let mut link = Link::new(7);
        let request = frame(DM18_PGN, 0x42, DEVICE, &[0, 0x04]);
        let event = link
            .device
            .process_frame(&request, link.now, &mut link.rng, &mut link.device_out)
            .unwrap();
        assert_eq!(
            event,
            Some(StackEvent::Security {
                address: 0x42,
                event: SecurityEvent::Fault(SecurityError::UnknownPeer { address: 0x42 }),
            })
        );
        assert!(link.device_out.is_empty());

        assert_eq!(
            link.device.begin_key_exchange(0x42, link.now, &mut link.device_out),
            Err(StackError::Security(SecurityError::UnknownPeer { address: 0x42 }))
        );
    });
}

#[test]
/// Frames for other nodes, our own echoes and stray control frames are dropped silently.
fn test_frames_dropped() {
    run(|| {
        let mut link = Link::new(8);
        let mut rng = StdRng::seed_from_u64(80);
        let now = link.now;
        let dropped = [
            frame(PROPRIETARY_A, PEER, 0x33, &[1]),
            frame(PROPRIETARY_A, DEVICE, GLOBAL_ADDRESS, &[1]),
            TpControl::ClearToSend {
                packets: 4,
                next_packet: 1,
                pgn: DM18_PGN,
            }
            .to_frame(PEER, DEVICE)
            .unwrap(),
        ];
        for frame in dropped.iter() {
            assert_eq!(
                link.device
                    .process_frame(frame, now, &mut rng, &mut link.device_out),
                Ok(None)
            );
        }
        assert!(link.device_out.is_empty());
    });
}

#[test]
/// A data frame outside the announced transfer surfaces as a transport event.
fn test_transport_fault() {
    run(|| {
        let mut link = Link::new(9);
        let now = link.now;
        let announce = TpControl::Bam {
            total_bytes: 26,
            total_packets: 4,
            pgn: 65280,
        }
        .to_frame(PEER, GLOBAL_ADDRESS)
        .unwrap();
        assert_eq!(
            link.device
                .process_frame(&announce, now, &mut link.rng, &mut link.device_out),
            Ok(None)
        );

        let stray = frame(TP_DT_PGN, PEER, GLOBAL_ADDRESS, &[9, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            link.device
                .process_frame(&stray, now, &mut link.rng, &mut link.device_out),
            Ok(Some(StackEvent::Transport {
                address: PEER,
                fault: TransportFault::SequenceOutOfRange {
                    sequence: 9,
                    total_packets: 4,
                },
            }))
        );
    });
}

#[test]
/// Outbox overflow is the one error `process_frame` returns.
fn test_sink_full() {
    run(|| {
        let mut link = Link::new(10);
        let mut tiny: heapless::Vec<CanFrame, 1> = heapless::Vec::new();
        let request = frame(REQUEST_PGN, PEER, DEVICE, &[0xEB, 0xFE, 0x00]);
        assert_eq!(
            link.device
                .process_frame(&request, link.now, &mut link.rng, &mut tiny),
            Err(StackError::Sink(crate::error::SinkFull))
        );
    });
}

#[test]
/// Registry wraparound: the evicted address loses its reassembly and its
/// outbound transfer, the address reusing the slot inherits neither, and the
/// vehicle session is untouched.
fn test_registry_wraparound_discards_transport_state() {
    run(|| {
        const STRANGER: u8 = 0x30;
        let mut link = Link::new(13);
        link.handshake();
        let now = link.now;

        // Half a BAM from the stranger, and an RTS towards it.
        let announce = TpControl::Bam {
            total_bytes: 20,
            total_packets: 3,
            pgn: 65280,
        }
        .to_frame(STRANGER, GLOBAL_ADDRESS)
        .unwrap();
        let first = frame(TP_DT_PGN, STRANGER, GLOBAL_ADDRESS, &[1, 1, 2, 3, 4, 5, 6, 7]);
        for frame in [&announce, &first] {
            assert_eq!(
                link.device
                    .process_frame(frame, now, &mut link.rng, &mut link.device_out),
                Ok(None)
            );
        }
        link.device
            .send_message(STRANGER, PROPRIETARY_A, &[0x11; 20], now, &mut link.device_out)
            .unwrap();
        assert_eq!(link.device_out.len(), 1);
        link.device_out.clear();

        // Enough new sources to wrap the ring past the stranger's slot.
        let newcomers = 0x40..0x40 + N_SOURCE_ADDRESSES as u8;
        for source in newcomers.clone() {
            let chatter = frame(65280, source, GLOBAL_ADDRESS, &[source]);
            link.device
                .process_frame(&chatter, now, &mut link.rng, &mut link.device_out)
                .unwrap();
        }
        assert_eq!(link.device.registry().lookup(STRANGER), None);
        assert_eq!(link.device.registry().lookup(PEER), None);

        // The newcomer holding the stranger's old slot continues nothing.
        let heir = newcomers.clone().last().unwrap();
        let heir_slot = link.device.registry().lookup(heir).unwrap();
        assert_eq!(heir_slot.get(), 1);
        let data = frame(TP_DT_PGN, heir, GLOBAL_ADDRESS, &[2, 8, 9, 10, 11, 12, 13, 14]);
        let cts = TpControl::ClearToSend {
            packets: 3,
            next_packet: 1,
            pgn: PROPRIETARY_A,
        }
        .to_frame(heir, DEVICE)
        .unwrap();
        for frame in [&data, &cts] {
            assert_eq!(
                link.device
                    .process_frame(frame, now, &mut link.rng, &mut link.device_out),
                Ok(None)
            );
        }

        // Neither does the stranger once it comes back.
        for sequence in 2..=3u8 {
            let data = frame(TP_DT_PGN, STRANGER, GLOBAL_ADDRESS, &[sequence; 8]);
            assert_eq!(
                link.device
                    .process_frame(&data, now, &mut link.rng, &mut link.device_out),
                Ok(None)
            );
        }
        assert!(link.device_out.is_empty());

        // Sessions are keyed by vehicle list position, not by registry slot.
        assert!(link.device.is_established(PEER));
        link.peer
            .send_authenticator(DEVICE, now, &mut link.peer_out)
            .unwrap();
        let (device_events, _) = link.settle();
        assert_eq!(
            security_events(&device_events),
            [SecurityEvent::AuthenticatorMatched]
        );
    });
}

#[test]
/// A receiver that never answers an RTS is aborted after the response
/// timeout and the next queued transfer starts.
fn test_outbound_transfer_times_out() {
    run(|| {
        let mut link = Link::new(14);
        let start = link.now;
        link.device
            .send_message(PEER, PROPRIETARY_A, &[1; 20], start, &mut link.device_out)
            .unwrap();
        link.device
            .send_message(PEER, OTHER_PDU1, &[2; 30], start, &mut link.device_out)
            .unwrap();
        assert_eq!(link.device_out.len(), 1);
        link.device_out.clear();

        let deadline = start + Duration::from_millis(TP_RESPONSE_TIMEOUT_MS);
        link.device.poll(deadline, &mut link.device_out).unwrap();
        assert!(link.device_out.is_empty());

        // Any received frame also drives the timeout.
        let late = deadline + Duration::from_millis(1);
        let chatter = frame(65280, 0x33, GLOBAL_ADDRESS, &[0]);
        link.device
            .process_frame(&chatter, late, &mut link.rng, &mut link.device_out)
            .unwrap();
        let abort = link.device_out.pop_front().expect("abort expected");
        assert_eq!(abort.id.destination(), Some(PEER));
        assert_eq!(
            TpControl::parse(abort.payload()),
            Ok(TpControl::Abort {
                reason: ABORT_TIMEOUT,
                pgn: PROPRIETARY_A,
            })
        );
        let next = link.device_out.pop_front().expect("queued RTS expected");
        assert_eq!(
            TpControl::parse(next.payload()),
            Ok(TpControl::RequestToSend {
                total_bytes: 30,
                total_packets: 5,
                max_burst: 0xFF,
                pgn: OTHER_PDU1,
            })
        );

        // The promoted transfer runs normally once the peer sees its RTS.
        link.device_out.push_back(next).unwrap();
        let (_, peer_events) = link.settle();
        assert!(matches!(
            peer_events.as_slice(),
            [StackEvent::Message(message)] if message.data() == [2; 30]
        ));
    });
}

#[test]
/// A reset drops transfers still waiting for the peer, so the next message
/// starts right away instead of queuing behind a dead one.
fn test_reset_cancels_pending_transfers() {
    run(|| {
        let mut link = Link::new(15);
        let now = link.now;
        link.device
            .send_message(PEER, PROPRIETARY_A, &[1; 20], now, &mut link.device_out)
            .unwrap();
        link.device_out.clear();

        link.device
            .request_reset(PEER, now, &mut link.device_out)
            .unwrap();
        link.device_out.clear();

        let later = now + Duration::from_millis(10 * TP_RESPONSE_TIMEOUT_MS);
        link.device.poll(later, &mut link.device_out).unwrap();
        assert!(link.device_out.is_empty());

        link.device
            .send_message(PEER, PROPRIETARY_A, &[3; 20], later, &mut link.device_out)
            .unwrap();
        let request = link.device_out.front().expect("RTS sent immediately");
        assert!(matches!(
            TpControl::parse(request.payload()),
            Ok(TpControl::RequestToSend { total_bytes: 20, .. })
        ));
    });
}
