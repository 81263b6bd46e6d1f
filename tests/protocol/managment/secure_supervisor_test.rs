//! Supervisor tests: commands queued from a handle reach the bus, and
//! application frames come back through the event channel.
mod helpers {
    include!("../../helpers/mod.rs");
}

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use helpers::{frame, run_scenario, stack, MockCanBus, MockTimer, DEVICE, PEER};
use rand::rngs::StdRng;
use rand::SeedableRng;
use secure_j1939::protocol::managment::secure_node::SecureNode;
use secure_j1939::protocol::managment::secure_stack::StackEvent;
use secure_j1939::protocol::managment::secure_supervisor::{SecureCommand, SecureService};
use secure_j1939::protocol::security::DM18_PGN;
use secure_j1939::protocol::transport::traits::can_bus::CanBus;
use static_cell::StaticCell;

static COMMAND_CHANNEL: StaticCell<Channel<CriticalSectionRawMutex, SecureCommand, 4>> =
    StaticCell::new();
static EVENT_CHANNEL: StaticCell<Channel<CriticalSectionRawMutex, StackEvent, 4>> =
    StaticCell::new();

#[test]
fn test_supervisor_commands_and_events() {
    run_scenario(|| async {
        let command_channel = COMMAND_CHANNEL.init(Channel::new());
        let event_channel = EVENT_CHANNEL.init(Channel::new());

        let (dut_bus, mut host_bus) = MockCanBus::create_pair();
        let node = SecureNode::new(
            dut_bus,
            MockTimer::new(),
            StdRng::seed_from_u64(7),
            stack(DEVICE, PEER, 7),
        );
        let service = SecureService::<_, _, _, _, 4, 4>::new(
            node,
            Some(&*command_channel),
            Some(&*event_channel),
        );
        let parts = service.into_parts();
        let handle = parts
            .handle
            .expect("handle must exist when command channel is provided");
        let mut events = parts
            .events
            .expect("events must exist when event channel is provided");
        let mut runner_future = core::pin::pin!(parts.runner.drive());

        tokio::select! {
            result = &mut runner_future => {
                panic!("supervisor ended unexpectedly: {:?}", result);
            }
            _ = async {
                // Key exchange starts with a public key request to the peer.
                handle.begin_key_exchange(PEER).await;
                let request = host_bus.recv().await.expect("DM18 request expected");
                assert_eq!(request.id.pgn(), DM18_PGN);
                assert_eq!(request.id.destination(), Some(PEER));
                assert_eq!(request.payload(), &[0, 0x04]);

                // Commands failing in the stack do not stop the runner.
                handle.send_authenticator(0x42).await;

                handle.send_message(PEER, 61184, &[9, 8, 7]).await.unwrap();
                let sent = host_bus.recv().await.expect("application frame expected");
                assert_eq!(sent.payload(), &[9, 8, 7]);

                // Application traffic from the bus surfaces as events.
                host_bus.send(&frame(61184, PEER, DEVICE, &[1, 2])).await.unwrap();
                match events.recv().await {
                    StackEvent::Message(message) => {
                        assert_eq!(message.source_address, PEER);
                        assert_eq!(message.data(), &[1, 2]);
                    }
                    other => panic!("unexpected event {:?}", other),
                }
            } => {}
        }
    });
}
