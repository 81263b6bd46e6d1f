/// Test doubles to simulate the CAN bus and timer during integration tests.
use secure_j1939::config::SecureConfig;
use secure_j1939::protocol::managment::secure_stack::SecureStack;
use secure_j1939::protocol::security::crypto::SoftwareKeyAgreement;
use secure_j1939::protocol::transport::{
    can_frame::CanFrame,
    can_id::CanId,
    traits::{can_bus::CanBus, j1939_timer::J1939Timer},
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

#[allow(dead_code)]
pub const DEVICE: u8 = 0x25;
#[allow(dead_code)]
pub const PEER: u8 = 0x0B;

#[derive(Clone)]
#[allow(dead_code)]
/// In-memory CAN bus reproducing the `CanBus` trait behavior.
pub struct MockCanBus {
    tx: mpsc::UnboundedSender<CanFrame>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<CanFrame>>>,
}

#[allow(dead_code)]
impl MockCanBus {
    /// Construct a pair of interconnected buses (DUT ↔ host).
    pub fn create_pair() -> (Self, Self) {
        let (dut_tx, host_rx) = mpsc::unbounded_channel();
        let (host_tx, dut_rx) = mpsc::unbounded_channel();

        let dut_bus = Self {
            tx: dut_tx,
            rx: Arc::new(Mutex::new(dut_rx)),
        };

        let host_bus = Self {
            tx: host_tx,
            rx: Arc::new(Mutex::new(host_rx)),
        };

        (dut_bus, host_bus)
    }
}

impl CanBus for MockCanBus {
    type Error = ();

    async fn send<'a>(&'a mut self, frame: &'a CanFrame) -> Result<(), Self::Error> {
        self.tx.send(frame.clone()).map_err(|_| ())?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<CanFrame, Self::Error> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(())
    }
}

#[allow(dead_code)]
/// Timer based on `tokio::time::sleep`; the clock counts from construction.
pub struct MockTimer {
    start: std::time::Instant,
}

#[allow(dead_code)]
impl MockTimer {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl J1939Timer for MockTimer {
    async fn delay_ms(&mut self, millis: u32) {
        sleep(Duration::from_millis(millis as u64)).await;
    }

    fn now(&self) -> embassy_time::Instant {
        embassy_time::Instant::from_millis(self.start.elapsed().as_millis() as u64)
    }
}

#[allow(dead_code)]
/// Stack for `address` with a single vehicle peer and a seeded key pair.
pub fn stack(address: u8, vehicle_peer: u8, seed: u64) -> SecureStack<SoftwareKeyAgreement> {
    let mut rng = StdRng::seed_from_u64(seed);
    let config = SecureConfig::new(address)
        .with_vehicle_addresses(&[vehicle_peer])
        .unwrap();
    SecureStack::new(config, SoftwareKeyAgreement::random(&mut rng))
}

#[allow(dead_code)]
pub fn frame(pgn: u32, source: u8, destination: u8, payload: &[u8]) -> CanFrame {
    let id = CanId::builder(pgn, source)
        .routed_to(destination)
        .build()
        .unwrap();
    CanFrame::from_payload(id, payload).unwrap()
}

#[allow(dead_code)]
/// Run `scenario` on a single-threaded runtime in a thread with a large
/// stack: every node keeps its reassembly buffers inline.
pub fn run_scenario<F, Fut>(scenario: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(scenario())
        })
        .unwrap()
        .join()
        .unwrap();
}
