//! Async node: a [`SecureStack`] bound to a CAN bus and a timer.
//!
//! The node feeds received frames to the stack, then transmits whatever the
//! stack queued, pacing transport data frames with
//! [`TP_INTER_PACKET_DELAY_MS`]. While the bus is quiet, [`SecureNode::recv`]
//! wakes up every [`IDLE_POLL_MS`] so stalled outbound transfers still time out.
use embassy_time::Duration;
use futures_util::{future::select, future::Either, pin_mut};
use p256::elliptic_curve::rand_core::{CryptoRng, RngCore};

use crate::error::NodeError;
use crate::protocol::managment::secure_stack::{SecureStack, StackEvent};
use crate::protocol::security::crypto::KeyAgreement;
use crate::protocol::transport::{
    can_frame::CanFrame,
    tp::MAX_TP_PACKETS,
    traits::{can_bus::CanBus, j1939_timer::J1939Timer},
    TP_DT_PGN, TP_INTER_PACKET_DELAY_MS, TP_RESPONSE_TIMEOUT_MS,
};

/// Longest time `recv` waits for a frame before checking transfer timeouts.
pub const IDLE_POLL_MS: u32 = (TP_RESPONSE_TIMEOUT_MS / 5) as u32;

/// Room for the largest burst one call can queue: a full 255-packet transfer
/// plus its announcement and a few control frames.
pub const OUTBOX_CAPACITY: usize = MAX_TP_PACKETS + 8;

pub type Outbox = heapless::Deque<CanFrame, OUTBOX_CAPACITY>;

pub struct SecureNode<C, T, K, R>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    /// CAN bus implementation used to send/receive frames.
    can_bus: C,
    /// Pacing delays and the clock session ages are measured against.
    timer: T,
    /// Source of session keys and IVs.
    rng: R,
    stack: SecureStack<K>,
    /// Frames queued by the stack, sent before the call returns.
    outbox: Outbox,
}

impl<C, T, K, R> SecureNode<C, T, K, R>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    pub fn new(can_bus: C, timer: T, rng: R, stack: SecureStack<K>) -> Self {
        Self {
            can_bus,
            timer,
            rng,
            stack,
            outbox: Outbox::new(),
        }
    }

    pub fn stack(&self) -> &SecureStack<K> {
        &self.stack
    }

    pub fn self_address(&self) -> u8 {
        self.stack.self_address()
    }

    pub fn is_established(&self, address: u8) -> bool {
        self.stack.is_established(address)
    }

    /// Time since the session key of `address` was installed.
    pub fn session_age(&self, address: u8) -> Option<Duration> {
        self.stack.session_age(address, self.timer.now())
    }

    /// Process one received frame and transmit the replies it produced.
    pub async fn handle_frame(
        &mut self,
        frame: &CanFrame,
    ) -> Result<Option<StackEvent>, NodeError<C::Error>> {
        let now = self.timer.now();
        let result = self
            .stack
            .process_frame(frame, now, &mut self.rng, &mut self.outbox);
        // Whatever was queued before a failure still goes out.
        self.flush().await?;
        Ok(result?)
    }

    /// Receive until a frame produces an event for the application.
    pub async fn recv(&mut self) -> Result<StackEvent, NodeError<C::Error>> {
        loop {
            let received = {
                let frame_future = self.can_bus.recv();
                let idle_future = self.timer.delay_ms(IDLE_POLL_MS);
                pin_mut!(frame_future);
                pin_mut!(idle_future);
                match select(frame_future, idle_future).await {
                    Either::Left((frame, _)) => Some(frame.map_err(NodeError::Receive)?),
                    Either::Right(_) => None,
                }
            };

            match received {
                Some(frame) => {
                    if let Some(event) = self.handle_frame(&frame).await? {
                        return Ok(event);
                    }
                }
                None => self.poll().await?,
            }
        }
    }

    /// Time out stalled outbound transfers and transmit the resulting frames.
    pub async fn poll(&mut self) -> Result<(), NodeError<C::Error>> {
        let result = self.stack.poll(self.timer.now(), &mut self.outbox);
        self.flush().await?;
        Ok(result?)
    }

    /// Send an application frame; it is folded into the matching sessions.
    pub async fn send_frame(&mut self, frame: CanFrame) -> Result<(), NodeError<C::Error>> {
        let result = self.stack.send_frame(frame, &mut self.outbox);
        self.flush().await?;
        Ok(result?)
    }

    /// Send a payload of any length, using the transport protocol above eight bytes.
    pub async fn send_message(
        &mut self,
        destination: u8,
        pgn: u32,
        payload: &[u8],
    ) -> Result<(), NodeError<C::Error>> {
        let now = self.timer.now();
        let result = self
            .stack
            .send_message(destination, pgn, payload, now, &mut self.outbox);
        self.flush().await?;
        Ok(result?)
    }

    pub async fn begin_key_exchange(&mut self, address: u8) -> Result<(), NodeError<C::Error>> {
        let now = self.timer.now();
        let result = self.stack.begin_key_exchange(address, now, &mut self.outbox);
        self.flush().await?;
        Ok(result?)
    }

    pub async fn send_authenticator(&mut self, address: u8) -> Result<(), NodeError<C::Error>> {
        let now = self.timer.now();
        let result = self.stack.send_authenticator(address, now, &mut self.outbox);
        self.flush().await?;
        Ok(result?)
    }

    pub async fn request_reset(&mut self, address: u8) -> Result<(), NodeError<C::Error>> {
        let now = self.timer.now();
        let result = self.stack.request_reset(address, now, &mut self.outbox);
        self.flush().await?;
        Ok(result?)
    }

    /// Transmit the outbox in order, pausing before each transport data frame.
    async fn flush(&mut self) -> Result<(), NodeError<C::Error>> {
        while let Some(frame) = self.outbox.pop_front() {
            if frame.id.pgn() == TP_DT_PGN {
                self.timer.delay_ms(TP_INTER_PACKET_DELAY_MS).await;
            }
            self.can_bus.send(&frame).await.map_err(NodeError::Send)?;
        }
        Ok(())
    }
}
