//! Asynchronous CAN bus the secure node runs on. Each physical bus of the
//! controller is its own `CanBus`; the stack never touches a driver directly.
use crate::protocol::transport::can_frame::CanFrame;
use futures_util::Future;

/// Send and receive 29-bit J1939 frames.
pub trait CanBus {
    type Error: core::fmt::Debug;
    /// Queue `frame` for transmission. Implementations should bound the wait
    /// (see [`CAN_SEND_TIMEOUT_MS`](crate::protocol::transport::CAN_SEND_TIMEOUT_MS)).
    fn send<'a>(
        &'a mut self,
        frame: &'a CanFrame,
    ) -> impl Future<Output = Result<(), Self::Error>> + 'a;
    /// Wait for the next received frame.
    fn recv<'a>(&'a mut self) -> impl Future<Output = Result<CanFrame, Self::Error>> + 'a;
}
