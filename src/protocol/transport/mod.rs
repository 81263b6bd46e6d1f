//! J1939 transport layer: CAN frame representations, 29-bit identifier
//! management, the multi-packet transport protocol (TP.CM / TP.DT), and bus
//! abstraction traits.
//!
//! ## J1939 Timing Constants
//!
//! These constants define recommended delays and timeouts for reliable
//! transmissions on a J1939 network.

pub mod can_frame;
pub mod can_id;
pub mod tp;
pub mod traits;

/// Transport Protocol Connection Management PGN (TP.CM).
pub const TP_CM_PGN: u32 = 60416;
/// Transport Protocol Data Transfer PGN (TP.DT).
pub const TP_DT_PGN: u32 = 60160;

/// Recommended minimal delay between two transport data frames (ms).
///
/// J1939-21 permits back-to-back BAM packets from small controllers, yet a
/// short delay avoids saturating embedded CAN TX buffers (notably ESP32 TWAI
/// with a three-frame buffer). The transfer itself carries no flow control;
/// the delay only paces the driver.
pub const TP_INTER_PACKET_DELAY_MS: u32 = 2;

/// J1939-21 T3: how long a connection-mode sender waits for the receiver's
/// CTS or End Of Message Ack before it aborts the transfer (ms).
///
/// The timer restarts on every CTS. An expired transfer is aborted with
/// reason [`ABORT_TIMEOUT`](tp::ABORT_TIMEOUT) and the next transfer queued
/// for the same peer starts.
pub const TP_RESPONSE_TIMEOUT_MS: u64 = 1250;

/// Recommended timeout for sending a single CAN frame (ms).
///
/// Prevents indefinite blocking when the bus is faulty, disconnected, or saturated.
///
/// # Implementation notes
///
/// [`CanBus`](traits::can_bus::CanBus) implementations **SHOULD**
/// enforce a timeout on `send()` to avoid infinite waits.
///
/// # Example
///
/// ```rust,ignore
/// use embassy_time::{with_timeout, Duration};
/// use secure_j1939::protocol::transport::CAN_SEND_TIMEOUT_MS;
///
/// async fn send_with_timeout(&mut self, frame: &CanFrame) -> Result<(), Error> {
///     with_timeout(
///         Duration::from_millis(CAN_SEND_TIMEOUT_MS as u64),
///         self.can.transmit_async(&twai_frame)
///     )
///     .await
///     .map_err(|_| Error::Timeout)?
/// }
/// ```
pub const CAN_SEND_TIMEOUT_MS: u32 = 100;
