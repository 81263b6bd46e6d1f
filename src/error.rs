//! Error definitions shared across library modules.
//! Each type models a specific failure scenario (CAN ID construction,
//! transport protocol, security layer, configuration, etc.).
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Errors that can occur while building a 29-bit CAN identifier.
pub enum CanIdBuildError {
    /// Provided parameters do not produce a valid identifier.
    #[error("Invalid data")]
    InvalidData,
    /// Attempt to build a broadcast message (PDU2) with PF < 240.
    #[error("Invalid for broadcast message: PF is too low")]
    InvalidForBroadcast,
    /// Attempt to send an addressed message (PDU1) with PF ≥ 240.
    #[error("Invalid for addressed message: PF is too high: {pgn}")]
    InvalidForFocusedMessage { pgn: u8 },
    /// In PDU1 the lower 8 bits of the PGN must remain zero.
    #[error("PDU1 PGNs require PS = 0")]
    PsFocusMessageMustBeNull,
}

//==================================================================================TRANSPORT_ERROR
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Errors raised while preparing an outbound transport protocol transfer.
pub enum TransportError {
    /// Nothing to send.
    #[error("Payload is empty")]
    EmptyPayload,
    /// Payload exceeds what 255 transport packets can carry.
    #[error("Payload too long: {len} bytes")]
    PayloadTooLong { len: usize },
    /// CTS or EOMA received for a peer with no matching outbound transfer.
    #[error("No pending transfer for PGN {pgn}")]
    NoPendingTransfer { pgn: u32 },
    /// Every queue slot for waiting transfers is taken.
    #[error("Transfer queue full")]
    QueueFull,
    /// Unknown control byte or truncated TP.CM frame.
    #[error("Malformed transport control frame")]
    MalformedControl,
    /// Identifier construction failed.
    #[error(transparent)]
    Build(#[from] CanIdBuildError),
}

//==================================================================================SECURITY_ERROR
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Security layer failures. None of them is fatal: the affected session stays
/// (or falls back to) not established.
pub enum SecurityError {
    /// DM18 payload shorter than its header or its declared length.
    #[error("Malformed DM18 message")]
    Malformed,
    /// Declared length does not match the sub-type.
    #[error("Invalid length {len} for DM18 type {kind:#04x}")]
    InvalidLength { kind: u8, len: u8 },
    /// Sub-type not handled by this device.
    #[error("Unsupported DM18 type {kind:#04x}")]
    UnsupportedType { kind: u8 },
    /// The sender is not in the vehicle address list.
    #[error("No secure session for address {address}")]
    UnknownPeer { address: u8 },
    /// Key material cannot be derived before the peer public key is known.
    #[error("Peer public key missing")]
    MissingPeerPublicKey,
    /// The 64 bytes received are not a point on the curve.
    #[error("Invalid peer public key")]
    InvalidPublicKey,
    /// Device secret scalar is zero or out of range.
    #[error("Invalid device secret key")]
    InvalidSecretKey,
    /// A session key was rejected by the cipher.
    #[error("Session key decryption failed")]
    KeyDecryption,
    /// The operation requires an established session.
    #[error("Session not established")]
    NotEstablished,
    /// Received tag differs from the locally computed one.
    #[error("Authenticator mismatch")]
    AuthenticatorMismatch,
    /// Received confirmation differs from the expected one.
    #[error("Session key mismatch")]
    KeyMismatch,
}

//==================================================================================CONFIG_ERROR
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Failures while loading the device configuration.
pub enum ConfigError {
    /// Image is shorter than the documented layout.
    #[error("Configuration image too short: {len} bytes, expected {expected}")]
    ImageTooShort { len: usize, expected: usize },
    /// Address count larger than the table capacity.
    #[error("Too many addresses: {count}, capacity {capacity}")]
    TooManyAddresses { count: usize, capacity: usize },
    /// Identity field longer than its slot or containing the `*` delimiter.
    #[error("Invalid component identity field")]
    InvalidIdentity,
}

//==================================================================================OUTPUT_ERRORS
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A [`FrameSink`](crate::protocol::transport::can_frame::FrameSink) ran out of room.
#[error("Frame sink full")]
pub struct SinkFull;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Output-path failures of the synchronous stack.
pub enum StackError {
    /// An outbound frame could not be queued.
    #[error(transparent)]
    Sink(#[from] SinkFull),
    /// An outbound transfer could not be prepared.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Identifier construction failed.
    #[error(transparent)]
    Build(#[from] CanIdBuildError),
    /// A locally requested security operation failed.
    #[error(transparent)]
    Security(#[from] SecurityError),
}

//==================================================================================NODE_ERROR
#[derive(Debug, Error)]
/// Errors surfaced by the asynchronous node (stack + CAN bus).
pub enum NodeError<E: core::fmt::Debug> {
    /// Synchronous stack failure.
    #[error(transparent)]
    Stack(#[from] StackError),
    /// CAN layer refused or failed to send the frame.
    #[error("CAN bus send error: {0:?}")]
    Send(E),
    /// Unable to receive frames from the bus.
    #[error("CAN bus receive error: {0:?}")]
    Receive(E),
}
