//! `secure-j1939` library: a `no_std` SAE J1939 stack with the transport
//! protocol (BAM and RTS/CTS) and a DM18-based security layer performing
//! per-peer session-key exchange and continuous CMAC authentication of the
//! frames exchanged with each peer.
#![no_std]
//==================================================================================
/// Shared buffer types and the reassembled J1939 message.
pub mod core;
/// Device configuration: addresses, identity, non-volatile image layout.
pub mod config;
/// Domain and low-level errors (CAN identifier construction, transport,
/// security, configuration).
pub mod error;
/// J1939 protocol implementation: CAN transport, transport protocol,
/// address registry, security sessions, and the runtime surfaces.
pub mod protocol;
//==================================================================================
