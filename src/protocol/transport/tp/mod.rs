//! SAE J1939-21 transport protocol: connection management (TP.CM) codec,
//! destination classes, and the reassembly/fragmentation state machines.
//!
//! ```text
//! BAM   [32, size_lo, size_hi, packets, 0xFF,  pgn0, pgn1, pgn2]
//! RTS   [16, size_lo, size_hi, packets, burst, pgn0, pgn1, pgn2]
//! CTS   [17, window,  next,    0xFF,    0xFF,  pgn0, pgn1, pgn2]
//! EOMA  [19, size_lo, size_hi, packets, 0xFF,  pgn0, pgn1, pgn2]
//! Abort [255, reason, 0xFF,    0xFF,    0xFF,  pgn0, pgn1, pgn2]
//! TP.DT [seq, 7 payload bytes]
//! ```
use crate::core::MAX_MESSAGE_LENGTH;
use crate::error::{CanIdBuildError, TransportError};
use crate::protocol::transport::{can_frame::CanFrame, can_id::CanId, TP_CM_PGN};
use crate::protocol::{GLOBAL_ADDRESS, NORMAL_PRIORITY};

pub mod fragmenter;
pub mod reassembler;

//==================================================================================Constants
pub const CM_REQUEST_TO_SEND: u8 = 16;
pub const CM_CLEAR_TO_SEND: u8 = 17;
pub const CM_END_OF_MESSAGE_ACK: u8 = 19;
pub const CM_BAM: u8 = 32;
pub const CM_ABORT: u8 = 255;

/// Abort reason: the other side stopped answering.
pub const ABORT_TIMEOUT: u8 = 3;

/// Payload bytes carried by one TP.DT frame.
pub const TP_PACKET_PAYLOAD: usize = 7;
/// Highest packet count a transfer can announce.
pub const MAX_TP_PACKETS: usize = MAX_MESSAGE_LENGTH / TP_PACKET_PAYLOAD;
/// RTS "maximum packets per CTS" value meaning no limit.
pub const NO_BURST_LIMIT: u8 = 0xFF;

/// Number of TP.DT frames needed for `len` bytes.
#[inline]
pub const fn packet_count(len: usize) -> usize {
    len.div_ceil(TP_PACKET_PAYLOAD)
}

//==================================================================================DestinationClass
/// How a frame is addressed relative to this device. Transport state is
/// kept separately for each class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DestinationClass {
    /// Global address or PDU2 traffic.
    Broadcast,
    /// Exactly this device's address.
    ToSelf,
    /// This device's address with the top bit cleared.
    ToSelfMasked,
}

impl DestinationClass {
    pub const COUNT: usize = 3;

    /// Classify `destination`; `None` means the frame is for someone else.
    pub fn classify(destination: u8, self_address: u8) -> Option<Self> {
        if destination == GLOBAL_ADDRESS {
            Some(Self::Broadcast)
        } else if destination == self_address {
            Some(Self::ToSelf)
        } else if destination == self_address & 0x7F {
            Some(Self::ToSelfMasked)
        } else {
            None
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::Broadcast => 0,
            Self::ToSelf => 1,
            Self::ToSelfMasked => 2,
        }
    }
}

//==================================================================================TpControl
/// Decoded TP.CM frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TpControl {
    Bam {
        total_bytes: u16,
        total_packets: u8,
        pgn: u32,
    },
    RequestToSend {
        total_bytes: u16,
        total_packets: u8,
        max_burst: u8,
        pgn: u32,
    },
    ClearToSend {
        packets: u8,
        /// Next packet expected by the receiver. `0` asks for the first packet.
        next_packet: u8,
        pgn: u32,
    },
    EndOfMessageAck {
        total_bytes: u16,
        total_packets: u8,
        pgn: u32,
    },
    Abort {
        reason: u8,
        pgn: u32,
    },
}

impl TpControl {
    /// Decode the eight bytes of a TP.CM frame.
    pub fn parse(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < 8 {
            return Err(TransportError::MalformedControl);
        }
        let size = u16::from_le_bytes([data[1], data[2]]);
        let pgn = u32::from_le_bytes([data[5], data[6], data[7], 0]);

        match data[0] {
            CM_BAM => Ok(Self::Bam {
                total_bytes: size,
                total_packets: data[3],
                pgn,
            }),
            CM_REQUEST_TO_SEND => Ok(Self::RequestToSend {
                total_bytes: size,
                total_packets: data[3],
                max_burst: data[4],
                pgn,
            }),
            CM_CLEAR_TO_SEND => Ok(Self::ClearToSend {
                packets: data[1],
                next_packet: data[2],
                pgn,
            }),
            CM_END_OF_MESSAGE_ACK => Ok(Self::EndOfMessageAck {
                total_bytes: size,
                total_packets: data[3],
                pgn,
            }),
            CM_ABORT => Ok(Self::Abort {
                reason: data[1],
                pgn,
            }),
            _ => Err(TransportError::MalformedControl),
        }
    }

    /// Encode into the eight TP.CM bytes.
    pub fn encode(&self) -> [u8; 8] {
        let mut data = [0xFF; 8];
        match *self {
            Self::Bam {
                total_bytes,
                total_packets,
                ..
            } => {
                data[0] = CM_BAM;
                data[1..3].copy_from_slice(&total_bytes.to_le_bytes());
                data[3] = total_packets;
            }
            Self::RequestToSend {
                total_bytes,
                total_packets,
                max_burst,
                ..
            } => {
                data[0] = CM_REQUEST_TO_SEND;
                data[1..3].copy_from_slice(&total_bytes.to_le_bytes());
                data[3] = total_packets;
                data[4] = max_burst;
            }
            Self::ClearToSend {
                packets,
                next_packet,
                ..
            } => {
                data[0] = CM_CLEAR_TO_SEND;
                data[1] = packets;
                data[2] = next_packet;
            }
            Self::EndOfMessageAck {
                total_bytes,
                total_packets,
                ..
            } => {
                data[0] = CM_END_OF_MESSAGE_ACK;
                data[1..3].copy_from_slice(&total_bytes.to_le_bytes());
                data[3] = total_packets;
            }
            Self::Abort { reason, .. } => {
                data[0] = CM_ABORT;
                data[1] = reason;
            }
        }
        data[5..8].copy_from_slice(&self.pgn().to_le_bytes()[..3]);
        data
    }

    /// PGN of the transferred message.
    pub fn pgn(&self) -> u32 {
        match *self {
            Self::Bam { pgn, .. }
            | Self::RequestToSend { pgn, .. }
            | Self::ClearToSend { pgn, .. }
            | Self::EndOfMessageAck { pgn, .. }
            | Self::Abort { pgn, .. } => pgn,
        }
    }

    /// Build the TP.CM frame carrying this control message.
    pub fn to_frame(&self, source: u8, destination: u8) -> Result<CanFrame, CanIdBuildError> {
        let id = CanId::builder(TP_CM_PGN, source)
            .with_priority(NORMAL_PRIORITY)
            .to_destination(destination)
            .build()?;
        CanFrame::from_payload(id, &self.encode())
    }
}
