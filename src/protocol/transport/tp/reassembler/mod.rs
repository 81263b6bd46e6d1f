//! J1939 transport protocol reassembler: rebuilds long messages from BAM or
//! RTS/CTS sequences, one state machine per (peer, destination class) pair,
//! and produces the receiver-side control frames (CTS, End Of Message Ack).
use crate::core::{J1939Message, MAX_MESSAGE_LENGTH};
use crate::error::CanIdBuildError;
use crate::protocol::managment::address_registry::{PeerIndex, N_SOURCE_ADDRESSES};
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::tp::{
    packet_count, DestinationClass, TpControl, NO_BURST_LIMIT, TP_PACKET_PAYLOAD,
};

//==================================================================================Enums and Structs
/// Identifies the state machine a transport frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportPair {
    pub peer: PeerIndex,
    pub class: DestinationClass,
    /// Address of the sending peer.
    pub source_address: u8,
    /// Destination carried by the frame identifier.
    pub destination_address: u8,
}

/// Protocol faults detected while reassembling. The offending frame is
/// dropped and the pair returns to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportFault {
    /// Data frame sequence outside the announced transfer.
    SequenceOutOfRange { sequence: u8, total_packets: u8 },
    /// Announced packet count inconsistent with the byte count or buffer size.
    PacketCountMismatch { total_bytes: u16, total_packets: u8 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReassemblyResult {
    /// Frame not relevant to any transfer (idle pair, sending-side control,
    /// packet already received).
    Ignored,
    /// Control frame accepted; nothing to transmit.
    ControlConsumed,
    /// Control frame to send back to the peer (Clear To Send).
    Reply(CanFrame),
    /// Data frame stored, more expected.
    FragmentConsumed,
    /// Transfer finished. `ack` is the End Of Message Ack to send, if any.
    MessageComplete {
        message: J1939Message,
        ack: Option<CanFrame>,
    },
    /// Frame dropped, pair reset to idle.
    Fault(TransportFault),
}

/// Reception mode of a pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TransferMode {
    Idle,
    ReceivingBam,
    ReceivingRtsCts,
}

/// Reassembly state of one (peer, destination class) pair.
#[derive(Debug, Clone, Copy)]
struct TransportState {
    mode: TransferMode,
    packets_received: u8,
    /// One bit per sequence number already stored.
    received: [u32; 8],
    total_packets: u8,
    total_bytes: u16,
    target_pgn: u32,
    destination_address: u8,
    max_burst: u8,
    /// Packets still allowed by the last CTS we issued.
    window_remaining: u8,
    buffer: [u8; MAX_MESSAGE_LENGTH],
}

impl TransportState {
    const fn new() -> Self {
        Self {
            mode: TransferMode::Idle,
            packets_received: 0,
            received: [0; 8],
            total_packets: 0,
            total_bytes: 0,
            target_pgn: 0,
            destination_address: 0,
            max_burst: NO_BURST_LIMIT,
            window_remaining: 0,
            buffer: [0xFF; MAX_MESSAGE_LENGTH],
        }
    }

    fn reset(&mut self) {
        self.mode = TransferMode::Idle;
        self.packets_received = 0;
        self.received = [0; 8];
        self.total_packets = 0;
        self.total_bytes = 0;
        self.window_remaining = 0;
        // Buffer is refilled when the next transfer starts.
    }

    fn start(
        &mut self,
        mode: TransferMode,
        total_bytes: u16,
        total_packets: u8,
        pgn: u32,
        destination_address: u8,
    ) {
        self.mode = mode;
        self.packets_received = 0;
        self.received = [0; 8];
        self.total_packets = total_packets;
        self.total_bytes = total_bytes;
        self.target_pgn = pgn;
        self.destination_address = destination_address;
        self.buffer.fill(0xFF);
    }

    /// Record `sequence`; `false` when it was already received.
    fn mark_received(&mut self, sequence: u8) -> bool {
        let word = &mut self.received[sequence as usize / 32];
        let bit = 1u32 << (sequence % 32);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        true
    }

    fn next_window(&self) -> u8 {
        let remaining = self.total_packets - self.packets_received;
        let burst = if self.max_burst == 0 {
            NO_BURST_LIMIT
        } else {
            self.max_burst
        };
        remaining.min(burst)
    }
}

/// Receiver side of the transport protocol for every known peer.
pub struct TransportReassembler {
    self_address: u8,
    states: [[TransportState; DestinationClass::COUNT]; N_SOURCE_ADDRESSES],
}

impl TransportReassembler {
    pub const fn new(self_address: u8) -> Self {
        Self {
            self_address,
            states: [[TransportState::new(); DestinationClass::COUNT]; N_SOURCE_ADDRESSES],
        }
    }

    /// `true` when no transfer is in progress for the pair.
    pub fn is_idle(&self, peer: PeerIndex, class: DestinationClass) -> bool {
        self.state(peer, class).mode == TransferMode::Idle
    }

    /// Packets received so far for the pair.
    pub fn packets_received(&self, peer: PeerIndex, class: DestinationClass) -> u8 {
        self.state(peer, class).packets_received
    }

    /// Drop every transfer bound to `peer` (index reassigned to another address).
    pub fn reset_peer(&mut self, peer: PeerIndex) {
        for state in self.states[peer.get()].iter_mut() {
            state.reset();
        }
    }

    //==================================================================================Process Functions
    /// Apply a TP.CM frame received from `pair.source_address`.
    pub fn process_control(
        &mut self,
        pair: &TransportPair,
        control: &TpControl,
    ) -> Result<ReassemblyResult, CanIdBuildError> {
        let self_address = self.self_address;
        let state = self.state_mut(pair.peer, pair.class);

        match *control {
            TpControl::Bam {
                total_bytes,
                total_packets,
                pgn,
            } => {
                if let Some(fault) = check_announcement(total_bytes, total_packets) {
                    state.reset();
                    return Ok(fault_result(fault));
                }
                #[cfg(feature = "defmt")]
                defmt::trace!(
                    "BAM from {:02X}: {} bytes, {} packets, PGN {}",
                    pair.source_address,
                    total_bytes,
                    total_packets,
                    pgn
                );
                state.start(
                    TransferMode::ReceivingBam,
                    total_bytes,
                    total_packets,
                    pgn,
                    pair.destination_address,
                );
                Ok(ReassemblyResult::ControlConsumed)
            }
            TpControl::RequestToSend {
                total_bytes,
                total_packets,
                max_burst,
                pgn,
            } => {
                if let Some(fault) = check_announcement(total_bytes, total_packets) {
                    state.reset();
                    return Ok(fault_result(fault));
                }
                state.start(
                    TransferMode::ReceivingRtsCts,
                    total_bytes,
                    total_packets,
                    pgn,
                    pair.destination_address,
                );
                state.max_burst = max_burst;

                if pair.class != DestinationClass::ToSelf {
                    return Ok(ReassemblyResult::ControlConsumed);
                }

                // Only answer transfers addressed to us.
                let window = state.next_window();
                state.window_remaining = window;
                let cts = TpControl::ClearToSend {
                    packets: window,
                    next_packet: 0,
                    pgn,
                }
                .to_frame(self_address, pair.source_address)?;
                Ok(ReassemblyResult::Reply(cts))
            }
            TpControl::Abort { .. } => {
                if state.mode == TransferMode::Idle {
                    return Ok(ReassemblyResult::Ignored);
                }
                #[cfg(feature = "defmt")]
                defmt::debug!("Transfer from {:02X} aborted", pair.source_address);
                state.reset();
                Ok(ReassemblyResult::ControlConsumed)
            }
            // Sending-side control frames are handled by the fragmenter.
            TpControl::ClearToSend { .. } | TpControl::EndOfMessageAck { .. } => {
                Ok(ReassemblyResult::Ignored)
            }
        }
    }

    /// Apply a TP.DT frame received from `pair.source_address`.
    pub fn process_data(
        &mut self,
        pair: &TransportPair,
        data: &[u8],
    ) -> Result<ReassemblyResult, CanIdBuildError> {
        let self_address = self.self_address;
        let state = self.state_mut(pair.peer, pair.class);

        if state.mode == TransferMode::Idle || data.is_empty() {
            return Ok(ReassemblyResult::Ignored);
        }

        let sequence = data[0];
        if sequence == 0 || sequence > state.total_packets {
            let fault = TransportFault::SequenceOutOfRange {
                sequence,
                total_packets: state.total_packets,
            };
            state.reset();
            return Ok(fault_result(fault));
        }

        // A repeated packet would otherwise count twice and end the transfer
        // with a hole in the payload.
        if !state.mark_received(sequence) {
            #[cfg(feature = "defmt")]
            defmt::debug!(
                "Packet {} from {:02X} already received",
                sequence,
                pair.source_address
            );
            return Ok(ReassemblyResult::Ignored);
        }

        let offset = TP_PACKET_PAYLOAD * (sequence as usize - 1);
        let chunk = &data[1..data.len().min(1 + TP_PACKET_PAYLOAD)];
        let end = (offset + chunk.len()).min(MAX_MESSAGE_LENGTH);
        state.buffer[offset..end].copy_from_slice(&chunk[..end - offset]);
        state.packets_received = state.packets_received.saturating_add(1);

        let handshake = state.mode == TransferMode::ReceivingRtsCts
            && pair.class == DestinationClass::ToSelf;
        if handshake {
            state.window_remaining = state.window_remaining.saturating_sub(1);
        }

        if state.packets_received >= state.total_packets {
            let len = state.total_bytes as usize;
            let message = J1939Message::new(
                state.target_pgn,
                pair.source_address,
                state.destination_address,
                &state.buffer[..len],
            );

            let ack = if handshake {
                Some(
                    TpControl::EndOfMessageAck {
                        total_bytes: state.total_bytes,
                        total_packets: state.total_packets,
                        pgn: state.target_pgn,
                    }
                    .to_frame(self_address, pair.source_address)?,
                )
            } else {
                None
            };

            state.reset();
            return Ok(ReassemblyResult::MessageComplete { message, ack });
        }

        if handshake && state.window_remaining == 0 {
            // Window exhausted: ask for the next burst (1-based packet number).
            let window = state.next_window();
            state.window_remaining = window;
            let cts = TpControl::ClearToSend {
                packets: window,
                next_packet: state.packets_received + 1,
                pgn: state.target_pgn,
            }
            .to_frame(self_address, pair.source_address)?;
            return Ok(ReassemblyResult::Reply(cts));
        }

        Ok(ReassemblyResult::FragmentConsumed)
    }

    fn state(&self, peer: PeerIndex, class: DestinationClass) -> &TransportState {
        &self.states[peer.get()][class.index()]
    }

    fn state_mut(&mut self, peer: PeerIndex, class: DestinationClass) -> &mut TransportState {
        &mut self.states[peer.get()][class.index()]
    }
}

/// Validate the size fields of a BAM or RTS.
fn check_announcement(total_bytes: u16, total_packets: u8) -> Option<TransportFault> {
    let bytes = total_bytes as usize;
    let consistent = bytes > 0
        && bytes <= MAX_MESSAGE_LENGTH
        && packet_count(bytes) == total_packets as usize;
    if consistent {
        None
    } else {
        Some(TransportFault::PacketCountMismatch {
            total_bytes,
            total_packets,
        })
    }
}

fn fault_result(fault: TransportFault) -> ReassemblyResult {
    #[cfg(feature = "defmt")]
    defmt::warn!("Transport fault: {}", fault);
    ReassemblyResult::Fault(fault)
}
