//! Sending side of the J1939 transport protocol. Broadcast transfers are
//! produced in one go (BAM + data frames); connection-mode transfers are kept
//! per peer until the receiver's CTS frames have pulled every packet, or until
//! the receiver stays silent for longer than [`TP_RESPONSE_TIMEOUT_MS`].
use embassy_time::{Duration, Instant};

use crate::core::{PayloadBuffer, MAX_MESSAGE_LENGTH};
use crate::error::{CanIdBuildError, TransportError};
use crate::protocol::managment::address_registry::{PeerIndex, N_SOURCE_ADDRESSES};
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::can_id::CanId;
use crate::protocol::transport::tp::{
    packet_count, TpControl, ABORT_TIMEOUT, NO_BURST_LIMIT, TP_PACKET_PAYLOAD,
};
use crate::protocol::transport::{TP_DT_PGN, TP_RESPONSE_TIMEOUT_MS};
use crate::protocol::{GLOBAL_ADDRESS, NORMAL_PRIORITY};

/// Connection-mode transfers that can wait behind active ones, all peers together.
pub const MAX_WAITING_TRANSFERS: usize = 4;

//==================================================================================DataFrames
/// Lazy iterator over a range of TP.DT frames of one payload.
pub struct DataFrames<'a> {
    payload: &'a [u8],
    source_address: u8,
    destination: u8,
    /// Next sequence number to produce (1-based).
    next_sequence: u8,
    /// Last sequence number included in the range.
    last_sequence: u8,
}

impl<'a> DataFrames<'a> {
    fn new(payload: &'a [u8], source_address: u8, destination: u8, first: u8, last: u8) -> Self {
        Self {
            payload,
            source_address,
            destination,
            next_sequence: first,
            last_sequence: last,
        }
    }

    fn empty(payload: &'a [u8], source_address: u8, destination: u8) -> Self {
        Self::new(payload, source_address, destination, 1, 0)
    }
}

impl<'a> Iterator for DataFrames<'a> {
    type Item = Result<CanFrame, CanIdBuildError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_sequence == 0 || self.next_sequence > self.last_sequence {
            return None;
        }
        let sequence = self.next_sequence;
        // Sequence 255 is the last possible packet; 0 marks the range as exhausted.
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let id = match CanId::builder(TP_DT_PGN, self.source_address)
            .with_priority(NORMAL_PRIORITY)
            .to_destination(self.destination)
            .build()
        {
            Ok(id) => id,
            Err(e) => return Some(Err(e)),
        };

        let start = (sequence as usize - 1) * TP_PACKET_PAYLOAD;
        let end = (start + TP_PACKET_PAYLOAD).min(self.payload.len());
        // Final frame is zero padded.
        let mut data = [0u8; 8];
        data[0] = sequence;
        if start < end {
            data[1..1 + end - start].copy_from_slice(&self.payload[start..end]);
        }

        Some(Ok(CanFrame { id, data, len: 8 }))
    }
}

//==================================================================================Transfers
/// Announcement and data frames of a broadcast transfer.
pub struct BroadcastTransfer<'a> {
    pub announce: CanFrame,
    pub data: DataFrames<'a>,
}

/// Connection-mode transfer dropped because the receiver went quiet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredTransfer {
    pub destination: u8,
    pub pgn: u32,
    /// TP.CM Abort (reason timeout) to send to the receiver.
    pub abort: CanFrame,
    /// RTS of the transfer promoted in its place, if one was queued.
    pub next: Option<CanFrame>,
}

/// Connection-mode send in progress. Dropped on EOMA, abort or timeout.
#[derive(Debug, Clone)]
struct OutboundTransfer {
    destination: u8,
    pgn: u32,
    total_packets: u8,
    packets_sent: u8,
    /// RTS or last CTS; the response timeout counts from here.
    last_activity: Instant,
    payload: PayloadBuffer<MAX_MESSAGE_LENGTH>,
}

impl OutboundTransfer {
    fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity)
            > Duration::from_millis(TP_RESPONSE_TIMEOUT_MS)
    }

    fn request(&self, source_address: u8) -> Result<CanFrame, CanIdBuildError> {
        TpControl::RequestToSend {
            total_bytes: self.payload.len() as u16,
            total_packets: self.total_packets,
            max_burst: NO_BURST_LIMIT,
            pgn: self.pgn,
        }
        .to_frame(source_address, self.destination)
    }
}

//==================================================================================TransportFragmenter
/// Sending side of the transport protocol. One connection-mode transfer is
/// active per peer; later ones wait in a shared queue until the active one
/// is acknowledged or aborted.
pub struct TransportFragmenter {
    self_address: u8,
    active: [Option<OutboundTransfer>; N_SOURCE_ADDRESSES],
    waiting: heapless::Vec<(PeerIndex, OutboundTransfer), MAX_WAITING_TRANSFERS>,
}

impl TransportFragmenter {
    pub const fn new(self_address: u8) -> Self {
        const NONE: Option<OutboundTransfer> = None;
        Self {
            self_address,
            active: [NONE; N_SOURCE_ADDRESSES],
            waiting: heapless::Vec::new(),
        }
    }

    /// Build a BAM transfer to the global address. Frames are meant to be
    /// sent back to back, with the usual inter-packet delay.
    pub fn broadcast<'a>(
        &self,
        pgn: u32,
        payload: &'a [u8],
    ) -> Result<BroadcastTransfer<'a>, TransportError> {
        let total_packets = check_payload(payload)?;
        let announce = TpControl::Bam {
            total_bytes: payload.len() as u16,
            total_packets,
            pgn,
        }
        .to_frame(self.self_address, GLOBAL_ADDRESS)?;

        #[cfg(feature = "defmt")]
        defmt::trace!("BAM PGN {}: {} bytes", pgn, payload.len());

        Ok(BroadcastTransfer {
            announce,
            data: DataFrames::new(
                payload,
                self.self_address,
                GLOBAL_ADDRESS,
                1,
                total_packets,
            ),
        })
    }

    /// Start a connection-mode transfer to `destination`. Returns the RTS to
    /// send, or `None` when the transfer was queued behind an active one.
    pub fn open(
        &mut self,
        peer: PeerIndex,
        destination: u8,
        pgn: u32,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<CanFrame>, TransportError> {
        let total_packets = check_payload(payload)?;
        let transfer = OutboundTransfer {
            destination,
            pgn,
            total_packets,
            packets_sent: 0,
            last_activity: now,
            payload: PayloadBuffer::from_slice(payload),
        };

        if self.active[peer.get()].is_some() {
            #[cfg(feature = "defmt")]
            defmt::debug!("Transfer of PGN {} to {:02X} queued", pgn, destination);
            return self
                .waiting
                .push((peer, transfer))
                .map(|_| None)
                .map_err(|_| TransportError::QueueFull);
        }

        let request = transfer.request(self.self_address)?;
        self.active[peer.get()] = Some(transfer);
        Ok(Some(request))
    }

    /// Data frames permitted by a CTS from `peer`. `next_packet` 0 and 1 both
    /// designate the first packet; `packets` 0 holds the transfer.
    pub fn clear_to_send(
        &mut self,
        peer: PeerIndex,
        packets: u8,
        next_packet: u8,
        pgn: u32,
        now: Instant,
    ) -> Result<DataFrames<'_>, TransportError> {
        let source_address = self.self_address;
        let transfer = match self.active[peer.get()].as_mut() {
            Some(transfer) if transfer.pgn == pgn => transfer,
            _ => return Err(TransportError::NoPendingTransfer { pgn }),
        };
        transfer.last_activity = now;

        let first = next_packet.max(1);
        if packets == 0 || first > transfer.total_packets {
            return Ok(DataFrames::empty(
                transfer.payload.as_slice(),
                source_address,
                transfer.destination,
            ));
        }

        let last = first
            .saturating_add(packets - 1)
            .min(transfer.total_packets);
        transfer.packets_sent = transfer.packets_sent.max(last);

        Ok(DataFrames::new(
            transfer.payload.as_slice(),
            source_address,
            transfer.destination,
            first,
            last,
        ))
    }

    /// Close the transfer acknowledged by an EOMA and return the RTS of the
    /// next queued transfer to the same peer, if any.
    pub fn end_of_message(
        &mut self,
        peer: PeerIndex,
        pgn: u32,
        now: Instant,
    ) -> Result<Option<CanFrame>, TransportError> {
        if !matches!(&self.active[peer.get()], Some(transfer) if transfer.pgn == pgn) {
            return Err(TransportError::NoPendingTransfer { pgn });
        }
        #[cfg(feature = "defmt")]
        defmt::trace!("Transfer of PGN {} acknowledged", pgn);
        self.active[peer.get()] = None;
        self.promote(peer.get(), now)
    }

    /// Abort received from `peer`: drop the active transfer and start the
    /// next queued one, if any.
    pub fn abort(
        &mut self,
        peer: PeerIndex,
        pgn: u32,
        now: Instant,
    ) -> Result<Option<CanFrame>, TransportError> {
        if !matches!(&self.active[peer.get()], Some(transfer) if transfer.pgn == pgn) {
            return Err(TransportError::NoPendingTransfer { pgn });
        }
        #[cfg(feature = "defmt")]
        defmt::warn!("Transfer of PGN {} aborted by receiver", pgn);
        self.active[peer.get()] = None;
        self.promote(peer.get(), now)
    }

    /// Drop the first active transfer whose receiver has been silent for
    /// longer than [`TP_RESPONSE_TIMEOUT_MS`]. Call until it returns `None`.
    pub fn expire_next(&mut self, now: Instant) -> Result<Option<ExpiredTransfer>, TransportError> {
        let slot = match self
            .active
            .iter()
            .position(|active| active.as_ref().is_some_and(|transfer| transfer.is_stale(now)))
        {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let transfer = match self.active[slot].take() {
            Some(transfer) => transfer,
            None => return Ok(None),
        };

        #[cfg(feature = "defmt")]
        defmt::warn!(
            "Transfer of PGN {} to {:02X} timed out",
            transfer.pgn,
            transfer.destination
        );
        let abort = TpControl::Abort {
            reason: ABORT_TIMEOUT,
            pgn: transfer.pgn,
        }
        .to_frame(self.self_address, transfer.destination)?;
        let next = self.promote(slot, now)?;
        Ok(Some(ExpiredTransfer {
            destination: transfer.destination,
            pgn: transfer.pgn,
            abort,
            next,
        }))
    }

    /// Forget every transfer bound to `peer` (index reassigned to another
    /// address, or secure session torn down).
    pub fn cancel(&mut self, peer: PeerIndex) {
        self.active[peer.get()] = None;
        self.waiting.retain(|(waiting_peer, _)| *waiting_peer != peer);
    }

    /// Highest packet number released so far by CTS frames from `peer`.
    pub fn packets_sent(&self, peer: PeerIndex) -> Option<u8> {
        self.active[peer.get()]
            .as_ref()
            .map(|transfer| transfer.packets_sent)
    }

    /// `true` while a connection-mode transfer to `peer` is waiting for CTS/EOMA.
    pub fn is_pending(&self, peer: PeerIndex) -> bool {
        self.active[peer.get()].is_some()
    }

    /// Number of transfers queued behind active ones.
    pub fn queued(&self) -> usize {
        self.waiting.len()
    }

    /// Start the oldest transfer queued for the peer in `slot`.
    fn promote(&mut self, slot: usize, now: Instant) -> Result<Option<CanFrame>, TransportError> {
        let position = match self.waiting.iter().position(|(peer, _)| peer.get() == slot) {
            Some(position) => position,
            None => return Ok(None),
        };
        let (_, mut transfer) = self.waiting.remove(position);
        transfer.last_activity = now;
        let request = transfer.request(self.self_address)?;
        self.active[slot] = Some(transfer);
        Ok(Some(request))
    }
}

/// Validate an outbound payload and return its packet count.
fn check_payload(payload: &[u8]) -> Result<u8, TransportError> {
    if payload.is_empty() {
        return Err(TransportError::EmptyPayload);
    }
    if payload.len() > MAX_MESSAGE_LENGTH {
        return Err(TransportError::PayloadTooLong { len: payload.len() });
    }
    Ok(packet_count(payload.len()) as u8)
}
