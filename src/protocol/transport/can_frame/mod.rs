//! In-memory representation of an SAE J1939 CAN frame, plus the sink the
//! synchronous stack writes its outbound frames into.
use crate::error::{CanIdBuildError, SinkFull};
use crate::protocol::transport::can_id::CanId;

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Raw J1939 frame as read from the CAN bus.
pub struct CanFrame {
    /// Full 29-bit CAN identifier stored inside a `u32`.
    pub id: CanId,
    /// Payload buffer. Classic CAN frames always provide eight bytes.
    pub data: [u8; 8],
    /// Number of valid payload bytes (Data Length Code, 0 to 8).
    pub len: usize,
}

impl CanFrame {
    /// Build a frame from an identifier and up to eight payload bytes.
    /// Unused bytes are padded with `0xFF`.
    pub fn from_payload(id: CanId, payload: &[u8]) -> Result<Self, CanIdBuildError> {
        if payload.len() > 8 {
            return Err(CanIdBuildError::InvalidData);
        }
        let mut data = [0xFF; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            data,
            len: payload.len(),
        })
    }

    /// Valid payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len.min(8)]
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<embedded_can::Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            embedded_can::Id::Extended(eid) => {
                CanFrame::from_payload(CanId(eid.as_raw()), data).ok()
            }
            // J1939 only runs on 29-bit identifiers.
            embedded_can::Id::Standard(_) => None,
        }
    }

    fn new_remote(_id: impl Into<embedded_can::Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        true
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> embedded_can::Id {
        match embedded_can::ExtendedId::new(self.id.0 & 0x1FFF_FFFF) {
            Some(eid) => embedded_can::Id::Extended(eid),
            None => embedded_can::Id::Extended(embedded_can::ExtendedId::ZERO),
        }
    }

    fn dlc(&self) -> usize {
        self.len
    }

    fn data(&self) -> &[u8] {
        self.payload()
    }
}

/// Destination for frames produced while one inbound frame is processed.
pub trait FrameSink {
    /// Queue a frame for transmission.
    fn emit(&mut self, frame: CanFrame) -> Result<(), SinkFull>;
}

impl<const N: usize> FrameSink for heapless::Vec<CanFrame, N> {
    fn emit(&mut self, frame: CanFrame) -> Result<(), SinkFull> {
        self.push(frame).map_err(|_| SinkFull)
    }
}

impl<const N: usize> FrameSink for heapless::Deque<CanFrame, N> {
    fn emit(&mut self, frame: CanFrame) -> Result<(), SinkFull> {
        self.push_back(frame).map_err(|_| SinkFull)
    }
}
