//! Application messages handled by the stack itself: the Request PGN and the
//! Component Identification answer it can trigger.
use crate::core::PayloadBuffer;
use crate::error::ConfigError;

/// Request (PGN 59904): three-byte little-endian PGN of the requested group.
pub const REQUEST_PGN: u32 = 59904;
/// Component Identification (PGN 65259).
pub const COMPONENT_ID_PGN: u32 = 65259;

/// Longest model string accepted in the identity.
pub const MODEL_MAX_LEN: usize = 13;
/// Longest serial number accepted in the identity.
pub const SERIAL_MAX_LEN: usize = 18;
/// `"CSU*" model "*" serial "*"`.
pub const COMPONENT_ID_MAX_LEN: usize = 4 + MODEL_MAX_LEN + 1 + SERIAL_MAX_LEN + 1;

const MAKE: &[u8] = b"CSU";

//==================================================================================Request
/// PGN asked for by a Request frame.
pub fn requested_pgn(data: &[u8]) -> Option<u32> {
    match data {
        [b0, b1, b2, ..] => Some(u32::from_le_bytes([*b0, *b1, *b2, 0])),
        _ => None,
    }
}

//==================================================================================ComponentIdentity
/// Model and serial number reported in the component identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentIdentity {
    model: heapless::String<MODEL_MAX_LEN>,
    serial: heapless::String<SERIAL_MAX_LEN>,
}

impl ComponentIdentity {
    pub fn new(model: &str, serial: &str) -> Result<Self, ConfigError> {
        let mut identity = Self {
            model: heapless::String::new(),
            serial: heapless::String::new(),
        };
        // '*' is the field delimiter.
        if model.contains('*') || serial.contains('*') {
            return Err(ConfigError::InvalidIdentity);
        }
        identity
            .model
            .push_str(model)
            .map_err(|_| ConfigError::InvalidIdentity)?;
        identity
            .serial
            .push_str(serial)
            .map_err(|_| ConfigError::InvalidIdentity)?;
        Ok(identity)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Component ID payload: make, model, serial, each closed by `*`.
    pub fn payload(&self) -> PayloadBuffer<COMPONENT_ID_MAX_LEN> {
        let mut payload = PayloadBuffer::new();
        // Field limits keep the total within capacity.
        payload.extend_from_slice(MAKE);
        payload.extend_from_slice(b"*");
        payload.extend_from_slice(self.model.as_bytes());
        payload.extend_from_slice(b"*");
        payload.extend_from_slice(self.serial.as_bytes());
        payload.extend_from_slice(b"*");
        payload
    }
}
