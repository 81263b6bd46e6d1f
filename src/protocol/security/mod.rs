//! Security layer carried by the DM18 parameter group: session key exchange,
//! frame authentication and session confirmation.
//!
//! ```text
//! [len, type, data...]
//! public key    type 0x04  len 0 (request) | 64 (raw P-256 point)
//! session key   type 0x02  len 0 (request) | 16 + IV (up to 10)
//! CMAC          type 0x05  len 6
//! confirmation  type 0x06  len 16
//! reset         type 0x0F  len 0
//! ```
use crate::core::PayloadBuffer;
use crate::error::SecurityError;

pub mod crypto;
pub mod router;
pub mod session;

//==================================================================================Constants
/// DM18, used as the carrier of every security message.
pub const DM18_PGN: u32 = 54272;

pub const DM18_SESSION_KEY_TYPE: u8 = 0x02;
pub const DM18_PUBLIC_KEY_TYPE: u8 = 0x04;
pub const DM18_CMAC_TYPE: u8 = 0x05;
pub const DM18_CONFIRMATION_TYPE: u8 = 0x06;
pub const DM18_RESET_TYPE: u8 = 0x0F;

/// Priority of authenticator frames. Every other security frame uses the
/// normal priority.
pub const AUTHENTICATOR_PRIORITY: u8 = 0;

pub const PUBLIC_KEY_LEN: usize = 64;
pub const SESSION_KEY_LEN: usize = 16;
pub const IV_LEN: usize = 10;
pub const TAG_LEN: usize = 6;
pub const CONFIRMATION_LEN: usize = 16;

/// Largest encoded security message (public key response).
pub const MAX_SECURITY_MESSAGE_LEN: usize = 2 + PUBLIC_KEY_LEN;

pub type SecurityPayload = PayloadBuffer<MAX_SECURITY_MESSAGE_LEN>;

//==================================================================================SecurityMessage
/// Decoded DM18 security message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityMessage {
    PublicKeyRequest,
    PublicKey([u8; PUBLIC_KEY_LEN]),
    SessionKeyRequest,
    /// Session key wrapped under the key agreement secret, followed by the IV.
    SessionKey {
        encrypted_key: [u8; SESSION_KEY_LEN],
        iv: [u8; IV_LEN],
        iv_len: u8,
    },
    Authenticator([u8; TAG_LEN]),
    Confirmation([u8; CONFIRMATION_LEN]),
    Reset,
}

impl SecurityMessage {
    /// Decode a DM18 payload (single frame or reassembled).
    pub fn decode(data: &[u8]) -> Result<Self, SecurityError> {
        if data.len() < 2 {
            return Err(SecurityError::Malformed);
        }
        let len = data[0];
        let kind = data[1];
        let body = &data[2..];
        if body.len() < len as usize {
            return Err(SecurityError::Malformed);
        }
        let body = &body[..len as usize];
        let invalid = SecurityError::InvalidLength { kind, len };

        match kind {
            DM18_PUBLIC_KEY_TYPE => match body.len() {
                0 => Ok(Self::PublicKeyRequest),
                PUBLIC_KEY_LEN => {
                    let mut key = [0u8; PUBLIC_KEY_LEN];
                    key.copy_from_slice(body);
                    Ok(Self::PublicKey(key))
                }
                _ => Err(invalid),
            },
            DM18_SESSION_KEY_TYPE => {
                if body.is_empty() {
                    return Ok(Self::SessionKeyRequest);
                }
                if body.len() < SESSION_KEY_LEN || body.len() > SESSION_KEY_LEN + IV_LEN {
                    return Err(invalid);
                }
                let mut encrypted_key = [0u8; SESSION_KEY_LEN];
                encrypted_key.copy_from_slice(&body[..SESSION_KEY_LEN]);
                let iv_bytes = &body[SESSION_KEY_LEN..];
                let mut iv = [0u8; IV_LEN];
                iv[..iv_bytes.len()].copy_from_slice(iv_bytes);
                Ok(Self::SessionKey {
                    encrypted_key,
                    iv,
                    iv_len: iv_bytes.len() as u8,
                })
            }
            DM18_CMAC_TYPE => {
                if body.len() != TAG_LEN {
                    return Err(invalid);
                }
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(body);
                Ok(Self::Authenticator(tag))
            }
            DM18_CONFIRMATION_TYPE => {
                if body.len() != CONFIRMATION_LEN {
                    return Err(invalid);
                }
                let mut block = [0u8; CONFIRMATION_LEN];
                block.copy_from_slice(body);
                Ok(Self::Confirmation(block))
            }
            DM18_RESET_TYPE => Ok(Self::Reset),
            _ => Err(SecurityError::UnsupportedType { kind }),
        }
    }

    /// Encode as `[len, type, data...]`.
    pub fn encode(&self) -> SecurityPayload {
        let mut out = SecurityPayload::new();
        // Capacity covers the largest variant, pushes cannot fail.
        match self {
            Self::PublicKeyRequest => {
                out.extend_from_slice(&[0, DM18_PUBLIC_KEY_TYPE]);
            }
            Self::PublicKey(key) => {
                out.extend_from_slice(&[PUBLIC_KEY_LEN as u8, DM18_PUBLIC_KEY_TYPE]);
                out.extend_from_slice(key);
            }
            Self::SessionKeyRequest => {
                out.extend_from_slice(&[0, DM18_SESSION_KEY_TYPE]);
            }
            Self::SessionKey {
                encrypted_key,
                iv,
                iv_len,
            } => {
                let iv = &iv[..(*iv_len as usize).min(IV_LEN)];
                out.extend_from_slice(&[(SESSION_KEY_LEN + iv.len()) as u8, DM18_SESSION_KEY_TYPE]);
                out.extend_from_slice(encrypted_key);
                out.extend_from_slice(iv);
            }
            Self::Authenticator(tag) => {
                out.extend_from_slice(&[TAG_LEN as u8, DM18_CMAC_TYPE]);
                out.extend_from_slice(tag);
            }
            Self::Confirmation(block) => {
                out.extend_from_slice(&[CONFIRMATION_LEN as u8, DM18_CONFIRMATION_TYPE]);
                out.extend_from_slice(block);
            }
            Self::Reset => {
                out.extend_from_slice(&[0, DM18_RESET_TYPE]);
            }
        }
        out
    }

    /// DM18 sub-type byte.
    pub fn kind(&self) -> u8 {
        match self {
            Self::PublicKeyRequest | Self::PublicKey(_) => DM18_PUBLIC_KEY_TYPE,
            Self::SessionKeyRequest | Self::SessionKey { .. } => DM18_SESSION_KEY_TYPE,
            Self::Authenticator(_) => DM18_CMAC_TYPE,
            Self::Confirmation(_) => DM18_CONFIRMATION_TYPE,
            Self::Reset => DM18_RESET_TYPE,
        }
    }

    /// Frame priority used on the wire.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Authenticator(_) => AUTHENTICATOR_PRIORITY,
            _ => crate::protocol::NORMAL_PRIORITY,
        }
    }
}
