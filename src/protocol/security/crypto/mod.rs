//! Cryptographic building blocks of the security layer: the running frame
//! authenticator (AES-128 CMAC), session key wrapping and the P-256 key
//! agreement used to derive the wrapping key.
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::elliptic_curve::rand_core::{CryptoRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};

use crate::error::SecurityError;
use crate::protocol::security::{CONFIRMATION_LEN, PUBLIC_KEY_LEN, SESSION_KEY_LEN, TAG_LEN};
use crate::protocol::transport::can_frame::CanFrame;

/// AES-128 key of an established session.
pub type SessionKey = [u8; SESSION_KEY_LEN];

/// Size of the block folded into the authenticator for every frame.
pub const FRAME_BLOCK_LEN: usize = 16;

//==================================================================================FrameAuthenticator
/// Running CMAC over the IV and every authenticated frame of a session.
///
/// Tags are computed on a copy of the accumulator, so emitting or verifying a
/// tag never disturbs the stream.
#[derive(Clone)]
pub struct FrameAuthenticator {
    mac: Cmac<Aes128>,
}

impl core::fmt::Debug for FrameAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameAuthenticator").finish_non_exhaustive()
    }
}

impl FrameAuthenticator {
    /// Key the authenticator and fold the IV as its first input.
    pub fn new(key: &SessionKey, iv: &[u8]) -> Self {
        let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
        mac.update(iv);
        Self { mac }
    }

    /// Fold one CAN frame (identifier, length, payload).
    pub fn update_frame(&mut self, frame: &CanFrame) {
        self.mac.update(&frame_block(frame));
    }

    /// Fold raw bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.mac.update(bytes);
    }

    /// Truncated tag over everything folded so far.
    pub fn tag(&self) -> [u8; TAG_LEN] {
        let full = self.mac.clone().finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        tag
    }
}

/// 16-byte block folded for a frame: identifier (little endian), DLC,
/// payload, zero padding.
pub fn frame_block(frame: &CanFrame) -> [u8; FRAME_BLOCK_LEN] {
    let mut block = [0u8; FRAME_BLOCK_LEN];
    let payload = frame.payload();
    block[..4].copy_from_slice(&frame.id.0.to_le_bytes());
    block[4] = payload.len() as u8;
    block[5..5 + payload.len()].copy_from_slice(payload);
    block
}

//==================================================================================Block helpers
fn encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buffer = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buffer);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buffer);
    out
}

fn decrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buffer = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut buffer);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buffer);
    out
}

/// Encrypt a session key under the key agreement secret (AES-128, one block).
pub fn wrap_session_key(wrapping_key: &[u8; 16], session_key: &SessionKey) -> [u8; SESSION_KEY_LEN] {
    encrypt_block(wrapping_key, session_key)
}

/// Inverse of [`wrap_session_key`].
pub fn unwrap_session_key(wrapping_key: &[u8; 16], encrypted: &[u8; SESSION_KEY_LEN]) -> SessionKey {
    decrypt_block(wrapping_key, encrypted)
}

/// Proof of key possession: the IV, zero padded to a block, encrypted under
/// the session key.
pub fn confirmation_block(session_key: &SessionKey, iv: &[u8]) -> [u8; CONFIRMATION_LEN] {
    let mut block = [0u8; 16];
    let len = iv.len().min(16);
    block[..len].copy_from_slice(&iv[..len]);
    encrypt_block(session_key, &block)
}

//==================================================================================Key agreement
/// Device key pair as seen by the security layer. Provisioning and storage
/// of the secret are up to the implementor.
pub trait KeyAgreement {
    /// Raw 64-byte public point (X then Y, no SEC1 tag).
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN];

    /// First 16 bytes of the ECDH secret shared with `peer_public_key`.
    fn shared_secret(&self, peer_public_key: &[u8; PUBLIC_KEY_LEN]) -> Result<[u8; 16], SecurityError>;
}

/// P-256 key agreement with the secret scalar held in memory.
#[derive(Clone)]
pub struct SoftwareKeyAgreement {
    secret: SecretKey,
}

impl SoftwareKeyAgreement {
    /// Load a 32-byte big-endian secret scalar.
    pub fn from_bytes(secret: &[u8; 32]) -> Result<Self, SecurityError> {
        SecretKey::from_slice(secret)
            .map(|secret| Self { secret })
            .map_err(|_| SecurityError::InvalidSecretKey)
    }

    /// Generate a fresh key pair.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            secret: SecretKey::random(rng),
        }
    }
}

impl KeyAgreement for SoftwareKeyAgreement {
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut raw = [0u8; PUBLIC_KEY_LEN];
        // Uncompressed SEC1: 0x04 || X || Y.
        raw.copy_from_slice(&point.as_bytes()[1..]);
        raw
    }

    fn shared_secret(&self, peer_public_key: &[u8; PUBLIC_KEY_LEN]) -> Result<[u8; 16], SecurityError> {
        let peer = parse_public_key(peer_public_key)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut key = [0u8; 16];
        key.copy_from_slice(&shared.raw_secret_bytes()[..16]);
        Ok(key)
    }
}

/// Check that 64 raw bytes are a valid P-256 point.
pub fn parse_public_key(raw: &[u8; PUBLIC_KEY_LEN]) -> Result<PublicKey, SecurityError> {
    let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| SecurityError::InvalidPublicKey)
}
