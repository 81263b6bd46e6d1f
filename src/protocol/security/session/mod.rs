//! Per-peer security sessions: key exchange bookkeeping, session key
//! installation, running frame authentication and key confirmation.
//!
//! Sessions are keyed by [`CmacIndex`] and live as long as the manager. A
//! reset only drops the key material; the record itself is reused by the next
//! key exchange.
use embassy_time::{Duration, Instant};
use p256::elliptic_curve::rand_core::{CryptoRng, RngCore};

use crate::error::SecurityError;
use crate::protocol::managment::address_registry::{CmacIndex, N_SOURCE_ADDRESSES};
use crate::protocol::security::crypto::{
    confirmation_block, unwrap_session_key, wrap_session_key, FrameAuthenticator, KeyAgreement,
    SessionKey,
};
use crate::protocol::security::{
    SecurityMessage, CONFIRMATION_LEN, IV_LEN, PUBLIC_KEY_LEN, SESSION_KEY_LEN, TAG_LEN,
};
use crate::protocol::transport::can_frame::CanFrame;

//==================================================================================SecuritySession
#[derive(Debug, Clone)]
pub struct SecuritySession {
    established: bool,
    key: SessionKey,
    iv: [u8; IV_LEN],
    iv_len: u8,
    authenticator: Option<FrameAuthenticator>,
    confirmation_sent: bool,
    /// We sent our tag and the peer's answer has not arrived yet.
    tag_outstanding: bool,
    installed_at: Option<Instant>,
    /// Public key requested from the peer and not yet received.
    public_key_needed: bool,
    /// Deliver a session key as soon as the peer public key arrives.
    session_key_pending: bool,
    peer_public_key: Option<[u8; PUBLIC_KEY_LEN]>,
}

impl SecuritySession {
    pub const fn new() -> Self {
        Self {
            established: false,
            key: [0; SESSION_KEY_LEN],
            iv: [0; IV_LEN],
            iv_len: 0,
            authenticator: None,
            confirmation_sent: false,
            tag_outstanding: false,
            installed_at: None,
            public_key_needed: false,
            session_key_pending: false,
            peer_public_key: None,
        }
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.established
    }

    #[inline]
    pub fn confirmation_sent(&self) -> bool {
        self.confirmation_sent
    }

    #[inline]
    pub fn public_key_needed(&self) -> bool {
        self.public_key_needed
    }

    #[inline]
    pub fn peer_public_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.peer_public_key.as_ref()
    }

    fn iv(&self) -> &[u8] {
        &self.iv[..self.iv_len as usize]
    }

    fn install(&mut self, key: SessionKey, iv: &[u8], now: Instant) {
        let len = iv.len().min(IV_LEN);
        self.key = key;
        self.iv = [0; IV_LEN];
        self.iv[..len].copy_from_slice(&iv[..len]);
        self.iv_len = len as u8;
        self.authenticator = Some(FrameAuthenticator::new(&key, &iv[..len]));
        self.established = true;
        self.confirmation_sent = false;
        self.tag_outstanding = false;
        self.installed_at = Some(now);
    }

    fn reset(&mut self) {
        self.established = false;
        self.key = [0; SESSION_KEY_LEN];
        self.authenticator = None;
        self.confirmation_sent = false;
        self.tag_outstanding = false;
        self.installed_at = None;
        self.session_key_pending = false;
    }

    fn authenticator(&self) -> Result<&FrameAuthenticator, SecurityError> {
        match (&self.authenticator, self.established) {
            (Some(authenticator), true) => Ok(authenticator),
            _ => Err(SecurityError::NotEstablished),
        }
    }
}

impl Default for SecuritySession {
    fn default() -> Self {
        Self::new()
    }
}

//==================================================================================SessionManager
/// Owns the device key pair and one [`SecuritySession`] per vehicle peer.
pub struct SessionManager<K: KeyAgreement> {
    key_agreement: K,
    sessions: [SecuritySession; N_SOURCE_ADDRESSES],
}

impl<K: KeyAgreement> SessionManager<K> {
    pub fn new(key_agreement: K) -> Self {
        Self {
            key_agreement,
            sessions: core::array::from_fn(|_| SecuritySession::new()),
        }
    }

    /// Our raw public key, as sent in public key responses.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key_agreement.public_key()
    }

    pub fn session(&self, index: CmacIndex) -> &SecuritySession {
        &self.sessions[index.get()]
    }

    pub fn is_established(&self, index: CmacIndex) -> bool {
        self.sessions[index.get()].established
    }

    //==================================================================================Key exchange
    /// Start a key exchange as initiator: the session key is generated and
    /// delivered once the peer public key is known.
    pub fn begin_key_exchange(&mut self, index: CmacIndex) -> SecurityMessage {
        let session = &mut self.sessions[index.get()];
        session.public_key_needed = true;
        session.session_key_pending = true;
        #[cfg(feature = "defmt")]
        defmt::info!("Key exchange started for session {}", index.get());
        SecurityMessage::PublicKeyRequest
    }

    /// Peer asked for a session key. Answer right away when its public key is
    /// known, otherwise request it first.
    pub fn request_session_key<R: RngCore + CryptoRng>(
        &mut self,
        index: CmacIndex,
        rng: &mut R,
        now: Instant,
    ) -> Result<SecurityMessage, SecurityError> {
        if self.sessions[index.get()].peer_public_key.is_some() {
            return self.generate_session_key(index, rng, now);
        }
        Ok(self.begin_key_exchange(index))
    }

    /// Record the peer public key. Returns the session key delivery when one
    /// was waiting for it.
    pub fn store_peer_public_key<R: RngCore + CryptoRng>(
        &mut self,
        index: CmacIndex,
        public_key: &[u8; PUBLIC_KEY_LEN],
        rng: &mut R,
        now: Instant,
    ) -> Result<Option<SecurityMessage>, SecurityError> {
        // Rejects points that are not on the curve.
        self.key_agreement.shared_secret(public_key)?;

        let session = &mut self.sessions[index.get()];
        session.peer_public_key = Some(*public_key);
        session.public_key_needed = false;

        if !session.session_key_pending {
            return Ok(None);
        }
        session.session_key_pending = false;
        self.generate_session_key(index, rng, now).map(Some)
    }

    /// Draw a new session key and IV, install them locally and return the
    /// wrapped key for the peer.
    pub fn generate_session_key<R: RngCore + CryptoRng>(
        &mut self,
        index: CmacIndex,
        rng: &mut R,
        now: Instant,
    ) -> Result<SecurityMessage, SecurityError> {
        let peer_public_key = self.sessions[index.get()]
            .peer_public_key
            .ok_or(SecurityError::MissingPeerPublicKey)?;
        let wrapping_key = self.key_agreement.shared_secret(&peer_public_key)?;

        let mut key: SessionKey = [0; SESSION_KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        self.sessions[index.get()].install(key, &iv, now);
        #[cfg(feature = "defmt")]
        defmt::info!("Session {} keyed locally", index.get());

        Ok(SecurityMessage::SessionKey {
            encrypted_key: wrap_session_key(&wrapping_key, &key),
            iv,
            iv_len: IV_LEN as u8,
        })
    }

    /// Install a session key delivered by the peer.
    pub fn install_session_key(
        &mut self,
        index: CmacIndex,
        encrypted_key: &[u8; SESSION_KEY_LEN],
        iv: &[u8],
        now: Instant,
    ) -> Result<(), SecurityError> {
        let session = &mut self.sessions[index.get()];
        let peer_public_key = match session.peer_public_key {
            Some(key) => key,
            None => {
                session.reset();
                return Err(SecurityError::MissingPeerPublicKey);
            }
        };
        let wrapping_key = match self.key_agreement.shared_secret(&peer_public_key) {
            Ok(key) => key,
            Err(_) => {
                session.reset();
                return Err(SecurityError::KeyDecryption);
            }
        };

        let key = unwrap_session_key(&wrapping_key, encrypted_key);
        session.install(key, iv, now);
        #[cfg(feature = "defmt")]
        defmt::info!("Session {} established", index.get());
        Ok(())
    }

    //==================================================================================Authentication
    /// Fold one frame into the session authenticator.
    pub fn authenticate_frame(&mut self, index: CmacIndex, frame: &CanFrame) -> Result<(), SecurityError> {
        let session = &mut self.sessions[index.get()];
        if !session.established {
            return Err(SecurityError::NotEstablished);
        }
        match session.authenticator.as_mut() {
            Some(authenticator) => {
                authenticator.update_frame(frame);
                Ok(())
            }
            None => Err(SecurityError::NotEstablished),
        }
    }

    /// Tag over everything authenticated so far. The stream keeps running.
    pub fn emit_authenticator(&self, index: CmacIndex) -> Result<[u8; TAG_LEN], SecurityError> {
        Ok(self.sessions[index.get()].authenticator()?.tag())
    }

    /// Our tag, sent to the peer for comparison. The peer answers with its
    /// own, which is not answered again.
    pub fn request_authenticator(&mut self, index: CmacIndex) -> Result<[u8; TAG_LEN], SecurityError> {
        let session = &mut self.sessions[index.get()];
        let tag = session.authenticator()?.tag();
        session.tag_outstanding = true;
        Ok(tag)
    }

    /// Our tag to send back when the peer sends its own. `None` when the
    /// peer's tag answers ours, or without a session.
    pub fn answer_authenticator(&mut self, index: CmacIndex) -> Option<[u8; TAG_LEN]> {
        let session = &mut self.sessions[index.get()];
        if core::mem::take(&mut session.tag_outstanding) {
            return None;
        }
        session.authenticator().ok().map(FrameAuthenticator::tag)
    }

    /// Compare a received tag with ours. A mismatch is reported only; the
    /// session stays up.
    pub fn verify_authenticator(&self, index: CmacIndex, tag: &[u8; TAG_LEN]) -> Result<(), SecurityError> {
        let expected = self.sessions[index.get()].authenticator()?.tag();
        if &expected == tag {
            Ok(())
        } else {
            #[cfg(feature = "defmt")]
            defmt::warn!("Authenticator mismatch on session {}", index.get());
            Err(SecurityError::AuthenticatorMismatch)
        }
    }

    //==================================================================================Confirmation
    /// Confirmation to send, at most once per installed key.
    pub fn take_confirmation(&mut self, index: CmacIndex) -> Option<[u8; CONFIRMATION_LEN]> {
        let session = &mut self.sessions[index.get()];
        if !session.established || session.confirmation_sent {
            return None;
        }
        session.confirmation_sent = true;
        Some(confirmation_block(&session.key, session.iv()))
    }

    /// Check the peer's confirmation. A wrong value means both sides hold
    /// different keys: the session is reset.
    pub fn check_confirmation(
        &mut self,
        index: CmacIndex,
        confirmation: &[u8; CONFIRMATION_LEN],
    ) -> Result<(), SecurityError> {
        let session = &mut self.sessions[index.get()];
        if !session.established {
            return Err(SecurityError::NotEstablished);
        }
        if &confirmation_block(&session.key, session.iv()) == confirmation {
            return Ok(());
        }
        #[cfg(feature = "defmt")]
        defmt::warn!("Key confirmation mismatch on session {}, resetting", index.get());
        session.reset();
        Err(SecurityError::KeyMismatch)
    }

    /// Drop the key material. The peer public key is kept for the next exchange.
    pub fn reset(&mut self, index: CmacIndex) {
        #[cfg(feature = "defmt")]
        defmt::info!("Session {} reset", index.get());
        self.sessions[index.get()].reset();
    }

    /// Time since the current key was installed.
    pub fn session_age(&self, index: CmacIndex, now: Instant) -> Option<Duration> {
        self.sessions[index.get()]
            .installed_at
            .map(|installed| now.saturating_duration_since(installed))
    }
}
