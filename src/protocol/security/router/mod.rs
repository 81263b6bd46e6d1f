//! Dispatch of inbound DM18 messages to the session manager.
//!
//! The router decides what a message means for the session and which
//! security messages go back to the peer; framing those replies (single frame
//! or transport protocol) is left to the caller.
use embassy_time::Instant;
use p256::elliptic_curve::rand_core::{CryptoRng, RngCore};

use crate::error::SecurityError;
use crate::protocol::managment::address_registry::CmacIndex;
use crate::protocol::security::crypto::KeyAgreement;
use crate::protocol::security::session::SessionManager;
use crate::protocol::security::{SecurityMessage, IV_LEN};

/// Replies produced for one inbound message.
pub type Replies = heapless::Vec<SecurityMessage, 2>;

//==================================================================================Events
/// What an inbound security message did to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityEvent {
    /// Peer asked for our public key; it is in the replies.
    PublicKeyRequested,
    /// Peer public key stored.
    PeerPublicKeyStored,
    /// Peer asked for a session key; the key or a public key request is in the replies.
    SessionKeyRequested,
    /// A session key is installed (delivered by the peer or generated for it).
    SessionEstablished,
    /// Peer tag equals ours.
    AuthenticatorMatched,
    /// Peer proved it holds the same session key.
    ConfirmationMatched,
    /// Peer asked to drop the session.
    SessionReset,
    /// Message rejected; the session state is reported by the error.
    Fault(SecurityError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub event: SecurityEvent,
    pub replies: Replies,
}

impl RouteOutcome {
    fn event(event: SecurityEvent) -> Self {
        Self {
            event,
            replies: Replies::new(),
        }
    }

    fn with_reply(mut self, reply: SecurityMessage) -> Self {
        // Two replies at most per message.
        let _ = self.replies.push(reply);
        self
    }

    fn fault(error: SecurityError) -> Self {
        #[cfg(feature = "defmt")]
        defmt::warn!("Security fault: {}", error);
        Self::event(SecurityEvent::Fault(error))
    }
}

//==================================================================================SecureMessageRouter
pub struct SecureMessageRouter<K: KeyAgreement> {
    sessions: SessionManager<K>,
}

impl<K: KeyAgreement> SecureMessageRouter<K> {
    pub fn new(key_agreement: K) -> Self {
        Self {
            sessions: SessionManager::new(key_agreement),
        }
    }

    pub fn sessions(&self) -> &SessionManager<K> {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionManager<K> {
        &mut self.sessions
    }

    /// Decode a DM18 payload from the vehicle peer behind `index` and apply it.
    pub fn route<R: RngCore + CryptoRng>(
        &mut self,
        index: CmacIndex,
        payload: &[u8],
        rng: &mut R,
        now: Instant,
    ) -> RouteOutcome {
        match SecurityMessage::decode(payload) {
            Ok(message) => self.dispatch(index, &message, rng, now),
            Err(error) => RouteOutcome::fault(error),
        }
    }

    /// Apply an already decoded message.
    pub fn dispatch<R: RngCore + CryptoRng>(
        &mut self,
        index: CmacIndex,
        message: &SecurityMessage,
        rng: &mut R,
        now: Instant,
    ) -> RouteOutcome {
        #[cfg(feature = "defmt")]
        defmt::trace!("DM18 type {:02X} on session {}", message.kind(), index.get());

        match message {
            SecurityMessage::PublicKeyRequest => {
                RouteOutcome::event(SecurityEvent::PublicKeyRequested)
                    .with_reply(SecurityMessage::PublicKey(self.sessions.public_key()))
            }
            SecurityMessage::PublicKey(public_key) => {
                match self
                    .sessions
                    .store_peer_public_key(index, public_key, rng, now)
                {
                    Ok(Some(delivery)) => {
                        self.deliver(RouteOutcome::event(SecurityEvent::SessionEstablished), delivery)
                    }
                    Ok(None) => RouteOutcome::event(SecurityEvent::PeerPublicKeyStored),
                    Err(error) => RouteOutcome::fault(error),
                }
            }
            SecurityMessage::SessionKeyRequest => {
                match self.sessions.request_session_key(index, rng, now) {
                    Ok(reply) => {
                        self.deliver(RouteOutcome::event(SecurityEvent::SessionKeyRequested), reply)
                    }
                    Err(error) => RouteOutcome::fault(error),
                }
            }
            SecurityMessage::SessionKey {
                encrypted_key,
                iv,
                iv_len,
            } => {
                let iv = &iv[..(*iv_len as usize).min(IV_LEN)];
                match self.sessions.install_session_key(index, encrypted_key, iv, now) {
                    Ok(()) => {
                        self.confirm(index, RouteOutcome::event(SecurityEvent::SessionEstablished))
                    }
                    Err(error) => RouteOutcome::fault(error),
                }
            }
            SecurityMessage::Authenticator(tag) => {
                // Our tag goes back whatever the comparison says.
                let echo = self.sessions.answer_authenticator(index);
                let verified = self.sessions.verify_authenticator(index, tag);
                let outcome = match verified {
                    Ok(()) => RouteOutcome::event(SecurityEvent::AuthenticatorMatched),
                    Err(error) => RouteOutcome::fault(error),
                };
                let outcome = match echo {
                    Some(own) => outcome.with_reply(SecurityMessage::Authenticator(own)),
                    None => outcome,
                };
                match verified {
                    Ok(()) => self.confirm(index, outcome),
                    Err(_) => outcome,
                }
            }
            SecurityMessage::Confirmation(block) => {
                match self.sessions.check_confirmation(index, block) {
                    Ok(()) => {
                        #[cfg(feature = "defmt")]
                        defmt::info!("Key confirmed on session {}", index.get());
                        RouteOutcome::event(SecurityEvent::ConfirmationMatched)
                    }
                    Err(error) => RouteOutcome::fault(error),
                }
            }
            SecurityMessage::Reset => {
                self.sessions.reset(index);
                RouteOutcome::event(SecurityEvent::SessionReset)
            }
        }
    }

    /// Queue `reply`. A session key is preceded by our public key so the peer
    /// can unwrap it without a separate request.
    fn deliver(&self, outcome: RouteOutcome, reply: SecurityMessage) -> RouteOutcome {
        match reply {
            SecurityMessage::SessionKey { .. } => outcome
                .with_reply(SecurityMessage::PublicKey(self.sessions.public_key()))
                .with_reply(reply),
            _ => outcome.with_reply(reply),
        }
    }

    /// Attach our confirmation if it has not been sent for the current key.
    fn confirm(&mut self, index: CmacIndex, outcome: RouteOutcome) -> RouteOutcome {
        match self.sessions.take_confirmation(index) {
            Some(block) => outcome.with_reply(SecurityMessage::Confirmation(block)),
            None => outcome,
        }
    }
}
