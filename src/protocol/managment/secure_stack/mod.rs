//! Synchronous core of the secure stack.
//!
//! [`SecureStack`] runs one received frame to completion: the source address
//! is bound in the registry, the frame is folded into the sender's secure
//! session, transport frames drive the reassembler and the fragmenter, and
//! complete messages are either consumed (DM18, Component ID request) or
//! handed back to the caller as a [`StackEvent`]. Every frame the stack wants
//! to transmit goes into a [`FrameSink`]; the caller owns the bus and paces
//! the output.
//!
//! The stack has no clock of its own. Outbound connection-mode transfers time
//! out against the `now` passed to [`SecureStack::process_frame`] and
//! [`SecureStack::poll`]; call `poll` periodically when the bus is quiet.
use embassy_time::{Duration, Instant};
use p256::elliptic_curve::rand_core::{CryptoRng, RngCore};

use crate::config::SecureConfig;
use crate::core::J1939Message;
use crate::error::{SecurityError, StackError};
use crate::protocol::managment::address_registry::{AddressRegistry, CmacIndex, PeerIndex};
use crate::protocol::messages::{requested_pgn, COMPONENT_ID_PGN, REQUEST_PGN};
use crate::protocol::security::crypto::KeyAgreement;
use crate::protocol::security::router::{SecureMessageRouter, SecurityEvent};
use crate::protocol::security::session::SessionManager;
use crate::protocol::security::{SecurityMessage, DM18_PGN};
use crate::protocol::transport::can_frame::{CanFrame, FrameSink};
use crate::protocol::transport::can_id::CanId;
use crate::protocol::transport::tp::fragmenter::TransportFragmenter;
use crate::protocol::transport::tp::reassembler::{
    ReassemblyResult, TransportFault, TransportPair, TransportReassembler,
};
use crate::protocol::transport::tp::{DestinationClass, TpControl};
use crate::protocol::transport::{TP_CM_PGN, TP_DT_PGN};
use crate::protocol::GLOBAL_ADDRESS;

//==================================================================================Events
/// Result of processing one frame that the application may care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// Complete application message (single frame or reassembled).
    Message(J1939Message),
    /// A DM18 message from `address` changed or was rejected by its session.
    Security { address: u8, event: SecurityEvent },
    /// A transfer from `address` was dropped.
    Transport { address: u8, fault: TransportFault },
}

/// Frames that never enter a session authenticator.
fn is_authenticated_pgn(pgn: u32) -> bool {
    !matches!(pgn, DM18_PGN | TP_CM_PGN | TP_DT_PGN)
}

//==================================================================================SecureStack
pub struct SecureStack<K: KeyAgreement> {
    config: SecureConfig,
    registry: AddressRegistry,
    reassembler: TransportReassembler,
    fragmenter: TransportFragmenter,
    router: SecureMessageRouter<K>,
}

impl<K: KeyAgreement> SecureStack<K> {
    pub fn new(config: SecureConfig, key_agreement: K) -> Self {
        let self_address = config.self_address;
        Self {
            registry: AddressRegistry::new(&config.vehicle_addresses),
            reassembler: TransportReassembler::new(self_address),
            fragmenter: TransportFragmenter::new(self_address),
            router: SecureMessageRouter::new(key_agreement),
            config,
        }
    }

    #[inline]
    pub fn self_address(&self) -> u8 {
        self.config.self_address
    }

    pub fn config(&self) -> &SecureConfig {
        &self.config
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager<K> {
        self.router.sessions()
    }

    /// `true` when a session key is installed for the vehicle peer at `address`.
    pub fn is_established(&self, address: u8) -> bool {
        self.registry
            .cmac_index_for(address)
            .is_some_and(|index| self.router.sessions().is_established(index))
    }

    /// Time since the session key of `address` was installed.
    pub fn session_age(&self, address: u8, now: Instant) -> Option<Duration> {
        let index = self.registry.cmac_index_for(address)?;
        self.router.sessions().session_age(index, now)
    }

    //==================================================================================Inbound
    /// Abort outbound transfers whose receiver stopped answering and start
    /// the transfers queued behind them.
    pub fn poll<S: FrameSink>(&mut self, now: Instant, sink: &mut S) -> Result<(), StackError> {
        while let Some(expired) = self.fragmenter.expire_next(now)? {
            sink.emit(expired.abort)?;
            if let Some(next) = expired.next {
                sink.emit(next)?;
            }
        }
        Ok(())
    }

    /// Run one received frame to completion.
    ///
    /// Transport and security faults are reported as events and never stop
    /// the stack; `Err` only means an outbound frame could not be produced or
    /// queued.
    pub fn process_frame<R: RngCore + CryptoRng, S: FrameSink>(
        &mut self,
        frame: &CanFrame,
        now: Instant,
        rng: &mut R,
        sink: &mut S,
    ) -> Result<Option<StackEvent>, StackError> {
        self.poll(now, sink)?;

        let self_address = self.config.self_address;
        let source_address = frame.id.source_address();
        if source_address == self_address {
            return Ok(None);
        }

        let peer = self.bind(source_address);
        let destination_address = frame.id.destination_or_global();
        let class = match DestinationClass::classify(destination_address, self_address) {
            Some(class) => class,
            None => return Ok(None),
        };

        let pgn = frame.id.pgn();
        #[cfg(feature = "defmt")]
        defmt::trace!(
            "Frame PGN {} from {:02X} to {:02X}",
            pgn,
            source_address,
            destination_address
        );

        if is_authenticated_pgn(pgn) {
            if let Some(index) = self.established_session(source_address) {
                self.router.sessions_mut().authenticate_frame(index, frame)?;
            }
        }

        let pair = TransportPair {
            peer,
            class,
            source_address,
            destination_address,
        };

        match pgn {
            TP_CM_PGN => self.process_control(&pair, frame, now, rng, sink),
            TP_DT_PGN => {
                let result = self.reassembler.process_data(&pair, frame.payload())?;
                self.process_reassembly(source_address, result, now, rng, sink)
            }
            _ => {
                let message =
                    J1939Message::new(pgn, source_address, destination_address, frame.payload());
                self.process_message(message, now, rng, sink)
            }
        }
    }

    fn process_control<R: RngCore + CryptoRng, S: FrameSink>(
        &mut self,
        pair: &TransportPair,
        frame: &CanFrame,
        now: Instant,
        rng: &mut R,
        sink: &mut S,
    ) -> Result<Option<StackEvent>, StackError> {
        let control = match TpControl::parse(frame.payload()) {
            Ok(control) => control,
            Err(_error) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("TP.CM from {:02X} dropped: {}", pair.source_address, _error);
                return Ok(None);
            }
        };

        // Sending-side control only makes sense when addressed to us.
        let to_self = pair.class == DestinationClass::ToSelf;
        match control {
            TpControl::ClearToSend {
                packets,
                next_packet,
                pgn,
            } if to_self => {
                match self
                    .fragmenter
                    .clear_to_send(pair.peer, packets, next_packet, pgn, now)
                {
                    Ok(frames) => {
                        for frame in frames {
                            sink.emit(frame?)?;
                        }
                    }
                    Err(_error) => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("CTS from {:02X} ignored: {}", pair.source_address, _error);
                    }
                }
                Ok(None)
            }
            TpControl::EndOfMessageAck { pgn, .. } if to_self => {
                match self.fragmenter.end_of_message(pair.peer, pgn, now) {
                    Ok(Some(next)) => sink.emit(next)?,
                    Ok(None) => {}
                    Err(_error) => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("EOMA from {:02X} ignored: {}", pair.source_address, _error);
                    }
                }
                Ok(None)
            }
            TpControl::Abort { pgn, .. } => {
                // The abort may target our transfer or the peer's own.
                if to_self {
                    if let Ok(Some(next)) = self.fragmenter.abort(pair.peer, pgn, now) {
                        sink.emit(next)?;
                    }
                }
                let result = self.reassembler.process_control(pair, &control)?;
                self.process_reassembly(pair.source_address, result, now, rng, sink)
            }
            _ => {
                let result = self.reassembler.process_control(pair, &control)?;
                self.process_reassembly(pair.source_address, result, now, rng, sink)
            }
        }
    }

    fn process_reassembly<R: RngCore + CryptoRng, S: FrameSink>(
        &mut self,
        source_address: u8,
        result: ReassemblyResult,
        now: Instant,
        rng: &mut R,
        sink: &mut S,
    ) -> Result<Option<StackEvent>, StackError> {
        match result {
            ReassemblyResult::Ignored
            | ReassemblyResult::ControlConsumed
            | ReassemblyResult::FragmentConsumed => Ok(None),
            ReassemblyResult::Reply(frame) => {
                sink.emit(frame)?;
                Ok(None)
            }
            ReassemblyResult::MessageComplete { message, ack } => {
                if let Some(ack) = ack {
                    sink.emit(ack)?;
                }
                self.process_message(message, now, rng, sink)
            }
            ReassemblyResult::Fault(fault) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Transfer from {:02X} dropped: {}", source_address, fault);
                Ok(Some(StackEvent::Transport {
                    address: source_address,
                    fault,
                }))
            }
        }
    }

    fn process_message<R: RngCore + CryptoRng, S: FrameSink>(
        &mut self,
        message: J1939Message,
        now: Instant,
        rng: &mut R,
        sink: &mut S,
    ) -> Result<Option<StackEvent>, StackError> {
        let address = message.source_address;
        match message.pgn {
            DM18_PGN => {
                let index = match self.registry.cmac_index_for(address) {
                    Some(index) => index,
                    None => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("DM18 from unknown peer {:02X}", address);
                        return Ok(Some(StackEvent::Security {
                            address,
                            event: SecurityEvent::Fault(SecurityError::UnknownPeer { address }),
                        }));
                    }
                };
                let outcome = self.router.route(index, message.data(), rng, now);
                if outcome.event == SecurityEvent::SessionReset {
                    self.cancel_transfers(address);
                }
                for reply in outcome.replies.iter() {
                    self.send_security(address, reply, now, sink)?;
                }
                Ok(Some(StackEvent::Security {
                    address,
                    event: outcome.event,
                }))
            }
            REQUEST_PGN if requested_pgn(message.data()) == Some(COMPONENT_ID_PGN) => {
                match self.config.identity.as_ref().map(|identity| identity.payload()) {
                    Some(payload) => {
                        #[cfg(feature = "defmt")]
                        defmt::debug!("Component ID requested by {:02X}", address);
                        self.broadcast(COMPONENT_ID_PGN, payload.as_slice(), sink)?;
                        Ok(None)
                    }
                    None => Ok(Some(StackEvent::Message(message))),
                }
            }
            _ => Ok(Some(StackEvent::Message(message))),
        }
    }

    //==================================================================================Outbound
    /// Send a single frame built by the application. It is folded into the
    /// session of its destination, or into every established session when
    /// broadcast.
    pub fn send_frame<S: FrameSink>(&mut self, frame: CanFrame, sink: &mut S) -> Result<(), StackError> {
        if is_authenticated_pgn(frame.id.pgn()) {
            let destination = frame.id.destination_or_global();
            let sessions = self.router.sessions_mut();
            if destination == GLOBAL_ADDRESS {
                for index in self.registry.cmac_indices() {
                    if sessions.is_established(index) {
                        sessions.authenticate_frame(index, &frame)?;
                    }
                }
            } else if let Some(index) = self.registry.cmac_index_for(destination) {
                if sessions.is_established(index) {
                    sessions.authenticate_frame(index, &frame)?;
                }
            }
        }
        sink.emit(frame)?;
        Ok(())
    }

    /// Send `payload` as `pgn` to `destination`. Up to eight bytes go out as
    /// a single frame; longer payloads use BAM when broadcast and RTS/CTS
    /// otherwise.
    pub fn send_message<S: FrameSink>(
        &mut self,
        destination: u8,
        pgn: u32,
        payload: &[u8],
        now: Instant,
        sink: &mut S,
    ) -> Result<(), StackError> {
        let self_address = self.config.self_address;
        if payload.len() <= 8 && !payload.is_empty() {
            let id = CanId::builder(pgn, self_address)
                .routed_to(destination)
                .build()?;
            return self.send_frame(CanFrame::from_payload(id, payload)?, sink);
        }

        let pdu2 = ((pgn >> 8) & 0xFF) >= 240;
        if destination == GLOBAL_ADDRESS || pdu2 {
            return self.broadcast(pgn, payload, sink);
        }

        let peer = self.bind(destination);
        if let Some(request) = self.fragmenter.open(peer, destination, pgn, payload, now)? {
            sink.emit(request)?;
        }
        Ok(())
    }

    /// Start a key exchange with the vehicle peer at `address`.
    pub fn begin_key_exchange<S: FrameSink>(
        &mut self,
        address: u8,
        now: Instant,
        sink: &mut S,
    ) -> Result<(), StackError> {
        let index = self.vehicle_session(address)?;
        let request = self.router.sessions_mut().begin_key_exchange(index);
        self.send_security(address, &request, now, sink)
    }

    /// Send our running tag to `address` for comparison. The peer answers
    /// with its own tag.
    pub fn send_authenticator<S: FrameSink>(
        &mut self,
        address: u8,
        now: Instant,
        sink: &mut S,
    ) -> Result<(), StackError> {
        let index = self.vehicle_session(address)?;
        let tag = self.router.sessions_mut().request_authenticator(index)?;
        self.send_security(address, &SecurityMessage::Authenticator(tag), now, sink)
    }

    /// Drop the session with `address` and ask the peer to do the same.
    /// Transfers still pending towards the peer are dropped with it. The
    /// Reset goes to `address` itself, which every receiver accepts.
    pub fn request_reset<S: FrameSink>(
        &mut self,
        address: u8,
        now: Instant,
        sink: &mut S,
    ) -> Result<(), StackError> {
        let index = self.vehicle_session(address)?;
        self.router.sessions_mut().reset(index);
        self.cancel_transfers(address);
        self.send_security(address, &SecurityMessage::Reset, now, sink)
    }

    fn send_security<S: FrameSink>(
        &mut self,
        address: u8,
        message: &SecurityMessage,
        now: Instant,
        sink: &mut S,
    ) -> Result<(), StackError> {
        let self_address = self.config.self_address;
        let payload = message.encode();
        #[cfg(feature = "defmt")]
        defmt::trace!(
            "DM18 type {:02X} ({} bytes) to {:02X}",
            message.kind(),
            payload.len(),
            address
        );

        if payload.len() <= 8 {
            let id = CanId::builder(DM18_PGN, self_address)
                .with_priority(message.priority())
                .to_destination(address)
                .build()?;
            sink.emit(CanFrame::from_payload(id, payload.as_slice())?)?;
            return Ok(());
        }

        let peer = self.bind(address);
        if let Some(request) = self
            .fragmenter
            .open(peer, address, DM18_PGN, payload.as_slice(), now)?
        {
            sink.emit(request)?;
        }
        Ok(())
    }

    fn broadcast<S: FrameSink>(&self, pgn: u32, payload: &[u8], sink: &mut S) -> Result<(), StackError> {
        let transfer = self.fragmenter.broadcast(pgn, payload)?;
        sink.emit(transfer.announce)?;
        for frame in transfer.data {
            sink.emit(frame?)?;
        }
        Ok(())
    }

    //==================================================================================Helpers
    /// Registry index for `address`. When the ring reuses a slot, the transport
    /// state left by the previous owner is discarded.
    fn bind(&mut self, address: u8) -> PeerIndex {
        let assignment = self.registry.assign(address);
        if assignment.evicted.is_some() {
            self.reassembler.reset_peer(assignment.index);
            self.fragmenter.cancel(assignment.index);
        }
        assignment.index
    }

    /// Forget outbound transfers to `address`, active or queued.
    fn cancel_transfers(&mut self, address: u8) {
        if let Some(peer) = self.registry.lookup(address) {
            self.fragmenter.cancel(peer);
        }
    }

    fn established_session(&self, address: u8) -> Option<CmacIndex> {
        self.registry
            .cmac_index_for(address)
            .filter(|&index| self.router.sessions().is_established(index))
    }

    fn vehicle_session(&self, address: u8) -> Result<CmacIndex, SecurityError> {
        self.registry
            .cmac_index_for(address)
            .ok_or(SecurityError::UnknownPeer { address })
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
