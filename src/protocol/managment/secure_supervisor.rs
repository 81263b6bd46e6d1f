//! Supervisor built on top of [`SecureNode`].
//!
//! It keeps the node receiving and optionally offers:
//!
//! * a command handle (`SecureHandle`) to send frames and messages and to
//!   drive the security sessions from other tasks;
//! * an event receiver (`SecureEvents`) to pull application messages and
//!   security notifications.
//!
//! Firmware decides which features it needs by providing pre-allocated
//! [`embassy_sync::Channel`] instances. No allocation is performed by the
//! library and there is no dependency on a particular BSP.

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Channel, Receiver, Sender},
};
use futures_util::{future::select, future::Either, pin_mut};
use p256::elliptic_curve::rand_core::{CryptoRng, RngCore};

use crate::core::{PayloadBuffer, MAX_MESSAGE_LENGTH};
use crate::error::{NodeError, TransportError};
use crate::protocol::managment::secure_node::SecureNode;
use crate::protocol::managment::secure_stack::StackEvent;
use crate::protocol::security::crypto::KeyAgreement;
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::traits::can_bus::CanBus;
use crate::protocol::transport::traits::j1939_timer::J1939Timer;

pub type CommandChannel<const CMD_CAP: usize> =
    Channel<CriticalSectionRawMutex, SecureCommand, CMD_CAP>;
pub type EventChannel<const EVENT_CAP: usize> =
    Channel<CriticalSectionRawMutex, StackEvent, EVENT_CAP>;

/// Service assembling the supervisor components.
pub struct SecureService<'a, C, T, K, R, const CMD_CAP: usize, const EVENT_CAP: usize>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    node: SecureNode<C, T, K, R>,
    command_channel: Option<&'a CommandChannel<CMD_CAP>>,
    event_channel: Option<&'a EventChannel<EVENT_CAP>>,
}

impl<'a, C, T, K, R, const CMD_CAP: usize, const EVENT_CAP: usize>
    SecureService<'a, C, T, K, R, CMD_CAP, EVENT_CAP>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    pub fn new(
        node: SecureNode<C, T, K, R>,
        command_channel: Option<&'a CommandChannel<CMD_CAP>>,
        event_channel: Option<&'a EventChannel<EVENT_CAP>>,
    ) -> Self {
        Self {
            node,
            command_channel,
            event_channel,
        }
    }

    /// Split into handle/receiver/runner components.
    pub fn into_parts(self) -> SecureServiceParts<'a, C, T, K, R, CMD_CAP, EVENT_CAP> {
        let handle = self.command_channel.map(|channel| SecureHandle {
            sender: channel.sender(),
        });
        let events = self.event_channel.map(|channel| SecureEvents {
            receiver: channel.receiver(),
        });
        SecureServiceParts {
            handle,
            events,
            runner: SecureRunner {
                node: self.node,
                command_channel: self.command_channel,
                event_channel: self.event_channel,
            },
        }
    }
}

/// Bundle returned by [`SecureService::into_parts`].
pub struct SecureServiceParts<'a, C, T, K, R, const CMD_CAP: usize, const EVENT_CAP: usize>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    pub handle: Option<SecureHandle<'a, CMD_CAP>>,
    pub events: Option<SecureEvents<'a, EVENT_CAP>>,
    pub runner: SecureRunner<'a, C, T, K, R, CMD_CAP, EVENT_CAP>,
}

/// Runner that drives the supervisor loop.
pub struct SecureRunner<'a, C, T, K, R, const CMD_CAP: usize, const EVENT_CAP: usize>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    node: SecureNode<C, T, K, R>,
    command_channel: Option<&'a CommandChannel<CMD_CAP>>,
    event_channel: Option<&'a EventChannel<EVENT_CAP>>,
}

impl<'a, C, T, K, R, const CMD_CAP: usize, const EVENT_CAP: usize>
    SecureRunner<'a, C, T, K, R, CMD_CAP, EVENT_CAP>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    /// Run until the bus fails. Stack errors are reported and skipped.
    pub async fn drive(mut self) -> Result<(), NodeError<C::Error>> {
        let event_channel = self.event_channel;
        let command_channel = self.command_channel;

        loop {
            match command_channel {
                Some(cmd_ch) => {
                    let mut command_to_process = None;
                    let mut received = None;

                    {
                        let cmd_future = cmd_ch.receive();
                        let recv_future = self.node.recv();
                        pin_mut!(cmd_future);
                        pin_mut!(recv_future);

                        match select(recv_future, cmd_future).await {
                            Either::Left((result, pending_cmd)) => {
                                received = Some(result);
                                drop(pending_cmd);
                            }
                            Either::Right((command, pending_recv)) => {
                                command_to_process = Some(command);
                                drop(pending_recv);
                            }
                        }
                    }

                    if let Some(result) = received {
                        forward(event_channel, result).await?;
                    }

                    if let Some(command) = command_to_process {
                        match handle_command(&mut self.node, command).await {
                            Ok(()) => {}
                            Err(NodeError::Stack(_error)) => {
                                #[cfg(feature = "defmt")]
                                defmt::warn!("Command failed: {}", _error);
                            }
                            Err(error) => return Err(error),
                        }
                    }
                }
                None => {
                    let result = self.node.recv().await;
                    forward(event_channel, result).await?;
                }
            }
        }
    }
}

/// Push an event to the application, or surface a bus failure.
async fn forward<E: core::fmt::Debug, const EVENT_CAP: usize>(
    event_channel: Option<&EventChannel<EVENT_CAP>>,
    result: Result<StackEvent, NodeError<E>>,
) -> Result<(), NodeError<E>> {
    match result {
        Ok(event) => {
            if let Some(event_ch) = event_channel {
                event_ch.send(event).await;
            }
            Ok(())
        }
        Err(NodeError::Stack(_error)) => {
            #[cfg(feature = "defmt")]
            defmt::warn!("Frame processing failed: {}", _error);
            Ok(())
        }
        Err(error) => Err(error),
    }
}

/// Command handle (optional).
pub struct SecureHandle<'a, const CMD_CAP: usize> {
    sender: Sender<'a, CriticalSectionRawMutex, SecureCommand, CMD_CAP>,
}

impl<'a, const CMD_CAP: usize> SecureHandle<'a, CMD_CAP> {
    pub async fn send_frame(&self, frame: &CanFrame) {
        self.sender
            .send(SecureCommand::SendFrame(frame.clone()))
            .await;
    }

    pub async fn send_message(
        &self,
        destination: u8,
        pgn: u32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_MESSAGE_LENGTH {
            return Err(TransportError::PayloadTooLong { len: payload.len() });
        }
        let command = SecureCommand::SendMessage {
            destination,
            pgn,
            payload: PayloadBuffer::from_slice(payload),
        };
        self.sender.send(command).await;
        Ok(())
    }

    pub async fn begin_key_exchange(&self, address: u8) {
        self.sender
            .send(SecureCommand::BeginKeyExchange(address))
            .await;
    }

    pub async fn send_authenticator(&self, address: u8) {
        self.sender
            .send(SecureCommand::SendAuthenticator(address))
            .await;
    }

    pub async fn request_reset(&self, address: u8) {
        self.sender.send(SecureCommand::RequestReset(address)).await;
    }
}

/// Optional receiver returning the events surfaced by the node.
pub struct SecureEvents<'a, const EVENT_CAP: usize> {
    receiver: Receiver<'a, CriticalSectionRawMutex, StackEvent, EVENT_CAP>,
}

impl<'a, const EVENT_CAP: usize> SecureEvents<'a, EVENT_CAP> {
    pub async fn recv(&mut self) -> StackEvent {
        self.receiver.receive().await
    }
}

/// Commands queued by producer tasks.
#[derive(Clone)]
pub enum SecureCommand {
    SendFrame(CanFrame),
    SendMessage {
        destination: u8,
        pgn: u32,
        payload: PayloadBuffer<MAX_MESSAGE_LENGTH>,
    },
    BeginKeyExchange(u8),
    SendAuthenticator(u8),
    RequestReset(u8),
}

async fn handle_command<C, T, K, R>(
    node: &mut SecureNode<C, T, K, R>,
    command: SecureCommand,
) -> Result<(), NodeError<C::Error>>
where
    C: CanBus,
    T: J1939Timer,
    K: KeyAgreement,
    R: RngCore + CryptoRng,
{
    match command {
        SecureCommand::SendFrame(frame) => node.send_frame(frame).await,
        SecureCommand::SendMessage {
            destination,
            pgn,
            payload,
        } => {
            node.send_message(destination, pgn, payload.as_slice())
                .await
        }
        SecureCommand::BeginKeyExchange(address) => node.begin_key_exchange(address).await,
        SecureCommand::SendAuthenticator(address) => node.send_authenticator(address).await,
        SecureCommand::RequestReset(address) => node.request_reset(address).await,
    }
}
