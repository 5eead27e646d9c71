use core::time::Duration;
use std::io;
use std::sync::Arc;

use rdp_proto::fast_path::{FastPathHeader, FastPathInputEvent};
use rdp_proto::mcs::DisconnectReason;
use rdp_proto::nego::NegotiatedProtocol;
use rdp_proto::sec::SecurityFlags;
use rdp_proto::share::ShareControlPdu;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::mpsc;

use crate::config::{ClientConfig, ConfigError};
use crate::error::{RdpError, RdpResult};
use crate::event::{EventReceiver, RdpEvent};
use crate::mcs::{ChannelLayer, McsMessage};
use crate::pdu::{ActivationState, PduLayer, PduOutput};
use crate::security::SecurityLayer;
use crate::task::ChildTask;
use crate::transport::{ErasedStream, Frame, FrameSender, Framed, SenderTask};
use crate::{mcs, negotiation, nla, security};

const COMMAND_CHANNEL_SIZE: usize = 16;

/// How long a graceful close waits for queued frames to reach the peer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Shutdown,
    Input(Vec<FastPathInputEvent>),
}

/// Drives one RDP connection, from the first byte on the wire to the close event.
///
/// A client is consumed by [`RdpClient::login`]; logging in again requires a new one.
#[derive(Debug)]
pub struct RdpClient {
    config: ClientConfig,
    events: mpsc::Sender<RdpEvent>,
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
}

/// Controls a running session from outside [`RdpClient::login`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Asks the server to end the session. The outcome is reported as a `Success` event.
    pub async fn shutdown(&self) -> RdpResult<()> {
        self.send(Command::Shutdown).await
    }

    /// Sends input events once the session is active; earlier events are dropped.
    pub async fn send_input(&self, events: Vec<FastPathInputEvent>) -> RdpResult<()> {
        self.send(Command::Input(events)).await
    }

    async fn send(&self, command: Command) -> RdpResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RdpError::from(io::Error::new(io::ErrorKind::NotConnected, "session is not running")))
    }
}

impl RdpClient {
    pub fn new(config: ClientConfig) -> Result<(Self, EventReceiver), ConfigError> {
        config.validate()?;

        let (events, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        Ok((
            Self {
                config,
                events,
                commands,
                command_tx,
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.command_tx.clone(),
        }
    }

    /// Runs the whole connection sequence over `stream`, then the session until it ends.
    ///
    /// Returns once the close event has been sent: `Ok` after a client-initiated shutdown the
    /// server acknowledged, the error that ended the session otherwise.
    #[instrument("login", skip_all, fields(username = %self.config.credentials.username))]
    pub async fn login<S>(self, stream: S) -> RdpResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            config,
            events,
            commands,
            command_tx,
        } = self;

        // Only handles given out before login keep the command channel open.
        drop(command_tx);

        let result = match establish(Box::new(stream), &config).await {
            Ok(session) => session.run(commands, &events).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => {
                info!("Session closed");
                emit(&events, RdpEvent::Close).await;
                Ok(())
            }
            Err(error) => {
                error!(%error, "Session failed");
                emit(&events, RdpEvent::Error(error.clone())).await;
                emit(&events, RdpEvent::Close).await;
                Err(error)
            }
        }
    }
}

async fn establish(stream: ErasedStream, config: &ClientConfig) -> RdpResult<Session> {
    let mut framed = Framed::new(stream, config.max_frame_size);

    let negotiation = negotiation::negotiate(&mut framed, config).await?;

    if negotiation.protocol != NegotiatedProtocol::Plain {
        let (upgraded, public_key) = negotiation::upgrade_to_tls(framed, &config.server_name).await?;
        framed = upgraded;

        if negotiation.protocol == NegotiatedProtocol::HybridCredentialDelegation {
            let authenticated =
                nla::authenticate(&mut framed, public_key, &config.credentials, negotiation.early_user_auth()).await;
            if let Err(error) = authenticated {
                return Err(abort(framed, error).await);
            }
        }
    }

    let connected = async {
        let (channels, server_blocks) = mcs::connect(&mut framed, config, &negotiation).await?;
        let security =
            security::establish(&mut framed, &channels, &negotiation, &server_blocks.security, config).await?;
        Ok::<_, RdpError>((channels, security))
    }
    .await;

    match connected {
        Ok((channels, security)) => {
            let pdu = PduLayer::new(channels.user_id(), config.capabilities());
            Ok(Session::new(framed, channels, security, pdu))
        }
        Err(error) => Err(abort(framed, error).await),
    }
}

/// Closes the stream after a failed connection step and hands the error back.
async fn abort(mut framed: Framed<ErasedStream>, error: RdpError) -> RdpError {
    match tokio::time::timeout(CLOSE_TIMEOUT, framed.shutdown()).await {
        Ok(Ok(())) => debug!("Stream closed"),
        Ok(Err(close_error)) => debug!(error = %close_error, "Failed to close the stream"),
        Err(_) => warn!("Timed out closing the stream"),
    }

    error
}

enum Termination {
    ShutdownAcknowledged,
    Disconnected(String),
}

/// The established connection: a reader driven by [`Session::run`] and a sender task.
struct Session {
    reader: Framed<ReadHalf<ErasedStream>>,
    sender: FrameSender,
    sender_task: ChildTask<io::Result<()>>,
    channels: ChannelLayer,
    security: SecurityLayer,
    pdu: PduLayer,
}

impl Session {
    fn new(framed: Framed<ErasedStream>, channels: ChannelLayer, security: SecurityLayer, pdu: PduLayer) -> Self {
        let max_frame_size = framed.max_frame_size();
        let (stream, leftover) = framed.into_inner();
        let (read_half, write_half) = tokio::io::split(stream);

        let (task, sender) = SenderTask::new(write_half);

        Self {
            reader: Framed::new_with_leftover(read_half, leftover, max_frame_size),
            sender,
            sender_task: task.spawn(),
            channels,
            security,
            pdu,
        }
    }

    #[instrument("session", skip_all)]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, events: &mpsc::Sender<RdpEvent>) -> RdpResult<()> {
        let result = match self.run_loop(&mut commands, events).await {
            Ok(Termination::ShutdownAcknowledged) => {
                emit(events, RdpEvent::Success).await;

                // Best effort: the server may already be gone.
                if let Ok(disconnect) = self.channels.encode_disconnect() {
                    let _ = self.sender.send(disconnect).await;
                }

                Ok(())
            }
            Ok(Termination::Disconnected(reason)) => Err(RdpError::ConnectionLost(Arc::new(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                reason,
            )))),
            Err(error) => Err(error),
        };

        self.close().await;

        result
    }

    async fn run_loop(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        events: &mpsc::Sender<RdpEvent>,
    ) -> RdpResult<Termination> {
        let mut commands_open = true;

        loop {
            tokio::select! {
                frame = self.reader.read_frame() => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(RdpError::ConnectionLost(_)) if self.pdu.shutdown_requested() => {
                            debug!("Server closed the connection after our shutdown request");
                            return Ok(Termination::ShutdownAcknowledged);
                        }
                        Err(error) => return Err(error),
                    };

                    if let Some(termination) = self.handle_frame(frame, events).await? {
                        return Ok(termination);
                    }
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(Command::Shutdown) => {
                            info!("Shutdown requested");
                            let outputs = self.pdu.request_shutdown();
                            if let Some(termination) = self.execute(outputs, events).await? {
                                return Ok(termination);
                            }
                        }
                        Some(Command::Input(input)) => {
                            if self.pdu.state() == ActivationState::Active {
                                let frame = self.security.encode_input(&input)?;
                                self.sender.send(frame).await?;
                            } else {
                                debug!(state = ?self.pdu.state(), "Dropping input received before activation");
                            }
                        }
                        None => commands_open = false,
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame, events: &mpsc::Sender<RdpEvent>) -> RdpResult<Option<Termination>> {
        let outputs = match frame {
            Frame::FastPath(bytes) => {
                let (header, payload) = FastPathHeader::decode(&bytes)?;
                let payload = self.security.unprotect_fast_path(&header, payload)?;
                self.pdu.process_fast_path(&payload)
            }
            Frame::SlowPath(bytes) => match self.channels.decode(&bytes)? {
                McsMessage::Disconnect(reason) => return Ok(Some(self.disconnected(reason))),
                McsMessage::Data { channel_id, user_data } => {
                    // Standard security runs one decryption stream across all channels.
                    let unprotected = self.security.unprotect(user_data)?;

                    if channel_id != self.channels.io_channel() {
                        trace!(channel_id, len = unprotected.payload.len(), "Ignoring virtual channel data");
                        return Ok(None);
                    }

                    if unprotected.flags.contains(SecurityFlags::LICENSE_PKT) {
                        debug!("Ignoring licensing PDU received after licensing");
                        return Ok(None);
                    }

                    let pdu = ShareControlPdu::decode(&unprotected.payload)?;
                    self.pdu.process(pdu)?
                }
            },
        };

        self.execute(outputs, events).await
    }

    async fn execute(
        &mut self,
        outputs: Vec<PduOutput>,
        events: &mpsc::Sender<RdpEvent>,
    ) -> RdpResult<Option<Termination>> {
        for output in outputs {
            match output {
                PduOutput::Send(pdu) => {
                    let mut payload = Vec::new();
                    pdu.encode(&mut payload)?;
                    let protected = self.security.protect(&payload)?;
                    self.sender.send(self.channels.encode_io(&protected)?).await?;
                }
                PduOutput::Emit(event) => emit(events, event).await,
                PduOutput::SaltedChecksum(salted) => self.security.set_salted_checksum(salted),
                PduOutput::ShutdownAcknowledged => return Ok(Some(Termination::ShutdownAcknowledged)),
            }
        }

        Ok(None)
    }

    fn disconnected(&self, reason: DisconnectReason) -> Termination {
        if self.pdu.shutdown_requested() {
            return Termination::ShutdownAcknowledged;
        }

        let error_info = self.pdu.error_info();
        warn!(%reason, %error_info, "Server disconnected");

        Termination::Disconnected(format!("server disconnected ({reason}), error info: {error_info}"))
    }

    async fn close(self) {
        let Self {
            sender, sender_task, ..
        } = self;

        // The sender task shuts the writer down once every handle is gone.
        drop(sender);

        match tokio::time::timeout(CLOSE_TIMEOUT, sender_task.join()).await {
            Ok(Ok(Ok(()))) => debug!("Stream closed"),
            Ok(Ok(Err(error))) => debug!(%error, "Failed to close the stream"),
            Ok(Err(error)) => warn!(%error, "Sender task failed"),
            Err(_) => warn!("Timed out closing the stream"),
        }
    }
}

async fn emit(events: &mpsc::Sender<RdpEvent>, event: RdpEvent) {
    trace!(event = event.name(), "Emit event");

    if events.send(event).await.is_err() {
        trace!("Event receiver is gone");
    }
}
