//! Scripted in-process RDP server for driving the client end to end.
//!
//! A [`ServerScript`] says how the server answers each connection phase; [`MockServer::serve`]
//! plays it over any byte stream and returns a [`ServerReport`] of what the client sent.

#[macro_use]
extern crate tracing;

mod framing;
mod security;
mod tls;

use anyhow::Context as _;
use proptest::prelude::*;
use rdp_proto::capabilities::{Bitmap, CapabilitySet, General, GeneralExtraFlags};
use rdp_proto::credssp::ts_request::{TS_REQUEST_VERSION, TsRequest};
use rdp_proto::credssp::{CredSsp as _, CredSspResult, CredSspServer};
use rdp_proto::encryption::{CLIENT_RANDOM_SIZE, LicensingKeys};
use rdp_proto::fast_path::{Fragmentation, FastPathInputEvent, UpdateCode, UpdateFragment, decode_input_events};
use rdp_proto::gcc::{
    self, EncryptionLevel, EncryptionMethod, RDP_VERSION_5_PLUS, ServerCoreData, ServerGccBlocks, ServerNetworkData,
    ServerSecurityData,
};
use rdp_proto::license::{
    LicenseErrorCode, LicenseErrorMessage, LicensePdu, LicenseRequest, PREMASTER_SECRET_SIZE, PlatformChallenge,
    ST_TOTAL_ABORT,
};
use rdp_proto::mcs::{ConnectInitial, ConnectResponse, DisconnectReason, DomainParameters, DomainPdu, RESULT_SUCCESSFUL, SendData};
use rdp_proto::nego::{
    ConnectionConfirm, ConnectionRequest, FailureCode, NegotiatedProtocol, NegotiationResponseFlags, ProtocolSet,
    SecurityProtocol, select_protocol,
};
use rdp_proto::sec::{ClientInfo, SecurityExchangePdu, SecurityFlags, SecurityHeader};
use rdp_proto::share::{
    ConfirmActive, ControlAction, DemandActive, ErrorInfo, SERVER_CHANNEL_ID, ShareControlMessage, ShareControlPdu,
    ShareDataPdu,
};
use rdp_proto::sspi::AuthIdentity;
use rdp_proto::tpdu;
use rdp_proto::update::{BitmapData, BitmapEncoding, BitmapUpdate};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;

use crate::framing::ServerFramed;
use crate::security::ServerSecurity;

pub const IO_CHANNEL_ID: u16 = 1003;
pub const USER_CHANNEL_ID: u16 = 1007;
pub const SHARE_ID: u32 = 0x0001_03EA;

const FIRST_STATIC_CHANNEL_ID: u16 = 1004;
/// MCS user id the server sends its own PDUs under.
const SERVER_INITIATOR: u16 = 1002;
/// rt-no-such-channel
const CHANNEL_JOIN_REFUSED: u8 = 14;
const LOGON_INFO_TYPE: u32 = 0;
const PLATFORM_CHALLENGE: &[u8] = b"scripted platform challenge\0";
const CHALLENGE_RESPONSE_HEADER_SIZE: usize = 8;
const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// Ends the scripted exchange early without it being a server failure.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Halt {
    #[error("client closed the connection")]
    ClientGone,
    #[error("script ended the connection")]
    ScriptEnded,
}

/// How licensing goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseReply {
    /// `STATUS_VALID_CLIENT` straight away.
    ValidClient,
    /// License request, platform challenge, then a new license.
    Challenge,
    Deny(LicenseErrorCode),
}

/// One update batch sent once the session is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedUpdate {
    FastPathBitmap(Vec<BitmapData>),
    /// Same as `FastPathBitmap`, split across two fast-path frames.
    FragmentedBitmap(Vec<BitmapData>),
    SlowPathBitmap(Vec<BitmapData>),
    /// A bitmap update whose rectangle is inverted.
    Malformed,
}

/// What the server does after the updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ending {
    /// Records input until the client asks to shut down, denies the request, then waits for the
    /// client to disconnect.
    AwaitShutdown,
    /// Sets the error info, then sends a disconnect provider ultimatum.
    Disconnect(ErrorInfo),
    /// Closes the transport without a word.
    Hangup,
}

#[derive(Debug, Clone)]
pub struct ServerScript {
    pub protocols: ProtocolSet,
    /// Refuses negotiation with this code whatever the client offers.
    pub failure: Option<FailureCode>,
    pub identity: AuthIdentity,
    /// Early user authorization result, sent when the client offers `HYBRID_EX`.
    pub early_user_auth: Option<u32>,
    /// Methods usable under standard security; empty keeps the connection unencrypted.
    pub encryption_methods: EncryptionMethod,
    pub salted_checksum: bool,
    /// Hands out certificates whose RSA modulus is zero.
    pub zero_modulus_certificate: bool,
    pub refused_channel: Option<u16>,
    pub license: LicenseReply,
    /// Sends Granted Control before Cooperate.
    pub swap_finalization: bool,
    pub logon: bool,
    pub updates: Vec<ScriptedUpdate>,
    pub ending: Ending,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            protocols: ProtocolSet::all(),
            failure: None,
            identity: AuthIdentity::new("alice", "CONTOSO", "hunter2"),
            early_user_auth: None,
            encryption_methods: EncryptionMethod::empty(),
            salted_checksum: false,
            zero_modulus_certificate: false,
            refused_channel: None,
            license: LicenseReply::ValidClient,
            swap_finalization: false,
            logon: true,
            updates: Vec::new(),
            ending: Ending::AwaitShutdown,
        }
    }
}

impl ServerScript {
    /// Standard RDP security only, with the given encryption methods.
    pub fn standard_security(encryption_methods: EncryptionMethod) -> Self {
        Self {
            protocols: ProtocolSet::PLAIN,
            encryption_methods,
            ..Self::default()
        }
    }
}

/// What the client did, as seen by the server.
#[derive(Debug, Default)]
pub struct ServerReport {
    pub cookie: Option<String>,
    pub requested: Option<SecurityProtocol>,
    pub selected: Option<NegotiatedProtocol>,
    pub authenticated: bool,
    pub mcs_connected: bool,
    pub joined_channels: Vec<u16>,
    pub client_info: Option<ClientInfo>,
    /// Standard security session keys were established.
    pub encrypted: bool,
    pub license_challenge_answered: bool,
    pub confirm_active: Option<ConfirmActive>,
    /// Names of the share PDUs received after the client info, in order.
    pub client_pdus: Vec<&'static str>,
    pub input_events: Vec<FastPathInputEvent>,
    pub shutdown_requested: bool,
    pub disconnect_received: bool,
}

enum ClientFrame {
    Share(ShareControlPdu),
    Input(Vec<FastPathInputEvent>),
    Disconnect,
}

pub struct MockServer {
    script: ServerScript,
    report: ServerReport,
    security: ServerSecurity,
}

impl MockServer {
    pub fn new(script: ServerScript) -> Self {
        Self {
            script,
            report: ServerReport::default(),
            security: ServerSecurity::none(),
        }
    }

    /// Plays the script. The client hanging up, or the script ending the connection on purpose,
    /// still yields a report.
    pub async fn serve<S>(mut self, stream: S) -> anyhow::Result<ServerReport>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.run(ServerFramed::new(Box::new(stream))).await {
            Ok(()) => Ok(self.report),
            Err(error) => match error.downcast_ref::<Halt>() {
                Some(halt) => {
                    debug!(%halt, "Scripted server stopped");
                    Ok(self.report)
                }
                None => Err(error),
            },
        }
    }

    pub fn spawn<S>(self, stream: S) -> JoinHandle<anyhow::Result<ServerReport>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(self.serve(stream))
    }

    async fn run(&mut self, mut framed: ServerFramed) -> anyhow::Result<()> {
        let (protocol, early_user_auth) = self.negotiate(&mut framed).await?;

        if protocol != NegotiatedProtocol::Plain {
            let (acceptor, public_key) = tls::acceptor()?;
            let stream = acceptor
                .accept(framed.into_inner()?)
                .await
                .context("TLS handshake")?;
            framed = ServerFramed::new(Box::new(stream));

            if protocol == NegotiatedProtocol::HybridCredentialDelegation {
                self.authenticate(&mut framed, public_key, early_user_auth).await?;
            }
        }

        let security = self.connect_domain(&mut framed, protocol).await?;
        self.secure(&mut framed, security).await?;
        self.license(&mut framed).await?;
        self.activate(&mut framed).await?;
        self.send_updates(&mut framed).await?;

        match self.script.ending.clone() {
            Ending::AwaitShutdown => self.await_shutdown(&mut framed).await,
            Ending::Disconnect(error_info) => {
                self.send_data(&mut framed, ShareDataPdu::SetErrorInfo(error_info)).await?;
                framed
                    .write_domain_pdu(&DomainPdu::DisconnectProviderUltimatum {
                        reason: DisconnectReason::PROVIDER_INITIATED,
                    })
                    .await
            }
            Ending::Hangup => framed.shutdown().await,
        }
    }

    /// Returns the selected protocol and whether an early user authorization result is due.
    async fn negotiate(&mut self, framed: &mut ServerFramed) -> anyhow::Result<(NegotiatedProtocol, bool)> {
        let frame = framed.read_frame().await?;
        let request = ConnectionRequest::decode(&frame)?;
        debug!(cookie = ?request.cookie, requested = ?request.protocol, "Connection request");

        self.report.cookie = request.cookie;
        self.report.requested = Some(request.protocol);

        let offered = ProtocolSet::from_requested(request.protocol);
        let protocol = match (self.script.failure, select_protocol(offered, self.script.protocols)) {
            (None, Some(protocol)) => protocol,
            (failure, _) => {
                let code = failure.unwrap_or_else(|| refusal(self.script.protocols));
                let mut confirm = Vec::new();
                ConnectionConfirm::Failure { code }.encode(&mut confirm)?;
                framed.write_all(&confirm).await?;
                return Err(Halt::ScriptEnded.into());
            }
        };

        let early_user_auth = protocol == NegotiatedProtocol::HybridCredentialDelegation
            && self.script.early_user_auth.is_some()
            && request.protocol.contains(SecurityProtocol::HYBRID_EX);

        let selected = match protocol {
            NegotiatedProtocol::Plain => SecurityProtocol::RDP,
            NegotiatedProtocol::TransportEncrypted => SecurityProtocol::SSL,
            NegotiatedProtocol::HybridCredentialDelegation if early_user_auth => SecurityProtocol::HYBRID_EX,
            NegotiatedProtocol::HybridCredentialDelegation => SecurityProtocol::HYBRID,
        };

        let mut confirm = Vec::new();
        ConnectionConfirm::Response {
            flags: NegotiationResponseFlags::EXTENDED_CLIENT_DATA_SUPPORTED,
            protocol: selected,
        }
        .encode(&mut confirm)?;
        framed.write_all(&confirm).await?;

        self.report.selected = Some(protocol);
        Ok((protocol, early_user_auth))
    }

    async fn authenticate(
        &mut self,
        framed: &mut ServerFramed,
        public_key: Vec<u8>,
        early_user_auth: bool,
    ) -> anyhow::Result<()> {
        let mut credssp = CredSspServer::new(public_key, self.script.identity.clone(), TS_REQUEST_VERSION);

        loop {
            let bytes = framed.read_by_hint(TsRequest::frame_length).await?;
            let ts_request = TsRequest::decode(&bytes)?;

            match credssp.update_ts_request(ts_request).and_then(|()| credssp.process()) {
                Ok(CredSspResult::ReplyNeeded(reply)) => framed.write_all(&reply.encode()?).await?,
                Ok(CredSspResult::FinalMessage(_) | CredSspResult::Finished) => break,
                Err(error) => {
                    debug!(%error, "Rejecting credentials");
                    let reply = TsRequest::error(credssp.version(), error.nt_status());
                    framed.write_all(&reply.encode()?).await?;
                    return Err(Halt::ScriptEnded.into());
                }
            }
        }

        self.report.authenticated = true;

        if let Some(result) = self.script.early_user_auth.filter(|_| early_user_auth) {
            framed.write_all(&result.to_le_bytes()).await?;
            if result != 0 {
                return Err(Halt::ScriptEnded.into());
            }
        }

        Ok(())
    }

    /// MCS connect through the last channel join. Returns the server random and encryption method
    /// when standard security is on.
    async fn connect_domain(
        &mut self,
        framed: &mut ServerFramed,
        protocol: NegotiatedProtocol,
    ) -> anyhow::Result<Option<([u8; 32], EncryptionMethod)>> {
        let connect_initial = ConnectInitial::decode(&framed.read_mcs().await?)?;
        let client_blocks = gcc::decode_conference_create_request(&connect_initial.user_data)?;
        self.report.mcs_connected = true;

        let requested_channels = client_blocks.network.as_ref().map_or(0, |network| network.channels.len());
        let channel_ids: Vec<u16> = (FIRST_STATIC_CHANNEL_ID..)
            .filter(|id| *id != USER_CHANNEL_ID)
            .take(requested_channels)
            .collect();

        let method = match protocol {
            NegotiatedProtocol::Plain => strongest(self.script.encryption_methods & client_blocks.security.encryption_methods),
            _ => EncryptionMethod::empty(),
        };

        let (security_data, security) = if method.is_empty() {
            (ServerSecurityData::none(), None)
        } else {
            let server_random: [u8; 32] = rand::random();
            let data = ServerSecurityData {
                encryption_method: method,
                encryption_level: EncryptionLevel::CLIENT_COMPATIBLE,
                server_random: Some(server_random),
                server_certificate: security::server_certificate(self.script.zero_modulus_certificate)?,
            };
            (data, Some((server_random, method)))
        };

        let mut user_data = Vec::new();
        gcc::encode_conference_create_response(
            &mut user_data,
            &ServerGccBlocks {
                core: ServerCoreData {
                    version: RDP_VERSION_5_PLUS,
                    client_requested_protocols: self.report.requested.map(|requested| requested.bits()),
                    early_capability_flags: None,
                },
                security: security_data,
                network: ServerNetworkData {
                    io_channel: IO_CHANNEL_ID,
                    channel_ids: channel_ids.clone(),
                },
            },
        )?;

        let mut response = Vec::new();
        ConnectResponse {
            result: RESULT_SUCCESSFUL,
            called_connect_id: 0,
            domain_parameters: DomainParameters::target(),
            user_data,
        }
        .encode(&mut response)?;
        framed.write_slow_path(&response).await?;

        let erect_domain = framed.read_mcs().await?;
        anyhow::ensure!(
            matches!(DomainPdu::decode(&erect_domain)?, DomainPdu::ErectDomainRequest { .. }),
            "expected an erect domain request"
        );

        let attach_user = framed.read_mcs().await?;
        anyhow::ensure!(
            matches!(DomainPdu::decode(&attach_user)?, DomainPdu::AttachUserRequest),
            "expected an attach user request"
        );
        framed
            .write_domain_pdu(&DomainPdu::AttachUserConfirm {
                result: RESULT_SUCCESSFUL,
                initiator: Some(USER_CHANNEL_ID),
            })
            .await?;

        // User channel, I/O channel, then every static channel.
        for _ in 0..channel_ids.len() + 2 {
            let join = framed.read_mcs().await?;
            let DomainPdu::ChannelJoinRequest { initiator, channel_id } = DomainPdu::decode(&join)? else {
                anyhow::bail!("expected a channel join request");
            };

            let refused = self.script.refused_channel == Some(channel_id);
            framed
                .write_domain_pdu(&DomainPdu::ChannelJoinConfirm {
                    result: if refused { CHANNEL_JOIN_REFUSED } else { RESULT_SUCCESSFUL },
                    initiator,
                    requested: channel_id,
                    channel_id: Some(channel_id),
                })
                .await?;

            if refused {
                return Err(Halt::ScriptEnded.into());
            }
            self.report.joined_channels.push(channel_id);
        }

        Ok(security)
    }

    /// Security exchange when standard security is on, then the client info.
    async fn secure(
        &mut self,
        framed: &mut ServerFramed,
        security: Option<([u8; 32], EncryptionMethod)>,
    ) -> anyhow::Result<()> {
        if let Some((server_random, method)) = security {
            let user_data = self.read_io(framed).await?;
            let mut src = user_data.as_slice();
            let header = SecurityHeader::decode(&mut src)?;
            anyhow::ensure!(
                header.flags.contains(SecurityFlags::EXCHANGE_PKT),
                "expected a security exchange PDU"
            );

            let exchange = SecurityExchangePdu::decode(src)?;
            let client_random = security::decrypt(&exchange.encrypted_client_random, CLIENT_RANDOM_SIZE);
            self.security = ServerSecurity::standard(&client_random, &server_random, method)?;
            self.report.encrypted = true;
            debug!(?method, "Session keys established");
        }

        let user_data = self.read_io(framed).await?;
        let (flags, payload) = self.security.unprotect(&user_data, true)?;
        anyhow::ensure!(flags.contains(SecurityFlags::INFO_PKT), "expected the client info PDU");

        let client_info = ClientInfo::decode(&payload)?;
        debug!(username = %client_info.username, domain = %client_info.domain, "Client info");
        self.report.client_info = Some(client_info);

        Ok(())
    }

    async fn license(&mut self, framed: &mut ServerFramed) -> anyhow::Result<()> {
        match self.script.license.clone() {
            LicenseReply::ValidClient => {
                self.send_license(framed, &LicensePdu::ErrorAlert(LicenseErrorMessage::valid_client()))
                    .await
            }
            LicenseReply::Deny(error_code) => {
                let denial = LicenseErrorMessage {
                    error_code,
                    state_transition: ST_TOTAL_ABORT,
                    error_info: Vec::new(),
                };
                self.send_license(framed, &LicensePdu::ErrorAlert(denial)).await?;
                Err(Halt::ScriptEnded.into())
            }
            LicenseReply::Challenge => self.license_challenge(framed).await,
        }
    }

    async fn license_challenge(&mut self, framed: &mut ServerFramed) -> anyhow::Result<()> {
        let server_random: [u8; 32] = rand::random();
        let request = LicenseRequest {
            server_random,
            product_version: 0x0006_0000,
            company_name: b"Contoso\0".to_vec(),
            product_id: b"A02\0".to_vec(),
            server_certificate: security::server_certificate(self.script.zero_modulus_certificate)?,
            scopes: vec![b"contoso.com\0".to_vec()],
        };
        self.send_license(framed, &LicensePdu::LicenseRequest(request)).await?;

        let LicensePdu::NewLicenseRequest(new_license) = self.read_license(framed).await? else {
            anyhow::bail!("expected a new license request");
        };

        let premaster_secret = security::decrypt(&new_license.encrypted_premaster_secret, PREMASTER_SECRET_SIZE);
        let keys = LicensingKeys::derive(&premaster_secret, &new_license.client_random, &server_random);

        let challenge = PlatformChallenge {
            encrypted_challenge: keys.rc4()?.process_vec(PLATFORM_CHALLENGE),
            mac: keys.mac(PLATFORM_CHALLENGE),
        };
        self.send_license(framed, &LicensePdu::PlatformChallenge(challenge)).await?;

        let LicensePdu::PlatformChallengeResponse(response) = self.read_license(framed).await? else {
            anyhow::bail!("expected a platform challenge response");
        };

        let decrypted = keys.rc4()?.process_vec(&response.encrypted_response);
        anyhow::ensure!(
            decrypted.get(CHALLENGE_RESPONSE_HEADER_SIZE..) == Some(PLATFORM_CHALLENGE),
            "platform challenge answered with the wrong data"
        );
        self.report.license_challenge_answered = true;

        self.send_license(framed, &LicensePdu::NewLicense(b"scripted license".to_vec()))
            .await
    }

    async fn activate(&mut self, framed: &mut ServerFramed) -> anyhow::Result<()> {
        let mut extra_flags = GeneralExtraFlags::FASTPATH_OUTPUT_SUPPORTED;
        if self.script.salted_checksum {
            extra_flags |= GeneralExtraFlags::ENC_SALTED_CHECKSUM;
        }

        let demand = DemandActive {
            share_id: SHARE_ID,
            source_descriptor: b"RDP\0".to_vec(),
            capability_sets: vec![
                CapabilitySet::General(General {
                    os_major_type: 1,
                    os_minor_type: 3,
                    extra_flags,
                    refresh_rect_support: true,
                    suppress_output_support: true,
                }),
                CapabilitySet::Bitmap(Bitmap {
                    preferred_bits_per_pixel: 16,
                    desktop_width: 1024,
                    desktop_height: 768,
                    desktop_resize: true,
                    drawing_flags: 0,
                }),
            ],
            session_id: 0,
        };
        self.send_share(
            framed,
            &ShareControlPdu::new(SERVER_CHANNEL_ID, ShareControlMessage::DemandActive(demand)),
        )
        .await?;
        self.security.set_salted(self.script.salted_checksum);

        // Confirm Active, then Synchronize, Cooperate, Request Control and Font List.
        for _ in 0..5 {
            match self.read_client(framed).await? {
                ClientFrame::Share(pdu) => self.record(pdu),
                ClientFrame::Input(_) => anyhow::bail!("input received before activation"),
                ClientFrame::Disconnect => {
                    self.report.disconnect_received = true;
                    return Err(Halt::ClientGone.into());
                }
            }
        }

        let mut finalization = vec![
            ShareDataPdu::Synchronize {
                target_user: USER_CHANNEL_ID,
            },
            control(ControlAction::Cooperate),
            control(ControlAction::GrantedControl),
            ShareDataPdu::FontMap,
        ];
        if self.script.swap_finalization {
            finalization.swap(1, 2);
        }
        if self.script.logon {
            finalization.push(ShareDataPdu::SaveSessionInfo {
                info_type: LOGON_INFO_TYPE,
            });
        }

        for pdu in finalization {
            self.send_data(framed, pdu).await?;
        }

        Ok(())
    }

    async fn send_updates(&mut self, framed: &mut ServerFramed) -> anyhow::Result<()> {
        for update in self.script.updates.clone() {
            match update {
                ScriptedUpdate::FastPathBitmap(rectangles) => {
                    let data = bitmap_update(rectangles)?;
                    self.send_fast_path(framed, &[(Fragmentation::Single, &data)]).await?;
                }
                ScriptedUpdate::FragmentedBitmap(rectangles) => {
                    let data = bitmap_update(rectangles)?;
                    let (first, last) = data.split_at(data.len() / 2);
                    self.send_fast_path(framed, &[(Fragmentation::First, first)]).await?;
                    self.send_fast_path(framed, &[(Fragmentation::Last, last)]).await?;
                }
                ScriptedUpdate::SlowPathBitmap(rectangles) => {
                    let data = bitmap_update(rectangles)?;
                    self.send_data(framed, ShareDataPdu::Update(data)).await?;
                }
                ScriptedUpdate::Malformed => {
                    let mut rectangle = solid_rectangle(8, 8, 4, 4);
                    rectangle.right = rectangle.left - 1;
                    let data = bitmap_update(vec![rectangle])?;
                    self.send_fast_path(framed, &[(Fragmentation::Single, &data)]).await?;
                }
            }
        }

        Ok(())
    }

    async fn await_shutdown(&mut self, framed: &mut ServerFramed) -> anyhow::Result<()> {
        loop {
            match self.read_client(framed).await? {
                ClientFrame::Input(events) => {
                    trace!(count = events.len(), "Input events");
                    self.report.input_events.extend(events);
                }
                ClientFrame::Share(pdu) => {
                    let shutdown = is_shutdown_request(&pdu);
                    self.record(pdu);
                    if shutdown {
                        self.send_data(framed, ShareDataPdu::ShutdownDenied).await?;
                    }
                }
                ClientFrame::Disconnect => {
                    self.report.disconnect_received = true;
                    return Ok(());
                }
            }
        }
    }

    fn record(&mut self, pdu: ShareControlPdu) {
        match pdu.message {
            ShareControlMessage::ConfirmActive(confirm) => {
                self.report.client_pdus.push("ConfirmActive");
                self.report.confirm_active = Some(confirm);
            }
            ShareControlMessage::Data { pdu, .. } => {
                if pdu == ShareDataPdu::ShutdownRequest {
                    self.report.shutdown_requested = true;
                }
                self.report.client_pdus.push(pdu.name());
            }
            ShareControlMessage::DemandActive(_) => self.report.client_pdus.push("DemandActive"),
            ShareControlMessage::DeactivateAll { .. } => self.report.client_pdus.push("DeactivateAll"),
            ShareControlMessage::ServerRedirect(_) => self.report.client_pdus.push("ServerRedirect"),
        }
    }

    /// User data of the next Send Data Request on the I/O channel.
    async fn read_io(&mut self, framed: &mut ServerFramed) -> anyhow::Result<Vec<u8>> {
        let pdu = framed.read_mcs().await?;

        match DomainPdu::decode(&pdu)? {
            DomainPdu::SendDataRequest(SendData {
                channel_id, user_data, ..
            }) if channel_id == IO_CHANNEL_ID => Ok(user_data.to_vec()),
            DomainPdu::DisconnectProviderUltimatum { .. } => {
                self.report.disconnect_received = true;
                Err(Halt::ClientGone.into())
            }
            other => anyhow::bail!("unexpected {} during connection setup", other.name()),
        }
    }

    async fn read_license(&mut self, framed: &mut ServerFramed) -> anyhow::Result<LicensePdu> {
        let user_data = self.read_io(framed).await?;
        let (flags, payload) = self.security.unprotect(&user_data, true)?;
        anyhow::ensure!(flags.contains(SecurityFlags::LICENSE_PKT), "expected a licensing PDU");
        Ok(LicensePdu::decode(&payload)?)
    }

    async fn read_client(&mut self, framed: &mut ServerFramed) -> anyhow::Result<ClientFrame> {
        let frame = framed.read_frame().await?;

        if frame.first() != Some(&tpdu::TPKT_VERSION) {
            let (num_events, payload) = self.security.unprotect_fast_path(&frame)?;
            return Ok(ClientFrame::Input(decode_input_events(&payload, num_events)?));
        }

        match DomainPdu::decode(tpdu::decode_x224_data(&frame)?)? {
            DomainPdu::SendDataRequest(data) if data.channel_id == IO_CHANNEL_ID => {
                let (_, payload) = self.security.unprotect(data.user_data, false)?;
                Ok(ClientFrame::Share(ShareControlPdu::decode(&payload)?))
            }
            DomainPdu::SendDataRequest(data) => {
                anyhow::bail!("unexpected data on channel {}", data.channel_id)
            }
            DomainPdu::DisconnectProviderUltimatum { .. } => Ok(ClientFrame::Disconnect),
            other => anyhow::bail!("unexpected {} in an active session", other.name()),
        }
    }

    async fn send_io(&mut self, framed: &mut ServerFramed, user_data: &[u8]) -> anyhow::Result<()> {
        framed
            .write_domain_pdu(&DomainPdu::SendDataIndication(SendData {
                initiator: SERVER_INITIATOR,
                channel_id: IO_CHANNEL_ID,
                user_data,
            }))
            .await
    }

    /// Licensing PDUs from the server are never encrypted.
    async fn send_license(&mut self, framed: &mut ServerFramed, pdu: &LicensePdu) -> anyhow::Result<()> {
        let mut user_data = Vec::new();
        SecurityHeader::basic(SecurityFlags::LICENSE_PKT).encode(&mut user_data);
        pdu.encode(&mut user_data)?;
        self.send_io(framed, &user_data).await
    }

    async fn send_share(&mut self, framed: &mut ServerFramed, pdu: &ShareControlPdu) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        pdu.encode(&mut payload)?;
        let user_data = self.security.protect(&payload)?;
        self.send_io(framed, &user_data).await
    }

    async fn send_data(&mut self, framed: &mut ServerFramed, pdu: ShareDataPdu) -> anyhow::Result<()> {
        self.send_share(framed, &ShareControlPdu::data(SERVER_CHANNEL_ID, SHARE_ID, pdu))
            .await
    }

    async fn send_fast_path(
        &mut self,
        framed: &mut ServerFramed,
        fragments: &[(Fragmentation, &[u8])],
    ) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        for (fragmentation, data) in fragments {
            UpdateFragment {
                code: UpdateCode::Bitmap as u8,
                fragmentation: *fragmentation,
                data: *data,
            }
            .encode(&mut payload)?;
        }

        let frame = self.security.protect_fast_path(&payload)?;
        framed.write_all(&frame).await
    }
}

/// Starts a scripted server on one end of an in-memory pipe and returns the other end.
pub fn start(script: ServerScript) -> (DuplexStream, JoinHandle<anyhow::Result<ServerReport>>) {
    let (client, server) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
    (client, MockServer::new(script).spawn(server))
}

/// Uncompressed 16 bpp rectangle filled with `x`.
pub fn solid_rectangle(x: u16, y: u16, width: u16, height: u16) -> BitmapData {
    BitmapData {
        left: x,
        top: y,
        right: x + width - 1,
        bottom: y + height - 1,
        width,
        height,
        bits_per_pixel: 16,
        encoding: BitmapEncoding::Raw,
        compressed_header: None,
        data: vec![x.to_le_bytes()[0]; usize::from(width) * usize::from(height) * 2],
    }
}

prop_compose! {
    pub fn bitmap_rectangle()(
        x in 0u16..1000,
        y in 0u16..700,
        width in 1u16..=16,
        height in 1u16..=16,
    ) -> BitmapData {
        solid_rectangle(x, y, width, height)
    }
}

pub fn bitmap_batch() -> impl Strategy<Value = Vec<BitmapData>> {
    prop::collection::vec(bitmap_rectangle(), 1..4)
}

fn bitmap_update(rectangles: Vec<BitmapData>) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    BitmapUpdate { rectangles }.encode(&mut data)?;
    Ok(data)
}

fn control(action: ControlAction) -> ShareDataPdu {
    ShareDataPdu::Control {
        action,
        grant_id: if action == ControlAction::GrantedControl { USER_CHANNEL_ID } else { 0 },
        control_id: if action == ControlAction::GrantedControl {
            u32::from(SERVER_CHANNEL_ID)
        } else {
            0
        },
    }
}

fn is_shutdown_request(pdu: &ShareControlPdu) -> bool {
    matches!(
        &pdu.message,
        ShareControlMessage::Data {
            pdu: ShareDataPdu::ShutdownRequest,
            ..
        }
    )
}

/// Failure code for a client that offered none of the allowed protocols.
fn refusal(allowed: ProtocolSet) -> FailureCode {
    if allowed.contains(ProtocolSet::HYBRID) {
        FailureCode::HYBRID_REQUIRED_BY_SERVER
    } else if allowed.contains(ProtocolSet::TRANSPORT_ENCRYPTED) {
        FailureCode::SSL_REQUIRED_BY_SERVER
    } else {
        FailureCode::SSL_NOT_ALLOWED_BY_SERVER
    }
}

fn strongest(methods: EncryptionMethod) -> EncryptionMethod {
    [EncryptionMethod::BIT_128, EncryptionMethod::BIT_56, EncryptionMethod::BIT_40]
        .into_iter()
        .find(|method| methods.contains(*method))
        .unwrap_or(EncryptionMethod::empty())
}
