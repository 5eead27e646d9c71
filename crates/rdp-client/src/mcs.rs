//! MCS domain setup: connect, attach user and channel joins, then the channel multiplexing used by
//! every layer above.

use rdp_proto::gcc::{
    self, ChannelDef, ChannelOptions, ClientCoreData, ClientEarlyCapabilityFlags, ClientGccBlocks, ClientNetworkData,
    ClientSecurityData, EncryptionMethod, ServerGccBlocks, SupportedColorDepths,
};
use rdp_proto::mcs::{ConnectInitial, ConnectResponse, DisconnectReason, DomainPdu, RESULT_SUCCESSFUL, SendData};
use rdp_proto::nego::NegotiatedProtocol;
use rdp_proto::tpdu;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ClientConfig;
use crate::error::{RdpError, RdpResult};
use crate::negotiation::Negotiation;
use crate::transport::{Frame, Framed, encode_slow_path};

const CLIENT_BUILD: u32 = 2600;
const IBM_ENHANCED_KEYBOARD: u32 = 4;
const FUNCTION_KEYS: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// The channel named after the attached user.
    User,
    /// The global I/O channel carrying share control PDUs.
    Io,
    /// A static virtual channel requested by name.
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u16,
    pub name: String,
    pub kind: ChannelKind,
}

/// Payload of an inbound MCS PDU once the domain is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McsMessage<'a> {
    Data { channel_id: u16, user_data: &'a [u8] },
    Disconnect(DisconnectReason),
}

/// The joined MCS domain: who we are and which channels carry what.
#[derive(Debug, Clone)]
pub struct ChannelLayer {
    user_id: u16,
    io_channel: u16,
    channels: Vec<Channel>,
}

impl ChannelLayer {
    pub fn new(user_id: u16, io_channel: u16, channels: Vec<Channel>) -> Self {
        Self {
            user_id,
            io_channel,
            channels,
        }
    }

    pub fn user_id(&self) -> u16 {
        self.user_id
    }

    pub fn io_channel(&self) -> u16 {
        self.io_channel
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: u16) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id == id)
    }

    /// Wraps `user_data` into a Send Data Request on `channel_id`, ready for the wire.
    pub fn encode_send_data(&self, channel_id: u16, user_data: &[u8]) -> RdpResult<Vec<u8>> {
        encode_domain_pdu(&DomainPdu::SendDataRequest(SendData {
            initiator: self.user_id,
            channel_id,
            user_data,
        }))
    }

    pub fn encode_io(&self, user_data: &[u8]) -> RdpResult<Vec<u8>> {
        self.encode_send_data(self.io_channel, user_data)
    }

    pub fn encode_disconnect(&self) -> RdpResult<Vec<u8>> {
        encode_domain_pdu(&DomainPdu::DisconnectProviderUltimatum {
            reason: DisconnectReason::USER_REQUESTED,
        })
    }

    pub fn decode<'a>(&self, frame: &'a [u8]) -> RdpResult<McsMessage<'a>> {
        let payload = tpdu::decode_x224_data(frame)?;

        match DomainPdu::decode(payload)? {
            DomainPdu::SendDataIndication(data) => Ok(McsMessage::Data {
                channel_id: data.channel_id,
                user_data: data.user_data,
            }),
            DomainPdu::DisconnectProviderUltimatum { reason } => Ok(McsMessage::Disconnect(reason)),
            other => Err(RdpError::protocol(format!("unexpected MCS {}", other.name()))),
        }
    }
}

pub fn client_gcc_blocks(config: &ClientConfig, negotiation: &Negotiation) -> ClientGccBlocks {
    let mut early_capability_flags = ClientEarlyCapabilityFlags::SUPPORT_ERRINFO_PDU;
    if config.color_depth == 32 {
        early_capability_flags |= ClientEarlyCapabilityFlags::WANT_32BPP_SESSION;
    }

    // Standard RDP security is the only mode where the MCS layer carries encryption.
    let encryption_methods = if negotiation.protocol == NegotiatedProtocol::Plain {
        EncryptionMethod::BIT_40 | EncryptionMethod::BIT_56 | EncryptionMethod::BIT_128
    } else {
        EncryptionMethod::empty()
    };

    let network = (!config.channels.is_empty()).then(|| ClientNetworkData {
        channels: config
            .channels
            .iter()
            .map(|name| ChannelDef {
                name: name.clone(),
                options: ChannelOptions::INITIALIZED | ChannelOptions::ENCRYPT_RDP,
            })
            .collect(),
    });

    ClientGccBlocks {
        core: ClientCoreData {
            version: gcc::RDP_VERSION_5_PLUS,
            desktop_width: config.desktop_width,
            desktop_height: config.desktop_height,
            keyboard_layout: config.keyboard_layout,
            client_build: CLIENT_BUILD,
            client_name: config.client_name.chars().take(15).collect(),
            keyboard_type: IBM_ENHANCED_KEYBOARD,
            keyboard_subtype: 0,
            keyboard_function_key: FUNCTION_KEYS,
            high_color_depth: config.color_depth.min(24),
            supported_color_depths: SupportedColorDepths::all(),
            early_capability_flags,
            connection_type: 0,
            server_selected_protocol: negotiation.selected.bits(),
        },
        security: ClientSecurityData {
            encryption_methods,
            ext_encryption_methods: 0,
        },
        network,
        cluster: None,
    }
}

/// Runs connect-initial through the last channel join.
#[instrument(skip_all)]
pub async fn connect<S>(
    framed: &mut Framed<S>,
    config: &ClientConfig,
    negotiation: &Negotiation,
) -> RdpResult<(ChannelLayer, ServerGccBlocks)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut user_data = Vec::new();
    gcc::encode_conference_create_request(&mut user_data, &client_gcc_blocks(config, negotiation))?;

    let mut connect_initial = Vec::new();
    ConnectInitial::new(user_data).encode(&mut connect_initial)?;
    framed.write_all(&encode_slow_path(&connect_initial)?).await?;

    let frame = read_slow_path(framed).await?;
    let response = ConnectResponse::decode(tpdu::decode_x224_data(&frame)?)?;
    if response.result != RESULT_SUCCESSFUL {
        warn!(result = response.result, "MCS connect refused");
        return Err(RdpError::ChannelSetupFailed(0));
    }

    let server_blocks = gcc::decode_conference_create_response(&response.user_data)?;
    debug!(
        io_channel = server_blocks.network.io_channel,
        channels = ?server_blocks.network.channel_ids,
        encryption_method = ?server_blocks.security.encryption_method,
        "MCS connect response"
    );

    framed
        .write_all(&encode_domain_pdu(&DomainPdu::ErectDomainRequest {
            sub_height: 0,
            sub_interval: 0,
        })?)
        .await?;
    framed.write_all(&encode_domain_pdu(&DomainPdu::AttachUserRequest)?).await?;

    let frame = read_slow_path(framed).await?;
    let user_id = match DomainPdu::decode(tpdu::decode_x224_data(&frame)?)? {
        DomainPdu::AttachUserConfirm {
            result: RESULT_SUCCESSFUL,
            initiator: Some(user_id),
        } => user_id,
        DomainPdu::AttachUserConfirm { result, .. } => {
            warn!(result, "Attach user refused");
            return Err(RdpError::ChannelSetupFailed(0));
        }
        other => return Err(unexpected(&other)),
    };

    let mut channels = vec![
        Channel {
            id: user_id,
            name: "user".to_owned(),
            kind: ChannelKind::User,
        },
        Channel {
            id: server_blocks.network.io_channel,
            name: "global".to_owned(),
            kind: ChannelKind::Io,
        },
    ];

    // Channels the server did not assign come back as zero and are never joined.
    channels.extend(
        config
            .channels
            .iter()
            .zip(&server_blocks.network.channel_ids)
            .filter(|(_, id)| **id != 0)
            .map(|(name, id)| Channel {
                id: *id,
                name: name.clone(),
                kind: ChannelKind::Static,
            }),
    );

    for channel in &channels {
        join_channel(framed, user_id, channel.id).await?;
        trace!(id = channel.id, name = %channel.name, "Joined channel");
    }

    info!(user_id, channels = channels.len(), "MCS domain joined");

    Ok((
        ChannelLayer::new(user_id, server_blocks.network.io_channel, channels),
        server_blocks,
    ))
}

async fn join_channel<S>(framed: &mut Framed<S>, user_id: u16, channel_id: u16) -> RdpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .write_all(&encode_domain_pdu(&DomainPdu::ChannelJoinRequest {
            initiator: user_id,
            channel_id,
        })?)
        .await?;

    let frame = read_slow_path(framed).await?;
    match DomainPdu::decode(tpdu::decode_x224_data(&frame)?)? {
        DomainPdu::ChannelJoinConfirm {
            result: RESULT_SUCCESSFUL,
            requested,
            ..
        } if requested == channel_id => Ok(()),
        DomainPdu::ChannelJoinConfirm { result, requested, .. } => {
            warn!(result, requested, channel_id, "Channel join refused");
            Err(RdpError::ChannelSetupFailed(channel_id))
        }
        other => Err(unexpected(&other)),
    }
}

pub(crate) async fn read_slow_path<S>(framed: &mut Framed<S>) -> RdpResult<bytes::Bytes>
where
    S: AsyncRead + Unpin,
{
    match framed.read_frame().await? {
        Frame::SlowPath(frame) => Ok(frame),
        Frame::FastPath(_) => Err(RdpError::protocol("fast-path frame received during connection setup")),
    }
}

fn encode_domain_pdu(pdu: &DomainPdu<'_>) -> RdpResult<Vec<u8>> {
    let mut payload = Vec::new();
    pdu.encode(&mut payload)?;
    encode_slow_path(&payload)
}

fn unexpected(pdu: &DomainPdu<'_>) -> RdpError {
    match pdu {
        DomainPdu::DisconnectProviderUltimatum { reason } => RdpError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            format!("server disconnected during channel setup ({reason})"),
        )),
        other => RdpError::protocol(format!("unexpected MCS {}", other.name())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rdp_proto::gcc::{ServerCoreData, ServerNetworkData, ServerSecurityData};
    use rdp_proto::mcs::DomainParameters;
    use rdp_proto::nego::{NegotiationResponseFlags, SecurityProtocol};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::config::Credentials;

    fn config(channels: &[&str]) -> ClientConfig {
        ClientConfig::builder()
            .credentials(Credentials::builder().username("alice").password("hunter2").build())
            .channels(channels.iter().map(|name| (*name).to_owned()).collect())
            .build()
    }

    fn negotiation() -> Negotiation {
        Negotiation {
            protocol: NegotiatedProtocol::TransportEncrypted,
            selected: SecurityProtocol::SSL,
            flags: NegotiationResponseFlags::empty(),
        }
    }

    async fn read_domain_pdu(framed: &mut Framed<DuplexStream>) -> Vec<u8> {
        let frame = read_slow_path(framed).await.unwrap();
        tpdu::decode_x224_data(&frame).unwrap().to_vec()
    }

    /// Plays the server side up to the channel joins, refusing to join `refused`.
    async fn serve(stream: DuplexStream, channel_ids: Vec<u16>, refused: u16) {
        let mut framed = Framed::new(stream, 0xFFFF);

        let _connect_initial = read_domain_pdu(&mut framed).await;

        let mut user_data = Vec::new();
        gcc::encode_conference_create_response(
            &mut user_data,
            &ServerGccBlocks {
                core: ServerCoreData {
                    version: gcc::RDP_VERSION_5_PLUS,
                    client_requested_protocols: Some(SecurityProtocol::SSL.bits()),
                    early_capability_flags: None,
                },
                security: ServerSecurityData::none(),
                network: ServerNetworkData {
                    io_channel: 1003,
                    channel_ids,
                },
            },
        )
        .unwrap();
        let mut response = Vec::new();
        ConnectResponse {
            result: RESULT_SUCCESSFUL,
            called_connect_id: 0,
            domain_parameters: DomainParameters::target(),
            user_data,
        }
        .encode(&mut response)
        .unwrap();
        framed.write_all(&encode_slow_path(&response).unwrap()).await.unwrap();

        let _erect_domain = read_domain_pdu(&mut framed).await;
        let _attach_user = read_domain_pdu(&mut framed).await;
        framed
            .write_all(
                &encode_domain_pdu(&DomainPdu::AttachUserConfirm {
                    result: RESULT_SUCCESSFUL,
                    initiator: Some(1007),
                })
                .unwrap(),
            )
            .await
            .unwrap();

        // Runs until the client hangs up.
        while let Ok(frame) = read_slow_path(&mut framed).await {
            let pdu = tpdu::decode_x224_data(&frame).unwrap();
            let DomainPdu::ChannelJoinRequest { initiator, channel_id } = DomainPdu::decode(pdu).unwrap() else {
                panic!("expected a channel join request");
            };
            let result = if channel_id == refused { 14 } else { RESULT_SUCCESSFUL };
            framed
                .write_all(
                    &encode_domain_pdu(&DomainPdu::ChannelJoinConfirm {
                        result,
                        initiator,
                        requested: channel_id,
                        channel_id: Some(channel_id),
                    })
                    .unwrap(),
                )
                .await
                .unwrap();
            if result != RESULT_SUCCESSFUL {
                return;
            }
        }
    }

    #[tokio::test]
    async fn joins_user_io_and_static_channels() {
        let (client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve(server, vec![1004, 0], 0));

        let mut framed = Framed::new(client, 0xFFFF);
        let (layer, blocks) = connect(&mut framed, &config(&["cliprdr", "rdpsnd"]), &negotiation())
            .await
            .unwrap();

        assert_eq!(layer.user_id(), 1007);
        assert_eq!(layer.io_channel(), 1003);
        assert_eq!(blocks.network.channel_ids, vec![1004, 0]);

        let ids: Vec<u16> = layer.channels().iter().map(|channel| channel.id).collect();
        assert_eq!(ids, vec![1007, 1003, 1004]);
        assert_eq!(layer.channel(1004).unwrap().name, "cliprdr");

        drop(framed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_join_names_the_channel() {
        let (client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve(server, vec![1004], 1004));

        let mut framed = Framed::new(client, 0xFFFF);
        let result = connect(&mut framed, &config(&["cliprdr"]), &negotiation()).await;

        assert!(matches!(result, Err(RdpError::ChannelSetupFailed(1004))));
        server.await.unwrap();
    }

    #[test]
    fn send_data_indications_are_demultiplexed() {
        let layer = ChannelLayer::new(1007, 1003, Vec::new());

        let frame = encode_domain_pdu(&DomainPdu::SendDataIndication(SendData {
            initiator: 1002,
            channel_id: 1003,
            user_data: b"payload",
        }))
        .unwrap();
        assert_eq!(
            layer.decode(&frame).unwrap(),
            McsMessage::Data {
                channel_id: 1003,
                user_data: b"payload"
            }
        );

        let frame = encode_domain_pdu(&DomainPdu::DisconnectProviderUltimatum {
            reason: DisconnectReason::PROVIDER_INITIATED,
        })
        .unwrap();
        assert_eq!(
            layer.decode(&frame).unwrap(),
            McsMessage::Disconnect(DisconnectReason::PROVIDER_INITIATED)
        );

        let frame = encode_domain_pdu(&DomainPdu::AttachUserRequest).unwrap();
        assert!(matches!(layer.decode(&frame), Err(RdpError::Protocol(_))));
    }
}
