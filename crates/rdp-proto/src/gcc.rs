//! GCC Conference Create Request / Response (T.124) and the RDP client/server data blocks they carry
//! (MS-RDPBCGR 2.2.1.3 and 2.2.1.4).

use bitflags::bitflags;
use bytes::{Buf as _, BufMut as _};

use crate::per;
use crate::utils::{put_utf16_fixed, read_array, split_to, u16_len, u32_len};
use crate::{Error, Result};

const T124_02_98_OID: [u8; 6] = [0, 0, 20, 124, 0, 1];
const H221_CS_KEY: &[u8; 4] = b"Duca";
const H221_SC_KEY: &[u8; 4] = b"McDn";
const MCS_RESULT_ENUM_LENGTH: u8 = 16;
const NODE_ID_BASE: u16 = 1001;

const CS_CORE: u16 = 0xC001;
const CS_SECURITY: u16 = 0xC002;
const CS_NET: u16 = 0xC003;
const CS_CLUSTER: u16 = 0xC004;
const SC_CORE: u16 = 0x0C01;
const SC_SECURITY: u16 = 0x0C02;
const SC_NET: u16 = 0x0C03;

const DATA_BLOCK_HEADER_SIZE: usize = 4;

pub const RDP_VERSION_5_PLUS: u32 = 0x0008_0004;
pub const CHANNEL_NAME_SIZE: usize = 8;

const RNS_UD_COLOR_8BPP: u16 = 0xCA01;
const RNS_UD_SAS_DEL: u16 = 0xAA03;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EncryptionMethod: u32 {
        const BIT_40 = 0x0000_0001;
        const BIT_128 = 0x0000_0002;
        const BIT_56 = 0x0000_0008;
        const FIPS = 0x0000_0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionLevel(pub u32);

impl EncryptionLevel {
    pub const NONE: Self = Self(0);
    pub const LOW: Self = Self(1);
    pub const CLIENT_COMPATIBLE: Self = Self(2);
    pub const HIGH: Self = Self(3);
    pub const FIPS: Self = Self(4);
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SupportedColorDepths: u16 {
        const BPP_24 = 0x0001;
        const BPP_16 = 0x0002;
        const BPP_15 = 0x0004;
        const BPP_32 = 0x0008;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientEarlyCapabilityFlags: u16 {
        const SUPPORT_ERRINFO_PDU = 0x0001;
        const WANT_32BPP_SESSION = 0x0002;
        const SUPPORT_STATUSINFO_PDU = 0x0004;
        const STRONG_ASYMMETRIC_KEYS = 0x0008;
        const VALID_CONNECTION_TYPE = 0x0020;
        const SUPPORT_MONITOR_LAYOUT_PDU = 0x0040;
        const SUPPORT_NETCHAR_AUTODETECT = 0x0080;
        const SUPPORT_DYNVC_GFX_PROTOCOL = 0x0100;
        const SUPPORT_DYNAMIC_TIME_ZONE = 0x0200;
        const SUPPORT_HEARTBEAT_PDU = 0x0400;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelOptions: u32 {
        const INITIALIZED = 0x8000_0000;
        const ENCRYPT_RDP = 0x4000_0000;
        const ENCRYPT_SC = 0x2000_0000;
        const ENCRYPT_CS = 0x1000_0000;
        const PRI_HIGH = 0x0800_0000;
        const PRI_MED = 0x0400_0000;
        const PRI_LOW = 0x0200_0000;
        const COMPRESS_RDP = 0x0080_0000;
        const COMPRESS = 0x0040_0000;
        const SHOW_PROTOCOL = 0x0020_0000;
        const REMOTE_CONTROL_PERSISTENT = 0x0010_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCoreData {
    pub version: u32,
    pub desktop_width: u16,
    pub desktop_height: u16,
    pub keyboard_layout: u32,
    pub client_build: u32,
    pub client_name: String,
    pub keyboard_type: u32,
    pub keyboard_subtype: u32,
    pub keyboard_function_key: u32,
    pub high_color_depth: u16,
    pub supported_color_depths: SupportedColorDepths,
    pub early_capability_flags: ClientEarlyCapabilityFlags,
    pub connection_type: u8,
    pub server_selected_protocol: u32,
}

impl ClientCoreData {
    const NAME: &'static str = "TS_UD_CS_CORE";
    const BODY_SIZE: usize = 212;

    fn encode(&self, dst: &mut Vec<u8>) {
        dst.put_u32_le(self.version);
        dst.put_u16_le(self.desktop_width);
        dst.put_u16_le(self.desktop_height);
        dst.put_u16_le(RNS_UD_COLOR_8BPP); // colorDepth, superseded by highColorDepth
        dst.put_u16_le(RNS_UD_SAS_DEL);
        dst.put_u32_le(self.keyboard_layout);
        dst.put_u32_le(self.client_build);
        put_utf16_fixed(dst, &self.client_name, 32);
        dst.put_u32_le(self.keyboard_type);
        dst.put_u32_le(self.keyboard_subtype);
        dst.put_u32_le(self.keyboard_function_key);
        dst.put_bytes(0, 64); // imeFileName
        dst.put_u16_le(RNS_UD_COLOR_8BPP); // postBeta2ColorDepth
        dst.put_u16_le(1); // clientProductId
        dst.put_u32_le(0); // serialNumber
        dst.put_u16_le(self.high_color_depth);
        dst.put_u16_le(self.supported_color_depths.bits());
        dst.put_u16_le(self.early_capability_flags.bits());
        dst.put_bytes(0, 64); // clientDigProductId
        dst.put_u8(self.connection_type);
        dst.put_u8(0); // pad1octet
        dst.put_u32_le(self.server_selected_protocol);
    }

    fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[Self::BODY_SIZE] for Self::NAME);

        let version = src.get_u32_le();
        let desktop_width = src.get_u16_le();
        let desktop_height = src.get_u16_le();
        let _color_depth = src.get_u16_le();
        let _sas_sequence = src.get_u16_le();
        let keyboard_layout = src.get_u32_le();
        let client_build = src.get_u32_le();
        let client_name = crate::utils::from_utf16_bytes(split_to(&mut src, 32, Self::NAME)?);
        let keyboard_type = src.get_u32_le();
        let keyboard_subtype = src.get_u32_le();
        let keyboard_function_key = src.get_u32_le();
        src.advance(64);
        let _post_beta2_color_depth = src.get_u16_le();
        let _client_product_id = src.get_u16_le();
        let _serial_number = src.get_u32_le();
        let high_color_depth = src.get_u16_le();
        let supported_color_depths = SupportedColorDepths::from_bits_truncate(src.get_u16_le());
        let early_capability_flags = ClientEarlyCapabilityFlags::from_bits_truncate(src.get_u16_le());
        src.advance(64);
        let connection_type = src.get_u8();
        let _pad = src.get_u8();
        let server_selected_protocol = src.get_u32_le();

        Ok(Self {
            version,
            desktop_width,
            desktop_height,
            keyboard_layout,
            client_build,
            client_name,
            keyboard_type,
            keyboard_subtype,
            keyboard_function_key,
            high_color_depth,
            supported_color_depths,
            early_capability_flags,
            connection_type,
            server_selected_protocol,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSecurityData {
    pub encryption_methods: EncryptionMethod,
    pub ext_encryption_methods: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDef {
    pub name: String,
    pub options: ChannelOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientNetworkData {
    pub channels: Vec<ChannelDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientClusterData {
    pub flags: u32,
    pub redirected_session_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientGccBlocks {
    pub core: ClientCoreData,
    pub security: ClientSecurityData,
    pub network: Option<ClientNetworkData>,
    pub cluster: Option<ClientClusterData>,
}

impl ClientGccBlocks {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut core = Vec::with_capacity(ClientCoreData::BODY_SIZE);
        self.core.encode(&mut core);
        write_block(dst, CS_CORE, &core)?;

        let mut security = Vec::with_capacity(8);
        security.put_u32_le(self.security.encryption_methods.bits());
        security.put_u32_le(self.security.ext_encryption_methods);
        write_block(dst, CS_SECURITY, &security)?;

        if let Some(network) = &self.network {
            let mut body = Vec::with_capacity(4 + network.channels.len() * 12);
            body.put_u32_le(u32_len(network.channels.len(), "TS_UD_CS_NET channelCount")?);
            for channel in &network.channels {
                let mut name = [0u8; CHANNEL_NAME_SIZE];
                let len = channel.name.len().min(CHANNEL_NAME_SIZE - 1);
                name[..len].copy_from_slice(&channel.name.as_bytes()[..len]);
                body.put_slice(&name);
                body.put_u32_le(channel.options.bits());
            }
            write_block(dst, CS_NET, &body)?;
        }

        if let Some(cluster) = &self.cluster {
            let mut body = Vec::with_capacity(8);
            body.put_u32_le(cluster.flags);
            body.put_u32_le(cluster.redirected_session_id);
            write_block(dst, CS_CLUSTER, &body)?;
        }

        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut core = None;
        let mut security = None;
        let mut network = None;
        let mut cluster = None;

        for block in DataBlocks(src) {
            let (ty, mut body) = block?;
            match ty {
                CS_CORE => core = Some(ClientCoreData::decode(body)?),
                CS_SECURITY => {
                    ensure_size!(body[8] for "TS_UD_CS_SEC");
                    security = Some(ClientSecurityData {
                        encryption_methods: EncryptionMethod::from_bits_truncate(body.get_u32_le()),
                        ext_encryption_methods: body.get_u32_le(),
                    });
                }
                CS_NET => {
                    ensure_size!(body[4] for "TS_UD_CS_NET");
                    let count = body.get_u32_le() as usize;
                    let mut channels = Vec::with_capacity(count.min(31));
                    for _ in 0..count {
                        ensure_size!(body[12] for "CHANNEL_DEF");
                        let name = split_to(&mut body, CHANNEL_NAME_SIZE, "CHANNEL_DEF")?;
                        let name_len = name.iter().position(|b| *b == 0).unwrap_or(CHANNEL_NAME_SIZE);
                        channels.push(ChannelDef {
                            name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
                            options: ChannelOptions::from_bits_truncate(body.get_u32_le()),
                        });
                    }
                    network = Some(ClientNetworkData { channels });
                }
                CS_CLUSTER => {
                    ensure_size!(body[8] for "TS_UD_CS_CLUSTER");
                    cluster = Some(ClientClusterData {
                        flags: body.get_u32_le(),
                        redirected_session_id: body.get_u32_le(),
                    });
                }
                _ => {}
            }
        }

        Ok(Self {
            core: core.ok_or_else(|| Error::invalid("client data blocks", "CS_CORE", "missing"))?,
            security: security.ok_or_else(|| Error::invalid("client data blocks", "CS_SECURITY", "missing"))?,
            network,
            cluster,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerCoreData {
    pub version: u32,
    pub client_requested_protocols: Option<u32>,
    pub early_capability_flags: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSecurityData {
    pub encryption_method: EncryptionMethod,
    pub encryption_level: EncryptionLevel,
    pub server_random: Option<[u8; 32]>,
    pub server_certificate: Vec<u8>,
}

impl ServerSecurityData {
    pub fn none() -> Self {
        Self {
            encryption_method: EncryptionMethod::empty(),
            encryption_level: EncryptionLevel::NONE,
            server_random: None,
            server_certificate: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNetworkData {
    pub io_channel: u16,
    pub channel_ids: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerGccBlocks {
    pub core: ServerCoreData,
    pub security: ServerSecurityData,
    pub network: ServerNetworkData,
}

impl ServerGccBlocks {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut core = Vec::with_capacity(12);
        core.put_u32_le(self.core.version);
        if let Some(requested) = self.core.client_requested_protocols {
            core.put_u32_le(requested);
            if let Some(flags) = self.core.early_capability_flags {
                core.put_u32_le(flags);
            }
        }
        write_block(dst, SC_CORE, &core)?;

        let mut security = Vec::new();
        security.put_u32_le(self.security.encryption_method.bits());
        security.put_u32_le(self.security.encryption_level.0);
        if let Some(random) = &self.security.server_random {
            security.put_u32_le(32);
            security.put_u32_le(u32_len(self.security.server_certificate.len(), "serverCertLen")?);
            security.put_slice(random);
            security.put_slice(&self.security.server_certificate);
        }
        write_block(dst, SC_SECURITY, &security)?;

        let mut network = Vec::new();
        network.put_u16_le(self.network.io_channel);
        network.put_u16_le(u16_len(self.network.channel_ids.len(), "channelCount")?);
        for id in &self.network.channel_ids {
            network.put_u16_le(*id);
        }
        if self.network.channel_ids.len() % 2 == 1 {
            network.put_u16_le(0); // pad
        }
        write_block(dst, SC_NET, &network)?;

        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut core = None;
        let mut security = None;
        let mut network = None;

        for block in DataBlocks(src) {
            let (ty, mut body) = block?;
            match ty {
                SC_CORE => {
                    ensure_size!(body[4] for "TS_UD_SC_CORE");
                    let version = body.get_u32_le();
                    let client_requested_protocols = (body.len() >= 4).then(|| body.get_u32_le());
                    let early_capability_flags = (body.len() >= 4).then(|| body.get_u32_le());
                    core = Some(ServerCoreData {
                        version,
                        client_requested_protocols,
                        early_capability_flags,
                    });
                }
                SC_SECURITY => security = Some(decode_server_security(body)?),
                SC_NET => {
                    ensure_size!(body[4] for "TS_UD_SC_NET");
                    let io_channel = body.get_u16_le();
                    let count = usize::from(body.get_u16_le());
                    ensure_size!(body[count * 2] for "TS_UD_SC_NET channelIdArray");
                    let channel_ids = (0..count).map(|_| body.get_u16_le()).collect();
                    network = Some(ServerNetworkData {
                        io_channel,
                        channel_ids,
                    });
                }
                _ => {}
            }
        }

        Ok(Self {
            core: core.ok_or_else(|| Error::invalid("server data blocks", "SC_CORE", "missing"))?,
            security: security.unwrap_or_else(ServerSecurityData::none),
            network: network.ok_or_else(|| Error::invalid("server data blocks", "SC_NET", "missing"))?,
        })
    }
}

fn decode_server_security(mut body: &[u8]) -> Result<ServerSecurityData> {
    ensure_size!(body[8] for "TS_UD_SC_SEC1");
    let encryption_method = EncryptionMethod::from_bits_truncate(body.get_u32_le());
    let encryption_level = EncryptionLevel(body.get_u32_le());

    if encryption_method.is_empty() && encryption_level == EncryptionLevel::NONE {
        return Ok(ServerSecurityData::none());
    }

    ensure_size!(body[8] for "TS_UD_SC_SEC1");
    let random_len = body.get_u32_le() as usize;
    let cert_len = body.get_u32_le() as usize;

    if random_len != 32 {
        return Err(Error::invalid("TS_UD_SC_SEC1", "serverRandomLen", "must be 32"));
    }

    let server_random = read_array::<32>(&mut body, "TS_UD_SC_SEC1 serverRandom")?;
    let server_certificate = split_to(&mut body, cert_len, "TS_UD_SC_SEC1 serverCertificate")?.to_vec();

    Ok(ServerSecurityData {
        encryption_method,
        encryption_level,
        server_random: Some(server_random),
        server_certificate,
    })
}

fn write_block(dst: &mut Vec<u8>, ty: u16, body: &[u8]) -> Result<()> {
    dst.put_u16_le(ty);
    dst.put_u16_le(u16_len(body.len() + DATA_BLOCK_HEADER_SIZE, "user data block")?);
    dst.put_slice(body);
    Ok(())
}

struct DataBlocks<'a>(&'a [u8]);

impl<'a> Iterator for DataBlocks<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.len() < DATA_BLOCK_HEADER_SIZE {
            return None;
        }

        let mut src = self.0;
        let ty = src.get_u16_le();
        let length = usize::from(src.get_u16_le());

        let item = length
            .checked_sub(DATA_BLOCK_HEADER_SIZE)
            .ok_or_else(|| Error::invalid("user data block", "length", "shorter than its header"))
            .and_then(|body_len| split_to(&mut src, body_len, "user data block"));

        match item {
            Ok(body) => {
                self.0 = src;
                Some(Ok((ty, body)))
            }
            Err(e) => {
                self.0 = &[];
                Some(Err(e))
            }
        }
    }
}

/// Conference Create Request wrapping the client data blocks.
pub fn encode_conference_create_request(dst: &mut Vec<u8>, blocks: &ClientGccBlocks) -> Result<()> {
    let mut user_data = Vec::with_capacity(512);
    blocks.encode(&mut user_data)?;
    let user_data_len = u16_len(user_data.len(), "GCC user data")?;

    let mut connect_pdu = Vec::with_capacity(user_data.len() + 16);
    per::write_choice(&mut connect_pdu, 0); // ConnectGCCPDU: conferenceCreateRequest
    per::write_selection(&mut connect_pdu, 0x08); // optional userData present
    per::write_numeric_string(&mut connect_pdu, b"1", 1)?; // conferenceName
    per::write_padding(&mut connect_pdu, 1);
    per::write_number_of_sets(&mut connect_pdu, 1);
    per::write_choice(&mut connect_pdu, 0xC0); // value present, h221NonStandard
    per::write_octet_string(&mut connect_pdu, H221_CS_KEY, 4)?;
    per::write_length(&mut connect_pdu, user_data_len);
    connect_pdu.extend_from_slice(&user_data);

    per::write_choice(dst, 0); // Key: object
    per::write_object_identifier(dst, T124_02_98_OID);
    per::write_length(dst, u16_len(connect_pdu.len(), "GCC connect PDU")?);
    dst.extend_from_slice(&connect_pdu);

    Ok(())
}

pub fn decode_conference_create_request(mut src: &[u8]) -> Result<ClientGccBlocks> {
    read_t124_header(&mut src)?;

    let _choice = per::read_choice(&mut src)?;
    let _selection = per::read_selection(&mut src)?;
    per::read_numeric_string(&mut src, 1)?;
    per::read_padding(&mut src, 1)?;
    let _sets = per::read_number_of_sets(&mut src)?;
    let _choice = per::read_choice(&mut src)?;
    let key = per::read_octet_string(&mut src, 4)?;
    if key != H221_CS_KEY {
        return Err(Error::invalid("GCC conference create request", "h221NonStandard", "unexpected key"));
    }

    let user_data = per::read_octet_string(&mut src, 0)?;

    ClientGccBlocks::decode(user_data)
}

/// Conference Create Response wrapping the server data blocks.
pub fn encode_conference_create_response(dst: &mut Vec<u8>, blocks: &ServerGccBlocks) -> Result<()> {
    let mut user_data = Vec::with_capacity(256);
    blocks.encode(&mut user_data)?;
    let user_data_len = u16_len(user_data.len(), "GCC user data")?;

    let mut connect_pdu = Vec::with_capacity(user_data.len() + 16);
    per::write_choice(&mut connect_pdu, 0x14); // conferenceCreateResponse
    per::write_u16(&mut connect_pdu, 0x79F3, NODE_ID_BASE)?; // nodeID
    per::write_integer(&mut connect_pdu, 1); // tag
    per::write_enumerated(&mut connect_pdu, 0); // result: success
    per::write_number_of_sets(&mut connect_pdu, 1);
    per::write_choice(&mut connect_pdu, 0xC0);
    per::write_octet_string(&mut connect_pdu, H221_SC_KEY, 4)?;
    per::write_length(&mut connect_pdu, user_data_len);
    connect_pdu.extend_from_slice(&user_data);

    per::write_choice(dst, 0);
    per::write_object_identifier(dst, T124_02_98_OID);
    per::write_length(dst, u16_len(connect_pdu.len(), "GCC connect PDU")?);
    dst.extend_from_slice(&connect_pdu);

    Ok(())
}

pub fn decode_conference_create_response(mut src: &[u8]) -> Result<ServerGccBlocks> {
    read_t124_header(&mut src)?;

    let _choice = per::read_choice(&mut src)?;
    let _node_id = per::read_u16(&mut src, NODE_ID_BASE)?;
    let _tag = per::read_integer(&mut src)?;
    let result = per::read_enumerated(&mut src, MCS_RESULT_ENUM_LENGTH)?;
    if result != 0 {
        return Err(Error::invalid("GCC conference create response", "result", "conference not created"));
    }
    let _sets = per::read_number_of_sets(&mut src)?;
    let _choice = per::read_choice(&mut src)?;
    let key = per::read_octet_string(&mut src, 4)?;
    if key != H221_SC_KEY {
        return Err(Error::invalid("GCC conference create response", "h221NonStandard", "unexpected key"));
    }

    let user_data = per::read_octet_string(&mut src, 0)?;

    ServerGccBlocks::decode(user_data)
}

fn read_t124_header(src: &mut &[u8]) -> Result<()> {
    let _key = per::read_choice(src)?;
    let oid = per::read_object_identifier(src)?;
    if oid != T124_02_98_OID {
        return Err(Error::invalid("GCC connect data", "t124Identifier", "unexpected object identifier"));
    }
    let _length = per::read_length(src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn client_blocks() -> ClientGccBlocks {
        ClientGccBlocks {
            core: ClientCoreData {
                version: RDP_VERSION_5_PLUS,
                desktop_width: 1024,
                desktop_height: 768,
                keyboard_layout: 0x409,
                client_build: 2600,
                client_name: "rdp-client".to_owned(),
                keyboard_type: 4,
                keyboard_subtype: 0,
                keyboard_function_key: 12,
                high_color_depth: 16,
                supported_color_depths: SupportedColorDepths::BPP_16 | SupportedColorDepths::BPP_24,
                early_capability_flags: ClientEarlyCapabilityFlags::SUPPORT_ERRINFO_PDU,
                connection_type: 0,
                server_selected_protocol: 2,
            },
            security: ClientSecurityData {
                encryption_methods: EncryptionMethod::BIT_128,
                ext_encryption_methods: 0,
            },
            network: Some(ClientNetworkData {
                channels: vec![ChannelDef {
                    name: "cliprdr".to_owned(),
                    options: ChannelOptions::INITIALIZED,
                }],
            }),
            cluster: None,
        }
    }

    #[test]
    fn client_core_block_has_the_documented_size() {
        let mut buf = Vec::new();
        client_blocks().encode(&mut buf).unwrap();
        assert_eq!(&buf[..4], [0x01, 0xC0, 0xD8, 0x00]);
    }

    #[test]
    fn conference_create_request_starts_with_t124_key() {
        let mut buf = Vec::new();
        encode_conference_create_request(&mut buf, &client_blocks()).unwrap();
        assert_eq!(&buf[..7], [0x00, 0x05, 0x00, 0x14, 0x7C, 0x00, 0x01]);

        let decoded = decode_conference_create_request(&buf).unwrap();
        assert_eq!(decoded, client_blocks());
    }

    #[test]
    fn conference_create_response_is_decoded() {
        let blocks = ServerGccBlocks {
            core: ServerCoreData {
                version: RDP_VERSION_5_PLUS,
                client_requested_protocols: Some(3),
                early_capability_flags: None,
            },
            security: ServerSecurityData::none(),
            network: ServerNetworkData {
                io_channel: 1003,
                channel_ids: vec![1004],
            },
        };
        let mut buf = Vec::new();
        encode_conference_create_response(&mut buf, &blocks).unwrap();

        assert_eq!(decode_conference_create_response(&buf).unwrap(), blocks);
    }

    #[test]
    fn truncated_data_block_is_an_error() {
        let src = [0x01, 0x0C, 0x20, 0x00, 0x04, 0x00];
        assert!(ServerGccBlocks::decode(&src).is_err());
    }
}
