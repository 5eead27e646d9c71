//! Share Control and Share Data PDUs: capability exchange, finalization and server notifications.

use bytes::{Buf as _, BufMut as _};

use crate::capabilities::{CapabilitySet, decode_capability_sets, encode_capability_sets};
use crate::utils::{split_to, u16_len};
use crate::{Error, Result};

pub const SHARE_CONTROL_HEADER_SIZE: usize = 6;
pub const SHARE_DATA_HEADER_SIZE: usize = 12;
pub const SERVER_CHANNEL_ID: u16 = 0x03EA;

const PROTOCOL_VERSION: u16 = 0x0010;
const STREAM_LOW: u8 = 0x01;
const PACKET_COMPRESSED: u8 = 0x20;
const SOURCE_DESCRIPTOR: &[u8] = b"MSTSC\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ShareControlPduType {
    DemandActive = 0x1,
    ConfirmActive = 0x3,
    DeactivateAll = 0x6,
    Data = 0x7,
    ServerRedirect = 0xA,
}

impl TryFrom<u16> for ShareControlPduType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x1 => Ok(Self::DemandActive),
            0x3 => Ok(Self::ConfirmActive),
            0x6 => Ok(Self::DeactivateAll),
            0x7 => Ok(Self::Data),
            0xA => Ok(Self::ServerRedirect),
            _ => Err(Error::UnexpectedMessage {
                name: "share control pduType",
                got: u32::from(value),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShareDataPduType {
    Update = 0x02,
    Control = 0x14,
    Pointer = 0x1B,
    Input = 0x1C,
    Synchronize = 0x1F,
    RefreshRectangle = 0x21,
    PlaySound = 0x22,
    SuppressOutput = 0x23,
    ShutdownRequest = 0x24,
    ShutdownDenied = 0x25,
    SaveSessionInfo = 0x26,
    FontList = 0x27,
    FontMap = 0x28,
    SetKeyboardIndicators = 0x29,
    SetErrorInfo = 0x2F,
    MonitorLayout = 0x37,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemandActive {
    pub share_id: u32,
    pub source_descriptor: Vec<u8>,
    pub capability_sets: Vec<CapabilitySet>,
    pub session_id: u32,
}

impl DemandActive {
    fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut caps = Vec::new();
        encode_capability_sets(&mut caps, &self.capability_sets)?;

        dst.put_u32_le(self.share_id);
        dst.put_u16_le(u16_len(self.source_descriptor.len(), "lengthSourceDescriptor")?);
        dst.put_u16_le(u16_len(caps.len() + 4, "lengthCombinedCapabilities")?);
        dst.put_slice(&self.source_descriptor);
        dst.put_u16_le(u16_len(self.capability_sets.len(), "numberCapabilities")?);
        dst.put_u16_le(0);
        dst.put_slice(&caps);
        dst.put_u32_le(self.session_id);
        Ok(())
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[8] for "TS_DEMAND_ACTIVE_PDU");
        let share_id = src.get_u32_le();
        let source_len = usize::from(src.get_u16_le());
        let combined_len = usize::from(src.get_u16_le());
        let source_descriptor = split_to(&mut src, source_len, "sourceDescriptor")?.to_vec();

        let mut combined = split_to(&mut src, combined_len, "combinedCapabilities")?;
        ensure_size!(combined[4] for "TS_DEMAND_ACTIVE_PDU numberCapabilities");
        let count = combined.get_u16_le();
        combined.advance(2);
        let capability_sets = decode_capability_sets(&mut combined, count)?;

        let session_id = if src.len() >= 4 { src.get_u32_le() } else { 0 };

        Ok(Self {
            share_id,
            source_descriptor,
            capability_sets,
            session_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmActive {
    pub share_id: u32,
    pub capability_sets: Vec<CapabilitySet>,
}

impl ConfirmActive {
    fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut caps = Vec::new();
        encode_capability_sets(&mut caps, &self.capability_sets)?;

        dst.put_u32_le(self.share_id);
        dst.put_u16_le(SERVER_CHANNEL_ID); // originatorId
        dst.put_u16_le(u16_len(SOURCE_DESCRIPTOR.len(), "lengthSourceDescriptor")?);
        dst.put_u16_le(u16_len(caps.len() + 4, "lengthCombinedCapabilities")?);
        dst.put_slice(SOURCE_DESCRIPTOR);
        dst.put_u16_le(u16_len(self.capability_sets.len(), "numberCapabilities")?);
        dst.put_u16_le(0);
        dst.put_slice(&caps);
        Ok(())
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[10] for "TS_CONFIRM_ACTIVE_PDU");
        let share_id = src.get_u32_le();
        let _originator_id = src.get_u16_le();
        let source_len = usize::from(src.get_u16_le());
        let combined_len = usize::from(src.get_u16_le());
        crate::utils::skip(&mut src, source_len, "sourceDescriptor")?;

        let mut combined = split_to(&mut src, combined_len, "combinedCapabilities")?;
        ensure_size!(combined[4] for "TS_CONFIRM_ACTIVE_PDU numberCapabilities");
        let count = combined.get_u16_le();
        combined.advance(2);
        let capability_sets = decode_capability_sets(&mut combined, count)?;

        Ok(Self {
            share_id,
            capability_sets,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlAction {
    RequestControl = 0x0001,
    GrantedControl = 0x0002,
    Detach = 0x0003,
    Cooperate = 0x0004,
}

impl TryFrom<u16> for ControlAction {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(Self::RequestControl),
            0x0002 => Ok(Self::GrantedControl),
            0x0003 => Ok(Self::Detach),
            0x0004 => Ok(Self::Cooperate),
            _ => Err(Error::UnexpectedMessage {
                name: "TS_CONTROL_PDU action",
                got: u32::from(value),
            }),
        }
    }
}

/// Set Error Info codes (MS-RDPBCGR 2.2.5.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo(pub u32);

impl ErrorInfo {
    pub const NONE: Self = Self(0x0000_0000);
    pub const RPC_INITIATED_DISCONNECT: Self = Self(0x0000_0001);
    pub const RPC_INITIATED_LOGOFF: Self = Self(0x0000_0002);
    pub const IDLE_TIMEOUT: Self = Self(0x0000_0003);
    pub const LOGON_TIMEOUT: Self = Self(0x0000_0004);
    pub const DISCONNECTED_BY_OTHER_CONNECTION: Self = Self(0x0000_0005);
    pub const OUT_OF_MEMORY: Self = Self(0x0000_0006);
    pub const SERVER_DENIED_CONNECTION: Self = Self(0x0000_0007);
    pub const SERVER_INSUFFICIENT_PRIVILEGES: Self = Self(0x0000_0009);
    pub const SERVER_FRESH_CREDENTIALS_REQUIRED: Self = Self(0x0000_000A);
    pub const RPC_INITIATED_DISCONNECT_BY_USER: Self = Self(0x0000_000B);
    pub const LOGOFF_BY_USER: Self = Self(0x0000_000C);
    pub const LICENSE_NO_LICENSE_SERVER: Self = Self(0x0000_0101);
    pub const LICENSE_NO_LICENSE: Self = Self(0x0000_0102);

    pub fn name(self) -> &'static str {
        match self {
            Self::NONE => "no error",
            Self::RPC_INITIATED_DISCONNECT => "disconnected by an administrative tool on the server",
            Self::RPC_INITIATED_LOGOFF => "logged off by an administrative tool on the server",
            Self::IDLE_TIMEOUT => "idle session time limit elapsed",
            Self::LOGON_TIMEOUT => "active session time limit elapsed",
            Self::DISCONNECTED_BY_OTHER_CONNECTION => "another user connected to the session",
            Self::OUT_OF_MEMORY => "the server ran out of memory",
            Self::SERVER_DENIED_CONNECTION => "the server denied the connection",
            Self::SERVER_INSUFFICIENT_PRIVILEGES => "the user cannot log on due to insufficient access privileges",
            Self::SERVER_FRESH_CREDENTIALS_REQUIRED => "the server requires fresh credentials",
            Self::RPC_INITIATED_DISCONNECT_BY_USER => "disconnected by the user",
            Self::LOGOFF_BY_USER => "logged off by the user",
            Self::LICENSE_NO_LICENSE_SERVER => "no license server available",
            Self::LICENSE_NO_LICENSE => "no client access license available",
            _ => "unknown error",
        }
    }
}

impl core::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} (0x{:X})", self.name(), self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareDataPdu {
    Synchronize { target_user: u16 },
    Control { action: ControlAction, grant_id: u16, control_id: u32 },
    FontList,
    FontMap,
    /// Slow-path graphics update, decoded by [`crate::update`].
    Update(Vec<u8>),
    /// Slow-path pointer update.
    Pointer(Vec<u8>),
    SaveSessionInfo { info_type: u32 },
    SetErrorInfo(ErrorInfo),
    ShutdownRequest,
    ShutdownDenied,
    Other { ty: u8, data: Vec<u8> },
}

impl ShareDataPdu {
    pub fn ty(&self) -> u8 {
        let ty = match self {
            Self::Synchronize { .. } => ShareDataPduType::Synchronize,
            Self::Control { .. } => ShareDataPduType::Control,
            Self::FontList => ShareDataPduType::FontList,
            Self::FontMap => ShareDataPduType::FontMap,
            Self::Update(_) => ShareDataPduType::Update,
            Self::Pointer(_) => ShareDataPduType::Pointer,
            Self::SaveSessionInfo { .. } => ShareDataPduType::SaveSessionInfo,
            Self::SetErrorInfo(_) => ShareDataPduType::SetErrorInfo,
            Self::ShutdownRequest => ShareDataPduType::ShutdownRequest,
            Self::ShutdownDenied => ShareDataPduType::ShutdownDenied,
            Self::Other { ty, .. } => return *ty,
        };
        ty as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Synchronize { .. } => "Synchronize",
            Self::Control { .. } => "Control",
            Self::FontList => "FontList",
            Self::FontMap => "FontMap",
            Self::Update(_) => "Update",
            Self::Pointer(_) => "Pointer",
            Self::SaveSessionInfo { .. } => "SaveSessionInfo",
            Self::SetErrorInfo(_) => "SetErrorInfo",
            Self::ShutdownRequest => "ShutdownRequest",
            Self::ShutdownDenied => "ShutdownDenied",
            Self::Other { .. } => "Other",
        }
    }

    fn encode_body(&self, dst: &mut Vec<u8>) {
        match self {
            Self::Synchronize { target_user } => {
                dst.put_u16_le(1); // SYNCMSGTYPE_SYNC
                dst.put_u16_le(*target_user);
            }
            Self::Control {
                action,
                grant_id,
                control_id,
            } => {
                dst.put_u16_le(*action as u16);
                dst.put_u16_le(*grant_id);
                dst.put_u32_le(*control_id);
            }
            Self::FontList => {
                dst.put_u16_le(0); // numberFonts
                dst.put_u16_le(0); // totalNumFonts
                dst.put_u16_le(0x0003); // FONTLIST_FIRST | FONTLIST_LAST
                dst.put_u16_le(0x0032); // entrySize
            }
            Self::FontMap => {
                dst.put_u16_le(0);
                dst.put_u16_le(0);
                dst.put_u16_le(0x0003);
                dst.put_u16_le(0x0004);
            }
            Self::Update(data) | Self::Pointer(data) | Self::Other { data, .. } => dst.put_slice(data),
            Self::SaveSessionInfo { info_type } => {
                dst.put_u32_le(*info_type);
                // Logon info version 2 padding
                dst.put_bytes(0, 4);
            }
            Self::SetErrorInfo(code) => dst.put_u32_le(code.0),
            Self::ShutdownRequest | Self::ShutdownDenied => {}
        }
    }

    fn decode_body(ty: u8, mut src: &[u8]) -> Result<Self> {
        let pdu = match ty {
            t if t == ShareDataPduType::Synchronize as u8 => {
                ensure_size!(src[4] for "TS_SYNCHRONIZE_PDU");
                let _message_type = src.get_u16_le();
                Self::Synchronize {
                    target_user: src.get_u16_le(),
                }
            }
            t if t == ShareDataPduType::Control as u8 => {
                ensure_size!(src[8] for "TS_CONTROL_PDU");
                Self::Control {
                    action: ControlAction::try_from(src.get_u16_le())?,
                    grant_id: src.get_u16_le(),
                    control_id: src.get_u32_le(),
                }
            }
            t if t == ShareDataPduType::FontList as u8 => Self::FontList,
            t if t == ShareDataPduType::FontMap as u8 => Self::FontMap,
            t if t == ShareDataPduType::Update as u8 => Self::Update(src.to_vec()),
            t if t == ShareDataPduType::Pointer as u8 => Self::Pointer(src.to_vec()),
            t if t == ShareDataPduType::SaveSessionInfo as u8 => {
                ensure_size!(src[4] for "TS_SAVE_SESSION_INFO_PDU_DATA");
                Self::SaveSessionInfo {
                    info_type: src.get_u32_le(),
                }
            }
            t if t == ShareDataPduType::SetErrorInfo as u8 => {
                ensure_size!(src[4] for "TS_SET_ERROR_INFO_PDU");
                Self::SetErrorInfo(ErrorInfo(src.get_u32_le()))
            }
            t if t == ShareDataPduType::ShutdownRequest as u8 => Self::ShutdownRequest,
            t if t == ShareDataPduType::ShutdownDenied as u8 => Self::ShutdownDenied,
            _ => Self::Other { ty, data: src.to_vec() },
        };

        Ok(pdu)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareControlMessage {
    DemandActive(DemandActive),
    ConfirmActive(ConfirmActive),
    DeactivateAll { share_id: u32 },
    Data { share_id: u32, pdu: ShareDataPdu },
    ServerRedirect(Vec<u8>),
}

/// A PDU carried on the I/O channel once the security layer is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareControlPdu {
    pub source: u16,
    pub message: ShareControlMessage,
}

impl ShareControlPdu {
    pub const NAME: &'static str = "TS_SHARECONTROLHEADER";

    pub fn new(source: u16, message: ShareControlMessage) -> Self {
        Self { source, message }
    }

    pub fn data(source: u16, share_id: u32, pdu: ShareDataPdu) -> Self {
        Self::new(source, ShareControlMessage::Data { share_id, pdu })
    }

    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut body = Vec::new();

        let ty = match &self.message {
            ShareControlMessage::DemandActive(pdu) => {
                pdu.encode_body(&mut body)?;
                ShareControlPduType::DemandActive
            }
            ShareControlMessage::ConfirmActive(pdu) => {
                pdu.encode_body(&mut body)?;
                ShareControlPduType::ConfirmActive
            }
            ShareControlMessage::DeactivateAll { share_id } => {
                body.put_u32_le(*share_id);
                body.put_u16_le(1);
                body.put_u8(0);
                ShareControlPduType::DeactivateAll
            }
            ShareControlMessage::Data { share_id, pdu } => {
                let mut data = Vec::new();
                pdu.encode_body(&mut data);

                body.put_u32_le(*share_id);
                body.put_u8(0);
                body.put_u8(STREAM_LOW);
                body.put_u16_le(u16_len(data.len() + 4, "uncompressedLength")?);
                body.put_u8(pdu.ty());
                body.put_u8(0); // compressedType
                body.put_u16_le(0); // compressedLength
                body.put_slice(&data);
                ShareControlPduType::Data
            }
            ShareControlMessage::ServerRedirect(data) => {
                body.put_slice(data);
                ShareControlPduType::ServerRedirect
            }
        };

        dst.put_u16_le(u16_len(body.len() + SHARE_CONTROL_HEADER_SIZE, "totalLength")?);
        dst.put_u16_le(ty as u16 | PROTOCOL_VERSION);
        dst.put_u16_le(self.source);
        dst.put_slice(&body);

        Ok(())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[SHARE_CONTROL_HEADER_SIZE] for Self::NAME);
        let total_length = usize::from(src.get_u16_le());
        let ty = ShareControlPduType::try_from(src.get_u16_le() & 0x000F)?;
        let source = src.get_u16_le();

        let body_len = total_length
            .checked_sub(SHARE_CONTROL_HEADER_SIZE)
            .ok_or_else(|| Error::invalid(Self::NAME, "totalLength", "shorter than the header"))?;
        let available = src.len();
        let mut body = split_to(&mut src, body_len.min(available), Self::NAME)?;

        let message = match ty {
            ShareControlPduType::DemandActive => ShareControlMessage::DemandActive(DemandActive::decode_body(body)?),
            ShareControlPduType::ConfirmActive => ShareControlMessage::ConfirmActive(ConfirmActive::decode_body(body)?),
            ShareControlPduType::DeactivateAll => {
                ensure_size!(body[4] for "TS_DEACTIVATE_ALL_PDU");
                ShareControlMessage::DeactivateAll {
                    share_id: body.get_u32_le(),
                }
            }
            ShareControlPduType::Data => {
                ensure_size!(body[SHARE_DATA_HEADER_SIZE] for "TS_SHAREDATAHEADER");
                let share_id = body.get_u32_le();
                let _pad = body.get_u8();
                let _stream_id = body.get_u8();
                let _uncompressed_length = body.get_u16_le();
                let pdu_type = body.get_u8();
                let compressed_type = body.get_u8();
                let _compressed_length = body.get_u16_le();

                if compressed_type & PACKET_COMPRESSED != 0 {
                    return Err(Error::invalid(
                        "TS_SHAREDATAHEADER",
                        "compressedType",
                        "bulk compression was not negotiated",
                    ));
                }

                ShareControlMessage::Data {
                    share_id,
                    pdu: ShareDataPdu::decode_body(pdu_type, body)?,
                }
            }
            ShareControlPduType::ServerRedirect => ShareControlMessage::ServerRedirect(body.to_vec()),
        };

        Ok(Self { source, message })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;
    use crate::capabilities::ClientCapabilities;

    fn encode(pdu: &ShareControlPdu) -> Vec<u8> {
        let mut buf = Vec::new();
        pdu.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn synchronize_bytes() {
        let pdu = ShareControlPdu::data(1007, 0x0001_03EA, ShareDataPdu::Synchronize { target_user: 0x03EA });
        assert_eq!(
            encode(&pdu),
            [
                0x16, 0x00, 0x17, 0x00, 0xEF, 0x03, // share control header
                0xEA, 0x03, 0x01, 0x00, 0x00, 0x01, 0x08, 0x00, 0x1F, 0x00, 0x00, 0x00, // share data header
                0x01, 0x00, 0xEA, 0x03,
            ]
        );
    }

    #[rstest]
    #[case(ShareDataPdu::Control { action: ControlAction::Cooperate, grant_id: 0, control_id: 0 })]
    #[case(ShareDataPdu::Control { action: ControlAction::GrantedControl, grant_id: 1007, control_id: 0x03EA })]
    #[case(ShareDataPdu::FontList)]
    #[case(ShareDataPdu::FontMap)]
    #[case(ShareDataPdu::SaveSessionInfo { info_type: 1 })]
    #[case(ShareDataPdu::SetErrorInfo(ErrorInfo::LOGOFF_BY_USER))]
    #[case(ShareDataPdu::ShutdownRequest)]
    #[case(ShareDataPdu::ShutdownDenied)]
    fn data_pdus_survive_the_wire(#[case] pdu: ShareDataPdu) {
        let control = ShareControlPdu::data(1007, 0x0001_03EA, pdu);
        assert_eq!(ShareControlPdu::decode(&encode(&control)).unwrap(), control);
    }

    #[test]
    fn confirm_active_lengths() {
        let sets = ClientCapabilities::default().negotiate(&[]).sets;
        let pdu = ShareControlPdu::new(
            1007,
            ShareControlMessage::ConfirmActive(ConfirmActive {
                share_id: 0x0001_03EA,
                capability_sets: sets.clone(),
            }),
        );
        let buf = encode(&pdu);

        assert_eq!(usize::from(u16::from_le_bytes([buf[0], buf[1]])), buf.len());
        // lengthCombinedCapabilities covers numberCapabilities, pad and the sets
        let combined = usize::from(u16::from_le_bytes([buf[14], buf[15]]));
        assert_eq!(combined, buf.len() - SHARE_CONTROL_HEADER_SIZE - 10 - SOURCE_DESCRIPTOR.len());
        assert_eq!(ShareControlPdu::decode(&buf).unwrap(), pdu);
    }

    #[test]
    fn demand_active_carries_session_id() {
        let pdu = ShareControlPdu::new(
            SERVER_CHANNEL_ID,
            ShareControlMessage::DemandActive(DemandActive {
                share_id: 0x0001_03EA,
                source_descriptor: b"RDP\0".to_vec(),
                capability_sets: vec![CapabilitySet::MultifragmentUpdate { max_request_size: 0xFFFF }],
                session_id: 3,
            }),
        );
        assert_eq!(ShareControlPdu::decode(&encode(&pdu)).unwrap(), pdu);
    }

    #[test]
    fn compressed_data_is_rejected() {
        let mut buf = encode(&ShareControlPdu::data(1007, 1, ShareDataPdu::ShutdownDenied));
        buf[15] = PACKET_COMPRESSED;
        assert!(ShareControlPdu::decode(&buf).is_err());
    }

    #[test]
    fn overstated_total_length_reads_what_is_there() {
        let pdu = ShareControlPdu::data(1007, 0x0001_03EA, ShareDataPdu::ShutdownDenied);
        let mut buf = encode(&pdu);
        let overstated = u16::try_from(buf.len() + 4).unwrap();
        buf[..2].copy_from_slice(&overstated.to_le_bytes());

        assert_eq!(ShareControlPdu::decode(&buf).unwrap(), pdu);
    }
}
