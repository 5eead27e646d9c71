//! T.125 MCS: the BER-encoded Connect-Initial / Connect-Response and the PER-encoded domain PDUs.

use core::fmt;

use bytes::{Buf as _, BufMut as _};

use crate::utils::{split_to, u16_len};
use crate::{Error, Result, ber, per};

pub const MCS_BASE_CHANNEL_ID: u16 = 1001;
pub const MCS_RESULT_ENUM_LENGTH: u8 = 16;
pub const RESULT_SUCCESSFUL: u8 = 0;

const CONNECT_INITIAL_TAG: u8 = 101;
const CONNECT_RESPONSE_TAG: u8 = 102;

// Data priority high, segmentation begin | end
const DATA_PRIORITY_AND_SEGMENTATION: u8 = 0x70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainParameters {
    pub max_channel_ids: u32,
    pub max_user_ids: u32,
    pub max_token_ids: u32,
    pub num_priorities: u32,
    pub min_throughput: u32,
    pub max_height: u32,
    pub max_mcs_pdu_size: u32,
    pub protocol_version: u32,
}

impl DomainParameters {
    pub fn target() -> Self {
        Self {
            max_channel_ids: 34,
            max_user_ids: 2,
            max_token_ids: 0,
            num_priorities: 1,
            min_throughput: 0,
            max_height: 1,
            max_mcs_pdu_size: 0xFFFF,
            protocol_version: 2,
        }
    }

    pub fn min() -> Self {
        Self {
            max_channel_ids: 1,
            max_user_ids: 1,
            max_token_ids: 1,
            num_priorities: 1,
            min_throughput: 0,
            max_height: 1,
            max_mcs_pdu_size: 0x420,
            protocol_version: 2,
        }
    }

    pub fn max() -> Self {
        Self {
            max_channel_ids: 0xFFFF,
            max_user_ids: 0xFC17,
            max_token_ids: 0xFFFF,
            num_priorities: 1,
            min_throughput: 0,
            max_height: 1,
            max_mcs_pdu_size: 0xFFFF,
            protocol_version: 2,
        }
    }

    fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut content = Vec::with_capacity(32);
        for value in [
            self.max_channel_ids,
            self.max_user_ids,
            self.max_token_ids,
            self.num_priorities,
            self.min_throughput,
            self.max_height,
            self.max_mcs_pdu_size,
            self.protocol_version,
        ] {
            ber::write_integer(&mut content, value);
        }
        ber::write_sequence(dst, &content)
    }

    fn decode(src: &mut &[u8]) -> Result<Self> {
        let mut content = ber::read_sequence(src)?;

        Ok(Self {
            max_channel_ids: ber::read_integer(&mut content)?,
            max_user_ids: ber::read_integer(&mut content)?,
            max_token_ids: ber::read_integer(&mut content)?,
            num_priorities: ber::read_integer(&mut content)?,
            min_throughput: ber::read_integer(&mut content)?,
            max_height: ber::read_integer(&mut content)?,
            max_mcs_pdu_size: ber::read_integer(&mut content)?,
            protocol_version: ber::read_integer(&mut content)?,
        })
    }
}

/// MCS Connect-Initial, carrying the GCC conference create request as user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInitial {
    pub target_parameters: DomainParameters,
    pub minimum_parameters: DomainParameters,
    pub maximum_parameters: DomainParameters,
    pub user_data: Vec<u8>,
}

impl ConnectInitial {
    pub fn new(user_data: Vec<u8>) -> Self {
        Self {
            target_parameters: DomainParameters::target(),
            minimum_parameters: DomainParameters::min(),
            maximum_parameters: DomainParameters::max(),
            user_data,
        }
    }

    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut content = Vec::with_capacity(self.user_data.len() + 128);
        ber::write_octet_string(&mut content, &[0x01])?; // callingDomainSelector
        ber::write_octet_string(&mut content, &[0x01])?; // calledDomainSelector
        ber::write_boolean(&mut content, true); // upwardFlag
        self.target_parameters.encode(&mut content)?;
        self.minimum_parameters.encode(&mut content)?;
        self.maximum_parameters.encode(&mut content)?;
        ber::write_octet_string(&mut content, &self.user_data)?;

        ber::write_application(dst, CONNECT_INITIAL_TAG, &content)
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let mut content = ber::read_application(&mut src, CONNECT_INITIAL_TAG)?;

        let _calling = ber::read_octet_string(&mut content)?;
        let _called = ber::read_octet_string(&mut content)?;
        let _upward = ber::read_boolean(&mut content)?;
        let target_parameters = DomainParameters::decode(&mut content)?;
        let minimum_parameters = DomainParameters::decode(&mut content)?;
        let maximum_parameters = DomainParameters::decode(&mut content)?;
        let user_data = ber::read_octet_string(&mut content)?.to_vec();

        Ok(Self {
            target_parameters,
            minimum_parameters,
            maximum_parameters,
            user_data,
        })
    }
}

/// MCS Connect-Response, carrying the GCC conference create response as user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub result: u8,
    pub called_connect_id: u32,
    pub domain_parameters: DomainParameters,
    pub user_data: Vec<u8>,
}

impl ConnectResponse {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut content = Vec::with_capacity(self.user_data.len() + 64);
        ber::write_enumerated(&mut content, self.result);
        ber::write_integer(&mut content, self.called_connect_id);
        self.domain_parameters.encode(&mut content)?;
        ber::write_octet_string(&mut content, &self.user_data)?;

        ber::write_application(dst, CONNECT_RESPONSE_TAG, &content)
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let mut content = ber::read_application(&mut src, CONNECT_RESPONSE_TAG)?;

        let result = ber::read_enumerated(&mut content)?;
        let called_connect_id = ber::read_integer(&mut content)?;
        let domain_parameters = DomainParameters::decode(&mut content)?;
        let user_data = ber::read_octet_string(&mut content)?.to_vec();

        Ok(Self {
            result,
            called_connect_id,
            domain_parameters,
            user_data,
        })
    }
}

/// The reason of a Disconnect Provider Ultimatum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectReason(pub u8);

impl DisconnectReason {
    pub const DOMAIN_DISCONNECTED: Self = Self(0);
    pub const PROVIDER_INITIATED: Self = Self(1);
    pub const TOKEN_PURGED: Self = Self(2);
    pub const USER_REQUESTED: Self = Self(3);
    pub const CHANNEL_PURGED: Self = Self(4);
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DOMAIN_DISCONNECTED => write!(f, "domain disconnected"),
            Self::PROVIDER_INITIATED => write!(f, "provider initiated"),
            Self::TOKEN_PURGED => write!(f, "token purged"),
            Self::USER_REQUESTED => write!(f, "user requested"),
            Self::CHANNEL_PURGED => write!(f, "channel purged"),
            Self(other) => write!(f, "unknown reason {other}"),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainMcsPduType {
    ErectDomainRequest = 1,
    DisconnectProviderUltimatum = 8,
    AttachUserRequest = 10,
    AttachUserConfirm = 11,
    ChannelJoinRequest = 14,
    ChannelJoinConfirm = 15,
    SendDataRequest = 25,
    SendDataIndication = 26,
}

impl DomainMcsPduType {
    fn from_choice(choice: u8) -> Result<Self> {
        match choice >> 2 {
            1 => Ok(Self::ErectDomainRequest),
            8 => Ok(Self::DisconnectProviderUltimatum),
            10 => Ok(Self::AttachUserRequest),
            11 => Ok(Self::AttachUserConfirm),
            14 => Ok(Self::ChannelJoinRequest),
            15 => Ok(Self::ChannelJoinConfirm),
            25 => Ok(Self::SendDataRequest),
            26 => Ok(Self::SendDataIndication),
            other => Err(Error::UnexpectedMessage {
                name: "domain MCSPDU",
                got: u32::from(other),
            }),
        }
    }

    fn choice(self) -> u8 {
        (self as u8) << 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendData<'a> {
    pub initiator: u16,
    pub channel_id: u16,
    pub user_data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPdu<'a> {
    ErectDomainRequest { sub_height: u32, sub_interval: u32 },
    DisconnectProviderUltimatum { reason: DisconnectReason },
    AttachUserRequest,
    AttachUserConfirm { result: u8, initiator: Option<u16> },
    ChannelJoinRequest { initiator: u16, channel_id: u16 },
    ChannelJoinConfirm {
        result: u8,
        initiator: u16,
        requested: u16,
        channel_id: Option<u16>,
    },
    SendDataRequest(SendData<'a>),
    SendDataIndication(SendData<'a>),
}

impl<'a> DomainPdu<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ErectDomainRequest { .. } => "Erect Domain Request",
            Self::DisconnectProviderUltimatum { .. } => "Disconnect Provider Ultimatum",
            Self::AttachUserRequest => "Attach User Request",
            Self::AttachUserConfirm { .. } => "Attach User Confirm",
            Self::ChannelJoinRequest { .. } => "Channel Join Request",
            Self::ChannelJoinConfirm { .. } => "Channel Join Confirm",
            Self::SendDataRequest(_) => "Send Data Request",
            Self::SendDataIndication(_) => "Send Data Indication",
        }
    }

    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::ErectDomainRequest {
                sub_height,
                sub_interval,
            } => {
                per::write_choice(dst, DomainMcsPduType::ErectDomainRequest.choice());
                per::write_integer(dst, *sub_height);
                per::write_integer(dst, *sub_interval);
            }
            Self::DisconnectProviderUltimatum { reason } => {
                per::write_choice(dst, DomainMcsPduType::DisconnectProviderUltimatum.choice() | (reason.0 >> 1));
                dst.put_u8((reason.0 & 0x01) << 7);
            }
            Self::AttachUserRequest => per::write_choice(dst, DomainMcsPduType::AttachUserRequest.choice()),
            Self::AttachUserConfirm { result, initiator } => {
                let present = if initiator.is_some() { 0x02 } else { 0x00 };
                per::write_choice(dst, DomainMcsPduType::AttachUserConfirm.choice() | present);
                per::write_enumerated(dst, *result);
                if let Some(initiator) = initiator {
                    per::write_u16(dst, *initiator, MCS_BASE_CHANNEL_ID)?;
                }
            }
            Self::ChannelJoinRequest { initiator, channel_id } => {
                per::write_choice(dst, DomainMcsPduType::ChannelJoinRequest.choice());
                per::write_u16(dst, *initiator, MCS_BASE_CHANNEL_ID)?;
                per::write_u16(dst, *channel_id, 0)?;
            }
            Self::ChannelJoinConfirm {
                result,
                initiator,
                requested,
                channel_id,
            } => {
                let present = if channel_id.is_some() { 0x02 } else { 0x00 };
                per::write_choice(dst, DomainMcsPduType::ChannelJoinConfirm.choice() | present);
                per::write_enumerated(dst, *result);
                per::write_u16(dst, *initiator, MCS_BASE_CHANNEL_ID)?;
                per::write_u16(dst, *requested, 0)?;
                if let Some(channel_id) = channel_id {
                    per::write_u16(dst, *channel_id, 0)?;
                }
            }
            Self::SendDataRequest(data) => encode_send_data(dst, DomainMcsPduType::SendDataRequest, data)?,
            Self::SendDataIndication(data) => encode_send_data(dst, DomainMcsPduType::SendDataIndication, data)?,
        }

        Ok(())
    }

    pub fn decode(mut src: &'a [u8]) -> Result<Self> {
        let choice = per::read_choice(&mut src)?;

        let pdu = match DomainMcsPduType::from_choice(choice)? {
            DomainMcsPduType::ErectDomainRequest => Self::ErectDomainRequest {
                sub_height: per::read_integer(&mut src)?,
                sub_interval: per::read_integer(&mut src)?,
            },
            DomainMcsPduType::DisconnectProviderUltimatum => {
                ensure_size!(src[1] for "Disconnect Provider Ultimatum");
                let b = src.get_u8();
                Self::DisconnectProviderUltimatum {
                    reason: DisconnectReason(((choice & 0x01) << 1) | (b >> 7)),
                }
            }
            DomainMcsPduType::AttachUserRequest => Self::AttachUserRequest,
            DomainMcsPduType::AttachUserConfirm => {
                let result = per::read_enumerated(&mut src, MCS_RESULT_ENUM_LENGTH)?;
                let initiator = if choice & 0x02 != 0 {
                    Some(per::read_u16(&mut src, MCS_BASE_CHANNEL_ID)?)
                } else {
                    None
                };
                Self::AttachUserConfirm { result, initiator }
            }
            DomainMcsPduType::ChannelJoinRequest => Self::ChannelJoinRequest {
                initiator: per::read_u16(&mut src, MCS_BASE_CHANNEL_ID)?,
                channel_id: per::read_u16(&mut src, 0)?,
            },
            DomainMcsPduType::ChannelJoinConfirm => {
                let result = per::read_enumerated(&mut src, MCS_RESULT_ENUM_LENGTH)?;
                let initiator = per::read_u16(&mut src, MCS_BASE_CHANNEL_ID)?;
                let requested = per::read_u16(&mut src, 0)?;
                let channel_id = if choice & 0x02 != 0 {
                    Some(per::read_u16(&mut src, 0)?)
                } else {
                    None
                };
                Self::ChannelJoinConfirm {
                    result,
                    initiator,
                    requested,
                    channel_id,
                }
            }
            DomainMcsPduType::SendDataRequest => Self::SendDataRequest(decode_send_data(&mut src)?),
            DomainMcsPduType::SendDataIndication => Self::SendDataIndication(decode_send_data(&mut src)?),
        };

        Ok(pdu)
    }
}

fn encode_send_data(dst: &mut Vec<u8>, ty: DomainMcsPduType, data: &SendData<'_>) -> Result<()> {
    per::write_choice(dst, ty.choice());
    per::write_u16(dst, data.initiator, MCS_BASE_CHANNEL_ID)?;
    per::write_u16(dst, data.channel_id, 0)?;
    dst.put_u8(DATA_PRIORITY_AND_SEGMENTATION);
    per::write_length(dst, u16_len(data.user_data.len(), "MCS send data")?);
    dst.put_slice(data.user_data);
    Ok(())
}

fn decode_send_data<'a>(src: &mut &'a [u8]) -> Result<SendData<'a>> {
    let initiator = per::read_u16(src, MCS_BASE_CHANNEL_ID)?;
    let channel_id = per::read_u16(src, 0)?;
    ensure_size!(src[1] for "MCS send data");
    let _data_priority_and_segmentation = src.get_u8();
    let length = per::read_length(src)?;
    let user_data = split_to(src, usize::from(length), "MCS send data user data")?;

    Ok(SendData {
        initiator,
        channel_id,
        user_data,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DomainPdu::ErectDomainRequest { sub_height: 0, sub_interval: 0 }, &[0x04, 0x01, 0x00, 0x01, 0x00])]
    #[case(DomainPdu::AttachUserRequest, &[0x28])]
    #[case(DomainPdu::AttachUserConfirm { result: 0, initiator: Some(1007) }, &[0x2E, 0x00, 0x00, 0x06])]
    #[case(DomainPdu::ChannelJoinRequest { initiator: 1007, channel_id: 1003 }, &[0x38, 0x00, 0x06, 0x03, 0xEB])]
    #[case(
        DomainPdu::ChannelJoinConfirm { result: 0, initiator: 1007, requested: 1003, channel_id: Some(1003) },
        &[0x3E, 0x00, 0x00, 0x06, 0x03, 0xEB, 0x03, 0xEB]
    )]
    #[case(DomainPdu::DisconnectProviderUltimatum { reason: DisconnectReason::USER_REQUESTED }, &[0x21, 0x80])]
    fn domain_pdu_wire_format(#[case] pdu: DomainPdu<'static>, #[case] expected: &[u8]) {
        let mut buf = Vec::new();
        pdu.encode(&mut buf).unwrap();
        assert_eq!(buf, expected);
        assert_eq!(DomainPdu::decode(expected).unwrap(), pdu);
    }

    #[test]
    fn send_data_indication_carries_payload() {
        let src = [0x68, 0x00, 0x01, 0x03, 0xEB, 0x70, 0x02, 0xAB, 0xCD];

        let pdu = DomainPdu::decode(&src).unwrap();

        assert_eq!(
            pdu,
            DomainPdu::SendDataIndication(SendData {
                initiator: 1002,
                channel_id: 1003,
                user_data: &[0xAB, 0xCD],
            })
        );
    }

    #[test]
    fn connect_initial_round_trips() {
        let initial = ConnectInitial::new(vec![0xAA; 300]);
        let mut buf = Vec::new();
        initial.encode(&mut buf).unwrap();

        assert_eq!(&buf[..2], [0x7F, 0x65]);
        assert_eq!(ConnectInitial::decode(&buf).unwrap(), initial);
    }

    #[test]
    fn unknown_domain_pdu_is_rejected() {
        assert!(DomainPdu::decode(&[0xFC]).is_err());
    }
}
