//! Connection request / connection confirm (MS-RDPBCGR 2.2.1.1 and 2.2.1.2).

use core::fmt;

use bitflags::bitflags;
use bytes::{Buf as _, BufMut as _};

use crate::tpdu::{X224TpduType, decode_tpkt_tpdu_message, encode_tpkt_tpdu_message};
use crate::{Error, Result};

pub const RDP_NEG_DATA_LENGTH: u16 = 8;

const COOKIE_PREFIX: &str = "Cookie: mstshash=";

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum NegotiationMessage {
    Request = 1,
    Response = 2,
    Failure = 3,
}

bitflags! {
    /// Wire value of `requestedProtocols` / `selectedProtocol`. Standard RDP security is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SecurityProtocol: u32 {
        const SSL = 0x01;
        const HYBRID = 0x02;
        const RDSTLS = 0x04;
        const HYBRID_EX = 0x08;
    }
}

impl SecurityProtocol {
    pub const RDP: Self = Self::empty();
}

bitflags! {
    /// https://msdn.microsoft.com/en-us/library/cc240500.aspx
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NegotiationRequestFlags: u8 {
        const RESTRICTED_ADMIN_MODE_REQUIRED = 0x01;
        const REDIRECTED_AUTHENTICATION_MODE_REQUIRED = 0x02;
        const CORRELATION_INFO_PRESENT = 0x08;
    }
}

bitflags! {
    /// https://msdn.microsoft.com/en-us/library/cc240506.aspx
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NegotiationResponseFlags: u8 {
        const EXTENDED_CLIENT_DATA_SUPPORTED = 0x01;
        const DYNVC_GFX_PROTOCOL_SUPPORTED = 0x02;
        const RDP_NEG_RSP_RESERVED = 0x04;
        const RESTRICTED_ADMIN_MODE_SUPPORTED = 0x08;
        const REDIRECTED_AUTHENTICATION_MODE_SUPPORTED = 0x10;
    }
}

/// `failureCode` of an RDP_NEG_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailureCode(pub u32);

impl FailureCode {
    pub const SSL_REQUIRED_BY_SERVER: Self = Self(1);
    pub const SSL_NOT_ALLOWED_BY_SERVER: Self = Self(2);
    pub const SSL_CERT_NOT_ON_SERVER: Self = Self(3);
    pub const INCONSISTENT_FLAGS: Self = Self(4);
    pub const HYBRID_REQUIRED_BY_SERVER: Self = Self(5);
    pub const SSL_WITH_USER_AUTH_REQUIRED_BY_SERVER: Self = Self(6);

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SSL_REQUIRED_BY_SERVER => "SSL required by server",
            Self::SSL_NOT_ALLOWED_BY_SERVER => "SSL not allowed by server",
            Self::SSL_CERT_NOT_ON_SERVER => "SSL certificate not on server",
            Self::INCONSISTENT_FLAGS => "inconsistent flags",
            Self::HYBRID_REQUIRED_BY_SERVER => "hybrid required by server",
            Self::SSL_WITH_USER_AUTH_REQUIRED_BY_SERVER => "SSL with user authentication required by server",
            _ => return None,
        };

        Some(name)
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "unknown failure code 0x{:08X}", self.0),
        }
    }
}

/// The security protocol both ends settled on.
///
/// Variants are ordered by preference: the highest one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NegotiatedProtocol {
    Plain,
    TransportEncrypted,
    HybridCredentialDelegation,
}

impl NegotiatedProtocol {
    /// Maps a server `selectedProtocol` value.
    pub fn from_selected(selected: SecurityProtocol) -> Option<Self> {
        if selected.is_empty() {
            Some(Self::Plain)
        } else if selected == SecurityProtocol::SSL {
            Some(Self::TransportEncrypted)
        } else if selected == SecurityProtocol::HYBRID || selected == SecurityProtocol::HYBRID_EX {
            Some(Self::HybridCredentialDelegation)
        } else {
            None
        }
    }

    pub fn as_set(self) -> ProtocolSet {
        match self {
            Self::Plain => ProtocolSet::PLAIN,
            Self::TransportEncrypted => ProtocolSet::TRANSPORT_ENCRYPTED,
            Self::HybridCredentialDelegation => ProtocolSet::HYBRID,
        }
    }
}

impl fmt::Display for NegotiatedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "standard RDP security"),
            Self::TransportEncrypted => write!(f, "TLS"),
            Self::HybridCredentialDelegation => write!(f, "CredSSP"),
        }
    }
}

bitflags! {
    /// A set of acceptable protocols, independent of the wire encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolSet: u8 {
        const PLAIN = 0x01;
        const TRANSPORT_ENCRYPTED = 0x02;
        const HYBRID = 0x04;
    }
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self::all()
    }
}

impl ProtocolSet {
    /// `requestedProtocols` advertising this set. Plain cannot be expressed on the wire.
    pub fn to_requested(self) -> SecurityProtocol {
        let mut requested = SecurityProtocol::RDP;

        if self.contains(Self::TRANSPORT_ENCRYPTED) {
            requested |= SecurityProtocol::SSL;
        }

        if self.contains(Self::HYBRID) {
            requested |= SecurityProtocol::SSL | SecurityProtocol::HYBRID | SecurityProtocol::HYBRID_EX;
        }

        requested
    }

    /// Set a server can read out of a `requestedProtocols` value.
    pub fn from_requested(requested: SecurityProtocol) -> Self {
        let mut set = Self::PLAIN;

        if requested.contains(SecurityProtocol::SSL) {
            set |= Self::TRANSPORT_ENCRYPTED;
        }

        if requested.intersects(SecurityProtocol::HYBRID | SecurityProtocol::HYBRID_EX) {
            set |= Self::HYBRID;
        }

        set
    }

    pub fn contains_protocol(self, protocol: NegotiatedProtocol) -> bool {
        self.contains(protocol.as_set())
    }
}

/// Highest-preference protocol present in both sets.
pub fn select_protocol(offered: ProtocolSet, allowed: ProtocolSet) -> Option<NegotiatedProtocol> {
    let common = offered & allowed;

    [
        NegotiatedProtocol::HybridCredentialDelegation,
        NegotiatedProtocol::TransportEncrypted,
        NegotiatedProtocol::Plain,
    ]
    .into_iter()
    .find(|protocol| common.contains_protocol(*protocol))
}

/// X.224 Connection Request with routing cookie and optional RDP_NEG_REQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub cookie: Option<String>,
    pub flags: NegotiationRequestFlags,
    pub protocol: SecurityProtocol,
}

impl ConnectionRequest {
    pub const NAME: &'static str = "CONNECTION REQUEST";

    pub fn encode(&self, dst: &mut impl bytes::BufMut) -> Result<()> {
        let mut variable = Vec::with_capacity(64);

        if let Some(cookie) = &self.cookie {
            variable.put_slice(COOKIE_PREFIX.as_bytes());
            variable.put_slice(cookie.as_bytes());
            variable.put_slice(b"\r\n");
        }

        // Standard RDP security is implied when no negotiation data is sent
        if self.protocol.bits() > SecurityProtocol::RDP.bits() {
            write_negotiation_data(&mut variable, NegotiationMessage::Request, self.flags.bits(), self.protocol.bits());
        }

        encode_tpkt_tpdu_message(dst, X224TpduType::ConnectionRequest, 0, &variable)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (code, mut variable) = decode_tpkt_tpdu_message(frame)?;

        if code != X224TpduType::ConnectionRequest {
            return Err(Error::UnexpectedMessage {
                name: Self::NAME,
                got: u32::from(code as u8),
            });
        }

        let cookie = read_cookie(&mut variable)?;

        if variable.len() >= usize::from(RDP_NEG_DATA_LENGTH) {
            let message = variable.get_u8();
            if message != NegotiationMessage::Request as u8 {
                return Err(Error::UnexpectedMessage {
                    name: "RDP_NEG_REQ type",
                    got: u32::from(message),
                });
            }

            let flags = NegotiationRequestFlags::from_bits_truncate(variable.get_u8());
            let _length = variable.get_u16_le();
            let protocol = SecurityProtocol::from_bits_truncate(variable.get_u32_le());

            Ok(Self { cookie, flags, protocol })
        } else {
            Ok(Self {
                cookie,
                flags: NegotiationRequestFlags::empty(),
                protocol: SecurityProtocol::RDP,
            })
        }
    }
}

/// X.224 Connection Confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfirm {
    Response {
        flags: NegotiationResponseFlags,
        protocol: SecurityProtocol,
    },
    Failure {
        code: FailureCode,
    },
}

impl ConnectionConfirm {
    pub const NAME: &'static str = "CONNECTION CONFIRM";

    pub fn encode(&self, dst: &mut impl bytes::BufMut) -> Result<()> {
        let mut variable = Vec::with_capacity(usize::from(RDP_NEG_DATA_LENGTH));

        match self {
            Self::Response { flags, protocol } => {
                write_negotiation_data(&mut variable, NegotiationMessage::Response, flags.bits(), protocol.bits())
            }
            Self::Failure { code } => write_negotiation_data(&mut variable, NegotiationMessage::Failure, 0, code.0),
        }

        encode_tpkt_tpdu_message(dst, X224TpduType::ConnectionConfirm, 0, &variable)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (code, mut variable) = decode_tpkt_tpdu_message(frame)?;

        if code != X224TpduType::ConnectionConfirm {
            return Err(Error::UnexpectedMessage {
                name: Self::NAME,
                got: u32::from(code as u8),
            });
        }

        // A bare confirm (no RDP_NEG_RSP) is an old server speaking standard RDP security
        if variable.is_empty() {
            return Ok(Self::Response {
                flags: NegotiationResponseFlags::empty(),
                protocol: SecurityProtocol::RDP,
            });
        }

        ensure_size!(variable[usize::from(RDP_NEG_DATA_LENGTH)] for "RDP_NEG_RSP");

        let message = variable.get_u8();
        let flags = variable.get_u8();
        let length = variable.get_u16_le();
        if length != RDP_NEG_DATA_LENGTH {
            return Err(Error::invalid("RDP_NEG_RSP", "length", "must be 8"));
        }
        let data = variable.get_u32_le();

        match message {
            m if m == NegotiationMessage::Response as u8 => Ok(Self::Response {
                flags: NegotiationResponseFlags::from_bits_truncate(flags),
                protocol: SecurityProtocol::from_bits(data)
                    .ok_or_else(|| Error::invalid("RDP_NEG_RSP", "selectedProtocol", "unknown protocol bits"))?,
            }),
            m if m == NegotiationMessage::Failure as u8 => Ok(Self::Failure {
                code: FailureCode(data),
            }),
            other => Err(Error::UnexpectedMessage {
                name: "RDP_NEG_RSP type",
                got: u32::from(other),
            }),
        }
    }
}

fn write_negotiation_data(dst: &mut Vec<u8>, message: NegotiationMessage, flags: u8, data: u32) {
    dst.put_u8(message as u8);
    dst.put_u8(flags);
    dst.put_u16_le(RDP_NEG_DATA_LENGTH);
    dst.put_u32_le(data);
}

fn read_cookie(src: &mut &[u8]) -> Result<Option<String>> {
    if !src.starts_with(COOKIE_PREFIX.as_bytes()) {
        return Ok(None);
    }

    let end = src
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| Error::invalid(ConnectionRequest::NAME, "cookie", "not terminated by CR LF"))?;

    let cookie = String::from_utf8_lossy(&src[COOKIE_PREFIX.len()..end]).into_owned();
    src.advance(end + 2);

    Ok(Some(cookie))
}
