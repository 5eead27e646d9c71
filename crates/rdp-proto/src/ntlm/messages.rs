//! NEGOTIATE, CHALLENGE and AUTHENTICATE messages (MS-NLMP 2.2.1) and AV pairs.

use bytes::{Buf as _, BufMut as _};

use super::{NTLM_VERSION_SIZE, NegotiateFlags};
use crate::utils::{read_array, split_to, u16_len, u32_len};
use crate::{Error, Result};

pub const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
pub const NEGOTIATE_HEADER_SIZE: usize = 40;
pub const CHALLENGE_HEADER_SIZE: usize = 56;
pub const AUTHENTICATE_HEADER_SIZE: usize = 88;
pub const MIC_OFFSET: usize = 72;
pub const MIC_SIZE: usize = 16;
pub const CHALLENGE_SIZE: usize = 8;

const MESSAGE_TYPE_NEGOTIATE: u32 = 1;
const MESSAGE_TYPE_CHALLENGE: u32 = 2;
const MESSAGE_TYPE_AUTHENTICATE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AvId {
    Eol = 0,
    NbComputerName = 1,
    NbDomainName = 2,
    DnsComputerName = 3,
    DnsDomainName = 4,
    DnsTreeName = 5,
    Flags = 6,
    Timestamp = 7,
    SingleHost = 8,
    TargetName = 9,
    ChannelBindings = 10,
}

pub const MSV_AV_FLAGS_MIC_PRESENT: u32 = 0x0000_0002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPair {
    pub id: u16,
    pub value: Vec<u8>,
}

impl AvPair {
    pub fn new(id: AvId, value: Vec<u8>) -> Self {
        Self { id: id as u16, value }
    }
}

/// Writes the pairs followed by `MsvAvEOL`.
pub fn encode_av_pairs(pairs: &[AvPair]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for pair in pairs.iter().filter(|pair| pair.id != AvId::Eol as u16) {
        out.put_u16_le(pair.id);
        out.put_u16_le(u16_len(pair.value.len(), "AvLen")?);
        out.put_slice(&pair.value);
    }
    out.put_u16_le(AvId::Eol as u16);
    out.put_u16_le(0);
    Ok(out)
}

/// Reads pairs up to `MsvAvEOL`, which is not included.
pub fn decode_av_pairs(mut src: &[u8]) -> Result<Vec<AvPair>> {
    let mut pairs = Vec::new();

    loop {
        ensure_size!(src[4] for "AV_PAIR");
        let id = src.get_u16_le();
        let length = usize::from(src.get_u16_le());
        if id == AvId::Eol as u16 {
            return Ok(pairs);
        }
        let value = split_to(&mut src, length, "AV_PAIR Value")?.to_vec();
        pairs.push(AvPair { id, value });
    }
}

pub fn find_av_pair(pairs: &[AvPair], id: AvId) -> Option<&[u8]> {
    pairs
        .iter()
        .find(|pair| pair.id == id as u16)
        .map(|pair| pair.value.as_slice())
}

/// Payload fields are written after the fixed header in declaration order.
struct PayloadWriter {
    header: Vec<u8>,
    payload: Vec<u8>,
    base: usize,
}

impl PayloadWriter {
    fn new(header_size: usize) -> Self {
        Self {
            header: Vec::with_capacity(header_size),
            payload: Vec::new(),
            base: header_size,
        }
    }

    fn field(&mut self, value: &[u8]) -> Result<()> {
        let length = u16_len(value.len(), "NTLM payload field")?;
        self.header.put_u16_le(length);
        self.header.put_u16_le(length);
        self.header
            .put_u32_le(u32_len(self.base + self.payload.len(), "NTLM payload offset")?);
        self.payload.extend_from_slice(value);
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        self.header.extend_from_slice(&self.payload);
        self.header
    }
}

fn read_field<'a>(message: &'a [u8], header: &mut &[u8]) -> Result<&'a [u8]> {
    ensure_size!(header[8] for "NTLM payload field");
    let length = usize::from(header.get_u16_le());
    let _max_length = header.get_u16_le();
    let offset = header.get_u32_le() as usize;

    if length == 0 {
        return Ok(&[]);
    }

    message
        .get(offset..offset + length)
        .ok_or_else(|| Error::invalid("NTLM message", "BufferOffset", "field out of bounds"))
}

fn read_preamble(src: &mut &[u8], expected_type: u32) -> Result<()> {
    let signature = read_array::<8>(src, "NTLM Signature")?;
    if &signature != SIGNATURE {
        return Err(Error::invalid("NTLM message", "Signature", "not NTLMSSP"));
    }

    ensure_size!(src[4] for "NTLM MessageType");
    let message_type = src.get_u32_le();
    if message_type != expected_type {
        return Err(Error::UnexpectedMessage {
            name: "NTLM MessageType",
            got: message_type,
        });
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateMessage {
    pub flags: NegotiateFlags,
    pub version: [u8; NTLM_VERSION_SIZE],
}

impl NegotiateMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = PayloadWriter::new(NEGOTIATE_HEADER_SIZE);
        writer.header.put_slice(SIGNATURE);
        writer.header.put_u32_le(MESSAGE_TYPE_NEGOTIATE);
        writer.header.put_u32_le(self.flags.bits());
        writer.field(&[])?; // DomainNameFields
        writer.field(&[])?; // WorkstationFields
        writer.header.put_slice(&self.version);
        Ok(writer.finish())
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        let mut src = message;
        read_preamble(&mut src, MESSAGE_TYPE_NEGOTIATE)?;
        ensure_size!(src[4] for "NEGOTIATE_MESSAGE NegotiateFlags");
        let flags = NegotiateFlags::from_bits_retain(src.get_u32_le());

        let version = if flags.contains(NegotiateFlags::VERSION) && src.len() >= 16 + NTLM_VERSION_SIZE {
            src.advance(16);
            read_array(&mut src, "NEGOTIATE_MESSAGE Version")?
        } else {
            [0; NTLM_VERSION_SIZE]
        };

        Ok(Self { flags, version })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub target_name: Vec<u8>,
    pub flags: NegotiateFlags,
    pub server_challenge: [u8; CHALLENGE_SIZE],
    pub target_info: Vec<AvPair>,
    pub version: [u8; NTLM_VERSION_SIZE],
}

impl ChallengeMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let target_info = encode_av_pairs(&self.target_info)?;

        let mut writer = PayloadWriter::new(CHALLENGE_HEADER_SIZE);
        writer.header.put_slice(SIGNATURE);
        writer.header.put_u32_le(MESSAGE_TYPE_CHALLENGE);
        writer.field(&self.target_name)?;
        writer.header.put_u32_le(self.flags.bits());
        writer.header.put_slice(&self.server_challenge);
        writer.header.put_bytes(0, 8); // Reserved
        writer.field(&target_info)?;
        writer.header.put_slice(&self.version);
        Ok(writer.finish())
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        let mut src = message;
        read_preamble(&mut src, MESSAGE_TYPE_CHALLENGE)?;
        let target_name = read_field(message, &mut src)?.to_vec();
        ensure_size!(src[4] for "CHALLENGE_MESSAGE NegotiateFlags");
        let flags = NegotiateFlags::from_bits_retain(src.get_u32_le());
        let server_challenge = read_array(&mut src, "CHALLENGE_MESSAGE ServerChallenge")?;
        crate::utils::skip(&mut src, 8, "CHALLENGE_MESSAGE Reserved")?;

        let target_info = read_field(message, &mut src)?;
        if target_info.is_empty() {
            return Err(Error::invalid("CHALLENGE_MESSAGE", "TargetInfo", "required for NTLMv2"));
        }
        let target_info = decode_av_pairs(target_info)?;

        let version = if src.len() >= NTLM_VERSION_SIZE {
            read_array(&mut src, "CHALLENGE_MESSAGE Version")?
        } else {
            [0; NTLM_VERSION_SIZE]
        };

        Ok(Self {
            target_name,
            flags,
            server_challenge,
            target_info,
            version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateMessage {
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
    /// UTF-16LE
    pub domain: Vec<u8>,
    /// UTF-16LE
    pub user: Vec<u8>,
    /// UTF-16LE
    pub workstation: Vec<u8>,
    pub encrypted_random_session_key: Vec<u8>,
    pub flags: NegotiateFlags,
    pub version: [u8; NTLM_VERSION_SIZE],
    pub mic: [u8; MIC_SIZE],
}

impl AuthenticateMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = PayloadWriter::new(AUTHENTICATE_HEADER_SIZE);
        writer.header.put_slice(SIGNATURE);
        writer.header.put_u32_le(MESSAGE_TYPE_AUTHENTICATE);
        writer.field(&self.lm_response)?;
        writer.field(&self.nt_response)?;
        writer.field(&self.domain)?;
        writer.field(&self.user)?;
        writer.field(&self.workstation)?;
        writer.field(&self.encrypted_random_session_key)?;
        writer.header.put_u32_le(self.flags.bits());
        writer.header.put_slice(&self.version);
        writer.header.put_slice(&self.mic);
        Ok(writer.finish())
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        ensure_size!(message[AUTHENTICATE_HEADER_SIZE] for "AUTHENTICATE_MESSAGE");

        let mut src = message;
        read_preamble(&mut src, MESSAGE_TYPE_AUTHENTICATE)?;
        let lm_response = read_field(message, &mut src)?.to_vec();
        let nt_response = read_field(message, &mut src)?.to_vec();
        let domain = read_field(message, &mut src)?.to_vec();
        let user = read_field(message, &mut src)?.to_vec();
        let workstation = read_field(message, &mut src)?.to_vec();
        let encrypted_random_session_key = read_field(message, &mut src)?.to_vec();
        let flags = NegotiateFlags::from_bits_retain(src.get_u32_le());
        let version = read_array(&mut src, "AUTHENTICATE_MESSAGE Version")?;
        let mic = read_array(&mut src, "AUTHENTICATE_MESSAGE MIC")?;

        Ok(Self {
            lm_response,
            nt_response,
            domain,
            user,
            workstation,
            encrypted_random_session_key,
            flags,
            version,
            mic,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::ntlm::{CLIENT_FLAGS, NTLM_VERSION};

    #[test]
    fn negotiate_message_layout() {
        let message = NegotiateMessage {
            flags: CLIENT_FLAGS,
            version: NTLM_VERSION,
        }
        .encode()
        .unwrap();

        assert_eq!(message.len(), NEGOTIATE_HEADER_SIZE);
        assert_eq!(&message[..8], SIGNATURE);
        assert_eq!(&message[8..16], [0x01, 0x00, 0x00, 0x00, 0x35, 0x82, 0x88, 0xE2]);
        assert_eq!(NegotiateMessage::decode(&message).unwrap().flags, CLIENT_FLAGS);
    }

    #[test]
    fn challenge_message_keeps_target_info() {
        let challenge = ChallengeMessage {
            target_name: b"D\0O\0M\0".to_vec(),
            flags: CLIENT_FLAGS,
            server_challenge: [1, 2, 3, 4, 5, 6, 7, 8],
            target_info: vec![
                AvPair::new(AvId::NbDomainName, b"D\0O\0M\0".to_vec()),
                AvPair::new(AvId::Timestamp, vec![0; 8]),
            ],
            version: NTLM_VERSION,
        };
        let encoded = challenge.encode().unwrap();

        assert_eq!(ChallengeMessage::decode(&encoded).unwrap(), challenge);
    }

    #[test]
    fn mic_sits_at_its_fixed_offset() {
        let message = AuthenticateMessage {
            lm_response: vec![0; 24],
            nt_response: vec![7; 48],
            domain: b"D\0".to_vec(),
            user: b"U\0".to_vec(),
            workstation: Vec::new(),
            encrypted_random_session_key: vec![9; 16],
            flags: CLIENT_FLAGS,
            version: NTLM_VERSION,
            mic: [0xAA; MIC_SIZE],
        };
        let encoded = message.encode().unwrap();

        assert_eq!(&encoded[MIC_OFFSET..MIC_OFFSET + MIC_SIZE], &[0xAA; MIC_SIZE]);
        assert_eq!(AuthenticateMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn field_out_of_bounds_is_rejected() {
        let mut encoded = ChallengeMessage {
            target_name: Vec::new(),
            flags: CLIENT_FLAGS,
            server_challenge: [0; 8],
            target_info: Vec::new(),
            version: NTLM_VERSION,
        }
        .encode()
        .unwrap();
        // TargetInfoFields.Len
        encoded[40] = 0xFF;

        assert!(ChallengeMessage::decode(&encoded).is_err());
    }
}
