//! TPKT (RFC 1006) framing and X.224 (ISO 8073 class 0) TPDU headers.
//!
//! Every slow-path PDU travels as `TPKT header | X.224 header | user data`. Fast-path PDUs share the
//! same byte stream and are told apart by the first byte.

use bytes::{Buf as _, BufMut};

use crate::utils::split_to;
use crate::{Error, Result};

pub const TPKT_HEADER_LENGTH: usize = 4;
pub const TPKT_VERSION: u8 = 3;
pub const TPDU_DATA_HEADER_LENGTH: usize = 3;
pub const TPDU_REQUEST_HEADER_LENGTH: usize = 7;
pub const TPDU_DATA_LENGTH: usize = TPKT_HEADER_LENGTH + TPDU_DATA_HEADER_LENGTH;
pub const TPDU_REQUEST_LENGTH: usize = TPKT_HEADER_LENGTH + TPDU_REQUEST_HEADER_LENGTH;

const EOT: u8 = 0x80;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum X224TpduType {
    ConnectionRequest = 0xE0,
    ConnectionConfirm = 0xD0,
    DisconnectRequest = 0x80,
    Data = 0xF0,
    Error = 0x70,
}

impl TryFrom<u8> for X224TpduType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xE0 => Ok(Self::ConnectionRequest),
            0xD0 => Ok(Self::ConnectionConfirm),
            0x80 => Ok(Self::DisconnectRequest),
            0xF0 => Ok(Self::Data),
            0x70 => Ok(Self::Error),
            _ => Err(Error::UnexpectedMessage {
                name: "X.224 TPDU code",
                got: u32::from(value),
            }),
        }
    }
}

/// How the first byte of a frame classifies it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    X224,
    FastPath,
}

impl Action {
    pub fn from_first_byte(byte: u8) -> Result<Self> {
        if byte == TPKT_VERSION {
            Ok(Self::X224)
        } else if byte & 0x03 == 0 {
            Ok(Self::FastPath)
        } else {
            Err(Error::invalid("frame header", "action", "neither TPKT nor fast-path"))
        }
    }
}

/// Returns the total length of the frame starting at `buf` once enough header bytes are available.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    match Action::from_first_byte(first)? {
        Action::X224 => {
            if buf.len() < TPKT_HEADER_LENGTH {
                return Ok(None);
            }

            let length = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
            if length < TPDU_DATA_LENGTH {
                return Err(Error::invalid("TPKT header", "length", "shorter than the X.224 header"));
            }

            Ok(Some(length))
        }
        Action::FastPath => {
            let Some(&b1) = buf.get(1) else {
                return Ok(None);
            };

            let (length, header_size) = if b1 & 0x80 != 0 {
                let Some(&b2) = buf.get(2) else {
                    return Ok(None);
                };
                ((usize::from(b1 & 0x7F) << 8) | usize::from(b2), 3)
            } else {
                (usize::from(b1), 2)
            };

            if length < header_size {
                return Err(Error::invalid("fast-path header", "length", "shorter than the header"));
            }

            Ok(Some(length))
        }
    }
}

pub fn write_tpkt_header(dst: &mut impl BufMut, length: u16) {
    dst.put_u8(TPKT_VERSION);
    dst.put_u8(0); // reserved
    dst.put_u16(length);
}

/// Reads a TPKT header and returns the whole packet length it declares.
pub fn read_tpkt_header(src: &mut &[u8]) -> Result<u16> {
    ensure_size!(src[TPKT_HEADER_LENGTH] for "TPKT header");

    let version = src.get_u8();
    if version != TPKT_VERSION {
        return Err(Error::invalid("TPKT header", "version", "not a TPKT header"));
    }

    let _reserved = src.get_u8();

    Ok(src.get_u16())
}

pub fn write_tpdu_header(dst: &mut impl BufMut, length: u8, code: X224TpduType, src_ref: u16) {
    // tpdu header length field doesn't include the length of the length field
    dst.put_u8(length - 1);
    dst.put_u8(code as u8);

    if code == X224TpduType::Data {
        dst.put_u8(EOT);
    } else {
        let dst_ref = 0;
        dst.put_u16_le(dst_ref);
        dst.put_u16_le(src_ref);
        let class = 0;
        dst.put_u8(class);
    }
}

/// Reads an X.224 header, returning its length indicator and code.
pub fn read_tpdu_header(src: &mut &[u8]) -> Result<(u8, X224TpduType)> {
    ensure_size!(src[2] for "X.224 header");

    let length = src.get_u8();
    let code = X224TpduType::try_from(src.get_u8())?;

    if code == X224TpduType::Data {
        ensure_size!(src[1] for "X.224 data header");
        let _eot = src.get_u8();
    } else {
        ensure_size!(src[5] for "X.224 header");
        let _dst_ref = src.get_u16_le();
        let _src_ref = src.get_u16_le();
        let _class = src.get_u8();
    }

    Ok((length, code))
}

/// Frames a connection request/confirm TPDU with its variable part.
pub fn encode_tpkt_tpdu_message(
    dst: &mut impl BufMut,
    code: X224TpduType,
    src_ref: u16,
    variable: &[u8],
) -> Result<()> {
    let length = TPDU_REQUEST_LENGTH + variable.len();
    let tpdu_length = u8::try_from(length - TPKT_HEADER_LENGTH)
        .map_err(|_| Error::invalid("X.224 TPDU", "length indicator", "variable part too long"))?;

    write_tpkt_header(dst, crate::utils::u16_len(length, "TPKT packet")?);
    write_tpdu_header(dst, tpdu_length, code, src_ref);
    dst.put_slice(variable);

    Ok(())
}

/// Decodes a whole TPKT packet holding a non-data TPDU and returns its code and variable part.
pub fn decode_tpkt_tpdu_message(frame: &[u8]) -> Result<(X224TpduType, &[u8])> {
    let mut src = frame;
    let length = usize::from(read_tpkt_header(&mut src)?);
    let mut src = split_to(&mut src, length.saturating_sub(TPKT_HEADER_LENGTH), "TPKT payload")?;

    let (li, code) = read_tpdu_header(&mut src)?;
    let variable_length = usize::from(li)
        .checked_sub(TPDU_REQUEST_HEADER_LENGTH - 1)
        .ok_or_else(|| Error::invalid("X.224 TPDU", "length indicator", "too small"))?;
    let variable = split_to(&mut src, variable_length, "X.224 variable part")?;

    Ok((code, variable))
}

/// Wraps a payload into `TPKT | X.224 DT`.
pub fn encode_x224_data(dst: &mut impl BufMut, payload: &[u8]) -> Result<()> {
    let length = crate::utils::u16_len(TPDU_DATA_LENGTH + payload.len(), "X.224 data packet")?;

    write_tpkt_header(dst, length);
    write_tpdu_header(dst, TPDU_DATA_HEADER_LENGTH as u8, X224TpduType::Data, 0);
    dst.put_slice(payload);

    Ok(())
}

/// Strips `TPKT | X.224 DT` from a slow-path frame.
pub fn decode_x224_data(frame: &[u8]) -> Result<&[u8]> {
    let mut src = frame;
    let length = usize::from(read_tpkt_header(&mut src)?);
    let mut src = split_to(&mut src, length.saturating_sub(TPKT_HEADER_LENGTH), "TPKT payload")?;

    match read_tpdu_header(&mut src)? {
        (_, X224TpduType::Data) => Ok(src),
        (_, code) => Err(Error::UnexpectedMessage {
            name: "X.224 TPDU code (expected data)",
            got: u32::from(code as u8),
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn tpkt_header_is_written_correctly() {
        let expected = [
            0x3, // version
            0x0, // reserved
            0x5, 0x42, // length in BE
        ];
        let mut buf = Vec::new();

        write_tpkt_header(&mut buf, 1346);

        assert_eq!(buf, expected);
    }

    #[test]
    fn tpdu_header_non_data_is_written_correctly() {
        let length = 0x42;
        let code = X224TpduType::ConnectionRequest;
        let expected = [
            length - 1,
            code as u8,
            0x0,
            0x0, // DST-REF
            0x0,
            0x0, // SRC-REF
            0x0, // Class 0
        ];
        let mut buf = Vec::new();

        write_tpdu_header(&mut buf, length, code, 0);

        assert_eq!(buf, expected);
    }

    #[test]
    fn tpdu_header_data_is_written_correctly() {
        let mut buf = Vec::new();

        write_tpdu_header(&mut buf, 0x42, X224TpduType::Data, 0);

        assert_eq!(buf, [0x41, 0xF0, 0x80]);
    }

    #[test]
    fn tpdu_code_and_len_are_read_correctly() {
        let mut stream: &[u8] = &[0x42, 0xE0, 0x0, 0x0, 0x0, 0x0, 0x0];

        let (length, code) = read_tpdu_header(&mut stream).unwrap();

        assert_eq!(length, 0x42);
        assert_eq!(code, X224TpduType::ConnectionRequest);
    }

    #[test]
    fn x224_data_round_trips() {
        let mut buf = Vec::new();
        encode_x224_data(&mut buf, &[0xAA, 0xBB]).unwrap();

        assert_eq!(buf, [0x03, 0x00, 0x00, 0x09, 0x02, 0xF0, 0x80, 0xAA, 0xBB]);
        assert_eq!(decode_x224_data(&buf).unwrap(), [0xAA, 0xBB]);
    }

    #[test]
    fn frame_length_of_slow_path() {
        assert_eq!(frame_length(&[0x03, 0x00]).unwrap(), None);
        assert_eq!(frame_length(&[0x03, 0x00, 0x01, 0x00]).unwrap(), Some(256));
    }

    #[test]
    fn frame_length_of_fast_path() {
        assert_eq!(frame_length(&[0x00, 0x10]).unwrap(), Some(0x10));
        assert_eq!(frame_length(&[0x80, 0x81]).unwrap(), None);
        assert_eq!(frame_length(&[0x80, 0x81, 0x02]).unwrap(), Some(0x102));
    }

    #[test]
    fn frame_length_rejects_garbage() {
        assert!(frame_length(&[0x01, 0x10]).is_err());
        assert!(frame_length(&[0x03, 0x00, 0x00, 0x02]).is_err());
        assert!(frame_length(&[0x00, 0x01]).is_err());
    }
}
