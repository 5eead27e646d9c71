//! BER/DER primitives used by the MCS connect PDUs and by CredSSP.
//!
//! Constructed values are written from an already encoded content buffer, which keeps length
//! computations trivial at the price of a copy.

use bytes::{Buf as _, BufMut};

use crate::utils::split_to;
use crate::{Error, Result};

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0A;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_CONTEXT_CONSTRUCTED: u8 = 0xA0;
const TAG_APPLICATION_HIGH: u8 = 0x7F;

pub fn write_length(dst: &mut impl BufMut, length: usize) -> Result<()> {
    if let Ok(short) = u8::try_from(length) {
        if short < 0x80 {
            dst.put_u8(short);
        } else {
            dst.put_u8(0x81);
            dst.put_u8(short);
        }
    } else {
        dst.put_u8(0x82);
        dst.put_u16(crate::utils::u16_len(length, "BER length")?);
    }

    Ok(())
}

pub fn read_length(src: &mut &[u8]) -> Result<usize> {
    ensure_size!(src[1] for "BER length");
    let byte = src.get_u8();

    if byte & 0x80 == 0 {
        return Ok(usize::from(byte));
    }

    match byte & 0x7F {
        1 => {
            ensure_size!(src[1] for "BER length");
            Ok(usize::from(src.get_u8()))
        }
        2 => {
            ensure_size!(src[2] for "BER length");
            Ok(usize::from(src.get_u16()))
        }
        _ => Err(Error::invalid("BER length", "size", "unsupported long form")),
    }
}

fn expect_tag(src: &mut &[u8], expected: u8, name: &'static str) -> Result<()> {
    ensure_size!(src[1] for name);
    let tag = src.get_u8();

    if tag != expected {
        return Err(Error::UnexpectedMessage {
            name,
            got: u32::from(tag),
        });
    }

    Ok(())
}

/// Application tag above 30 (MCS uses 101 and 102).
pub fn write_application(dst: &mut impl BufMut, tag: u8, content: &[u8]) -> Result<()> {
    dst.put_u8(TAG_APPLICATION_HIGH);
    dst.put_u8(tag);
    write_length(dst, content.len())?;
    dst.put_slice(content);
    Ok(())
}

pub fn read_application<'a>(src: &mut &'a [u8], tag: u8) -> Result<&'a [u8]> {
    expect_tag(src, TAG_APPLICATION_HIGH, "BER application tag")?;
    expect_tag(src, tag, "BER application tag number")?;
    let length = read_length(src)?;
    split_to(src, length, "BER application content")
}

pub fn write_sequence(dst: &mut impl BufMut, content: &[u8]) -> Result<()> {
    dst.put_u8(TAG_SEQUENCE);
    write_length(dst, content.len())?;
    dst.put_slice(content);
    Ok(())
}

pub fn read_sequence<'a>(src: &mut &'a [u8]) -> Result<&'a [u8]> {
    expect_tag(src, TAG_SEQUENCE, "BER sequence tag")?;
    let length = read_length(src)?;
    split_to(src, length, "BER sequence content")
}

/// Explicit context-specific tag `[n]`.
pub fn write_contextual(dst: &mut impl BufMut, n: u8, content: &[u8]) -> Result<()> {
    dst.put_u8(TAG_CONTEXT_CONSTRUCTED | n);
    write_length(dst, content.len())?;
    dst.put_slice(content);
    Ok(())
}

pub fn peek_contextual(src: &[u8], n: u8) -> bool {
    src.first() == Some(&(TAG_CONTEXT_CONSTRUCTED | n))
}

pub fn read_contextual<'a>(src: &mut &'a [u8], n: u8) -> Result<&'a [u8]> {
    expect_tag(src, TAG_CONTEXT_CONSTRUCTED | n, "BER context tag")?;
    let length = read_length(src)?;
    split_to(src, length, "BER context content")
}

pub fn write_integer(dst: &mut impl BufMut, value: u32) {
    let bytes = value.to_be_bytes();
    let size = match value {
        0..0x80 => 1,
        0x80..0x8000 => 2,
        0x8000..0x80_0000 => 3,
        0x80_0000..0x8000_0000 => 4,
        _ => 5,
    };

    dst.put_u8(TAG_INTEGER);
    dst.put_u8(size as u8);
    if size == 5 {
        dst.put_u8(0);
        dst.put_slice(&bytes);
    } else {
        dst.put_slice(&bytes[4 - size..]);
    }
}

/// Reads an integer as its low 32 bits, accepting both signed and unsigned renditions.
pub fn read_integer(src: &mut &[u8]) -> Result<u32> {
    expect_tag(src, TAG_INTEGER, "BER integer tag")?;
    let length = read_length(src)?;

    if length == 0 || length > 8 {
        return Err(Error::invalid("BER integer", "length", "must be between 1 and 8"));
    }

    let bytes = split_to(src, length, "BER integer")?;
    let value = bytes.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));

    Ok((value & 0xFFFF_FFFF) as u32)
}

/// Reads the raw big-endian content of an integer of any size (RSA moduli).
pub fn read_integer_bytes<'a>(src: &mut &'a [u8]) -> Result<&'a [u8]> {
    expect_tag(src, TAG_INTEGER, "BER integer tag")?;
    let length = read_length(src)?;
    split_to(src, length, "BER integer")
}

pub fn write_octet_string(dst: &mut impl BufMut, value: &[u8]) -> Result<()> {
    dst.put_u8(TAG_OCTET_STRING);
    write_length(dst, value.len())?;
    dst.put_slice(value);
    Ok(())
}

pub fn read_octet_string<'a>(src: &mut &'a [u8]) -> Result<&'a [u8]> {
    expect_tag(src, TAG_OCTET_STRING, "BER octet string tag")?;
    let length = read_length(src)?;
    split_to(src, length, "BER octet string")
}

pub fn write_boolean(dst: &mut impl BufMut, value: bool) {
    dst.put_u8(TAG_BOOLEAN);
    dst.put_u8(1);
    dst.put_u8(if value { 0xFF } else { 0x00 });
}

pub fn read_boolean(src: &mut &[u8]) -> Result<bool> {
    expect_tag(src, TAG_BOOLEAN, "BER boolean tag")?;
    let length = read_length(src)?;
    let bytes = split_to(src, length, "BER boolean")?;
    Ok(bytes.first().is_some_and(|b| *b != 0))
}

pub fn write_enumerated(dst: &mut impl BufMut, value: u8) {
    dst.put_u8(TAG_ENUMERATED);
    dst.put_u8(1);
    dst.put_u8(value);
}

pub fn read_enumerated(src: &mut &[u8]) -> Result<u8> {
    expect_tag(src, TAG_ENUMERATED, "BER enumerated tag")?;
    let length = read_length(src)?;
    if length != 1 {
        return Err(Error::invalid("BER enumerated", "length", "must be 1"));
    }
    ensure_size!(src[1] for "BER enumerated");
    Ok(src.get_u8())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0x00, &[0x02, 0x01, 0x00])]
    #[case(0x7F, &[0x02, 0x01, 0x7F])]
    #[case(0x80, &[0x02, 0x02, 0x00, 0x80])]
    #[case(0xFFFF, &[0x02, 0x03, 0x00, 0xFF, 0xFF])]
    #[case(0xC000_006D, &[0x02, 0x05, 0x00, 0xC0, 0x00, 0x00, 0x6D])]
    fn integer_encoding(#[case] value: u32, #[case] expected: &[u8]) {
        let mut buf = Vec::new();
        write_integer(&mut buf, value);
        assert_eq!(buf, expected);
        assert_eq!(read_integer(&mut buf.as_slice()).unwrap(), value);
    }

    #[test]
    fn negative_integer_keeps_low_bits() {
        let mut src: &[u8] = &[0x02, 0x04, 0xC0, 0x00, 0x00, 0x6D];
        assert_eq!(read_integer(&mut src).unwrap(), 0xC000_006D);
    }

    #[rstest]
    #[case(0x10, &[0x10])]
    #[case(0x80, &[0x81, 0x80])]
    #[case(0x1234, &[0x82, 0x12, 0x34])]
    fn length_encoding(#[case] length: usize, #[case] expected: &[u8]) {
        let mut buf = Vec::new();
        write_length(&mut buf, length).unwrap();
        assert_eq!(buf, expected);
        assert_eq!(read_length(&mut buf.as_slice()).unwrap(), length);
    }

    #[test]
    fn contextual_wraps_content() {
        let mut inner = Vec::new();
        write_integer(&mut inner, 6);
        let mut buf = Vec::new();
        write_contextual(&mut buf, 0, &inner).unwrap();

        assert_eq!(buf, [0xA0, 0x03, 0x02, 0x01, 0x06]);
        assert!(peek_contextual(&buf, 0));

        let mut src = buf.as_slice();
        let mut content = read_contextual(&mut src, 0).unwrap();
        assert_eq!(read_integer(&mut content).unwrap(), 6);
    }

    #[test]
    fn wrong_tag_is_reported() {
        let mut src: &[u8] = &[0x04, 0x00];
        assert!(read_sequence(&mut src).is_err());
    }
}
