//! ASN.1 PER (aligned, T.125 / T.124 subset) primitives.

use bytes::{Buf as _, BufMut};

use crate::utils::split_to;
use crate::{Error, Result};

pub fn write_length(dst: &mut impl BufMut, length: u16) {
    if length > 0x7F {
        dst.put_u16(length | 0x8000);
    } else {
        dst.put_u8(length as u8);
    }
}

pub fn read_length(src: &mut &[u8]) -> Result<u16> {
    ensure_size!(src[1] for "PER length");
    let a = src.get_u8();

    if a & 0x80 != 0 {
        ensure_size!(src[1] for "PER length");
        let b = src.get_u8();
        Ok((u16::from(a & 0x7F) << 8) | u16::from(b))
    } else {
        Ok(u16::from(a))
    }
}

pub fn sizeof_length(length: u16) -> usize {
    if length > 0x7F { 2 } else { 1 }
}

pub fn write_choice(dst: &mut impl BufMut, choice: u8) {
    dst.put_u8(choice);
}

pub fn read_choice(src: &mut &[u8]) -> Result<u8> {
    ensure_size!(src[1] for "PER choice");
    Ok(src.get_u8())
}

pub fn write_selection(dst: &mut impl BufMut, selection: u8) {
    dst.put_u8(selection);
}

pub fn read_selection(src: &mut &[u8]) -> Result<u8> {
    ensure_size!(src[1] for "PER selection");
    Ok(src.get_u8())
}

pub fn write_number_of_sets(dst: &mut impl BufMut, number: u8) {
    dst.put_u8(number);
}

pub fn read_number_of_sets(src: &mut &[u8]) -> Result<u8> {
    ensure_size!(src[1] for "PER number of sets");
    Ok(src.get_u8())
}

pub fn write_padding(dst: &mut impl BufMut, count: usize) {
    dst.put_bytes(0, count);
}

pub fn read_padding(src: &mut &[u8], count: usize) -> Result<()> {
    split_to(src, count, "PER padding").map(|_| ())
}

pub fn write_enumerated(dst: &mut impl BufMut, value: u8) {
    dst.put_u8(value);
}

pub fn read_enumerated(src: &mut &[u8], count: u8) -> Result<u8> {
    ensure_size!(src[1] for "PER enumerated");
    let value = src.get_u8();

    if value >= count {
        return Err(Error::invalid("PER enumerated", "value", "out of range"));
    }

    Ok(value)
}

/// Unconstrained integer, length-prefixed.
pub fn write_integer(dst: &mut impl BufMut, value: u32) {
    if let Ok(value) = u8::try_from(value) {
        write_length(dst, 1);
        dst.put_u8(value);
    } else if let Ok(value) = u16::try_from(value) {
        write_length(dst, 2);
        dst.put_u16(value);
    } else {
        write_length(dst, 4);
        dst.put_u32(value);
    }
}

pub fn read_integer(src: &mut &[u8]) -> Result<u32> {
    let length = read_length(src)?;
    ensure_size!(src[usize::from(length)] for "PER integer");

    match length {
        1 => Ok(u32::from(src.get_u8())),
        2 => Ok(u32::from(src.get_u16())),
        4 => Ok(src.get_u32()),
        _ => Err(Error::invalid("PER integer", "length", "must be 1, 2 or 4")),
    }
}

/// Constrained 16-bit integer with a lower bound.
pub fn write_u16(dst: &mut impl BufMut, value: u16, min: u16) -> Result<()> {
    let value = value
        .checked_sub(min)
        .ok_or_else(|| Error::invalid("PER integer16", "value", "lower than the minimum"))?;
    dst.put_u16(value);
    Ok(())
}

pub fn read_u16(src: &mut &[u8], min: u16) -> Result<u16> {
    ensure_size!(src[2] for "PER integer16");
    src.get_u16()
        .checked_add(min)
        .ok_or_else(|| Error::invalid("PER integer16", "value", "overflow"))
}

pub fn write_object_identifier(dst: &mut impl BufMut, oid: [u8; 6]) {
    write_length(dst, 5);
    dst.put_u8(oid[0] * 40 + oid[1]);
    dst.put_slice(&oid[2..]);
}

pub fn read_object_identifier(src: &mut &[u8]) -> Result<[u8; 6]> {
    let length = read_length(src)?;
    if length != 5 {
        return Err(Error::invalid("PER object identifier", "length", "must be 5"));
    }

    let bytes = split_to(src, 5, "PER object identifier")?;
    let first = bytes[0];

    Ok([first / 40, first % 40, bytes[1], bytes[2], bytes[3], bytes[4]])
}

pub fn write_octet_string(dst: &mut impl BufMut, value: &[u8], min: usize) -> Result<()> {
    let length = value
        .len()
        .checked_sub(min)
        .ok_or_else(|| Error::invalid("PER octet string", "length", "lower than the minimum"))?;
    write_length(dst, crate::utils::u16_len(length, "PER octet string")?);
    dst.put_slice(value);
    Ok(())
}

pub fn read_octet_string<'a>(src: &mut &'a [u8], min: usize) -> Result<&'a [u8]> {
    let length = usize::from(read_length(src)?) + min;
    split_to(src, length, "PER octet string")
}

/// Numeric string, digits packed two per byte.
pub fn write_numeric_string(dst: &mut impl BufMut, value: &[u8], min: usize) -> Result<()> {
    let length = value
        .len()
        .checked_sub(min)
        .ok_or_else(|| Error::invalid("PER numeric string", "length", "lower than the minimum"))?;
    write_length(dst, crate::utils::u16_len(length, "PER numeric string")?);

    for pair in value.chunks(2) {
        let c1 = (pair[0].wrapping_sub(b'0')) % 10;
        let c2 = pair.get(1).map_or(0, |c| c.wrapping_sub(b'0') % 10);
        dst.put_u8((c1 << 4) | c2);
    }

    Ok(())
}

pub fn read_numeric_string(src: &mut &[u8], min: usize) -> Result<()> {
    let length = usize::from(read_length(src)?) + min;
    split_to(src, length.div_ceil(2), "PER numeric string").map(|_| ())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn long_length_sets_the_high_bit() {
        let mut buf = Vec::new();
        write_length(&mut buf, 0x0123);
        assert_eq!(buf, [0x81, 0x23]);
        assert_eq!(read_length(&mut buf.as_slice()).unwrap(), 0x0123);
    }

    #[test]
    fn short_length_is_one_byte() {
        let mut buf = Vec::new();
        write_length(&mut buf, 0x7F);
        assert_eq!(buf, [0x7F]);
    }

    #[test]
    fn integer_uses_the_smallest_width() {
        let mut buf = Vec::new();
        write_integer(&mut buf, 0x1234);
        assert_eq!(buf, [0x02, 0x12, 0x34]);
        assert_eq!(read_integer(&mut buf.as_slice()).unwrap(), 0x1234);
    }

    #[test]
    fn t124_object_identifier() {
        let mut buf = Vec::new();
        write_object_identifier(&mut buf, [0, 0, 20, 124, 0, 1]);
        assert_eq!(buf, [0x05, 0x00, 0x14, 0x7C, 0x00, 0x01]);
        assert_eq!(read_object_identifier(&mut buf.as_slice()).unwrap(), [0, 0, 20, 124, 0, 1]);
    }

    #[test]
    fn numeric_string_packs_digits() {
        let mut buf = Vec::new();
        write_numeric_string(&mut buf, b"1", 1).unwrap();
        assert_eq!(buf, [0x00, 0x10]);
    }

    #[test]
    fn constrained_integer_applies_minimum() {
        let mut buf = Vec::new();
        write_u16(&mut buf, 1007, 1001).unwrap();
        assert_eq!(buf, [0x00, 0x06]);
        assert_eq!(read_u16(&mut buf.as_slice(), 1001).unwrap(), 1007);
    }
}
