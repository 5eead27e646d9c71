use bytes::BufMut as _;

use crate::{Error, Result};

/// Splits `n` bytes off the front of `src`.
pub fn split_to<'a>(src: &mut &'a [u8], n: usize, name: &'static str) -> Result<&'a [u8]> {
    ensure_size!(src[n] for name);
    let (head, tail) = src.split_at(n);
    *src = tail;
    Ok(head)
}

pub fn skip(src: &mut &[u8], n: usize, name: &'static str) -> Result<()> {
    split_to(src, n, name).map(|_| ())
}

pub fn read_array<const N: usize>(src: &mut &[u8], name: &'static str) -> Result<[u8; N]> {
    let bytes = split_to(src, N, name)?;
    let mut out = [0; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// UTF-16LE bytes without terminator.
pub fn to_utf16_bytes(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

pub fn from_utf16_bytes(value: &[u8]) -> String {
    let units: Vec<u16> = value
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Writes `value` as UTF-16LE into a fixed-size, zero-padded field, truncated so a terminator always fits.
pub fn put_utf16_fixed(dst: &mut impl bytes::BufMut, value: &str, field_size: usize) {
    let mut encoded = to_utf16_bytes(value);
    encoded.truncate(field_size.saturating_sub(2) & !1);
    let padding = field_size - encoded.len();
    dst.put_slice(&encoded);
    dst.put_bytes(0, padding);
}

pub fn u16_len(len: usize, name: &'static str) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::Oversized {
        name,
        size: len,
        max: usize::from(u16::MAX),
    })
}

pub fn u32_len(len: usize, name: &'static str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Oversized {
        name,
        size: len,
        max: usize::try_from(u32::MAX).unwrap_or(usize::MAX),
    })
}

pub fn u8_len(len: usize, name: &'static str) -> Result<u8> {
    u8::try_from(len).map_err(|_| Error::Oversized {
        name,
        size: len,
        max: usize::from(u8::MAX),
    })
}
