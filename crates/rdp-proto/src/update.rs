//! Graphics and pointer updates shared by the slow-path and fast-path output paths.

use bytes::{Buf as _, BufMut as _};

use crate::utils::{read_array, split_to, u16_len, u32_len};
use crate::{Error, Result};

const BITMAP_COMPRESSION: u16 = 0x0001;
const NO_BITMAP_COMPRESSION_HDR: u16 = 0x0400;
const COMPRESSED_DATA_HEADER_SIZE: usize = 8;
const UPDATE_TYPE_BITMAP: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapEncoding {
    /// Uncompressed, bottom-up scanlines.
    Raw,
    /// Interleaved RLE (MS-RDPBCGR 2.2.9.1.1.3.1.2.4).
    Interleaved,
}

impl core::fmt::Display for BitmapEncoding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Interleaved => f.write_str("interleaved-rle"),
        }
    }
}

/// TS_BITMAP_DATA
#[derive(Clone, PartialEq, Eq)]
pub struct BitmapData {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u16,
    pub encoding: BitmapEncoding,
    /// TS_CD_HEADER, present for compressed bitmaps unless the server dropped it.
    pub compressed_header: Option<[u8; COMPRESSED_DATA_HEADER_SIZE]>,
    pub data: Vec<u8>,
}

impl core::fmt::Debug for BitmapData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitmapData")
            .field("left", &self.left)
            .field("top", &self.top)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bits_per_pixel", &self.bits_per_pixel)
            .field("encoding", &self.encoding)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl BitmapData {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut flags = 0;
        if self.encoding == BitmapEncoding::Interleaved {
            flags |= BITMAP_COMPRESSION;
            if self.compressed_header.is_none() {
                flags |= NO_BITMAP_COMPRESSION_HDR;
            }
        }

        let header_len = self.compressed_header.map_or(0, |header| header.len());

        dst.put_u16_le(self.left);
        dst.put_u16_le(self.top);
        dst.put_u16_le(self.right);
        dst.put_u16_le(self.bottom);
        dst.put_u16_le(self.width);
        dst.put_u16_le(self.height);
        dst.put_u16_le(self.bits_per_pixel);
        dst.put_u16_le(flags);
        dst.put_u16_le(u16_len(self.data.len() + header_len, "bitmapLength")?);
        if let Some(header) = &self.compressed_header {
            dst.put_slice(header);
        }
        dst.put_slice(&self.data);

        Ok(())
    }

    pub fn decode(src: &mut &[u8]) -> Result<Self> {
        ensure_size!(src[18] for "TS_BITMAP_DATA");
        let left = src.get_u16_le();
        let top = src.get_u16_le();
        let right = src.get_u16_le();
        let bottom = src.get_u16_le();
        let width = src.get_u16_le();
        let height = src.get_u16_le();
        let bits_per_pixel = src.get_u16_le();
        let flags = src.get_u16_le();
        let length = usize::from(src.get_u16_le());

        let mut body = split_to(src, length, "TS_BITMAP_DATA bitmapDataStream")?;

        let (encoding, compressed_header) = if flags & BITMAP_COMPRESSION == 0 {
            (BitmapEncoding::Raw, None)
        } else if flags & NO_BITMAP_COMPRESSION_HDR != 0 {
            (BitmapEncoding::Interleaved, None)
        } else {
            let header = read_array(&mut body, "TS_CD_HEADER")?;
            (BitmapEncoding::Interleaved, Some(header))
        };

        if right < left || bottom < top {
            return Err(Error::invalid("TS_BITMAP_DATA", "destRect", "inverted rectangle"));
        }

        Ok(Self {
            left,
            top,
            right,
            bottom,
            width,
            height,
            bits_per_pixel,
            encoding,
            compressed_header,
            data: body.to_vec(),
        })
    }
}

/// TS_UPDATE_BITMAP_DATA, identical on both output paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapUpdate {
    pub rectangles: Vec<BitmapData>,
}

impl BitmapUpdate {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u16_le(UPDATE_TYPE_BITMAP);
        dst.put_u16_le(u16_len(self.rectangles.len(), "numberRectangles")?);
        for rectangle in &self.rectangles {
            rectangle.encode(dst)?;
        }
        Ok(())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "TS_UPDATE_BITMAP_DATA");
        let update_type = src.get_u16_le();
        if update_type != UPDATE_TYPE_BITMAP {
            return Err(Error::UnexpectedMessage {
                name: "TS_UPDATE_BITMAP_DATA updateType",
                got: u32::from(update_type),
            });
        }
        let count = src.get_u16_le();
        let rectangles = (0..count)
            .map(|_| BitmapData::decode(&mut src))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rectangles })
    }
}

/// Slow-path TS_UPDATE_* payload of an Update share data PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlowPathUpdate {
    Orders,
    Bitmap(BitmapUpdate),
    Palette,
    Synchronize,
}

impl SlowPathUpdate {
    pub fn decode(src: &[u8]) -> Result<Self> {
        ensure_size!(src[2] for "TS_UPDATE");
        let update_type = u16::from_le_bytes([src[0], src[1]]);

        match update_type {
            0x0000 => Ok(Self::Orders),
            UPDATE_TYPE_BITMAP => BitmapUpdate::decode(src).map(Self::Bitmap),
            0x0002 => Ok(Self::Palette),
            0x0003 => Ok(Self::Synchronize),
            _ => Err(Error::UnexpectedMessage {
                name: "TS_UPDATE updateType",
                got: u32::from(update_type),
            }),
        }
    }
}

const SYSPTR_NULL: u32 = 0x0000_0000;
const SYSPTR_DEFAULT: u32 = 0x0000_7F00;

/// Attributes shared by color, new and large pointer updates.
#[derive(Clone, PartialEq, Eq)]
pub struct PointerShape {
    pub xor_bpp: u16,
    pub cache_index: u16,
    pub hotspot: (u16, u16),
    pub width: u16,
    pub height: u16,
    pub xor_mask: Vec<u8>,
    pub and_mask: Vec<u8>,
}

impl core::fmt::Debug for PointerShape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PointerShape")
            .field("xor_bpp", &self.xor_bpp)
            .field("cache_index", &self.cache_index)
            .field("hotspot", &self.hotspot)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl PointerShape {
    /// TS_COLORPOINTERATTRIBUTE
    fn decode_color(src: &mut &[u8], xor_bpp: u16) -> Result<Self> {
        ensure_size!(src[14] for "TS_COLORPOINTERATTRIBUTE");
        let cache_index = src.get_u16_le();
        let hotspot = (src.get_u16_le(), src.get_u16_le());
        let width = src.get_u16_le();
        let height = src.get_u16_le();
        let and_len = usize::from(src.get_u16_le());
        let xor_len = usize::from(src.get_u16_le());
        let xor_mask = split_to(src, xor_len, "xorMaskData")?.to_vec();
        let and_mask = split_to(src, and_len, "andMaskData")?.to_vec();

        Ok(Self {
            xor_bpp,
            cache_index,
            hotspot,
            width,
            height,
            xor_mask,
            and_mask,
        })
    }

    fn encode_color(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u16_le(self.cache_index);
        dst.put_u16_le(self.hotspot.0);
        dst.put_u16_le(self.hotspot.1);
        dst.put_u16_le(self.width);
        dst.put_u16_le(self.height);
        dst.put_u16_le(u16_len(self.and_mask.len(), "lengthAndMask")?);
        dst.put_u16_le(u16_len(self.xor_mask.len(), "lengthXorMask")?);
        dst.put_slice(&self.xor_mask);
        dst.put_slice(&self.and_mask);
        dst.put_u8(0);
        Ok(())
    }

    /// TS_LARGEPOINTERATTRIBUTE
    fn decode_large(src: &mut &[u8]) -> Result<Self> {
        ensure_size!(src[20] for "TS_LARGEPOINTERATTRIBUTE");
        let xor_bpp = src.get_u16_le();
        let cache_index = src.get_u16_le();
        let hotspot = (src.get_u16_le(), src.get_u16_le());
        let width = src.get_u16_le();
        let height = src.get_u16_le();
        let and_len = src.get_u32_le() as usize;
        let xor_len = src.get_u32_le() as usize;
        let xor_mask = split_to(src, xor_len, "xorMaskData")?.to_vec();
        let and_mask = split_to(src, and_len, "andMaskData")?.to_vec();

        Ok(Self {
            xor_bpp,
            cache_index,
            hotspot,
            width,
            height,
            xor_mask,
            and_mask,
        })
    }

    fn encode_large(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u16_le(self.xor_bpp);
        dst.put_u16_le(self.cache_index);
        dst.put_u16_le(self.hotspot.0);
        dst.put_u16_le(self.hotspot.1);
        dst.put_u16_le(self.width);
        dst.put_u16_le(self.height);
        dst.put_u32_le(u32_len(self.and_mask.len(), "lengthAndMask")?);
        dst.put_u32_le(u32_len(self.xor_mask.len(), "lengthXorMask")?);
        dst.put_slice(&self.xor_mask);
        dst.put_slice(&self.and_mask);
        dst.put_u8(0);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerUpdate {
    Hidden,
    Default,
    Position { x: u16, y: u16 },
    Color(PointerShape),
    New(PointerShape),
    Cached { cache_index: u16 },
    Large(PointerShape),
}

/// Fast-path pointer update codes share these bodies; the slow path prefixes a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Hidden,
    Default,
    Position,
    Color,
    New,
    Cached,
    Large,
}

impl PointerUpdate {
    pub fn kind(&self) -> PointerKind {
        match self {
            Self::Hidden => PointerKind::Hidden,
            Self::Default => PointerKind::Default,
            Self::Position { .. } => PointerKind::Position,
            Self::Color(_) => PointerKind::Color,
            Self::New(_) => PointerKind::New,
            Self::Cached { .. } => PointerKind::Cached,
            Self::Large(_) => PointerKind::Large,
        }
    }

    pub fn decode_body(kind: PointerKind, mut src: &[u8]) -> Result<Self> {
        let update = match kind {
            PointerKind::Hidden => Self::Hidden,
            PointerKind::Default => Self::Default,
            PointerKind::Position => {
                ensure_size!(src[4] for "TS_POINTERPOSATTRIBUTE");
                Self::Position {
                    x: src.get_u16_le(),
                    y: src.get_u16_le(),
                }
            }
            PointerKind::Color => Self::Color(PointerShape::decode_color(&mut src, 24)?),
            PointerKind::New => {
                ensure_size!(src[2] for "TS_POINTERATTRIBUTE");
                let xor_bpp = src.get_u16_le();
                Self::New(PointerShape::decode_color(&mut src, xor_bpp)?)
            }
            PointerKind::Cached => {
                ensure_size!(src[2] for "TS_CACHEDPOINTERATTRIBUTE");
                Self::Cached {
                    cache_index: src.get_u16_le(),
                }
            }
            PointerKind::Large => Self::Large(PointerShape::decode_large(&mut src)?),
        };

        Ok(update)
    }

    pub fn encode_body(&self, dst: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Hidden | Self::Default => {}
            Self::Position { x, y } => {
                dst.put_u16_le(*x);
                dst.put_u16_le(*y);
            }
            Self::Color(shape) => shape.encode_color(dst)?,
            Self::New(shape) => {
                dst.put_u16_le(shape.xor_bpp);
                shape.encode_color(dst)?;
            }
            Self::Cached { cache_index } => dst.put_u16_le(*cache_index),
            Self::Large(shape) => shape.encode_large(dst)?,
        }
        Ok(())
    }

    /// TS_POINTER_PDU body of a slow-path Pointer share data PDU.
    pub fn decode_slow_path(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "TS_POINTER_PDU");
        let message_type = src.get_u16_le();
        src.advance(2);

        let kind = match message_type {
            0x0001 => {
                ensure_size!(src[4] for "TS_SYSTEMPOINTERATTRIBUTE");
                return match src.get_u32_le() {
                    SYSPTR_NULL => Ok(Self::Hidden),
                    SYSPTR_DEFAULT => Ok(Self::Default),
                    other => Err(Error::UnexpectedMessage {
                        name: "systemPointerType",
                        got: other,
                    }),
                };
            }
            0x0003 => PointerKind::Position,
            0x0006 => PointerKind::Color,
            0x0007 => PointerKind::Cached,
            0x0008 => PointerKind::New,
            0x0009 => PointerKind::Large,
            _ => {
                return Err(Error::UnexpectedMessage {
                    name: "TS_POINTER_PDU messageType",
                    got: u32::from(message_type),
                });
            }
        };

        Self::decode_body(kind, src)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;

    fn rectangle(encoding: BitmapEncoding, compressed_header: Option<[u8; 8]>) -> BitmapData {
        BitmapData {
            left: 0,
            top: 0,
            right: 63,
            bottom: 63,
            width: 64,
            height: 64,
            bits_per_pixel: 16,
            encoding,
            compressed_header,
            data: vec![0xAB; 32],
        }
    }

    #[rstest]
    #[case(rectangle(BitmapEncoding::Raw, None))]
    #[case(rectangle(BitmapEncoding::Interleaved, None))]
    #[case(rectangle(BitmapEncoding::Interleaved, Some([0, 0, 32, 0, 128, 0, 0, 32])))]
    fn bitmap_update_keeps_encoding(#[case] rectangle: BitmapData) {
        let update = BitmapUpdate {
            rectangles: vec![rectangle.clone(), rectangle],
        };
        let mut buf = Vec::new();
        update.encode(&mut buf).unwrap();

        let SlowPathUpdate::Bitmap(decoded) = SlowPathUpdate::decode(&buf).unwrap() else {
            panic!("expected a bitmap update");
        };
        assert_eq!(decoded, update);
    }

    #[test]
    fn truncated_bitmap_is_an_error() {
        let update = BitmapUpdate {
            rectangles: vec![rectangle(BitmapEncoding::Raw, None)],
        };
        let mut buf = Vec::new();
        update.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(matches!(
            BitmapUpdate::decode(&buf),
            Err(Error::NotEnoughBytes { .. })
        ));
    }

    #[rstest]
    #[case(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], PointerUpdate::Hidden)]
    #[case(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x7F, 0x00, 0x00], PointerUpdate::Default)]
    #[case(&[0x03, 0x00, 0x00, 0x00, 0x10, 0x00, 0x20, 0x00], PointerUpdate::Position { x: 16, y: 32 })]
    #[case(&[0x07, 0x00, 0x00, 0x00, 0x02, 0x00], PointerUpdate::Cached { cache_index: 2 })]
    fn slow_path_pointer(#[case] bytes: &[u8], #[case] expected: PointerUpdate) {
        assert_eq!(PointerUpdate::decode_slow_path(bytes).unwrap(), expected);
    }

    #[test]
    fn new_pointer_body() {
        let update = PointerUpdate::New(PointerShape {
            xor_bpp: 32,
            cache_index: 1,
            hotspot: (3, 4),
            width: 2,
            height: 2,
            xor_mask: vec![0xFF; 16],
            and_mask: vec![0x00; 4],
        });
        let mut buf = Vec::new();
        update.encode_body(&mut buf).unwrap();

        assert_eq!(PointerUpdate::decode_body(PointerKind::New, &buf).unwrap(), update);
    }
}
