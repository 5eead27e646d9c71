//! Capability sets exchanged in the Demand Active / Confirm Active PDUs.

use bitflags::bitflags;
use bytes::{Buf as _, BufMut as _};

use crate::utils::{split_to, u16_len};
use crate::{Error, Result};

pub const CAPABILITY_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CapabilitySetType {
    General = 0x0001,
    Bitmap = 0x0002,
    Order = 0x0003,
    BitmapCache = 0x0004,
    Control = 0x0005,
    Activation = 0x0007,
    Pointer = 0x0008,
    Share = 0x0009,
    ColorCache = 0x000A,
    Sound = 0x000C,
    Input = 0x000D,
    Font = 0x000E,
    Brush = 0x000F,
    GlyphCache = 0x0010,
    OffscreenBitmapCache = 0x0011,
    VirtualChannel = 0x0014,
    MultifragmentUpdate = 0x001A,
    LargePointer = 0x001B,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GeneralExtraFlags: u16 {
        const FASTPATH_OUTPUT_SUPPORTED = 0x0001;
        const NO_BITMAP_COMPRESSION_HDR = 0x0400;
        const LONG_CREDENTIALS_SUPPORTED = 0x0004;
        const AUTORECONNECT_SUPPORTED = 0x0008;
        const ENC_SALTED_CHECKSUM = 0x0010;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InputFlags: u16 {
        const SCANCODES = 0x0001;
        const MOUSEX = 0x0004;
        const FASTPATH_INPUT = 0x0008;
        const UNICODE = 0x0010;
        const FASTPATH_INPUT2 = 0x0020;
        const UNUSED1 = 0x0040;
        const MOUSE_HWHEEL = 0x0100;
    }
}

/// TS_GENERAL_CAPABILITYSET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct General {
    pub os_major_type: u16,
    pub os_minor_type: u16,
    pub extra_flags: GeneralExtraFlags,
    pub refresh_rect_support: bool,
    pub suppress_output_support: bool,
}

impl General {
    const BODY_SIZE: usize = 20;
    const PROTOCOL_VERSION: u16 = 0x0200;

    fn encode_body(&self, dst: &mut Vec<u8>) {
        dst.put_u16_le(self.os_major_type);
        dst.put_u16_le(self.os_minor_type);
        dst.put_u16_le(Self::PROTOCOL_VERSION);
        dst.put_u16_le(0); // pad2octetsA
        dst.put_u16_le(0); // generalCompressionTypes
        dst.put_u16_le(self.extra_flags.bits());
        dst.put_u16_le(0); // updateCapabilityFlag
        dst.put_u16_le(0); // remoteUnshareFlag
        dst.put_u16_le(0); // generalCompressionLevel
        dst.put_u8(u8::from(self.refresh_rect_support));
        dst.put_u8(u8::from(self.suppress_output_support));
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[Self::BODY_SIZE] for "TS_GENERAL_CAPABILITYSET");
        let os_major_type = src.get_u16_le();
        let os_minor_type = src.get_u16_le();
        src.advance(6);
        let extra_flags = GeneralExtraFlags::from_bits_truncate(src.get_u16_le());
        src.advance(6);
        let refresh_rect_support = src.get_u8() != 0;
        let suppress_output_support = src.get_u8() != 0;

        Ok(Self {
            os_major_type,
            os_minor_type,
            extra_flags,
            refresh_rect_support,
            suppress_output_support,
        })
    }
}

/// TS_BITMAP_CAPABILITYSET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    pub preferred_bits_per_pixel: u16,
    pub desktop_width: u16,
    pub desktop_height: u16,
    pub desktop_resize: bool,
    pub drawing_flags: u8,
}

impl Bitmap {
    const BODY_SIZE: usize = 24;

    fn encode_body(&self, dst: &mut Vec<u8>) {
        dst.put_u16_le(self.preferred_bits_per_pixel);
        dst.put_u16_le(1); // receive1BitPerPixel
        dst.put_u16_le(1); // receive4BitsPerPixel
        dst.put_u16_le(1); // receive8BitsPerPixel
        dst.put_u16_le(self.desktop_width);
        dst.put_u16_le(self.desktop_height);
        dst.put_u16_le(0);
        dst.put_u16_le(u16::from(self.desktop_resize));
        dst.put_u16_le(1); // bitmapCompressionFlag
        dst.put_u8(0); // highColorFlags
        dst.put_u8(self.drawing_flags);
        dst.put_u16_le(1); // multipleRectangleSupport
        dst.put_u16_le(0);
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[Self::BODY_SIZE] for "TS_BITMAP_CAPABILITYSET");
        let preferred_bits_per_pixel = src.get_u16_le();
        src.advance(6);
        let desktop_width = src.get_u16_le();
        let desktop_height = src.get_u16_le();
        src.advance(2);
        let desktop_resize = src.get_u16_le() != 0;
        src.advance(3);
        let drawing_flags = src.get_u8();

        Ok(Self {
            preferred_bits_per_pixel,
            desktop_width,
            desktop_height,
            desktop_resize,
            drawing_flags,
        })
    }
}

/// TS_POINTER_CAPABILITYSET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    pub color_pointer_cache_size: u16,
    pub pointer_cache_size: u16,
}

impl Pointer {
    fn encode_body(&self, dst: &mut Vec<u8>) {
        dst.put_u16_le(1); // colorPointerFlag
        dst.put_u16_le(self.color_pointer_cache_size);
        dst.put_u16_le(self.pointer_cache_size);
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "TS_POINTER_CAPABILITYSET");
        let _color_pointer_flag = src.get_u16_le();
        let color_pointer_cache_size = src.get_u16_le();
        let pointer_cache_size = if src.len() >= 2 {
            src.get_u16_le()
        } else {
            color_pointer_cache_size
        };

        Ok(Self {
            color_pointer_cache_size,
            pointer_cache_size,
        })
    }
}

/// TS_INPUT_CAPABILITYSET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Input {
    pub flags: InputFlags,
    pub keyboard_layout: u32,
    pub keyboard_type: u32,
    pub keyboard_function_keys: u32,
}

impl Input {
    const BODY_SIZE: usize = 84;
    const IME_FILE_NAME_SIZE: usize = 64;

    fn encode_body(&self, dst: &mut Vec<u8>) {
        dst.put_u16_le(self.flags.bits());
        dst.put_u16_le(0);
        dst.put_u32_le(self.keyboard_layout);
        dst.put_u32_le(self.keyboard_type);
        dst.put_u32_le(0); // keyboardSubType
        dst.put_u32_le(self.keyboard_function_keys);
        dst.put_bytes(0, Self::IME_FILE_NAME_SIZE);
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[20] for "TS_INPUT_CAPABILITYSET");
        let flags = InputFlags::from_bits_truncate(src.get_u16_le());
        src.advance(2);
        let keyboard_layout = src.get_u32_le();
        let keyboard_type = src.get_u32_le();
        let _sub_type = src.get_u32_le();
        let keyboard_function_keys = src.get_u32_le();

        Ok(Self {
            flags,
            keyboard_layout,
            keyboard_type,
            keyboard_function_keys,
        })
    }
}

/// TS_VIRTUALCHANNEL_CAPABILITYSET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualChannel {
    pub flags: u32,
    pub chunk_size: Option<u32>,
}

impl VirtualChannel {
    fn encode_body(&self, dst: &mut Vec<u8>) {
        dst.put_u32_le(self.flags);
        if let Some(chunk_size) = self.chunk_size {
            dst.put_u32_le(chunk_size);
        }
    }

    fn decode_body(mut src: &[u8]) -> Result<Self> {
        ensure_size!(src[4] for "TS_VIRTUALCHANNEL_CAPABILITYSET");
        let flags = src.get_u32_le();
        let chunk_size = (src.len() >= 4).then(|| src.get_u32_le());
        Ok(Self { flags, chunk_size })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilitySet {
    General(General),
    Bitmap(Bitmap),
    /// TS_ORDER_CAPABILITYSET; no drawing orders are supported, only the desktop save size varies.
    Order { desktop_save_size: u32 },
    /// Revision 1 bitmap cache with the usual three cells.
    BitmapCache,
    Pointer(Pointer),
    Input(Input),
    Brush { support_level: u32 },
    GlyphCache { support_level: u16 },
    OffscreenBitmapCache { support_level: u32, cache_size: u16, cache_entries: u16 },
    VirtualChannel(VirtualChannel),
    Sound { beeps: bool },
    MultifragmentUpdate { max_request_size: u32 },
    Other { ty: u16, data: Vec<u8> },
}

impl CapabilitySet {
    pub fn ty(&self) -> u16 {
        let ty = match self {
            Self::General(_) => CapabilitySetType::General,
            Self::Bitmap(_) => CapabilitySetType::Bitmap,
            Self::Order { .. } => CapabilitySetType::Order,
            Self::BitmapCache => CapabilitySetType::BitmapCache,
            Self::Pointer(_) => CapabilitySetType::Pointer,
            Self::Input(_) => CapabilitySetType::Input,
            Self::Brush { .. } => CapabilitySetType::Brush,
            Self::GlyphCache { .. } => CapabilitySetType::GlyphCache,
            Self::OffscreenBitmapCache { .. } => CapabilitySetType::OffscreenBitmapCache,
            Self::VirtualChannel(_) => CapabilitySetType::VirtualChannel,
            Self::Sound { .. } => CapabilitySetType::Sound,
            Self::MultifragmentUpdate { .. } => CapabilitySetType::MultifragmentUpdate,
            Self::Other { ty, .. } => return *ty,
        };
        ty as u16
    }

    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let mut body = Vec::new();

        match self {
            Self::General(general) => general.encode_body(&mut body),
            Self::Bitmap(bitmap) => bitmap.encode_body(&mut body),
            Self::Order { desktop_save_size } => encode_order_body(&mut body, *desktop_save_size),
            Self::BitmapCache => {
                body.put_bytes(0, 24);
                for (entries, cell_size) in [(0x0258, 0x0100), (0x012C, 0x0400), (0x0106, 0x1000)] {
                    body.put_u16_le(entries);
                    body.put_u16_le(cell_size);
                }
            }
            Self::Pointer(pointer) => pointer.encode_body(&mut body),
            Self::Input(input) => input.encode_body(&mut body),
            Self::Brush { support_level } => body.put_u32_le(*support_level),
            Self::GlyphCache { support_level } => {
                for cell_size in [4, 4, 8, 8, 16, 32, 64, 128, 256] {
                    body.put_u16_le(254);
                    body.put_u16_le(cell_size);
                }
                body.put_u16_le(64);
                body.put_u16_le(2048);
                body.put_u32_le(0x0100_0100); // fragCache
                body.put_u16_le(*support_level);
                body.put_u16_le(0);
            }
            Self::OffscreenBitmapCache {
                support_level,
                cache_size,
                cache_entries,
            } => {
                body.put_u32_le(*support_level);
                body.put_u16_le(*cache_size);
                body.put_u16_le(*cache_entries);
            }
            Self::VirtualChannel(channel) => channel.encode_body(&mut body),
            Self::Sound { beeps } => {
                body.put_u16_le(u16::from(*beeps));
                body.put_u16_le(0);
            }
            Self::MultifragmentUpdate { max_request_size } => body.put_u32_le(*max_request_size),
            Self::Other { data, .. } => body.put_slice(data),
        }

        dst.put_u16_le(self.ty());
        dst.put_u16_le(u16_len(body.len() + CAPABILITY_HEADER_SIZE, "lengthCapability")?);
        dst.put_slice(&body);

        Ok(())
    }

    pub fn decode(src: &mut &[u8]) -> Result<Self> {
        ensure_size!(src[CAPABILITY_HEADER_SIZE] for "TS_CAPS_SET");
        let ty = src.get_u16_le();
        let length = usize::from(src.get_u16_le());
        if length < CAPABILITY_HEADER_SIZE {
            return Err(Error::invalid("TS_CAPS_SET", "lengthCapability", "shorter than the header"));
        }
        let mut body = split_to(src, length - CAPABILITY_HEADER_SIZE, "TS_CAPS_SET body")?;

        let set = match ty {
            t if t == CapabilitySetType::General as u16 => Self::General(General::decode_body(body)?),
            t if t == CapabilitySetType::Bitmap as u16 => Self::Bitmap(Bitmap::decode_body(body)?),
            t if t == CapabilitySetType::Pointer as u16 => Self::Pointer(Pointer::decode_body(body)?),
            t if t == CapabilitySetType::Input as u16 => Self::Input(Input::decode_body(body)?),
            t if t == CapabilitySetType::VirtualChannel as u16 => {
                Self::VirtualChannel(VirtualChannel::decode_body(body)?)
            }
            t if t == CapabilitySetType::MultifragmentUpdate as u16 => {
                ensure_size!(body[4] for "TS_MULTIFRAGMENTUPDATE_CAPABILITYSET");
                Self::MultifragmentUpdate {
                    max_request_size: body.get_u32_le(),
                }
            }
            _ => Self::Other {
                ty,
                data: body.to_vec(),
            },
        };

        Ok(set)
    }
}

fn encode_order_body(dst: &mut Vec<u8>, desktop_save_size: u32) {
    const NEGOTIATE_ORDER_SUPPORT: u16 = 0x0002;
    const ZERO_BOUNDS_DELTA_SUPPORT: u16 = 0x0008;
    const COLOR_INDEX_SUPPORT: u16 = 0x0020;

    dst.put_bytes(0, 16); // terminalDescriptor
    dst.put_u32_le(0);
    dst.put_u16_le(1); // desktopSaveXGranularity
    dst.put_u16_le(20); // desktopSaveYGranularity
    dst.put_u16_le(0);
    dst.put_u16_le(1); // maximumOrderLevel
    dst.put_u16_le(0); // numberFonts
    dst.put_u16_le(NEGOTIATE_ORDER_SUPPORT | ZERO_BOUNDS_DELTA_SUPPORT | COLOR_INDEX_SUPPORT);
    dst.put_bytes(0, 32); // orderSupport
    dst.put_u16_le(0); // textFlags
    dst.put_u16_le(0); // orderSupportExFlags
    dst.put_u32_le(0);
    dst.put_u32_le(desktop_save_size);
    dst.put_u32_le(0);
    dst.put_u16_le(0); // textANSICodePage
    dst.put_u16_le(0);
}

pub fn encode_capability_sets(dst: &mut Vec<u8>, sets: &[CapabilitySet]) -> Result<()> {
    for set in sets {
        set.encode(dst)?;
    }
    Ok(())
}

pub fn decode_capability_sets(src: &mut &[u8], count: u16) -> Result<Vec<CapabilitySet>> {
    (0..count).map(|_| CapabilitySet::decode(src)).collect()
}

/// What the client is willing to do before hearing from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub desktop_width: u16,
    pub desktop_height: u16,
    pub color_depth: u16,
    pub keyboard_layout: u32,
    pub pointer_cache_size: u16,
    pub multifragment_max_size: u32,
    pub fast_path_output: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            desktop_width: 1024,
            desktop_height: 768,
            color_depth: 16,
            keyboard_layout: 0x0409,
            pointer_cache_size: 25,
            multifragment_max_size: 0x0003_F008,
            fast_path_output: true,
        }
    }
}

/// Outcome of the capability exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    pub desktop_width: u16,
    pub desktop_height: u16,
    pub color_depth: u16,
    pub fast_path_output: bool,
    pub salted_checksum: bool,
    pub no_bitmap_compression_header: bool,
    pub multifragment_max_size: u32,
    /// Sets to send in the Confirm Active PDU.
    pub sets: Vec<CapabilitySet>,
}

impl ClientCapabilities {
    /// Down-negotiates against the server's demand: nothing the server did not offer is asserted.
    pub fn negotiate(&self, server: &[CapabilitySet]) -> NegotiatedCapabilities {
        let server_general = server.iter().find_map(|set| match set {
            CapabilitySet::General(general) => Some(*general),
            _ => None,
        });
        let server_bitmap = server.iter().find_map(|set| match set {
            CapabilitySet::Bitmap(bitmap) => Some(*bitmap),
            _ => None,
        });
        let server_pointer = server.iter().find_map(|set| match set {
            CapabilitySet::Pointer(pointer) => Some(*pointer),
            _ => None,
        });
        let server_multifragment = server.iter().find_map(|set| match set {
            CapabilitySet::MultifragmentUpdate { max_request_size } => Some(*max_request_size),
            _ => None,
        });

        let server_extra_flags = server_general.map(|general| general.extra_flags).unwrap_or_default();
        let fast_path_output =
            self.fast_path_output && server_extra_flags.contains(GeneralExtraFlags::FASTPATH_OUTPUT_SUPPORTED);

        let mut extra_flags = GeneralExtraFlags::LONG_CREDENTIALS_SUPPORTED
            | (server_extra_flags & (GeneralExtraFlags::ENC_SALTED_CHECKSUM | GeneralExtraFlags::NO_BITMAP_COMPRESSION_HDR));
        if fast_path_output {
            extra_flags |= GeneralExtraFlags::FASTPATH_OUTPUT_SUPPORTED;
        }

        let (desktop_width, desktop_height) = server_bitmap
            .filter(|bitmap| bitmap.desktop_width != 0 && bitmap.desktop_height != 0)
            .map_or((self.desktop_width, self.desktop_height), |bitmap| {
                (bitmap.desktop_width, bitmap.desktop_height)
            });

        let color_depth = server_bitmap
            .map(|bitmap| bitmap.preferred_bits_per_pixel)
            .filter(|bpp| *bpp != 0)
            .map_or(self.color_depth, |bpp| bpp.min(self.color_depth));

        let pointer_cache_size =
            server_pointer.map_or(self.pointer_cache_size, |pointer| {
                pointer.pointer_cache_size.min(self.pointer_cache_size)
            });

        let multifragment_max_size = server_multifragment.unwrap_or(self.multifragment_max_size);

        let sets = vec![
            CapabilitySet::General(General {
                os_major_type: 1, // OSMAJORTYPE_WINDOWS
                os_minor_type: 3, // OSMINORTYPE_WINDOWS_NT
                extra_flags,
                refresh_rect_support: false,
                suppress_output_support: false,
            }),
            CapabilitySet::Bitmap(Bitmap {
                preferred_bits_per_pixel: color_depth,
                desktop_width,
                desktop_height,
                desktop_resize: false,
                drawing_flags: 0,
            }),
            CapabilitySet::Order {
                desktop_save_size: 480 * 480,
            },
            CapabilitySet::BitmapCache,
            CapabilitySet::Pointer(Pointer {
                color_pointer_cache_size: pointer_cache_size,
                pointer_cache_size,
            }),
            CapabilitySet::Input(Input {
                flags: InputFlags::SCANCODES
                    | InputFlags::MOUSEX
                    | InputFlags::UNICODE
                    | InputFlags::FASTPATH_INPUT
                    | InputFlags::FASTPATH_INPUT2,
                keyboard_layout: self.keyboard_layout,
                keyboard_type: 4, // IBM enhanced (101- or 102-key)
                keyboard_function_keys: 12,
            }),
            CapabilitySet::Brush { support_level: 0 },
            CapabilitySet::GlyphCache { support_level: 0 },
            CapabilitySet::OffscreenBitmapCache {
                support_level: 0,
                cache_size: 0,
                cache_entries: 0,
            },
            CapabilitySet::VirtualChannel(VirtualChannel {
                flags: 0,
                chunk_size: Some(1600),
            }),
            CapabilitySet::Sound { beeps: true },
            CapabilitySet::MultifragmentUpdate {
                max_request_size: multifragment_max_size,
            },
        ];

        NegotiatedCapabilities {
            desktop_width,
            desktop_height,
            color_depth,
            fast_path_output,
            salted_checksum: extra_flags.contains(GeneralExtraFlags::ENC_SALTED_CHECKSUM),
            no_bitmap_compression_header: extra_flags.contains(GeneralExtraFlags::NO_BITMAP_COMPRESSION_HDR),
            multifragment_max_size,
            sets,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;

    fn server_sets(bpp: u16, extra_flags: GeneralExtraFlags) -> Vec<CapabilitySet> {
        vec![
            CapabilitySet::General(General {
                os_major_type: 1,
                os_minor_type: 3,
                extra_flags,
                refresh_rect_support: true,
                suppress_output_support: true,
            }),
            CapabilitySet::Bitmap(Bitmap {
                preferred_bits_per_pixel: bpp,
                desktop_width: 1280,
                desktop_height: 1024,
                desktop_resize: true,
                drawing_flags: 0,
            }),
            CapabilitySet::Pointer(Pointer {
                color_pointer_cache_size: 20,
                pointer_cache_size: 20,
            }),
            CapabilitySet::MultifragmentUpdate {
                max_request_size: 0x1000,
            },
            CapabilitySet::Other {
                ty: CapabilitySetType::Share as u16,
                data: vec![0xEA, 0x03, 0, 0],
            },
        ]
    }

    #[rstest]
    #[case(CapabilitySetType::General, 24)]
    #[case(CapabilitySetType::Bitmap, 28)]
    #[case(CapabilitySetType::Order, 88)]
    #[case(CapabilitySetType::BitmapCache, 40)]
    #[case(CapabilitySetType::Pointer, 10)]
    #[case(CapabilitySetType::Input, 88)]
    #[case(CapabilitySetType::Brush, 8)]
    #[case(CapabilitySetType::GlyphCache, 52)]
    #[case(CapabilitySetType::OffscreenBitmapCache, 12)]
    #[case(CapabilitySetType::VirtualChannel, 12)]
    #[case(CapabilitySetType::Sound, 8)]
    #[case(CapabilitySetType::MultifragmentUpdate, 8)]
    fn confirm_active_set_sizes(#[case] ty: CapabilitySetType, #[case] size: usize) {
        let negotiated = ClientCapabilities::default().negotiate(&[]);
        let set = negotiated.sets.iter().find(|set| set.ty() == ty as u16).unwrap();

        let mut buf = Vec::new();
        set.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), size);
        assert_eq!(usize::from(u16::from_le_bytes([buf[2], buf[3]])), size);
    }

    #[test]
    fn server_sets_decode() {
        let sets = server_sets(24, GeneralExtraFlags::FASTPATH_OUTPUT_SUPPORTED);
        let mut buf = Vec::new();
        encode_capability_sets(&mut buf, &sets).unwrap();

        let decoded = decode_capability_sets(&mut buf.as_slice(), 5).unwrap();
        assert_eq!(decoded, sets);
    }

    #[rstest]
    #[case(8, 8)]
    #[case(16, 16)]
    #[case(32, 16)]
    fn color_depth_is_down_negotiated(#[case] server_bpp: u16, #[case] expected: u16) {
        let negotiated = ClientCapabilities::default().negotiate(&server_sets(server_bpp, GeneralExtraFlags::empty()));
        assert_eq!(negotiated.color_depth, expected);
    }

    #[test]
    fn fast_path_requires_server_support() {
        let client = ClientCapabilities::default();
        assert!(!client.negotiate(&server_sets(16, GeneralExtraFlags::empty())).fast_path_output);
        assert!(
            client
                .negotiate(&server_sets(16, GeneralExtraFlags::FASTPATH_OUTPUT_SUPPORTED))
                .fast_path_output
        );
    }

    #[test]
    fn server_dimensions_and_limits_win() {
        let negotiated = ClientCapabilities::default().negotiate(&server_sets(16, GeneralExtraFlags::empty()));

        assert_eq!((negotiated.desktop_width, negotiated.desktop_height), (1280, 1024));
        assert_eq!(negotiated.multifragment_max_size, 0x1000);
        assert!(negotiated.sets.contains(&CapabilitySet::Pointer(Pointer {
            color_pointer_cache_size: 20,
            pointer_cache_size: 20,
        })));
    }
}
