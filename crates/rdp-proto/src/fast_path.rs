//! Fast-path output (server updates) and fast-path input (client events).

use bitflags::bitflags;
use bytes::{Buf as _, BufMut as _};

use crate::encryption::MAC_SIGNATURE_SIZE;
use crate::update::{BitmapUpdate, PointerKind, PointerUpdate};
use crate::utils::{read_array, split_to, u16_len};
use crate::{Error, Result};

/// 15-bit length field.
pub const MAX_FAST_PATH_LENGTH: usize = 0x7FFF;
const FASTPATH_OUTPUT_COMPRESSION_USED: u8 = 0x2;
const MAX_HEADER_EVENTS: usize = 15;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FastPathFlags: u8 {
        const SECURE_CHECKSUM = 0x1;
        const ENCRYPTED = 0x2;
    }
}

/// fpOutputHeader / fpInputHeader with its length and optional MAC signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastPathHeader {
    pub flags: FastPathFlags,
    /// Bits 2-5 of the first byte: event count for input, reserved for output.
    pub num_events: u8,
    pub signature: Option<[u8; MAC_SIGNATURE_SIZE]>,
}

impl FastPathHeader {
    pub const NAME: &'static str = "fast-path header";

    /// Splits a full fast-path frame into its header and payload.
    pub fn decode(mut frame: &[u8]) -> Result<(Self, &[u8])> {
        ensure_size!(frame[2] for Self::NAME);
        let first = frame.get_u8();
        if first & 0x03 != 0 {
            return Err(Error::invalid(Self::NAME, "action", "not a fast-path PDU"));
        }

        let flags = FastPathFlags::from_bits_truncate(first >> 6);
        let num_events = (first >> 2) & 0x0F;

        let b1 = frame.get_u8();
        let (length, header_size) = if b1 & 0x80 != 0 {
            ensure_size!(frame[1] for Self::NAME);
            ((usize::from(b1 & 0x7F) << 8) | usize::from(frame.get_u8()), 3)
        } else {
            (usize::from(b1), 2)
        };

        let mut payload = split_to(
            &mut frame,
            length
                .checked_sub(header_size)
                .ok_or_else(|| Error::invalid(Self::NAME, "length", "shorter than the header"))?,
            Self::NAME,
        )?;

        let signature = if flags.contains(FastPathFlags::ENCRYPTED) {
            Some(read_array(&mut payload, "fast-path dataSignature")?)
        } else {
            None
        };

        Ok((
            Self {
                flags,
                num_events,
                signature,
            },
            payload,
        ))
    }

    /// Writes the header so that the frame carries exactly `payload_len` bytes after it.
    pub fn encode(&self, dst: &mut Vec<u8>, payload_len: usize) -> Result<()> {
        let signature_len = self.signature.map_or(0, |signature| signature.len());
        let short_length = payload_len + signature_len + 2;

        dst.put_u8((self.flags.bits() << 6) | ((self.num_events & 0x0F) << 2));

        if short_length < 0x80 {
            dst.put_u8(short_length as u8);
        } else {
            let length = short_length + 1;
            if length > MAX_FAST_PATH_LENGTH {
                return Err(Error::Oversized {
                    name: Self::NAME,
                    size: length,
                    max: MAX_FAST_PATH_LENGTH,
                });
            }
            dst.put_u16(0x8000 | u16_len(length, Self::NAME)?);
        }

        if let Some(signature) = &self.signature {
            dst.put_slice(signature);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateCode {
    Orders = 0x0,
    Bitmap = 0x1,
    Palette = 0x2,
    Synchronize = 0x3,
    SurfaceCommands = 0x4,
    HiddenPointer = 0x5,
    DefaultPointer = 0x6,
    PositionPointer = 0x8,
    ColorPointer = 0x9,
    CachedPointer = 0xA,
    NewPointer = 0xB,
    LargePointer = 0xC,
}

impl TryFrom<u8> for UpdateCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Orders),
            0x1 => Ok(Self::Bitmap),
            0x2 => Ok(Self::Palette),
            0x3 => Ok(Self::Synchronize),
            0x4 => Ok(Self::SurfaceCommands),
            0x5 => Ok(Self::HiddenPointer),
            0x6 => Ok(Self::DefaultPointer),
            0x8 => Ok(Self::PositionPointer),
            0x9 => Ok(Self::ColorPointer),
            0xA => Ok(Self::CachedPointer),
            0xB => Ok(Self::NewPointer),
            0xC => Ok(Self::LargePointer),
            _ => Err(Error::UnexpectedMessage {
                name: "fast-path updateCode",
                got: u32::from(value),
            }),
        }
    }
}

impl UpdateCode {
    fn pointer_kind(self) -> Option<PointerKind> {
        match self {
            Self::HiddenPointer => Some(PointerKind::Hidden),
            Self::DefaultPointer => Some(PointerKind::Default),
            Self::PositionPointer => Some(PointerKind::Position),
            Self::ColorPointer => Some(PointerKind::Color),
            Self::CachedPointer => Some(PointerKind::Cached),
            Self::NewPointer => Some(PointerKind::New),
            Self::LargePointer => Some(PointerKind::Large),
            _ => None,
        }
    }

    pub fn for_pointer(kind: PointerKind) -> Self {
        match kind {
            PointerKind::Hidden => Self::HiddenPointer,
            PointerKind::Default => Self::DefaultPointer,
            PointerKind::Position => Self::PositionPointer,
            PointerKind::Color => Self::ColorPointer,
            PointerKind::New => Self::NewPointer,
            PointerKind::Cached => Self::CachedPointer,
            PointerKind::Large => Self::LargePointer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fragmentation {
    Single = 0x0,
    Last = 0x1,
    First = 0x2,
    Next = 0x3,
}

impl Fragmentation {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0x0 => Self::Single,
            0x1 => Self::Last,
            0x2 => Self::First,
            _ => Self::Next,
        }
    }
}

/// One TS_FP_UPDATE, possibly a fragment of a larger update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFragment<'a> {
    /// Raw update code; unknown codes are reported when the update is decoded.
    pub code: u8,
    pub fragmentation: Fragmentation,
    pub data: &'a [u8],
}

impl UpdateFragment<'_> {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u8((self.code & 0x0F) | ((self.fragmentation as u8) << 4));
        dst.put_u16_le(u16_len(self.data.len(), "TS_FP_UPDATE size")?);
        dst.put_slice(self.data);
        Ok(())
    }
}

/// Splits the decrypted payload of a fast-path output PDU into its updates.
pub fn decode_update_fragments(mut src: &[u8]) -> Result<Vec<UpdateFragment<'_>>> {
    let mut fragments = Vec::new();

    while !src.is_empty() {
        ensure_size!(src[1] for "TS_FP_UPDATE");
        let header = src.get_u8();
        let code = header & 0x0F;
        let fragmentation = Fragmentation::from_bits(header >> 4);
        let compression = header >> 6;

        if compression == FASTPATH_OUTPUT_COMPRESSION_USED {
            ensure_size!(src[1] for "TS_FP_UPDATE compressionFlags");
            let compression_flags = src.get_u8();
            if compression_flags & 0x20 != 0 {
                return Err(Error::invalid(
                    "TS_FP_UPDATE",
                    "compressionFlags",
                    "bulk compression was not negotiated",
                ));
            }
        }

        ensure_size!(src[2] for "TS_FP_UPDATE size");
        let size = usize::from(src.get_u16_le());
        let data = split_to(&mut src, size, "TS_FP_UPDATE updateData")?;

        fragments.push(UpdateFragment {
            code,
            fragmentation,
            data,
        });
    }

    Ok(fragments)
}

/// Reassembles first/next/last fragments into complete update payloads.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Option<(u8, Vec<u8>)>,
    max_size: usize,
}

impl Reassembler {
    pub fn new(max_size: usize) -> Self {
        Self { pending: None, max_size }
    }

    /// Returns the complete update once its last fragment has been seen.
    pub fn push(&mut self, fragment: &UpdateFragment<'_>) -> Result<Option<(u8, Vec<u8>)>> {
        match fragment.fragmentation {
            Fragmentation::Single => {
                if self.pending.take().is_some() {
                    return Err(Error::invalid("TS_FP_UPDATE", "fragmentation", "unterminated fragmented update"));
                }
                Ok(Some((fragment.code, fragment.data.to_vec())))
            }
            Fragmentation::First => {
                if self.pending.is_some() {
                    self.pending = None;
                    return Err(Error::invalid("TS_FP_UPDATE", "fragmentation", "unterminated fragmented update"));
                }
                self.pending = Some((fragment.code, fragment.data.to_vec()));
                Ok(None)
            }
            Fragmentation::Next | Fragmentation::Last => {
                let Some((code, mut data)) = self.pending.take() else {
                    return Err(Error::invalid("TS_FP_UPDATE", "fragmentation", "fragment without a first part"));
                };
                if code != fragment.code {
                    return Err(Error::invalid("TS_FP_UPDATE", "updateCode", "fragment code changed"));
                }

                data.extend_from_slice(fragment.data);
                if self.max_size != 0 && data.len() > self.max_size {
                    return Err(Error::Oversized {
                        name: "reassembled fast-path update",
                        size: data.len(),
                        max: self.max_size,
                    });
                }

                if fragment.fragmentation == Fragmentation::Last {
                    Ok(Some((code, data)))
                } else {
                    self.pending = Some((code, data));
                    Ok(None)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastPathUpdate {
    Orders,
    Bitmap(BitmapUpdate),
    Palette,
    Synchronize,
    SurfaceCommands,
    Pointer(PointerUpdate),
}

impl FastPathUpdate {
    pub fn decode(code: u8, data: &[u8]) -> Result<Self> {
        let code = UpdateCode::try_from(code)?;

        if let Some(kind) = code.pointer_kind() {
            return PointerUpdate::decode_body(kind, data).map(Self::Pointer);
        }

        match code {
            UpdateCode::Orders => Ok(Self::Orders),
            UpdateCode::Bitmap => BitmapUpdate::decode(data).map(Self::Bitmap),
            UpdateCode::Palette => Ok(Self::Palette),
            UpdateCode::Synchronize => Ok(Self::Synchronize),
            _ => Ok(Self::SurfaceCommands),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyboardFlags: u8 {
        const RELEASE = 0x01;
        const EXTENDED = 0x02;
        const EXTENDED1 = 0x04;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncToggleFlags: u8 {
        const SCROLL_LOCK = 0x01;
        const NUM_LOCK = 0x02;
        const CAPS_LOCK = 0x04;
        const KANA_LOCK = 0x08;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PointerFlags: u16 {
        const WHEEL_NEGATIVE = 0x0100;
        const WHEEL = 0x0200;
        const MOVE = 0x0800;
        const DOWN = 0x8000;
        const BUTTON1 = 0x1000;
        const BUTTON2 = 0x2000;
        const BUTTON3 = 0x4000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathInputEvent {
    Scancode { flags: KeyboardFlags, code: u8 },
    Mouse { flags: PointerFlags, x: u16, y: u16 },
    /// Extended buttons (XBUTTON1/2).
    MouseX { flags: u16, x: u16, y: u16 },
    Synchronize(SyncToggleFlags),
    Unicode { release: bool, code: u16 },
}

impl FastPathInputEvent {
    fn encode(&self, dst: &mut Vec<u8>) {
        const SCANCODE: u8 = 0x0;
        const MOUSE: u8 = 0x1;
        const MOUSEX: u8 = 0x2;
        const SYNC: u8 = 0x3;
        const UNICODE: u8 = 0x4;

        match *self {
            Self::Scancode { flags, code } => {
                dst.put_u8((SCANCODE << 5) | flags.bits());
                dst.put_u8(code);
            }
            Self::Mouse { flags, x, y } => {
                dst.put_u8(MOUSE << 5);
                dst.put_u16_le(flags.bits());
                dst.put_u16_le(x);
                dst.put_u16_le(y);
            }
            Self::MouseX { flags, x, y } => {
                dst.put_u8(MOUSEX << 5);
                dst.put_u16_le(flags);
                dst.put_u16_le(x);
                dst.put_u16_le(y);
            }
            Self::Synchronize(flags) => dst.put_u8((SYNC << 5) | flags.bits()),
            Self::Unicode { release, code } => {
                dst.put_u8((UNICODE << 5) | u8::from(release));
                dst.put_u16_le(code);
            }
        }
    }

    fn decode(src: &mut &[u8]) -> Result<Self> {
        ensure_size!(src[1] for "TS_FP_INPUT_EVENT");
        let header = src.get_u8();
        let flags = header & 0x1F;

        let event = match header >> 5 {
            0x0 => {
                ensure_size!(src[1] for "TS_FP_KEYBOARD_EVENT");
                Self::Scancode {
                    flags: KeyboardFlags::from_bits_truncate(flags),
                    code: src.get_u8(),
                }
            }
            0x1 => {
                ensure_size!(src[6] for "TS_FP_POINTER_EVENT");
                Self::Mouse {
                    flags: PointerFlags::from_bits_retain(src.get_u16_le()),
                    x: src.get_u16_le(),
                    y: src.get_u16_le(),
                }
            }
            0x2 => {
                ensure_size!(src[6] for "TS_FP_POINTERX_EVENT");
                Self::MouseX {
                    flags: src.get_u16_le(),
                    x: src.get_u16_le(),
                    y: src.get_u16_le(),
                }
            }
            0x3 => Self::Synchronize(SyncToggleFlags::from_bits_truncate(flags)),
            0x4 => {
                ensure_size!(src[2] for "TS_FP_UNICODE_KEYBOARD_EVENT");
                Self::Unicode {
                    release: flags & 0x1 != 0,
                    code: src.get_u16_le(),
                }
            }
            other => {
                return Err(Error::UnexpectedMessage {
                    name: "fast-path eventCode",
                    got: u32::from(other),
                });
            }
        };

        Ok(event)
    }
}

/// Encodes the input events; the returned count goes into the header when it fits there.
pub fn encode_input_events(dst: &mut Vec<u8>, events: &[FastPathInputEvent]) -> Result<u8> {
    let header_events = if events.len() <= MAX_HEADER_EVENTS {
        events.len() as u8
    } else {
        dst.put_u8(crate::utils::u8_len(events.len(), "fast-path numEvents")?);
        0
    };

    for event in events {
        event.encode(dst);
    }

    Ok(header_events)
}

pub fn decode_input_events(mut src: &[u8], header_events: u8) -> Result<Vec<FastPathInputEvent>> {
    let count = if header_events == 0 {
        ensure_size!(src[1] for "fast-path numEvents");
        src.get_u8()
    } else {
        header_events
    };

    (0..count).map(|_| FastPathInputEvent::decode(&mut src)).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use rstest::rstest;

    use super::*;
    use crate::tpdu::frame_length;

    #[rstest]
    #[case(10)]
    #[case(0x7D)]
    #[case(0x7E)]
    #[case(500)]
    fn header_length_covers_the_frame(#[case] payload_len: usize) {
        let header = FastPathHeader {
            flags: FastPathFlags::empty(),
            num_events: 0,
            signature: None,
        };
        let mut frame = Vec::new();
        header.encode(&mut frame, payload_len).unwrap();
        frame.extend(core::iter::repeat_n(0xCC, payload_len));

        assert_eq!(frame_length(&frame).unwrap(), Some(frame.len()));
        let (decoded, payload) = FastPathHeader::decode(&frame).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload.len(), payload_len);
    }

    #[test]
    fn encrypted_header_splits_signature() {
        let header = FastPathHeader {
            flags: FastPathFlags::ENCRYPTED,
            num_events: 0,
            signature: Some([9; 8]),
        };
        let mut frame = Vec::new();
        header.encode(&mut frame, 3).unwrap();
        frame.extend_from_slice(&[1, 2, 3]);

        assert_eq!(frame[0], 0x80);
        let (decoded, payload) = FastPathHeader::decode(&frame).unwrap();
        assert_eq!(decoded.signature, Some([9; 8]));
        assert_eq!(payload, [1, 2, 3]);
    }

    #[test]
    fn fragments_are_reassembled() {
        let mut payload = Vec::new();
        for (fragmentation, data) in [
            (Fragmentation::First, &b"ab"[..]),
            (Fragmentation::Next, &b"cd"[..]),
            (Fragmentation::Last, &b"ef"[..]),
        ] {
            UpdateFragment {
                code: UpdateCode::Bitmap as u8,
                fragmentation,
                data,
            }
            .encode(&mut payload)
            .unwrap();
        }

        let mut reassembler = Reassembler::new(0);
        let mut complete = Vec::new();
        for fragment in decode_update_fragments(&payload).unwrap() {
            if let Some(update) = reassembler.push(&fragment).unwrap() {
                complete.push(update);
            }
        }

        assert_eq!(complete, vec![(UpdateCode::Bitmap as u8, b"abcdef".to_vec())]);
    }

    #[test]
    fn orphan_fragment_is_an_error() {
        let fragment = UpdateFragment {
            code: 1,
            fragmentation: Fragmentation::Last,
            data: b"x",
        };
        assert!(Reassembler::new(0).push(&fragment).is_err());
    }

    #[test]
    fn reassembly_limit() {
        let mut reassembler = Reassembler::new(3);
        let first = UpdateFragment {
            code: 1,
            fragmentation: Fragmentation::First,
            data: b"ab",
        };
        let last = UpdateFragment {
            code: 1,
            fragmentation: Fragmentation::Last,
            data: b"cd",
        };
        reassembler.push(&first).unwrap();
        assert!(matches!(reassembler.push(&last), Err(Error::Oversized { .. })));
    }

    #[test]
    fn pointer_position_update() {
        let update = FastPathUpdate::decode(UpdateCode::PositionPointer as u8, &[5, 0, 6, 0]).unwrap();
        assert_eq!(update, FastPathUpdate::Pointer(PointerUpdate::Position { x: 5, y: 6 }));
    }

    #[test]
    fn scancode_event_bytes() {
        let mut buf = Vec::new();
        let count = encode_input_events(
            &mut buf,
            &[FastPathInputEvent::Scancode {
                flags: KeyboardFlags::RELEASE,
                code: 0x1E,
            }],
        )
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(buf, [0x01, 0x1E]);
    }

    #[test]
    fn many_events_move_the_count_out_of_the_header() {
        let events = vec![FastPathInputEvent::Synchronize(SyncToggleFlags::NUM_LOCK); 20];
        let mut buf = Vec::new();
        let count = encode_input_events(&mut buf, &events).unwrap();

        assert_eq!(count, 0);
        assert_eq!(buf[0], 20);
        assert_eq!(decode_input_events(&buf, count).unwrap(), events);
    }
}
