use core::fmt;

use rdp_proto::update::{BitmapData, BitmapEncoding};
use tokio::sync::mpsc;

use crate::error::RdpError;

/// Receiving side of the session events, handed out with the client.
pub type EventReceiver = mpsc::Receiver<RdpEvent>;

/// What the session reports to its owner, in order.
///
/// `Close` is always the last event; `Error` precedes it when the session ends on a failure.
#[derive(Debug, Clone)]
pub enum RdpEvent {
    /// A fatal error, or an update batch that could not be decoded.
    Error(RdpError),
    Close,
    /// The server acknowledged a client-initiated shutdown.
    Success,
    /// Connection finalization completed; the session accepts input.
    Ready,
    /// The user session is logged on.
    Logon,
    /// One bitmap update batch.
    Update(Vec<UpdateRectangle>),
}

impl RdpEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Close => "close",
            Self::Success => "success",
            Self::Ready => "ready",
            Self::Logon => "logon",
            Self::Update(_) => "update",
        }
    }
}

/// A screen region and the pixels to paint into it.
#[derive(Clone, PartialEq, Eq)]
pub struct UpdateRectangle {
    pub x: u16,
    pub y: u16,
    /// Inclusive bounds of the destination rectangle.
    pub right: u16,
    pub bottom: u16,
    /// Dimensions of the bitmap in `data`, which may be padded past the destination rectangle.
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u16,
    pub encoding: BitmapEncoding,
    pub data: Vec<u8>,
}

impl fmt::Debug for UpdateRectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRectangle")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bits_per_pixel", &self.bits_per_pixel)
            .field("encoding", &self.encoding)
            .field("data_len", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl From<BitmapData> for UpdateRectangle {
    fn from(bitmap: BitmapData) -> Self {
        Self {
            x: bitmap.left,
            y: bitmap.top,
            right: bitmap.right,
            bottom: bitmap.bottom,
            width: bitmap.width,
            height: bitmap.height,
            bits_per_pixel: bitmap.bits_per_pixel,
            encoding: bitmap.encoding,
            data: bitmap.data,
        }
    }
}
