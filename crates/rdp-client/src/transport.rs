//! Transport framing: TPKT and fast-path frame detection on the read side, a serialized writer
//! task on the write side.

use std::io;

use bytes::{Bytes, BytesMut};
use rdp_proto::fast_path::{FastPathFlags, FastPathHeader, MAX_FAST_PATH_LENGTH};
use rdp_proto::tpdu::{self, Action};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::Instrument as _;

use crate::error::{RdpError, RdpResult};
use crate::task::ChildTask;

/// Any bidirectional byte stream. The connection swaps the raw stream for a TLS one mid-sequence,
/// so layers above the transport only ever see this erased form.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> AsyncReadWrite for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

pub type ErasedStream = Box<dyn AsyncReadWrite>;

const MAX_RESERVE_CHUNK_IN_BYTES: usize = 8 * 1024;

/// Bytes the sender task accepts before callers start waiting on it.
pub(crate) const SENDER_CHANNEL_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `TPKT | X.224 DT | ...`, header included.
    SlowPath(Bytes),
    /// Fast-path PDU, header included.
    FastPath(Bytes),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::SlowPath(bytes) | Self::FastPath(bytes) => bytes,
        }
    }
}

/// Splits the inbound byte stream into slow-path and fast-path frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;

    type Error = RdpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(length) = tpdu::frame_length(&src[..]).map_err(RdpError::MalformedFrame)? else {
            return Ok(None);
        };

        let action = Action::from_first_byte(src[0]).map_err(RdpError::MalformedFrame)?;

        let max = match action {
            Action::X224 => self.max_frame_size,
            Action::FastPath => self.max_frame_size.min(MAX_FAST_PATH_LENGTH),
        };

        if length > max {
            return Err(RdpError::MalformedFrame(rdp_proto::Error::Oversized {
                name: "frame",
                size: length,
                max,
            }));
        }

        if src.len() < length {
            // The full frame has not arrived yet.
            let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, length - src.len());
            src.reserve(additional);
            return Ok(None);
        }

        let frame = src.split_to(length).freeze();

        let frame = match action {
            Action::X224 => Frame::SlowPath(frame),
            Action::FastPath => Frame::FastPath(frame),
        };

        Ok(Some(frame))
    }
}

/// A byte stream with a read buffer, used while the connection sequence runs.
pub struct Framed<S> {
    stream: S,
    buf: BytesMut,
    codec: FrameCodec,
}

impl<S> Framed<S> {
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self::new_with_leftover(stream, BytesMut::new(), max_frame_size)
    }

    pub fn new_with_leftover(stream: S, leftover: BytesMut, max_frame_size: usize) -> Self {
        Self {
            stream,
            buf: leftover,
            codec: FrameCodec::new(max_frame_size),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Returns the stream along with bytes read past the last frame.
    pub fn into_inner(self) -> (S, BytesMut) {
        (self.stream, self.buf)
    }

    pub fn max_frame_size(&self) -> usize {
        self.codec.max_frame_size
    }
}

impl<S> Framed<S>
where
    S: AsyncRead + Unpin,
{
    /// Reads the next complete frame.
    ///
    /// Cancel safe: bytes already received stay in the buffer.
    pub async fn read_frame(&mut self) -> RdpResult<Frame> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                trace!(len = frame.as_bytes().len(), fast_path = matches!(frame, Frame::FastPath(_)), "Received frame");
                return Ok(frame);
            }

            self.fill().await?;
        }
    }

    /// Reads a PDU whose length is given by `hint` once enough of its header is buffered.
    pub async fn read_by_hint<F>(&mut self, hint: F) -> RdpResult<Bytes>
    where
        F: Fn(&[u8]) -> rdp_proto::Result<Option<usize>>,
    {
        loop {
            if let Some(length) = hint(&self.buf[..]).map_err(RdpError::MalformedFrame)? {
                if length > self.codec.max_frame_size {
                    return Err(RdpError::MalformedFrame(rdp_proto::Error::Oversized {
                        name: "PDU",
                        size: length,
                        max: self.codec.max_frame_size,
                    }));
                }

                if self.buf.len() >= length {
                    return Ok(self.buf.split_to(length).freeze());
                }
            }

            self.fill().await?;
        }
    }

    pub async fn read_exact(&mut self, length: usize) -> RdpResult<Bytes> {
        self.read_by_hint(|_| Ok(Some(length))).await
    }

    async fn fill(&mut self) -> RdpResult<()> {
        let read = self.stream.read_buf(&mut self.buf).await?;

        if read == 0 {
            if self.buf.is_empty() {
                return Err(RdpError::unexpected_eof());
            }

            return Err(RdpError::ConnectionLost(std::sync::Arc::new(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed in the middle of a frame",
            ))));
        }

        Ok(())
    }
}

impl<S> Framed<S>
where
    S: AsyncWrite + Unpin,
{
    pub async fn write_all(&mut self, data: &[u8]) -> RdpResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Closes the write side; over TLS this sends close_notify.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Wraps a slow-path payload into `TPKT | X.224 DT`.
pub fn encode_slow_path(payload: &[u8]) -> RdpResult<Vec<u8>> {
    let mut frame = Vec::with_capacity(tpdu::TPDU_DATA_LENGTH + payload.len());
    tpdu::encode_x224_data(&mut frame, payload)?;
    Ok(frame)
}

/// Prefixes a fast-path payload with its header.
pub fn encode_fast_path(header: &FastPathHeader, payload: &[u8]) -> RdpResult<Vec<u8>> {
    debug_assert_eq!(header.signature.is_some(), header.flags.contains(FastPathFlags::ENCRYPTED));

    let mut frame = Vec::with_capacity(payload.len() + 11);
    header.encode(&mut frame, payload.len())?;
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Handle to the sender task; every outbound frame goes through it, one at a time.
#[derive(Clone, Debug)]
pub(crate) struct FrameSender(mpsc::Sender<Vec<u8>>);

impl FrameSender {
    pub(crate) async fn send(&self, frame: Vec<u8>) -> RdpResult<()> {
        self.0
            .send(frame)
            .await
            .map_err(|_| RdpError::from(io::Error::new(io::ErrorKind::BrokenPipe, "sender task is gone")))
    }
}

pub(crate) struct SenderTask<W> {
    writer: W,
    frame_rx: mpsc::Receiver<Vec<u8>>,
}

impl<W> SenderTask<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(writer: W) -> (Self, FrameSender) {
        let (frame_tx, frame_rx) = mpsc::channel(SENDER_CHANNEL_SIZE);
        (Self { writer, frame_rx }, FrameSender(frame_tx))
    }

    pub(crate) fn spawn(self) -> ChildTask<io::Result<()>> {
        ChildTask::spawn(self.run().in_current_span())
    }

    #[instrument("sender", skip_all)]
    async fn run(self) -> io::Result<()> {
        let Self {
            mut writer,
            mut frame_rx,
        } = self;

        while let Some(frame) = frame_rx.recv().await {
            trace!(len = frame.len(), "Send frame");
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }

        debug!("Closing sender task...");

        writer.shutdown().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn slow_path_frame(payload_len: usize) -> Vec<u8> {
        encode_slow_path(&vec![0xAA; payload_len]).unwrap()
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = slow_path_frame(20);
        let mut codec = FrameCodec::new(1024);

        let mut buf = BytesMut::from(&frame[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[3..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[10..]);
        buf.extend_from_slice(&[0x00, 0x05]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Frame::SlowPath(Bytes::from(frame)));
        assert_eq!(&buf[..], &[0x00, 0x05]);
    }

    #[test]
    fn fast_path_frames_are_classified() {
        let mut buf = BytesMut::from(&[0x00, 0x05, 0x01, 0x02, 0x03, 0x03, 0x00][..]);
        let mut codec = FrameCodec::new(1024);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::FastPath(Bytes::from_static(&[0x00, 0x05, 0x01, 0x02, 0x03])));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let frame = slow_path_frame(200);
        let mut codec = FrameCodec::new(100);
        let mut buf = BytesMut::from(&frame[..4]);

        assert!(matches!(codec.decode(&mut buf), Err(RdpError::MalformedFrame(_))));
    }

    #[test]
    fn garbage_header_is_malformed() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x10][..]);

        assert!(matches!(codec.decode(&mut buf), Err(RdpError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn truncated_stream_is_connection_lost() {
        let frame = slow_path_frame(50);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&frame[..30]).await.unwrap();
        drop(client);

        let mut framed = Framed::new(server, 1024);
        assert!(matches!(framed.read_frame().await, Err(RdpError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn frames_are_read_in_order() {
        let first = slow_path_frame(10);
        let second = slow_path_frame(300);
        let (mut client, server) = tokio::io::duplex(64);

        let writer = tokio::spawn({
            let mut bytes = first.clone();
            bytes.extend_from_slice(&second);
            async move { client.write_all(&bytes).await.unwrap() }
        });

        let mut framed = Framed::new(server, 1024);
        assert_eq!(framed.read_frame().await.unwrap().as_bytes(), first.as_slice());
        assert_eq!(framed.read_frame().await.unwrap().as_bytes(), second.as_slice());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn sender_task_preserves_frame_boundaries() {
        let (client, mut server) = tokio::io::duplex(16);
        let (task, sender) = SenderTask::new(client);
        let task = task.spawn();

        for i in 0..10u8 {
            sender.send(vec![i; 10]).await.unwrap();
        }
        drop(sender);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        task.join().await.unwrap().unwrap();

        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 10]).collect();
        assert_eq!(received, expected);
    }
}
