use std::io::ErrorKind;

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use rdp_proto::mcs::DomainPdu;
use rdp_proto::tpdu;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::Halt;

pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub(crate) type ErasedStream = Box<dyn AsyncReadWrite>;

type LengthHint = fn(&[u8]) -> rdp_proto::Result<Option<usize>>;

/// Server end of the wire: whole frames in, raw bytes out.
pub(crate) struct ServerFramed {
    stream: ErasedStream,
    buf: BytesMut,
}

impl ServerFramed {
    pub(crate) fn new(stream: ErasedStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub(crate) fn into_inner(self) -> anyhow::Result<ErasedStream> {
        anyhow::ensure!(self.buf.is_empty(), "client sent data before the TLS handshake");
        Ok(self.stream)
    }

    pub(crate) async fn read_by_hint(&mut self, hint: LengthHint) -> anyhow::Result<Bytes> {
        loop {
            if let Some(length) = hint(&self.buf).context("bad frame header")? {
                if self.buf.len() >= length {
                    return Ok(self.buf.split_to(length).freeze());
                }
            }

            self.buf.reserve(4096);
            let read = self.stream.read_buf(&mut self.buf).await.context("read")?;
            if read == 0 {
                return Err(Halt::ClientGone.into());
            }
        }
    }

    /// Reads a TPKT or fast-path frame.
    pub(crate) async fn read_frame(&mut self) -> anyhow::Result<Bytes> {
        self.read_by_hint(tpdu::frame_length).await
    }

    pub(crate) async fn read_exact(&mut self, length: usize) -> anyhow::Result<Bytes> {
        while self.buf.len() < length {
            let read = self.stream.read_buf(&mut self.buf).await.context("read")?;
            if read == 0 {
                return Err(Halt::ClientGone.into());
            }
        }

        Ok(self.buf.split_to(length).freeze())
    }

    /// Reads the MCS PDU carried by the next slow-path frame.
    pub(crate) async fn read_mcs(&mut self) -> anyhow::Result<Vec<u8>> {
        let frame = self.read_frame().await?;
        anyhow::ensure!(
            frame.first() == Some(&tpdu::TPKT_VERSION),
            "expected a slow-path frame during connection setup"
        );
        Ok(tpdu::decode_x224_data(&frame)?.to_vec())
    }

    /// A client that already hung up halts the script instead of failing it.
    pub(crate) async fn write_all(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let written = match self.stream.write_all(data).await {
            Ok(()) => self.stream.flush().await,
            Err(error) => Err(error),
        };

        match written {
            Ok(()) => Ok(()),
            Err(error) if matches!(error.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                Err(Halt::ClientGone.into())
            }
            Err(error) => Err(anyhow::Error::new(error).context("write")),
        }
    }

    pub(crate) async fn write_slow_path(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + tpdu::TPDU_DATA_LENGTH);
        tpdu::encode_x224_data(&mut frame, payload)?;
        self.write_all(&frame).await
    }

    pub(crate) async fn write_domain_pdu(&mut self, pdu: &DomainPdu<'_>) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        pdu.encode(&mut payload)?;
        self.write_slow_path(&payload).await
    }

    pub(crate) async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.stream.shutdown().await.context("shutdown")
    }
}
