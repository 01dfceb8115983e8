//! The persistent, bidirectional-stream transport variant (git://, SSH).
//!
//! Generalized over any `AsyncRead + AsyncWrite` so a caller can plug in a
//! TCP socket, a unix pipe to `git-upload-pack`, or an SSH channel without
//! this crate depending on any of those concretely.

use super::ByteTransport;
use crate::error::GitSyncResult;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub struct PersistentTransport<S> {
    reader: PktLineReader<tokio::io::ReadHalf<S>>,
    writer: PktLineWriter<tokio::io::WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PersistentTransport<S> {
    pub fn new(stream: S) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self { reader: PktLineReader::new(r), writer: PktLineWriter::new(w) }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ByteTransport for PersistentTransport<S> {
    async fn read_frame(&mut self) -> GitSyncResult<PktLine> {
        self.reader.read_pkt_line().await
    }

    async fn write_data(&mut self, payload: &[u8]) -> GitSyncResult<()> {
        self.writer.write_data(payload).await
    }

    async fn write_flush(&mut self) -> GitSyncResult<()> {
        self.writer.write_flush().await
    }

    async fn end_phase(&mut self) -> GitSyncResult<()> {
        self.writer.flush().await
    }

    fn is_stateless(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_then_read_through_duplex() {
        let (client, mut server) = duplex(4096);
        let mut transport = PersistentTransport::new(client);
        transport.write_data(b"want deadbeef").await.unwrap();
        transport.write_flush().await.unwrap();
        transport.end_phase().await.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert!(&buf[..n].starts_with(b"0013want deadbeef0000"));
        server.write_all(b"").await.unwrap();
    }
}
