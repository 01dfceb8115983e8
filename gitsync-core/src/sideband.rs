//! Side-band demultiplexing.

use crate::capability::SidebandMode;
use crate::error::{GitSyncError, GitSyncResult};
use crate::pktline::{PktLine, PktLineReader};
use crate::transport::ByteTransport;
use async_trait::async_trait;
use tokio::io::AsyncRead;

const BAND_PACK: u8 = 1;
const BAND_PROGRESS: u8 = 2;
const BAND_ERROR: u8 = 3;

/// Anything that can hand back the next pkt-line frame: either a raw
/// `PktLineReader` over a persistent connection, or a transport adapter
/// that has already buffered a phase's response.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> GitSyncResult<PktLine>;
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for PktLineReader<R> {
    async fn next_frame(&mut self) -> GitSyncResult<PktLine> {
        self.read_pkt_line().await
    }
}

#[async_trait]
impl FrameSource for dyn ByteTransport + '_ {
    async fn next_frame(&mut self) -> GitSyncResult<PktLine> {
        self.read_frame().await
    }
}

/// Receives either raw pack bytes (no side-band negotiated) or a
/// side-band-multiplexed stream, forwarding progress text to a caller
/// supplied sink and surfacing band-3 messages as a fatal `RemoteError`.
pub struct SidebandDemux<'a, S: ?Sized> {
    reader: &'a mut S,
    mode: SidebandMode,
}

impl<'a, S: FrameSource + ?Sized> SidebandDemux<'a, S> {
    pub fn new(reader: &'a mut S, mode: SidebandMode) -> Self {
        Self { reader, mode }
    }

    /// Reads one "chunk" of pack data, invoking `on_progress` for any
    /// interleaved progress text. Returns `None` once the stream ends
    /// (flush-pkt on sideband, or EOF when no sideband was negotiated).
    pub async fn next_pack_chunk(
        &mut self,
        on_progress: &mut dyn FnMut(&[u8]),
    ) -> GitSyncResult<Option<Vec<u8>>> {
        match self.mode {
            SidebandMode::None => {
                // no framing at all: the remaining bytes on the connection
                // (up to EOF, or up to whatever the transport tells us is
                // the end of this phase) are all pack data. The caller reads
                // in a loop by handing the underlying reader a fixed-size
                // buffer; the pkt-line layer doesn't apply here, so this
                // variant is effectively a plain passthrough.
                Err(GitSyncError::MalformedFrame(
                    "next_pack_chunk is only valid for side-band/side-band-64k; \
                     read directly off the transport when no side-band was negotiated"
                        .into(),
                ))
            }
            SidebandMode::Band | SidebandMode::Band64k => loop {
                match self.reader.next_frame().await? {
                    PktLine::Flush => return Ok(None),
                    PktLine::Data(data) => {
                        if data.is_empty() {
                            return Err(GitSyncError::MalformedFrame(
                                "side-band frame missing its band tag byte".into(),
                            ));
                        }
                        let (band, payload) = (data[0], &data[1..]);
                        match band {
                            BAND_PACK => return Ok(Some(payload.to_vec())),
                            BAND_PROGRESS => {
                                on_progress(payload);
                                continue;
                            }
                            BAND_ERROR => {
                                let text = String::from_utf8_lossy(payload).into_owned();
                                return Err(GitSyncError::RemoteError(text));
                            }
                            other => {
                                return Err(GitSyncError::MalformedFrame(format!(
                                    "unknown side-band tag `{}`",
                                    other
                                )))
                            }
                        }
                    }
                    other => {
                        return Err(GitSyncError::MalformedFrame(format!(
                            "unexpected {:?} while demultiplexing side-band",
                            other
                        )))
                    }
                }
            },
        }
    }

    /// Drains the rest of the side-band stream into one contiguous buffer
    /// (used by the packfile reader, which wants a single `AsyncRead` of
    /// pack bytes rather than chunk-by-chunk callbacks).
    pub async fn drain_to_vec(
        &mut self,
        on_progress: &mut dyn FnMut(&[u8]),
    ) -> GitSyncResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_pack_chunk(on_progress).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::{encode_data, encode_flush};
    use std::io::Cursor;

    fn wrap(lines: Vec<Vec<u8>>) -> Vec<u8> {
        let mut buf = Vec::new();
        for line in lines {
            buf.extend(encode_data(&line));
        }
        buf.extend(encode_flush());
        buf
    }

    #[tokio::test]
    async fn demultiplexes_pack_and_progress() {
        let mut pack_frame = vec![BAND_PACK];
        pack_frame.extend_from_slice(b"PACK...");
        let mut progress_frame = vec![BAND_PROGRESS];
        progress_frame.extend_from_slice(b"Counting objects: 3\n");
        let buf = wrap(vec![progress_frame, pack_frame]);

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let mut demux = SidebandDemux::new(&mut reader, SidebandMode::Band64k);
        let mut seen_progress = Vec::new();
        let data = demux
            .drain_to_vec(&mut |p| seen_progress.push(p.to_vec()))
            .await
            .unwrap();
        assert_eq!(data, b"PACK...".to_vec());
        assert_eq!(seen_progress.len(), 1);
    }

    #[tokio::test]
    async fn band_three_aborts_with_remote_error() {
        let mut error_frame = vec![BAND_ERROR];
        error_frame.extend_from_slice(b"fatal: repository not found");
        let buf = wrap(vec![error_frame]);

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let mut demux = SidebandDemux::new(&mut reader, SidebandMode::Band64k);
        let err = demux.drain_to_vec(&mut |_| {}).await.unwrap_err();
        assert!(matches!(err, GitSyncError::RemoteError(_)));
    }
}
