//! pkt-line framing.
//!
//! Frame = 4 ASCII hex digits giving the total frame length (including the 4
//! length bytes) followed by payload. `0000` is flush, `0001` is delim,
//! `0002` is response-end (protocol v2 only, recognized here for
//! completeness even though this crate only speaks v1).

use crate::error::{GitSyncError, GitSyncResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The smallest a data frame's 4-byte length header may declare (the header
/// itself counts towards the length).
const MIN_DATA_LEN: usize = 4;
/// side-band-64k raises the cap from 1000 to this; plain side-band/no
/// side-band still only ever see frames this size or smaller in practice,
/// so the codec itself uses the larger bound and lets callers enforce a
/// tighter one if they negotiated plain `side-band`.
const MAX_DATA_LEN: usize = 65520;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Data(Vec<u8>),
    Flush,
    Delim,
    ResponseEnd,
}

impl PktLine {
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }
}

fn decode_length(hex: &[u8; 4]) -> GitSyncResult<usize> {
    let s = std::str::from_utf8(hex)
        .map_err(|_| GitSyncError::MalformedFrame("non-utf8 length prefix".into()))?;
    usize::from_str_radix(s, 16)
        .map_err(|_| GitSyncError::MalformedFrame(format!("non-hex length prefix `{}`", s)))
}

/// Reads pkt-lines off any `AsyncRead`.
pub struct PktLineReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> PktLineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Reads and decodes the next pkt-line.
    pub async fn read_pkt_line(&mut self) -> GitSyncResult<PktLine> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let len = decode_length(&len_buf)?;
        match len {
            0 => Ok(PktLine::Flush),
            1 => Ok(PktLine::Delim),
            2 => Ok(PktLine::ResponseEnd),
            3 => Err(GitSyncError::MalformedFrame(
                "length `0003` is reserved and unused".into(),
            )),
            n if n < MIN_DATA_LEN => Err(GitSyncError::MalformedFrame(format!(
                "data frame length `{}` is shorter than the 4-byte header",
                n
            ))),
            n if n - 4 > MAX_DATA_LEN => Err(GitSyncError::MalformedFrame(format!(
                "data frame length `{}` exceeds the maximum payload of {} bytes",
                n, MAX_DATA_LEN
            ))),
            n => {
                let mut payload = vec![0u8; n - 4];
                self.inner.read_exact(&mut payload).await?;
                Ok(PktLine::Data(payload))
            }
        }
    }

    /// Reads pkt-lines until the next flush-pkt, returning the data frames
    /// collected (the flush itself is consumed, not returned).
    pub async fn read_until_flush(&mut self) -> GitSyncResult<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        loop {
            match self.read_pkt_line().await? {
                PktLine::Flush => return Ok(lines),
                PktLine::Data(d) => lines.push(d),
                other => {
                    return Err(GitSyncError::MalformedFrame(format!(
                        "unexpected {:?} while reading a v1 section",
                        other
                    )))
                }
            }
        }
    }
}

/// Writes pkt-lines to any `AsyncWrite`.
pub struct PktLineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PktLineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Writes a single data frame. Splitting payloads larger than the
    /// negotiated max frame size is the caller's responsibility.
    pub async fn write_data(&mut self, payload: &[u8]) -> GitSyncResult<()> {
        if payload.len() > MAX_DATA_LEN {
            return Err(GitSyncError::MalformedFrame(format!(
                "refusing to write a {}-byte frame, above the {}-byte limit",
                payload.len(),
                MAX_DATA_LEN
            )));
        }
        let len = format!("{:04x}", payload.len() + 4);
        self.inner.write_all(len.as_bytes()).await?;
        self.inner.write_all(payload).await?;
        Ok(())
    }

    /// Convenience for the many `"<verb> <args>\n"` text lines the protocol
    /// sends (`want`, `have`, `done`, …).
    pub async fn write_text(&mut self, line: &str) -> GitSyncResult<()> {
        self.write_data(line.as_bytes()).await
    }

    pub async fn write_flush(&mut self) -> GitSyncResult<()> {
        self.inner.write_all(b"0000").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_delim(&mut self) -> GitSyncResult<()> {
        self.inner.write_all(b"0001").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> GitSyncResult<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// Encodes a single data frame into a freestanding buffer (used by tests and
/// by the property-based round-trip check below).
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{:04x}", payload.len() + 4).into_bytes();
    out.extend_from_slice(payload);
    out
}

pub fn encode_flush() -> Vec<u8> {
    b"0000".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_data_frame() {
        let bytes = encode_data(b"want deadbeef\n");
        let mut reader = PktLineReader::new(Cursor::new(bytes));
        let line = reader.read_pkt_line().await.unwrap();
        assert_eq!(line, PktLine::Data(b"want deadbeef\n".to_vec()));
    }

    #[tokio::test]
    async fn round_trips_flush() {
        let mut reader = PktLineReader::new(Cursor::new(encode_flush()));
        assert_eq!(reader.read_pkt_line().await.unwrap(), PktLine::Flush);
    }

    #[tokio::test]
    async fn rejects_non_hex_length() {
        let mut reader = PktLineReader::new(Cursor::new(b"zzzz".to_vec()));
        assert!(reader.read_pkt_line().await.is_err());
    }

    #[tokio::test]
    async fn rejects_truncated_payload() {
        let mut reader = PktLineReader::new(Cursor::new(b"0010ab".to_vec()));
        assert!(reader.read_pkt_line().await.is_err());
    }

    #[tokio::test]
    async fn read_until_flush_collects_lines() {
        let mut buf = encode_data(b"one");
        buf.extend(encode_data(b"two"));
        buf.extend(encode_flush());
        let mut reader = PktLineReader::new(Cursor::new(buf));
        let lines = reader.read_until_flush().await.unwrap();
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_text("want deadbeef").await.unwrap();
            writer.write_flush().await.unwrap();
        }
        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert_eq!(
            reader.read_pkt_line().await.unwrap(),
            PktLine::Data(b"want deadbeef".to_vec())
        );
        assert_eq!(reader.read_pkt_line().await.unwrap(), PktLine::Flush);
    }

    #[quickcheck_macros::quickcheck]
    fn prop_data_round_trip(bytes: Vec<u8>) -> bool {
        if bytes.len() > MAX_DATA_LEN {
            return true;
        }
        let encoded = encode_data(&bytes);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut reader = PktLineReader::new(Cursor::new(encoded));
            matches!(reader.read_pkt_line().await, Ok(PktLine::Data(d)) if d == bytes)
        })
    }
}
