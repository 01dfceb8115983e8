//! Transport adapters: the engine speaks to one of these instead
//! of to a socket or an HTTP client directly.

pub mod http;
pub mod persistent;

use crate::error::GitSyncResult;
use crate::pktline::PktLine;
use async_trait::async_trait;

/// One logical phase of the conversation: a batch of outbound frames
/// followed by a batch of inbound ones. The persistent transport just
/// streams through to the underlying byte stream; the stateless-http
/// transport buffers a phase into one HTTP request/response.
#[async_trait]
pub trait ByteTransport: Send {
    async fn read_frame(&mut self) -> GitSyncResult<PktLine>;

    async fn write_data(&mut self, payload: &[u8]) -> GitSyncResult<()>;

    async fn write_flush(&mut self) -> GitSyncResult<()>;

    /// Signals the end of the current outbound phase. For the persistent
    /// transport this is just a flush of the underlying stream; for
    /// stateless HTTP this is where the buffered request body is actually
    /// sent and the response becomes available to `read_frame`.
    async fn end_phase(&mut self) -> GitSyncResult<()>;

    /// Whether the engine must re-send its entire accumulated want/have
    /// state every round (true for stateless HTTP, false for a persistent
    /// stream which remembers what it already sent).
    fn is_stateless(&self) -> bool;
}
