//! The stateless-HTTP transport variant.
//!
//! Persistent transports stream frames through as they're produced; a
//! dumb-pipe HTTP exchange cannot, so this adapter buffers each phase's
//! outbound frames into one request body and only gets an inbound stream
//! back once that request completes. The caller supplies the actual HTTP
//! plumbing through [`HttpExchange`] — this crate has no opinion on which
//! HTTP client library sits underneath it.

use super::ByteTransport;
use crate::error::{GitSyncError, GitSyncResult};
use crate::pktline::{PktLine, PktLineReader};
use async_trait::async_trait;
use std::io::Cursor;

/// Content types for the four request/response bodies a v1 stateless-HTTP
/// exchange ever produces.
pub mod content_type {
    pub const UPLOAD_PACK_ADVERTISEMENT: &str = "application/x-git-upload-pack-advertisement";
    pub const UPLOAD_PACK_REQUEST: &str = "application/x-git-upload-pack-request";
    pub const UPLOAD_PACK_RESULT: &str = "application/x-git-upload-pack-result";
    pub const RECEIVE_PACK_ADVERTISEMENT: &str = "application/x-git-receive-pack-advertisement";
    pub const RECEIVE_PACK_REQUEST: &str = "application/x-git-receive-pack-request";
    pub const RECEIVE_PACK_RESULT: &str = "application/x-git-receive-pack-result";
}

/// The narrow HTTP capability this crate needs: fetch the service's initial
/// `info/refs?service=...` advertisement, and POST one request body to the
/// service endpoint, getting the response body back. A caller backs this
/// with whatever HTTP client it already uses (reqwest, hyper, ureq, ...).
#[async_trait]
pub trait HttpExchange: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// GET `<url>/info/refs?service=<service>`, returning the raw response
    /// body (still pkt-line framed, including the `# service=...` header
    /// line git prepends ahead of the real advertisement).
    async fn get_advertisement(&mut self, service: &str) -> Result<Vec<u8>, Self::Error>;

    /// POST `body` to `<url>/<service>` with the given content type,
    /// returning the raw response body.
    async fn post(&mut self, service: &str, content_type: &str, body: Vec<u8>) -> Result<Vec<u8>, Self::Error>;
}

enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    fn request_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => content_type::UPLOAD_PACK_REQUEST,
            Self::ReceivePack => content_type::RECEIVE_PACK_REQUEST,
        }
    }
}

/// Buffers one phase of outbound frames, then exchanges them for an inbound
/// frame stream via [`HttpExchange`] on `end_phase`.
pub struct HttpTransport<X: HttpExchange> {
    exchange: X,
    service: Service,
    outbound: Vec<u8>,
    inbound: Option<PktLineReader<Cursor<Vec<u8>>>>,
}

impl<X: HttpExchange> HttpTransport<X> {
    fn new(exchange: X, service: Service) -> Self {
        Self { exchange, service, outbound: Vec::new(), inbound: None }
    }

    pub fn for_upload_pack(exchange: X) -> Self {
        Self::new(exchange, Service::UploadPack)
    }

    pub fn for_receive_pack(exchange: X) -> Self {
        Self::new(exchange, Service::ReceivePack)
    }

    /// Fetches the initial advertisement. Unlike the persistent transports,
    /// this has to happen over a separate GET before any `ByteTransport`
    /// phase begins, so it is a method on the concrete type rather than part
    /// of the trait.
    pub async fn fetch_advertisement(&mut self) -> GitSyncResult<PktLineReader<Cursor<Vec<u8>>>> {
        let body = self
            .exchange
            .get_advertisement(self.service.name())
            .await
            .map_err(GitSyncError::store)?;
        let body = strip_service_header(&body, self.service.name()).await?;
        Ok(PktLineReader::new(Cursor::new(body)))
    }
}

/// `info/refs` responses for the smart protocol begin with a pkt-line
/// `# service=git-<service>\n` line followed by a flush, ahead of the real
/// advertisement; this strips that framing off.
async fn strip_service_header(body: &[u8], service: &str) -> GitSyncResult<Vec<u8>> {
    let expected = format!("# service=git-{}\n", service);
    let mut reader = PktLineReader::new(Cursor::new(body.to_vec()));
    let first = reader.read_pkt_line().await?;
    match first {
        PktLine::Data(d) if d == expected.as_bytes() => {
            let flush = reader.read_pkt_line().await?;
            if !flush.is_flush() {
                return Err(GitSyncError::MalformedAdvertisement(
                    "expected a flush-pkt after the `# service=` header".into(),
                ));
            }
            Ok(reader.into_inner().into_inner())
        }
        // some servers (and all v1 dumb-http fallbacks we still accept)
        // omit the header entirely; rewind to the start in that case.
        _ => Ok(body.to_vec()),
    }
}

#[async_trait]
impl<X: HttpExchange> ByteTransport for HttpTransport<X> {
    async fn read_frame(&mut self) -> GitSyncResult<PktLine> {
        let reader = self.inbound.as_mut().ok_or_else(|| {
            GitSyncError::MalformedFrame(
                "read attempted before the buffered request was sent (end_phase not called)"
                    .into(),
            )
        })?;
        reader.read_pkt_line().await
    }

    async fn write_data(&mut self, payload: &[u8]) -> GitSyncResult<()> {
        let len = format!("{:04x}", payload.len() + 4);
        self.outbound.extend_from_slice(len.as_bytes());
        self.outbound.extend_from_slice(payload);
        Ok(())
    }

    async fn write_flush(&mut self) -> GitSyncResult<()> {
        self.outbound.extend_from_slice(b"0000");
        Ok(())
    }

    async fn end_phase(&mut self) -> GitSyncResult<()> {
        let body = std::mem::take(&mut self.outbound);
        let response = self
            .exchange
            .post(self.service.name(), self.service.request_content_type(), body)
            .await
            .map_err(GitSyncError::store)?;
        self.inbound = Some(PktLineReader::new(Cursor::new(response)));
        Ok(())
    }

    fn is_stateless(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::{encode_data, encode_flush};
    use std::convert::Infallible;

    struct FakeExchange {
        advertisement: Vec<u8>,
        next_response: Vec<u8>,
        last_request: Option<Vec<u8>>,
    }

    #[async_trait]
    impl HttpExchange for FakeExchange {
        type Error = Infallible;

        async fn get_advertisement(&mut self, _service: &str) -> Result<Vec<u8>, Self::Error> {
            Ok(self.advertisement.clone())
        }

        async fn post(
            &mut self,
            _service: &str,
            _content_type: &str,
            body: Vec<u8>,
        ) -> Result<Vec<u8>, Self::Error> {
            self.last_request = Some(body);
            Ok(self.next_response.clone())
        }
    }

    #[tokio::test]
    async fn strips_service_header_before_parsing_advertisement() {
        let mut advertisement = encode_data(b"# service=git-upload-pack\n");
        advertisement.extend(encode_flush());
        advertisement.extend(encode_data(b"deadbeef HEAD\0multi_ack\n"));
        advertisement.extend(encode_flush());

        let exchange = FakeExchange { advertisement, next_response: Vec::new(), last_request: None };
        let mut transport = HttpTransport::for_upload_pack(exchange);
        let mut reader = transport.fetch_advertisement().await.unwrap();
        let line = reader.read_pkt_line().await.unwrap();
        assert_eq!(line, PktLine::Data(b"deadbeef HEAD\0multi_ack\n".to_vec()));
    }

    #[tokio::test]
    async fn buffers_outbound_frames_until_end_phase() {
        let exchange =
            FakeExchange { advertisement: Vec::new(), next_response: encode_flush(), last_request: None };
        let mut transport = HttpTransport::for_upload_pack(exchange);
        assert!(transport.is_stateless());
        transport.write_data(b"want deadbeef").await.unwrap();
        transport.write_flush().await.unwrap();
        transport.end_phase().await.unwrap();
        assert_eq!(transport.exchange.last_request.as_deref(), Some(b"0013want deadbeef0000".as_ref()));
        assert_eq!(transport.read_frame().await.unwrap(), PktLine::Flush);
    }
}
