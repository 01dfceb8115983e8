//! `git://` URI parsing and the TCP connection dance documented in
//! `pack-protocol.txt`: the client opens a socket and sends one pkt-line,
//! `"git-upload-pack /path\0host=host\0"` (or `git-receive-pack`), before
//! the server starts the usual advertisement/negotiation dialogue.

use anyhow::{bail, Context, Result};
use gitsync_core::transport::persistent::PersistentTransport;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub struct GitUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl GitUrl {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix("git://").context("only git:// URIs are supported")?;
        let (authority, path) = rest.split_once('/').context("missing repository path")?;
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (host.to_owned(), port.parse().context("invalid port")?),
            None => (authority.to_owned(), 9418),
        };
        if path.is_empty() {
            bail!("empty repository path in `{}`", uri);
        }
        Ok(Self { host, port, path: format!("/{}", path) })
    }
}

async fn connect(url: &GitUrl, service: &str) -> Result<PersistentTransport<TcpStream>> {
    let mut stream = TcpStream::connect((url.host.as_str(), url.port))
        .await
        .with_context(|| format!("connecting to {}:{}", url.host, url.port))?;
    let request = format!("{} {}\0host={}\0", service, url.path, url.host);
    let frame = format!("{:04x}{}", request.len() + 4, request);
    stream.write_all(frame.as_bytes()).await?;
    Ok(PersistentTransport::new(stream))
}

pub async fn connect_upload_pack(url: &GitUrl) -> Result<PersistentTransport<TcpStream>> {
    connect(url, "git-upload-pack").await
}

pub async fn connect_receive_pack(url: &GitUrl) -> Result<PersistentTransport<TcpStream>> {
    connect(url, "git-receive-pack").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_path() {
        let url = GitUrl::parse("git://example.com:9419/repo.git").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 9419);
        assert_eq!(url.path, "/repo.git");
    }

    #[test]
    fn defaults_to_the_standard_port() {
        let url = GitUrl::parse("git://example.com/repo.git").unwrap();
        assert_eq!(url.port, 9418);
    }

    #[test]
    fn rejects_non_git_schemes() {
        assert!(GitUrl::parse("https://example.com/repo.git").is_err());
    }
}
