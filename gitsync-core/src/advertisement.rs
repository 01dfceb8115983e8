//! Ref advertisement parsing.

use crate::capability::CapabilitySet;
use crate::error::{GitSyncError, GitSyncResult};
use crate::hash::Hash;
use crate::pktline::PktLineReader;
use crate::refs::{RefAdvert, RefName};
use std::collections::HashSet;
use tokio::io::AsyncRead;

#[derive(Debug, Clone)]
pub struct Advertisement {
    pub refs: Vec<RefAdvert>,
    pub capabilities: CapabilitySet,
}

impl Advertisement {
    pub fn find(&self, name: &str) -> Option<&RefAdvert> {
        self.refs.iter().find(|r| r.name.as_str() == name)
    }

    /// the hash HEAD's `symref=HEAD:<target>` capability points at, if the
    /// server advertised one and that target is itself in the advertisement.
    pub fn head_target_hash(&self) -> Option<Hash> {
        let target = self.capabilities.symref_target(RefName::HEAD)?;
        self.find(target).map(|r| r.hash)
    }
}

/// Parses the pkt-lines up to (and consuming) the first flush-pkt into an
/// [`Advertisement`].
pub async fn parse_advertisement<R: AsyncRead + Unpin>(
    reader: &mut PktLineReader<R>,
) -> GitSyncResult<Advertisement> {
    let lines = reader.read_until_flush().await?;
    parse_advertisement_lines(&lines)
}

pub(crate) fn parse_advertisement_lines(lines: &[Vec<u8>]) -> GitSyncResult<Advertisement> {
    let mut refs = Vec::new();
    let mut capabilities = CapabilitySet::default();
    let mut seen = HashSet::new();

    for (i, line) in lines.iter().enumerate() {
        let text = std::str::from_utf8(line)
            .map_err(|_| GitSyncError::MalformedAdvertisement("non-utf8 ref line".into()))?;
        let text = text.trim_end_matches('\n');

        let (text, caps_str) = if i == 0 {
            match text.split_once('\0') {
                Some((head, caps)) => (head, Some(caps)),
                None => (text, None),
            }
        } else {
            (text, None)
        };

        if let Some(caps) = caps_str {
            capabilities = CapabilitySet::parse(caps);
        }

        let (hash_str, name_str) = text.split_once(' ').ok_or_else(|| {
            GitSyncError::MalformedAdvertisement(format!("missing space in ref line `{}`", text))
        })?;
        let hash: Hash = hash_str.parse()?;

        // the synthetic "no refs" line: `<zero> capabilities^{}`
        if i == 0 && name_str == "capabilities^{}" {
            if lines.len() != 1 {
                return Err(GitSyncError::MalformedAdvertisement(
                    "synthetic no-refs line must be the only ref line".into(),
                ));
            }
            return Ok(Advertisement { refs, capabilities });
        }

        if let Some(base) = name_str.strip_suffix("^{}") {
            let last = refs.last_mut().ok_or_else(|| {
                GitSyncError::MalformedAdvertisement(
                    "peeled ref line with no preceding ref".into(),
                )
            })?;
            let last: &mut RefAdvert = last;
            if last.name.as_str() != base {
                return Err(GitSyncError::MalformedAdvertisement(format!(
                    "peeled ref line `{}^{{}}` does not follow `{}`",
                    base, last.name
                )));
            }
            last.peeled = true;
            continue;
        }

        if !seen.insert(name_str.to_owned()) {
            return Err(GitSyncError::MalformedAdvertisement(format!(
                "duplicate ref `{}` in advertisement",
                name_str
            )));
        }
        refs.push(RefAdvert { hash, name: RefName::new(name_str), peeled: false });
    }

    Ok(Advertisement { refs, capabilities })
}

/// Renders refs + capabilities back into pkt-line payloads, the inverse of
/// `parse_advertisement`. Used by the canonicalization property test
/// and by server-side test doubles that stand in for a remote in
/// integration tests.
pub fn render_advertisement(advert: &Advertisement) -> Vec<Vec<u8>> {
    if advert.refs.is_empty() {
        return vec![
            format!("{} capabilities^{{}}\0{}\n", Hash::ZERO, advert.capabilities.render())
                .into_bytes(),
        ];
    }
    let mut lines = Vec::new();
    for (i, r) in advert.refs.iter().enumerate() {
        if i == 0 {
            lines.push(
                format!("{} {}\0{}\n", r.hash, r.name, advert.capabilities.render()).into_bytes(),
            );
        } else {
            lines.push(format!("{} {}\n", r.hash, r.name).into_bytes());
        }
        if r.peeled {
            lines.push(format!("{} {}^{{}}\n", r.hash, r.name).into_bytes());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::{encode_data, encode_flush};
    use std::io::Cursor;

    fn wrap(mut lines: Vec<Vec<u8>>) -> Vec<u8> {
        let mut buf = Vec::new();
        for line in lines.drain(..) {
            buf.extend(encode_data(&line));
        }
        buf.extend(encode_flush());
        buf
    }

    #[tokio::test]
    async fn parses_no_refs_synthetic_line() {
        let line =
            format!("{} capabilities^{{}}\0multi_ack side-band-64k\n", Hash::ZERO).into_bytes();
        let mut reader = PktLineReader::new(Cursor::new(wrap(vec![line])));
        let advert = parse_advertisement(&mut reader).await.unwrap();
        assert!(advert.refs.is_empty());
        assert!(advert.capabilities.has("multi_ack"));
        assert!(advert.capabilities.has("side-band-64k"));
    }

    #[tokio::test]
    async fn parses_refs_with_peeled_tag() {
        let h1: Hash = "1111111111111111111111111111111111111111".parse().unwrap();
        let h2: Hash = "2222222222222222222222222222222222222222".parse().unwrap();
        let lines = vec![
            format!("{} refs/heads/main\0ofs-delta\n", h1).into_bytes(),
            format!("{} refs/tags/v1\n", h2).into_bytes(),
            format!("{} refs/tags/v1^{{}}\n", h1).into_bytes(),
        ];
        let mut reader = PktLineReader::new(Cursor::new(wrap(lines)));
        let advert = parse_advertisement(&mut reader).await.unwrap();
        assert_eq!(advert.refs.len(), 2);
        assert!(!advert.refs[0].peeled);
        assert!(advert.refs[1].peeled);
        assert_eq!(advert.refs[1].hash, h2);
    }

    #[tokio::test]
    async fn rejects_duplicate_refnames() {
        let h1: Hash = "1111111111111111111111111111111111111111".parse().unwrap();
        let lines = vec![
            format!("{} refs/heads/main\0\n", h1).into_bytes(),
            format!("{} refs/heads/main\n", h1).into_bytes(),
        ];
        let mut reader = PktLineReader::new(Cursor::new(wrap(lines)));
        assert!(parse_advertisement(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn render_then_parse_round_trips_set_equality() {
        let h1: Hash = "1111111111111111111111111111111111111111".parse().unwrap();
        let advert = Advertisement {
            refs: vec![RefAdvert { hash: h1, name: RefName::new("refs/heads/main"), peeled: false }],
            capabilities: CapabilitySet::parse("ofs-delta side-band-64k agent=gitsync/0.1"),
        };
        let lines = render_advertisement(&advert);
        let mut reader = PktLineReader::new(Cursor::new(wrap(lines)));
        let parsed = parse_advertisement(&mut reader).await.unwrap();
        assert_eq!(parsed.refs, advert.refs);
        assert_eq!(parsed.capabilities.tag_set(), advert.capabilities.tag_set());
    }
}
