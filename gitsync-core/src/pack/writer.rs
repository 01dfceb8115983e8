//! Packfile writer.
//!
//! Generating a pack client-side (for `push`) rather than only receiving
//! one, built directly against the wire format `pack/mod.rs` and
//! `pack/delta.rs` already encode/decode, using the same window/depth
//! vocabulary `git pack-objects --window`/`--depth` exposes for the knobs.

use super::delta;
use super::{encode_object_header, encode_offset, write_pack_file_header, PackObjectKind};
use crate::hash::{Hash, RunningSha1};
use crate::store::ObjectKind;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

/// One object to include in an outbound pack.
#[derive(Debug, Clone)]
pub struct PackEntry {
    pub hash: Hash,
    pub kind: ObjectKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct PackWriterConfig {
    /// how many preceding entries a candidate base is searched against
    /// (`git pack-objects --window`).
    pub window: usize,
    pub max_depth: u32,
    pub prefer_ofs_delta: bool,
}

impl Default for PackWriterConfig {
    fn default() -> Self {
        Self { window: 10, max_depth: 50, prefer_ofs_delta: true }
    }
}

struct Candidate {
    hash: Hash,
    bytes: Vec<u8>,
    depth: u32,
}

/// Serializes `entries` into a complete pack, delta-compressing each entry
/// against up to `config.window` of its most recent same-kind predecessors
/// when that produces a smaller encoding. Returns the pack bytes (header,
/// objects, SHA-1 trailer).
pub fn write_pack(entries: &[PackEntry], config: PackWriterConfig) -> Vec<u8> {
    let mut out = write_pack_file_header(entries.len() as u32);
    let mut window: Vec<(u64, Candidate)> = Vec::with_capacity(config.window);

    for entry in entries {
        let entry_offset = out.len() as u64;
        let best_delta = window
            .iter()
            .rev()
            .take(config.window)
            .filter(|(_, c)| c.depth < config.max_depth)
            .filter_map(|(base_offset, c)| {
                let encoded = delta::create(&c.bytes, &entry.bytes).encode();
                (encoded.len() < entry.bytes.len())
                    .then(|| (*base_offset, c.hash, c.depth + 1, encoded))
            })
            .min_by_key(|(_, _, _, encoded)| encoded.len());

        let (kind, depth, payload_for_header, compress_body) = match best_delta {
            Some((base_offset, _, depth, encoded)) if config.prefer_ofs_delta => {
                let mut body = encode_offset(entry_offset - base_offset);
                body.extend_from_slice(&encoded);
                (PackObjectKind::OfsDelta, depth, encoded.len() as u64, body)
            }
            Some((_, base_hash, depth, encoded)) => {
                let mut body = base_hash.as_bytes().to_vec();
                body.extend_from_slice(&encoded);
                (PackObjectKind::RefDelta, depth, encoded.len() as u64, body)
            }
            None => (
                PackObjectKind::from_object_kind(entry.kind),
                0,
                entry.bytes.len() as u64,
                entry.bytes.clone(),
            ),
        };

        out.extend(encode_object_header(kind, payload_for_header));
        out.extend(zlib_compress(&compress_body));

        if window.len() == config.window {
            window.remove(0);
        }
        window.push((entry_offset, Candidate { hash: entry.hash, bytes: entry.bytes.clone(), depth }));
    }

    let mut hasher = RunningSha1::new();
    hasher.update(&out);
    out.extend_from_slice(hasher.finalize().as_bytes());
    out
}

fn zlib_compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("writing to an in-memory encoder cannot fail");
    encoder.finish().expect("finishing an in-memory encoder cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::reader::{read_pack, PackReaderLimits};
    use crate::store::mem::MemStore;

    fn entry(kind: ObjectKind, bytes: &[u8]) -> PackEntry {
        PackEntry { hash: crate::hash::hash_object(kind.name(), bytes), kind, bytes: bytes.to_vec() }
    }

    #[tokio::test]
    async fn writes_a_pack_the_reader_can_read_back() {
        let entries = vec![
            entry(ObjectKind::Blob, b"the quick brown fox jumps over the lazy dog"),
            entry(ObjectKind::Blob, b"the quick brown fox jumps over the lazy cat"),
            entry(ObjectKind::Tree, b"100644 blob abc\tfile.txt\n"),
        ];
        let pack = write_pack(&entries, PackWriterConfig::default());

        let store = MemStore::new();
        let outcome = read_pack(std::io::Cursor::new(pack), &store, PackReaderLimits::default())
            .await
            .unwrap();
        assert_eq!(outcome.object_count, 3);
        assert_eq!(store.object_count(), 3);
    }

    #[test]
    fn deltifies_similar_consecutive_objects() {
        let base = vec![9u8; 2000];
        let mut similar = base.clone();
        similar.extend_from_slice(b"a short suffix");
        let entries =
            vec![entry(ObjectKind::Blob, &base), entry(ObjectKind::Blob, &similar)];
        let pack = write_pack(&entries, PackWriterConfig::default());
        let naive_size = base.len() + similar.len();
        assert!(pack.len() < naive_size);
    }
}
