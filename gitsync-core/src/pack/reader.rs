//! Streaming packfile reader.
//!
//! A buffered fill-buf/consume inflate loop over the variable-length
//! object header and zlib body git's pack format uses. Unlike a reader
//! backed by a random-access `.idx`, there is no on-disk index here, so
//! every object is resolved eagerly as it streams past and written
//! straight through to the `ObjectStore`. OFS_DELTA bases older than the
//! reader's cache window are re-read back out of the store by hash rather
//! than kept resident.

use super::delta::Delta;
use super::{PackObjectKind, PACK_SIGNATURE, PACK_VERSION};
use crate::error::{GitSyncError, GitSyncResult};
use crate::hash::{Hash, RunningSha1};
use crate::store::{ObjectKind, ObjectStore};
use flate2::{Decompress, FlushDecompress, Status};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Resource limits the caller places on an incoming pack, mirroring the
/// pack-reader half of `ClientConfig`.
#[derive(Debug, Clone, Copy)]
pub struct PackReaderLimits {
    pub max_delta_depth: u32,
    /// how many fully-expanded base objects to keep around for OFS_DELTA
    /// resolution before evicting the oldest, bounding peak memory use on a
    /// pack with a long run of deltas against the same base. A base outside
    /// this window is re-read from the object store rather than lost.
    pub base_cache_capacity: usize,
}

impl Default for PackReaderLimits {
    fn default() -> Self {
        Self { max_delta_depth: 50, base_cache_capacity: 256 }
    }
}

#[derive(Debug, Clone)]
pub struct ReadPackOutcome {
    pub object_count: u32,
    pub hashes: Vec<Hash>,
}

/// Incrementally buffers bytes off `R`, tracking a running SHA-1 of every
/// byte actually consumed so the trailer check at the end covers exactly
/// the bytes the objects were decoded from.
struct PackSource<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    hasher: RunningSha1,
    absolute_pos: u64,
}

impl<R: AsyncRead + Unpin> PackSource<R> {
    fn new(inner: R) -> Self {
        Self { inner, buf: Vec::new(), pos: 0, hasher: RunningSha1::new(), absolute_pos: 0 }
    }

    async fn fill_buf(&mut self) -> GitSyncResult<&[u8]> {
        if self.pos == self.buf.len() {
            let mut chunk = vec![0u8; 8192];
            let n = self.inner.read(&mut chunk).await?;
            chunk.truncate(n);
            self.buf = chunk;
            self.pos = 0;
        }
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, n: usize) {
        self.hasher.update(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        self.absolute_pos += n as u64;
    }

    async fn read_u8(&mut self) -> GitSyncResult<u8> {
        let mut out = [0u8];
        self.read_exact(&mut out).await?;
        Ok(out[0])
    }

    async fn read_exact(&mut self, out: &mut [u8]) -> GitSyncResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            let available = self.fill_buf().await?;
            if available.is_empty() {
                return Err(GitSyncError::MalformedFrame(
                    "packfile ended mid-object".into(),
                ));
            }
            let take = available.len().min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&available[..take]);
            self.consume(take);
            filled += take;
        }
        Ok(())
    }

    /// reads `size` bytes without hashing them in (used only for the
    /// trailing checksum itself, which is not part of its own digest).
    async fn read_exact_unhashed(&mut self, out: &mut [u8]) -> GitSyncResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            let available = self.fill_buf().await?;
            if available.is_empty() {
                return Err(GitSyncError::MalformedFrame("packfile truncated before trailer".into()));
            }
            let take = available.len().min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&available[..take]);
            self.pos += take;
            filled += take;
            self.absolute_pos += take as u64;
        }
        Ok(())
    }

    /// decompresses exactly one zlib stream, feeding bytes in as needed and
    /// leaving any unconsumed tail buffered for the next read.
    async fn inflate(&mut self, expected_size: u64) -> GitSyncResult<Vec<u8>> {
        let mut decompressor = Decompress::new(true);
        let mut output = Vec::with_capacity(expected_size as usize);
        loop {
            let input = self.fill_buf().await?;
            let at_eof = input.is_empty();
            let in_so_far = decompressor.total_in();
            let flush = if at_eof { FlushDecompress::Finish } else { FlushDecompress::None };
            let status = decompressor
                .decompress_vec(input, &mut output, flush)
                .map_err(|e| GitSyncError::BadObjectHeader(format!("zlib inflate failed: {}", e)))?;
            let consumed = (decompressor.total_in() - in_so_far) as usize;
            self.consume(consumed);
            match status {
                Status::Ok | Status::BufError => {
                    if consumed == 0 && at_eof {
                        return Err(GitSyncError::MalformedFrame(
                            "packfile ended mid zlib stream".into(),
                        ));
                    }
                    continue;
                }
                Status::StreamEnd => break,
            }
        }
        if output.len() as u64 != expected_size {
            return Err(GitSyncError::BadObjectHeader(format!(
                "object declared size {} but inflated to {} bytes",
                expected_size,
                output.len()
            )));
        }
        Ok(output)
    }
}

struct ObjectHeader {
    kind: PackObjectKind,
    size: u64,
}

async fn read_object_header<R: AsyncRead + Unpin>(
    src: &mut PackSource<R>,
) -> GitSyncResult<ObjectHeader> {
    let first = src.read_u8().await?;
    let kind = PackObjectKind::from_tag((first >> 4) & 0x07)?;
    let mut size = (first & 0x0f) as u64;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = src.read_u8().await?;
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    Ok(ObjectHeader { kind, size })
}

async fn read_offset<R: AsyncRead + Unpin>(src: &mut PackSource<R>) -> GitSyncResult<u64> {
    let mut byte = src.read_u8().await? as u64;
    let mut offset = byte & 0x7f;
    while byte & 0x80 != 0 {
        offset += 1;
        byte = src.read_u8().await? as u64;
        offset = (offset << 7) | (byte & 0x7f);
    }
    Ok(offset)
}

enum RawEntry {
    Whole(ObjectKind, Vec<u8>),
    Ofs { base_offset: u64, delta: Vec<u8> },
    Ref { base_hash: Hash, delta: Vec<u8> },
}

/// one entry's resolved bytes plus how many delta hops it took to get there,
/// used to cap delta chain depth and bound the base cache.
struct Resolved {
    kind: ObjectKind,
    bytes: Vec<u8>,
    depth: u32,
}

/// Reads every object in a pack stream, resolving deltas as they're
/// encountered and writing the expanded objects straight through to
/// `store`. Returns the hash of every object written, in pack order.
pub async fn read_pack<R, S>(
    reader: R,
    store: &S,
    limits: PackReaderLimits,
) -> GitSyncResult<ReadPackOutcome>
where
    R: AsyncRead + Unpin,
    S: ObjectStore,
{
    let mut src = PackSource::new(reader);

    let mut sig = [0u8; 4];
    src.read_exact(&mut sig).await?;
    if &sig != PACK_SIGNATURE {
        return Err(GitSyncError::BadObjectHeader("packfile is missing the `PACK` signature".into()));
    }
    let mut version_buf = [0u8; 4];
    src.read_exact(&mut version_buf).await?;
    let version = u32::from_be_bytes(version_buf);
    if version != PACK_VERSION {
        return Err(GitSyncError::BadObjectHeader(format!("unsupported packfile version `{}`", version)));
    }
    let mut count_buf = [0u8; 4];
    src.read_exact(&mut count_buf).await?;
    let object_count = u32::from_be_bytes(count_buf);

    // offset -> resolved object, for OFS_DELTA bases; evicted oldest-first
    // once `base_cache_capacity` is exceeded. `offset_hashes` is the
    // unbounded, lightweight half of the same index (just the written hash
    // and delta depth, not the full expanded bytes) kept for every object's
    // lifetime so an evicted base can be re-read back from `store` instead
    // of failing outright.
    let mut by_offset: FxHashMap<u64, Resolved> = FxHashMap::default();
    let mut offset_order: Vec<u64> = Vec::new();
    let mut offset_hashes: FxHashMap<u64, (Hash, u32)> = FxHashMap::default();
    let mut hashes = Vec::with_capacity(object_count as usize);

    for _ in 0..object_count {
        let entry_offset = src.absolute_pos;
        let header = read_object_header(&mut src).await?;
        let raw = match header.kind {
            PackObjectKind::Commit | PackObjectKind::Tree | PackObjectKind::Blob | PackObjectKind::Tag => {
                let bytes = src.inflate(header.size).await?;
                RawEntry::Whole(header.kind.to_object_kind().expect("checked above"), bytes)
            }
            PackObjectKind::OfsDelta => {
                let rel = read_offset(&mut src).await?;
                let delta = src.inflate(header.size).await?;
                let base_offset = entry_offset.checked_sub(rel).ok_or_else(|| {
                    GitSyncError::BadObjectHeader("OFS_DELTA base offset underflows the pack".into())
                })?;
                RawEntry::Ofs { base_offset, delta }
            }
            PackObjectKind::RefDelta => {
                let mut hash_bytes = [0u8; crate::hash::HASH_SIZE];
                src.read_exact(&mut hash_bytes).await?;
                let delta = src.inflate(header.size).await?;
                RawEntry::Ref { base_hash: Hash::new(hash_bytes), delta }
            }
        };

        let resolved = match raw {
            RawEntry::Whole(kind, bytes) => Resolved { kind, bytes, depth: 0 },
            RawEntry::Ofs { base_offset, delta } => {
                if let Some(base) = by_offset.get(&base_offset) {
                    resolve_delta(base, &delta, limits.max_delta_depth)?
                } else {
                    // base fell out of the bounded cache; it's still sitting
                    // in `store` under the hash we wrote it with, so pull it
                    // back from there instead of failing.
                    let &(base_hash, base_depth) = offset_hashes.get(&base_offset).ok_or_else(|| {
                        GitSyncError::BadObjectHeader(
                            "OFS_DELTA refers to a base offset not seen earlier in the pack".into(),
                        )
                    })?;
                    let (kind, bytes) =
                        store.read_object(base_hash).await.map_err(GitSyncError::store)?;
                    let base = Resolved { kind, bytes, depth: base_depth };
                    resolve_delta(&base, &delta, limits.max_delta_depth)?
                }
            }
            RawEntry::Ref { base_hash, delta } => {
                resolve_ref_delta(store, base_hash, &delta, limits.max_delta_depth).await?
            }
        };

        let hash = store
            .write_object(resolved.kind, &resolved.bytes)
            .await
            .map_err(GitSyncError::store)?;
        hashes.push(hash);

        offset_hashes.insert(entry_offset, (hash, resolved.depth));
        offset_order.push(entry_offset);
        by_offset.insert(entry_offset, resolved);
        if offset_order.len() > limits.base_cache_capacity {
            let evict = offset_order.remove(0);
            by_offset.remove(&evict);
        }
    }

    let mut trailer = [0u8; crate::hash::HASH_SIZE];
    src.read_exact_unhashed(&mut trailer).await?;
    let computed = src.hasher.finalize();
    if computed.as_bytes() != &trailer {
        return Err(GitSyncError::BadChecksum);
    }

    Ok(ReadPackOutcome { object_count, hashes })
}

fn resolve_delta(base: &Resolved, delta_bytes: &[u8], max_depth: u32) -> GitSyncResult<Resolved> {
    let depth = base.depth + 1;
    if depth > max_depth {
        return Err(GitSyncError::DeltaChainTooDeep { max: max_depth });
    }
    let delta = Delta::decode(delta_bytes)?;
    let bytes = delta.expand(&base.bytes)?;
    Ok(Resolved { kind: base.kind, bytes, depth })
}

async fn resolve_ref_delta<S: ObjectStore>(
    store: &S,
    base_hash: Hash,
    delta_bytes: &[u8],
    max_depth: u32,
) -> GitSyncResult<Resolved> {
    // a REF_DELTA's base is either a thin-pack reference into the
    // receiver's existing store, or an object already written earlier in
    // this same pack — either way it has already been committed to `store`
    // by the time we get here, so a direct lookup covers both cases.
    let (kind, bytes) = store.read_object(base_hash).await.map_err(GitSyncError::store)?;
    resolve_delta(&Resolved { kind, bytes, depth: 0 }, delta_bytes, max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn zlib_compress(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn build_pack(objects: &[(PackObjectKind, Vec<u8>)]) -> Vec<u8> {
        let mut out = super::super::write_pack_file_header(objects.len() as u32);
        for (kind, payload) in objects {
            out.extend(super::super::encode_object_header(*kind, payload.len() as u64));
            out.extend(zlib_compress(payload));
        }
        let trailer = crate::hash::hash_object("raw-pack-body-for-test", &out);
        out.extend_from_slice(trailer.as_bytes());
        out
    }

    // the trailer above isn't a real running-SHA1 of `out`, so these tests
    // build packs through `real_trailer` instead when checksum verification
    // matters.
    fn build_pack_with_real_trailer(objects: &[(PackObjectKind, Vec<u8>)]) -> Vec<u8> {
        let mut out = super::super::write_pack_file_header(objects.len() as u32);
        for (kind, payload) in objects {
            out.extend(super::super::encode_object_header(*kind, payload.len() as u64));
            out.extend(zlib_compress(payload));
        }
        let mut hasher = crate::hash::RunningSha1::new();
        hasher.update(&out);
        let trailer = hasher.finalize();
        out.extend_from_slice(trailer.as_bytes());
        out
    }

    #[tokio::test]
    async fn reads_a_single_blob() {
        let pack = build_pack_with_real_trailer(&[(PackObjectKind::Blob, b"hello world".to_vec())]);
        let store = MemStore::new();
        let outcome = read_pack(std::io::Cursor::new(pack), &store, PackReaderLimits::default())
            .await
            .unwrap();
        assert_eq!(outcome.object_count, 1);
        assert_eq!(outcome.hashes.len(), 1);
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_trailer_checksum() {
        let pack = build_pack(&[(PackObjectKind::Blob, b"hello world".to_vec())]);
        let store = MemStore::new();
        let err = read_pack(std::io::Cursor::new(pack), &store, PackReaderLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GitSyncError::BadChecksum));
    }

    #[tokio::test]
    async fn resolves_ofs_delta_against_earlier_object() {
        let base = b"the quick brown fox jumps over the lazy dog".to_vec();
        let target = b"the quick brown fox jumps over the lazy cat".to_vec();
        let delta = super::super::delta::create(&base, &target).encode();

        let mut out = super::super::write_pack_file_header(2);
        out.extend(super::super::encode_object_header(PackObjectKind::Blob, base.len() as u64));
        out.extend(zlib_compress(&base));
        let base_entry_offset = 12u64;
        let delta_entry_offset = out.len() as u64;
        out.extend(super::super::encode_object_header(PackObjectKind::OfsDelta, delta.len() as u64));
        out.extend(super::super::encode_offset(delta_entry_offset - base_entry_offset));
        out.extend(zlib_compress(&delta));

        let mut hasher = crate::hash::RunningSha1::new();
        hasher.update(&out);
        let trailer = hasher.finalize();
        out.extend_from_slice(trailer.as_bytes());

        let store = MemStore::new();
        let outcome = read_pack(std::io::Cursor::new(out), &store, PackReaderLimits::default())
            .await
            .unwrap();
        assert_eq!(outcome.hashes.len(), 2);
        let (_, resolved_bytes) = store.read_object(outcome.hashes[1]).await.unwrap();
        assert_eq!(resolved_bytes, target);
    }

    #[tokio::test]
    async fn enforces_delta_chain_depth_limit() {
        let base = vec![0u8; 64];
        let mut out = super::super::write_pack_file_header(3);
        out.extend(super::super::encode_object_header(PackObjectKind::Blob, base.len() as u64));
        out.extend(zlib_compress(&base));
        let mut prev_offset = 12u64;
        let mut prev_bytes = base.clone();
        for i in 0..2u8 {
            let mut next_bytes = prev_bytes.clone();
            next_bytes.push(i);
            let delta = super::super::delta::create(&prev_bytes, &next_bytes).encode();
            let entry_offset = out.len() as u64;
            out.extend(super::super::encode_object_header(PackObjectKind::OfsDelta, delta.len() as u64));
            out.extend(super::super::encode_offset(entry_offset - prev_offset));
            out.extend(zlib_compress(&delta));
            prev_offset = entry_offset;
            prev_bytes = next_bytes;
        }
        let mut hasher = crate::hash::RunningSha1::new();
        hasher.update(&out);
        let trailer = hasher.finalize();
        out.extend_from_slice(trailer.as_bytes());

        let store = MemStore::new();
        let limits = PackReaderLimits { max_delta_depth: 1, base_cache_capacity: 256 };
        let err = read_pack(std::io::Cursor::new(out), &store, limits).await.unwrap_err();
        assert!(matches!(err, GitSyncError::DeltaChainTooDeep { max: 1 }));
    }

    #[tokio::test]
    async fn resolves_ofs_delta_against_base_evicted_from_the_cache() {
        let base = b"the quick brown fox jumps over the lazy dog".to_vec();
        let target = b"the quick brown fox jumps over the lazy cat".to_vec();
        let delta = super::super::delta::create(&base, &target).encode();

        let mut out = super::super::write_pack_file_header(3);
        let base_entry_offset = out.len() as u64;
        out.extend(super::super::encode_object_header(PackObjectKind::Blob, base.len() as u64));
        out.extend(zlib_compress(&base));
        // a second, unrelated blob so the base is pushed out of a
        // capacity-1 cache before the delta entry below ever resolves it.
        let filler = b"unrelated filler blob".to_vec();
        out.extend(super::super::encode_object_header(PackObjectKind::Blob, filler.len() as u64));
        out.extend(zlib_compress(&filler));
        let delta_entry_offset = out.len() as u64;
        out.extend(super::super::encode_object_header(PackObjectKind::OfsDelta, delta.len() as u64));
        out.extend(super::super::encode_offset(delta_entry_offset - base_entry_offset));
        out.extend(zlib_compress(&delta));

        let mut hasher = crate::hash::RunningSha1::new();
        hasher.update(&out);
        let trailer = hasher.finalize();
        out.extend_from_slice(trailer.as_bytes());

        let store = MemStore::new();
        let limits = PackReaderLimits { max_delta_depth: 50, base_cache_capacity: 1 };
        let outcome = read_pack(std::io::Cursor::new(out), &store, limits).await.unwrap();
        assert_eq!(outcome.hashes.len(), 3);
        let (_, resolved_bytes) = store.read_object(outcome.hashes[2]).await.unwrap();
        assert_eq!(resolved_bytes, target);
    }
}
