//! A loose-object, on-disk `ObjectStore` backing the reference CLI.
//!
//! Mirrors git's own on-disk layout under `.git/objects` and `.git/refs`:
//! zlib-deflated `"<kind> <len>\0<payload>"` loose objects, fanned out by
//! the first two hex digits of the hash; one flat file per ref under
//! `refs/`. This crate's core never assumes this layout — it is entirely
//! the CLI's choice of `ObjectStore` implementation.

use async_trait::async_trait;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures::stream::{self, BoxStream};
use gitsync_core::hash::hash_object;
use gitsync_core::refs::RefName;
use gitsync_core::store::{ObjectKind, ObjectStore};
use gitsync_core::Hash;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("refs"))?;
        Ok(Self { root })
    }

    fn object_path(&self, hash: Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn ref_path(&self, name: &RefName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn read_loose(&self, hash: Hash) -> std::io::Result<(ObjectKind, Vec<u8>)> {
        let raw = std::fs::read(self.object_path(hash))?;
        let mut decoder = ZlibDecoder::new(&raw[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded)?;
        let nul = decoded.iter().position(|&b| b == 0).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "loose object missing header nul")
        })?;
        let header = std::str::from_utf8(&decoded[..nul])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let kind_name = header.split(' ').next().unwrap_or("");
        let kind = match kind_name {
            "commit" => ObjectKind::Commit,
            "tree" => ObjectKind::Tree,
            "blob" => ObjectKind::Blob,
            "tag" => ObjectKind::Tag,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown loose object kind `{}`", other),
                ))
            }
        };
        Ok((kind, decoded[nul + 1..].to_vec()))
    }

    fn write_loose(&self, kind: ObjectKind, payload: &[u8]) -> std::io::Result<Hash> {
        let hash = hash_object(kind.name(), payload);
        let path = self.object_path(hash);
        if path.exists() {
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut header = format!("{} {}\0", kind.name(), payload.len()).into_bytes();
        header.extend_from_slice(payload);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&header)?;
        std::fs::write(path, encoder.finish()?)?;
        Ok(hash)
    }

    fn walk_refs(dir: &Path, prefix: &str, out: &mut Vec<(RefName, Hash)>) -> std::io::Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().into_string().unwrap_or_default();
            let path = entry.path();
            let child_prefix = format!("{}/{}", prefix, name);
            if path.is_dir() {
                Self::walk_refs(&path, &child_prefix, out)?;
            } else if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(hash) = text.trim().parse::<Hash>() {
                    out.push((RefName::new(child_prefix), hash));
                }
            }
        }
        Ok(())
    }

    /// Every hash reachable from `roots` via commit `tree`/`parent` links
    /// and tree entries, stopping at objects this store doesn't have
    /// (the server's haves, or any other base the caller is relying on the
    /// remote already possessing).
    fn reachable_sync(&self, roots: &[Hash]) -> Vec<Hash> {
        let mut seen = HashSet::new();
        let mut stack: Vec<Hash> = roots.to_vec();
        let mut out = Vec::new();
        while let Some(hash) = stack.pop() {
            if !seen.insert(hash) {
                continue;
            }
            let (kind, payload) = match self.read_loose(hash) {
                Ok(v) => v,
                Err(_) => continue,
            };
            out.push(hash);
            match kind {
                ObjectKind::Commit => {
                    let (tree, parents) = parse_commit(&payload);
                    stack.extend(tree);
                    stack.extend(parents);
                }
                ObjectKind::Tree => stack.extend(parse_tree_entries(&payload)),
                ObjectKind::Blob | ObjectKind::Tag => {}
            }
        }
        out
    }
}

fn parse_commit(payload: &[u8]) -> (Option<Hash>, Vec<Hash>) {
    let mut tree = None;
    let mut parents = Vec::new();
    for line in payload.split(|&b| b == b'\n') {
        if line.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(line);
        if let Some(rest) = text.strip_prefix("tree ") {
            tree = rest.trim().parse().ok();
        } else if let Some(rest) = text.strip_prefix("parent ") {
            if let Ok(hash) = rest.trim().parse() {
                parents.push(hash);
            }
        }
    }
    (tree, parents)
}

/// Binary tree entries: `"<mode> <name>\0"` followed by a raw 20-byte hash,
/// repeated to the end of the payload.
fn parse_tree_entries(payload: &[u8]) -> Vec<Hash> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < payload.len() {
        let nul = match payload[i..].iter().position(|&b| b == 0) {
            Some(p) => i + p,
            None => break,
        };
        let hash_start = nul + 1;
        let hash_end = hash_start + 20;
        if hash_end > payload.len() {
            break;
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&payload[hash_start..hash_end]);
        out.push(Hash::new(bytes));
        i = hash_end;
    }
    out
}

#[async_trait]
impl ObjectStore for FsStore {
    type Error = std::io::Error;

    async fn has_object(&self, hash: Hash) -> Result<bool, Self::Error> {
        Ok(self.object_path(hash).exists())
    }

    async fn read_object(&self, hash: Hash) -> Result<(ObjectKind, Vec<u8>), Self::Error> {
        self.read_loose(hash)
    }

    async fn write_object(&self, kind: ObjectKind, payload: &[u8]) -> Result<Hash, Self::Error> {
        self.write_loose(kind, payload)
    }

    async fn list_refs(&self) -> Result<Vec<(RefName, Hash)>, Self::Error> {
        let mut out = Vec::new();
        Self::walk_refs(&self.root.join("refs"), "refs", &mut out)?;
        Ok(out)
    }

    async fn read_ref(&self, name: &RefName) -> Result<Option<Hash>, Self::Error> {
        match std::fs::read_to_string(self.ref_path(name)) {
            Ok(text) => Ok(text.trim().parse::<Hash>().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_ref(&self, name: &RefName, hash: Hash) -> Result<(), Self::Error> {
        let path = self.ref_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", hash))
    }

    fn reachable_from<'a>(&'a self, roots: &'a [Hash]) -> BoxStream<'a, Result<Hash, Self::Error>> {
        Box::pin(stream::iter(self.reachable_sync(roots).into_iter().map(Ok)))
    }
}
