//! Content-addressed object identifiers.
//!
//! Kept as a thin newtype over a fixed byte array (rather than hardwiring
//! `[u8; 20]` at every call site) so a future SHA-256 variant only touches
//! this module.

use crate::error::{GitSyncError, GitSyncResult};
use rustc_hex::{FromHex, ToHex};
use sha1::{Digest, Sha1};
use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

pub const HASH_SIZE: usize = 20;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// the zero hash used by the server to signal "no refs" and by clients
    /// for the old-oid half of a `Create` push command
    pub const ZERO: Self = Self([0; HASH_SIZE]);

    #[inline]
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn short(&self) -> String {
        self.to_hex()[..7].to_owned()
    }
}

impl FromStr for Hash {
    type Err = GitSyncError;

    fn from_str(s: &str) -> GitSyncResult<Self> {
        let s = s.trim_end();
        if s.len() != HASH_SIZE * 2 {
            return Err(GitSyncError::MalformedFrame(format!(
                "expected a {}-character hex hash, got `{}`",
                HASH_SIZE * 2,
                s
            )));
        }
        let bytes: Vec<u8> = s
            .from_hex()
            .map_err(|_| GitSyncError::MalformedFrame(format!("invalid hex hash `{}`", s)))?;
        Ok(Self(bytes.try_into().expect("length checked above")))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Hash {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        for b in &mut bytes {
            *b = u8::arbitrary(g);
        }
        Self(bytes)
    }
}

/// hash a single ungrouped object the way the object database does:
/// `"<kind> <len>\0<payload>"`
pub fn hash_object(kind_name: &str, payload: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(kind_name.as_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(payload);
    Hash(hasher.finalize().into())
}

/// incremental SHA-1, used to verify the packfile trailer covers every
/// preceding byte.
#[derive(Default)]
pub struct RunningSha1(Sha1);

impl RunningSha1 {
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.0.finalize().into())
    }
}

pub fn crc32_of(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_round_trips() {
        let s = Hash::ZERO.to_hex();
        assert_eq!(s, "0".repeat(40));
        assert_eq!(s.parse::<Hash>().unwrap(), Hash::ZERO);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("abcd".parse::<Hash>().is_err());
    }

    #[test]
    fn hash_object_matches_git_blob_of_empty_file() {
        let hash = hash_object("blob", b"");
        assert_eq!(hash.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }
}
