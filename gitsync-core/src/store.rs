//! The object store capability: the only coupling between this crate
//! and a concrete object database. Nothing else in this crate should know
//! how objects or refs are actually persisted.

use crate::hash::Hash;
use crate::refs::RefName;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::error::Error as StdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

/// The narrow capability interface the protocol core consumes. A real
/// implementation backs this with a content-addressed object database and a
/// ref database; this crate never assumes anything about how either is laid
/// out on disk.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn has_object(&self, hash: Hash) -> Result<bool, Self::Error>;

    async fn read_object(&self, hash: Hash) -> Result<(ObjectKind, Vec<u8>), Self::Error>;

    async fn write_object(&self, kind: ObjectKind, payload: &[u8]) -> Result<Hash, Self::Error>;

    async fn list_refs(&self) -> Result<Vec<(RefName, Hash)>, Self::Error>;

    async fn read_ref(&self, name: &RefName) -> Result<Option<Hash>, Self::Error>;

    async fn write_ref(&self, name: &RefName, hash: Hash) -> Result<(), Self::Error>;

    /// Every hash reachable from `roots`, used by the packfile writer to
    /// figure out which objects the server's haves already cover and which
    /// ones a thin pack may delta against.
    fn reachable_from<'a>(&'a self, roots: &'a [Hash]) -> BoxStream<'a, Result<Hash, Self::Error>>;
}

/// A simple in-memory store used by this crate's own integration tests, and
/// a reasonable starting point for a caller's own test doubles — exercising
/// transport and negotiation behaviour against a throwaway fixture rather
/// than a real on-disk repository.
pub mod mem {
    use super::*;
    use futures::stream;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemStore {
        objects: Mutex<HashMap<Hash, (ObjectKind, Vec<u8>)>>,
        refs: Mutex<HashMap<RefName, Hash>>,
    }

    impl MemStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn object_count(&self) -> usize {
            self.objects.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ObjectStore for MemStore {
        type Error = Infallible;

        async fn has_object(&self, hash: Hash) -> Result<bool, Self::Error> {
            Ok(self.objects.lock().unwrap().contains_key(&hash))
        }

        async fn read_object(&self, hash: Hash) -> Result<(ObjectKind, Vec<u8>), Self::Error> {
            Ok(self.objects.lock().unwrap().get(&hash).cloned().expect("object not found"))
        }

        async fn write_object(&self, kind: ObjectKind, payload: &[u8]) -> Result<Hash, Self::Error> {
            let hash = crate::hash::hash_object(kind.name(), payload);
            self.objects.lock().unwrap().insert(hash, (kind, payload.to_vec()));
            Ok(hash)
        }

        async fn list_refs(&self) -> Result<Vec<(RefName, Hash)>, Self::Error> {
            Ok(self.refs.lock().unwrap().iter().map(|(k, v)| (k.clone(), *v)).collect())
        }

        async fn read_ref(&self, name: &RefName) -> Result<Option<Hash>, Self::Error> {
            Ok(self.refs.lock().unwrap().get(name).copied())
        }

        async fn write_ref(&self, name: &RefName, hash: Hash) -> Result<(), Self::Error> {
            self.refs.lock().unwrap().insert(name.clone(), hash);
            Ok(())
        }

        fn reachable_from<'a>(
            &'a self,
            roots: &'a [Hash],
        ) -> BoxStream<'a, Result<Hash, Self::Error>> {
            // the in-memory fixture only stores flat blobs for tests; a real
            // store would walk commit -> tree -> blob edges here.
            Box::pin(stream::iter(roots.iter().copied().map(Ok)))
        }
    }
}
