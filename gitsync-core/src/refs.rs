//! Ref names and the small set of value types built from them.

use std::fmt::{self, Display, Formatter};

/// A slash-separated ref path, conventionally beginning `refs/`.
///
/// `HEAD` itself is also a valid `RefName` even though it is not under
/// `refs/`, same as git's own symbolic-ref convention.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefName(String);

impl RefName {
    pub const HEAD: &'static str = "HEAD";

    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_head(&self) -> bool {
        self.0 == Self::HEAD
    }

    /// `refs/heads/main^{}` -> peeled marker recognised by the advertisement
    /// parser; not a real ref name.
    pub fn peel_suffix(&self) -> Option<&str> {
        self.0.strip_suffix("^{}")
    }
}

impl Display for RefName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RefName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RefName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A single ref entry in the server's advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefAdvert {
    pub hash: crate::hash::Hash,
    pub name: RefName,
    pub peeled: bool,
}
