//! Refspecs: `+refs/heads/*:refs/remotes/origin/*`-style mappings
//! between a remote's refs and local ones.
//!
//! Same glob/forced-update semantics git itself uses, built on `RefName`
//! rather than an interned path type since this crate has no interner.

use crate::refs::RefName;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refspec {
    src: String,
    dst: String,
    forced: bool,
    glob: bool,
}

impl Refspec {
    pub fn default_fetch_for_remote(remote_name: &str) -> Self {
        Self {
            src: "refs/heads/".to_owned(),
            dst: format!("refs/remotes/{}/", remote_name),
            forced: true,
            glob: true,
        }
    }

    /// maps a source ref to its destination, if this refspec applies to it.
    pub fn match_ref(&self, source: &RefName) -> Option<RefName> {
        if self.glob {
            let suffix = source.as_str().strip_prefix(self.src.as_str())?;
            Some(RefName::new(format!("{}{}", self.dst, suffix)))
        } else if source.as_str() == self.src {
            Some(RefName::new(self.dst.clone()))
        } else {
            None
        }
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }
}

impl FromStr for Refspec {
    type Err = crate::error::GitSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |msg: &str| crate::error::GitSyncError::MalformedAdvertisement(format!("invalid refspec `{}`: {}", s, msg));
        let (forced, s) = match s.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (src, dst) = s.split_once(':').ok_or_else(|| bad("missing `:`"))?;
        let (src, src_glob) = match src.strip_suffix('*') {
            Some(stripped) => (stripped, true),
            None => (src, false),
        };
        let (dst, dst_glob) = match dst.strip_suffix('*') {
            Some(stripped) => (stripped, true),
            None => (dst, false),
        };
        let glob = match (src_glob, dst_glob) {
            (true, true) => true,
            (false, false) => false,
            _ => return Err(bad("only one side of the refspec is globbed")),
        };
        Ok(Self { src: src.to_owned(), dst: dst.to_owned(), forced, glob })
    }
}

impl Display for Refspec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.forced {
            write!(f, "+")?;
        }
        if self.glob {
            write!(f, "{}*:{}*", self.src, self.dst)
        } else {
            write!(f, "{}:{}", self.src, self.dst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fetch_refspec_globs_heads_into_remotes() {
        let spec = Refspec::default_fetch_for_remote("origin");
        let mapped = spec.match_ref(&RefName::new("refs/heads/main")).unwrap();
        assert_eq!(mapped.as_str(), "refs/remotes/origin/main");
    }

    #[test]
    fn parses_and_renders_forced_glob_refspec() {
        let spec: Refspec = "+refs/heads/*:refs/remotes/origin/*".parse().unwrap();
        assert!(spec.is_forced());
        assert_eq!(spec.to_string(), "+refs/heads/*:refs/remotes/origin/*");
    }

    #[test]
    fn rejects_mismatched_glob_sides() {
        assert!("refs/heads/*:refs/remotes/origin/main".parse::<Refspec>().is_err());
    }

    #[test]
    fn non_glob_refspec_matches_exact_ref_only() {
        let spec: Refspec = "refs/heads/main:refs/remotes/origin/main".parse().unwrap();
        assert!(spec.match_ref(&RefName::new("refs/heads/main")).is_some());
        assert!(spec.match_ref(&RefName::new("refs/heads/dev")).is_none());
    }
}
