//! Capability parsing and negotiation.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A single advertised or requested capability.
///
/// Unknown tags round-trip through `Unknown` rather than being dropped, so a
/// client can re-print exactly what it parsed even for tags it doesn't
/// understand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    MultiAck,
    MultiAckDetailed,
    NoDone,
    ThinPack,
    SideBand,
    SideBand64k,
    OfsDelta,
    Agent(String),
    Shallow,
    DeepenSince,
    DeepenNot,
    NoProgress,
    IncludeTag,
    ReportStatus,
    DeleteRefs,
    Quiet,
    Atomic,
    PushOptions,
    AllowTipSha1InWant,
    AllowReachableSha1InWant,
    PushCert(String),
    Symref(String, String),
    Unknown(String),
}

impl Capability {
    /// the bare tag name, ignoring any `=value` suffix — used to look a
    /// capability up in a `CapabilitySet` without needing the payload.
    pub fn tag(&self) -> &str {
        match self {
            Self::MultiAck => "multi_ack",
            Self::MultiAckDetailed => "multi_ack_detailed",
            Self::NoDone => "no-done",
            Self::ThinPack => "thin-pack",
            Self::SideBand => "side-band",
            Self::SideBand64k => "side-band-64k",
            Self::OfsDelta => "ofs-delta",
            Self::Agent(_) => "agent",
            Self::Shallow => "shallow",
            Self::DeepenSince => "deepen-since",
            Self::DeepenNot => "deepen-not",
            Self::NoProgress => "no-progress",
            Self::IncludeTag => "include-tag",
            Self::ReportStatus => "report-status",
            Self::DeleteRefs => "delete-refs",
            Self::Quiet => "quiet",
            Self::Atomic => "atomic",
            Self::PushOptions => "push-options",
            Self::AllowTipSha1InWant => "allow-tip-sha1-in-want",
            Self::AllowReachableSha1InWant => "allow-reachable-sha1-in-want",
            Self::PushCert(_) => "push-cert",
            Self::Symref(..) => "symref",
            Self::Unknown(tag) => tag.split('=').next().unwrap_or(tag),
        }
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if let Some(v) = s.strip_prefix("agent=") {
            Self::Agent(v.to_owned())
        } else if let Some(v) = s.strip_prefix("push-cert=") {
            Self::PushCert(v.to_owned())
        } else if let Some(v) = s.strip_prefix("symref=") {
            match v.split_once(':') {
                Some((r, target)) => Self::Symref(r.to_owned(), target.to_owned()),
                None => Self::Unknown(s.to_owned()),
            }
        } else {
            match s {
                "multi_ack" => Self::MultiAck,
                "multi_ack_detailed" => Self::MultiAckDetailed,
                "no-done" => Self::NoDone,
                "thin-pack" => Self::ThinPack,
                "side-band" => Self::SideBand,
                "side-band-64k" => Self::SideBand64k,
                "ofs-delta" => Self::OfsDelta,
                "shallow" => Self::Shallow,
                "deepen-since" => Self::DeepenSince,
                "deepen-not" => Self::DeepenNot,
                "no-progress" => Self::NoProgress,
                "include-tag" => Self::IncludeTag,
                "report-status" => Self::ReportStatus,
                "delete-refs" => Self::DeleteRefs,
                "quiet" => Self::Quiet,
                "atomic" => Self::Atomic,
                "push-options" => Self::PushOptions,
                "allow-tip-sha1-in-want" => Self::AllowTipSha1InWant,
                "allow-reachable-sha1-in-want" => Self::AllowReachableSha1InWant,
                _ => Self::Unknown(s.to_owned()),
            }
        })
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(v) => write!(f, "agent={}", v),
            Self::PushCert(v) => write!(f, "push-cert={}", v),
            Self::Symref(r, t) => write!(f, "symref={}:{}", r, t),
            Self::Unknown(s) => f.write_str(s),
            other => f.write_str(other.tag()),
        }
    }
}

/// The set of capabilities in play for one conversation: either what a
/// server advertised, or what a client intends to assert.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    entries: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new(entries: Vec<Capability>) -> Self {
        Self { entries }
    }

    /// Parses the space-separated capability string that follows the NUL on
    /// the first advertised ref (v1 format).
    pub fn parse(caps_str: &str) -> Self {
        let entries = caps_str
            .split_whitespace()
            .map(|tok| tok.parse().unwrap())
            .collect();
        Self { entries }
    }

    pub fn has(&self, tag: &str) -> bool {
        self.entries.iter().any(|c| c.tag() == tag)
    }

    pub fn get<'a>(&'a self, tag: &str) -> Option<&'a Capability> {
        self.entries.iter().find(|c| c.tag() == tag)
    }

    pub fn agent(&self) -> Option<&str> {
        match self.get("agent") {
            Some(Capability::Agent(v)) => Some(v),
            _ => None,
        }
    }

    pub fn symref_target(&self, name: &str) -> Option<&str> {
        self.entries.iter().find_map(|c| match c {
            Capability::Symref(r, target) if r == name => Some(target.as_str()),
            _ => None,
        })
    }

    pub fn entries(&self) -> &[Capability] {
        &self.entries
    }

    pub fn iter_tags(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|c| c.tag())
    }

    /// The intersection of `self` (what the server advertised) and
    /// `requested` (what the client would like to assert), honoring the
    /// asymmetric `side-band`/`side-band-64k` rule: at most one of the two
    /// is kept, preferring `side-band-64k`.
    pub fn intersect_requested(&self, requested: &[Capability]) -> CapabilitySet {
        let mut out = Vec::new();
        let mut sideband_chosen = false;
        for cap in requested {
            if !self.has(cap.tag()) {
                continue;
            }
            match cap {
                Capability::SideBand64k => {
                    if !sideband_chosen {
                        out.push(cap.clone());
                        sideband_chosen = true;
                    }
                }
                Capability::SideBand => {
                    if !sideband_chosen {
                        // only take plain side-band if 64k isn't also being requested
                        if !requested.iter().any(|c| matches!(c, Capability::SideBand64k)) {
                            out.push(cap.clone());
                            sideband_chosen = true;
                        }
                    }
                }
                other => out.push(other.clone()),
            }
        }
        CapabilitySet::new(out)
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// set-equality ignoring order, used by the canonicalization property
    /// test
    pub fn tag_set(&self) -> BTreeSet<String> {
        self.entries.iter().map(|c| c.to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandMode {
    None,
    Band,
    Band64k,
}

impl SidebandMode {
    /// maximum payload size a data frame on this band may carry
    pub fn max_frame_payload(self) -> usize {
        match self {
            Self::None => usize::MAX,
            Self::Band => 999,
            Self::Band64k => 65519,
        }
    }
}

pub fn select_sideband(caps: &CapabilitySet) -> SidebandMode {
    if caps.has("side-band-64k") {
        SidebandMode::Band64k
    } else if caps.has("side-band") {
        SidebandMode::Band
    } else {
        SidebandMode::None
    }
}

/// Builds the client's requested capability list for a fetch, preferring
/// `multi_ack_detailed` but falling back to plain `multi_ack` for older
/// servers, and to no multi_ack at all if neither is advertised.
pub fn negotiate_fetch_capabilities(server: &CapabilitySet, agent: &str) -> Vec<Capability> {
    let mut want = Vec::new();
    if server.has("multi_ack_detailed") {
        want.push(Capability::MultiAckDetailed);
    } else if server.has("multi_ack") {
        want.push(Capability::MultiAck);
    }
    if server.has("side-band-64k") {
        want.push(Capability::SideBand64k);
    } else if server.has("side-band") {
        want.push(Capability::SideBand);
    }
    if server.has("ofs-delta") {
        want.push(Capability::OfsDelta);
    }
    if server.has("thin-pack") {
        want.push(Capability::ThinPack);
    }
    if server.has("no-done") {
        want.push(Capability::NoDone);
    }
    if server.has("include-tag") {
        want.push(Capability::IncludeTag);
    }
    want.push(Capability::Agent(agent.to_owned()));
    want
}

pub fn negotiate_push_capabilities(server: &CapabilitySet, agent: &str) -> Vec<Capability> {
    let mut want = Vec::new();
    if server.has("report-status") {
        want.push(Capability::ReportStatus);
    }
    if server.has("ofs-delta") {
        want.push(Capability::OfsDelta);
    }
    if server.has("side-band-64k") {
        want.push(Capability::SideBand64k);
    }
    if server.has("atomic") {
        want.push(Capability::Atomic);
    }
    want.push(Capability::Agent(agent.to_owned()));
    want
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_capability_line() {
        let caps = CapabilitySet::parse(
            "multi_ack thin-pack side-band side-band-64k ofs-delta symref=HEAD:refs/heads/main agent=git/2.39.0",
        );
        assert!(caps.has("multi_ack"));
        assert!(caps.has("side-band-64k"));
        assert_eq!(caps.agent(), Some("git/2.39.0"));
        assert_eq!(caps.symref_target("HEAD"), Some("refs/heads/main"));
    }

    #[test]
    fn unknown_capability_round_trips() {
        let caps = CapabilitySet::parse("filter=blob:none");
        assert_eq!(caps.render(), "filter=blob:none");
    }

    #[test]
    fn select_sideband_prefers_64k() {
        let caps = CapabilitySet::parse("side-band side-band-64k");
        assert_eq!(select_sideband(&caps), SidebandMode::Band64k);
    }

    #[test]
    fn intersect_requested_keeps_only_advertised() {
        let server = CapabilitySet::parse("ofs-delta side-band-64k");
        let requested = vec![
            Capability::OfsDelta,
            Capability::ThinPack,
            Capability::SideBand64k,
        ];
        let effective = server.intersect_requested(&requested);
        assert!(effective.has("ofs-delta"));
        assert!(effective.has("side-band-64k"));
        assert!(!effective.has("thin-pack"));
    }

    #[test]
    fn intersect_requested_picks_one_sideband() {
        let server = CapabilitySet::parse("side-band side-band-64k");
        let requested = vec![Capability::SideBand, Capability::SideBand64k];
        let effective = server.intersect_requested(&requested);
        assert_eq!(effective.entries().len(), 1);
        assert!(effective.has("side-band-64k"));
    }

    #[test]
    fn negotiate_prefers_multi_ack_detailed() {
        let server = CapabilitySet::parse("multi_ack multi_ack_detailed ofs-delta");
        let requested = negotiate_fetch_capabilities(&server, "gitsync/0.1");
        assert!(requested.contains(&Capability::MultiAckDetailed));
        assert!(!requested.contains(&Capability::MultiAck));
    }

    #[test]
    fn negotiate_falls_back_to_plain_multi_ack() {
        let server = CapabilitySet::parse("multi_ack ofs-delta");
        let requested = negotiate_fetch_capabilities(&server, "gitsync/0.1");
        assert!(requested.contains(&Capability::MultiAck));
    }
}
