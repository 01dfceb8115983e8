//! Fetch negotiation: the want/have round trip that lets the client
//! tell the server exactly which objects it's missing without walking the
//! server's entire history.
//!
//! A single-shot strategy that sends every `have` in one batch followed by
//! `done` is correct but not bandwidth-optimal; `HaveAllRefsNegotiator`
//! below is exactly that, kept as the simple default. `CommitWalkNegotiator`
//! adds genuine incremental round-trip negotiation, the 32-have batching and
//! the `ready`/`continue`/`common` ack vocabulary, for callers that want it.

use crate::error::{GitSyncError, GitSyncResult};
use crate::hash::Hash;
use crate::transport::ByteTransport;
use log::trace;

const HAVES_PER_ROUND: usize = 32;
const MAX_ROUNDS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// no multi_ack capability: the server stays silent until `done`, then
    /// sends exactly one ACK or NAK.
    None,
    MultiAck,
    MultiAckDetailed,
}

impl AckMode {
    pub fn from_capabilities(caps: &crate::capability::CapabilitySet) -> Self {
        if caps.has("multi_ack_detailed") {
            Self::MultiAckDetailed
        } else if caps.has("multi_ack") {
            Self::MultiAck
        } else {
            Self::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// multi_ack(_detailed): this have is in the server's history; keep negotiating.
    Common(Hash),
    /// multi_ack_detailed only: the server has enough information to build a
    /// pack right now, even before `done` is sent.
    Ready(Hash),
    /// the plain, single, final ACK (no multi_ack in play).
    Final(Hash),
}

fn parse_ack_line(line: &[u8]) -> GitSyncResult<Option<Ack>> {
    let text = std::str::from_utf8(line)
        .map_err(|_| GitSyncError::MalformedFrame("non-utf8 negotiation line".into()))?
        .trim_end_matches('\n');
    if text == "NAK" {
        return Ok(None);
    }
    let rest = text
        .strip_prefix("ACK ")
        .ok_or_else(|| GitSyncError::MalformedFrame(format!("expected ACK/NAK, got `{}`", text)))?;
    let mut parts = rest.split(' ');
    let hash: Hash = parts.next().unwrap_or_default().parse()?;
    Ok(Some(match parts.next() {
        Some("continue") | Some("common") => Ack::Common(hash),
        Some("ready") => Ack::Ready(hash),
        Some(other) => {
            return Err(GitSyncError::MalformedFrame(format!("unknown ACK qualifier `{}`", other)))
        }
        None => Ack::Final(hash),
    }))
}

/// What a [`Negotiator`] wants to do with its next turn.
pub enum NegotiatorStep {
    /// send these haves and keep negotiating.
    Haves(Vec<Hash>),
    /// no more haves to offer; send `done` and accept whatever the server
    /// gives us.
    Exhausted,
}

/// A pluggable strategy for choosing which `have` lines to send each round.
/// Kept separate from the driver loop so a caller can swap in a strategy
/// that prunes already-common ancestors using its own commit graph.
pub trait Negotiator: Send {
    fn next_haves(&mut self, acked_common: &[Hash]) -> NegotiatorStep;
}

/// Sends every local ref tip as `have` in the first round, then `done`.
/// Correct but not bandwidth-optimal: it never prunes ancestors of an
/// already-acknowledged common commit, since it doesn't walk history at
/// all.
pub struct HaveAllRefsNegotiator {
    remaining: Vec<Hash>,
    sent_first_batch: bool,
}

impl HaveAllRefsNegotiator {
    pub fn new(local_tips: Vec<Hash>) -> Self {
        Self { remaining: local_tips, sent_first_batch: false }
    }
}

impl Negotiator for HaveAllRefsNegotiator {
    fn next_haves(&mut self, _acked_common: &[Hash]) -> NegotiatorStep {
        if self.sent_first_batch || self.remaining.is_empty() {
            return NegotiatorStep::Exhausted;
        }
        self.sent_first_batch = true;
        NegotiatorStep::Haves(std::mem::take(&mut self.remaining))
    }
}

/// Walks a caller-supplied commit order (typically a topo/date-order
/// traversal starting from local ref tips) `HAVES_PER_ROUND` commits at a
/// time, stopping early once the server has acknowledged a commit as
/// common — that commit's ancestors are assumed common too and are skipped.
pub struct CommitWalkNegotiator {
    order: std::collections::VecDeque<Hash>,
    parents_of: Box<dyn Fn(Hash) -> Vec<Hash> + Send>,
    skip: std::collections::HashSet<Hash>,
}

impl CommitWalkNegotiator {
    pub fn new(
        local_tips: Vec<Hash>,
        parents_of: impl Fn(Hash) -> Vec<Hash> + Send + 'static,
    ) -> Self {
        Self {
            order: local_tips.into(),
            parents_of: Box::new(parents_of),
            skip: std::collections::HashSet::new(),
        }
    }
}

impl Negotiator for CommitWalkNegotiator {
    fn next_haves(&mut self, acked_common: &[Hash]) -> NegotiatorStep {
        for &common in acked_common {
            if self.skip.insert(common) {
                for parent in (self.parents_of)(common) {
                    self.order.retain(|h| *h != parent);
                }
            }
        }

        let mut batch = Vec::with_capacity(HAVES_PER_ROUND);
        while batch.len() < HAVES_PER_ROUND {
            match self.order.pop_front() {
                Some(h) if self.skip.contains(&h) => continue,
                Some(h) => {
                    for parent in (self.parents_of)(h) {
                        if !self.skip.contains(&parent) {
                            self.order.push_back(parent);
                        }
                    }
                    batch.push(h);
                }
                None => break,
            }
        }

        if batch.is_empty() {
            NegotiatorStep::Exhausted
        } else {
            NegotiatorStep::Haves(batch)
        }
    }
}

/// A request to narrow the commit history the server includes, sent as a
/// single round-0 line right after the `want`s and any maintenance `shallow`
/// lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepenSpec {
    Depth(u32),
    Since(i64),
    Not(String),
}

impl DeepenSpec {
    fn render(&self) -> String {
        match self {
            Self::Depth(n) => format!("deepen {}\n", n),
            Self::Since(t) => format!("deepen-since {}\n", t),
            Self::Not(r) => format!("deepen-not {}\n", r),
        }
    }
}

/// The server's round-0 answer to a `deepen*` line: commits that became new
/// shallow boundaries, and previously-shallow boundaries it lifted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShallowUpdate {
    pub shallow: Vec<Hash>,
    pub unshallow: Vec<Hash>,
}

/// Writes a `deepen`/`deepen-since`/`deepen-not` line. Callers still own
/// writing the preceding `want`/maintenance-`shallow` lines and the
/// following flush.
pub async fn write_deepen(
    transport: &mut dyn ByteTransport,
    spec: &DeepenSpec,
) -> GitSyncResult<()> {
    transport.write_data(spec.render().as_bytes()).await
}

/// Reads the `shallow <h>` / `unshallow <h>` block a server sends in
/// response to a round-0 `deepen*` line, up to the terminating flush-pkt.
/// Only valid to call when a `DeepenSpec` was actually sent: a plain
/// maintenance `shallow <hash>` line with no `deepen*` elicits no response
/// at all.
pub async fn read_shallow_update(transport: &mut dyn ByteTransport) -> GitSyncResult<ShallowUpdate> {
    let mut update = ShallowUpdate::default();
    loop {
        match transport.read_frame().await? {
            crate::pktline::PktLine::Data(line) => {
                let text = std::str::from_utf8(&line)
                    .map_err(|_| GitSyncError::MalformedFrame("non-utf8 shallow line".into()))?
                    .trim_end_matches('\n');
                if let Some(rest) = text.strip_prefix("shallow ") {
                    update.shallow.push(rest.parse()?);
                } else if let Some(rest) = text.strip_prefix("unshallow ") {
                    update.unshallow.push(rest.parse()?);
                } else {
                    return Err(GitSyncError::MalformedFrame(format!(
                        "expected shallow/unshallow, got `{}`",
                        text
                    )));
                }
            }
            crate::pktline::PktLine::Flush => return Ok(update),
            other => {
                return Err(GitSyncError::MalformedFrame(format!(
                    "unexpected {:?} while reading the shallow update",
                    other
                )))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NegotiationResult {
    pub common: Vec<Hash>,
    /// true if the server signalled `ready` (multi_ack_detailed) before
    /// `done` was sent, meaning it can start sending the pack immediately.
    pub server_ready_early: bool,
}

/// Drives the want/have round trip to completion: sends batches
/// from `negotiator` until it reports `Exhausted`, interpreting ACKs
/// according to `mode`, and terminates on `done`, an early `ready`, or the
/// round safeguard.
pub async fn negotiate(
    transport: &mut dyn ByteTransport,
    mode: AckMode,
    no_done: bool,
    negotiator: &mut dyn Negotiator,
) -> GitSyncResult<NegotiationResult> {
    let mut common = Vec::new();
    let mut rounds = 0u32;

    loop {
        rounds += 1;
        if rounds > MAX_ROUNDS {
            return Err(GitSyncError::NegotiationStalled { rounds: MAX_ROUNDS });
        }

        match negotiator.next_haves(&common) {
            NegotiatorStep::Haves(batch) => {
                trace!("negotiate: round {} sending {} have(s)", rounds, batch.len());
                for hash in &batch {
                    transport.write_data(format!("have {}\n", hash).as_bytes()).await?;
                }
                transport.write_flush().await?;
                transport.end_phase().await?;

                if mode == AckMode::None {
                    // silent until done; keep sending haves.
                    continue;
                }

                let mut ready_early = false;
                loop {
                    match transport.read_frame().await? {
                        crate::pktline::PktLine::Data(line) => match parse_ack_line(&line)? {
                            Some(Ack::Common(h)) => common.push(h),
                            Some(Ack::Ready(h)) => {
                                common.push(h);
                                ready_early = true;
                                break;
                            }
                            Some(Ack::Final(h)) => {
                                common.push(h);
                                return Ok(NegotiationResult { common, server_ready_early: false });
                            }
                            None => break,
                        },
                        crate::pktline::PktLine::Flush => break,
                        other => {
                            return Err(GitSyncError::MalformedFrame(format!(
                                "unexpected {:?} during negotiation",
                                other
                            )))
                        }
                    }
                }
                if ready_early {
                    if !no_done {
                        send_done(transport).await?;
                    }
                    return Ok(NegotiationResult { common, server_ready_early: true });
                }
            }
            NegotiatorStep::Exhausted => {
                if !no_done {
                    send_done(transport).await?;
                }
                return finish_after_done(transport, mode, common).await;
            }
        }
    }
}

async fn send_done(transport: &mut dyn ByteTransport) -> GitSyncResult<()> {
    transport.write_data(b"done\n").await?;
    transport.end_phase().await
}

async fn finish_after_done(
    transport: &mut dyn ByteTransport,
    mode: AckMode,
    mut common: Vec<Hash>,
) -> GitSyncResult<NegotiationResult> {
    loop {
        match transport.read_frame().await? {
            crate::pktline::PktLine::Data(line) => match parse_ack_line(&line)? {
                Some(Ack::Common(h)) | Some(Ack::Ready(h)) => common.push(h),
                Some(Ack::Final(h)) => {
                    common.push(h);
                    return Ok(NegotiationResult { common, server_ready_early: false });
                }
                None => return Ok(NegotiationResult { common, server_ready_early: false }),
            },
            crate::pktline::PktLine::Flush if mode == AckMode::None => {
                return Ok(NegotiationResult { common, server_ready_early: false })
            }
            other => {
                return Err(GitSyncError::MalformedFrame(format!(
                    "unexpected {:?} while finishing negotiation",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::persistent::PersistentTransport;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn have_all_refs_negotiator_sends_once_then_done() {
        let h1: Hash = "1111111111111111111111111111111111111111".parse().unwrap();
        let (client, mut server) = duplex(8192);
        let mut transport = PersistentTransport::new(client);
        let mut negotiator = HaveAllRefsNegotiator::new(vec![h1]);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let n = server.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert!(sent.contains("have 1111111111111111111111111111111111111111"));
            assert!(sent.contains("done"));
            server.write_all(b"0008NAK\n0000").await.unwrap();
        });

        let result = negotiate(&mut transport, AckMode::None, false, &mut negotiator).await.unwrap();
        assert!(result.common.is_empty());
        server_task.await.unwrap();
    }

    #[test]
    fn parses_multi_ack_detailed_ready() {
        let ack = parse_ack_line(b"ACK 1111111111111111111111111111111111111111 ready\n")
            .unwrap()
            .unwrap();
        assert!(matches!(ack, Ack::Ready(_)));
    }

    #[test]
    fn parses_plain_nak() {
        assert!(parse_ack_line(b"NAK\n").unwrap().is_none());
    }

    #[test]
    fn have_all_refs_negotiator_is_exhausted_immediately_when_empty() {
        let mut negotiator = HaveAllRefsNegotiator::new(vec![]);
        assert!(matches!(negotiator.next_haves(&[]), NegotiatorStep::Exhausted));
    }

    #[tokio::test]
    async fn reads_shallow_update_block() {
        let h1: Hash = "1111111111111111111111111111111111111111".parse().unwrap();
        let h2: Hash = "2222222222222222222222222222222222222222".parse().unwrap();
        let (client, mut server) = duplex(4096);
        let mut transport = PersistentTransport::new(client);

        let mut bytes = crate::pktline::encode_data(format!("shallow {}\n", h1).as_bytes());
        bytes.extend(crate::pktline::encode_data(format!("unshallow {}\n", h2).as_bytes()));
        bytes.extend(crate::pktline::encode_flush());
        tokio::spawn(async move {
            server.write_all(&bytes).await.unwrap();
        });

        let update = read_shallow_update(&mut transport).await.unwrap();
        assert_eq!(update.shallow, vec![h1]);
        assert_eq!(update.unshallow, vec![h2]);
    }

    #[test]
    fn deepen_spec_renders_depth_line() {
        assert_eq!(DeepenSpec::Depth(1).render(), "deepen 1\n");
    }
}
