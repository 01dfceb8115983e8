//! High-level operations: `ls`, `fetch` and its thin layers, `push`.
//!
//! These are the only entry points that combine capability negotiation,
//! the want/have round trip and pack transfer into a single conversation;
//! everything below here (`negotiate`, `pack`, `sideband`, `transport`) is
//! usable on its own by a caller that wants finer control.

use crate::advertisement::{parse_advertisement_lines, Advertisement};
use crate::capability::{
    self, negotiate_fetch_capabilities, negotiate_push_capabilities, select_sideband,
    CapabilitySet,
};
use crate::config::ClientConfig;
use crate::error::{GitSyncError, GitSyncResult};
use crate::hash::Hash;
use crate::negotiate::{self, AckMode, DeepenSpec, HaveAllRefsNegotiator, Negotiator, ShallowUpdate};
use crate::pack::{self, PackEntry, ReadPackOutcome};
use crate::pktline::PktLine;
use crate::refs::RefName;
use crate::sideband::SidebandDemux;
use crate::store::ObjectStore;
use crate::transport::ByteTransport;
use futures::StreamExt;
use log::{debug, info};

/// the largest chunk a packfile is split into before being handed to
/// `ByteTransport::write_data`, staying under the pkt-line frame cap.
const PACK_FRAME_CHUNK: usize = 65500;

/// One push command, `Command` entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create(Hash, RefName),
    Delete(Hash, RefName),
    Update(Hash, Hash, RefName),
}

impl Command {
    fn old_new(&self) -> (Hash, Hash) {
        match self {
            Self::Create(new, _) => (Hash::ZERO, *new),
            Self::Delete(old, _) => (*old, Hash::ZERO),
            Self::Update(old, new, _) => (*old, *new),
        }
    }

    fn refname(&self) -> &RefName {
        match self {
            Self::Create(_, r) | Self::Delete(_, r) | Self::Update(_, _, r) => r,
        }
    }
}

/// The server's per-ref verdict from a push's `report-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushRefResult {
    Ok(RefName),
    Rejected(RefName, String),
}

/// Result of `fetch_some`/`fetch_all`/`fetch_one`/`clone`: which ref
/// updates were applied, and which were left untouched because the
/// store's current value had already moved past the negotiated
/// have-frontier (`update_and_create`'s partial-success contract).
#[derive(Debug, Clone, Default)]
pub struct FetchSomeReport {
    pub updated: Vec<(RefName, Hash)>,
    pub pending: Vec<(RefName, Hash)>,
}

/// Advertisement only, then the caller is expected to close the
/// conversation.
pub async fn ls(transport: &mut dyn ByteTransport) -> GitSyncResult<Advertisement> {
    read_advertisement(transport).await
}

/// Runs `want` against the advertisement; an empty result short-circuits
/// with `Ok(ReadPackOutcome { object_count: 0, hashes: vec![] })` and no
/// further bytes are exchanged. Otherwise negotiates and
/// receives the pack, but does **not** touch the store's refs — callers
/// that want ref bookkeeping use `fetch_some`/`fetch_all`/`fetch_one`.
///
/// Reads the advertisement itself, so it assumes a persistent transport
/// (`read_frame` already yields the advertisement's pkt-lines). A caller
/// driving a stateless-HTTP transport fetches the advertisement separately
/// via `transport::http::HttpTransport::fetch_advertisement` and calls
/// `fetch_with_advertisement` instead.
///
/// `deepen`, if given, narrows the history the server includes; `notify` is
/// invoked exactly once with the resulting `shallow`/`unshallow` boundaries
/// when `deepen` is `Some`, and never invoked otherwise (a plain maintenance
/// `shallow` line with no `deepen*` elicits no such response).
pub async fn fetch<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    want: impl FnOnce(&Advertisement) -> Vec<Hash>,
    shallow: &[Hash],
    deepen: Option<DeepenSpec>,
    negotiator: &mut dyn Negotiator,
    on_progress: &mut dyn FnMut(&[u8]),
    notify: &mut dyn FnMut(ShallowUpdate),
) -> GitSyncResult<ReadPackOutcome> {
    let advertisement = read_advertisement(transport).await?;
    fetch_with_advertisement(
        transport,
        store,
        config,
        &advertisement,
        want,
        shallow,
        deepen,
        negotiator,
        on_progress,
        notify,
    )
    .await
}

/// Same as `fetch`, but takes an already-parsed advertisement, for callers
/// (namely stateless-HTTP ones) that fetched it outside of this
/// conversation's `ByteTransport` phase.
pub async fn fetch_with_advertisement<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    advertisement: &Advertisement,
    want: impl FnOnce(&Advertisement) -> Vec<Hash>,
    shallow: &[Hash],
    deepen: Option<DeepenSpec>,
    negotiator: &mut dyn Negotiator,
    on_progress: &mut dyn FnMut(&[u8]),
    notify: &mut dyn FnMut(ShallowUpdate),
) -> GitSyncResult<ReadPackOutcome> {
    let wants = want(advertisement);
    if wants.is_empty() {
        return Ok(ReadPackOutcome { object_count: 0, hashes: Vec::new() });
    }
    receive(
        transport,
        store,
        config,
        advertisement,
        wants,
        shallow,
        deepen,
        negotiator,
        on_progress,
        notify,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn receive<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    advertisement: &Advertisement,
    wants: Vec<Hash>,
    shallow: &[Hash],
    deepen: Option<DeepenSpec>,
    negotiator: &mut dyn Negotiator,
    on_progress: &mut dyn FnMut(&[u8]),
    notify: &mut dyn FnMut(ShallowUpdate),
) -> GitSyncResult<ReadPackOutcome> {
    let allow_any_hash = advertisement.capabilities.has("allow-tip-sha1-in-want")
        || advertisement.capabilities.has("allow-reachable-sha1-in-want");
    if !allow_any_hash {
        for hash in &wants {
            if !advertisement.refs.iter().any(|r| r.hash == *hash) {
                return Err(GitSyncError::WantNotAdvertised(*hash));
            }
        }
    }

    let requested = negotiate_fetch_capabilities(&advertisement.capabilities, &config.agent);
    let effective = advertisement.capabilities.intersect_requested(&requested);
    debug!("fetch: {} want(s), capabilities={}", wants.len(), effective.render());

    let mut wants_iter = wants.iter();
    let first = wants_iter.next().expect("checked non-empty by caller");
    transport
        .write_data(format!("want {} {}\n", first, effective.render()).as_bytes())
        .await?;
    for hash in wants_iter {
        transport.write_data(format!("want {}\n", hash).as_bytes()).await?;
    }
    for hash in shallow {
        transport.write_data(format!("shallow {}\n", hash).as_bytes()).await?;
    }
    if let Some(spec) = &deepen {
        negotiate::write_deepen(transport, spec).await?;
    }
    transport.write_flush().await?;
    transport.end_phase().await?;

    if deepen.is_some() {
        let update = negotiate::read_shallow_update(transport).await?;
        notify(update);
    }

    let ack_mode = AckMode::from_capabilities(&effective);
    negotiate::negotiate(transport, ack_mode, effective.has("no-done"), negotiator).await?;

    let sideband_mode = select_sideband(&effective);
    let pack_bytes = if sideband_mode == capability::SidebandMode::None {
        // Real upload-pack sends unframed raw bytes in this case, which the
        // `ByteTransport` abstraction (pkt-line framed by construction) has
        // no way to read; every server this crate talks to is expected to
        // advertise at least plain `side-band` (see DESIGN.md).
        return Err(GitSyncError::MalformedFrame(
            "remote advertised neither side-band nor side-band-64k; \
             unframed pack reception is not supported"
                .into(),
        ));
    } else {
        let mut demux = SidebandDemux::new(transport, sideband_mode);
        demux.drain_to_vec(on_progress).await?
    };

    let outcome = pack::read_pack(std::io::Cursor::new(pack_bytes), store, config.pack_reader).await?;
    info!("fetch: received {} object(s)", outcome.object_count);
    Ok(outcome)
}

async fn local_have_hashes<S: ObjectStore>(store: &S) -> GitSyncResult<Vec<Hash>> {
    Ok(store
        .list_refs()
        .await
        .map_err(GitSyncError::store)?
        .into_iter()
        .map(|(_, hash)| hash)
        .collect())
}

/// Applies the negotiated targets to the store's refs: a ref with no
/// local entry is created outright; a
/// ref whose current value is exactly the negotiated have-frontier is
/// fast-forwarded; anything else (the local store moved since the
/// negotiation started) is left alone and reported as `pending`.
async fn update_and_create<S: ObjectStore>(
    store: &S,
    targets: &[(RefName, Hash)],
    have_frontier: &[Hash],
) -> GitSyncResult<FetchSomeReport> {
    let mut updated = Vec::new();
    let mut pending = Vec::new();
    for (name, hash) in targets {
        match store.read_ref(name).await.map_err(GitSyncError::store)? {
            None => {
                store.write_ref(name, *hash).await.map_err(GitSyncError::store)?;
                updated.push((name.clone(), *hash));
            }
            Some(current) if current == *hash => updated.push((name.clone(), *hash)),
            Some(current) if have_frontier.contains(&current) => {
                store.write_ref(name, *hash).await.map_err(GitSyncError::store)?;
                updated.push((name.clone(), *hash));
            }
            Some(_) => pending.push((name.clone(), *hash)),
        }
    }
    Ok(FetchSomeReport { updated, pending })
}

async fn fetch_refs<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    select: impl Fn(&Advertisement) -> Vec<(RefName, Hash)>,
) -> GitSyncResult<FetchSomeReport> {
    let advertisement = read_advertisement(transport).await?;
    fetch_refs_with_advertisement(transport, store, config, &advertisement, select).await
}

async fn fetch_refs_with_advertisement<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    advertisement: &Advertisement,
    select: impl Fn(&Advertisement) -> Vec<(RefName, Hash)>,
) -> GitSyncResult<FetchSomeReport> {
    let targets = select(advertisement);
    if targets.is_empty() {
        return Ok(FetchSomeReport::default());
    }

    let local_tips = local_have_hashes(store).await?;
    let wants: Vec<Hash> = targets.iter().map(|(_, hash)| *hash).collect();
    let mut negotiator = HaveAllRefsNegotiator::new(local_tips.clone());

    receive(
        transport,
        store,
        config,
        advertisement,
        wants,
        &[],
        None,
        &mut negotiator,
        &mut |_| {},
        &mut |_| {},
    )
    .await?;

    update_and_create(store, &targets, &local_tips).await
}

/// Fetches exactly the refs named in `remote_refs`, by their remote names.
pub async fn fetch_some<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    remote_refs: &[RefName],
) -> GitSyncResult<FetchSomeReport> {
    fetch_refs(transport, store, config, |advertisement| {
        remote_refs
            .iter()
            .filter_map(|name| advertisement.find(name.as_str()).map(|r| (name.clone(), r.hash)))
            .collect()
    })
    .await
}

/// Same as `fetch_some`, for a caller (stateless-HTTP) that already has the
/// advertisement in hand.
pub async fn fetch_some_with_advertisement<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    advertisement: &Advertisement,
    remote_refs: &[RefName],
) -> GitSyncResult<FetchSomeReport> {
    fetch_refs_with_advertisement(transport, store, config, advertisement, |advertisement| {
        remote_refs
            .iter()
            .filter_map(|name| advertisement.find(name.as_str()).map(|r| (name.clone(), r.hash)))
            .collect()
    })
    .await
}

/// Fetches a single remote ref.
pub async fn fetch_one<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    remote_ref: &RefName,
) -> GitSyncResult<FetchSomeReport> {
    fetch_some(transport, store, config, std::slice::from_ref(remote_ref)).await
}

/// Fetches every ref the server advertised.
pub async fn fetch_all<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
) -> GitSyncResult<FetchSomeReport> {
    fetch_refs(transport, store, config, |advertisement| {
        advertisement.refs.iter().map(|r| (r.name.clone(), r.hash)).collect()
    })
    .await
}

/// Fetches every ref from an empty store: identical to `fetch_all` since
/// an empty store has no local tips to negotiate with and every ref is
/// freshly created.
pub async fn clone<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
) -> GitSyncResult<FetchSomeReport> {
    fetch_all(transport, store, config).await
}

/// Collects the objects reachable from `roots` that aren't already
/// reachable from `exclude_roots`, for a thin push pack: the server's
/// `haves` are assumed present on the remote, so nothing reachable from
/// them needs to be sent.
async fn collect_pack_entries<S: ObjectStore>(
    store: &S,
    roots: &[Hash],
    exclude_roots: &[Hash],
) -> GitSyncResult<Vec<PackEntry>> {
    let mut exclude = std::collections::HashSet::new();
    {
        let mut stream = store.reachable_from(exclude_roots);
        while let Some(hash) = stream.next().await {
            exclude.insert(hash.map_err(GitSyncError::store)?);
        }
    }

    let mut entries = Vec::new();
    let mut stream = store.reachable_from(roots);
    while let Some(hash) = stream.next().await {
        let hash = hash.map_err(GitSyncError::store)?;
        if exclude.contains(&hash) {
            continue;
        }
        let (kind, bytes) = store.read_object(hash).await.map_err(GitSyncError::store)?;
        entries.push(PackEntry { hash, kind, bytes });
    }
    Ok(entries)
}

/// Performs a push: advertisement, caller-supplied `(haves, commands)`,
/// command list, thin pack, then `report-status` parsed into a per-ref
/// result list.
pub async fn push<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    push_fn: impl FnOnce(&Advertisement) -> (Vec<Hash>, Vec<Command>),
) -> GitSyncResult<Vec<PushRefResult>> {
    let advertisement = read_advertisement(transport).await?;
    push_with_advertisement(transport, store, config, &advertisement, push_fn).await
}

/// Same as `push`, for a caller (stateless-HTTP) that already has the
/// advertisement in hand.
pub async fn push_with_advertisement<S: ObjectStore>(
    transport: &mut dyn ByteTransport,
    store: &S,
    config: &ClientConfig,
    advertisement: &Advertisement,
    push_fn: impl FnOnce(&Advertisement) -> (Vec<Hash>, Vec<Command>),
) -> GitSyncResult<Vec<PushRefResult>> {
    let (haves, commands) = push_fn(advertisement);
    if commands.is_empty() {
        debug!("push: no commands, nothing to do");
        return Ok(Vec::new());
    }
    info!("push: {} command(s)", commands.len());

    for cmd in &commands {
        if matches!(cmd, Command::Delete(..)) && !advertisement.capabilities.has("delete-refs") {
            return Err(GitSyncError::DeleteRefsNotSupported(cmd.refname().clone()));
        }
    }

    let requested = negotiate_push_capabilities(&advertisement.capabilities, &config.agent);
    let effective = advertisement.capabilities.intersect_requested(&requested);

    let mut commands_iter = commands.iter();
    let first = commands_iter.next().expect("checked non-empty above");
    let (old, new) = first.old_new();
    transport
        .write_data(
            format!("{} {} {}\0{}\n", old, new, first.refname(), effective.render()).as_bytes(),
        )
        .await?;
    for cmd in commands_iter {
        let (old, new) = cmd.old_new();
        transport.write_data(format!("{} {} {}\n", old, new, cmd.refname()).as_bytes()).await?;
    }
    transport.write_flush().await?;

    let new_hashes: Vec<Hash> = commands
        .iter()
        .map(|c| c.old_new().1)
        .filter(|hash| !hash.is_zero())
        .collect();
    let entries = collect_pack_entries(store, &new_hashes, &haves).await?;
    if !entries.is_empty() {
        let pack_bytes = pack::write_pack(&entries, config.pack_writer);
        for chunk in pack_bytes.chunks(PACK_FRAME_CHUNK) {
            transport.write_data(chunk).await?;
        }
    }
    transport.end_phase().await?;

    if !effective.has("report-status") {
        return Ok(commands.iter().map(|c| PushRefResult::Ok(c.refname().clone())).collect());
    }
    parse_report_status(transport, &effective).await
}

async fn parse_report_status(
    transport: &mut dyn ByteTransport,
    effective: &CapabilitySet,
) -> GitSyncResult<Vec<PushRefResult>> {
    let sideband_mode = select_sideband(effective);
    let lines = if sideband_mode == capability::SidebandMode::None {
        read_until_flush(transport).await?
    } else {
        let mut demux = SidebandDemux::new(transport, sideband_mode);
        let raw = demux.drain_to_vec(&mut |_| {}).await?;
        let mut reader = crate::pktline::PktLineReader::new(std::io::Cursor::new(raw));
        reader.read_until_flush().await?
    };
    parse_report_status_lines(&lines)
}

fn parse_report_status_lines(lines: &[Vec<u8>]) -> GitSyncResult<Vec<PushRefResult>> {
    let mut iter = lines.iter();
    let unpack_line = iter
        .next()
        .ok_or_else(|| GitSyncError::MalformedFrame("missing `unpack` status line".into()))?;
    let unpack_text = std::str::from_utf8(unpack_line)
        .map_err(|_| GitSyncError::MalformedFrame("non-utf8 unpack status line".into()))?
        .trim_end_matches('\n');
    if let Some(reason) = unpack_text.strip_prefix("unpack ") {
        if reason != "ok" {
            return Err(GitSyncError::RemoteError(format!("unpack failed: {}", reason)));
        }
    } else {
        return Err(GitSyncError::MalformedFrame(format!(
            "expected `unpack ...`, got `{}`",
            unpack_text
        )));
    }

    let mut results = Vec::new();
    for line in iter {
        let text = std::str::from_utf8(line)
            .map_err(|_| GitSyncError::MalformedFrame("non-utf8 report-status line".into()))?
            .trim_end_matches('\n');
        if let Some(rest) = text.strip_prefix("ok ") {
            results.push(PushRefResult::Ok(RefName::new(rest)));
        } else if let Some(rest) = text.strip_prefix("ng ") {
            let (refname, reason) = rest.split_once(' ').unwrap_or((rest, "unknown reason"));
            results.push(PushRefResult::Rejected(RefName::new(refname), reason.to_owned()));
        } else {
            return Err(GitSyncError::MalformedFrame(format!(
                "malformed report-status ref line `{}`",
                text
            )));
        }
    }
    Ok(results)
}

async fn read_until_flush(transport: &mut dyn ByteTransport) -> GitSyncResult<Vec<Vec<u8>>> {
    let mut lines = Vec::new();
    loop {
        match transport.read_frame().await? {
            PktLine::Flush => return Ok(lines),
            PktLine::Data(data) => lines.push(data),
            other => {
                return Err(GitSyncError::MalformedFrame(format!(
                    "unexpected {:?} while reading a v1 section",
                    other
                )))
            }
        }
    }
}

async fn read_advertisement(transport: &mut dyn ByteTransport) -> GitSyncResult<Advertisement> {
    let lines = read_until_flush(transport).await?;
    parse_advertisement_lines(&lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use crate::store::ObjectKind;
    use crate::transport::persistent::PersistentTransport;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn h(n: u8) -> Hash {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Hash::new(bytes)
    }

    fn advertisement_bytes(hash: Hash, name: &str, caps: &str) -> Vec<u8> {
        let mut buf = crate::pktline::encode_data(
            format!("{} {}\0{}\n", hash, name, caps).as_bytes(),
        );
        buf.extend(crate::pktline::encode_flush());
        buf
    }

    #[tokio::test]
    async fn ls_returns_empty_refs_for_no_refs_advertisement() {
        let (client, mut server) = duplex(4096);
        let mut transport = PersistentTransport::new(client);
        let bytes = advertisement_bytes(Hash::ZERO, "capabilities^{}", "multi_ack side-band-64k");
        tokio::spawn(async move {
            server.write_all(&bytes).await.unwrap();
        });

        let advert = ls(&mut transport).await.unwrap();
        assert!(advert.refs.is_empty());
        assert!(advert.capabilities.has("side-band-64k"));
    }

    #[tokio::test]
    async fn fetch_with_empty_want_short_circuits() {
        let (client, mut server) = duplex(4096);
        let mut transport = PersistentTransport::new(client);
        let bytes = advertisement_bytes(h(1), "refs/heads/main", "multi_ack side-band-64k");
        tokio::spawn(async move {
            server.write_all(&bytes).await.unwrap();
        });

        let store = MemStore::new();
        let config = ClientConfig::default();
        let mut negotiator = HaveAllRefsNegotiator::new(vec![]);
        let outcome = fetch(
            &mut transport,
            &store,
            &config,
            |_advertisement| vec![],
            &[],
            None,
            &mut negotiator,
            &mut |_| {},
            &mut |_| {},
        )
        .await
        .unwrap();
        assert_eq!(outcome.object_count, 0);
        assert!(outcome.hashes.is_empty());
    }

    #[tokio::test]
    async fn fetch_with_deepen_invokes_notify_once() {
        let (client, mut server) = duplex(4096);
        let mut transport = PersistentTransport::new(client);
        let advert_bytes = advertisement_bytes(h(1), "refs/heads/main", "multi_ack side-band-64k");
        let mut shallow_block = crate::pktline::encode_data(format!("shallow {}\n", h(9)).as_bytes());
        shallow_block.extend(crate::pktline::encode_flush());
        shallow_block.extend(b"0008NAK\n0000".to_vec());
        tokio::spawn(async move {
            server.write_all(&advert_bytes).await.unwrap();
            server.write_all(&shallow_block).await.unwrap();
        });

        let store = MemStore::new();
        let config = ClientConfig::default();
        let mut negotiator = HaveAllRefsNegotiator::new(vec![]);
        let mut notifications = Vec::new();
        let outcome = fetch(
            &mut transport,
            &store,
            &config,
            |advertisement| vec![advertisement.refs[0].hash],
            &[],
            Some(DeepenSpec::Depth(1)),
            &mut negotiator,
            &mut |_| {},
            &mut |update| notifications.push(update),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].shallow, vec![h(9)]);
    }

    #[tokio::test]
    async fn push_with_no_commands_is_a_noop() {
        let (client, mut server) = duplex(4096);
        let mut transport = PersistentTransport::new(client);
        let bytes = advertisement_bytes(h(1), "refs/heads/main", "report-status");
        tokio::spawn(async move {
            server.write_all(&bytes).await.unwrap();
        });

        let store = MemStore::new();
        let config = ClientConfig::default();
        let results = push(&mut transport, &store, &config, |_advertisement| (vec![], vec![]))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn fetch_some_skips_refs_not_in_advertisement() {
        let (client, mut server) = duplex(4096);
        let mut transport = PersistentTransport::new(client);
        let bytes = advertisement_bytes(h(1), "refs/heads/main", "multi_ack side-band-64k");
        tokio::spawn(async move {
            server.write_all(&bytes).await.unwrap();
        });

        let store = MemStore::new();
        let _ = store.write_object(ObjectKind::Blob, b"unused").await;
        let config = ClientConfig::default();
        let report =
            fetch_some(&mut transport, &store, &config, &[RefName::new("refs/heads/missing")])
                .await
                .unwrap();
        assert!(report.updated.is_empty());
        assert!(report.pending.is_empty());
    }
}
