//! Reference CLI front-end for `gitsync-core`. Not part of the protocol
//! engine itself — just a thin driver wiring a `git://` TCP transport and
//! an on-disk loose-object store to the high-level operations in
//! `gitsync_core::ops`.

mod fsstore;
mod giturl;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fsstore::FsStore;
use gitsync_core::error::GitSyncError;
use gitsync_core::hash::Hash;
use gitsync_core::ops::{self, Command};
use gitsync_core::refs::RefName;
use gitsync_core::store::ObjectStore;
use gitsync_core::ClientConfig;
use giturl::GitUrl;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gitsync", about = "Git Smart protocol client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List refs and capabilities advertised by a remote, then disconnect.
    Ls { uri: String },
    /// Clone every ref from a remote into a fresh directory.
    Clone { uri: String, dir: Option<PathBuf> },
    /// Fetch every ref the remote advertises into an existing directory.
    FetchAll {
        uri: String,
        #[arg(short = 'C', default_value = ".")]
        dir: PathBuf,
    },
    /// Fetch a single ref by its remote name.
    FetchOne {
        uri: String,
        refname: String,
        #[arg(short = 'C', default_value = ".")]
        dir: PathBuf,
    },
    /// Push one or more local branches to a remote.
    Push {
        uri: String,
        #[arg(required = true)]
        refs: Vec<String>,
        #[arg(short = 'C', default_value = ".")]
        dir: PathBuf,
    },
}

fn main() {
    env_logger::builder().parse_env("GITSYNC_LOG").init();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("failed to start the tokio runtime");
    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<GitSyncError>() {
        Some(e) if !e.is_fatal() => 1,
        _ => 2,
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = ClientConfig::default();
    match cli.command {
        Commands::Ls { uri } => {
            let url = GitUrl::parse(&uri)?;
            let mut transport = giturl::connect_upload_pack(&url).await?;
            let advertisement = ops::ls(&mut transport).await?;
            for r in &advertisement.refs {
                println!("{}\t{}", r.hash, r.name);
            }
            Ok(0)
        }
        Commands::Clone { uri, dir } => {
            let url = GitUrl::parse(&uri)?;
            let dir = dir.unwrap_or_else(|| default_clone_dir(&url));
            if dir.exists() && dir.read_dir()?.next().is_some() {
                bail!("`{}` already exists and is not empty", dir.display());
            }
            let store = FsStore::open(&dir).context("creating the local object store")?;
            let mut transport = giturl::connect_upload_pack(&url).await?;
            let report = ops::clone(&mut transport, &store, &config).await?;
            print_fetch_report(&report);
            Ok(0)
        }
        Commands::FetchAll { uri, dir } => {
            let url = GitUrl::parse(&uri)?;
            let store = FsStore::open(&dir).context("opening the local object store")?;
            let mut transport = giturl::connect_upload_pack(&url).await?;
            let report = ops::fetch_all(&mut transport, &store, &config).await?;
            print_fetch_report(&report);
            Ok(0)
        }
        Commands::FetchOne { uri, refname, dir } => {
            let url = GitUrl::parse(&uri)?;
            let store = FsStore::open(&dir).context("opening the local object store")?;
            let mut transport = giturl::connect_upload_pack(&url).await?;
            let report =
                ops::fetch_one(&mut transport, &store, &config, &RefName::new(refname)).await?;
            print_fetch_report(&report);
            Ok(0)
        }
        Commands::Push { uri, refs, dir } => {
            let url = GitUrl::parse(&uri)?;
            let store = FsStore::open(&dir).context("opening the local object store")?;
            let mut transport = giturl::connect_receive_pack(&url).await?;

            let mut local = Vec::new();
            for refname in &refs {
                let name = RefName::new(format!("refs/heads/{}", refname));
                let hash = store
                    .read_ref(&name)
                    .await
                    .with_context(|| format!("reading local ref `{}`", name))?
                    .ok_or_else(|| anyhow::anyhow!("no local ref `{}`", name))?;
                local.push((name, hash));
            }
            let haves: Vec<Hash> =
                store.list_refs().await?.into_iter().map(|(_, hash)| hash).collect();

            let results = ops::push(&mut transport, &store, &config, |advertisement| {
                let commands = local
                    .iter()
                    .map(|(name, new)| {
                        match advertisement.find(name.as_str()).map(|r| r.hash) {
                            Some(old) if old.is_zero() => Command::Create(*new, name.clone()),
                            Some(old) => Command::Update(old, *new, name.clone()),
                            None => Command::Create(*new, name.clone()),
                        }
                    })
                    .collect();
                (haves, commands)
            })
            .await?;

            let mut any_rejected = false;
            for result in &results {
                match result {
                    ops::PushRefResult::Ok(name) => println!("ok\t{}", name),
                    ops::PushRefResult::Rejected(name, reason) => {
                        any_rejected = true;
                        println!("ng\t{}\t{}", name, reason);
                    }
                }
            }
            Ok(if any_rejected { 1 } else { 0 })
        }
    }
}

fn print_fetch_report(report: &ops::FetchSomeReport) {
    for (name, hash) in &report.updated {
        println!("updated\t{}\t{}", name, hash);
    }
    for (name, hash) in &report.pending {
        println!("pending\t{}\t{}", name, hash);
    }
}

fn default_clone_dir(url: &GitUrl) -> PathBuf {
    let leaf = url.path.rsplit('/').next().unwrap_or("repository");
    PathBuf::from(leaf.strip_suffix(".git").unwrap_or(leaf))
}
