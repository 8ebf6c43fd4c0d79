use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::io;
use std::path::PathBuf;
use tfhfs_castore::blockstore::BlockStore;
use tfhfs_castore::forest::{EntryTarget, Forest, ForestOptions, CONTENT_LABEL, MAX_READ_SIZE};
use tokio::io::AsyncWriteExt;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    /// Default log level, `RUST_LOG` takes precedence.
    #[arg(long)]
    log_level: Option<Level>,

    #[arg(long, env = "TFHFS_STORE", default_value = "sled:///var/lib/tfhfs")]
    store: String,

    /// Leave unset for an unencrypted store.
    #[arg(long, env = "TFHFS_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists a directory.
    Ls {
        #[clap(value_name = "PATH", default_value = "/")]
        path: String,
    },
    /// Writes a file's content to stdout.
    Cat {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Copies a local file into the forest.
    Put {
        #[clap(value_name = "SOURCE")]
        source: PathBuf,
        #[clap(value_name = "PATH")]
        path: String,
    },
    Mkdir {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Removes a file, or a directory with everything below it.
    Rm {
        #[clap(value_name = "PATH")]
        path: String,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Merges the content of another store into this one.
    Sync {
        /// Address of the other store. It must use the same passphrase.
        #[arg(long)]
        remote: String,

        /// Name the merge base is recorded under, defaults to the address.
        #[arg(long)]
        peer: Option<String>,
    },
    /// Reclaims unreferenced blocks of a shared store.
    Gc,
    /// Checks every stored block.
    Fsck {
        /// Recount all references and drop unreachable blocks. No other
        /// process may use the store meanwhile.
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    Create { name: String },
    List,
    Delete { name: String },
}

fn entry_kind(target: &EntryTarget) -> char {
    match target {
        EntryTarget::Directory(_) => 'd',
        EntryTarget::File { .. } => '-',
        EntryTarget::Symlink(_) => 'l',
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // configure log settings
    let level = cli.log_level.unwrap_or(Level::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(if cli.json {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(io::stderr)
                    .json(),
            )
        } else {
            None
        })
        .with(if !cli.json {
            Some(tracing_subscriber::fmt::Layer::new().with_writer(io::stderr))
        } else {
            None
        });

    tracing::subscriber::set_global_default(subscriber)
        .context("unable to set global subscriber")?;

    let passphrase = cli.passphrase.as_deref().map(str::as_bytes);
    let store = BlockStore::open(&cli.store, passphrase)
        .await
        .with_context(|| format!("opening store {}", cli.store))?;
    let forest = Forest::open(store.clone(), ForestOptions::default()).await?;

    match cli.command {
        Commands::Ls { path } => {
            let entries: Vec<_> = forest.readdir(&path).await?.try_collect().await?;
            let mut out = String::new();
            for (name, entry) in entries {
                out.push_str(&format!(
                    "{}{:04o} {:>12} {:>12} {}\n",
                    entry_kind(&entry.target),
                    entry.meta.mode & 0o7777,
                    entry.size(),
                    entry.meta.mtime,
                    name
                ));
            }
            tokio::io::stdout().write_all(out.as_bytes()).await?;
        }
        Commands::Cat { path } => {
            let handle = forest.open_file(&path).await?;
            let mut stdout = tokio::io::stdout();
            let mut offset = 0;
            let copied = async {
                while offset < handle.size() {
                    let chunk = handle.read_at(offset, MAX_READ_SIZE).await?;
                    stdout.write_all(&chunk).await?;
                    offset += chunk.len() as u64;
                }
                stdout.flush().await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;
            handle.close().await?;
            copied?;
        }
        Commands::Put { source, path } => {
            let data = tokio::fs::read(&source)
                .await
                .with_context(|| format!("reading {}", source.display()))?;
            forest.write_file(&path, &data, None).await?;
            info!(path = %path, len = data.len(), "stored file");
        }
        Commands::Mkdir { path } => forest.mkdir(&path, None).await?,
        Commands::Rm { path } => forest.remove(&path).await?,
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Create { name } => {
                let root = forest.snapshot(&name).await?;
                println!("{} {}", name, root);
            }
            SnapshotCommands::List => {
                for snapshot in forest.snapshots().await? {
                    println!(
                        "{} {} {}",
                        snapshot.name, snapshot.timestamp, snapshot.root
                    );
                }
            }
            SnapshotCommands::Delete { name } => forest.delete_snapshot(&name).await?,
        },
        Commands::Sync { remote, peer } => {
            let remote_store = BlockStore::open(&remote, passphrase)
                .await
                .with_context(|| format!("opening remote store {}", remote))?;
            let remote_root = remote_store.resolve_root(CONTENT_LABEL).await?;
            let peer = peer.unwrap_or_else(|| remote.clone());

            let outcome = forest.sync_from(&remote_store, &remote_root, &peer).await?;
            for path in &outcome.deferred {
                warn!(path = %path, "remote copy is unreadable, kept the local version");
            }
            println!(
                "merged {} directories, took {} entries, kept {}, deleted {}, adopted {} blocks",
                outcome.stats.merged_dirs,
                outcome.stats.taken_remote,
                outcome.stats.kept_local,
                outcome.stats.deleted,
                outcome.adopted.len()
            );
        }
        Commands::Gc => {
            let report = store.gc().await?;
            println!("deleted {} blocks", report.deleted);
        }
        Commands::Fsck { repair } => {
            let report = store.verify().await?;
            for (id, e) in &report.failures {
                warn!(block.id = %id, error = %e, "block failed verification");
            }
            for label in &report.dangling_roots {
                warn!(label = %label, "label points at a missing block");
            }
            println!("checked {} blocks", report.checked);

            if repair {
                let rebuilt = store.rebuild_refcounts().await?;
                println!(
                    "{} reachable, {} refcounts rewritten, {} deleted, {} unreadable",
                    rebuilt.reachable,
                    rebuilt.rewritten,
                    rebuilt.deleted,
                    rebuilt.unreadable.len()
                );
            } else if !report.is_clean() {
                bail!(
                    "{} corrupt blocks, {} dangling labels",
                    report.failures.len(),
                    report.dangling_roots.len()
                );
            }
        }
    }

    forest.flush().await?;
    Ok(())
}
