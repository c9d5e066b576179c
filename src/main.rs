use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dsync::chain;
use dsync::dataset::{Commit, Dataset, Meta, Structure};
use dsync::remote::{Peer, PeerSyncClient, ProcessPeer, SyncClient};
use dsync::{remove_n_versions_from_store, Config, DatasetResolver, Repo, VersionInfo};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dsync", version, about = "Versioned datasets with peer sync")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "DSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Serve one peer request for the repo at this directory on stdin/stdout
    #[arg(long, value_name = "REPO_DIR")]
    server: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Commit a body file as the new head of a dataset
    Save {
        name: String,
        /// Body file (.json or .csv)
        #[arg(long)]
        body: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Show the version history of a reference
    Log { reference: String },
    /// Remove the most recent versions of a reference (-1 removes all)
    Remove {
        reference: String,
        #[arg(short, long, allow_negative_numbers = true)]
        n: i64,
    },
    /// Mark a reference as published (listed in feeds)
    Publish {
        reference: String,
        #[arg(long)]
        undo: bool,
    },
    /// Rebuild the resolution cache from the reference table
    RebuildCache,
    /// Replicate a local reference to a peer
    Push {
        reference: String,
        #[arg(long, value_name = "[USER@]HOST:DIR | DIR")]
        peer: String,
        #[arg(long, value_name = "SECS")]
        deadline: Option<u64>,
    },
    /// Fetch a reference from a peer
    Pull {
        reference: String,
        #[arg(long)]
        peer: String,
        #[arg(long, value_name = "SECS")]
        deadline: Option<u64>,
    },
    /// List a peer's feeds
    Feeds {
        #[arg(long)]
        peer: String,
        /// Only this feed
        #[arg(long)]
        name: Option<String>,
    },
    /// Fetch a peer's dataset head with a truncated body
    Preview {
        reference: String,
        #[arg(long)]
        peer: String,
    },
    /// Ask a peer to remove the most recent versions of a reference
    RemoveRemote {
        reference: String,
        #[arg(short, long, allow_negative_numbers = true)]
        n: i64,
        #[arg(long)]
        peer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the peer protocol in server mode
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(dir) = cli.server {
        let config = server_config(&dir)?;
        let repo = Arc::new(Repo::open(&config)?);
        let peer = Peer::from_config(repo, &config);
        peer.serve_stdio().await?;
        return Ok(());
    }

    let Some(command) = cli.command else {
        bail!("no command given (see --help)");
    };
    let config = load_config(cli.config.as_deref())?;
    let repo = Arc::new(Repo::open(&config)?);

    match command {
        Command::Save {
            name,
            body,
            title,
            message,
        } => {
            let data = std::fs::read(&body).with_context(|| format!("reading {}", body.display()))?;
            let format = match body.extension().and_then(|e| e.to_str()) {
                Some("csv") => "csv",
                _ => "json",
            };
            let ds = Dataset {
                commit: Some(Commit {
                    title: title.clone().unwrap_or_default(),
                    message: message.unwrap_or_default(),
                    ..Default::default()
                }),
                meta: title.map(|title| Meta {
                    title,
                    ..Default::default()
                }),
                structure: Some(Structure::infer(format, &data)),
                body: Some(data),
                ..Default::default()
            };
            let saved = repo.save(&name, ds).await?;
            println!("{}", saved);
        }
        Command::Log { reference } => {
            let (_, info) = DatasetResolver::for_repo(&repo).resolve(&reference)?;
            let head = info
                .path
                .with_context(|| format!("{}/{} has no versions", info.username, info.name))?;
            for entry in chain::log(repo.store().as_ref(), &head)? {
                let when = chrono::DateTime::<chrono::Utc>::from_timestamp(entry.commit.timestamp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "{}  {}  {:>10}  {}",
                    entry.path, when, entry.body_size, entry.commit.title
                );
            }
        }
        Command::Remove { reference, n } => {
            let (mut r, info) = DatasetResolver::for_repo(&repo).resolve(&reference)?;
            if r.path.is_none() {
                r.path = info.path;
            }
            let out = remove_n_versions_from_store(Some(repo.as_ref()), &r, n).await?;
            match out.path {
                Some(_) => println!("{}", out),
                None => println!("removed all versions of {}", out.alias()),
            }
        }
        Command::Publish { reference, undo } => {
            let (r, _) = DatasetResolver::for_repo(&repo).resolve(&reference)?;
            let info = repo.set_published(&r, !undo).await?;
            print_info(&info);
        }
        Command::RebuildCache => {
            let count = repo
                .cache()
                .rebuild(repo.store().as_ref(), &repo.refs().list())?;
            repo.cache().persist()?;
            println!("cached {} references", count);
        }
        Command::Push {
            reference,
            peer,
            deadline,
        } => {
            let done = client(&repo, &config, &peer, deadline)?
                .add_dataset(&reference)
                .await?;
            println!(
                "pushed {} blocks ({} bytes), peer head {}",
                done.blocks,
                done.bytes,
                done.head.map(|h| h.to_string()).unwrap_or_default()
            );
        }
        Command::Pull {
            reference,
            peer,
            deadline,
        } => {
            let info = client(&repo, &config, &peer, deadline)?
                .pull_dataset(&reference)
                .await?;
            print_info(&info);
        }
        Command::Feeds { peer, name } => {
            let client = client(&repo, &config, &peer, None)?;
            let feeds = match name {
                Some(name) => {
                    let feed = client.feed(&name).await?;
                    [(name, feed)].into_iter().collect()
                }
                None => client.feeds().await?,
            };
            for (name, infos) in feeds {
                println!("{}:", name);
                for info in &infos {
                    print_info(info);
                }
            }
        }
        Command::Preview { reference, peer } => {
            let ds = client(&repo, &config, &peer, None)?
                .preview(&reference)
                .await?;
            println!("{}", serde_json::to_string_pretty(&preview_json(&ds))?);
        }
        Command::RemoveRemote { reference, n, peer } => {
            let head = client(&repo, &config, &peer, None)?
                .remove_versions(&reference, n)
                .await?;
            match head {
                Some(head) => println!("peer head is now {}", head),
                None => println!("peer removed all versions"),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::default_path().context("no config directory on this platform")?,
    };
    debug!("loading config from {:?}", path);
    Config::load(&path).with_context(|| format!("loading config {}", path.display()))
}

/// `<repo-dir>/config.toml` if present, else the user's config. The store
/// root is always the given directory.
fn server_config(dir: &Path) -> Result<Config> {
    let local = dir.join("config.toml");
    let mut config = if local.is_file() {
        load_config(Some(&local))?
    } else {
        load_config(None)?
    };
    config.repo.path = Some(dir.to_path_buf());
    if !local.is_file() {
        config.repo.cache_file = None;
    }
    Ok(config)
}

fn client(
    repo: &Arc<Repo>,
    config: &Config,
    peer: &str,
    deadline: Option<u64>,
) -> Result<PeerSyncClient<ProcessPeer>> {
    let transport = ProcessPeer::parse(peer)?;
    let mut client = PeerSyncClient::from_config(Arc::clone(repo), transport, config);
    if let Some(secs) = deadline {
        client = client.with_deadline(Duration::from_secs(secs));
    }
    Ok(client)
}

fn print_info(info: &VersionInfo) {
    println!(
        "{}/{}@{}  {}  {} versions{}{}",
        info.username,
        info.name,
        info.path.map(|p| p.to_string()).unwrap_or_default(),
        info.meta_title,
        info.num_versions,
        if info.published { "  published" } else { "" },
        if info.foreign { "  foreign" } else { "" },
    );
}

fn preview_json(ds: &Dataset) -> serde_json::Value {
    serde_json::json!({
        "name": ds.name,
        "peername": ds.peername,
        "path": ds.path.map(|p| p.to_string()),
        "commit": ds.commit,
        "meta": ds.meta,
        "structure": ds.structure,
        "body": ds.body.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()),
    })
}
