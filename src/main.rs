//! Command line interface for operating the event store. Supports
//! initialization, ingesting events, filter queries and counts, deletions,
//! reindexing and signature verification.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use hamerkop::{config::Settings, Event, Filter, SaveOutcome, Store};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "hamerkop", author, version, about = "Nostr event store")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Log at debug level unless `LOG_LEVEL` says otherwise.
    #[arg(long, short)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Save one or more event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Print matching events as newline-delimited JSON.
    Query {
        /// NIP-01 filter as JSON.
        #[arg(default_value = "{}")]
        filter: String,
    },
    /// Print the number of matching events.
    Count {
        /// NIP-01 filter as JSON.
        #[arg(default_value = "{}")]
        filter: String,
    },
    /// Apply a kind-5 deletion without storing the deletion record.
    Delete {
        /// Path to the deletion event.
        file: String,
    },
    /// Rebuild the index from stored payloads, dropping superseded ones.
    Reindex,
    /// Verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    init_tracing(cfg.log_level.as_deref(), cli.verbose);

    if let Commands::Init = cli.command {
        // Create the on-disk directory structure.
        for dir in ["events", "deleted", "deleted-addr"] {
            fs::create_dir_all(cfg.store_root.join(dir))?;
        }
        info!(root = %cfg.store_root.display(), "initialized");
        return Ok(());
    }

    let store = Store::open_dir(cfg.store_root.clone(), cfg.store_options())?;
    match cli.command {
        Commands::Init => {}
        Commands::Ingest { files } => {
            // Keep going past bad files and report them all at the end.
            let mut failed = 0;
            for f in &files {
                match ingest_file(&store, f) {
                    Ok(outcome) => info!(file = %f, ?outcome, "ingested"),
                    Err(e) => {
                        warn!(file = %f, error = %e, "rejected");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} events rejected", files.len());
            }
        }
        Commands::Query { filter } => {
            let filter = parse_filter(&filter)?;
            let mut events = store.query_events(&filter);
            while let Some(ev) = events.next().await {
                println!("{}", serde_json::to_string(ev.as_ref())?);
            }
        }
        Commands::Count { filter } => {
            let filter = parse_filter(&filter)?;
            println!("{}", store.count_events(&filter));
        }
        Commands::Delete { file } => {
            let ev = read_event(&file)?;
            for id in store.delete_event(&ev)? {
                println!("{id}");
            }
        }
        Commands::Reindex => {
            // Opening the store already rebuilt the index.
            println!("{}", store.len());
        }
        Commands::Verify { sample } => {
            // Randomly verify Schnorr signatures for `sample` events.
            let checked = store.verify_sample(sample)?;
            info!(checked = checked, "verified");
        }
    }
    Ok(())
}

fn ingest_file(store: &Store, path: &str) -> anyhow::Result<SaveOutcome> {
    let ev = read_event(path)?;
    Ok(store.save_event(&ev)?)
}

fn read_event(path: &str) -> anyhow::Result<Event> {
    let data = fs::read(path).with_context(|| format!("reading {path}"))?;
    Ok(hamerkop::codec::decode(&data)?)
}

fn parse_filter(json: &str) -> anyhow::Result<Filter> {
    serde_json::from_str(json).context("parsing filter")
}

/// Route `tracing` output to stderr so stdout stays machine readable.
fn init_tracing(level: Option<&str>, verbose: bool) {
    let directive = level.unwrap_or(if verbose { "debug" } else { "info" });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("hamerkop-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("UNTIL_INCLUSIVE=0\n");
    content.push_str("LOCK_SHARDS=64\n");
    content.push_str("LOG_LEVEL=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hamerkop::{codec, Tag};
    use secp256k1::{Keypair, Message, Secp256k1};
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "STORE_ROOT",
        "VERIFY_SIG",
        "UNTIL_INCLUSIVE",
        "LOCK_SHARDS",
        "LOG_LEVEL",
    ];

    fn clear_vars() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir) -> String {
        let env_path = dir.path().join(".env");
        let content = format!("STORE_ROOT={}\nVERIFY_SIG=1\n", dir.path().to_str().unwrap());
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn signed(kind: u16, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|t| Tag(t.into_iter().map(String::from).collect()))
                .collect(),
            content: String::new(),
            sig: String::new(),
        };
        let hash = codec::event_hash(&ev).unwrap();
        ev.id = hex::encode(hash);
        let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(hash), &kp);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }

    fn write_event(dir: &TempDir, name: &str, ev: &Event) -> String {
        let path = dir.path().join(name);
        fs::write(&path, serde_json::to_string(ev).unwrap()).unwrap();
        path.to_str().unwrap().into()
    }

    fn cli(env: &str, command: Commands) -> Cli {
        Cli {
            env: env.into(),
            verbose: false,
            command,
        }
    }

    #[tokio::test]
    async fn run_init_ingest_delete_reindex_verify() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);

        run(cli(&env_file, Commands::Init)).await.unwrap();
        assert!(dir.path().join("events").exists());

        let note = signed(1, 10, vec![]);
        let note_path = write_event(&dir, "note.json", &note);
        run(cli(
            &env_file,
            Commands::Ingest {
                files: vec![note_path],
            },
        ))
        .await
        .unwrap();

        let del = signed(5, 20, vec![vec!["e", &note.id]]);
        let del_path = write_event(&dir, "del.json", &del);
        run(cli(&env_file, Commands::Delete { file: del_path }))
            .await
            .unwrap();

        run(cli(&env_file, Commands::Reindex)).await.unwrap();
        let store = Store::open_dir(dir.path(), Default::default()).unwrap();
        assert!(store.get_event(&note.id).is_none());
        drop(store);

        run(cli(&env_file, Commands::Verify { sample: 10 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ingest_reports_rejected_files() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);

        let good = signed(1, 1, vec![]);
        let mut bad = signed(1, 2, vec![]);
        bad.content = "tampered".into();
        let files = vec![
            write_event(&dir, "good.json", &good),
            write_event(&dir, "bad.json", &bad),
        ];
        let err = run(cli(&env_file, Commands::Ingest { files }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 2"));

        // the good file still made it in
        let store = Store::open_dir(dir.path(), Default::default()).unwrap();
        assert!(store.get_event(&good.id).is_some());
    }

    #[tokio::test]
    async fn delete_requires_kind_five() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);
        let path = write_event(&dir, "note.json", &signed(1, 1, vec![]));
        assert!(run(cli(&env_file, Commands::Delete { file: path }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(cli(&env_path.to_string_lossy(), Commands::Init))
            .await
            .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected_root = dir.path().join("hamerkop-data");
        assert!(data.contains(&format!("STORE_ROOT={}", expected_root.to_string_lossy())));
        assert!(data.contains("VERIFY_SIG=1"));
        assert!(data.contains("UNTIL_INCLUSIVE=0"));
        assert!(expected_root.join("events").exists());
        assert!(expected_root.join("deleted-addr").exists());
    }

    #[test]
    fn filters_parse_from_json() {
        let filter = parse_filter(r##"{"kinds":[1],"#t":["news"],"limit":5}"##).unwrap();
        assert_eq!(filter.kinds, Some(vec![1]));
        assert_eq!(filter.limit, Some(5));
        assert!(parse_filter("not json").is_err());
    }
}
