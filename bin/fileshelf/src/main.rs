//! fileshelf - replicated file shelf node and CLI
//!
//! `serve` runs a node with the HTTP download adapter. The other
//! subcommands open the local shelf, join the bus as a follower, perform
//! one operation and exit.

mod http;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fileshelf_common::{Config, FileId, FileRef, Metadata, NodeMode};
use fileshelf_files::{Criteria, FileService, SaveRequest};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fileshelf")]
#[command(about = "Replicated file shelf")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/fileshelf/fileshelf.toml")]
    config: PathBuf,

    /// Node role: primary, replica or no-sync
    #[arg(long, env = "FILESHELF_MODE")]
    mode: Option<NodeMode>,

    /// Node name used in logs
    #[arg(long)]
    node_name: Option<String>,

    /// Directory holding file bytes
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// SQLite index path
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a node and serve downloads over HTTP
    Serve {
        /// HTTP listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Store a local file under a slug
    Put {
        slug: String,
        /// File to upload; omit to store metadata only
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Metadata as name=value, repeatable
        #[arg(short, long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
        /// Update the file that already owns the slug
        #[arg(long)]
        update: bool,
    },
    /// Print a file's metadata, or write its bytes with --output
    Get {
        /// Slug, or id with --id
        file: String,
        /// Treat FILE as an id
        #[arg(long)]
        id: bool,
        /// Write bytes to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List files matching a JSON criteria document
    Ls {
        /// e.g. '{"filter":{"metadata":{"tag":"x"}}}'
        criteria: Option<String>,
    },
    /// Remove a file by id
    Rm { id: String },
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got {s:?}")),
    }
}

/// Defaults, then the config file, then `FILESHELF__*` variables, then flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.as_path()).required(false))
        .add_source(
            config::Environment::with_prefix("FILESHELF")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(mode) = args.mode {
        config.node.mode = mode;
    }
    if let Some(name) = &args.node_name {
        config.node.name.clone_from(name);
    }
    if let Some(path) = &args.storage_path {
        config.storage.storage_path.clone_from(path);
    }
    if let Some(path) = &args.database_path {
        config.storage.database_path.clone_from(path);
    }
    Ok(config)
}

async fn open(config: Config) -> Result<FileService> {
    let bus = fileshelf_bus::connect(&config.bus)
        .await
        .context("failed to connect to message bus")?;
    info!(bus = bus.name(), exchange = %config.bus.exchange, "connected to message bus");
    Ok(FileService::open(config, bus).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(&args)?;
    info!(config = %args.config.display(), node = %config.node.name, "configuration loaded");

    match args.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.http.listen = listen;
            }
            serve(config).await
        }
        Commands::Put {
            slug,
            file,
            meta,
            update,
        } => {
            // One-shot commands never claim the work queue or bootstrap
            config.node.mode = NodeMode::NoSync;
            let files = open(config).await?;
            let mut request = SaveRequest::new(slug).with_metadata(meta.into_iter().collect::<Metadata>());
            if let Some(path) = file {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                request = request.with_data(data);
            }
            if update {
                request = request.update_matching_slug();
            }
            let record = files.save(request).await?;
            println!("{}", record.id);
            files.close();
            Ok(())
        }
        Commands::Get { file, id, output } => {
            config.node.mode = NodeMode::NoSync;
            let files = open(config).await?;
            let file = if id {
                FileRef::Id(FileId::parse(&file)?)
            } else {
                FileRef::Slug(file)
            };
            let record = files.get(file, output.is_some()).await?;
            if let Some(path) = output {
                let data = record.data.clone().unwrap_or_default();
                tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(path = %path.display(), bytes = data.len(), "file written");
            }
            println!("{}", serde_json::to_string_pretty(&record)?);
            files.close();
            Ok(())
        }
        Commands::Ls { criteria } => {
            config.node.mode = NodeMode::NoSync;
            let criteria: Criteria = match criteria {
                Some(json) => serde_json::from_str(&json).context("invalid criteria JSON")?,
                None => Criteria::all(),
            };
            let files = open(config).await?;
            let records = files.list(&criteria).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            files.close();
            Ok(())
        }
        Commands::Rm { id } => {
            config.node.mode = NodeMode::NoSync;
            let files = open(config).await?;
            files.rm(&id).await?;
            files.close();
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let listen = config.http.listen;
    let prefix = config.http.prefix.clone();
    if !prefix.starts_with('/') {
        bail!("http prefix {prefix:?} must start with '/'");
    }

    info!(mode = %config.node.mode, "Starting fileshelf node");
    let files = Arc::new(open(config).await?);
    if let Some(endpoint) = files.coordinator().snapshot_endpoint() {
        info!(%endpoint, "serving snapshots to replicas");
    }

    let app = http::router(files.clone(), &prefix);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, %prefix, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    files.close();
    info!("fileshelf node shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta() {
        assert_eq!(parse_meta("tag=x").unwrap(), ("tag".into(), "x".into()));
        assert_eq!(parse_meta("k=a=b").unwrap(), ("k".into(), "a=b".into()));
        assert_eq!(parse_meta("empty=").unwrap(), ("empty".into(), String::new()));
        assert!(parse_meta("novalue").is_err());
        assert!(parse_meta("=x").is_err());
    }

    #[test]
    fn test_flags_override_missing_config_file() {
        let args = Args::parse_from([
            "fileshelf",
            "--config",
            "/nonexistent/fileshelf.toml",
            "--mode",
            "replica",
            "--database-path",
            "/tmp/index.db",
            "ls",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.node.mode, NodeMode::Replica);
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/index.db"));
        assert_eq!(config.http.prefix, "/dbfiles/");
    }

    #[test]
    fn test_config_file_is_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fileshelf.toml");
        std::fs::write(
            &path,
            r#"
[node]
name = "shelf-1"
mode = "primary"

[writer]
replicate_blobs = true

[bus.backend]
kind = "loopback"
"#,
        )
        .unwrap();

        let args = Args::parse_from(["fileshelf", "--config", path.to_str().unwrap(), "ls"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.node.name, "shelf-1");
        assert_eq!(config.node.mode, NodeMode::Primary);
        assert!(config.writer.replicate_blobs);
        assert_eq!(config.bus.exchange, "fileshelf");
    }
}
