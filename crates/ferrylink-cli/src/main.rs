//! Ferrylink CLI - issue requests and downloads through the ferrylink pipeline.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ferrylink::config::PathsConfig;
use ferrylink::network::{DownloadManager, DownloadProgress, ReqwestTransport};
use ferrylink::{CancellationToken, ClientConfig, Request, RequestPipeline};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "ferrylink")]
#[command(about = "Resilient HTTP requests and resumable downloads")]
struct Args {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the cache database, offline queue and resume tokens
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// GET a path and print the JSON response
    Get {
        path: String,

        /// Base URL the path is resolved against
        #[arg(long)]
        base_url: Option<String>,

        /// Query parameter as name=value (repeatable)
        #[arg(long = "query", value_name = "NAME=VALUE")]
        query: Vec<String>,

        /// Header as name:value (repeatable)
        #[arg(long = "header", value_name = "NAME:VALUE")]
        header: Vec<String>,

        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Download a URL to a file, resuming an earlier partial transfer
    Download {
        url: String,
        destination: PathBuf,

        /// Ignore any saved partial transfer and start from byte zero
        #[arg(long)]
        restart: bool,
    },
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ferrylink={}", level)));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    let root = match &args.storage_root {
        Some(root) => root.clone(),
        None => PathsConfig::default_root()?,
    };
    Ok(config.with_storage_root(&root))
}

fn parse_pair(raw: &str, separator: char, what: &str) -> Result<(String, String)> {
    match raw.split_once(separator) {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("invalid {} '{}', expected NAME{}VALUE", what, raw, separator),
    }
}

async fn run_get(
    mut config: ClientConfig,
    path: String,
    base_url: Option<String>,
    query: Vec<String>,
    header: Vec<String>,
    no_cache: bool,
) -> Result<()> {
    if base_url.is_some() {
        config.base_url = base_url;
    }
    let pipeline = RequestPipeline::from_config(config)?;

    let mut request = Request::get(path);
    for raw in &query {
        let (name, value) = parse_pair(raw, '=', "query")?;
        request = request.with_query(name, value);
    }
    for raw in &header {
        let (name, value) = parse_pair(raw, ':', "header")?;
        request = request.with_header(name, value);
    }
    if no_cache {
        request = request.with_cache(false);
    }

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let body: serde_json::Value = pipeline.request_with_cancel(request, &cancel).await?;
    watcher.abort();

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn run_download(
    config: ClientConfig,
    url: String,
    destination: &Path,
    restart: bool,
) -> Result<()> {
    let transport = Arc::new(ReqwestTransport::with_options(config.timeout, &config.user_agent)?);
    let manager = DownloadManager::new(transport, config.download_state_dir.as_deref());

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());

    let (tx, mut rx) = mpsc::channel::<DownloadProgress>(64);
    let reporter = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            let fraction: f64 = progress.fraction();
            match progress.total_bytes {
                Some(total) => eprintln!(
                    "{:>6.2}%  {}/{} bytes  {:.1} KiB/s",
                    fraction * 100.0,
                    progress.bytes_downloaded,
                    total,
                    progress.speed_bytes_per_sec / 1024.0
                ),
                None => eprintln!("{} bytes", progress.bytes_downloaded),
            }
        }
    });

    let token = if restart { None } else { manager.resume_token(&url) };
    let result = match token {
        Some(token) if token.destination.as_path() == destination => {
            info!("Resuming {} from byte {}", url, token.bytes_downloaded);
            manager.download_resumed(&token, Some(tx), &cancel).await
        }
        Some(token) => {
            warn!(
                "Saved partial transfer targets {}, starting over",
                token.destination.display()
            );
            manager.download(&url, destination, Some(tx), &cancel).await
        }
        None => manager.download(&url, destination, Some(tx), &cancel).await,
    };
    watcher.abort();
    let _ = reporter.await;

    let bytes = result?;
    println!("{} ({} bytes)", destination.display(), bytes);
    Ok(())
}

fn cancel_on_ctrl_c(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    let config = load_config(&args)?;

    match args.command {
        Command::Get {
            path,
            base_url,
            query,
            header,
            no_cache,
        } => run_get(config, path, base_url, query, header, no_cache).await,
        Command::Download {
            url,
            destination,
            restart,
        } => run_download(config, url, &destination, restart).await,
    }
}
