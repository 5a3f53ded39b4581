use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use sgpc_sw::cache::{CacheStorage, SqliteStorage};
use sgpc_sw::config::Config;
use sgpc_sw::host::LocalHost;
use sgpc_sw::http::{CacheRequest, Method};
use sgpc_sw::net::HttpFetcher;
use sgpc_sw::{FetchOutcome, InstallOutcome, OfflineAgent};

#[derive(Parser, Debug)]
#[command(name = "sgpc-sw")]
#[command(about = "Offline cache agent for the SGPC web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sgpc-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database (default: <data dir>/sgpc-sw/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Pre-cache the asset list into the current bucket
  Install,
  /// Delete every bucket except the current one
  Activate,
  /// Run a request through the fetch interceptor
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// List buckets and their entry counts
  Buckets,
  /// List cached URLs in a bucket (default: current)
  Entries { bucket: Option<String> },
}

fn init_logging(log_dir: Option<&Path>) -> WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (writer, guard) = match log_dir {
    Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "sgpc-sw.log")),
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(log_dir.is_none())
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_dir.as_deref());

  let config = Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(database) = args.db {
    Config {
      database: Some(database),
      ..config
    }
  } else {
    config
  };

  let storage = Arc::new(SqliteStorage::open_at(&config.database_path()?)?);

  match args.command {
    Cmd::Install => {
      let network = Arc::new(HttpFetcher::new()?);
      let agent = OfflineAgent::new(&config, storage, network, Arc::new(LocalHost::new()))?;
      match agent.install().await {
        InstallOutcome::Installed { assets } => {
          println!("installed {} assets into {}", assets, agent.cache_name())
        }
        InstallOutcome::Failed { reason } => println!("install failed: {}", reason),
      }
    }
    Cmd::Activate => {
      let network = Arc::new(HttpFetcher::new()?);
      let agent = OfflineAgent::new(&config, storage, network, Arc::new(LocalHost::new()))?;
      let deleted = agent.activate().await?;
      if deleted.is_empty() {
        println!("no stale caches");
      }
      for name in deleted {
        println!("deleted {}", name);
      }
    }
    Cmd::Fetch { url, method } => {
      let network = Arc::new(HttpFetcher::new()?);
      let agent = OfflineAgent::new(&config, storage, network, Arc::new(LocalHost::activated()))?;
      let method: Method = method.parse()?;
      let request = CacheRequest::parse(method, &url, agent.scope())?;

      match agent.handle_fetch(&request).await {
        FetchOutcome::Passthrough => println!("passthrough"),
        FetchOutcome::Unresolved => println!("unresolved"),
        FetchOutcome::Respond { response, source } => {
          println!(
            "{} {} {:?} {} bytes",
            response.status,
            response.status_text,
            source,
            response.body.len()
          );
        }
      }
    }
    Cmd::Buckets => {
      for name in storage.keys()? {
        let marker = if name == config.cache_name { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.entries(&name)?.len());
      }
    }
    Cmd::Entries { bucket } => {
      let bucket = bucket.unwrap_or_else(|| config.cache_name.clone());
      if !storage.has(&bucket)? {
        return Err(eyre!("No cache bucket named {}", bucket));
      }
      for entry in storage.entries(&bucket)? {
        println!(
          "{} {} {} {} {}",
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
          entry.status,
          entry.method,
          entry.size,
          entry.url
        );
      }
    }
  }

  Ok(())
}
