mod cache;
mod config;
mod http;
mod queue;
mod routes;
mod strategy;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::cache::SqliteStore;
use crate::config::WorkerConfig;
use crate::http::ReqwestFetcher;
use crate::queue::{HttpTaskExecutor, SyncQueue};
use crate::worker::{ClientMessage, OfflineWorker, WorkerReply, SYNC_TAG};

#[derive(Parser, Debug)]
#[command(name = "fitsync")]
#[command(about = "Offline cache and background sync engine for the FitSync tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fitsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Report namespace count and total cached bytes
  Status,
  /// Delete every cache namespace
  Clear,
  /// Replay queued mutations against their endpoints
  Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let config = WorkerConfig::load(args.config.as_deref())?;

  let store = Arc::new(SqliteStore::open_at(&config.cache_db_path()?)?);
  let fetcher = Arc::new(ReqwestFetcher::new()?);
  let queue = SyncQueue::open_at(&config.queue_db_path()?, config.max_retries)?;
  let (worker, _events) = OfflineWorker::new(config, store, Arc::clone(&fetcher), queue)?;

  match args.command {
    Command::Status => print_reply(worker.handle_message(ClientMessage::GetCacheStatus))?,
    Command::Clear => print_reply(worker.handle_message(ClientMessage::ClearCache))?,
    Command::Drain => {
      let executor = HttpTaskExecutor::new(fetcher);
      let report = worker.on_sync(SYNC_TAG, &executor).await?;
      println!(
        "completed: {}, left for retry: {}, abandoned: {}",
        report.completed, report.retried, report.abandoned
      );
    }
  }

  Ok(())
}

fn print_reply(reply: Option<WorkerReply>) -> Result<()> {
  if let Some(reply) = reply {
    println!("{}", serde_json::to_string_pretty(&reply)?);
  }
  Ok(())
}
