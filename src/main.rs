//! companion-cache: operate a file-backed cache from the command line.
//!
//!   run      background loops (prefetch, flush, sweep) until Ctrl-C
//!   stats    queue status and metrics
//!   flush    replay the durable write queue once
//!   migrate  move items between two containers

use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing::info;

use companion_cache::cache::entry::SystemClock;
use companion_cache::cache::origin::NoOrigin;
use companion_cache::config::{Cli, Command, Config};
use companion_cache::storage::disk::FileStore;
use companion_cache::CacheRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "companion_cache=debug"
    } else {
        "companion_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("companion-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(dir) = cli.data_dir {
        config.store.data_dir = dir;
    }

    info!(
        data_dir = %config.store.data_dir.display(),
        default_policy = %config.store.default_policy,
        max_memory_bytes = config.store.max_memory_bytes,
        "Configuration loaded"
    );

    let durable = Arc::new(FileStore::open(config.store.data_dir.join("store")).await?);
    let command = cli.command.unwrap_or(Command::Run);

    if command == Command::Run {
        let runtime: CacheRuntime<Value> =
            CacheRuntime::start(config, durable, Arc::new(NoOrigin)).await?;
        info!("Running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        runtime.shutdown().await;
        return Ok(());
    }

    // One-shot commands: no background loops.
    let runtime: CacheRuntime<Value> =
        CacheRuntime::build(config, durable, Arc::new(NoOrigin), Arc::new(SystemClock)).await?;

    match command {
        Command::Stats => {
            let pending = runtime.queue().count().await?;
            let status = runtime.sync_status();
            println!("queue engine:    {}", status.engine);
            println!("queue pending:   {pending}");
            println!("last flush try:  {:?}", status.last_attempt_at);
            println!("last flush ok:   {:?}", status.last_success_at);
            print!("{}", runtime.metrics().render());
        }
        Command::Flush => {
            let report = runtime.flush_now().await?;
            println!(
                "flushed {} superseded {} failed {} dropped {}",
                report.flushed, report.superseded, report.failed, report.dropped
            );
        }
        Command::Migrate { from, to, items } => {
            let report = runtime.migrate(&items, &from, &to).await?;
            println!(
                "moved {:?} (already present: {:?}, not in source: {:?})",
                report.moved, report.already_present, report.not_in_source
            );
        }
        Command::Run => {}
    }

    Ok(())
}
