use clap::Parser;
use log::{LevelFilter, error, info};
use rangeload::cli::InteractiveMode;
use rangeload::progress::ProgressDisplay;
use rangeload::{
    PersistenceType, TransferConfig, TransferConfigBuilder, TransferError, TransferManager,
    TransferRequest, TransferStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rangeload")]
#[command(about = "A resumable, priority scheduled file downloader", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 3)]
    workers: usize,

    #[arg(short, long, value_name = "DIR", default_value = "downloads")]
    folder: PathBuf,

    /// SQLite file holding transfer state; in-memory when omitted.
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    #[arg(short, long, default_value_t = 0)]
    priority: i32,

    /// Resume transfers persisted by an earlier run.
    #[arg(short, long)]
    restore: bool,

    /// Exit once every transfer settles instead of reading commands from stdin.
    #[arg(long)]
    no_interactive: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(value_name = "URLS")]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), TransferError> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TransferConfig::from_file(path)?,
        None => TransferConfigBuilder::new()
            .folder(cli.folder.clone())
            .worker_threads(cli.workers)
            .persistence_type(match &cli.db {
                Some(path) => PersistenceType::Sqlite(path.clone()),
                None => PersistenceType::Memory,
            })
            .debug(cli.verbose)
            .build()?,
    };

    let log_level = if config.debug || cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .filter_module("sqlx::query", LevelFilter::Info)
        .init();

    info!(
        "Starting with {} workers into {}",
        config.worker_threads,
        config.folder.display()
    );

    let manager = TransferManager::from_config(config).await?;
    let display = Arc::new(ProgressDisplay::new());

    if cli.restore {
        for task in manager.restore().await? {
            task.register("progress", display.clone());
        }
        manager.start_all().await;
    }

    for (index, url) in cli.urls.iter().enumerate() {
        let tag = format!("{}-{}", index + 1, url);
        let task = manager.request(tag, TransferRequest::get(url.clone()))?;
        task.priority(cli.priority)
            .register("progress", display.clone());
        task.save().await?;
        if let Err(e) = task.start().await {
            error!("Could not start {}: {}", url, e);
        }
    }

    if cli.no_interactive {
        wait_until_settled(&manager).await;
    } else {
        display.println("type `help` for commands");
        let interactive = InteractiveMode::new(Arc::clone(&manager), display);
        interactive.run().await;
    }

    manager.shutdown().await;
    info!("Done");
    Ok(())
}

async fn wait_until_settled(manager: &Arc<TransferManager>) {
    loop {
        let busy = manager
            .all_tasks()
            .iter()
            .any(|task| task.status().is_active());
        if !busy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    manager.flush_callbacks().await;

    for task in manager.all_tasks() {
        if task.status() == TransferStatus::Error {
            let record = task.record();
            match record.error {
                Some(e) if e.requires_restart() => error!(
                    "[Task {}] ended with error: {} (restart the task to download it again)",
                    record.tag, e
                ),
                Some(e) => error!("[Task {}] ended with error: {}", record.tag, e),
                None => error!("[Task {}] ended with an unknown error", record.tag),
            }
        }
    }
}
