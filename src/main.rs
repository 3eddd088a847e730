use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hotreel::config::{HotReelConfig, LoggingConfig};
use hotreel::events::{EventKind, ProgressEvent, RunCompleted, RunEvent, Subscription};
use hotreel::scheduler::{RunParameters, Scheduler};
use hotreel::worker::CommandWorker;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "hotreel",
    about = "Control plane for scheduled, cancellable hot-list collection runs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (defaults: $HOTREEL_CONFIG, /etc/hotreel/hotreel.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address, overrides [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one collection in the foreground and stream its progress
    Run {
        /// Number of items to collect (1-20)
        #[arg(long, default_value = "3")]
        count: u32,

        /// Run the browser without a window
        #[arg(long)]
        headless: bool,
    },

    /// Show completed runs, most recent first
    History {
        /// Maximum number of entries
        #[arg(long)]
        limit: Option<usize>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_progress(p: &ProgressEvent) {
    let tag = match p.kind {
        EventKind::Info => "INFO",
        EventKind::Success => "OK",
        EventKind::Error => "ERROR",
    };
    println!("[{}] {:<5} {}", p.at.format("%H:%M:%S"), tag, p.message);
}

/// Print a foreground run's events until it completes. The first interrupt
/// asks the run to stop; a second one abandons it.
async fn follow_run(
    scheduler: &Scheduler,
    events: &mut Subscription,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> Result<RunCompleted> {
    let mut stop_requested = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RunEvent::Progress(p)) => print_progress(&p),
                Some(RunEvent::RunCompleted(c)) => return Ok(c),
                None => anyhow::bail!("event stream closed before the run finished"),
            },
            Some(()) = interrupts.recv() => {
                if stop_requested {
                    anyhow::bail!("interrupted again, run abandoned");
                }
                stop_requested = true;
                println!("Stopping... (press ctrl-c again to abandon the run)");
                if let Err(e) = scheduler.stop() {
                    tracing::warn!("stop failed: {}", e);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = HotReelConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting HotReel daemon");
            hotreel::serve(config).await?;
        }
        Commands::Run { count, headless } => {
            let params = RunParameters::once(count, headless);
            params.validate()?;
            let worker = Arc::new(CommandWorker::new(config.worker.clone()));
            let scheduler = hotreel::build_scheduler(&config, worker)?;
            let mut events = scheduler.subscribe();

            let handle = scheduler.start(params)?;
            println!("Run {} started ({} items)", handle.run_id, count);

            let (interrupt_tx, mut interrupts) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if interrupt_tx.send(()).is_err() {
                        break;
                    }
                }
            });

            let completed = follow_run(&scheduler, &mut events, &mut interrupts).await?;
            println!("{}", completed.message);
            if !completed.success {
                anyhow::bail!("run did not succeed");
            }
        }
        Commands::History { limit, json } => {
            let pool = hotreel::storage::open_pool(&config.storage.db_path)?;
            let history = hotreel::scheduler::SqliteHistory::new(pool);
            let limit = limit.or(Some(config.scheduler.history_limit));
            let records = hotreel::scheduler::HistoryStore::list(&history, limit)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No completed runs yet.");
            } else {
                println!("{:<20} | {:<8} | {:<5} | File", "Completed", "Trigger", "Items");
                println!("{:-<20}-|-{:-<8}-|-{:-<5}-|-{:-<30}", "", "", "", "");
                for r in records {
                    println!(
                        "{:<20} | {:<8} | {:<5} | {}",
                        r.completed_at
                            .with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M:%S"),
                        r.trigger,
                        r.item_count,
                        r.filename
                    );
                }
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
