use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use editflow::chat_sync::{ChatStore, HttpChatStore};
use editflow::config::Config;
use editflow::controller::RetryController;
use editflow::host::GitHubHost;
use editflow::index::{self, Language};
use editflow::job::QueueEntry;
use editflow::notify::{BroadcastNotifier, Notifier};
use editflow::propose::BackendRegistry;
use editflow::queue::{JobQueue, SnapshotStore};
use editflow::telemetry;
use editflow::worker::{Dispatcher, SubmitResponse, WorkerSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

const IDLE_POLL_MS: u64 = 50;
const NOTIFY_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(
    name = "editflow",
    about = "Queue-driven code change agent for hosted repositories",
    version
)]
struct Cli {
    /// Path to the config file (defaults to ~/.config/editflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read job submissions as JSON lines on stdin and process them
    Run,
    /// Print the declarations found in a source file as JSON
    Declarations {
        file: PathBuf,
        /// Language tag or extension; inferred from the file name if omitted
        #[arg(short, long)]
        language: Option<String>,
    },
    /// Check a source file for syntax errors
    Verify {
        file: PathBuf,
        #[arg(short, long)]
        language: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    telemetry::init_tracing(&config.logging);

    match cli.command {
        Command::Run => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run(config))
        }
        Command::Declarations { file, language } => print_declarations(&file, language.as_deref()),
        Command::Verify { file, language } => {
            let ok = verify_file(&file, language.as_deref())?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config => {
            println!("# {}", Config::config_location(cli.config.as_deref()));
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn read_source(file: &Path, language: Option<&str>) -> Result<(String, Language)> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let language = match language {
        Some(tag) => Language::from_tag(tag),
        None => Language::from_path(&file.to_string_lossy()),
    };
    Ok((content, language))
}

fn print_declarations(file: &Path, language: Option<&str>) -> Result<()> {
    let (content, language) = read_source(file, language)?;
    let declarations = index::extract(&content, language)?;
    println!("{}", serde_json::to_string_pretty(&declarations)?);
    Ok(())
}

fn verify_file(file: &Path, language: Option<&str>) -> Result<bool> {
    let (content, language) = read_source(file, language)?;
    let verification = index::verify(&content, language)?;
    match verification.locator {
        Some(locator) if !verification.ok => {
            println!("{}: syntax error at {}", file.display(), locator);
        }
        _ if !verification.ok => println!("{}: syntax error", file.display()),
        _ => println!("{}: ok", file.display()),
    }
    Ok(verification.ok)
}

async fn run(config: Config) -> Result<()> {
    let notifier = BroadcastNotifier::new(NOTIFY_CAPACITY);
    let printer = tokio::spawn(print_notifications(notifier.subscribe()));
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);

    let host = Arc::new(GitHubHost::new(config.github.clone())?);
    let backends = BackendRegistry::from_config(&config.backends);
    if backends.is_empty() {
        warn!("no proposal backends configured; every job will fail");
    } else {
        info!(backends = ?backends.ids(), "proposal backends ready");
    }
    let controller = Arc::new(RetryController::new(
        host,
        backends,
        notifier.clone(),
        config.controller.max_attempts,
    ));

    let queue = match &config.queue.snapshot_path {
        Some(path) => JobQueue::with_store(config.queue.max_depth, SnapshotStore::open(path)?)?,
        None => JobQueue::new(config.queue.max_depth),
    };
    let chat_store = HttpChatStore::from_config(&config.chat_sync)?
        .map(|store| Arc::new(store) as Arc<dyn ChatStore>);

    let dispatcher = Dispatcher::new(
        Arc::new(queue),
        controller,
        notifier,
        chat_store,
        WorkerSettings::from_config(&config),
    );
    if dispatcher.pending() > 0 {
        dispatcher.ensure_worker();
    }

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let served = dispatcher
        .serve(
            read_submissions(&dispatcher),
            interrupt,
            Duration::from_millis(IDLE_POLL_MS),
        )
        .await;

    // Closing the last sender ends the printer.
    drop(dispatcher);
    let _ = printer.await;
    served
}

async fn read_submissions(dispatcher: &Dispatcher) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<QueueEntry>(&line) {
            Ok(entry) => dispatcher.submit(entry),
            Err(e) => SubmitResponse::rejected(format!("invalid request: {}", e)),
        };
        println!("{}", serde_json::to_string(&response)?);
    }
    Ok(())
}

async fn print_notifications(mut rx: broadcast::Receiver<editflow::notify::Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("failed to encode notification: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
