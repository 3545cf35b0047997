use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lead_watch::channels::{ProgressTracker, TelegramClient, UpdateHandler, UpdatePoller};
use lead_watch::config::{WatchConfig, account_identifier, session_folder};
use lead_watch::error::{ConfigError, Result};
use lead_watch::governor::Governor;
use lead_watch::llm::{LlmConfig, create_provider};
use lead_watch::pipeline::cache::EntityCache;
use lead_watch::pipeline::classifier::ClassifierGateway;
use lead_watch::pipeline::notify::Dispatcher;
use lead_watch::pipeline::processor::{Coordinator, CoordinatorConfig, PipelineDeps};
use lead_watch::store::{EntityStore, LibSqlLedger, LibSqlPeerStore, ResumeLedger};

/// How long in-flight events may finish after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    let config = match WatchConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let session_dir = match prepare_session_dir(&config) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match init_logging(&session_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("👀 lead-watch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Recipient: {}", config.admin_username);
    eprintln!("   Session: {}", session_dir.display());

    match run(config, &session_dir).await {
        Ok(()) => {
            info!("lead-watch shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Fatal error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `<session root>/bot-<digits>/`, created if missing.
fn prepare_session_dir(config: &WatchConfig) -> Result<PathBuf> {
    let folder = session_folder(account_identifier(config.bot_token.expose_secret()));
    let dir = config.session_root.join(folder);
    std::fs::create_dir_all(&dir).map_err(ConfigError::Io)?;
    Ok(dir)
}

/// Human-readable logs on stderr plus JSON lines in the session directory.
fn init_logging(session_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("log")
        .filename_suffix("jsonl")
        .build(session_dir)
        .context("creating log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

async fn open_stores(session_dir: &Path) -> Result<(Arc<LibSqlPeerStore>, Arc<LibSqlLedger>)> {
    let peers = LibSqlPeerStore::open(&session_dir.join("peers.db")).await?;
    let ledger = LibSqlLedger::open(&session_dir.join("updates.db")).await?;
    Ok((Arc::new(peers), Arc::new(ledger)))
}

/// Authenticated Bot API client and the bot's own user id.
async fn connect_telegram(config: &WatchConfig) -> Result<(Arc<TelegramClient>, i64)> {
    let governor = Arc::new(Governor::new(config.rate));
    let telegram = TelegramClient::new(config.bot_token.clone(), governor, config.poll_timeout);
    let self_id = telegram.authenticate().await?;
    Ok((Arc::new(telegram), self_id))
}

fn build_classifier(config: &WatchConfig) -> Result<Arc<ClassifierGateway>> {
    let llm = create_provider(&LlmConfig {
        api_key: config.openai_api_key.clone(),
        model: config.model.clone(),
    })?;
    Ok(Arc::new(ClassifierGateway::new(llm)))
}

async fn run(config: WatchConfig, session_dir: &Path) -> anyhow::Result<()> {
    info!(
        session = %session_dir.display(),
        model = %config.model,
        max_in_flight = config.max_in_flight,
        dedup_window = config.dedup_window,
        "lead-watch starting"
    );

    // ── Storage ─────────────────────────────────────────────────────────
    let (peers, ledger) = open_stores(session_dir)
        .await
        .context("opening session storage")?;

    // ── Telegram ────────────────────────────────────────────────────────
    let (telegram, self_id) = connect_telegram(&config)
        .await
        .context("authenticating with Telegram")?;

    // ── Classifier ──────────────────────────────────────────────────────
    let classifier = build_classifier(&config).context("creating classifier backend")?;

    // ── Entity cache ────────────────────────────────────────────────────
    let cache = Arc::new(EntityCache::new(peers.clone()));
    if !config.sync_chat_ids.is_empty() {
        cache
            .bulk_sync(telegram.known_contacts(&config.sync_chat_ids))
            .await;
    }
    match peers.count().await {
        Ok(count) => info!(cached = count, "Entity cache ready"),
        Err(e) => warn!(error = %e, "Could not count cached identities"),
    }

    // ── Pipeline ────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let coordinator = Arc::new(Coordinator::new(
        PipelineDeps {
            cache,
            classifier,
            resolver: telegram.clone(),
            dispatcher: Arc::new(Dispatcher::new(telegram.clone())),
        },
        CoordinatorConfig {
            admin_handle: config.admin_username.clone(),
            max_in_flight: config.max_in_flight,
            dedup_window: config.dedup_window,
        },
        cancel.clone(),
    ));

    // ── Resume state ────────────────────────────────────────────────────
    let progress = ProgressTracker::open(ledger.clone(), config.dedup_window).await;
    if config.dedup_window > 0 {
        match ledger.recent_events(config.dedup_window).await {
            Ok(keys) => info!(
                remembered = coordinator.remember(keys),
                "Redelivery guard seeded"
            ),
            Err(e) => warn!(error = %e, "Could not load recently processed messages"),
        }
    }

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c signal");
            return;
        }
        info!("Received shutdown signal, stopping intake");
        signal_cancel.cancel();
    });

    let poller = UpdatePoller::new(telegram, progress.clone(), self_id);
    let handler: Arc<dyn UpdateHandler> = coordinator.clone();
    let result = poller.run(handler, cancel.clone()).await;

    cancel.cancel();
    info!(in_flight = coordinator.in_flight(), "Waiting for in-flight events");
    coordinator.shutdown(SHUTDOWN_GRACE).await;
    info!(
        offset = ?progress.next_offset(),
        uncommitted = progress.pending(),
        "Resume offset final"
    );

    result.context("update stream failed")
}
