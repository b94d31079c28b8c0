//! Harrier Monitor - liquidation proximity monitor for perp DEX positions
//!
//! This is the main entry point for the monitor daemon. It wires up
//! the persistence layer, the rate-limited fetcher, and the three
//! long-lived loops (refresh scheduler, discovery, daily summary),
//! then waits for a shutdown signal.

use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harrier_monitor::alerts::{Alerter, DryRunSink, MessageSink, TelegramSink};
use harrier_monitor::config::AppConfig;
use harrier_monitor::db;
use harrier_monitor::monitoring::cache::PositionCache;
use harrier_monitor::monitoring::discovery::DiscoveryLoop;
use harrier_monitor::monitoring::liq_history::LiqHistoryStore;
use harrier_monitor::monitoring::pipeline::Pipeline;
use harrier_monitor::monitoring::scheduler::RefreshScheduler;
use harrier_monitor::monitoring::summary::SummaryScheduler;
use harrier_monitor::registry::{RegistryPolicy, WalletRegistry};
use harrier_monitor::thresholds::NotionalThresholds;
use harrier_monitor::upstream::Fetcher;

#[derive(Parser)]
#[command(name = "harrier-monitor")]
#[command(about = "Liquidation proximity monitor for perp DEX positions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Suppress outbound sends; alerts are logged instead
    #[arg(long, global = true)]
    dry_run: bool,

    /// Truncate the position cache and exit (registry preserved)
    #[arg(long, global = true)]
    clear_cache: bool,

    /// Truncate all core tables and exit (wallet-source history preserved)
    #[arg(long, global = true)]
    clear_db: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor daemon (default)
    Run,
}

#[tokio::main]
async fn main() {
    init_tracing();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    // `run` is the only subcommand and the default
    match cli.command {
        Some(Commands::Run) | None => {}
    }

    tracing::info!("Starting Harrier Monitor v{}", env!("CARGO_PKG_VERSION"));

    // Configuration errors exit 2
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return 2;
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration validation failed");
        return 2;
    }

    // Unrecoverable startup errors exit 1
    let pool = match db::init_pool(&config.database).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "database initialization failed");
            return 1;
        }
    };
    if let Err(e) = db::run_migrations(&pool).await {
        tracing::error!(error = %e, "schema migration failed");
        return 1;
    }

    // Maintenance flags run and exit
    if cli.clear_cache {
        return match db::clear_position_cache(&pool).await {
            Ok(rows) => {
                tracing::info!(rows, "position cache cleared");
                0
            }
            Err(e) => {
                tracing::error!(error = %e, "clear-cache failed");
                1
            }
        };
    }
    if cli.clear_db {
        return match db::clear_core_tables(&pool).await {
            Ok(()) => {
                tracing::info!("core tables cleared");
                0
            }
            Err(e) => {
                tracing::error!(error = %e, "clear-db failed");
                1
            }
        };
    }

    let sink: Arc<dyn MessageSink> = if cli.dry_run {
        tracing::info!("dry run: outbound sends suppressed");
        Arc::new(DryRunSink)
    } else {
        if config.telegram.bot_token.is_empty() || config.telegram.chat_id.is_empty() {
            tracing::error!(
                "HARRIER_TELEGRAM__BOT_TOKEN and HARRIER_TELEGRAM__CHAT_ID are required \
                 (or use --dry-run)"
            );
            return 2;
        }
        match TelegramSink::new(
            config.telegram.bot_token.clone(),
            config.telegram.chat_id.clone(),
        ) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                tracing::error!(error = %e, "failed to build Telegram client");
                return 1;
            }
        }
    };

    let fetcher = match Fetcher::new(config.upstream.clone()) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            tracing::error!(error = %e, "failed to build fetcher");
            return 1;
        }
    };

    let timezone: chrono_tz::Tz = config
        .summary
        .timezone
        .parse()
        .unwrap_or(chrono_tz::America::New_York);

    let cancel = CancellationToken::new();
    let fatal = Arc::new(AtomicBool::new(false));

    let (writer, writer_task) = db::spawn_cache_writer(
        pool.clone(),
        Duration::from_millis(config.database.write_batch_ms),
        cancel.clone(),
        fatal.clone(),
    );

    let thresholds = Arc::new(NotionalThresholds::from_config(&config.thresholds));
    let cache = Arc::new(PositionCache::new(config.monitor.clone()));
    let alerter = Arc::new(Alerter::new(pool.clone(), sink, timezone));

    // Restore persisted state
    let registry = match WalletRegistry::load(
        pool.clone(),
        RegistryPolicy {
            active_threshold: config.discovery.wallet_active_threshold,
            infrequent_rescan_hours: config.discovery.infrequent_rescan_hours,
        },
    )
    .await
    {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(error = %e, "failed to load wallet registry");
            return 1;
        }
    };

    match restore_cache(&pool, &cache, &thresholds, &config).await {
        Ok((restored, dropped)) => {
            tracing::info!(restored, dropped, "position cache restored");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to restore position cache");
            return 1;
        }
    }

    let pipeline = Pipeline {
        cache: cache.clone(),
        alerter: alerter.clone(),
        writer: writer.clone(),
        thresholds: thresholds.clone(),
        registry: Some(registry.clone()),
        cfg: config.monitor.clone(),
    };

    let mut tasks = JoinSet::new();

    let scheduler = RefreshScheduler::new(
        pipeline.clone(),
        fetcher.clone(),
        config.monitor.clone(),
        config.upstream.clone(),
        cancel.clone(),
    );
    tasks.spawn(scheduler.run());
    tracing::info!("refresh scheduler spawned");

    let discovery = DiscoveryLoop::new(
        registry.clone(),
        pipeline.clone(),
        fetcher.clone(),
        LiqHistoryStore::new(pool.clone()),
        pool.clone(),
        config.discovery.clone(),
        cancel.clone(),
    );
    tasks.spawn(discovery.run());
    tracing::info!("discovery loop spawned");

    let summary = SummaryScheduler::new(
        cache.clone(),
        alerter.clone(),
        &config.summary,
        cancel.clone(),
    );
    tasks.spawn(summary.run());
    tracing::info!("summary scheduler spawned");

    alerter
        .send_raw(&format!(
            "Monitor started\nPositions: {} | Wallets: {}",
            cache.len(),
            registry.len()
        ))
        .await;

    wait_for_shutdown(&cancel).await;
    tracing::info!("shutdown signal received, draining tasks");
    cancel.cancel();

    // Hard deadline: tasks drain in-flight fetches and the writer
    // flushes its batch; past the deadline we stop waiting.
    let deadline = Duration::from_secs(config.monitor.shutdown_deadline_secs);
    let drained = tokio::time::timeout(deadline, async {
        while tasks.join_next().await.is_some() {}
        let _ = writer_task.await;
    })
    .await;

    if drained.is_err() {
        tracing::warn!("shutdown deadline exceeded, exiting with pending work");
    }

    alerter.send_raw("Monitor stopped").await;

    if fatal.load(Ordering::SeqCst) {
        tracing::error!("exiting after sustained persistence failure");
        1
    } else {
        tracing::info!("Harrier Monitor stopped");
        0
    }
}

/// Load the persisted cache snapshot, dropping rows that no longer
/// pass the eligibility filters. Rows older than the staleness window
/// load in a provisional state and revalidate on their first refresh.
async fn restore_cache(
    pool: &db::DbPool,
    cache: &PositionCache,
    thresholds: &NotionalThresholds,
    config: &AppConfig,
) -> harrier_monitor::MonitorResult<(usize, usize)> {
    let stored = db::load_position_cache(pool).await?;
    let stale_after = chrono::Duration::hours(config.monitor.cache_stale_hours);
    let now_wall = chrono::Utc::now();
    let now = tokio::time::Instant::now();

    let mut restored = 0usize;
    let mut dropped = 0usize;

    for row in stored {
        if row.liq_price.is_none() {
            dropped += 1;
            continue;
        }
        let margin = if row.key.exchange.is_sub_exchange() {
            harrier_monitor::MarginType::Isolated
        } else {
            row.margin_type
        };
        if !thresholds.passes(&row.key.token, row.key.exchange, margin, row.notional) {
            dropped += 1;
            continue;
        }

        let stale = now_wall - row.last_updated > stale_after;
        cache.restore(row, stale, now);
        restored += 1;
    }

    Ok((restored, dropped))
}

async fn wait_for_shutdown(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = cancel.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harrier_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
