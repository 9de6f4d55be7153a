//! Order Desk
//!
//! Watches a shop's order feed, rings when new orders land and walks each
//! order through approval, delivery and completion. The library exposes the
//! engine and its seams; `run()` wires them to HTTP, the terminal bell and a
//! line-oriented console.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod alert;
pub mod api;
pub mod config;
pub mod console;
pub mod cursor;
pub mod diagnostics;
pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod merge;
pub mod order;
pub mod poller;
pub mod render;

pub use config::Config;
pub use dispatcher::{ActionError, DispatchOutcome, OrderAction};
pub use engine::{EngineParts, OrderEngine};
pub use lifecycle::{LifecycleStore, StoreEvent};
pub use order::{OrderRecord, OrderStatus};
pub use poller::{Batch, OrderFeed, PollError, PollOutcome};

/// Console plus daily rolling file logging. Keep the returned guard alive
/// for the life of the process; dropping it flushes the file writer.
pub fn init_logging(config: &Config) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,order_desk=debug"));

    let log_dir = config
        .log_dir
        .clone()
        .unwrap_or_else(diagnostics::get_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let pruned = diagnostics::prune_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    if pruned > 0 {
        info!(pruned, log_dir = %log_dir.display(), "Pruned old log files");
    }
    Ok(guard)
}

/// Startup banner. Emitted once the subscriber is installed so it reaches
/// both the console and the log file.
fn log_startup(config: &Config) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        about = %diagnostics::get_about_info(),
        "Starting Order Desk"
    );
    info!(
        feed_url = %config.feed_url,
        steady_ms = config.polling.steady_ms,
        error_ms = config.polling.error_ms,
        "Configuration loaded"
    );
}

/// Binary entry point: load config, start the engine and drive the console
/// until `quit`, end of input or Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    let _guard = init_logging(&config)?;
    log_startup(&config);

    let http = Arc::new(
        api::HttpTransport::new(
            &config.feed_url,
            Duration::from_millis(config.polling.timeout_ms),
            Duration::from_millis(config.actions.timeout_ms),
        )
        .map_err(anyhow::Error::msg)?,
    );
    let lines = console::stdin_lines();
    let engine = Arc::new(OrderEngine::new(
        &config,
        EngineParts {
            feed: http.clone(),
            actions: http,
            audio: Arc::new(alert::TerminalBellSink::new()),
            confirm: Arc::new(console::ConsoleConfirm::new(lines.clone())),
            navigator: Arc::new(dispatcher::BrowserNavigator),
        },
    ));

    engine.start();
    let bridge = tokio::spawn(
        render::RenderBridge::new(console::ConsoleRenderer)
            .run(engine.store(), engine.cancellation()),
    );

    tokio::select! {
        _ = console::run_console(engine.clone(), lines) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
    }

    engine.shutdown();
    engine.join().await;
    if let Err(e) = bridge.await {
        warn!(error = %e, "Render bridge ended abnormally");
    }
    info!("Order Desk stopped");
    Ok(())
}
