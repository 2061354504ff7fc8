//! CAIMEO: autonomous equity entry loop.
//!
//! Entry point. Loads configuration, initialises structured logging, wires
//! the brokerage, discovery feed, counter and journal into the loop
//! controller, and serves the control surface until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use caimeo::brokerage::alpaca::AlpacaClient;
use caimeo::brokerage::paper::PaperBroker;
use caimeo::brokerage::{BrokerageGateway, Credentials, SessionValidator};
use caimeo::config::AppConfig;
use caimeo::dashboard::{self, routes::DashboardState};
use caimeo::discovery::FileCandidateFeed;
use caimeo::engine::audit::AuditLog;
use caimeo::engine::controller::{LoopController, StartOutcome};
use caimeo::engine::counter::FileCounterStore;
use caimeo::engine::decision_loop::LoopDeps;
use caimeo::market::{MarketCalendar, SystemClock};
use caimeo::storage::journal::SqliteJournal;

const BANNER: &str = r#"
  ____    _    ___ __  __ _____ ___
 / ___|  / \  |_ _|  \/  | ____/ _ \
| |     / _ \  | || |\/| |  _|| | | |
| |___ / ___ \ | || |  | | |__| |_| |
 \____/_/   \_\___|_|  |_|_____\___/

  Autonomous equity entry loop
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load_or_default("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        poll_secs = cfg.agent.poll_interval_secs,
        dry_run = cfg.agent.dry_run,
        max_day_trades_per_week = cfg.risk.max_day_trades_per_week,
        max_positions = cfg.risk.max_positions,
        minutes_after_open = cfg.risk.minutes_after_open,
        min_confidence = %cfg.risk.min_confidence,
        "CAIMEO starting up"
    );

    // -- Brokerage -------------------------------------------------------

    let call_timeout = Duration::from_secs(cfg.brokerage.timeout_secs);
    let (gateway, validator): (Arc<dyn BrokerageGateway>, Arc<dyn SessionValidator>) =
        if cfg.agent.dry_run {
            let paper = Arc::new(PaperBroker::new(cfg.agent.paper_equity));
            warn!(equity = %cfg.agent.paper_equity, "DRY RUN: orders go to the in-memory paper brokerage");
            (paper.clone() as Arc<dyn BrokerageGateway>, paper as Arc<dyn SessionValidator>)
        } else {
            let alpaca = Arc::new(AlpacaClient::new(&cfg.brokerage.base_url, call_timeout)?);
            info!(base_url = %alpaca.base_url(), "Using Alpaca brokerage");
            (alpaca.clone() as Arc<dyn BrokerageGateway>, alpaca as Arc<dyn SessionValidator>)
        };

    // -- Loop collaborators ----------------------------------------------

    let journal = SqliteJournal::connect(&cfg.storage.journal_url).await?;
    let calendar = MarketCalendar::from_config(&cfg.market).context("Invalid [market] section")?;

    let deps = LoopDeps {
        clock: Arc::new(SystemClock),
        calendar,
        feed: Arc::new(FileCandidateFeed::new(&cfg.discovery.file)),
        gateway,
        counter_store: Box::new(FileCounterStore::new(cfg.storage.counter_file.clone())),
        audit: AuditLog::new(Arc::new(journal)),
    };

    let controller = Arc::new(LoopController::new(
        deps,
        cfg.risk.clone(),
        validator,
        Duration::from_secs(cfg.agent.poll_interval_secs),
        call_timeout,
    )?);

    // -- Session from environment ----------------------------------------

    match Credentials::from_env(&cfg.brokerage.api_key_env, &cfg.brokerage.api_secret_env) {
        Some(creds) => match controller.authenticate(creds).await {
            Ok(true) => match controller.start().await {
                Ok(StartOutcome::Started) | Ok(StartOutcome::AlreadyRunning) => {}
                Err(e) => error!(error = %e, "Loop not started"),
            },
            Ok(false) => warn!("Environment credentials rejected; waiting for /auth"),
            Err(e) => warn!(error = %e, "Could not validate environment credentials; waiting for /auth"),
        },
        None => info!(
            key_env = %cfg.brokerage.api_key_env,
            "No environment credentials; waiting for /auth"
        ),
    }

    // -- Control surface -------------------------------------------------

    let server = if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(controller.clone()));
        Some(dashboard::spawn_dashboard(state, cfg.dashboard.port).await?)
    } else {
        None
    };

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    controller.stop().await;
    if let Some(server) = server {
        server.abort();
    }

    let status = controller.status().await;
    if let Some(counter) = status.counter {
        info!(
            week_start = %counter.week_start,
            trades_used = counter.trades_used,
            cap = counter.cap,
            "CAIMEO shut down cleanly."
        );
    } else {
        info!("CAIMEO shut down cleanly.");
    }

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("caimeo=info"));

    let json_logging = std::env::var("CAIMEO_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
