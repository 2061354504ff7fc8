//! Loop controller.
//!
//! Start/stop state machine around the decision loop. All transitions go
//! through one mutex-guarded `ControlState`; each run gets a generation
//! number so a task that is still winding down can never overwrite the state
//! of a newer run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::audit::AuditLog;
use super::counter::WeeklyTradeCounter;
use super::decision_loop::{run_scheduled, CycleReport, DecisionLoop, LoopDeps, LoopError};
use crate::brokerage::{BrokerageGateway, Credentials, GatewayError, SessionValidator};
use crate::config::RiskConfig;
use crate::discovery::CandidateFeed;
use crate::types::{
    AccountSnapshot, CaimeoError, DecisionRecord, DiscoveryProgress, LoopState, OpenOrder, Position,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

struct ControlState {
    state: LoopState,
    generation: u64,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

/// Values published after every cycle so status reads never wait on a
/// running cycle.
#[derive(Debug, Clone, Default)]
struct Published {
    counter: Option<WeeklyTradeCounter>,
    unresolved: Vec<String>,
    report: Option<CycleReport>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub authenticated: bool,
    pub gateway: String,
    pub counter: Option<WeeklyTradeCounter>,
    pub unresolved: Vec<String>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

pub struct LoopController {
    control: Arc<Mutex<ControlState>>,
    core: Arc<Mutex<DecisionLoop>>,
    published: Arc<std::sync::Mutex<Published>>,
    authenticated: Arc<AtomicBool>,
    validator: Arc<dyn SessionValidator>,
    gateway: Arc<dyn BrokerageGateway>,
    feed: Arc<dyn CandidateFeed>,
    audit: AuditLog,
    poll: Duration,
    call_timeout: Duration,
}

impl LoopController {
    pub fn new(
        deps: LoopDeps,
        risk: RiskConfig,
        validator: Arc<dyn SessionValidator>,
        poll: Duration,
        call_timeout: Duration,
    ) -> Result<Self, CaimeoError> {
        let gateway = deps.gateway.clone();
        let feed = deps.feed.clone();
        let audit = deps.audit.clone();
        let core = DecisionLoop::new(deps, risk, call_timeout)?;

        Ok(Self {
            control: Arc::new(Mutex::new(ControlState {
                state: LoopState::Stopped,
                generation: 0,
                stop_tx: None,
                handle: None,
                last_error: None,
            })),
            core: Arc::new(Mutex::new(core)),
            published: Arc::new(std::sync::Mutex::new(Published::default())),
            authenticated: Arc::new(AtomicBool::new(false)),
            validator,
            gateway,
            feed,
            audit,
            poll,
            call_timeout,
        })
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Validate credentials; on success they become the gateway's session.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<bool, GatewayError> {
        if credentials.is_blank() {
            return Ok(false);
        }
        let valid = tokio::time::timeout(self.call_timeout, self.validator.validate(&credentials))
            .await
            .unwrap_or(Err(GatewayError::Timeout))?;

        if valid {
            self.gateway.set_credentials(Arc::new(credentials)).await;
            self.authenticated.store(true, Ordering::SeqCst);
            info!(gateway = self.gateway.name(), "Brokerage session established");
        } else {
            warn!(gateway = self.gateway.name(), "Brokerage credentials rejected");
        }
        Ok(valid)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    pub async fn start(&self) -> Result<StartOutcome, CaimeoError> {
        let mut control = self.control.lock().await;
        if control.state == LoopState::Running {
            info!("Start requested while running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        if !self.is_authenticated() {
            return Err(CaimeoError::NotAuthenticated);
        }

        // Waits for a run that is still winding down to release the core.
        let counter = {
            let mut core = self.core.lock().await;
            let counter = core.prepare().inspect_err(|e| {
                error!(error = %e, "Refusing to start");
            })?;
            self.publish(&core);
            counter
        };

        control.generation += 1;
        let generation = control.generation;
        let (stop_tx, stop_rx) = watch::channel(false);

        let core = self.core.clone();
        let published = self.published.clone();
        let control_ref = self.control.clone();
        let authenticated = self.authenticated.clone();
        let poll = self.poll;

        let handle = tokio::spawn(async move {
            let result = run_scheduled(core, poll, stop_rx, move |core, report| {
                if let Ok(mut p) = published.lock() {
                    p.counter = Some(core.counter());
                    p.unresolved = core.unresolved_symbols();
                    p.report = Some(report.clone());
                }
            })
            .await;

            if let Err(e) = result {
                error!(error = %e, generation, "Decision loop halted");
                if matches!(e, LoopError::Unauthorized) {
                    authenticated.store(false, Ordering::SeqCst);
                }
                let mut control = control_ref.lock().await;
                if control.generation == generation {
                    control.last_error = Some(e.to_string());
                    control.state = LoopState::Stopped;
                    control.stop_tx = None;
                    control.handle = None;
                }
            }
        });

        control.state = LoopState::Running;
        control.stop_tx = Some(stop_tx);
        control.handle = Some(handle);
        control.last_error = None;

        info!(
            generation,
            week_start = %counter.week_start,
            trades_used = counter.trades_used,
            cap = counter.cap,
            poll_secs = self.poll.as_secs(),
            "Decision loop started"
        );
        Ok(StartOutcome::Started)
    }

    /// Signal the run to stop and wait for it. The signal is honoured
    /// between candidates; an in-flight submission completes first.
    pub async fn stop(&self) -> LoopState {
        let handle = {
            let mut control = self.control.lock().await;
            if let Some(tx) = control.stop_tx.take() {
                let _ = tx.send(true);
            }
            control.state = LoopState::Stopped;
            control.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Decision loop task ended abnormally");
            }
            info!("Decision loop stop complete");
        }
        LoopState::Stopped
    }

    pub async fn state(&self) -> LoopState {
        self.control.lock().await.state
    }

    pub async fn status(&self) -> LoopStatus {
        let (state, last_error) = {
            let control = self.control.lock().await;
            (control.state, control.last_error.clone())
        };
        let published = self
            .published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default();

        LoopStatus {
            state,
            authenticated: self.is_authenticated(),
            gateway: self.gateway.name().to_string(),
            counter: published.counter,
            unresolved: published.unresolved,
            last_report: published.report,
            last_error,
        }
    }

    fn publish(&self, core: &DecisionLoop) {
        if let Ok(mut p) = self.published.lock() {
            p.counter = Some(core.counter());
            p.unresolved = core.unresolved_symbols();
        }
    }

    // -----------------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------------

    pub fn progress(&self) -> DiscoveryProgress {
        self.feed.progress()
    }

    pub async fn positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.bounded(self.gateway.positions()).await
    }

    pub async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        self.bounded(self.gateway.open_orders()).await
    }

    pub async fn account(&self) -> Result<AccountSnapshot, GatewayError> {
        self.bounded(self.gateway.account()).await
    }

    pub async fn trade_history(&self, limit: usize) -> anyhow::Result<Vec<DecisionRecord>> {
        self.audit.trade_history(limit).await
    }

    pub async fn recent_decisions(&self, limit: usize) -> anyhow::Result<Vec<DecisionRecord>> {
        self.audit.recent(limit).await
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
