use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;

use crate::broker::BrokerGateway;
use crate::config::RunnerConfig;
use crate::models::{ExecutionReport, ReportAction};
use crate::strategy::Strategy;
use crate::Result;

/// Counters kept across a run and logged at exit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub signals: u64,
    /// Reports that changed something at the broker
    pub executed: u64,
    pub rejected: u64,
    pub reconnects: u64,
    pub realized_profit: f64,
    pub wins: u64,
    pub losses: u64,
}

impl RunStats {
    pub fn record(&mut self, reports: &[ExecutionReport]) {
        for report in reports {
            match report.action {
                ReportAction::Skipped => {}
                ReportAction::Rejected => self.rejected += 1,
                _ => self.executed += 1,
            }
            if report.action == ReportAction::Closed {
                if let Some(profit) = report.profit {
                    self.realized_profit += profit;
                    if profit > 0.0 {
                        self.wins += 1;
                    } else {
                        self.losses += 1;
                    }
                }
            }
        }
    }

    pub fn win_rate(&self) -> f64 {
        let closed = self.wins + self.losses;
        if closed == 0 {
            0.0
        } else {
            self.wins as f64 / closed as f64 * 100.0
        }
    }

    fn log_summary(&self, name: &str) {
        tracing::info!("📊 {} summary:", name);
        tracing::info!("  Ticks: {} ({} failed)", self.ticks, self.failed_ticks);
        tracing::info!("  Signals: {}", self.signals);
        tracing::info!("  Executed: {} (rejected {})", self.executed, self.rejected);
        tracing::info!("  Reconnects: {}", self.reconnects);
        tracing::info!(
            "  Closed: {} wins / {} losses ({:.1}%), P&L {:.2}",
            self.wins,
            self.losses,
            self.win_rate(),
            self.realized_profit
        );
    }
}

/// Stops a running `StrategyRunner` from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Interrupt {
    Shutdown,
    CtrlC,
}

/// Drives a strategy through its pipeline on a fixed interval.
///
/// The broker session is opened before the first tick and always closed on
/// exit, whatever ended the loop.
pub struct StrategyRunner {
    broker: Arc<dyn BrokerGateway>,
    config: RunnerConfig,
    shutdown_tx: Arc<watch::Sender<bool>>,
    handle_ctrl_c: bool,
}

impl StrategyRunner {
    pub fn new(broker: Arc<dyn BrokerGateway>, config: RunnerConfig) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            broker,
            config,
            shutdown_tx: Arc::new(tx),
            handle_ctrl_c: true,
        }
    }

    /// Leave Ctrl+C to the caller
    pub fn without_ctrl_c(mut self) -> Self {
        self.handle_ctrl_c = false;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    async fn interrupted(&self, rx: &mut watch::Receiver<bool>) -> Interrupt {
        if !self.handle_ctrl_c {
            shutdown_requested(rx).await;
            return Interrupt::Shutdown;
        }
        tokio::select! {
            _ = shutdown_requested(rx) => Interrupt::Shutdown,
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => Interrupt::CtrlC,
                Err(e) => {
                    tracing::warn!("Ctrl+C handler unavailable: {}", e);
                    shutdown_requested(rx).await;
                    Interrupt::Shutdown
                }
            },
        }
    }

    /// Connect, initialize, loop, then always shut down and disconnect.
    ///
    /// Connection or initialization failures abort the run before the first tick.
    pub async fn run<S: Strategy>(&self, strategy: &mut S) -> Result<RunStats> {
        let account = self.broker.connect().await?;
        tracing::info!(
            "✅ Connected: account {} on {} ({} {:.2})",
            account.login,
            account.server,
            account.currency,
            account.balance
        );

        if let Err(e) = strategy.initialize().await {
            tracing::error!("❌ {} failed to initialize: {}", strategy.name(), e);
            if let Err(e) = self.broker.disconnect().await {
                tracing::warn!("Disconnect failed: {}", e);
            }
            return Err(e);
        }

        let mut stats = RunStats::default();
        self.run_loop(strategy, &mut stats).await;

        if let Err(e) = strategy.shutdown().await {
            tracing::warn!("{} shutdown error: {}", strategy.name(), e);
        }
        if let Err(e) = self.broker.disconnect().await {
            tracing::warn!("Disconnect failed: {}", e);
        }
        stats.log_summary(strategy.name());
        tracing::info!("👋 {} stopped", strategy.name());
        Ok(stats)
    }

    async fn run_loop<S: Strategy>(&self, strategy: &mut S, stats: &mut RunStats) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if self.config.iterations.is_some_and(|max| stats.ticks >= max) {
                tracing::info!("Completed {} iterations", stats.ticks);
                break;
            }
            stats.ticks += 1;
            tracing::info!("🔄 {} tick {}", strategy.name(), stats.ticks);

            let tick =
                tokio::time::timeout(self.config.tick_timeout(), Self::tick(strategy, stats));
            let outcome = tokio::select! {
                interrupt = self.interrupted(&mut shutdown) => Err(interrupt),
                outcome = tick => Ok(outcome),
            };

            match outcome {
                Err(interrupt) => {
                    self.log_interrupt(interrupt);
                    break;
                }
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) if e.is_connectivity() => {
                    stats.failed_ticks += 1;
                    tracing::error!("❌ Connection lost: {}", e);
                    if let Err(interrupt) = self.reconnect(stats, &mut shutdown).await {
                        self.log_interrupt(interrupt);
                        break;
                    }
                }
                Ok(Ok(Err(e))) => {
                    stats.failed_ticks += 1;
                    tracing::error!("❌ Tick {} failed: {}", stats.ticks, e);
                }
                Ok(Err(_elapsed)) => {
                    stats.failed_ticks += 1;
                    tracing::warn!(
                        "⚠️  Tick {} abandoned after {:?}",
                        stats.ticks,
                        self.config.tick_timeout()
                    );
                }
            }

            if self.config.iterations.is_some_and(|max| stats.ticks >= max) {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                interrupt = self.interrupted(&mut shutdown) => {
                    self.log_interrupt(interrupt);
                    break;
                }
            }
        }
    }

    fn log_interrupt(&self, interrupt: Interrupt) {
        match interrupt {
            Interrupt::CtrlC => tracing::info!("⚠️  Received Ctrl+C, shutting down..."),
            Interrupt::Shutdown => tracing::info!("Shutdown requested"),
        }
    }

    async fn tick<S: Strategy>(strategy: &mut S, stats: &mut RunStats) -> Result<()> {
        let now = Utc::now();
        let analysis = strategy.analyze_market(now).await?;
        let signals = strategy.generate_signals(&analysis, now).await?;
        stats.signals += signals.len() as u64;

        if !signals.is_empty() {
            let approved = strategy.manage_risk(signals, now).await?;
            if !approved.is_empty() {
                let reports = strategy.execute_signals(&approved, now).await?;
                stats.record(&reports);
            }
        }

        let reports = strategy.manage_positions(&analysis, now).await?;
        stats.record(&reports);
        Ok(())
    }

    /// One pass over the backoff schedule. Giving up here is not fatal: the
    /// next failing tick starts another pass.
    async fn reconnect(
        &self,
        stats: &mut RunStats,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), Interrupt> {
        let attempts = self.config.reconnect_backoff_secs.len().max(1);
        for attempt in 0..attempts {
            let delay = self.config.reconnect_backoff(attempt);
            tracing::warn!("Reconnecting in {:?} (attempt {}/{})", delay, attempt + 1, attempts);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                interrupt = self.interrupted(shutdown) => return Err(interrupt),
            }
            match self.broker.connect().await {
                Ok(account) => {
                    stats.reconnects += 1;
                    tracing::info!(
                        "✅ Reconnected to {} (account {})",
                        account.server,
                        account.login
                    );
                    return Ok(());
                }
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
        }
        tracing::error!("Could not reconnect, retrying after the next tick");
        Ok(())
    }
}
