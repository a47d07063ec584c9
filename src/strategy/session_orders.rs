use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::broker::BrokerGateway;
use crate::error::BotError;
use crate::execution::{
    ExitReason, OrderLifecycleManager, OrderManagerConfig, PositionManager, ReconcileReport,
    SkipReason,
};
use crate::models::{ExecutionReport, ReportAction, Side, SignalKind, TradeSignal};
use crate::pricing::{completed_candle, DistanceCalculator, DistanceConfig};
use crate::session::{Session, SessionCalendar};
use crate::strategy::Strategy;
use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalendarPreset {
    #[default]
    ForexMajors,
    Directional,
}

/// Straddle and scalper bots share this driver; they differ only in config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionOrderConfig {
    pub name: String,
    pub calendar: CalendarPreset,
    /// Explicit sessions; replaces the preset when present
    pub sessions: Option<Vec<Session>>,
    pub sides: Vec<Side>,
    pub orders: OrderManagerConfig,
    pub distance: DistanceConfig,
    /// Tighten stops of profitable positions every tick
    pub trail_stops: bool,
    /// Close positions and cancel orders while no session is open
    pub flatten_outside_sessions: bool,
}

impl SessionOrderConfig {
    /// Buy-only straddle across the major sessions
    pub fn straddle() -> Self {
        Self {
            name: "session_straddle".to_string(),
            calendar: CalendarPreset::ForexMajors,
            sessions: None,
            sides: vec![Side::Buy],
            orders: OrderManagerConfig::straddle(),
            distance: DistanceConfig::default(),
            trail_stops: false,
            flatten_outside_sessions: true,
        }
    }

    /// Two-sided scalper on the directional calendar
    pub fn scalper() -> Self {
        Self {
            name: "session_scalper".to_string(),
            calendar: CalendarPreset::Directional,
            sessions: None,
            sides: vec![Side::Buy, Side::Sell],
            orders: OrderManagerConfig::scalper(),
            distance: DistanceConfig::default(),
            trail_stops: true,
            flatten_outside_sessions: true,
        }
    }

    pub fn build_calendar(&self) -> Result<SessionCalendar> {
        match &self.sessions {
            Some(sessions) => SessionCalendar::new(sessions.clone()),
            None => Ok(match self.calendar {
                CalendarPreset::ForexMajors => SessionCalendar::forex_majors(),
                CalendarPreset::Directional => SessionCalendar::directional(),
            }),
        }
    }
}

impl Default for SessionOrderConfig {
    fn default() -> Self {
        Self::straddle()
    }
}

/// One instrument and side to reconcile during a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTarget {
    pub symbol: String,
    pub side: Side,
    pub session: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub active_sessions: Vec<String>,
    pub targets: Vec<SessionTarget>,
}

impl SessionSnapshot {
    pub fn is_idle(&self) -> bool {
        self.active_sessions.is_empty()
    }
}

/// Keeps a straddle of pending orders around price for every instrument of
/// every open session.
pub struct SessionOrderStrategy {
    config: SessionOrderConfig,
    calendar: SessionCalendar,
    broker: Arc<dyn BrokerGateway>,
    orders: OrderLifecycleManager,
    positions: PositionManager,
    distance: DistanceCalculator,
}

impl SessionOrderStrategy {
    pub fn new(config: SessionOrderConfig, broker: Arc<dyn BrokerGateway>) -> Result<Self> {
        let calendar = config.build_calendar()?;
        let distance = DistanceCalculator::new(config.distance.clone());
        let orders =
            OrderLifecycleManager::new(broker.clone(), config.orders.clone(), distance.clone());
        Ok(Self {
            positions: PositionManager::new(broker.clone()),
            config,
            calendar,
            broker,
            orders,
            distance,
        })
    }

    pub fn calendar(&self) -> &SessionCalendar {
        &self.calendar
    }

    /// Instruments and sides to work at `now`, first session wins on overlap
    pub fn targets_at(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let active = self.calendar.active_sessions(now);
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for session in &active {
            for side in &self.config.sides {
                for symbol in session.symbols_for(*side) {
                    if seen.insert((symbol.clone(), *side)) {
                        targets.push(SessionTarget {
                            symbol: symbol.clone(),
                            side: *side,
                            session: session.name.clone(),
                        });
                    }
                }
            }
        }
        SessionSnapshot {
            active_sessions: active.iter().map(|s| s.name.clone()).collect(),
            targets,
        }
    }

    fn calendar_symbols(&self) -> HashSet<String> {
        self.calendar
            .sessions()
            .iter()
            .flat_map(|s| s.all_symbols().cloned())
            .collect()
    }

    async fn trailing_distance(&self, symbol: &str) -> Result<f64> {
        let candles = self
            .broker
            .candles(symbol, self.config.orders.candle_timeframe, 2)
            .await?;
        let range = completed_candle(&candles)
            .map(|c| c.range())
            .ok_or_else(|| BotError::data_unavailable(symbol, "completed candle"))?;
        let tick = self.broker.tick(symbol).await?;
        Ok(self.distance.trailing_offset(symbol, range, tick.spread()))
    }

    /// Close positions and cancel pending orders on every calendar instrument
    async fn flatten(&self) -> Result<Vec<ExecutionReport>> {
        let symbols = self.calendar_symbols();
        let mut reports = Vec::new();

        let open: Vec<String> = symbols.iter().cloned().collect();
        reports.extend(
            self.positions
                .close_positions_for(&open, ExitReason::SessionEnd)
                .await?,
        );

        let mut pending: Vec<String> = self
            .broker
            .pending_orders(None)
            .await?
            .into_iter()
            .map(|o| o.symbol)
            .filter(|s| symbols.contains(s))
            .collect();
        pending.sort();
        pending.dedup();
        for symbol in pending {
            let report = self.orders.cancel_all_pending(&symbol, None).await?;
            reports.extend(to_execution_reports(&report));
        }
        Ok(reports)
    }
}

/// Flatten a lifecycle report into per-order execution reports
pub fn to_execution_reports(report: &ReconcileReport) -> Vec<ExecutionReport> {
    let symbol = &report.symbol;
    let mut reports = Vec::new();
    for ticket in report.expired() {
        reports.push(
            ExecutionReport::new(symbol, ReportAction::Expired, "order expired")
                .with_ticket(Some(ticket)),
        );
    }
    for ticket in report.cancelled() {
        reports.push(
            ExecutionReport::new(symbol, ReportAction::Cancelled, "replaced")
                .with_ticket(Some(ticket)),
        );
    }
    for ticket in report.placed() {
        reports.push(
            ExecutionReport::new(symbol, ReportAction::Placed, format!("{} straddle", report.side))
                .with_ticket(Some(ticket)),
        );
    }
    for failure in &report.failures {
        reports.push(
            ExecutionReport::new(
                symbol,
                ReportAction::Rejected,
                format!("{}: {}", failure.retcode, failure.comment),
            )
            .with_ticket(failure.ticket),
        );
    }
    match &report.skipped {
        Some(SkipReason::NoLevels(why)) => {
            reports.push(ExecutionReport::new(symbol, ReportAction::Skipped, why.clone()))
        }
        Some(SkipReason::AtCapacity { open, max }) => reports.push(ExecutionReport::new(
            symbol,
            ReportAction::Skipped,
            format!("at capacity {open}/{max}"),
        )),
        None => {}
    }
    reports
}

#[async_trait]
impl Strategy for SessionOrderStrategy {
    type Analysis = SessionSnapshot;

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn initialize(&mut self) -> Result<()> {
        tracing::info!("📅 {} sessions:", self.config.name);
        for session in self.calendar.sessions() {
            tracing::info!("  {}", session);
        }
        tracing::info!(
            "  sides {:?}, max {} per side, volume {}",
            self.config.sides,
            self.config.orders.max_positions,
            self.config.orders.volume
        );
        Ok(())
    }

    async fn analyze_market(&mut self, now: DateTime<Utc>) -> Result<SessionSnapshot> {
        let snapshot = self.targets_at(now);
        if snapshot.is_idle() {
            match self.calendar.next_session(now) {
                Some((next, wait)) => tracing::info!(
                    "No active trading session, {} opens in {} min",
                    next.name,
                    wait.num_minutes()
                ),
                None => tracing::info!("No active trading session"),
            }
        } else {
            tracing::info!(
                "Active sessions: {} ({} targets)",
                snapshot.active_sessions.join(", "),
                snapshot.targets.len()
            );
        }
        Ok(snapshot)
    }

    async fn generate_signals(
        &mut self,
        analysis: &SessionSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        Ok(analysis
            .targets
            .iter()
            .map(|t| TradeSignal::reconcile(&t.symbol, t.side, &t.session, now))
            .collect())
    }

    async fn execute_signals(
        &mut self,
        signals: &[TradeSignal],
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();
        for signal in signals {
            let SignalKind::Reconcile { session } = &signal.kind else {
                continue;
            };
            match self
                .orders
                .reconcile(&signal.symbol, signal.side, session, now)
                .await
            {
                Ok(report) => reports.extend(to_execution_reports(&report)),
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        "Error placing orders for {} {}: {}",
                        signal.symbol,
                        signal.side,
                        e
                    );
                    reports.push(ExecutionReport::new(
                        &signal.symbol,
                        ReportAction::Rejected,
                        e.to_string(),
                    ));
                }
            }
        }
        Ok(reports)
    }

    async fn manage_positions(
        &mut self,
        analysis: &SessionSnapshot,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        if analysis.is_idle() {
            if self.config.flatten_outside_sessions {
                return self.flatten().await;
            }
            return Ok(Vec::new());
        }
        if !self.config.trail_stops {
            return Ok(Vec::new());
        }

        let mut symbols: Vec<String> = self
            .broker
            .positions(None)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .filter(|s| analysis.targets.iter().any(|t| t.symbol == *s))
            .collect();
        symbols.sort();
        symbols.dedup();

        let mut reports = Vec::new();
        for symbol in symbols {
            let outcome = match self.trailing_distance(&symbol).await {
                Ok(distance) => self.positions.trail_stops(&symbol, distance).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(trailed) => reports.extend(trailed),
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => tracing::warn!("Trailing skipped for {}: {}", symbol, e),
            }
        }
        Ok(reports)
    }
}
