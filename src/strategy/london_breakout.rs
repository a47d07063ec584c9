use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::BrokerGateway;
use crate::execution::{Executor, PositionManager};
use crate::models::{
    round_to, Candle, ExecutionReport, OrderKind, ReportAction, Timeframe, TradeSignal,
};
use crate::pricing::pip_value;
use crate::risk::risk_position_size;
use crate::session::Session;
use crate::strategy::Strategy;
use crate::Result;

const ORDER_COMMENT: &str = "fxbot london";

/// London open breakout
///
/// Measures the high/low range of the hours before London opens, then at the
/// open brackets it with a buy stop above and a sell stop below. Whatever is
/// still pending when London closes is cancelled.
///
/// Exit conditions (ANY triggers exit):
/// - Broker-side stop (`stop_loss_factor` ranges) or target (`take_profit_factor` ranges)
/// - Position older than `max_trade_hours`
///
/// The stop moves to breakeven once price has travelled one range in favour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LondonBreakoutConfig {
    pub symbols: Vec<String>,
    /// London session in UTC
    pub session_open: NaiveTime,
    pub session_close: NaiveTime,
    /// Hours before the open that make up the range
    pub range_hours: i64,
    pub range_timeframe: Timeframe,
    /// Minutes before the open at which the range is measured
    pub prepare_minutes: i64,
    /// Breakouts are only placed this long after the open
    pub max_entry_delay_minutes: i64,
    /// Entry distance beyond the range, in ranges
    pub breakout_trigger: f64,
    pub stop_loss_factor: f64,
    pub take_profit_factor: f64,
    pub max_spread_pips: f64,
    pub max_trade_hours: i64,
    pub risk_percent: f64,
    pub magic: u64,
}

impl Default for LondonBreakoutConfig {
    fn default() -> Self {
        Self {
            symbols: ["EURUSD", "GBPUSD", "USDJPY", "EURGBP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            session_open: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            session_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            range_hours: 3,
            range_timeframe: Timeframe::M15,
            prepare_minutes: 30,
            max_entry_delay_minutes: 30,
            breakout_trigger: 0.5,   // half a range past the edge
            stop_loss_factor: 1.0,
            take_profit_factor: 2.0, // 2:1 on the range
            max_spread_pips: 1.5,
            max_trade_hours: 6,
            risk_percent: 1.0,
            magic: 234300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakoutRange {
    pub high: f64,
    pub low: f64,
}

impl BreakoutRange {
    pub fn size(&self) -> f64 {
        self.high - self.low
    }

    pub fn mid(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

/// High and low of the candles opened in `[start, end)`
pub fn pre_session_range(
    candles: &[Candle],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<BreakoutRange> {
    candles
        .iter()
        .filter(|c| c.timestamp >= start && c.timestamp < end)
        .fold(None, |acc: Option<BreakoutRange>, c| {
            Some(match acc {
                Some(r) => BreakoutRange {
                    high: r.high.max(c.high),
                    low: r.low.min(c.low),
                },
                None => BreakoutRange {
                    high: c.high,
                    low: c.low,
                },
            })
        })
}

#[derive(Debug, Clone)]
pub struct LondonAnalysis {
    pub active: bool,
    /// Open of the current session, or of the next one while closed
    pub session_open: DateTime<Utc>,
    pub session_ended: bool,
    pub ranges: HashMap<String, BreakoutRange>,
}

pub struct LondonBreakoutStrategy {
    config: LondonBreakoutConfig,
    session: Session,
    broker: Arc<dyn BrokerGateway>,
    executor: Executor,
    positions: PositionManager,
    ranges: HashMap<String, BreakoutRange>,
    /// Session day the ranges belong to
    range_day: Option<NaiveDate>,
    placed_day: Option<NaiveDate>,
    was_active: bool,
}

impl LondonBreakoutStrategy {
    pub fn new(config: LondonBreakoutConfig, broker: Arc<dyn BrokerGateway>) -> Self {
        let session = Session::new("London", config.session_open, config.session_close)
            .with_symbols(&config.symbols.iter().map(String::as_str).collect::<Vec<_>>());
        Self {
            executor: Executor::new(broker.clone(), ORDER_COMMENT, config.magic),
            positions: PositionManager::new(broker.clone()),
            config,
            session,
            broker,
            ranges: HashMap::new(),
            range_day: None,
            placed_day: None,
            was_active: false,
        }
    }

    pub fn ranges(&self) -> &HashMap<String, BreakoutRange> {
        &self.ranges
    }

    /// Open of the session in progress, or of the next one
    fn session_open_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if !self.session.is_active(now) {
            return now + self.session.time_until_open(now);
        }
        let today = now.date_naive().and_time(self.session.start).and_utc();
        if today > now {
            today - Duration::days(1)
        } else {
            today
        }
    }

    async fn measure_ranges(&mut self, open: DateTime<Utc>) -> Result<()> {
        let start = open - Duration::hours(self.config.range_hours);
        let bars = (self.config.range_hours * 60 / self.config.range_timeframe.minutes()) as usize;
        tracing::info!(
            "Measuring pre-London range {} to {} UTC",
            start.format("%H:%M"),
            open.format("%H:%M")
        );

        self.ranges.clear();
        for symbol in &self.config.symbols {
            let candles = match self
                .broker
                .candles(symbol, self.config.range_timeframe, bars + 5)
                .await
            {
                Ok(candles) => candles,
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    tracing::warn!("No range data for {}: {}", symbol, e);
                    continue;
                }
            };
            match pre_session_range(&candles, start, open) {
                Some(range) if range.size() > 0.0 => {
                    tracing::info!(
                        "{} range: high {:.5} low {:.5} size {:.5}",
                        symbol,
                        range.high,
                        range.low,
                        range.size()
                    );
                    self.ranges.insert(symbol.clone(), range);
                }
                _ => tracing::warn!("No usable range for {}", symbol),
            }
        }
        self.range_day = Some(open.date_naive());
        Ok(())
    }

    fn breakout_signals(
        &self,
        symbol: &str,
        range: &BreakoutRange,
        volume: f64,
        digits: u32,
        now: DateTime<Utc>,
    ) -> [TradeSignal; 2] {
        let size = range.size();
        let round = |price: f64| round_to(price, digits);
        let buy_entry = range.high + size * self.config.breakout_trigger;
        let sell_entry = range.low - size * self.config.breakout_trigger;
        let expires = now + Duration::hours(self.config.max_trade_hours);
        let stop = size * self.config.stop_loss_factor;
        let target = size * self.config.take_profit_factor;

        [
            TradeSignal::pending(symbol, OrderKind::BuyStop, round(buy_entry), volume, now)
                .with_stops(Some(round(buy_entry - stop)), Some(round(buy_entry + target)))
                .with_reason("London breakout up")
                .expiring_at(expires),
            TradeSignal::pending(symbol, OrderKind::SellStop, round(sell_entry), volume, now)
                .with_stops(Some(round(sell_entry + stop)), Some(round(sell_entry - target)))
                .with_reason("London breakout down")
                .expiring_at(expires),
        ]
    }

    async fn cancel_breakout_orders(&self) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();
        for order in self.broker.pending_orders(None).await? {
            if order.comment != ORDER_COMMENT {
                continue;
            }
            let result = self.broker.cancel_order(order.ticket).await?;
            if result.is_success() {
                tracing::info!("Cancelled {} {} ticket {}", order.symbol, order.kind, order.ticket);
                reports.push(
                    ExecutionReport::new(
                        &order.symbol,
                        ReportAction::Cancelled,
                        "London session ended",
                    )
                    .with_ticket(Some(order.ticket)),
                );
            } else {
                tracing::warn!("Failed to cancel ticket {}: {}", order.ticket, result.comment);
                reports.push(
                    ExecutionReport::new(&order.symbol, ReportAction::Rejected, result.comment)
                        .with_ticket(Some(order.ticket)),
                );
            }
        }
        Ok(reports)
    }
}

#[async_trait]
impl Strategy for LondonBreakoutStrategy {
    type Analysis = LondonAnalysis;

    fn name(&self) -> &str {
        "london_breakout"
    }

    async fn initialize(&mut self) -> Result<()> {
        tracing::info!(
            "Starting London breakout on {:?} ({}, {}h range)",
            self.config.symbols,
            self.session,
            self.config.range_hours
        );
        Ok(())
    }

    async fn analyze_market(&mut self, now: DateTime<Utc>) -> Result<LondonAnalysis> {
        let active = self.session.is_active(now);
        let open = self.session_open_at(now);
        let session_ended = self.was_active && !active;
        self.was_active = active;

        let due = if active {
            true
        } else {
            open - now <= Duration::minutes(self.config.prepare_minutes)
        };
        if due && self.range_day != Some(open.date_naive()) {
            self.measure_ranges(open).await?;
        }

        Ok(LondonAnalysis {
            active,
            session_open: open,
            session_ended,
            ranges: self.ranges.clone(),
        })
    }

    async fn generate_signals(
        &mut self,
        analysis: &LondonAnalysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        if !analysis.active || self.placed_day == Some(analysis.session_open.date_naive()) {
            return Ok(Vec::new());
        }
        if now - analysis.session_open > Duration::minutes(self.config.max_entry_delay_minutes) {
            tracing::debug!("Too late in the session to place breakouts");
            return Ok(Vec::new());
        }

        let account = self.broker.account_info().await?;
        let mut signals = Vec::new();
        let mut symbols: Vec<&String> = analysis.ranges.keys().collect();
        symbols.sort();
        for symbol in symbols {
            let range = &analysis.ranges[symbol];
            let tick = self.broker.tick(symbol).await?;
            let max_spread = self.config.max_spread_pips * pip_value(symbol);
            if tick.spread() > max_spread {
                tracing::warn!(
                    "Spread too wide on {}: {:.5} > {:.5}",
                    symbol,
                    tick.spread(),
                    max_spread
                );
                continue;
            }
            let info = self.broker.symbol_info(symbol).await?;
            let volume = risk_position_size(
                account.balance,
                self.config.risk_percent,
                range.size() * self.config.stop_loss_factor,
                &info,
            );
            signals.extend(self.breakout_signals(symbol, range, volume, info.digits, now));
        }
        Ok(signals)
    }

    async fn execute_signals(
        &mut self,
        signals: &[TradeSignal],
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        let reports = self.executor.execute_all(signals).await?;
        // One attempt per session, filled or not
        self.placed_day = Some(self.session_open_at(now).date_naive());
        Ok(reports)
    }

    async fn manage_positions(
        &mut self,
        analysis: &LondonAnalysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();
        if analysis.session_ended {
            tracing::info!("🔔 London session ended, cancelling breakout orders");
            reports.extend(self.cancel_breakout_orders().await?);
        }

        for symbol in &self.config.symbols {
            let max_age = Duration::hours(self.config.max_trade_hours);
            reports.extend(
                self.positions
                    .close_older_than(Some(symbol), max_age, now)
                    .await?,
            );

            let Some(range) = analysis.ranges.get(symbol) else {
                continue;
            };
            let open = self.positions.open_positions(Some(symbol)).await?;
            if open.is_empty() {
                continue;
            }
            let tick = self.broker.tick(symbol).await?;
            for position in &open {
                let price = tick.exit_price_for(position.side);
                if let Some(report) = self
                    .positions
                    .move_to_breakeven(position, price, range.size())
                    .await?
                {
                    reports.push(report);
                }
            }
        }
        Ok(reports)
    }
}
