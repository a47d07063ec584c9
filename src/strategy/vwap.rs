use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::BrokerGateway;
use crate::execution::{ExitReason, Executor, PositionManager};
use crate::indicators::{calculate_vwap_bands, VwapBands};
use crate::models::{ExecutionReport, ReportAction, Side, Timeframe, TradeSignal};
use crate::pricing::contract_size;
use crate::risk::{risk_position_size, DailyLimits, DayState};
use crate::session::TradingHours;
use crate::strategy::Strategy;
use crate::Result;

fn default_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default()
}

fn default_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default()
}

/// VWAP mean reversion inside a daily trading window
///
/// Entry conditions (ALL must be true):
/// - Close is outside the VWAP band (`band_std` deviations)
/// - Deviation from VWAP is at least `vwap_deviation` deviations
/// - Average volume over `volume_window` bars is at least `min_volume`
/// - No position on the symbol, daily limits not tripped, not in the last
///   `no_entry_minutes` of the window
///
/// Exit conditions (ANY triggers exit):
/// - Price reaches VWAP
/// - Fewer than `flatten_minutes` left in the window, or the window is closed
/// - Broker-side stop at `stop_std` deviations from entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VwapConfig {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    /// Bars requested each tick
    pub lookback: usize,
    pub band_window: usize,
    pub band_std: f64,
    /// Minimum distance from VWAP, in deviations, to enter
    pub vwap_deviation: f64,
    pub stop_std: f64,
    pub min_volume: f64,
    pub volume_window: usize,
    pub risk_percent: f64,
    pub max_volume: f64,
    /// Signals whose price moved more than this (%) before execution are dropped
    pub max_price_drift_pct: f64,
    pub no_entry_minutes: i64,
    pub flatten_minutes: i64,
    pub timezone: String,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub limits: DailyLimits,
    pub magic: u64,
}

impl Default for VwapConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["EURUSD".to_string(), "GBPUSD".to_string(), "USDJPY".to_string()],
            timeframe: Timeframe::M5,
            lookback: 30,             // band window plus warm-up
            band_window: 20,
            band_std: 2.0,
            vwap_deviation: 1.5,
            stop_std: 1.0,
            min_volume: 100.0,        // tick volume per bar
            volume_window: 5,
            risk_percent: 1.0,
            max_volume: 0.5,
            max_price_drift_pct: 0.2,
            no_entry_minutes: 15,
            flatten_minutes: 5,
            timezone: "America/New_York".to_string(),
            market_open: default_open(),
            market_close: default_close(),
            limits: DailyLimits::default(),
            magic: 234200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VwapAnalysis {
    pub is_open: bool,
    pub time_to_close: Option<Duration>,
    pub bands: Vec<(String, VwapBands)>,
}

impl VwapAnalysis {
    fn bands_for(&self, symbol: &str) -> Option<&VwapBands> {
        self.bands.iter().find(|(s, _)| s == symbol).map(|(_, b)| b)
    }
}

pub struct VwapReversionStrategy {
    config: VwapConfig,
    hours: TradingHours,
    broker: Arc<dyn BrokerGateway>,
    executor: Executor,
    positions: PositionManager,
    day: DayState,
}

impl VwapReversionStrategy {
    pub fn new(config: VwapConfig, broker: Arc<dyn BrokerGateway>) -> Result<Self> {
        let hours = TradingHours::new(&config.timezone, config.market_open, config.market_close)?;
        let day = DayState::new(hours.trading_day(Utc::now()), &config.limits);
        Ok(Self {
            executor: Executor::new(broker.clone(), "fxbot vwap", config.magic),
            positions: PositionManager::new(broker.clone()),
            config,
            hours,
            broker,
            day,
        })
    }

    pub fn day_state(&self) -> &DayState {
        &self.day
    }

    fn entry_side(&self, bands: &VwapBands) -> Option<Side> {
        if bands.below_lower() && bands.deviation <= -self.config.vwap_deviation {
            Some(Side::Buy)
        } else if bands.above_upper() && bands.deviation >= self.config.vwap_deviation {
            Some(Side::Sell)
        } else {
            None
        }
    }

    fn within(&self, time_to_close: Option<Duration>, minutes: i64) -> bool {
        time_to_close.map_or(true, |left| left < Duration::minutes(minutes))
    }

    fn record_closes(&mut self, reports: &[ExecutionReport]) {
        for report in reports {
            if report.action == ReportAction::Closed {
                if let Some(profit) = report.profit {
                    self.day.record_pnl(profit);
                }
            }
        }
    }
}

#[async_trait]
impl Strategy for VwapReversionStrategy {
    type Analysis = VwapAnalysis;

    fn name(&self) -> &str {
        "vwap"
    }

    async fn initialize(&mut self) -> Result<()> {
        tracing::info!(
            "Starting VWAP reversion on {:?} ({} {}-{} {})",
            self.config.symbols,
            self.config.timeframe,
            self.config.market_open,
            self.config.market_close,
            self.config.timezone
        );
        for symbol in &self.config.symbols {
            self.broker.symbol_info(symbol).await?;
        }
        Ok(())
    }

    async fn analyze_market(&mut self, now: DateTime<Utc>) -> Result<VwapAnalysis> {
        self.day.roll(self.hours.trading_day(now), &self.config.limits);

        let is_open = self.hours.is_open(now);
        let mut analysis = VwapAnalysis {
            is_open,
            time_to_close: self.hours.time_to_close(now),
            bands: Vec::new(),
        };
        if !is_open {
            tracing::debug!("Trading window closed, opens in {}", self.hours.time_to_open(now));
            return Ok(analysis);
        }

        for symbol in &self.config.symbols {
            let candles = match self
                .broker
                .candles(symbol, self.config.timeframe, self.config.lookback)
                .await
            {
                Ok(candles) => candles,
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    tracing::warn!("No {} bars for {}: {}", self.config.timeframe, symbol, e);
                    continue;
                }
            };
            match calculate_vwap_bands(
                &candles,
                self.config.band_window,
                self.config.band_std,
                self.config.volume_window,
            ) {
                Some(bands) => {
                    tracing::info!(
                        "{}: close {:.5} vwap {:.5} deviation {:.2}",
                        symbol,
                        bands.close,
                        bands.vwap,
                        bands.deviation
                    );
                    analysis.bands.push((symbol.clone(), bands));
                }
                None => tracing::warn!("Not enough bars for VWAP bands on {}", symbol),
            }
        }
        Ok(analysis)
    }

    async fn generate_signals(
        &mut self,
        analysis: &VwapAnalysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        if !analysis.is_open {
            return Ok(Vec::new());
        }
        if let Err(trip) = self.config.limits.check(&self.day) {
            tracing::info!("Daily limit reached ({:?}), no new entries", trip);
            return Ok(Vec::new());
        }
        if self.within(analysis.time_to_close, self.config.no_entry_minutes) {
            tracing::debug!("Too close to the close for new entries");
            return Ok(Vec::new());
        }

        let account = self.broker.account_info().await?;
        let mut signals = Vec::new();
        for (symbol, bands) in &analysis.bands {
            let Some(side) = self.entry_side(bands) else {
                continue;
            };
            if bands.average_volume < self.config.min_volume {
                tracing::info!(
                    "{} {} skipped: average volume {:.0} below {:.0}",
                    symbol,
                    side,
                    bands.average_volume,
                    self.config.min_volume
                );
                continue;
            }
            if !self.broker.positions(Some(symbol)).await?.is_empty() {
                continue;
            }

            let info = self.broker.symbol_info(symbol).await?;
            let stop_distance = bands.std_dev * self.config.stop_std;
            let volume = risk_position_size(
                account.balance,
                self.config.risk_percent,
                stop_distance,
                &info,
            )
            .min(self.config.max_volume);
            let entry = bands.close;
            let stop_loss = info.round_price(entry - side.sign() * stop_distance);
            let take_profit = info.round_price(bands.vwap);

            signals.push(
                TradeSignal::market(symbol, side, volume, entry, now)
                    .with_stops(Some(stop_loss), Some(take_profit))
                    .with_reason(format!("VWAP deviation {:.2}", bands.deviation)),
            );
        }
        Ok(signals)
    }

    /// Drops stale signals and fits the rest into today's limits
    async fn manage_risk(
        &mut self,
        signals: Vec<TradeSignal>,
        _now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        let mut approved = Vec::new();
        for mut signal in signals {
            if self.day.trades >= self.config.limits.max_daily_trades {
                tracing::info!("Daily trade limit reached, dropping {}", signal.symbol);
                break;
            }

            let tick = self.broker.tick(&signal.symbol).await?;
            let price = tick.price_for(signal.side);
            let drift = (price - signal.reference_price).abs() / signal.reference_price * 100.0;
            if drift > self.config.max_price_drift_pct {
                tracing::info!("{} moved {:.2}% since the signal, dropping", signal.symbol, drift);
                continue;
            }
            if let Some(vwap) = signal.take_profit {
                if (vwap - price) * signal.side.sign() <= 0.0 {
                    tracing::info!("{} already back at VWAP, dropping", signal.symbol);
                    continue;
                }
            }

            let Some(volume) =
                self.config
                    .limits
                    .fit_volume(&self.day, &signal.symbol, price, signal.volume)
            else {
                tracing::info!("No daily capital left for {}", signal.symbol);
                continue;
            };
            signal.volume = volume;
            self.day
                .record_trade(volume * price * contract_size(&signal.symbol));
            approved.push(signal);
        }
        Ok(approved)
    }

    async fn execute_signals(
        &mut self,
        signals: &[TradeSignal],
        _now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        self.executor.execute_all(signals).await
    }

    async fn manage_positions(
        &mut self,
        analysis: &VwapAnalysis,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        if !analysis.is_open || self.within(analysis.time_to_close, self.config.flatten_minutes) {
            let reports = self
                .positions
                .close_positions_for(&self.config.symbols, ExitReason::SessionEnd)
                .await?;
            if !reports.is_empty() {
                tracing::info!("🔔 Flattened {} positions before the close", reports.len());
            }
            self.record_closes(&reports);
            return Ok(reports);
        }

        let mut reports = Vec::new();
        for symbol in &self.config.symbols {
            let Some(bands) = analysis.bands_for(symbol) else {
                continue;
            };
            let open = self.positions.open_positions(Some(symbol)).await?;
            if open.is_empty() {
                continue;
            }
            let tick = self.broker.tick(symbol).await?;
            for position in &open {
                let price = tick.exit_price_for(position.side);
                let to_vwap = position.price_move(bands.vwap);
                if position.price_move(price) >= to_vwap {
                    reports.push(self.positions.close(position, ExitReason::TargetReached).await?);
                } else if to_vwap > 0.0 {
                    if let Some(report) = self
                        .positions
                        .move_to_breakeven(position, price, to_vwap / 2.0)
                        .await?
                    {
                        reports.push(report);
                    }
                }
            }
        }
        self.record_closes(&reports);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::models::{Candle, Position};
    use chrono::TimeZone;

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    /// 29 flat bars at 1.1000 and a final flush down to 1.0950
    fn create_test_candles() -> Vec<Candle> {
        let start = utc(12, 13, 0);
        let mut candles: Vec<Candle> = (0..29)
            .map(|i| Candle {
                symbol: "EURUSD".to_string(),
                timeframe: Timeframe::M5,
                timestamp: start + Duration::minutes(5 * i),
                open: 1.1000,
                high: 1.1002,
                low: 1.0998,
                close: 1.1000,
                volume: 1000.0,
            })
            .collect();
        candles.push(Candle {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M5,
            timestamp: start + Duration::minutes(5 * 29),
            open: 1.1000,
            high: 1.1000,
            low: 1.0950,
            close: 1.0950,
            volume: 1000.0,
        });
        candles
    }

    fn config() -> VwapConfig {
        VwapConfig {
            symbols: vec!["EURUSD".to_string()],
            ..VwapConfig::default()
        }
    }

    async fn setup() -> (Arc<PaperBroker>, VwapReversionStrategy) {
        let broker = Arc::new(PaperBroker::default().with_symbol("EURUSD", 1.0950, 1.0951));
        broker.set_candles("EURUSD", Timeframe::M5, create_test_candles());
        broker.connect().await.unwrap();
        let strategy = VwapReversionStrategy::new(config(), broker.clone()).unwrap();
        (broker, strategy)
    }

    #[tokio::test]
    async fn test_flush_below_band_buys_back_to_vwap() {
        let (_broker, mut strategy) = setup().await;
        // 11:00 in New York
        let now = utc(12, 15, 0);

        let analysis = strategy.analyze_market(now).await.unwrap();
        assert!(analysis.is_open);
        let bands = analysis.bands_for("EURUSD").unwrap();
        assert!(bands.deviation < -1.5);

        let signals = strategy.generate_signals(&analysis, now).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert!(signals[0].stop_loss.unwrap() < 1.0950);
        assert!(signals[0].take_profit.unwrap() > 1.0990);
        assert!(signals[0].volume <= 0.5);

        let approved = strategy.manage_risk(signals, now).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(strategy.day_state().trades, 1);

        let reports = strategy.execute_signals(&approved, now).await.unwrap();
        assert_eq!(reports[0].action, ReportAction::Opened);
    }

    #[tokio::test]
    async fn test_no_entries_after_daily_limit_or_near_close() {
        let (_broker, mut strategy) = setup().await;
        let now = utc(12, 15, 0);
        let analysis = strategy.analyze_market(now).await.unwrap();

        strategy.day.trades = 5;
        assert!(strategy.generate_signals(&analysis, now).await.unwrap().is_empty());

        strategy.day.trades = 0;
        // 15:50 in New York, ten minutes left
        let late = utc(12, 19, 50);
        let analysis = strategy.analyze_market(late).await.unwrap();
        assert!(strategy.generate_signals(&analysis, late).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drifted_signal_is_dropped() {
        let (broker, mut strategy) = setup().await;
        let now = utc(12, 15, 0);
        let analysis = strategy.analyze_market(now).await.unwrap();
        let signals = strategy.generate_signals(&analysis, now).await.unwrap();

        broker.set_quote("EURUSD", 1.0980, 1.0981);
        let approved = strategy.manage_risk(signals, now).await.unwrap();
        assert!(approved.is_empty());
        assert_eq!(strategy.day_state().trades, 0);
    }

    #[tokio::test]
    async fn test_flatten_before_close() {
        let (broker, mut strategy) = setup().await;
        broker.insert_position(Position {
            ticket: 42,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: 0.1,
            open_price: 1.0940,
            stop_loss: None,
            take_profit: None,
            opened_at: utc(12, 15, 0),
            profit: 10.0,
            comment: String::new(),
        });

        // 15:57 in New York
        let now = utc(12, 19, 57);
        let analysis = strategy.analyze_market(now).await.unwrap();
        let reports = strategy.manage_positions(&analysis, now).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, ReportAction::Closed);
        assert!(broker.positions(None).await.unwrap().is_empty());
        assert_eq!(strategy.day_state().pnl, 10.0);
    }
}
