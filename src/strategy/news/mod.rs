// Economic news impact driver
pub mod calendar;
pub mod events;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::broker::BrokerGateway;
use crate::execution::{ExitReason, Executor, PositionManager};
use crate::indicators::average_range;
use crate::models::{Candle, ExecutionReport, Side, Timeframe, TradeSignal};
use crate::risk::risk_position_size;
use crate::strategy::Strategy;
use crate::Result;

pub use calendar::EconomicCalendar;
pub use events::{affected_symbols, extract_number, sentiment, EconomicEvent, Impact, NewsCategory};
pub use worker::{
    spawn_event_worker, CalendarSource, EventSource, EventWorkerConfig, EventWorkerHandle,
};

const ORDER_COMMENT: &str = "fxbot news";

/// Trades the first reaction to high-impact economic releases
///
/// Before a release:
/// - positions on affected symbols are closed `pre_news_buffer_minutes` ahead
/// - no new positions are opened while a release is that close
///
/// After a release (once `post_news_reaction_minutes` have passed):
/// - BUY/SELL in the direction of the first completed M1 bar
/// - stop at `volatility_factor` times the average hourly range, target at `target_ratio` stops
/// - skipped when the spread is above `max_spread_factor` times its usual level
///
/// Positions are closed after `position_hold_minutes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NewsConfig {
    /// JSON calendar; the built-in sample is used when absent
    pub calendar_path: Option<PathBuf>,
    /// Instruments the bot may trade; releases on other pairs are ignored
    pub symbols: Vec<String>,
    pub impact_threshold: f64,
    pub pre_news_buffer_minutes: i64,
    pub post_news_reaction_minutes: i64,
    pub position_hold_minutes: i64,
    pub volatility_factor: f64,
    pub target_ratio: f64,
    pub max_spread_factor: f64,
    pub risk_percent: f64,
    pub volatility_timeframe: Timeframe,
    pub volatility_bars: usize,
    pub poll_interval_ms: u64,
    pub channel_capacity: usize,
    pub magic: u64,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            calendar_path: None,
            symbols: ["EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "USDCAD", "USDCHF", "NZDUSD"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            impact_threshold: 0.7,        // high impact only
            pre_news_buffer_minutes: 5,
            post_news_reaction_minutes: 1,
            position_hold_minutes: 15,
            volatility_factor: 1.5,
            target_ratio: 2.0,
            max_spread_factor: 1.5,
            risk_percent: 1.0,
            volatility_timeframe: Timeframe::H1,
            volatility_bars: 100,
            poll_interval_ms: 1000,
            channel_capacity: 64,
            magic: 234400,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedEvent {
    event: EconomicEvent,
    flattened: bool,
    reacted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewsAnalysis {
    /// High-impact releases inside the pre-news buffer
    pub imminent: Vec<EconomicEvent>,
    /// Released high-impact events whose reaction window has passed
    pub reactions_due: Vec<EconomicEvent>,
    pub sentiment: f64,
}

pub struct NewsImpactStrategy {
    config: NewsConfig,
    calendar: Arc<EconomicCalendar>,
    broker: Arc<dyn BrokerGateway>,
    executor: Executor,
    positions: PositionManager,
    worker: Option<(EventWorkerHandle, JoinHandle<()>)>,
    tracked: Vec<TrackedEvent>,
    avg_spreads: HashMap<String, f64>,
    avg_volatility: HashMap<String, f64>,
    /// Set while a high-impact release is imminent
    blocked: bool,
}

impl NewsImpactStrategy {
    pub fn new(
        config: NewsConfig,
        calendar: EconomicCalendar,
        broker: Arc<dyn BrokerGateway>,
    ) -> Self {
        Self {
            executor: Executor::new(broker.clone(), ORDER_COMMENT, config.magic),
            positions: PositionManager::new(broker.clone()),
            config,
            calendar: Arc::new(calendar),
            broker,
            worker: None,
            tracked: Vec::new(),
            avg_spreads: HashMap::new(),
            avg_volatility: HashMap::new(),
            blocked: false,
        }
    }

    /// Calendar from `calendar_path`, or the sample calendar around `now`
    pub fn load_calendar(config: &NewsConfig, now: DateTime<Utc>) -> Result<EconomicCalendar> {
        match &config.calendar_path {
            Some(path) => EconomicCalendar::load(path),
            None => {
                tracing::info!("No calendar file configured, using the sample calendar");
                Ok(EconomicCalendar::sample(now))
            }
        }
    }

    /// Start following `event`, ignoring ones already tracked
    pub fn track_event(&mut self, event: EconomicEvent) {
        let key = event.key();
        if self.tracked.iter().any(|t| t.event.key() == key) {
            return;
        }
        tracing::info!(
            "📰 Tracking {} [{}], impact {:.1}",
            event,
            event.category(),
            event.impact.value()
        );
        self.tracked.push(TrackedEvent {
            event,
            flattened: false,
            reacted: false,
        });
    }

    fn is_relevant(&self, event: &EconomicEvent) -> bool {
        event.impact.value() >= self.config.impact_threshold
    }

    fn tradeable_symbols(&self, event: &EconomicEvent) -> Vec<String> {
        event
            .affected_symbols()
            .iter()
            .filter(|s| self.config.symbols.iter().any(|c| c == *s))
            .map(|s| s.to_string())
            .collect()
    }

    async fn load_market_data(&mut self) -> Result<()> {
        for symbol in &self.config.symbols {
            let candles = match self
                .broker
                .candles(symbol, self.config.volatility_timeframe, self.config.volatility_bars)
                .await
            {
                Ok(candles) => candles,
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    tracing::warn!("No volatility data for {}: {}", symbol, e);
                    continue;
                }
            };
            if let Some(volatility) = average_range(&candles) {
                self.avg_volatility.insert(symbol.clone(), volatility);
                tracing::info!("{} average range {:.5}", symbol, volatility);
            }
            match self.broker.symbol_info(symbol).await {
                Ok(info) => {
                    self.avg_spreads.insert(symbol.clone(), info.spread_price());
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => tracing::warn!("No symbol info for {}: {}", symbol, e),
            }
        }
        Ok(())
    }

    /// First bar that opened at or after the release and has closed by `now`
    fn reaction_candle<'a>(
        candles: &'a [Candle],
        release: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<&'a Candle> {
        candles.iter().find(|c| {
            c.timestamp >= release && c.timestamp + Duration::minutes(c.timeframe.minutes()) <= now
        })
    }

    async fn reaction_signal(
        &self,
        symbol: &str,
        event: &EconomicEvent,
        balance: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<TradeSignal>> {
        let minutes = (now - event.time).num_minutes().max(0) as usize;
        let candles = self.broker.candles(symbol, Timeframe::M1, minutes + 3).await?;
        let Some(candle) = Self::reaction_candle(&candles, event.time, now) else {
            tracing::debug!("No completed reaction bar yet for {}", symbol);
            return Ok(None);
        };
        let side = if candle.close > candle.open {
            Side::Buy
        } else if candle.close < candle.open {
            Side::Sell
        } else {
            return Ok(None);
        };

        let volatility = self
            .avg_volatility
            .get(symbol)
            .copied()
            .filter(|v| *v > 0.0)
            .unwrap_or_else(|| candle.range());
        if volatility <= 0.0 {
            return Ok(None);
        }

        let info = self.broker.symbol_info(symbol).await?;
        let tick = self.broker.tick(symbol).await?;
        let entry = tick.price_for(side);
        let stop = volatility * self.config.volatility_factor;
        let target = stop * self.config.target_ratio;
        let volume = risk_position_size(balance, self.config.risk_percent, stop, &info);
        let sign = side.sign();

        Ok(Some(
            TradeSignal::market(symbol, side, volume, entry, now)
                .with_stops(
                    Some(info.round_price(entry - sign * stop)),
                    Some(info.round_price(entry + sign * target)),
                )
                .with_reason(format!("News reaction: {}", event.name)),
        ))
    }
}

#[async_trait]
impl Strategy for NewsImpactStrategy {
    type Analysis = NewsAnalysis;

    fn name(&self) -> &str {
        "news_impact"
    }

    async fn initialize(&mut self) -> Result<()> {
        tracing::info!(
            "Starting news impact strategy: {} calendar events, threshold {:.1}",
            self.calendar.events().len(),
            self.config.impact_threshold
        );
        self.load_market_data().await?;

        let source = Arc::new(CalendarSource::new(self.calendar.clone()));
        let config = EventWorkerConfig {
            poll_interval: std::time::Duration::from_millis(self.config.poll_interval_ms),
            capacity: self.config.channel_capacity,
            ..EventWorkerConfig::default()
        };
        self.worker = Some(spawn_event_worker(source, config));
        Ok(())
    }

    async fn analyze_market(&mut self, now: DateTime<Utc>) -> Result<NewsAnalysis> {
        let delivered = match self.worker.as_mut() {
            Some((handle, _)) => handle.drain(),
            None => Vec::new(),
        };
        for event in delivered {
            self.track_event(event);
        }

        let horizon = Duration::minutes(self.config.position_hold_minutes + 30);
        self.tracked.retain(|t| t.event.time + horizon > now);

        let buffer = self.config.pre_news_buffer_minutes as f64;
        let reaction = Duration::minutes(self.config.post_news_reaction_minutes);
        let mut analysis = NewsAnalysis {
            sentiment: sentiment(self.tracked.iter().map(|t| &t.event)),
            ..NewsAnalysis::default()
        };
        for tracked in &self.tracked {
            if !self.is_relevant(&tracked.event) {
                continue;
            }
            let until = tracked.event.minutes_until(now);
            if until > 0.0 && until <= buffer {
                analysis.imminent.push(tracked.event.clone());
            }
            if !tracked.reacted && now >= tracked.event.time + reaction {
                analysis.reactions_due.push(tracked.event.clone());
            }
        }
        self.blocked = !analysis.imminent.is_empty();
        Ok(analysis)
    }

    async fn generate_signals(
        &mut self,
        analysis: &NewsAnalysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        if analysis.reactions_due.is_empty() {
            return Ok(Vec::new());
        }
        let account = self.broker.account_info().await?;
        let mut signals = Vec::new();
        for event in &analysis.reactions_due {
            tracing::info!("High-impact release out: {}", event);
            for symbol in self.tradeable_symbols(event) {
                match self.reaction_signal(&symbol, event, account.balance, now).await {
                    Ok(Some(signal)) => signals.push(signal),
                    Ok(None) => {}
                    Err(e) if e.is_connectivity() => return Err(e),
                    Err(e) => tracing::warn!("No reaction signal for {}: {}", symbol, e),
                }
            }
            let key = event.key();
            if let Some(tracked) = self.tracked.iter_mut().find(|t| t.event.key() == key) {
                tracked.reacted = true;
            }
        }
        Ok(signals)
    }

    async fn manage_risk(
        &mut self,
        signals: Vec<TradeSignal>,
        _now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        if self.blocked {
            tracing::info!("High-impact news imminent, not opening {} positions", signals.len());
            return Ok(Vec::new());
        }
        let mut approved = Vec::new();
        for signal in signals {
            let usual = self.avg_spreads.get(&signal.symbol).copied().unwrap_or(0.0);
            if usual > 0.0 {
                let spread = self.broker.tick(&signal.symbol).await?.spread();
                if spread > usual * self.config.max_spread_factor {
                    tracing::info!(
                        "Skipping {}: spread {:.5} above {:.5}",
                        signal.symbol,
                        spread,
                        usual * self.config.max_spread_factor
                    );
                    continue;
                }
            }
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
        analysis: &NewsAnalysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();

        for event in &analysis.imminent {
            let key = event.key();
            let Some(index) = self.tracked.iter().position(|t| t.event.key() == key) else {
                continue;
            };
            if self.tracked[index].flattened {
                continue;
            }
            let symbols: Vec<String> = event
                .affected_symbols()
                .iter()
                .map(|s| s.to_string())
                .collect();
            tracing::info!("⚠️  {} imminent, closing positions on {:?}", event, symbols);
            reports.extend(
                self.positions
                    .close_positions_for(&symbols, ExitReason::NewsRisk)
                    .await?,
            );
            self.tracked[index].flattened = true;
        }

        let hold = Duration::minutes(self.config.position_hold_minutes);
        for position in self.positions.open_positions(None).await? {
            if position.comment == ORDER_COMMENT && now - position.opened_at >= hold {
                reports.push(self.positions.close(&position, ExitReason::TimeStop).await?);
            }
        }
        Ok(reports)
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some((handle, join)) = self.worker.take() {
            handle.shutdown();
            if tokio::time::timeout(std::time::Duration::from_secs(5), join)
                .await
                .is_err()
            {
                tracing::warn!("News event worker did not stop in time");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::models::{Position, ReportAction};
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, h, m, 0).unwrap()
    }

    fn nfp() -> EconomicEvent {
        EconomicEvent {
            time: utc(12, 30),
            country: "US".to_string(),
            currency: "USD".to_string(),
            name: "Non-Farm Payrolls".to_string(),
            impact: Impact::High,
            forecast: "200K".to_string(),
            previous: "180K".to_string(),
        }
    }

    fn m1(minute: u32, open: f64, close: f64) -> Candle {
        Candle {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M1,
            timestamp: utc(12, minute),
            open,
            high: open.max(close) + 0.0002,
            low: open.min(close) - 0.0002,
            close,
            volume: 300.0,
        }
    }

    fn config() -> NewsConfig {
        NewsConfig {
            symbols: vec!["EURUSD".to_string()],
            ..NewsConfig::default()
        }
    }

    async fn setup() -> (Arc<PaperBroker>, NewsImpactStrategy) {
        let broker = Arc::new(PaperBroker::default().with_symbol("EURUSD", 1.0850, 1.0851));
        broker.set_candles(
            "EURUSD",
            Timeframe::M1,
            vec![
                m1(29, 1.0800, 1.0805),
                m1(30, 1.0805, 1.0840),
                m1(31, 1.0840, 1.0850),
            ],
        );
        broker.connect().await.unwrap();
        let mut strategy =
            NewsImpactStrategy::new(config(), EconomicCalendar::default(), broker.clone());
        strategy.avg_volatility.insert("EURUSD".to_string(), 0.0010);
        strategy.track_event(nfp());
        (broker, strategy)
    }

    fn news_position(opened_at: DateTime<Utc>) -> Position {
        Position {
            ticket: 9,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: 0.1,
            open_price: 1.0840,
            stop_loss: None,
            take_profit: None,
            opened_at,
            profit: 0.0,
            comment: ORDER_COMMENT.to_string(),
        }
    }

    #[tokio::test]
    async fn test_imminent_release_flattens_and_blocks() {
        let (broker, mut strategy) = setup().await;
        broker.insert_position(news_position(utc(12, 20)));

        let now = utc(12, 27);
        let analysis = strategy.analyze_market(now).await.unwrap();
        assert_eq!(analysis.imminent.len(), 1);
        assert!(analysis.reactions_due.is_empty());

        let reports = strategy.manage_positions(&analysis, now).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, ReportAction::Closed);
        assert!(reports[0].reason.contains("news"));

        let signal = TradeSignal::market("EURUSD", Side::Buy, 0.1, 1.0851, now);
        assert!(strategy.manage_risk(vec![signal], now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trades_direction_of_first_bar_once() {
        let (_broker, mut strategy) = setup().await;

        // reaction window not over yet
        let early = utc(12, 30);
        let analysis = strategy.analyze_market(early).await.unwrap();
        assert!(analysis.reactions_due.is_empty());

        let now = utc(12, 32);
        let analysis = strategy.analyze_market(now).await.unwrap();
        assert_eq!(analysis.reactions_due.len(), 1);
        assert!(analysis.sentiment > 0.0);

        let signals = strategy.generate_signals(&analysis, now).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        // 10 pip average range * 1.5 = 15 pip stop, 30 pip target from the ask
        assert_eq!(signals[0].stop_loss, Some(1.08360));
        assert_eq!(signals[0].take_profit, Some(1.08810));

        let approved = strategy.manage_risk(signals, now).await.unwrap();
        assert_eq!(approved.len(), 1);

        let analysis = strategy.analyze_market(utc(12, 33)).await.unwrap();
        assert!(analysis.reactions_due.is_empty());
    }

    #[tokio::test]
    async fn test_hold_time_closes_news_positions() {
        let (broker, mut strategy) = setup().await;
        broker.insert_position(news_position(utc(12, 31)));

        let analysis = strategy.analyze_market(utc(12, 40)).await.unwrap();
        assert!(strategy
            .manage_positions(&analysis, utc(12, 40))
            .await
            .unwrap()
            .is_empty());

        let analysis = strategy.analyze_market(utc(12, 46)).await.unwrap();
        let reports = strategy.manage_positions(&analysis, utc(12, 46)).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ticket, Some(9));
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let broker = Arc::new(PaperBroker::default().with_symbol("EURUSD", 1.0850, 1.0851));
        broker.connect().await.unwrap();
        let calendar = EconomicCalendar::new(vec![EconomicEvent {
            time: Utc::now() + Duration::minutes(3),
            ..nfp()
        }]);
        let config = NewsConfig {
            poll_interval_ms: 10,
            ..config()
        };
        let mut strategy = NewsImpactStrategy::new(config, calendar, broker);
        strategy.initialize().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let analysis = strategy.analyze_market(Utc::now()).await.unwrap();
        assert_eq!(analysis.imminent.len(), 1);

        strategy.shutdown().await.unwrap();
        assert!(strategy.worker.is_none());
    }
}
