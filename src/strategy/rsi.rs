use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::BrokerGateway;
use crate::execution::Executor;
use crate::indicators::{calculate_rsi, RsiZone};
use crate::models::{ExecutionReport, ReportAction, Side, Timeframe, TradeSignal};
use crate::pricing::pip_value;
use crate::risk::risk_position_size;
use crate::strategy::Strategy;
use crate::Result;

/// RSI reversal on a single instrument
///
/// Entry conditions:
/// - BUY when RSI is at or below `oversold`
/// - SELL when RSI is at or above `overbought`
/// - never the same direction twice in a row, never stacked on an open position
///
/// Exits are left to the broker: a fixed pip stop and a target at
/// `reward_ratio` times the stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RsiConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub rsi_period: usize,
    pub overbought: f64,
    pub oversold: f64,
    /// Balance share risked per trade, in percent
    pub risk_percent: f64,
    pub stop_loss_pips: f64,
    pub reward_ratio: f64,
    /// Bars requested from the terminal each tick
    pub lookback: usize,
    pub magic: u64,
}

impl Default for RsiConfig {
    fn default() -> Self {
        Self {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::H1,
            rsi_period: 14,
            overbought: 70.0,
            oversold: 30.0,
            risk_percent: 1.0,
            stop_loss_pips: 50.0, // fixed 50 pip stop
            reward_ratio: 2.0,    // 2:1 target
            lookback: 100,
            magic: 234100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RsiAnalysis {
    pub rsi: Option<f64>,
    pub zone: RsiZone,
    pub close: Option<f64>,
}

pub struct RsiStrategy {
    config: RsiConfig,
    broker: Arc<dyn BrokerGateway>,
    executor: Executor,
    last_signal: Option<Side>,
}

impl RsiStrategy {
    pub fn new(config: RsiConfig, broker: Arc<dyn BrokerGateway>) -> Self {
        let executor = Executor::new(broker.clone(), "fxbot rsi", config.magic);
        Self {
            config,
            broker,
            executor,
            last_signal: None,
        }
    }

    pub fn last_signal(&self) -> Option<Side> {
        self.last_signal
    }

    fn side_for(zone: RsiZone) -> Option<Side> {
        match zone {
            RsiZone::Oversold => Some(Side::Buy),
            RsiZone::Overbought => Some(Side::Sell),
            RsiZone::Neutral => None,
        }
    }
}

#[async_trait]
impl Strategy for RsiStrategy {
    type Analysis = RsiAnalysis;

    fn name(&self) -> &str {
        "rsi"
    }

    async fn initialize(&mut self) -> Result<()> {
        tracing::info!(
            "Starting RSI strategy for {} on {} (period {}, {}/{})",
            self.config.symbol,
            self.config.timeframe,
            self.config.rsi_period,
            self.config.oversold,
            self.config.overbought
        );
        // Fails early on unknown symbols
        self.broker.symbol_info(&self.config.symbol).await?;
        Ok(())
    }

    async fn analyze_market(&mut self, _now: DateTime<Utc>) -> Result<RsiAnalysis> {
        let candles = self
            .broker
            .candles(&self.config.symbol, self.config.timeframe, self.config.lookback)
            .await?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi = calculate_rsi(&closes, self.config.rsi_period);
        let zone = rsi
            .map(|r| RsiZone::classify(r, self.config.oversold, self.config.overbought))
            .unwrap_or(RsiZone::Neutral);

        match rsi {
            Some(value) => tracing::info!(
                "Market analysis: {} RSI={:.2} ({:?})",
                self.config.symbol,
                value,
                zone
            ),
            None => tracing::warn!(
                "Not enough {} bars for RSI({}) on {}",
                self.config.timeframe,
                self.config.rsi_period,
                self.config.symbol
            ),
        }

        Ok(RsiAnalysis {
            rsi,
            zone,
            close: closes.last().copied(),
        })
    }

    async fn generate_signals(
        &mut self,
        analysis: &RsiAnalysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        let Some(side) = Self::side_for(analysis.zone) else {
            return Ok(Vec::new());
        };
        if self.last_signal == Some(side) {
            tracing::debug!("{} signal repeats the previous one, skipping", side);
            return Ok(Vec::new());
        }

        let symbol = &self.config.symbol;
        let positions = self.broker.positions(Some(symbol)).await?;
        if positions.iter().any(|p| p.side == side) {
            tracing::info!("Already holding a {} position on {}", side, symbol);
            return Ok(Vec::new());
        }

        let tick = self.broker.tick(symbol).await?;
        let info = self.broker.symbol_info(symbol).await?;
        let account = self.broker.account_info().await?;

        let price = tick.price_for(side);
        let stop_distance = self.config.stop_loss_pips * pip_value(symbol);
        let volume = risk_position_size(
            account.balance,
            self.config.risk_percent,
            stop_distance,
            &info,
        );
        let sign = side.sign();
        let stop_loss = info.round_price(price - sign * stop_distance);
        let take_profit = info.round_price(price + sign * stop_distance * self.config.reward_ratio);

        let rsi = analysis.rsi.unwrap_or_default();
        Ok(vec![TradeSignal::market(symbol, side, volume, price, now)
            .with_stops(Some(stop_loss), Some(take_profit))
            .with_reason(format!("RSI {rsi:.1}"))])
    }

    async fn execute_signals(
        &mut self,
        signals: &[TradeSignal],
        _now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        let reports = self.executor.execute_all(signals).await?;
        for (signal, report) in signals.iter().zip(&reports) {
            if report.action == ReportAction::Opened {
                self.last_signal = Some(signal.side);
            }
        }
        Ok(reports)
    }

    async fn manage_positions(
        &mut self,
        _analysis: &RsiAnalysis,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        Ok(Vec::new())
    }
}
