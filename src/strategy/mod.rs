// Trading strategy module
pub mod london_breakout;
pub mod news;
pub mod rsi;
pub mod runner;
pub mod session_orders;
pub mod vwap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ExecutionReport, TradeSignal};
use crate::Result;

pub use london_breakout::{LondonBreakoutConfig, LondonBreakoutStrategy};
pub use news::{NewsConfig, NewsImpactStrategy};
pub use rsi::{RsiConfig, RsiStrategy};
pub use runner::{RunStats, ShutdownHandle, StrategyRunner};
pub use session_orders::{SessionOrderConfig, SessionOrderStrategy};
pub use vwap::{VwapConfig, VwapReversionStrategy};

/// Six-stage pipeline every driver implements.
///
/// The runner calls the stages in declaration order once per tick. An empty
/// signal list ends the tick after `manage_positions`; `manage_risk` and
/// `execute_signals` only see non-empty lists.
#[async_trait]
pub trait Strategy: Send {
    /// Market snapshot shared by signal generation and position upkeep
    type Analysis: Send + Sync;

    fn name(&self) -> &str;

    /// One-off setup after the broker session is open
    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    async fn analyze_market(&mut self, now: DateTime<Utc>) -> Result<Self::Analysis>;

    async fn generate_signals(
        &mut self,
        analysis: &Self::Analysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>>;

    /// Filter or resize signals. Defaults to passing them through.
    async fn manage_risk(
        &mut self,
        signals: Vec<TradeSignal>,
        _now: DateTime<Utc>,
    ) -> Result<Vec<TradeSignal>> {
        Ok(signals)
    }

    async fn execute_signals(
        &mut self,
        signals: &[TradeSignal],
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>>;

    /// Exits, trailing and flattening. Runs every tick.
    async fn manage_positions(
        &mut self,
        analysis: &Self::Analysis,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>>;

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
