// Broker gateway: the terminal is the source of truth for quotes, orders and positions
pub mod paper;
pub mod rest;

use async_trait::async_trait;

use crate::models::{
    AccountInfo, Candle, OrderRequest, PendingOrder, Position, SymbolInfo, Tick, Timeframe,
    TradeResult,
};
use crate::Result;

pub use paper::PaperBroker;
pub use rest::TerminalBridgeClient;

/// Everything the bots consume from the trading terminal.
///
/// Mutating calls report broker-side refusals through `TradeResult::retcode`
/// and reserve `Err` for transport and availability problems. Nothing is
/// cached between calls.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Open the session and return the logged-in account
    async fn connect(&self) -> Result<AccountInfo>;

    async fn disconnect(&self) -> Result<()>;

    async fn account_info(&self) -> Result<AccountInfo>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn tick(&self, symbol: &str) -> Result<Tick>;

    /// Most recent `count` bars, oldest first. The last bar is still forming.
    async fn candles(&self, symbol: &str, timeframe: Timeframe, count: usize)
        -> Result<Vec<Candle>>;

    async fn pending_orders(&self, symbol: Option<&str>) -> Result<Vec<PendingOrder>>;

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>>;

    async fn send_order(&self, request: &OrderRequest) -> Result<TradeResult>;

    /// Replace protective stop and target of an open position
    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<TradeResult>;

    async fn cancel_order(&self, ticket: u64) -> Result<TradeResult>;

    async fn close_position(&self, ticket: u64) -> Result<TradeResult>;
}
