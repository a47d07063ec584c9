use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;

use crate::broker::BrokerGateway;
use crate::models::{round_to, ExecutionReport, Position, ReportAction};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TimeStop,
    /// Trading window or session is over
    SessionEnd,
    /// High-impact release is imminent
    NewsRisk,
    /// Price returned to the strategy's fair value
    TargetReached,
    Manual,
    StrategyExit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
            ExitReason::TimeStop => "time stop",
            ExitReason::SessionEnd => "session end",
            ExitReason::NewsRisk => "news risk",
            ExitReason::TargetReached => "target reached",
            ExitReason::Manual => "manual",
            ExitReason::StrategyExit => "strategy exit",
        };
        f.write_str(label)
    }
}

/// Stop `distance` behind `price`, if that is tighter than the current stop.
///
/// A stop only ever moves in the position's favour.
pub fn tightened_stop(position: &Position, price: f64, distance: f64, digits: u32) -> Option<f64> {
    if distance <= 0.0 {
        return None;
    }
    let sign = position.side.sign();
    let candidate = round_to(price - sign * distance, digits);
    match position.stop_loss {
        Some(current) if (candidate - current) * sign <= 0.0 => None,
        _ => Some(candidate),
    }
}

/// Open price as the new stop, unless the stop already protects it
pub fn breakeven_stop(position: &Position) -> Option<f64> {
    let sign = position.side.sign();
    match position.stop_loss {
        Some(current) if (current - position.open_price) * sign >= 0.0 => None,
        _ => Some(position.open_price),
    }
}

/// Works on live positions as reported by the broker.
///
/// Nothing is cached between calls; every method re-reads positions.
pub struct PositionManager {
    broker: Arc<dyn BrokerGateway>,
}

impl PositionManager {
    pub fn new(broker: Arc<dyn BrokerGateway>) -> Self {
        Self { broker }
    }

    pub async fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        self.broker.positions(symbol).await
    }

    async fn set_stop(&self, position: &Position, stop: f64, why: &str) -> Result<ExecutionReport> {
        let result = self
            .broker
            .modify_position(position.ticket, Some(stop), position.take_profit)
            .await?;
        if result.is_success() {
            tracing::info!(
                "{} ticket {}: stop {:?} -> {} ({})",
                position.symbol,
                position.ticket,
                position.stop_loss,
                stop,
                why
            );
            Ok(ExecutionReport::new(&position.symbol, ReportAction::Modified, why)
                .with_ticket(Some(position.ticket))
                .with_price(Some(stop)))
        } else {
            tracing::warn!(
                "{} ticket {}: stop update rejected {} ({})",
                position.symbol,
                position.ticket,
                result.retcode,
                result.comment
            );
            Ok(
                ExecutionReport::new(&position.symbol, ReportAction::Rejected, result.comment)
                    .with_ticket(Some(position.ticket)),
            )
        }
    }

    /// Pull the stop of every profitable position on `symbol` to `distance` behind price
    pub async fn trail_stops(&self, symbol: &str, distance: f64) -> Result<Vec<ExecutionReport>> {
        let positions = self.broker.positions(Some(symbol)).await?;
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let tick = self.broker.tick(symbol).await?;
        let info = self.broker.symbol_info(symbol).await?;

        let mut reports = Vec::new();
        for position in &positions {
            let price = tick.exit_price_for(position.side);
            if position.price_move(price) <= 0.0 {
                continue;
            }
            if let Some(stop) = tightened_stop(position, price, distance, info.digits) {
                reports.push(self.set_stop(position, stop, "trailing stop").await?);
            }
        }
        Ok(reports)
    }

    /// Move the stop to the open price once price has moved `trigger` in favour
    pub async fn move_to_breakeven(
        &self,
        position: &Position,
        price: f64,
        trigger: f64,
    ) -> Result<Option<ExecutionReport>> {
        if position.price_move(price) < trigger {
            return Ok(None);
        }
        match breakeven_stop(position) {
            Some(stop) => Ok(Some(self.set_stop(position, stop, "breakeven").await?)),
            None => Ok(None),
        }
    }

    pub async fn close(&self, position: &Position, reason: ExitReason) -> Result<ExecutionReport> {
        let result = self.broker.close_position(position.ticket).await?;
        if result.is_success() {
            tracing::info!(
                "Closed {} {} ticket {} @ {:?} ({}), P&L {:.2}",
                position.symbol,
                position.side,
                position.ticket,
                result.price,
                reason,
                position.profit
            );
            Ok(
                ExecutionReport::new(&position.symbol, ReportAction::Closed, reason.to_string())
                    .with_ticket(Some(position.ticket))
                    .with_price(result.price)
                    .with_profit(position.profit),
            )
        } else {
            tracing::warn!(
                "Failed to close {} ticket {}: {} ({})",
                position.symbol,
                position.ticket,
                result.retcode,
                result.comment
            );
            Ok(
                ExecutionReport::new(&position.symbol, ReportAction::Rejected, result.comment)
                    .with_ticket(Some(position.ticket)),
            )
        }
    }

    /// Close every position on `symbol` (all symbols when `None`)
    pub async fn close_all(
        &self,
        symbol: Option<&str>,
        reason: ExitReason,
    ) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();
        for position in self.broker.positions(symbol).await? {
            reports.push(self.close(&position, reason).await?);
        }
        Ok(reports)
    }

    /// Close positions on any of `symbols`
    pub async fn close_positions_for(
        &self,
        symbols: &[String],
        reason: ExitReason,
    ) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();
        for position in self.broker.positions(None).await? {
            if symbols.iter().any(|s| *s == position.symbol) {
                reports.push(self.close(&position, reason).await?);
            }
        }
        Ok(reports)
    }

    /// Time stop: close positions held longer than `max_age`
    pub async fn close_older_than(
        &self,
        symbol: Option<&str>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();
        for position in self.broker.positions(symbol).await? {
            if now - position.opened_at >= max_age {
                reports.push(self.close(&position, ExitReason::TimeStop).await?);
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::models::{OrderRequest, Side};

    fn position(side: Side, open: f64, stop: Option<f64>) -> Position {
        Position {
            ticket: 7,
            symbol: "EURUSD".to_string(),
            side,
            volume: 0.1,
            open_price: open,
            stop_loss: stop,
            take_profit: None,
            opened_at: Utc::now(),
            profit: 0.0,
            comment: String::new(),
        }
    }

    #[test]
    fn test_tightened_stop_only_moves_forward() {
        let buy = position(Side::Buy, 1.1000, Some(1.0980));
        assert_eq!(tightened_stop(&buy, 1.1030, 0.0010, 5), Some(1.1020));
        assert_eq!(tightened_stop(&buy, 1.0985, 0.0010, 5), None);

        let sell = position(Side::Sell, 1.1000, Some(1.1020));
        assert_eq!(tightened_stop(&sell, 1.0970, 0.0010, 5), Some(1.0980));
        assert_eq!(tightened_stop(&sell, 1.1015, 0.0010, 5), None);

        let naked = position(Side::Buy, 1.1000, None);
        assert_eq!(tightened_stop(&naked, 1.1000, 0.0010, 5), Some(1.0990));
    }

    #[test]
    fn test_breakeven_stop() {
        assert_eq!(breakeven_stop(&position(Side::Buy, 1.1, Some(1.09))), Some(1.1));
        assert_eq!(breakeven_stop(&position(Side::Buy, 1.1, Some(1.1))), None);
        assert_eq!(breakeven_stop(&position(Side::Sell, 1.1, None)), Some(1.1));
    }

    #[tokio::test]
    async fn test_trail_and_close() {
        let broker = Arc::new(PaperBroker::default().with_symbol("EURUSD", 1.10000, 1.10010));
        broker.connect().await.unwrap();
        let request = OrderRequest::market("EURUSD", Side::Buy, 0.1, 1.10010)
            .with_stops(Some(1.09800), None);
        broker.send_order(&request).await.unwrap();

        let manager = PositionManager::new(broker.clone());
        broker.set_quote("EURUSD", 1.10100, 1.10110);
        let reports = manager.trail_stops("EURUSD", 0.0005).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, ReportAction::Modified);
        let live = manager.open_positions(Some("EURUSD")).await.unwrap();
        assert_eq!(live[0].stop_loss, Some(1.10050));

        let reports = manager.close_all(None, ExitReason::SessionEnd).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, ReportAction::Closed);
        assert!(manager.open_positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_time_stop() {
        let broker = Arc::new(PaperBroker::default().with_symbol("EURUSD", 1.1, 1.1001));
        broker.connect().await.unwrap();
        let mut old = position(Side::Buy, 1.1, None);
        old.opened_at = Utc::now() - Duration::hours(7);
        broker.insert_position(old);
        let mut fresh = position(Side::Buy, 1.1, None);
        fresh.ticket = 8;
        broker.insert_position(fresh);

        let manager = PositionManager::new(broker.clone());
        let reports = manager
            .close_older_than(None, Duration::hours(6), Utc::now())
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ticket, Some(7));
        assert_eq!(manager.open_positions(None).await.unwrap().len(), 1);
    }
}
