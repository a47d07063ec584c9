use std::sync::Arc;

use crate::broker::BrokerGateway;
use crate::models::{
    ExecutionReport, OrderRequest, Position, ReportAction, SignalKind, TradeSignal,
};
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Execute { volume: f64 },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Turns market and pending signals into broker orders
pub struct Executor {
    broker: Arc<dyn BrokerGateway>,
    comment: String,
    magic: u64,
    deviation: u32,
}

impl Executor {
    pub fn new(broker: Arc<dyn BrokerGateway>, comment: impl Into<String>, magic: u64) -> Self {
        Self {
            broker,
            comment: comment.into(),
            magic,
            deviation: 20,
        }
    }

    pub fn with_deviation(mut self, deviation: u32) -> Self {
        self.deviation = deviation;
        self
    }

    /// Decide whether a signal should reach the broker given the open positions
    pub fn decide(&self, signal: &TradeSignal, positions: &[Position]) -> ExecutionDecision {
        if let SignalKind::Reconcile { .. } = signal.kind {
            return ExecutionDecision::skip("Reconcile signals belong to the order manager");
        }

        // Check 1: sized at all?
        if signal.volume <= 0.0 {
            return ExecutionDecision::skip("Zero volume");
        }

        // Check 2: already positioned on this side?
        if signal.kind == SignalKind::Market
            && positions
                .iter()
                .any(|p| p.symbol == signal.symbol && p.side == signal.side)
        {
            return ExecutionDecision::skip(format!("Already have open {} position", signal.side));
        }

        ExecutionDecision {
            action: ExecutionAction::Execute {
                volume: signal.volume,
            },
            reason: signal.reason.clone(),
        }
    }

    fn request_for(&self, signal: &TradeSignal, volume: f64, market_price: f64) -> OrderRequest {
        let request = match &signal.kind {
            SignalKind::Pending {
                kind,
                price,
                expires_at,
            } => {
                let request = OrderRequest::pending(&signal.symbol, *kind, volume, *price);
                match expires_at {
                    Some(at) => request.expiring_at(*at),
                    None => request,
                }
            }
            _ => OrderRequest::market(&signal.symbol, signal.side, volume, market_price),
        };
        request
            .with_stops(signal.stop_loss, signal.take_profit)
            .with_comment(&self.comment)
            .with_magic(self.magic)
            .with_deviation(self.deviation)
    }

    /// Execute one signal. Broker refusals come back as `Rejected` reports.
    pub async fn execute(&self, signal: &TradeSignal) -> Result<ExecutionReport> {
        let positions = self.broker.positions(Some(&signal.symbol)).await?;
        let decision = self.decide(signal, &positions);
        let volume = match decision.action {
            ExecutionAction::Execute { volume } => volume,
            ExecutionAction::Skip => {
                tracing::info!("Skipping {} {}: {}", signal.symbol, signal.side, decision.reason);
                return Ok(ExecutionReport::new(
                    &signal.symbol,
                    ReportAction::Skipped,
                    decision.reason,
                ));
            }
        };

        let info = self.broker.symbol_info(&signal.symbol).await?;
        let tick = self.broker.tick(&signal.symbol).await?;
        let request = self.request_for(
            signal,
            info.normalize_volume(volume),
            tick.price_for(signal.side),
        );

        let result = self.broker.send_order(&request).await?;
        if !result.is_success() {
            tracing::warn!(
                "Order for {} {} rejected: {} ({})",
                signal.symbol,
                signal.side,
                result.retcode,
                result.comment
            );
            return Ok(
                ExecutionReport::new(&signal.symbol, ReportAction::Rejected, result.comment)
                    .with_price(Some(request.price)),
            );
        }

        let action = match signal.kind {
            SignalKind::Pending { .. } => ReportAction::Placed,
            _ => ReportAction::Opened,
        };
        tracing::info!(
            "{} {} {} @ {:?} (sl {:?}, tp {:?}) ticket {:?}: {}",
            action_label(action),
            signal.symbol,
            signal.side,
            result.price,
            request.stop_loss,
            request.take_profit,
            result.ticket,
            signal.reason
        );
        Ok(ExecutionReport::new(&signal.symbol, action, &signal.reason)
            .with_ticket(result.ticket)
            .with_price(result.price))
    }

    /// Execute signals one by one. A failing signal is logged and reported as
    /// rejected; only connectivity errors abort the batch.
    pub async fn execute_all(&self, signals: &[TradeSignal]) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::with_capacity(signals.len());
        for signal in signals {
            match self.execute(signal).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    tracing::error!("Error executing {} {}: {}", signal.symbol, signal.side, e);
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
}

fn action_label(action: ReportAction) -> &'static str {
    match action {
        ReportAction::Placed => "Placed",
        _ => "Opened",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::models::{OrderKind, RetCode, Side};
    use chrono::Utc;

    async fn setup() -> (Arc<PaperBroker>, Executor) {
        let broker = Arc::new(PaperBroker::default().with_symbol("EURUSD", 1.10000, 1.10010));
        broker.connect().await.unwrap();
        let executor = Executor::new(broker.clone(), "fxbot-test", 1);
        (broker, executor)
    }

    #[tokio::test]
    async fn test_skip_when_already_positioned() {
        let (_broker, executor) = setup().await;
        let signal = TradeSignal::market("EURUSD", Side::Buy, 0.1, 1.1001, Utc::now())
            .with_stops(Some(1.0950), Some(1.1100));

        let first = executor.execute(&signal).await.unwrap();
        assert_eq!(first.action, ReportAction::Opened);

        let second = executor.execute(&signal).await.unwrap();
        assert_eq!(second.action, ReportAction::Skipped);
        assert!(second.reason.contains("Already have"));
    }

    #[tokio::test]
    async fn test_pending_signal_places_order() {
        let (broker, executor) = setup().await;
        let signal = TradeSignal::pending("EURUSD", OrderKind::BuyStop, 1.1050, 0.1, Utc::now())
            .with_stops(Some(1.1000), Some(1.1150));
        let report = executor.execute(&signal).await.unwrap();
        assert_eq!(report.action, ReportAction::Placed);
        assert_eq!(broker.pending_orders(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let (broker, executor) = setup().await;
        broker.force_retcode(RetCode::NoMoney);
        let signal = TradeSignal::market("EURUSD", Side::Sell, 0.1, 1.1, Utc::now());
        let reports = executor.execute_all(&[signal]).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, ReportAction::Rejected);
    }

    #[tokio::test]
    async fn test_connectivity_aborts_batch() {
        let (broker, executor) = setup().await;
        broker.drop_connection();
        let signal = TradeSignal::market("EURUSD", Side::Sell, 0.1, 1.1, Utc::now());
        assert!(executor.execute_all(&[signal]).await.is_err());
    }

    #[test]
    fn test_reconcile_signals_skipped() {
        let broker = Arc::new(PaperBroker::default());
        let executor = Executor::new(broker, "x", 0);
        let signal = TradeSignal::reconcile("EURUSD", Side::Buy, "London", Utc::now());
        let decision = executor.decide(&signal, &[]);
        assert_eq!(decision.action, ExecutionAction::Skip);
    }
}
