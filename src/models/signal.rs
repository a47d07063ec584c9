use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OrderKind, Side};

/// What a driver wants done for one instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SignalKind {
    /// Immediate deal at the current quote
    Market,
    /// Resting order at `price`
    Pending {
        kind: OrderKind,
        price: f64,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Hand the instrument to the order lifecycle manager for this session
    Reconcile { session: String },
}

/// Output of `generate_signals`, input of `manage_risk` and `execute_signals`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeSignal {
    pub symbol: String,
    pub side: Side,
    pub kind: SignalKind,
    pub volume: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Quote the signal was computed from
    pub reference_price: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl TradeSignal {
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        volume: f64,
        reference_price: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: SignalKind::Market,
            volume,
            stop_loss: None,
            take_profit: None,
            reference_price,
            reason: String::new(),
            created_at,
        }
    }

    pub fn pending(
        symbol: impl Into<String>,
        kind: OrderKind,
        price: f64,
        volume: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: kind.side(),
            kind: SignalKind::Pending {
                kind,
                price,
                expires_at: None,
            },
            volume,
            stop_loss: None,
            take_profit: None,
            reference_price: price,
            reason: String::new(),
            created_at,
        }
    }

    pub fn reconcile(
        symbol: impl Into<String>,
        side: Side,
        session: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: SignalKind::Reconcile {
                session: session.into(),
            },
            volume: 0.0,
            stop_loss: None,
            take_profit: None,
            reference_price: 0.0,
            reason: "session reconcile".to_string(),
            created_at,
        }
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        if let SignalKind::Pending { expires_at, .. } = &mut self.kind {
            *expires_at = Some(at);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportAction {
    Opened,
    Placed,
    Modified,
    Closed,
    Cancelled,
    Expired,
    Rejected,
    Skipped,
}

/// What happened at the broker as a result of a signal or position rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub symbol: String,
    pub ticket: Option<u64>,
    pub action: ReportAction,
    pub price: Option<f64>,
    /// Realized profit for closes
    pub profit: Option<f64>,
    pub reason: String,
    pub time: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn new(symbol: impl Into<String>, action: ReportAction, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ticket: None,
            action,
            price: None,
            profit: None,
            reason: reason.into(),
            time: Utc::now(),
        }
    }

    pub fn with_ticket(mut self, ticket: Option<u64>) -> Self {
        self.ticket = ticket;
        self
    }

    pub fn with_price(mut self, price: Option<f64>) -> Self {
        self.price = price;
        self
    }

    pub fn with_profit(mut self, profit: f64) -> Self {
        self.profit = Some(profit);
        self
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.action, ReportAction::Rejected | ReportAction::Skipped)
    }
}
