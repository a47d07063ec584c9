use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BotError;

pub mod signal;

pub use signal::{ExecutionReport, ReportAction, SignalKind, TradeSignal};

/// Round a price to `digits` decimal places
pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Bar timeframe as understood by the terminal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            other => Err(BotError::InvalidInput(format!("unknown timeframe {other}"))),
        }
    }
}

/// OHLCV bar. The terminal returns bars oldest first; the last one is still forming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn range(&self) -> f64 {
        (self.high - self.low).abs()
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Latest quote for an instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl Tick {
    /// Price a new order on `side` would be measured against
    pub fn price_for(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Price an existing position on `side` would be closed at
    pub fn exit_price_for(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }

    pub fn spread(&self) -> f64 {
        (self.ask - self.bid).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub digits: u32,
    pub point: f64,
    /// Current spread in points
    pub spread: u32,
    pub volume_min: f64,
    pub volume_step: f64,
    pub trade_allowed: bool,
}

impl SymbolInfo {
    pub fn spread_price(&self) -> f64 {
        self.spread as f64 * self.point
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.digits)
    }

    /// Snap a volume to the lot step, never below the minimum lot
    pub fn normalize_volume(&self, volume: f64) -> f64 {
        let step = if self.volume_step > 0.0 { self.volume_step } else { 0.01 };
        let snapped = (volume / step).round() * step;
        round_to(snapped.max(self.volume_min), 2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountInfo {
    pub login: u64,
    pub server: String,
    pub currency: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buy, -1 for sell
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

/// Resting order types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    BuyLimit,
    BuyStop,
    SellLimit,
    SellStop,
}

impl OrderKind {
    pub fn side(&self) -> Side {
        match self {
            OrderKind::BuyLimit | OrderKind::BuyStop => Side::Buy,
            OrderKind::SellLimit | OrderKind::SellStop => Side::Sell,
        }
    }

    pub fn is_limit(&self) -> bool {
        matches!(self, OrderKind::BuyLimit | OrderKind::SellLimit)
    }

    /// Limit and stop kinds for one side, limit first
    pub fn straddle(side: Side) -> [OrderKind; 2] {
        match side {
            Side::Buy => [OrderKind::BuyLimit, OrderKind::BuyStop],
            Side::Sell => [OrderKind::SellLimit, OrderKind::SellStop],
        }
    }

    /// Whether a quote at `price` fills this order resting at `level`
    pub fn is_triggered(&self, level: f64, price: f64) -> bool {
        match self {
            OrderKind::BuyLimit | OrderKind::SellStop => price <= level,
            OrderKind::BuyStop | OrderKind::SellLimit => price >= level,
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderKind::BuyLimit => "buy limit",
            OrderKind::BuyStop => "buy stop",
            OrderKind::SellLimit => "sell limit",
            OrderKind::SellStop => "sell stop",
        };
        f.write_str(label)
    }
}

/// A resting order as enumerated by the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOrder {
    pub ticket: u64,
    pub symbol: String,
    pub kind: OrderKind,
    pub volume: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub comment: String,
    pub placed_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// An open position. The broker is authoritative for its existence and profit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub profit: f64,
    #[serde(default)]
    pub comment: String,
}

impl Position {
    /// Favourable price move since entry (negative when under water)
    pub fn price_move(&self, current_price: f64) -> f64 {
        (current_price - self.open_price) * self.side.sign()
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market(Side),
    Pending(OrderKind),
}

impl OrderType {
    pub fn side(&self) -> Side {
        match self {
            OrderType::Market(side) => *side,
            OrderType::Pending(kind) => kind.side(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    #[default]
    GoodTillCancelled,
    Specified(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    #[default]
    ImmediateOrCancel,
    FillOrKill,
    Return,
}

/// Request shipped to the terminal for a market deal or a pending order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub volume: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    pub time_in_force: TimeInForce,
    pub fill_policy: FillPolicy,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, volume: f64, price: f64) -> Self {
        Self::new(symbol.into(), OrderType::Market(side), volume, price)
    }

    pub fn pending(symbol: impl Into<String>, kind: OrderKind, volume: f64, price: f64) -> Self {
        let mut request = Self::new(symbol.into(), OrderType::Pending(kind), volume, price);
        request.fill_policy = FillPolicy::Return;
        request
    }

    fn new(symbol: String, order_type: OrderType, volume: f64, price: f64) -> Self {
        Self {
            symbol,
            order_type,
            volume,
            price,
            stop_loss: None,
            take_profit: None,
            deviation: 20,
            magic: 0,
            comment: String::new(),
            time_in_force: TimeInForce::GoodTillCancelled,
            fill_policy: FillPolicy::ImmediateOrCancel,
        }
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_magic(mut self, magic: u64) -> Self {
        self.magic = magic;
        self
    }

    pub fn with_deviation(mut self, deviation: u32) -> Self {
        self.deviation = deviation;
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.time_in_force = TimeInForce::Specified(at);
        self
    }
}

/// Terminal return codes. Anything other than `Done`/`Placed` is a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "u32", into = "u32")]
pub enum RetCode {
    Placed,
    Done,
    Rejected,
    Timeout,
    InvalidVolume,
    InvalidPrice,
    InvalidStops,
    MarketClosed,
    NoMoney,
    Other(u32),
}

impl RetCode {
    pub fn is_success(&self) -> bool {
        matches!(self, RetCode::Done | RetCode::Placed)
    }
}

impl From<u32> for RetCode {
    fn from(code: u32) -> Self {
        match code {
            10008 => RetCode::Placed,
            10009 => RetCode::Done,
            10006 => RetCode::Rejected,
            10012 => RetCode::Timeout,
            10014 => RetCode::InvalidVolume,
            10015 => RetCode::InvalidPrice,
            10016 => RetCode::InvalidStops,
            10018 => RetCode::MarketClosed,
            10019 => RetCode::NoMoney,
            other => RetCode::Other(other),
        }
    }
}

impl From<RetCode> for u32 {
    fn from(code: RetCode) -> Self {
        match code {
            RetCode::Placed => 10008,
            RetCode::Done => 10009,
            RetCode::Rejected => 10006,
            RetCode::Timeout => 10012,
            RetCode::InvalidVolume => 10014,
            RetCode::InvalidPrice => 10015,
            RetCode::InvalidStops => 10016,
            RetCode::MarketClosed => 10018,
            RetCode::NoMoney => 10019,
            RetCode::Other(other) => other,
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{}]", self, u32::from(*self))
    }
}

/// Outcome of a mutating broker call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeResult {
    pub retcode: RetCode,
    #[serde(default)]
    pub ticket: Option<u64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub comment: String,
}

impl TradeResult {
    pub fn done(ticket: u64, price: f64) -> Self {
        Self {
            retcode: RetCode::Done,
            ticket: Some(ticket),
            price: Some(price),
            comment: "Request executed".to_string(),
        }
    }

    pub fn failed(retcode: RetCode, comment: impl Into<String>) -> Self {
        Self {
            retcode,
            ticket: None,
            price: None,
            comment: comment.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.retcode.is_success()
    }

    /// Turn a non-success result into `BotError::OrderRejected`
    pub fn into_result(self, symbol: &str) -> crate::Result<TradeResult> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BotError::OrderRejected {
                symbol: symbol.to_string(),
                retcode: self.retcode,
                comment: self.comment,
            })
        }
    }
}
