use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::BrokerGateway;
use crate::error::BotError;
use crate::models::{
    round_to, AccountInfo, Candle, OrderKind, OrderRequest, OrderType, PendingOrder, Position,
    RetCode, SymbolInfo, Tick, TimeInForce, Timeframe, TradeResult,
};
use crate::pricing::{contract_size, pip_value, quote_digits};
use crate::Result;

struct PaperState {
    connected: bool,
    refuse_connect: bool,
    account: AccountInfo,
    quotes: HashMap<String, Tick>,
    symbols: HashMap<String, SymbolInfo>,
    candles: HashMap<(String, Timeframe), Vec<Candle>>,
    orders: Vec<PendingOrder>,
    positions: Vec<Position>,
    forced_retcodes: VecDeque<RetCode>,
    next_ticket: u64,
    price_walk_pips: Option<f64>,
    realized_profit: f64,
}

impl PaperState {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn require_connection(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(BotError::NotConnected)
        }
    }

    fn quote(&self, symbol: &str) -> Result<Tick> {
        self.quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| BotError::data_unavailable(symbol, "tick"))
    }

    /// Fill triggered pending orders, close positions whose stop or target was hit
    fn match_quote(&mut self, symbol: &str, now: DateTime<Utc>) {
        let Some(tick) = self.quotes.get(symbol).cloned() else {
            return;
        };

        let (triggered, resting): (Vec<_>, Vec<_>) =
            self.orders.drain(..).partition(|order| {
                order.symbol == symbol
                    && order
                        .kind
                        .is_triggered(order.price, tick.price_for(order.kind.side()))
            });
        self.orders = resting;
        for order in triggered {
            self.positions.push(Position {
                ticket: order.ticket,
                symbol: order.symbol,
                side: order.kind.side(),
                volume: order.volume,
                open_price: order.price,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                opened_at: now,
                profit: 0.0,
                comment: order.comment,
            });
        }

        let mut hit = Vec::new();
        for position in self.positions.iter_mut().filter(|p| p.symbol == symbol) {
            let exit = tick.exit_price_for(position.side);
            position.profit =
                position.price_move(exit) * position.volume * contract_size(&position.symbol);
            let stopped = position
                .stop_loss
                .is_some_and(|sl| position.price_move(exit) <= position.price_move(sl));
            let targeted = position
                .take_profit
                .is_some_and(|tp| position.price_move(exit) >= position.price_move(tp));
            if stopped || targeted {
                hit.push(position.ticket);
            }
        }
        for ticket in hit {
            self.close(ticket);
        }
    }

    fn close(&mut self, ticket: u64) -> Option<TradeResult> {
        let index = self.positions.iter().position(|p| p.ticket == ticket)?;
        let position = self.positions.remove(index);
        let price = self
            .quotes
            .get(&position.symbol)
            .map(|t| t.exit_price_for(position.side))
            .unwrap_or(position.open_price);
        let profit = position.price_move(price) * position.volume * contract_size(&position.symbol);
        self.realized_profit += profit;
        self.account.balance += profit;
        self.account.equity = self.account.balance;
        Some(TradeResult::done(ticket, price))
    }

    fn validate(&self, request: &OrderRequest, tick: &Tick) -> Option<TradeResult> {
        if request.volume <= 0.0 {
            return Some(TradeResult::failed(RetCode::InvalidVolume, "Invalid volume"));
        }
        if let OrderType::Pending(kind) = request.order_type {
            let reference = tick.price_for(kind.side());
            let valid = match kind {
                OrderKind::BuyLimit | OrderKind::SellStop => request.price < reference,
                OrderKind::BuyStop | OrderKind::SellLimit => request.price > reference,
            };
            if !valid {
                return Some(TradeResult::failed(RetCode::InvalidPrice, "Invalid price"));
            }
        }
        let side = request.order_type.side();
        let entry = match request.order_type {
            OrderType::Market(side) => tick.price_for(side),
            OrderType::Pending(_) => request.price,
        };
        let stop_ok = request
            .stop_loss
            .map_or(true, |sl| (entry - sl) * side.sign() > 0.0);
        let target_ok = request
            .take_profit
            .map_or(true, |tp| (tp - entry) * side.sign() > 0.0);
        if !stop_ok || !target_ok {
            return Some(TradeResult::failed(RetCode::InvalidStops, "Invalid stops"));
        }
        None
    }
}

/// In-memory broker for `--paper` runs and tests.
///
/// Pending orders fill when the quote crosses them, positions close on their
/// stop or target, and quotes can random-walk on every `tick` call.
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(10_000.0)
    }
}

impl PaperBroker {
    pub fn new(balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                connected: false,
                refuse_connect: false,
                account: AccountInfo {
                    login: 1,
                    server: "Paper".to_string(),
                    currency: "USD".to_string(),
                    balance,
                    equity: balance,
                    margin: 0.0,
                    free_margin: balance,
                    leverage: 100,
                },
                quotes: HashMap::new(),
                symbols: HashMap::new(),
                candles: HashMap::new(),
                orders: Vec::new(),
                positions: Vec::new(),
                forced_retcodes: VecDeque::new(),
                next_ticket: 1000,
                price_walk_pips: None,
                realized_profit: 0.0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an instrument with an initial quote
    pub fn with_symbol(self, symbol: &str, bid: f64, ask: f64) -> Self {
        self.set_quote(symbol, bid, ask);
        self
    }

    /// Register each known symbol at a typical mid with a one pip spread.
    /// Unknown symbols are skipped.
    pub fn with_reference_quotes<S: AsRef<str>>(self, symbols: &[S]) -> Self {
        for symbol in symbols {
            let symbol = symbol.as_ref();
            match reference_mid(symbol) {
                Some(mid) => {
                    let half = pip_value(symbol) / 2.0;
                    let digits = quote_digits(symbol);
                    self.set_quote(
                        symbol,
                        round_to(mid - half, digits),
                        round_to(mid + half, digits),
                    );
                }
                None => tracing::warn!("No reference quote for {}, skipping", symbol),
            }
        }
        self
    }

    /// Random-walk each quote by up to `pips` whenever it is read
    pub fn with_price_walk(self, pips: f64) -> Self {
        self.state().price_walk_pips = Some(pips.abs());
        self
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    /// Simulate the terminal dropping the session
    pub fn drop_connection(&self) {
        self.state().connected = false;
    }

    pub fn set_quote(&self, symbol: &str, bid: f64, ask: f64) {
        let mut state = self.state();
        let digits = quote_digits(symbol);
        let point = 10f64.powi(-(digits as i32));
        state.symbols.entry(symbol.to_string()).or_insert(SymbolInfo {
            symbol: symbol.to_string(),
            digits,
            point,
            spread: 0,
            volume_min: 0.01,
            volume_step: 0.01,
            trade_allowed: true,
        });
        if let Some(info) = state.symbols.get_mut(symbol) {
            info.spread = ((ask - bid) / point).round().max(0.0) as u32;
        }
        state.quotes.insert(
            symbol.to_string(),
            Tick {
                symbol: symbol.to_string(),
                bid,
                ask,
                time: Utc::now(),
            },
        );
        state.match_quote(symbol, Utc::now());
    }

    pub fn set_candles(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.state()
            .candles
            .insert((symbol.to_string(), timeframe), candles);
    }

    /// Answer the next order submissions with these codes instead of filling them
    pub fn force_retcode(&self, code: RetCode) {
        self.state().forced_retcodes.push_back(code);
    }

    pub fn insert_order(&self, order: PendingOrder) {
        self.state().orders.push(order);
    }

    pub fn insert_position(&self, position: Position) {
        self.state().positions.push(position);
    }

    pub fn realized_profit(&self) -> f64 {
        self.state().realized_profit
    }

    fn synthetic_candles(
        tick: &Tick,
        timeframe: Timeframe,
        count: usize,
        now: DateTime<Utc>,
    ) -> Vec<Candle> {
        let pip = pip_value(&tick.symbol);
        let mid = (tick.bid + tick.ask) / 2.0;
        let digits = quote_digits(&tick.symbol);
        (0..count)
            .map(|i| {
                let age = (count - 1 - i) as i64;
                let drift = (i as f64 * 0.7).sin() * 10.0 * pip;
                let close = round_to(mid + drift, digits);
                let open = round_to(mid + ((i as f64 - 1.0) * 0.7).sin() * 10.0 * pip, digits);
                Candle {
                    symbol: tick.symbol.clone(),
                    timeframe,
                    timestamp: now - Duration::minutes(timeframe.minutes() * age),
                    open,
                    high: round_to(open.max(close) + 3.0 * pip, digits),
                    low: round_to(open.min(close) - 3.0 * pip, digits),
                    close,
                    volume: 1000.0 + (i % 7) as f64 * 150.0,
                }
            })
            .collect()
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn connect(&self) -> Result<AccountInfo> {
        let mut state = self.state();
        if state.refuse_connect {
            return Err(BotError::Connection("paper terminal refused the session".into()));
        }
        state.connected = true;
        Ok(state.account.clone())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state().connected = false;
        Ok(())
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        let state = self.state();
        state.require_connection()?;
        let floating: f64 = state.positions.iter().map(|p| p.profit).sum();
        let mut account = state.account.clone();
        account.equity = account.balance + floating;
        Ok(account)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let state = self.state();
        state.require_connection()?;
        state
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| BotError::data_unavailable(symbol, "symbol info"))
    }

    async fn tick(&self, symbol: &str) -> Result<Tick> {
        let mut state = self.state();
        state.require_connection()?;
        if let Some(pips) = state.price_walk_pips {
            let step = rand::thread_rng().gen_range(-pips..=pips) * pip_value(symbol);
            let digits = quote_digits(symbol);
            if let Some(tick) = state.quotes.get_mut(symbol) {
                tick.bid = round_to(tick.bid + step, digits);
                tick.ask = round_to(tick.ask + step, digits);
                tick.time = Utc::now();
            }
            state.match_quote(symbol, Utc::now());
        }
        state.quote(symbol)
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let state = self.state();
        state.require_connection()?;
        if let Some(candles) = state.candles.get(&(symbol.to_string(), timeframe)) {
            let start = candles.len().saturating_sub(count);
            return Ok(candles[start..].to_vec());
        }
        let tick = state.quote(symbol)?;
        Ok(Self::synthetic_candles(&tick, timeframe, count, Utc::now()))
    }

    async fn pending_orders(&self, symbol: Option<&str>) -> Result<Vec<PendingOrder>> {
        let state = self.state();
        state.require_connection()?;
        Ok(state
            .orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        let state = self.state();
        state.require_connection()?;
        Ok(state
            .positions
            .iter()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn send_order(&self, request: &OrderRequest) -> Result<TradeResult> {
        let mut state = self.state();
        state.require_connection()?;
        if let Some(code) = state.forced_retcodes.pop_front() {
            return Ok(TradeResult::failed(code, "forced by paper broker"));
        }
        let tick = match state.quote(&request.symbol) {
            Ok(tick) => tick,
            Err(_) => return Ok(TradeResult::failed(RetCode::Rejected, "Unknown symbol")),
        };
        if let Some(refusal) = state.validate(request, &tick) {
            return Ok(refusal);
        }

        let ticket = state.ticket();
        let now = Utc::now();
        match request.order_type {
            OrderType::Market(side) => {
                let price = tick.price_for(side);
                state.positions.push(Position {
                    ticket,
                    symbol: request.symbol.clone(),
                    side,
                    volume: request.volume,
                    open_price: price,
                    stop_loss: request.stop_loss,
                    take_profit: request.take_profit,
                    opened_at: now,
                    profit: 0.0,
                    comment: request.comment.clone(),
                });
                Ok(TradeResult::done(ticket, price))
            }
            OrderType::Pending(kind) => {
                let expires_at = match request.time_in_force {
                    TimeInForce::Specified(at) => Some(at),
                    TimeInForce::GoodTillCancelled => None,
                };
                state.orders.push(PendingOrder {
                    ticket,
                    symbol: request.symbol.clone(),
                    kind,
                    volume: request.volume,
                    price: request.price,
                    stop_loss: request.stop_loss,
                    take_profit: request.take_profit,
                    comment: request.comment.clone(),
                    placed_at: now,
                    expires_at,
                });
                Ok(TradeResult::done(ticket, request.price))
            }
        }
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<TradeResult> {
        let mut state = self.state();
        state.require_connection()?;
        let Some(position) = state.positions.iter_mut().find(|p| p.ticket == ticket) else {
            return Ok(TradeResult::failed(RetCode::Rejected, "Position not found"));
        };
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        let price = position.open_price;
        Ok(TradeResult::done(ticket, price))
    }

    async fn cancel_order(&self, ticket: u64) -> Result<TradeResult> {
        let mut state = self.state();
        state.require_connection()?;
        let Some(index) = state.orders.iter().position(|o| o.ticket == ticket) else {
            return Ok(TradeResult::failed(RetCode::Rejected, "Order not found"));
        };
        let order = state.orders.remove(index);
        Ok(TradeResult::done(ticket, order.price))
    }

    async fn close_position(&self, ticket: u64) -> Result<TradeResult> {
        let mut state = self.state();
        state.require_connection()?;
        Ok(state
            .close(ticket)
            .unwrap_or_else(|| TradeResult::failed(RetCode::Rejected, "Position not found")))
    }
}

fn reference_mid(symbol: &str) -> Option<f64> {
    let mid = match symbol {
        "EURUSD" => 1.0850,
        "GBPUSD" => 1.2700,
        "USDJPY" => 150.20,
        "AUDUSD" => 0.6550,
        "NZDUSD" => 0.6100,
        "USDCAD" => 1.3550,
        "USDCHF" => 0.8800,
        "EURGBP" => 0.8550,
        "EURJPY" => 163.00,
        "GBPJPY" => 190.80,
        "AUDJPY" => 98.40,
        "XAUUSD" => 2350.00,
        _ => return None,
    };
    Some(mid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    async fn connected() -> PaperBroker {
        let broker = PaperBroker::default().with_symbol("EURUSD", 1.10000, 1.10010);
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_reference_quotes() {
        let broker = PaperBroker::default().with_reference_quotes(&["USDJPY", "EURUSD", "FOOBAR"]);
        broker.connect().await.unwrap();
        let tick = broker.tick("USDJPY").await.unwrap();
        assert!((tick.ask - tick.bid - 0.01).abs() < 1e-9);
        assert!(broker.tick("EURUSD").await.is_ok());
        assert!(broker.tick("FOOBAR").await.is_err());
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let broker = PaperBroker::default().with_symbol("EURUSD", 1.1, 1.1001);
        assert!(matches!(broker.tick("EURUSD").await, Err(BotError::NotConnected)));
        broker.connect().await.unwrap();
        assert!(broker.tick("EURUSD").await.is_ok());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = PaperBroker::default();
        broker.refuse_connections(true);
        let err = broker.connect().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_pending_order_fills_when_crossed() {
        let broker = connected().await;
        let request = OrderRequest::pending("EURUSD", OrderKind::BuyStop, 0.1, 1.10060)
            .with_stops(Some(1.09900), None);
        let result = broker.send_order(&request).await.unwrap();
        assert_eq!(result.retcode, RetCode::Done);
        assert_eq!(broker.pending_orders(Some("EURUSD")).await.unwrap().len(), 1);

        broker.set_quote("EURUSD", 1.10060, 1.10070);
        assert!(broker.pending_orders(None).await.unwrap().is_empty());
        let positions = broker.positions(Some("EURUSD")).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Buy);
        assert_eq!(positions[0].open_price, 1.10060);
    }

    #[tokio::test]
    async fn test_rejects_wrong_side_prices() {
        let broker = connected().await;
        let request = OrderRequest::pending("EURUSD", OrderKind::BuyLimit, 0.1, 1.10100);
        let result = broker.send_order(&request).await.unwrap();
        assert_eq!(result.retcode, RetCode::InvalidPrice);

        let request = OrderRequest::market("EURUSD", Side::Buy, 0.1, 1.10010)
            .with_stops(Some(1.10100), None);
        let result = broker.send_order(&request).await.unwrap();
        assert_eq!(result.retcode, RetCode::InvalidStops);
    }

    #[tokio::test]
    async fn test_forced_retcode() {
        let broker = connected().await;
        broker.force_retcode(RetCode::MarketClosed);
        let request = OrderRequest::market("EURUSD", Side::Sell, 0.1, 1.1);
        let result = broker.send_order(&request).await.unwrap();
        assert_eq!(result.retcode, RetCode::MarketClosed);
        assert!(broker.positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_closes_position() {
        let broker = connected().await;
        let request = OrderRequest::market("EURUSD", Side::Buy, 0.1, 1.10010)
            .with_stops(Some(1.09900), None);
        broker.send_order(&request).await.unwrap();

        broker.set_quote("EURUSD", 1.09890, 1.09900);
        assert!(broker.positions(None).await.unwrap().is_empty());
        assert!(broker.realized_profit() < 0.0);
    }

    #[tokio::test]
    async fn test_synthetic_candles_when_none_loaded() {
        let broker = connected().await;
        let candles = broker.candles("EURUSD", Timeframe::M30, 5).await.unwrap();
        assert_eq!(candles.len(), 5);
        assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(candles.iter().all(|c| c.high >= c.low));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_not_an_error() {
        let broker = connected().await;
        let result = broker.cancel_order(4242).await.unwrap();
        assert!(!result.is_success());
    }
}
