use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::BrokerGateway;
use crate::error::BotError;
use crate::execution::stamp::{decode_placement, encode_placement, minute_of_day, order_age_minutes};
use crate::indicators::calculate_atr;
use crate::models::{OrderKind, OrderRequest, RetCode, Side, Timeframe};
use crate::pricing::{completed_candle, DistanceCalculator};
use crate::Result;

/// How stale pending orders are retired before new ones are placed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Cancel every pending order of the side, then re-place
    CancelAllPending,
    /// Cancel only orders whose placement stamp is older than `minutes`
    ExpireAfter { minutes: u32 },
}

/// How the protective stop of each placed order is derived
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum StopPolicy {
    /// One completed-candle range behind the entry, no target
    CandleRange,
    /// Daily ATR multiples, stop floored at the spread
    AtrScaled {
        period: usize,
        stop_multiplier: f64,
        target_multiplier: f64,
    },
}

/// How far from price the straddle legs rest
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EntryPolicy {
    /// Base pips scaled by session and instrument multipliers
    SessionScaled,
    /// Share of the last candle range, scalp-scaled, floored at the spread
    RangeScalp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrderManagerConfig {
    /// Cap on pending + open entries per instrument and side
    pub max_positions: usize,
    pub volume: f64,
    pub expiry: ExpiryPolicy,
    pub stop: StopPolicy,
    pub entry: EntryPolicy,
    pub candle_timeframe: Timeframe,
    pub magic: u64,
    pub deviation: u32,
}

impl OrderManagerConfig {
    /// Cancel-and-replace straddle with candle-range stops
    pub fn straddle() -> Self {
        Self {
            max_positions: 2,
            volume: 0.01,
            expiry: ExpiryPolicy::CancelAllPending,
            stop: StopPolicy::CandleRange,
            entry: EntryPolicy::SessionScaled,
            candle_timeframe: Timeframe::M30,
            magic: 234000,
            deviation: 20,
        }
    }

    /// Tight scalping straddle with selective expiry and ATR stops
    pub fn scalper() -> Self {
        Self {
            max_positions: 3,
            volume: 0.1,
            expiry: ExpiryPolicy::ExpireAfter { minutes: 30 },
            stop: StopPolicy::AtrScaled {
                period: 14,
                stop_multiplier: 0.30,
                target_multiplier: 1.0,
            },
            entry: EntryPolicy::RangeScalp,
            candle_timeframe: Timeframe::M30,
            magic: 234001,
            deviation: 10,
        }
    }
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self::straddle()
    }
}

/// Lifecycle of one order slot per (instrument, side)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    NoOrder,
    Pending,
    Live,
    Closed,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub ticket: Option<u64>,
    pub kind: OrderKind,
    pub from: OrderState,
    pub to: OrderState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacementFailure {
    pub kind: OrderKind,
    pub ticket: Option<u64>,
    pub retcode: RetCode,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Distances could not be computed
    NoLevels(String),
    AtCapacity { open: usize, max: usize },
}

/// Everything one reconciliation did to an instrument
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub symbol: String,
    pub side: Side,
    pub transitions: Vec<Transition>,
    pub failures: Vec<PlacementFailure>,
    pub skipped: Option<SkipReason>,
}

impl ReconcileReport {
    fn new(symbol: &str, side: Side) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            transitions: Vec::new(),
            failures: Vec::new(),
            skipped: None,
        }
    }

    fn tickets(&self, from: OrderState, to: OrderState) -> Vec<u64> {
        self.transitions
            .iter()
            .filter(|t| t.from == from && t.to == to)
            .filter_map(|t| t.ticket)
            .collect()
    }

    pub fn placed(&self) -> Vec<u64> {
        self.tickets(OrderState::NoOrder, OrderState::Pending)
    }

    /// Tickets removed by cancel-all
    pub fn cancelled(&self) -> Vec<u64> {
        self.tickets(OrderState::Pending, OrderState::Cancelled)
    }

    /// Tickets removed by age
    pub fn expired(&self) -> Vec<u64> {
        self.tickets(OrderState::Expired, OrderState::Cancelled)
    }

    pub fn is_noop(&self) -> bool {
        self.transitions.is_empty() && self.failures.is_empty()
    }
}

/// One leg of a straddle, fully priced
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOrder {
    pub kind: OrderKind,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub volume: f64,
}

struct StopDistances {
    stop: f64,
    target: Option<f64>,
}

/// Reconciles the desired straddle for an instrument against what the broker
/// reports, once per tick.
///
/// Broker state is re-read on every call. Between reading the order book and
/// placing, a fill or manual change at the terminal is not guarded against.
pub struct OrderLifecycleManager {
    broker: Arc<dyn BrokerGateway>,
    config: OrderManagerConfig,
    distance: DistanceCalculator,
}

impl OrderLifecycleManager {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        config: OrderManagerConfig,
        distance: DistanceCalculator,
    ) -> Self {
        Self {
            broker,
            config,
            distance,
        }
    }

    pub fn config(&self) -> &OrderManagerConfig {
        &self.config
    }

    /// Run one full reconciliation for `symbol` on `side` during `session`
    pub async fn reconcile(
        &self,
        symbol: &str,
        side: Side,
        session: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::new(symbol, side);

        // Survivors of a selective sweep stay, so capacity is known before any level lookup
        let mut counted = None;
        if let ExpiryPolicy::ExpireAfter { minutes } = self.config.expiry {
            self.sweep_expired(symbol, now, minutes, &mut report).await?;
            let open = self.open_count(symbol, side).await?;
            if self.at_capacity(open, &mut report) {
                return Ok(report);
            }
            counted = Some(open);
        }

        // Levels come before cancel-all so a data gap never leaves the instrument bare
        let planned = match self.plan_orders(symbol, side, session).await {
            Ok(planned) => planned,
            Err(e @ BotError::DataUnavailable { .. }) => {
                tracing::warn!("Skipping {} {} this tick: {}", symbol, side, e);
                report.skipped = Some(SkipReason::NoLevels(e.to_string()));
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        if self.config.expiry == ExpiryPolicy::CancelAllPending {
            self.cancel_pending(symbol, Some(side), &mut report).await?;
        }

        let open = match counted {
            Some(open) => open,
            None => self.open_count(symbol, side).await?,
        };
        if self.at_capacity(open, &mut report) {
            return Ok(report);
        }
        let max = self.config.max_positions;

        let mut slots = max - open;
        for order in planned {
            if slots == 0 {
                break;
            }
            let request = self.request_for(symbol, &order, now);
            let result = self.broker.send_order(&request).await?;
            // Only a completed request leaves an order resting at the broker
            if result.retcode == RetCode::Done {
                slots -= 1;
                tracing::info!(
                    "Placed {} {} @ {} (sl {}, tp {:?}) ticket {:?}",
                    symbol,
                    order.kind,
                    order.price,
                    order.stop_loss,
                    order.take_profit,
                    result.ticket
                );
                report.transitions.push(Transition {
                    ticket: result.ticket,
                    kind: order.kind,
                    from: OrderState::NoOrder,
                    to: OrderState::Pending,
                });
            } else {
                tracing::warn!(
                    "Failed to place {} {} @ {}: {} ({})",
                    symbol,
                    order.kind,
                    order.price,
                    result.retcode,
                    result.comment
                );
                report.failures.push(PlacementFailure {
                    kind: order.kind,
                    ticket: result.ticket,
                    retcode: result.retcode,
                    comment: result.comment,
                });
            }
        }

        Ok(report)
    }

    fn at_capacity(&self, open: usize, report: &mut ReconcileReport) -> bool {
        let max = self.config.max_positions;
        if open < max {
            return false;
        }
        tracing::info!(
            "{} {} at capacity ({}/{}), no placement",
            report.symbol,
            report.side,
            open,
            max
        );
        report.skipped = Some(SkipReason::AtCapacity { open, max });
        true
    }

    /// Count pending and open entries of `side` on `symbol`
    pub async fn open_count(&self, symbol: &str, side: Side) -> Result<usize> {
        let pending = self
            .broker
            .pending_orders(Some(symbol))
            .await?
            .iter()
            .filter(|o| o.kind.side() == side)
            .count();
        let live = self
            .broker
            .positions(Some(symbol))
            .await?
            .iter()
            .filter(|p| p.side == side)
            .count();
        Ok(pending + live)
    }

    /// Cancel every pending order on `symbol`, optionally only one side.
    /// Calling it with nothing pending is a no-op.
    pub async fn cancel_all_pending(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::new(symbol, side.unwrap_or(Side::Buy));
        self.cancel_pending(symbol, side, &mut report).await?;
        Ok(report)
    }

    /// Cancel stamped orders on `symbol` older than `max_age_minutes`
    pub async fn expire_stale_orders(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        max_age_minutes: u32,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::new(symbol, Side::Buy);
        self.sweep_expired(symbol, now, max_age_minutes, &mut report).await?;
        Ok(report)
    }

    async fn cancel_pending(
        &self,
        symbol: &str,
        side: Option<Side>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let orders = self.broker.pending_orders(Some(symbol)).await?;
        for order in orders
            .into_iter()
            .filter(|o| side.map_or(true, |s| o.kind.side() == s))
        {
            let result = self.broker.cancel_order(order.ticket).await?;
            if result.is_success() {
                tracing::info!("Cancelled {} {} ticket {}", symbol, order.kind, order.ticket);
                report.transitions.push(Transition {
                    ticket: Some(order.ticket),
                    kind: order.kind,
                    from: OrderState::Pending,
                    to: OrderState::Cancelled,
                });
            } else {
                tracing::warn!(
                    "Failed to cancel {} ticket {}: {} ({})",
                    symbol,
                    order.ticket,
                    result.retcode,
                    result.comment
                );
                report.failures.push(PlacementFailure {
                    kind: order.kind,
                    ticket: Some(order.ticket),
                    retcode: result.retcode,
                    comment: result.comment,
                });
            }
        }
        Ok(())
    }

    async fn sweep_expired(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        max_age_minutes: u32,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let current = minute_of_day(now);
        for order in self.broker.pending_orders(Some(symbol)).await? {
            let placed = match decode_placement(&order.comment) {
                Ok(Some(minute)) => minute,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        "Order {} on {}: {}, left out of expiry this tick",
                        order.ticket,
                        symbol,
                        e
                    );
                    continue;
                }
            };

            let age = order_age_minutes(placed, current);
            if age <= max_age_minutes {
                continue;
            }

            report.transitions.push(Transition {
                ticket: Some(order.ticket),
                kind: order.kind,
                from: OrderState::Pending,
                to: OrderState::Expired,
            });
            let result = self.broker.cancel_order(order.ticket).await?;
            if result.is_success() {
                tracing::info!(
                    "Expired {} {} ticket {} after {} min",
                    symbol,
                    order.kind,
                    order.ticket,
                    age
                );
                report.transitions.push(Transition {
                    ticket: Some(order.ticket),
                    kind: order.kind,
                    from: OrderState::Expired,
                    to: OrderState::Cancelled,
                });
            } else {
                tracing::warn!(
                    "Failed to cancel expired {} ticket {}: {}",
                    symbol,
                    order.ticket,
                    result.retcode
                );
                report.failures.push(PlacementFailure {
                    kind: order.kind,
                    ticket: Some(order.ticket),
                    retcode: result.retcode,
                    comment: result.comment,
                });
            }
        }
        Ok(())
    }

    async fn daily_atr(&self, symbol: &str, period: usize) -> Result<f64> {
        let daily = self.broker.candles(symbol, Timeframe::D1, period + 1).await?;
        calculate_atr(&daily, period)
            .ok_or_else(|| BotError::data_unavailable(symbol, format!("ATR({period}) daily bars")))
    }

    /// Price both straddle legs for `side` around the current quote
    pub async fn plan_orders(
        &self,
        symbol: &str,
        side: Side,
        session: &str,
    ) -> Result<Vec<PlannedOrder>> {
        let info = self.broker.symbol_info(symbol).await?;
        let tick = self.broker.tick(symbol).await?;
        let timeframe = self.config.candle_timeframe;
        let candles = self.broker.candles(symbol, timeframe, 2).await?;
        let no_candle =
            || BotError::data_unavailable(symbol, format!("completed {timeframe} candle"));

        let spread = tick.spread();
        let price = tick.price_for(side);

        let (entry_offset, candle_range) = match self.config.entry {
            EntryPolicy::SessionScaled => {
                let offsets = self
                    .distance
                    .compute_offsets(symbol, session, &candles)
                    .ok_or_else(no_candle)?;
                (offsets.entry, offsets.stop)
            }
            EntryPolicy::RangeScalp => {
                let range = completed_candle(&candles).ok_or_else(no_candle)?.range();
                (self.distance.scalp_entry_offset(symbol, range, spread), range)
            }
        };

        let stops = match self.config.stop {
            StopPolicy::CandleRange => StopDistances {
                stop: candle_range,
                target: None,
            },
            StopPolicy::AtrScaled {
                period,
                stop_multiplier,
                target_multiplier,
            } => {
                let atr = self.daily_atr(symbol, period).await?;
                StopDistances {
                    stop: self.distance.atr_offset(atr, stop_multiplier, spread),
                    target: Some(atr * target_multiplier),
                }
            }
        };

        if entry_offset <= 0.0 || stops.stop <= 0.0 {
            return Err(BotError::data_unavailable(symbol, "non-zero price distances"));
        }

        let sign = side.sign();
        let volume = info.normalize_volume(self.config.volume);
        Ok(OrderKind::straddle(side)
            .into_iter()
            .map(|kind| {
                // Limits rest on the favourable side of price, stops on the other
                let raw = if kind.is_limit() {
                    price - sign * entry_offset
                } else {
                    price + sign * entry_offset
                };
                let entry = info.round_price(raw);
                PlannedOrder {
                    kind,
                    price: entry,
                    stop_loss: info.round_price(entry - sign * stops.stop),
                    take_profit: stops.target.map(|t| info.round_price(entry + sign * t)),
                    volume,
                }
            })
            .collect())
    }

    fn request_for(&self, symbol: &str, order: &PlannedOrder, now: DateTime<Utc>) -> OrderRequest {
        OrderRequest::pending(symbol, order.kind, order.volume, order.price)
            .with_stops(Some(order.stop_loss), order.take_profit)
            .with_comment(encode_placement(now))
            .with_magic(self.config.magic)
            .with_deviation(self.config.deviation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::models::Candle;
    use chrono::TimeZone;

    fn bar(high: f64, low: f64) -> Candle {
        Candle {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M30,
            timestamp: Utc::now(),
            open: low,
            high,
            low,
            close: high,
            volume: 50.0,
        }
    }

    async fn broker() -> Arc<PaperBroker> {
        let broker = PaperBroker::default().with_symbol("EURUSD", 1.09990, 1.10000);
        broker.set_candles(
            "EURUSD",
            Timeframe::M30,
            vec![bar(1.10100, 1.09900), bar(1.10010, 1.09980)],
        );
        broker.connect().await.unwrap();
        Arc::new(broker)
    }

    #[tokio::test]
    async fn test_plan_buy_straddle() {
        let broker = broker().await;
        let manager = OrderLifecycleManager::new(
            broker,
            OrderManagerConfig::straddle(),
            DistanceCalculator::default(),
        );

        let planned = manager.plan_orders("EURUSD", Side::Buy, "London").await.unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].kind, OrderKind::BuyLimit);
        assert_eq!(planned[0].price, 1.09940);
        assert_eq!(planned[0].stop_loss, 1.09740);
        assert_eq!(planned[1].kind, OrderKind::BuyStop);
        assert_eq!(planned[1].price, 1.10060);
        assert_eq!(planned[1].stop_loss, 1.09860);
        assert!(planned.iter().all(|p| p.take_profit.is_none()));
    }

    #[tokio::test]
    async fn test_plan_sell_straddle_mirrors() {
        let broker = broker().await;
        let manager = OrderLifecycleManager::new(
            broker,
            OrderManagerConfig::straddle(),
            DistanceCalculator::default(),
        );

        // sells are measured from the bid (1.09990)
        let planned = manager.plan_orders("EURUSD", Side::Sell, "London").await.unwrap();
        assert_eq!(planned[0].kind, OrderKind::SellLimit);
        assert_eq!(planned[0].price, 1.10050);
        assert_eq!(planned[0].stop_loss, 1.10250);
        assert_eq!(planned[1].kind, OrderKind::SellStop);
        assert_eq!(planned[1].price, 1.09930);
    }

    #[tokio::test]
    async fn test_stamped_comment() {
        let broker = broker().await;
        let manager = OrderLifecycleManager::new(
            broker.clone(),
            OrderManagerConfig::straddle(),
            DistanceCalculator::default(),
        );
        let now = Utc.with_ymd_and_hms(2024, 3, 12, 9, 0, 0).unwrap();
        manager.reconcile("EURUSD", Side::Buy, "London", now).await.unwrap();

        let orders = broker.pending_orders(Some("EURUSD")).await.unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.comment == "S540"));
    }
}
