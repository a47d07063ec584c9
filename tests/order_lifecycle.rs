use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use fxbot::broker::{BrokerGateway, PaperBroker};
use fxbot::execution::{
    ExpiryPolicy, OrderLifecycleManager, OrderManagerConfig, OrderState, SkipReason,
};
use fxbot::pricing::DistanceCalculator;
use fxbot::*;

fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, h, m, 0).unwrap()
}

fn bar(timeframe: Timeframe, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        symbol: "EURUSD".to_string(),
        timeframe,
        timestamp: Utc::now(),
        open,
        high,
        low,
        close,
        volume: 50.0,
    }
}

/// EURUSD at 1.09990/1.10000 with a 20 pip completed M30 bar
async fn eurusd() -> Arc<PaperBroker> {
    let broker = PaperBroker::default().with_symbol("EURUSD", 1.09990, 1.10000);
    broker.set_candles(
        "EURUSD",
        Timeframe::M30,
        vec![
            bar(Timeframe::M30, 1.09900, 1.10100, 1.09900, 1.10100),
            bar(Timeframe::M30, 1.09980, 1.10010, 1.09980, 1.10010),
        ],
    );
    broker.connect().await.unwrap();
    Arc::new(broker)
}

fn straddle(broker: &Arc<PaperBroker>) -> OrderLifecycleManager {
    OrderLifecycleManager::new(
        broker.clone(),
        OrderManagerConfig::straddle(),
        DistanceCalculator::default(),
    )
}

fn stamped(ticket: u64, kind: OrderKind, price: f64, comment: &str) -> PendingOrder {
    PendingOrder {
        ticket,
        symbol: "EURUSD".to_string(),
        kind,
        volume: 0.01,
        price,
        stop_loss: None,
        take_profit: None,
        comment: comment.to_string(),
        placed_at: Utc::now(),
        expires_at: None,
    }
}

fn live(ticket: u64, side: Side) -> Position {
    Position {
        ticket,
        symbol: "EURUSD".to_string(),
        side,
        volume: 0.01,
        open_price: 1.09950,
        stop_loss: None,
        take_profit: None,
        opened_at: Utc::now(),
        profit: 0.0,
        comment: String::new(),
    }
}

fn close_to(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn test_london_straddle_levels() {
    let broker = eurusd().await;
    let manager = straddle(&broker);

    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 0))
        .await
        .unwrap();
    assert_eq!(report.placed().len(), 2);
    assert!(report.skipped.is_none());

    let mut orders = broker.pending_orders(Some("EURUSD")).await.unwrap();
    orders.sort_by(|a, b| a.price.total_cmp(&b.price));
    assert_eq!(orders[0].kind, OrderKind::BuyLimit);
    assert!(close_to(orders[0].price, 1.09940));
    assert!(close_to(orders[0].stop_loss.unwrap(), 1.09740));
    assert_eq!(orders[1].kind, OrderKind::BuyStop);
    assert!(close_to(orders[1].price, 1.10060));
    assert!(close_to(orders[1].stop_loss.unwrap(), 1.09860));
    assert!(orders.iter().all(|o| o.comment == "S480"));
}

#[tokio::test]
async fn test_capacity_never_exceeded() {
    let broker = eurusd().await;
    let manager = straddle(&broker);

    for minute in 0..3 {
        manager
            .reconcile("EURUSD", Side::Buy, "London", at(12, 8, minute))
            .await
            .unwrap();
        assert_eq!(manager.open_count("EURUSD", Side::Buy).await.unwrap(), 2);
    }

    // One fill leaves room for a single leg
    broker.insert_position(live(1, Side::Buy));
    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 5))
        .await
        .unwrap();
    assert_eq!(report.cancelled().len(), 2);
    assert_eq!(report.placed().len(), 1);
    assert_eq!(manager.open_count("EURUSD", Side::Buy).await.unwrap(), 2);

    broker.insert_position(live(2, Side::Buy));
    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 6))
        .await
        .unwrap();
    assert_eq!(report.skipped, Some(SkipReason::AtCapacity { open: 2, max: 2 }));
    assert!(report.placed().is_empty());
    assert!(broker.pending_orders(Some("EURUSD")).await.unwrap().is_empty());

    // Sell positions do not count against the buy side
    assert_eq!(manager.open_count("EURUSD", Side::Sell).await.unwrap(), 0);
}

#[test]
fn test_cancel_all_is_idempotent() {
    tokio_test::block_on(async {
        let broker = eurusd().await;
        let manager = straddle(&broker);
        manager
            .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 0))
            .await
            .unwrap();

        let first = manager.cancel_all_pending("EURUSD", None).await.unwrap();
        assert_eq!(first.cancelled().len(), 2);
        assert!(broker.pending_orders(None).await.unwrap().is_empty());

        let second = manager.cancel_all_pending("EURUSD", None).await.unwrap();
        assert!(second.is_noop());
    });
}

#[tokio::test]
async fn test_expiry_across_midnight() {
    let broker = eurusd().await;
    // 23:50 placement
    broker.insert_order(stamped(1, OrderKind::BuyStop, 1.10500, "S1430"));
    broker.insert_order(stamped(2, OrderKind::BuyStop, 1.10600, "S9x"));
    broker.insert_order(stamped(3, OrderKind::BuyLimit, 1.09000, "manual hedge"));
    let manager = straddle(&broker);

    let report = manager
        .expire_stale_orders("EURUSD", at(13, 0, 10), 30)
        .await
        .unwrap();
    assert!(report.is_noop());
    assert_eq!(broker.pending_orders(None).await.unwrap().len(), 3);

    let report = manager
        .expire_stale_orders("EURUSD", at(13, 0, 31), 30)
        .await
        .unwrap();
    assert_eq!(report.expired(), vec![1]);
    assert_eq!(report.transitions[0].from, OrderState::Pending);
    assert_eq!(report.transitions[0].to, OrderState::Expired);

    let mut left: Vec<u64> = broker
        .pending_orders(None)
        .await
        .unwrap()
        .iter()
        .map(|o| o.ticket)
        .collect();
    left.sort();
    assert_eq!(left, vec![2, 3]);
}

#[tokio::test]
async fn test_missing_candle_leaves_orders_in_place() {
    let broker = eurusd().await;
    broker.set_candles(
        "EURUSD",
        Timeframe::M30,
        vec![bar(Timeframe::M30, 1.09980, 1.10010, 1.09980, 1.10010)],
    );
    broker.insert_order(stamped(7, OrderKind::BuyStop, 1.10300, "S470"));
    let manager = straddle(&broker);

    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 0))
        .await
        .unwrap();
    assert!(matches!(report.skipped, Some(SkipReason::NoLevels(_))));
    assert!(report.transitions.is_empty());
    let orders = broker.pending_orders(None).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].ticket, 7);
}

#[tokio::test]
async fn test_rejected_leg_is_reported() {
    let broker = eurusd().await;
    broker.force_retcode(RetCode::InvalidPrice);
    let manager = straddle(&broker);

    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 0))
        .await
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, OrderKind::BuyLimit);
    assert_eq!(report.failures[0].retcode, RetCode::InvalidPrice);
    assert_eq!(report.placed().len(), 1);

    let orders = broker.pending_orders(None).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].kind, OrderKind::BuyStop);
}

#[tokio::test]
async fn test_scalper_atr_levels_and_selective_expiry() {
    let broker = eurusd().await;
    // Flat 100 pip daily bars: ATR(14) = 0.01
    broker.set_candles(
        "EURUSD",
        Timeframe::D1,
        (0..15)
            .map(|_| bar(Timeframe::D1, 1.10000, 1.10500, 1.09500, 1.10000))
            .collect(),
    );
    let config = OrderManagerConfig::scalper();
    assert_eq!(config.expiry, ExpiryPolicy::ExpireAfter { minutes: 30 });
    let manager = OrderLifecycleManager::new(broker.clone(), config, DistanceCalculator::default());

    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 23, 50))
        .await
        .unwrap();
    assert_eq!(report.placed().len(), 2);

    let mut orders = broker.pending_orders(None).await.unwrap();
    orders.sort_by(|a, b| a.price.total_cmp(&b.price));
    let limit = &orders[0];
    assert_eq!(limit.kind, OrderKind::BuyLimit);
    assert!(close_to(limit.price, 1.09990));
    assert!(close_to(limit.stop_loss.unwrap(), 1.09690));
    assert!(close_to(limit.take_profit.unwrap(), 1.10990));
    let stop = &orders[1];
    assert!(close_to(stop.price, 1.10010));
    assert!(close_to(stop.take_profit.unwrap(), 1.11010));
    assert!(orders.iter().all(|o| o.comment == "S1430"));

    // Still young fifteen minutes later: the scalper adds to them up to its cap
    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(13, 0, 5))
        .await
        .unwrap();
    assert!(report.expired().is_empty());
    assert_eq!(report.placed().len(), 1);
    assert_eq!(manager.open_count("EURUSD", Side::Buy).await.unwrap(), 3);

    // 41 minutes after placement the first pair is swept and replaced
    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(13, 0, 31))
        .await
        .unwrap();
    assert_eq!(report.expired().len(), 2);
    assert_eq!(report.placed().len(), 2);
    let comments: Vec<String> = broker
        .pending_orders(None)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.comment)
        .collect();
    assert_eq!(comments.iter().filter(|c| c.as_str() == "S5").count(), 1);
    assert_eq!(comments.iter().filter(|c| c.as_str() == "S31").count(), 2);
}

#[tokio::test]
async fn test_placed_retcode_is_not_pending() {
    let broker = eurusd().await;
    broker.force_retcode(RetCode::Placed);
    let manager = straddle(&broker);

    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 0))
        .await
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].retcode, RetCode::Placed);
    assert_eq!(report.placed().len(), 1);
    assert_eq!(broker.pending_orders(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_selective_expiry_checks_capacity_before_levels() {
    let broker = eurusd().await;
    // One bar only: no completed candle to size levels from
    broker.set_candles(
        "EURUSD",
        Timeframe::M30,
        vec![bar(Timeframe::M30, 1.09980, 1.10010, 1.09980, 1.10010)],
    );
    for ticket in 1..=3 {
        broker.insert_position(live(ticket, Side::Buy));
    }
    let manager = OrderLifecycleManager::new(
        broker.clone(),
        OrderManagerConfig::scalper(),
        DistanceCalculator::default(),
    );

    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 0))
        .await
        .unwrap();
    assert_eq!(report.skipped, Some(SkipReason::AtCapacity { open: 3, max: 3 }));

    // Below capacity the same gap surfaces as missing levels
    let manager = OrderLifecycleManager::new(
        broker.clone(),
        OrderManagerConfig {
            max_positions: 4,
            ..OrderManagerConfig::scalper()
        },
        DistanceCalculator::default(),
    );
    let report = manager
        .reconcile("EURUSD", Side::Buy, "London", at(12, 8, 0))
        .await
        .unwrap();
    assert!(matches!(report.skipped, Some(SkipReason::NoLevels(_))));
}
