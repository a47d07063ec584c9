use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use fxbot::broker::{BrokerGateway, PaperBroker};
use fxbot::config::RunnerConfig;
use fxbot::execution::{ExitReason, Executor, PositionManager};
use fxbot::strategy::StrategyRunner;
use fxbot::{BotError, ExecutionReport, Side, Strategy, TradeSignal};

fn fast(iterations: Option<u64>) -> RunnerConfig {
    RunnerConfig {
        poll_interval_secs: 0,
        iterations,
        reconnect_backoff_secs: vec![0],
        tick_timeout_secs: 5,
    }
}

fn paper() -> Arc<PaperBroker> {
    Arc::new(PaperBroker::default().with_symbol("EURUSD", 1.10000, 1.10010))
}

/// Buys on the first tick, closes on the third, and can be told to misbehave
struct ScriptedStrategy {
    broker: Arc<PaperBroker>,
    executor: Executor,
    positions: PositionManager,
    ticks: u64,
    initialized: bool,
    shut_down: bool,
    drop_connection_on: Option<u64>,
    refuse_on: Option<u64>,
    fail_on: Option<u64>,
    stall_on: Option<u64>,
    fail_init: bool,
}

impl ScriptedStrategy {
    fn new(broker: Arc<PaperBroker>) -> Self {
        Self {
            executor: Executor::new(broker.clone(), "scripted", 1),
            positions: PositionManager::new(broker.clone()),
            broker,
            ticks: 0,
            initialized: false,
            shut_down: false,
            drop_connection_on: None,
            refuse_on: None,
            fail_on: None,
            stall_on: None,
            fail_init: false,
        }
    }
}

#[async_trait]
impl Strategy for ScriptedStrategy {
    type Analysis = u64;

    fn name(&self) -> &str {
        "scripted"
    }

    async fn initialize(&mut self) -> fxbot::Result<()> {
        if self.fail_init {
            return Err(BotError::InvalidInput("bad parameters".into()));
        }
        self.initialized = true;
        Ok(())
    }

    async fn analyze_market(&mut self, _now: DateTime<Utc>) -> fxbot::Result<u64> {
        self.ticks += 1;
        if self.drop_connection_on == Some(self.ticks) {
            self.broker.drop_connection();
        }
        if self.refuse_on == Some(self.ticks) {
            self.broker.refuse_connections(true);
        }
        if self.fail_on == Some(self.ticks) {
            return Err(BotError::data_unavailable("EURUSD", "candles"));
        }
        if self.stall_on == Some(self.ticks) {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        self.broker.tick("EURUSD").await?;
        Ok(self.ticks)
    }

    async fn generate_signals(
        &mut self,
        tick: &u64,
        now: DateTime<Utc>,
    ) -> fxbot::Result<Vec<TradeSignal>> {
        if *tick == 1 {
            return Ok(vec![TradeSignal::market("EURUSD", Side::Buy, 0.1, 1.10010, now)]);
        }
        Ok(Vec::new())
    }

    async fn execute_signals(
        &mut self,
        signals: &[TradeSignal],
        _now: DateTime<Utc>,
    ) -> fxbot::Result<Vec<ExecutionReport>> {
        self.executor.execute_all(signals).await
    }

    async fn manage_positions(
        &mut self,
        tick: &u64,
        _now: DateTime<Utc>,
    ) -> fxbot::Result<Vec<ExecutionReport>> {
        if *tick == 3 {
            self.broker.set_quote("EURUSD", 1.10110, 1.10120);
            return self.positions.close_all(None, ExitReason::TargetReached).await;
        }
        Ok(Vec::new())
    }

    async fn shutdown(&mut self) -> fxbot::Result<()> {
        self.shut_down = true;
        Ok(())
    }
}

#[tokio::test]
async fn test_bounded_run_drives_every_stage() {
    let broker = paper();
    let mut strategy = ScriptedStrategy::new(broker.clone());
    let runner = StrategyRunner::new(broker.clone(), fast(Some(3))).without_ctrl_c();

    let stats = runner.run(&mut strategy).await.unwrap();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.failed_ticks, 0);
    assert_eq!(stats.signals, 1);
    assert_eq!(stats.executed, 2);
    assert_eq!(stats.wins, 1);
    assert!(stats.realized_profit > 0.0);

    assert!(strategy.initialized);
    assert!(strategy.shut_down);
    // The session is closed on exit
    assert!(matches!(broker.tick("EURUSD").await, Err(BotError::NotConnected)));
}

#[tokio::test]
async fn test_shutdown_handle_stops_unbounded_run() {
    let broker = paper();
    let mut strategy = ScriptedStrategy::new(broker.clone());
    let mut config = fast(None);
    config.poll_interval_secs = 1;
    let runner = StrategyRunner::new(broker, config).without_ctrl_c();

    let handle = runner.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown();
    });

    let stats = tokio::time::timeout(Duration::from_secs(5), runner.run(&mut strategy))
        .await
        .expect("runner ignored the shutdown request")
        .unwrap();
    assert_eq!(stats.ticks, 2);
    assert!(strategy.shut_down);
}

#[tokio::test]
async fn test_reconnects_after_lost_session() {
    let broker = paper();
    let mut strategy = ScriptedStrategy::new(broker.clone());
    strategy.drop_connection_on = Some(2);
    let runner = StrategyRunner::new(broker, fast(Some(4))).without_ctrl_c();

    let stats = runner.run(&mut strategy).await.unwrap();
    assert_eq!(stats.ticks, 4);
    assert_eq!(stats.failed_ticks, 1);
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test]
async fn test_reconnect_gives_up_without_aborting() {
    let broker = paper();
    let mut strategy = ScriptedStrategy::new(broker.clone());
    strategy.drop_connection_on = Some(1);
    strategy.refuse_on = Some(1);
    let runner = StrategyRunner::new(broker, fast(Some(2))).without_ctrl_c();

    let stats = runner.run(&mut strategy).await.unwrap();
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.failed_ticks, 2);
    assert_eq!(stats.reconnects, 0);
    assert!(strategy.shut_down);
}

#[tokio::test]
async fn test_failed_tick_does_not_stop_the_loop() {
    let broker = paper();
    let mut strategy = ScriptedStrategy::new(broker.clone());
    strategy.fail_on = Some(1);
    let runner = StrategyRunner::new(broker, fast(Some(3))).without_ctrl_c();

    let stats = runner.run(&mut strategy).await.unwrap();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.failed_ticks, 1);
    assert_eq!(stats.reconnects, 0);
    // The buy signal of tick 1 was lost with the failed tick
    assert_eq!(stats.signals, 0);
}

#[tokio::test]
async fn test_stalled_tick_is_abandoned() {
    let broker = paper();
    let mut strategy = ScriptedStrategy::new(broker.clone());
    strategy.stall_on = Some(1);
    let mut config = fast(Some(1));
    config.tick_timeout_secs = 1;
    let runner = StrategyRunner::new(broker, config).without_ctrl_c();

    let stats = runner.run(&mut strategy).await.unwrap();
    assert_eq!(stats.ticks, 1);
    assert_eq!(stats.failed_ticks, 1);
    assert!(strategy.shut_down);
}

#[tokio::test]
async fn test_initialize_failure_aborts_before_first_tick() {
    let broker = paper();
    let mut strategy = ScriptedStrategy::new(broker.clone());
    strategy.fail_init = true;
    let runner = StrategyRunner::new(broker.clone(), fast(Some(3))).without_ctrl_c();

    let err = tokio_test::assert_err!(runner.run(&mut strategy).await);
    assert!(matches!(err, BotError::InvalidInput(_)));
    assert_eq!(strategy.ticks, 0);
    assert!(matches!(broker.tick("EURUSD").await, Err(BotError::NotConnected)));
}

#[tokio::test]
async fn test_refused_connection_fails_fast() {
    let broker = paper();
    broker.refuse_connections(true);
    let mut strategy = ScriptedStrategy::new(broker.clone());
    let runner = StrategyRunner::new(broker, fast(Some(3))).without_ctrl_c();

    let err = runner.run(&mut strategy).await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(!strategy.initialized);
}
