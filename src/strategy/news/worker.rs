use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::calendar::EconomicCalendar;
use super::events::{EconomicEvent, EventKey};
use crate::Result;

/// Anything that can report upcoming or just-released events
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn poll(&self, now: DateTime<Utc>) -> Result<Vec<EconomicEvent>>;
}

/// Serves calendar events from `lookback` before now to `lookahead` after
pub struct CalendarSource {
    calendar: Arc<EconomicCalendar>,
    lookback: Duration,
    lookahead: Duration,
}

impl CalendarSource {
    pub fn new(calendar: Arc<EconomicCalendar>) -> Self {
        Self {
            calendar,
            lookback: Duration::minutes(30),
            lookahead: Duration::minutes(30),
        }
    }
}

#[async_trait]
impl EventSource for CalendarSource {
    async fn poll(&self, now: DateTime<Utc>) -> Result<Vec<EconomicEvent>> {
        Ok(self
            .calendar
            .window(now, self.lookback, self.lookahead)
            .into_iter()
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct EventWorkerConfig {
    pub poll_interval: std::time::Duration,
    pub capacity: usize,
    /// Forget delivered events this long after their release
    pub retention: Duration,
}

impl Default for EventWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(1),
            capacity: 64,
            retention: Duration::hours(1),
        }
    }
}

/// Receiving end of the event worker
pub struct EventWorkerHandle {
    rx: mpsc::Receiver<EconomicEvent>,
    shutdown: watch::Sender<bool>,
}

impl EventWorkerHandle {
    /// Everything delivered since the last call, without waiting
    pub fn drain(&mut self) -> Vec<EconomicEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event; `None` once the worker has stopped
    pub async fn recv(&mut self) -> Option<EconomicEvent> {
        self.rx.recv().await
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

struct EventWorker {
    source: Arc<dyn EventSource>,
    config: EventWorkerConfig,
    tx: mpsc::Sender<EconomicEvent>,
    shutdown: watch::Receiver<bool>,
    delivered: HashMap<EventKey, DateTime<Utc>>,
}

impl EventWorker {
    async fn run(mut self) {
        tracing::debug!("News event worker started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if !self.poll_once(Utc::now()).await {
                break;
            }
        }
        tracing::debug!("News event worker stopped");
    }

    /// Forward new events. Returns false once the receiver is gone.
    async fn poll_once(&mut self, now: DateTime<Utc>) -> bool {
        let retention = self.config.retention;
        self.delivered.retain(|_, time| *time + retention > now);

        let events = match self.source.poll(now).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("Event source poll failed: {}", e);
                return true;
            }
        };

        for event in events {
            let key = event.key();
            if self.delivered.contains_key(&key) {
                continue;
            }
            let time = event.time;
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.delivered.insert(key, time);
                }
                // Retried on the next poll
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tracing::warn!("Event channel full, deferring {}", event);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        true
    }
}

/// Spawn the polling task. Each event is delivered once.
pub fn spawn_event_worker(
    source: Arc<dyn EventSource>,
    config: EventWorkerConfig,
) -> (EventWorkerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = EventWorker {
        source,
        config,
        tx,
        shutdown: shutdown_rx,
        delivered: HashMap::new(),
    };
    let join = tokio::spawn(worker.run());
    (
        EventWorkerHandle {
            rx,
            shutdown: shutdown_tx,
        },
        join,
    )
}
