use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::error::BotError;
use crate::models::Side;
use crate::Result;

/// Membership test for a time-of-day window.
///
/// `start` is inclusive, `end` exclusive. A window whose start is after its
/// end wraps past midnight.
pub fn is_window_active(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start < end {
        start <= t && t < end
    } else {
        t >= start || t < end
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// A named trading window in UTC with the instruments traded during it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Buy-favoured subset, only used by directional calendars
    #[serde(default)]
    pub buy_symbols: Vec<String>,
    /// Sell-favoured subset, only used by directional calendars
    #[serde(default)]
    pub sell_symbols: Vec<String>,
}

impl Session {
    pub fn new(name: impl Into<String>, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            symbols: Vec::new(),
            buy_symbols: Vec::new(),
            sell_symbols: Vec::new(),
        }
    }

    pub fn with_symbols(mut self, list: &[&str]) -> Self {
        self.symbols = symbols(list);
        self
    }

    pub fn with_sides(mut self, buy: &[&str], sell: &[&str]) -> Self {
        self.buy_symbols = symbols(buy);
        self.sell_symbols = symbols(sell);
        self
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        is_window_active(self.start, self.end, now.time())
    }

    pub fn is_directional(&self) -> bool {
        !self.buy_symbols.is_empty() || !self.sell_symbols.is_empty()
    }

    /// Instruments to trade on `side` while this session is open
    pub fn symbols_for(&self, side: Side) -> &[String] {
        if !self.is_directional() {
            return &self.symbols;
        }
        match side {
            Side::Buy => &self.buy_symbols,
            Side::Sell => &self.sell_symbols,
        }
    }

    /// Every instrument the session mentions, side lists included
    pub fn all_symbols(&self) -> impl Iterator<Item = &String> {
        self.symbols
            .iter()
            .chain(self.buy_symbols.iter())
            .chain(self.sell_symbols.iter())
    }

    /// Time until the window next opens; zero while it is open
    pub fn time_until_open(&self, now: DateTime<Utc>) -> Duration {
        if self.is_active(now) {
            return Duration::zero();
        }
        let mut start = now.date_naive().and_time(self.start).and_utc();
        if start <= now {
            start += Duration::days(1);
        }
        start - now
    }

    /// Time until the window closes; `None` while it is closed
    pub fn time_until_close(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_active(now) {
            return None;
        }
        let mut end = now.date_naive().and_time(self.end).and_utc();
        if end <= now {
            end += Duration::days(1);
        }
        Some(end - now)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}-{} UTC)",
            self.name,
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Immutable set of trading sessions.
///
/// Built once from configuration and shared by reference; nothing mutates
/// it after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCalendar {
    sessions: Vec<Session>,
}

impl SessionCalendar {
    /// Build a calendar, rejecting duplicate names and zero-length windows
    pub fn new(sessions: Vec<Session>) -> Result<Self> {
        let mut seen = HashSet::new();
        for session in &sessions {
            if !seen.insert(session.name.as_str()) {
                return Err(BotError::InvalidInput(format!(
                    "duplicate session {}",
                    session.name
                )));
            }
            if session.start == session.end {
                return Err(BotError::InvalidInput(format!(
                    "session {} has an empty window",
                    session.name
                )));
            }
        }
        Ok(Self { sessions })
    }

    /// Straddle calendar: one instrument list per session
    pub fn forex_majors() -> Self {
        Self {
            sessions: vec![
                Session::new("Tokyo & Sydney", hm(22, 0), hm(7, 0))
                    .with_symbols(&["AUDUSD", "NZDUSD", "USDJPY", "AUDJPY", "NZDJPY"]),
                Session::new("London", hm(7, 0), hm(16, 0)).with_symbols(&[
                    "EURUSD", "GBPUSD", "EURGBP", "USDCHF", "EURJPY", "GBPJPY", "XAUUSD",
                ]),
                Session::new("New York", hm(13, 0), hm(22, 0))
                    .with_symbols(&["EURUSD", "GBPUSD", "USDCAD", "USDJPY", "XAUUSD"]),
            ],
        }
    }

    /// Scalping calendar: buy-favoured and sell-favoured instruments per session
    pub fn directional() -> Self {
        Self {
            sessions: vec![
                Session::new("Tokyo & Sydney", hm(22, 0), hm(7, 0))
                    .with_sides(&["AUDUSD", "NZDUSD", "AUDJPY"], &["USDJPY", "NZDJPY"]),
                Session::new("London", hm(7, 0), hm(16, 0)).with_sides(
                    &["EURUSD", "GBPUSD", "XAUUSD"],
                    &["EURGBP", "USDCHF", "GBPJPY"],
                ),
                Session::new("New York", hm(13, 0), hm(22, 0))
                    .with_sides(&["EURUSD", "XAUUSD"], &["USDCAD", "USDJPY"]),
            ],
        }
    }

    /// Geographic market sessions without instrument lists
    pub fn market_sessions() -> Self {
        Self {
            sessions: vec![
                Session::new("sydney", hm(22, 0), hm(7, 0)),
                Session::new("tokyo", hm(0, 0), hm(9, 0)),
                Session::new("london", hm(8, 0), hm(16, 0)),
                Session::new("new_york", hm(13, 0), hm(22, 0)),
            ],
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, name: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.name == name)
    }

    /// Sessions open at `now`, in declaration order
    pub fn active_sessions(&self, now: DateTime<Utc>) -> Vec<&Session> {
        self.sessions.iter().filter(|s| s.is_active(now)).collect()
    }

    /// First open session in declaration order
    pub fn current_session(&self, now: DateTime<Utc>) -> Option<&Session> {
        self.sessions.iter().find(|s| s.is_active(now))
    }

    /// Union of instruments over every open session. Empty means do nothing this tick.
    pub fn active_instruments(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        self.active_sessions(now)
            .into_iter()
            .flat_map(|s| s.all_symbols().cloned())
            .collect()
    }

    /// Union of instruments tradeable on `side` over every open session
    pub fn active_instruments_for(&self, side: Side, now: DateTime<Utc>) -> BTreeSet<String> {
        self.active_sessions(now)
            .into_iter()
            .flat_map(|s| s.symbols_for(side).iter().cloned())
            .collect()
    }

    pub fn time_until_session(&self, name: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.session(name).map(|s| s.time_until_open(now))
    }

    /// The closed session that opens soonest
    pub fn next_session(&self, now: DateTime<Utc>) -> Option<(&Session, Duration)> {
        self.sessions
            .iter()
            .filter(|s| !s.is_active(now))
            .map(|s| (s, s.time_until_open(now)))
            .min_by_key(|(_, wait)| *wait)
    }
}
