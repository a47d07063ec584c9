use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::BotError;
use crate::Result;

/// Regular trading window of an exchange-style market, in its local time zone.
///
/// Used by day-trading drivers: no entries outside the window, forced flat
/// before the close.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingHours {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    weekdays_only: bool,
}

impl TradingHours {
    pub fn new(timezone: &str, open: NaiveTime, close: NaiveTime) -> Result<Self> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|e| BotError::InvalidInput(format!("unknown timezone {timezone}: {e}")))?;
        if open >= close {
            return Err(BotError::InvalidInput(format!(
                "trading window must open before it closes ({open} >= {close})"
            )));
        }
        Ok(Self {
            timezone,
            open,
            close,
            weekdays_only: true,
        })
    }

    /// 09:30-16:00 America/New_York, weekdays
    pub fn new_york_equities() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            weekdays_only: true,
        }
    }

    pub fn with_weekends(mut self) -> Self {
        self.weekdays_only = false;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Local calendar date, used to roll daily statistics
    pub fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    fn is_trading_date(&self, date: NaiveDate) -> bool {
        !self.weekdays_only || !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    fn at(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        if !self.is_trading_date(local.date_naive()) {
            return false;
        }
        let t = local.time();
        self.open <= t && t < self.close
    }

    /// Time left until today's close; `None` when the market is closed
    pub fn time_to_close(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_open(now) {
            return None;
        }
        self.at(self.trading_day(now), self.close)
            .map(|close| close - now)
    }

    /// Time until the next open; zero while open
    pub fn time_to_open(&self, now: DateTime<Utc>) -> Duration {
        if self.is_open(now) {
            return Duration::zero();
        }
        let mut date = self.trading_day(now);
        for _ in 0..8 {
            if self.is_trading_date(date) {
                if let Some(open) = self.at(date, self.open) {
                    if open > now {
                        return open - now;
                    }
                }
            }
            date = date.succ_opt().unwrap_or(date);
        }
        Duration::zero()
    }
}
