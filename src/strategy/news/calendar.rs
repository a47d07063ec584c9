use chrono::{DateTime, Duration, Utc};
use std::path::Path;

use super::events::{EconomicEvent, Impact};
use crate::Result;

/// Scheduled releases, sorted by time. Loaded once, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EconomicCalendar {
    events: Vec<EconomicEvent>,
}

impl EconomicCalendar {
    pub fn new(mut events: Vec<EconomicEvent>) -> Self {
        events.sort_by_key(|e| e.time);
        Self { events }
    }

    /// Read a JSON array of events
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let events: Vec<EconomicEvent> = serde_json::from_str(&raw)?;
        tracing::info!("Loaded {} calendar events from {}", events.len(), path.display());
        Ok(Self::new(events))
    }

    /// A fixed set of releases relative to the start of `now`'s day, for
    /// paper runs and tests
    pub fn sample(now: DateTime<Utc>) -> Self {
        let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        // (offset, country, currency, name, impact, forecast, previous)
        let rows = [
            (Duration::minutes(30), "US", "USD", "Non-Farm Payrolls", Impact::High, "200K", "180K"),
            (
                Duration::hours(3),
                "EU",
                "EUR",
                "ECB Interest Rate Decision",
                Impact::High,
                "3.75%",
                "3.75%",
            ),
            (
                Duration::hours(5),
                "UK",
                "GBP",
                "GDP Growth Rate QoQ",
                Impact::Medium,
                "0.2%",
                "0.1%",
            ),
            (Duration::hours(25), "US", "USD", "CPI YoY", Impact::High, "3.2%", "3.3%"),
            (Duration::hours(34), "JP", "JPY", "BOJ Outlook Report", Impact::Medium, "", ""),
        ];
        Self::new(
            rows.into_iter()
                .map(
                    |(offset, country, currency, name, impact, forecast, previous)| EconomicEvent {
                        time: midnight + offset,
                        country: country.to_string(),
                        currency: currency.to_string(),
                        name: name.to_string(),
                        impact,
                        forecast: forecast.to_string(),
                        previous: previous.to_string(),
                    },
                )
                .collect(),
        )
    }

    pub fn events(&self) -> &[EconomicEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events released within `behind` before `now` or due within `ahead` after it
    pub fn window(
        &self,
        now: DateTime<Utc>,
        behind: Duration,
        ahead: Duration,
    ) -> Vec<&EconomicEvent> {
        self.events
            .iter()
            .filter(|e| e.time > now - behind && e.time <= now + ahead)
            .collect()
    }

    pub fn next_event(&self, now: DateTime<Utc>) -> Option<&EconomicEvent> {
        self.events.iter().find(|e| e.time > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, h, m, 0).unwrap()
    }

    #[test]
    fn test_sample_calendar_layout() {
        let calendar = EconomicCalendar::sample(utc(10, 15));
        assert_eq!(calendar.events().len(), 5);
        assert_eq!(calendar.events()[0].time, utc(0, 30));
        assert_eq!(calendar.events()[0].impact, Impact::High);
        assert_eq!(calendar.events()[3].name, "CPI YoY");
        assert_eq!(calendar.next_event(utc(2, 0)).unwrap().currency, "EUR");
    }

    #[test]
    fn test_window() {
        let calendar = EconomicCalendar::sample(utc(0, 0));
        let around = calendar.window(utc(2, 45), Duration::minutes(30), Duration::minutes(30));
        assert_eq!(around.len(), 1);
        assert_eq!(around[0].currency, "EUR");
        assert!(calendar
            .window(utc(1, 30), Duration::minutes(30), Duration::minutes(30))
            .is_empty());
    }

    #[test]
    fn test_parses_json_events() {
        let raw = r#"[{"datetime": "2024-03-12T12:30:00Z", "currency": "USD",
                       "event": "Retail Sales MoM", "impact": "medium", "forecast": "0.4%"}]"#;
        let events: Vec<EconomicEvent> = serde_json::from_str(raw).unwrap();
        let calendar = EconomicCalendar::new(events);
        assert_eq!(calendar.events()[0].impact, Impact::Medium);
        assert_eq!(calendar.events()[0].previous, "");
    }
}
