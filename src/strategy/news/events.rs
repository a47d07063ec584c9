use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

impl Impact {
    /// Weight compared against the strategy's impact threshold
    pub fn value(&self) -> f64 {
        match self {
            Impact::High => 0.8,
            Impact::Medium => 0.5,
            Impact::Low => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsCategory {
    InterestRate,
    Employment,
    Inflation,
    Gdp,
    Retail,
    Manufacturing,
    Housing,
    Trade,
    Other,
}

const CATEGORY_KEYWORDS: &[(NewsCategory, &[&str])] = &[
    (
        NewsCategory::InterestRate,
        &["rate decision", "interest rate", "fed", "fomc", "boe", "ecb", "rba", "boj"],
    ),
    (
        NewsCategory::Employment,
        &[
            "nonfarm payroll",
            "non-farm payroll",
            "unemployment",
            "employment",
            "jobless claims",
            "jobs",
        ],
    ),
    (
        NewsCategory::Inflation,
        &["cpi", "inflation", "ppi", "price index", "consumer price"],
    ),
    (
        NewsCategory::Gdp,
        &["gdp", "economic growth", "gross domestic product"],
    ),
    (
        NewsCategory::Retail,
        &["retail sales", "consumer spending", "consumption"],
    ),
    (
        NewsCategory::Manufacturing,
        &["pmi", "manufacturing", "industrial production", "factory"],
    ),
    (
        NewsCategory::Housing,
        &["housing", "home sales", "building permits", "construction"],
    ),
    (
        NewsCategory::Trade,
        &["trade balance", "export", "import", "trade deficit"],
    ),
];

impl NewsCategory {
    /// First category with a keyword contained in the event name
    pub fn of(event_name: &str) -> Self {
        let name = event_name.to_lowercase();
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| name.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(NewsCategory::Other)
    }
}

impl fmt::Display for NewsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NewsCategory::InterestRate => "interest_rate",
            NewsCategory::Employment => "employment",
            NewsCategory::Inflation => "inflation",
            NewsCategory::Gdp => "gdp",
            NewsCategory::Retail => "retail",
            NewsCategory::Manufacturing => "manufacturing",
            NewsCategory::Housing => "housing",
            NewsCategory::Trade => "trade",
            NewsCategory::Other => "other",
        };
        f.write_str(label)
    }
}

/// Instruments that move on releases for `currency`
pub fn affected_symbols(currency: &str) -> &'static [&'static str] {
    match currency {
        "USD" => &["EURUSD", "USDJPY", "GBPUSD", "AUDUSD", "USDCAD", "USDCHF", "NZDUSD"],
        "EUR" => &["EURUSD", "EURGBP", "EURJPY", "EURCHF", "EURAUD", "EURCAD"],
        "GBP" => &["GBPUSD", "EURGBP", "GBPJPY", "GBPCHF", "GBPAUD", "GBPCAD"],
        "JPY" => &["USDJPY", "EURJPY", "GBPJPY", "AUDJPY", "CADJPY", "CHFJPY"],
        "AUD" => &["AUDUSD", "EURAUD", "GBPAUD", "AUDJPY", "AUDCAD", "AUDCHF", "AUDNZD"],
        "CAD" => &["USDCAD", "EURCAD", "GBPCAD", "CADJPY", "AUDCAD", "CADCHF"],
        "CHF" => &["USDCHF", "EURCHF", "GBPCHF", "CHFJPY", "AUDCHF", "CADCHF"],
        "NZD" => &["NZDUSD", "EURNZD", "GBPNZD", "NZDJPY", "AUDNZD", "NZDCAD", "NZDCHF"],
        _ => &[],
    }
}

/// A scheduled economic release
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EconomicEvent {
    #[serde(rename = "datetime")]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub country: String,
    pub currency: String,
    #[serde(rename = "event")]
    pub name: String,
    pub impact: Impact,
    #[serde(default)]
    pub forecast: String,
    #[serde(default)]
    pub previous: String,
}

/// Identity used to de-duplicate events across polls
pub type EventKey = (String, String, DateTime<Utc>);

impl EconomicEvent {
    pub fn key(&self) -> EventKey {
        (self.currency.clone(), self.name.clone(), self.time)
    }

    pub fn category(&self) -> NewsCategory {
        NewsCategory::of(&self.name)
    }

    /// Negative once released
    pub fn minutes_until(&self, now: DateTime<Utc>) -> f64 {
        (self.time - now).num_seconds() as f64 / 60.0
    }

    pub fn affected_symbols(&self) -> &'static [&'static str] {
        affected_symbols(&self.currency)
    }
}

impl fmt::Display for EconomicEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({:?}, {})",
            self.currency,
            self.name,
            self.impact,
            self.time.format("%Y-%m-%d %H:%M")
        )
    }
}

/// First number in a release figure such as `"200K"`, `"-0.3%"` or `"1,250.5"`
pub fn extract_number(value: &str) -> Option<f64> {
    let cleaned: String = value.chars().filter(|c| *c != ',' && *c != '%').collect();
    let bytes = cleaned.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let negative = start > 0 && bytes[start - 1] == b'-';

    let mut end = start;
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    let number: f64 = cleaned[start..end].trim_end_matches('.').parse().ok()?;
    Some(if negative { -number } else { number })
}

/// Impact-weighted balance of forecasts above (+) and below (-) the previous figure, in [-1, 1]
pub fn sentiment<'a>(events: impl IntoIterator<Item = &'a EconomicEvent>) -> f64 {
    let mut positive = 0.0;
    let mut negative = 0.0;
    let mut total = 0.0;
    for event in events {
        let (Some(forecast), Some(previous)) =
            (extract_number(&event.forecast), extract_number(&event.previous))
        else {
            continue;
        };
        let weight = event.impact.value();
        if forecast > previous {
            positive += weight;
        } else if forecast < previous {
            negative += weight;
        }
        total += weight;
    }
    if total > 0.0 {
        (positive - negative) / total
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, impact: Impact, forecast: &str, previous: &str) -> EconomicEvent {
        EconomicEvent {
            time: Utc::now(),
            country: "US".to_string(),
            currency: "USD".to_string(),
            name: name.to_string(),
            impact,
            forecast: forecast.to_string(),
            previous: previous.to_string(),
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(NewsCategory::of("Non-Farm Payrolls"), NewsCategory::Employment);
        assert_eq!(NewsCategory::of("ECB Interest Rate Decision"), NewsCategory::InterestRate);
        assert_eq!(NewsCategory::of("GDP Growth Rate QoQ"), NewsCategory::Gdp);
        assert_eq!(NewsCategory::of("CPI YoY"), NewsCategory::Inflation);
        assert_eq!(NewsCategory::of("Speech by someone"), NewsCategory::Other);
    }

    #[test]
    fn test_extract_number() {
        assert_eq!(extract_number("200K"), Some(200.0));
        assert_eq!(extract_number("3.75%"), Some(3.75));
        assert_eq!(extract_number("-0.3%"), Some(-0.3));
        assert_eq!(extract_number("1,250.5"), Some(1250.5));
        assert_eq!(extract_number(""), None);
        assert_eq!(extract_number("n/a"), None);
    }

    #[test]
    fn test_sentiment_weighs_by_impact() {
        let events = [
            event("Non-Farm Payrolls", Impact::High, "200K", "180K"),
            event("GDP", Impact::Medium, "0.1%", "0.2%"),
            event("BOJ Outlook Report", Impact::Medium, "", ""),
        ];
        let score = sentiment(&events);
        assert!((score - (0.8 - 0.5) / 1.3).abs() < 1e-9);
        let none: [EconomicEvent; 0] = [];
        assert_eq!(sentiment(&none), 0.0);
    }

    #[test]
    fn test_affected_symbols() {
        assert!(affected_symbols("JPY").contains(&"USDJPY"));
        assert!(affected_symbols("XXX").is_empty());
    }
}
