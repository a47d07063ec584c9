use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{round_to, Candle};

/// Volatility class of an instrument, derived from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentClass {
    /// Gold and other XAU quotes
    Metal,
    /// Any pair quoted against the yen
    Yen,
    /// Pairs containing EUR, GBP or USD
    Major,
    Cross,
}

impl InstrumentClass {
    pub fn of(symbol: &str) -> Self {
        let symbol = symbol.to_ascii_uppercase();
        if symbol.starts_with("XAU") {
            InstrumentClass::Metal
        } else if symbol.contains("JPY") {
            InstrumentClass::Yen
        } else if ["EUR", "GBP", "USD"].iter().any(|c| symbol.contains(c)) {
            InstrumentClass::Major
        } else {
            InstrumentClass::Cross
        }
    }
}

/// Size of one pip in price units
pub fn pip_value(symbol: &str) -> f64 {
    match InstrumentClass::of(symbol) {
        InstrumentClass::Metal => 0.1,
        InstrumentClass::Yen => 0.01,
        InstrumentClass::Major | InstrumentClass::Cross => 0.0001,
    }
}

/// Decimal places the instrument is quoted with
pub fn quote_digits(symbol: &str) -> u32 {
    match InstrumentClass::of(symbol) {
        InstrumentClass::Metal | InstrumentClass::Yen => 3,
        InstrumentClass::Major | InstrumentClass::Cross => 5,
    }
}

/// Units of the base asset in one lot
pub fn contract_size(symbol: &str) -> f64 {
    match InstrumentClass::of(symbol) {
        InstrumentClass::Metal => 100.0,
        _ => 100_000.0,
    }
}

/// Last completed bar. The final bar from the terminal is still forming and
/// its range keeps growing, so it is never used.
pub fn completed_candle(candles: &[Candle]) -> Option<&Candle> {
    if candles.len() < 2 {
        return None;
    }
    candles.get(candles.len() - 2)
}

fn default_base_pips() -> f64 {
    5.0
}

fn default_session_multipliers() -> HashMap<String, f64> {
    HashMap::from([
        ("Tokyo & Sydney".to_string(), 0.8),
        ("London".to_string(), 1.2),
        ("New York".to_string(), 1.0),
    ])
}

fn default_instrument_multipliers() -> HashMap<InstrumentClass, f64> {
    HashMap::from([
        (InstrumentClass::Metal, 1.5),
        (InstrumentClass::Yen, 1.2),
        (InstrumentClass::Major, 1.0),
        (InstrumentClass::Cross, 1.1),
    ])
}

/// Parameters of the range-based scalping distances
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalpConfig {
    pub base_entry_pips: f64,
    /// Share of the last candle range used as entry distance
    pub range_fraction: f64,
    /// Extra distance for yen pairs
    pub yen_volatility: f64,
    pub scalp_multiplier: f64,
    /// Every distance is at least `spread * min_spread_multiplier`
    pub min_spread_multiplier: f64,
    pub trailing_pips: f64,
    pub trailing_range_fraction: f64,
}

impl Default for ScalpConfig {
    fn default() -> Self {
        Self {
            base_entry_pips: 1.0,
            range_fraction: 0.1,
            yen_volatility: 1.2,
            scalp_multiplier: 0.5,
            min_spread_multiplier: 1.0,
            trailing_pips: 5.0,
            trailing_range_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistanceConfig {
    #[serde(default = "default_base_pips")]
    pub base_pips: f64,
    #[serde(default = "default_session_multipliers")]
    pub session_multipliers: HashMap<String, f64>,
    #[serde(default = "default_instrument_multipliers")]
    pub instrument_multipliers: HashMap<InstrumentClass, f64>,
    #[serde(default)]
    pub scalp: ScalpConfig,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            base_pips: default_base_pips(),
            session_multipliers: default_session_multipliers(),
            instrument_multipliers: default_instrument_multipliers(),
            scalp: ScalpConfig::default(),
        }
    }
}

/// Entry and protective-stop distances in absolute price units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offsets {
    pub entry: f64,
    pub stop: f64,
}

/// Turns instrument, session and recent volatility into price distances
#[derive(Debug, Clone, Default)]
pub struct DistanceCalculator {
    config: DistanceConfig,
}

impl DistanceCalculator {
    pub fn new(config: DistanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DistanceConfig {
        &self.config
    }

    pub fn session_multiplier(&self, session: &str) -> f64 {
        self.config
            .session_multipliers
            .get(session)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn instrument_multiplier(&self, symbol: &str) -> f64 {
        self.config
            .instrument_multipliers
            .get(&InstrumentClass::of(symbol))
            .copied()
            .unwrap_or(1.0)
    }

    /// `base_pips * session * instrument * pip`, rounded to quote precision
    pub fn entry_offset(&self, symbol: &str, session: &str) -> f64 {
        let raw = self.config.base_pips
            * self.session_multiplier(session)
            * self.instrument_multiplier(symbol)
            * pip_value(symbol);
        round_to(raw, quote_digits(symbol))
    }

    /// Session-scaled entry distance and a stop one completed-candle range away.
    ///
    /// Returns `None` when no completed candle is available.
    pub fn compute_offsets(
        &self,
        symbol: &str,
        session: &str,
        candles: &[Candle],
    ) -> Option<Offsets> {
        let candle = completed_candle(candles)?;
        Some(Offsets {
            entry: self.entry_offset(symbol, session),
            stop: candle.range(),
        })
    }

    /// Minimum distance any level must keep from price
    pub fn spread_floor(&self, spread: f64) -> f64 {
        spread * self.config.scalp.min_spread_multiplier
    }

    /// Entry distance for the scalping variant
    pub fn scalp_entry_offset(&self, symbol: &str, candle_range: f64, spread: f64) -> f64 {
        let scalp = &self.config.scalp;
        let base =
            (scalp.base_entry_pips * pip_value(symbol)).max(candle_range * scalp.range_fraction);
        let volatility = match InstrumentClass::of(symbol) {
            InstrumentClass::Yen => scalp.yen_volatility,
            _ => 1.0,
        };
        (base * volatility * scalp.scalp_multiplier).max(self.spread_floor(spread))
    }

    /// ATR-scaled distance with the spread floor applied
    pub fn atr_offset(&self, atr: f64, multiplier: f64, spread: f64) -> f64 {
        (atr * multiplier).max(self.spread_floor(spread))
    }

    /// Distance a trailing stop keeps behind price
    pub fn trailing_offset(&self, symbol: &str, candle_range: f64, spread: f64) -> f64 {
        let scalp = &self.config.scalp;
        (scalp.trailing_pips * pip_value(symbol))
            .max(candle_range * scalp.trailing_range_fraction)
            .max(self.spread_floor(spread))
    }
}
