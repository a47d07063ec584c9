use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::round_to;
use crate::pricing::contract_size;

fn default_max_daily_trades() -> u32 {
    5
}

fn default_max_daily_drawdown_pct() -> f64 {
    3.0
}

fn default_profit_target_pct() -> f64 {
    2.0
}

fn default_max_daily_capital() -> f64 {
    100_000.0
}

/// Per-day circuit breakers for day-trading drivers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyLimits {
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    /// Stop for the day once P&L falls this far below zero (% of daily capital)
    #[serde(default = "default_max_daily_drawdown_pct")]
    pub max_daily_drawdown_pct: f64,
    /// Stop for the day once P&L reaches this (% of daily capital)
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: f64,
    /// Notional that may be committed per day
    #[serde(default = "default_max_daily_capital")]
    pub max_daily_capital: f64,
}

impl Default for DailyLimits {
    fn default() -> Self {
        Self {
            max_daily_trades: default_max_daily_trades(),
            max_daily_drawdown_pct: default_max_daily_drawdown_pct(),
            profit_target_pct: default_profit_target_pct(),
            max_daily_capital: default_max_daily_capital(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayState {
    pub day: NaiveDate,
    pub trades: u32,
    pub pnl: f64,
    pub remaining_capital: f64,
}

impl DayState {
    pub fn new(day: NaiveDate, limits: &DailyLimits) -> Self {
        Self {
            day,
            trades: 0,
            pnl: 0.0,
            remaining_capital: limits.max_daily_capital,
        }
    }

    /// Start a fresh day if `day` moved on. Returns true on reset.
    pub fn roll(&mut self, day: NaiveDate, limits: &DailyLimits) -> bool {
        if day == self.day {
            return false;
        }
        tracing::info!(
            "New trading day {}: previous day {} trades, P&L {:.2}",
            day,
            self.trades,
            self.pnl
        );
        *self = Self::new(day, limits);
        true
    }

    pub fn record_trade(&mut self, notional: f64) {
        self.trades += 1;
        self.remaining_capital = (self.remaining_capital - notional).max(0.0);
    }

    pub fn record_pnl(&mut self, profit: f64) {
        self.pnl += profit;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DailyLimitTrip {
    TradeLimit,
    Drawdown,
    ProfitTarget,
}

impl DailyLimits {
    pub fn pnl_pct(&self, state: &DayState) -> f64 {
        if self.max_daily_capital > 0.0 {
            state.pnl / self.max_daily_capital * 100.0
        } else {
            0.0
        }
    }

    pub fn check(&self, state: &DayState) -> Result<(), DailyLimitTrip> {
        if state.trades >= self.max_daily_trades {
            return Err(DailyLimitTrip::TradeLimit);
        }

        let pnl_pct = self.pnl_pct(state);
        if pnl_pct <= -self.max_daily_drawdown_pct {
            return Err(DailyLimitTrip::Drawdown);
        }
        if pnl_pct >= self.profit_target_pct {
            return Err(DailyLimitTrip::ProfitTarget);
        }

        Ok(())
    }

    /// Shrink `volume` so its notional fits the capital left today.
    ///
    /// `None` when not even the minimum lot fits.
    pub fn fit_volume(
        &self,
        state: &DayState,
        symbol: &str,
        price: f64,
        volume: f64,
    ) -> Option<f64> {
        let lot_value = price * contract_size(symbol);
        if lot_value <= 0.0 || volume <= 0.0 {
            return None;
        }
        if volume * lot_value <= state.remaining_capital {
            return Some(volume);
        }
        let lots = (state.remaining_capital / lot_value * 100.0 + 1e-9).floor() / 100.0;
        let adjusted = round_to(lots, 2);
        if adjusted < 0.01 {
            None
        } else {
            tracing::info!("Adjusted {} volume from {} to {}", symbol, volume, adjusted);
            Some(adjusted)
        }
    }
}
