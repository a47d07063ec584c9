// Technical indicators module
// Implements RSI, ATR and VWAP bands over broker candles

pub mod atr;
pub mod rsi;
pub mod vwap;

pub use atr::{average_range, calculate_atr, true_ranges};
pub use rsi::{calculate_rsi, rsi_series, RsiZone};
pub use vwap::{calculate_vwap, calculate_vwap_bands, VwapBands};
