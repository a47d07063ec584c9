// Price distances: entry offsets, protective stops and trailing distances
pub mod distance;

pub use distance::{
    completed_candle, contract_size, pip_value, quote_digits, DistanceCalculator, DistanceConfig,
    InstrumentClass, Offsets, ScalpConfig,
};
