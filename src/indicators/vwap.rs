//! Volume-weighted average price with standard-deviation bands

use crate::models::Candle;

/// VWAP snapshot at the latest candle
#[derive(Debug, Clone, PartialEq)]
pub struct VwapBands {
    pub vwap: f64,
    pub close: f64,
    /// Sample standard deviation of `close - vwap` over the band window
    pub std_dev: f64,
    pub upper: f64,
    pub lower: f64,
    /// `(close - vwap) / std_dev`, zero when the window has no dispersion
    pub deviation: f64,
    pub average_volume: f64,
}

impl VwapBands {
    pub fn below_lower(&self) -> bool {
        self.close <= self.lower
    }

    pub fn above_upper(&self) -> bool {
        self.close >= self.upper
    }
}

/// Cumulative VWAP after each candle (typical price weighted by volume)
fn cumulative_vwap(candles: &[Candle]) -> Vec<Option<f64>> {
    let mut pv = 0.0;
    let mut volume = 0.0;
    candles
        .iter()
        .map(|c| {
            pv += c.typical_price() * c.volume;
            volume += c.volume;
            (volume > 0.0).then(|| pv / volume)
        })
        .collect()
}

/// VWAP over every candle in the slice
pub fn calculate_vwap(candles: &[Candle]) -> Option<f64> {
    cumulative_vwap(candles).last().copied().flatten()
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// VWAP with bands at `vwap ± std_multiplier * std(close - vwap)` over the last `window` bars
///
/// `volume_window` bars are averaged for the liquidity filter.
pub fn calculate_vwap_bands(
    candles: &[Candle],
    window: usize,
    std_multiplier: f64,
    volume_window: usize,
) -> Option<VwapBands> {
    if window < 2 || candles.len() < window {
        return None;
    }

    let vwaps = cumulative_vwap(candles);
    let spreads: Vec<f64> = candles[candles.len() - window..]
        .iter()
        .zip(&vwaps[vwaps.len() - window..])
        .map(|(c, v)| v.map(|v| c.close - v))
        .collect::<Option<Vec<f64>>>()?;

    let last = candles.last()?;
    let vwap = vwaps.last().copied().flatten()?;
    // Float noise from the running sums is not dispersion
    let std_dev = match sample_std(&spreads) {
        s if s < 1e-12 => 0.0,
        s => s,
    };
    let deviation = if std_dev > 0.0 {
        (last.close - vwap) / std_dev
    } else {
        0.0
    };

    let volume_window = volume_window.clamp(1, candles.len());
    let average_volume = candles[candles.len() - volume_window..]
        .iter()
        .map(|c| c.volume)
        .sum::<f64>()
        / volume_window as f64;

    Some(VwapBands {
        vwap,
        close: last.close,
        std_dev,
        upper: vwap + std_dev * std_multiplier,
        lower: vwap - std_dev * std_multiplier,
        deviation,
        average_volume,
    })
}
