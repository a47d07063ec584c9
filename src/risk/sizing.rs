use crate::models::SymbolInfo;
use crate::pricing::contract_size;

/// Lots that lose `risk_percent` of `balance` if price moves `stop_distance`
/// against the position, snapped to the symbol's lot step.
pub fn risk_position_size(
    balance: f64,
    risk_percent: f64,
    stop_distance: f64,
    info: &SymbolInfo,
) -> f64 {
    if stop_distance <= 0.0 || balance <= 0.0 || risk_percent <= 0.0 {
        return info.volume_min;
    }
    let risk_amount = balance * risk_percent / 100.0;
    let lots = risk_amount / (stop_distance * contract_size(&info.symbol));
    info.normalize_volume(lots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(symbol: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            digits: 5,
            point: 0.00001,
            spread: 10,
            volume_min: 0.01,
            volume_step: 0.01,
            trade_allowed: true,
        }
    }

    #[test]
    fn test_one_percent_over_fifty_pips() {
        // 100 at risk over 0.0050 * 100_000 = 500 per lot
        let lots = risk_position_size(10_000.0, 1.0, 0.0050, &info("EURUSD"));
        assert_eq!(lots, 0.2);
    }

    #[test]
    fn test_minimum_lot() {
        assert_eq!(risk_position_size(100.0, 0.5, 0.0050, &info("EURUSD")), 0.01);
        assert_eq!(risk_position_size(10_000.0, 1.0, 0.0, &info("EURUSD")), 0.01);
    }
}
