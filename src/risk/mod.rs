// Risk management: daily circuit breakers and position sizing
pub mod daily_limits;
pub mod sizing;

pub use daily_limits::{DailyLimitTrip, DailyLimits, DayState};
pub use sizing::risk_position_size;
