// Session timing: named UTC trading windows and the day-trading market window
pub mod calendar;
pub mod market_hours;

pub use calendar::{is_window_active, Session, SessionCalendar};
pub use market_hours::TradingHours;
