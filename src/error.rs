use thiserror::Error;

use crate::models::RetCode;

/// Errors raised by the trading core.
///
/// Variants follow how the run loop reacts to them: connectivity errors
/// trigger a reconnect, data and rejection errors skip the instrument for
/// the current tick, malformed state is only warned about.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker is not connected")]
    NotConnected,

    #[error("broker call timed out: {0}")]
    Timeout(String),

    #[error("{what} unavailable for {symbol}")]
    DataUnavailable { symbol: String, what: String },

    #[error("order rejected for {symbol}: {retcode} ({comment})")]
    OrderRejected {
        symbol: String,
        retcode: RetCode,
        comment: String,
    },

    #[error("malformed state: {0}")]
    MalformedState(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    pub fn data_unavailable(symbol: impl Into<String>, what: impl Into<String>) -> Self {
        Self::DataUnavailable {
            symbol: symbol.into(),
            what: what.into(),
        }
    }

    /// True for errors the runner answers with a reconnect.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Connection(_) | Self::NotConnected | Self::Timeout(_) => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}
