// ─────────────────────────────────────────────────────────────────────────────
// error.rs — crate-wide error taxonomy
//
// Mirrors the exchange's own error vocabulary (analyst/crypto/exceptions.py)
// plus the Repository and control-flow kinds. Plain enum + manual Display,
// matching the style already used for OrderError in exchange.rs.
// ─────────────────────────────────────────────────────────────────────────────
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// I/O failure, connection closed, timeout. Caller retries with backoff.
    TransientNetwork(String),
    /// RateGovernor could not refetch weights to decide whether to block.
    RateLimited(String),
    /// LIMIT_MAKER would have crossed the book; recoverable, strategy walks the grid.
    OrderWouldMatch,
    /// has_sufficient_quantity(...) == false.
    InsufficientFunds,
    InvalidInterval(String),
    WrongDatetimeRange(String),
    InvalidPairCoins(String),
    PriceMustBeSetOnMarketMakingOrder,
    /// Any other non-success exchange response.
    ExchangeError(String),
    NotFound,
    AlreadyExists,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::TransientNetwork(msg) => write!(f, "transient network error: {msg}"),
            EngineError::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            EngineError::OrderWouldMatch => write!(f, "order would immediately match and take"),
            EngineError::InsufficientFunds => write!(f, "insufficient funds"),
            EngineError::InvalidInterval(i) => write!(f, "invalid interval: {i}"),
            EngineError::WrongDatetimeRange(d) => write!(f, "datetime out of range: {d}"),
            EngineError::InvalidPairCoins(s) => write!(f, "invalid pair coins: {s}"),
            EngineError::PriceMustBeSetOnMarketMakingOrder => {
                write!(f, "price must be set on market making order")
            }
            EngineError::ExchangeError(msg) => write!(f, "exchange error: {msg}"),
            EngineError::NotFound => write!(f, "not found"),
            EngineError::AlreadyExists => write!(f, "already exists"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::TransientNetwork(err.to_string())
    }
}

impl From<mongodb::error::Error> for EngineError {
    fn from(err: mongodb::error::Error) -> Self {
        EngineError::TransientNetwork(err.to_string())
    }
}

/// Binance surfaces -2010 for "order would immediately match and take" on
/// LIMIT_MAKER; we match both the exact substring and the code since a
/// localized or reworded message must still resolve correctly (spec Open
/// Question).
pub fn classify_order_create_error(code: Option<i64>, msg: &str) -> EngineError {
    if code == Some(-2010) || msg.contains("Order would immediately match and take") {
        EngineError::OrderWouldMatch
    } else {
        EngineError::ExchangeError(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_order_would_match_by_code() {
        let err = classify_order_create_error(Some(-2010), "something else");
        assert_eq!(err, EngineError::OrderWouldMatch);
    }

    #[test]
    fn classifies_order_would_match_by_message() {
        let err = classify_order_create_error(None, "Order would immediately match and take.");
        assert_eq!(err, EngineError::OrderWouldMatch);
    }

    #[test]
    fn falls_back_to_exchange_error() {
        let err = classify_order_create_error(Some(-1013), "Filter failure: LOT_SIZE");
        assert_eq!(err, EngineError::ExchangeError("Filter failure: LOT_SIZE".to_string()));
    }
}
