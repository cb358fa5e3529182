//! Error taxonomy
//!
//! Data and capacity problems skip a symbol for the current cycle, backend
//! problems surface through the order lifecycle. None of them stop the engine.

use thiserror::Error;

use crate::oms::PositionState;
use crate::CandleValidationError;

/// Market data unusable for this symbol and cycle
#[derive(Debug, Error)]
pub enum DataError {
    #[error("insufficient bars: have {have}, need {need}")]
    InsufficientBars { have: usize, need: usize },

    #[error("no high-to-low swing in window")]
    NoSwing,

    #[error("swing high pivot is {age} bars old (max {max})")]
    StalePivot { age: usize, max: usize },

    #[error("invalid swing: high {high} must exceed low {low}")]
    InvalidSwing { high: f64, low: f64 },

    #[error("invalid bar: {0}")]
    InvalidBar(#[from] CandleValidationError),

    #[error("market data unavailable: {0}")]
    Unavailable(String),
}

/// Not enough free margin to open the proposed position
#[derive(Debug, Error)]
#[error("insufficient margin: available {available:.4}, required {required:.4}")]
pub struct CapacityError {
    pub available: f64,
    pub required: f64,
}

/// Failure reported by a trading backend
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("insufficient margin: available {available:.4}, required {required:.4}")]
    InsufficientMargin { available: f64, required: f64 },

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::RateLimited
            | BackendError::CircuitOpen
            | BackendError::Network(_) => true,
            // -1001 disconnected, -1007 timeout waiting for backend, -1021 timestamp skew
            BackendError::Exchange { code, .. } => matches!(code, -1001 | -1007 | -1021),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Network(e.to_string())
        }
    }
}

/// Why a proposal was not turned into a position
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("position already {0}")]
    PositionOpen(PositionState),

    #[error("symbol flagged inconsistent, new entries blocked until restart")]
    Inconsistent,

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("entry placement failed: {0}")]
    EntryFailed(#[from] BackendError),

    #[error("symbol worker stopped")]
    WorkerGone,
}

/// Why a symbol produced no proposal this cycle
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("rsi {rsi:.1} below threshold {threshold:.1}")]
    RsiBelowThreshold { rsi: f64, threshold: f64 },

    #[error("no case at retracement {ratio:.3}")]
    NoCase { ratio: f64 },

    /// Entry would sit at or above its own stop. With the shipped CASE_4
    /// stop at 1.05 of the range, any price at r ≥ 1.05 (205 on a 100/200
    /// swing) lands here instead of entering; raise `cases.case_4.stop_loss`
    /// to trade deeper overshoots.
    #[error("entry {price:.6} at or above stop {stop:.6}")]
    BeyondStop { price: f64, stop: f64 },

    #[error("position already open")]
    PositionOpen,

    #[error("excluded pair")]
    Excluded,
}

impl SkipReason {
    /// Short label used to aggregate skips in scan reports
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::Data(DataError::InsufficientBars { .. }) => "insufficient_bars",
            SkipReason::Data(DataError::NoSwing) => "no_swing",
            SkipReason::Data(DataError::StalePivot { .. }) => "stale_pivot",
            SkipReason::Data(DataError::InvalidSwing { .. }) => "invalid_swing",
            SkipReason::Data(DataError::InvalidBar(_)) => "invalid_bar",
            SkipReason::Data(DataError::Unavailable(_)) => "data_unavailable",
            SkipReason::RsiBelowThreshold { .. } => "rsi_below_threshold",
            SkipReason::NoCase { .. } => "no_case",
            SkipReason::BeyondStop { .. } => "beyond_stop",
            SkipReason::PositionOpen => "position_open",
            SkipReason::Excluded => "excluded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BackendError::RateLimited.is_retryable());
        assert!(BackendError::Network("reset".into()).is_retryable());
        assert!(BackendError::Exchange {
            code: -1021,
            message: "timestamp".into()
        }
        .is_retryable());
        assert!(!BackendError::Rejected("bad qty".into()).is_retryable());
        assert!(!BackendError::Exchange {
            code: -2019,
            message: "margin".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_skip_labels() {
        let skip: SkipReason = DataError::NoSwing.into();
        assert_eq!(skip.label(), "no_swing");
        assert_eq!(
            SkipReason::RsiBelowThreshold {
                rsi: 40.0,
                threshold: 70.0
            }
            .to_string(),
            "rsi 40.0 below threshold 70.0"
        );
    }
}
