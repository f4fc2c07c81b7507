//! Saga error types.

use common::OrderKey;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// An atomic unit failed on every attempt. Wraps the last failure.
    #[error("Unit '{unit}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        unit: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The backward compensation of a partially applied saga failed; the
    /// effects it should have undone are still in place.
    #[error("Compensation for order {order} failed: {source}")]
    CompensationFailed {
        order: OrderKey,
        #[source]
        source: Box<SagaError>,
    },

    /// The request was rejected before any unit ran.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Storage error outside a retried unit.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SagaError {
    /// Returns true when the failure is a unit that ran out of attempts.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, SagaError::RetryExhausted { .. })
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::DistrictKey;

    #[test]
    fn test_exhausted_display_names_unit_and_attempts() {
        let err = SagaError::RetryExhausted {
            unit: "payment.ledger",
            attempts: 5,
            source: StoreError::ZeroEffect {
                statement: "apply_customer_payment",
            },
        };
        assert!(err.is_exhausted());
        assert_eq!(
            err.to_string(),
            "Unit 'payment.ledger' failed after 5 attempts: Statement 'apply_customer_payment' affected no rows"
        );
    }

    #[test]
    fn test_compensation_failed_keeps_cause() {
        let inner = SagaError::InvalidRequest("no lines".to_string());
        let err = SagaError::CompensationFailed {
            order: DistrictKey::new(1, 2).order(9),
            source: Box::new(inner),
        };
        assert!(!err.is_exhausted());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("Compensation for order 1/2#9 failed"));
    }
}
