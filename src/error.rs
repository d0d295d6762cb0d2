//! Error type shared by every fallible operation of the sampler.
//!
//! Expected outcomes such as a prerun that did not converge or a density that
//! rejects a point are not errors; they are reported through return values
//! ([`crate::sampler::PreRunInfo`], [`crate::distributions::Density::log_density`]).

use thiserror::Error;

/// A numeric configuration value outside of its allowed interval.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field} = {value} is outside of the allowed range [{min}, {max}]")]
pub struct RangeError {
    pub field: &'static str,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl RangeError {
    /// Fails with a [`RangeError`] unless `min <= value <= max`.
    pub fn check(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), RangeError> {
        if value.is_nan() || value < min || value > max {
            return Err(RangeError {
                field,
                value,
                min,
                max,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Range(#[from] RangeError),

    #[error("persistence was requested, but no output file is configured")]
    MissingOutput,

    #[error("dimension mismatch: expected {expected}, found {found}")]
    Dimension { expected: usize, found: usize },

    #[error("value {value} of parameter '{name}' is outside of [{min}, {max}]")]
    OutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("cannot adapt proposal: {0}")]
    Adaptation(String),

    #[error("covariance matrix is not positive definite, even when restricted to its diagonal")]
    NotPositiveDefinite,

    #[error("cannot compute R-value: {0}")]
    RValue(String),

    #[error("optimization failed: {0}")]
    Optimization(String),

    #[error("store: {0}")]
    Store(String),

    #[error("cannot resume: {0}")]
    Resume(String),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[cfg(feature = "parquet")]
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_accepts_bounds() {
        assert!(RangeError::check("x", 0.0, 0.0, 1.0).is_ok());
        assert!(RangeError::check("x", 1.0, 0.0, 1.0).is_ok());
    }

    #[test]
    fn range_check_rejects_nan_and_outside() {
        let err = RangeError::check("min_efficiency", -0.1, 0.0, 1.0).unwrap_err();
        assert_eq!(err.field, "min_efficiency");
        assert!(RangeError::check("x", f64::NAN, 0.0, 1.0).is_err());
        assert!(RangeError::check("x", 23.1, 0.0, 1.0).is_err());
    }

    #[test]
    fn range_error_message_names_field() {
        let err: Error = RangeError::check("chunks", 0.0, 1.0, f64::MAX)
            .unwrap_err()
            .into();
        assert!(err.to_string().contains("chunks"));
    }
}
