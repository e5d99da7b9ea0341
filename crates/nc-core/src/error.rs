//! Error types for the Neyman-construction crates.

use thiserror::Error;

/// Error type shared by all crates in the workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration, model definition, or argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The model could not be evaluated at the requested point
    /// (out-of-range parameter, zero density, malformed dataset).
    #[error("Model evaluation error: {0}")]
    ModelEvaluation(String),

    /// A fit exhausted its iteration or time budget, or the line search broke down.
    #[error("Optimizer did not converge: {0}")]
    NonConvergence(String),

    /// Numerical failure that is not tied to a single toy.
    #[error("Computation error: {0}")]
    Computation(String),

    /// The run was cancelled from outside.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Per-toy failures that are counted and skipped instead of aborting a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ModelEvaluation(_) | Error::NonConvergence(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::ModelEvaluation("x".into()).is_recoverable());
        assert!(Error::NonConvergence("x".into()).is_recoverable());
        assert!(!Error::Validation("x".into()).is_recoverable());
        assert!(!Error::Cancelled("x".into()).is_recoverable());
    }

    #[test]
    fn test_display() {
        let e = Error::ModelEvaluation("s = -1 outside [0, 100]".into());
        assert_eq!(e.to_string(), "Model evaluation error: s = -1 outside [0, 100]");
    }
}
