use thiserror::Error;

/// A result type for the GPLVM training algorithm
pub type Result<T> = std::result::Result<T, GplvmError>;

/// An error when fitting or evaluating a [`Gplvm`](crate::Gplvm) model
#[derive(Error, Debug)]
pub enum GplvmError {
    /// When evidence lower bound computation fails
    #[error("Evidence computation error: {0}")]
    EvidenceComputationError(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
