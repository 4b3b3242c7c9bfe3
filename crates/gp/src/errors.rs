use thiserror::Error;

/// A result type for covariance assembly and inference algorithms
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when building, fitting, sampling or querying a [`Model`](crate::Model)
#[derive(Error, Debug)]
pub enum GpError {
    /// When likelihood computation yields a non finite value
    #[error("LikelihoodComputation computation error: {0}")]
    LikelihoodComputationError(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When an array cannot be reshaped
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    /// When a parameter is unknown, missing, or out of its bounds
    #[error("Parameter error: {0}")]
    ParameterError(String),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
