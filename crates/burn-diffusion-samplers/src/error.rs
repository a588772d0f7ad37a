//! Error types for sampling runs

use std::fmt;

use thiserror::Error;

/// Boxed error produced by an external collaborator
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a collaborator (network, fixed encoder, control model)
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Network evaluation was cancelled")]
    Cancelled,

    #[error("Failed to load network: {0}")]
    Load(String),

    #[error("Network evaluation failed: {0}")]
    Evaluation(String),

    #[error("Fixed encoder failed: {0}")]
    Encoder(String),

    #[error("Control model failed: {0}")]
    Control(String),

    #[error("Tensor readback failed: {0}")]
    Readback(String),

    #[error(transparent)]
    Other(#[from] BoxError),
}

/// Failure of a whole `sample()` call
///
/// Runs are all-or-nothing. The only thing salvaged from a failed run is the
/// list of compiled networks on cancellation, so a caller can reuse them.
#[derive(Error)]
pub enum SamplerError<N> {
    #[error("Sampling was cancelled")]
    Cancelled { networks: Vec<N> },

    #[error("Latent contains NaN values")]
    NaN,

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl<N> SamplerError<N> {
    /// True for the user-initiated cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SamplerError::Cancelled { .. })
    }

    /// Networks carried by a cancellation, empty for every other error
    pub fn into_networks(self) -> Vec<N> {
        match self {
            SamplerError::Cancelled { networks } => networks,
            _ => Vec::new(),
        }
    }
}

impl<N> fmt::Debug for SamplerError<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerError::Cancelled { networks } => f
                .debug_struct("Cancelled")
                .field("networks", &networks.len())
                .finish(),
            SamplerError::NaN => f.write_str("NaN"),
            SamplerError::Network(err) => f.debug_tuple("Network").field(err).finish(),
            SamplerError::InvalidRequest(msg) => {
                f.debug_tuple("InvalidRequest").field(msg).finish()
            }
        }
    }
}
