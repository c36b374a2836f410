use thiserror::Error;

/// Errors raised by model construction and the loss path.
///
/// None of them are retried; they propagate straight to the caller
/// (typically the training loop).
#[derive(Error, Debug)]
pub enum VaeError {
    /// unknown reparameterizer/layer/likelihood type, invalid sizes, unknown task
    #[error("configuration error: {0}")]
    Configuration(String),

    /// a caller handed us tensors of the wrong shape
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// a latent parameter record of the wrong family
    #[error("latent parameters: expected {expected}, got {actual}")]
    ParamMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VaeError>;

impl VaeError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        VaeError::Configuration(msg.into())
    }

    pub fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        VaeError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
