use linattn_config::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

/// Everything that can reject a kernel call. All checks run before any tensor work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("precision error: {0}")]
    Precision(String),
    #[error("shape error: {0}")]
    Shape(String),
}

impl KernelError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn precision(msg: impl Into<String>) -> Self {
        Self::Precision(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}

impl From<ConfigError> for KernelError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
