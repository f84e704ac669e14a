use thiserror::Error;

/// Result type for admission control operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Errors that can occur in the admission control layer
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Malformed counter key: {0}")]
    MalformedCounterKey(String),

    #[error("Counter store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
