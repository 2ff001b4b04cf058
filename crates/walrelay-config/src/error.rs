use thiserror::Error;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("idle_time_ms must be between {min} and {max}, got {value}")]
    InvalidIdleTime { value: u64, min: u64, max: u64 },

    #[error("status_interval_ms must be at most {max}, got {value}")]
    InvalidStatusInterval { value: u64, max: u64 },

    #[error("invalid slot name '{0}': use only lower case letters, numbers and underscores (max 63)")]
    InvalidSlotName(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
