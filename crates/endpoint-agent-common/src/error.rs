//! Error taxonomy for the endpoint agent.

use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type. Variants map onto the five error kinds the agent
/// distinguishes: input validation, transient external failures, on-disk
/// integrity violations, fatal startup conditions, and everything else.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: a config field, a primitive parameter, a signal
    /// payload that failed validation before it reached the pipeline.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// A transport or primitive call failed in a way that may succeed on
    /// retry (network blip, primitive timeout).
    #[error("transient external failure: {0}")]
    TransientExt(String),

    /// On-disk state failed a tamper or consistency check (runbook hash
    /// mismatch, corrupt ticket file).
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Startup cannot proceed (data directory unwritable, config unreadable).
    #[error("fatal init error: {0}")]
    FatalInit(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{0}")]
    Generic(#[from] anyhow::Error),
}

impl Error {
    /// Whether retrying the operation that produced this error is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientExt(_))
    }

    /// Coarse category, used as a log/metrics label.
    pub fn category(&self) -> &'static str {
        match self {
            Error::InputInvalid(_) => "input_invalid",
            Error::TransientExt(_) => "transient_ext",
            Error::Integrity(_) => "integrity",
            Error::FatalInit(_) => "fatal_init",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Generic(_) => "generic",
        }
    }
}
