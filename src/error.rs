use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("No input data set")]
    NoInputData,

    #[error("No frames found")]
    NoFrames,

    #[error("No positions found")]
    NoPositions,

    #[error("Mismatch between number of images ({images}) and frame timestamps ({timestamps})")]
    FrameCountMismatch { images: usize, timestamps: usize },

    #[error("Timestamps of {0} are not strictly increasing")]
    UnorderedTimestamps(&'static str),

    #[error("No usable positions found")]
    NoUsablePositions,

    #[error("Too few usable frames to build a volume: {found}")]
    TooFewFrames { found: usize },

    #[error("Unknown reconstruction algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid option {name}: {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("Invalid probe geometry: {0}")]
    InvalidProbe(String),

    #[error("Invalid transform: {0}")]
    InvalidTransform(String),

    #[error("A reconstruction is already running")]
    Busy,

    #[error("Reconstruction worker failed: {0}")]
    WorkerFailed(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl ReconstructError {
    pub(crate) fn invalid_option(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Message reported to the caller of a prepare or reconstruct run.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    /// Forward the message to the `log` facade at the matching level.
    pub(crate) fn log(&self) {
        match self.severity {
            Severity::Info => log::info!("{}", self.message),
            Severity::Warning => log::warn!("{}", self.message),
            Severity::Error => log::error!("{}", self.message),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{level}: {}", self.message)
    }
}
