//! Error types for lock coordination

use thiserror::Error;

use crate::transport::PeerInfo;

/// Result type alias using the lock coordination Error
pub type Result<T> = std::result::Result<T, Error>;

/// Lock coordination error taxonomy
///
/// `Conflict` is an expected outcome (someone else holds the lock) and is
/// surfaced as a blocked state rather than a failure. `TokenInvalid` is
/// always fatal to the belief that the lock is held. `Network` and `Channel`
/// recover locally with retry/backoff; a single occurrence never abandons a
/// held lock.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Server unreachable or request timed out
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with something we could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Acquire or steal was refused because another holder exists
    #[error("Lock conflict: {reason}")]
    Conflict {
        reason: String,
        holder: Option<PeerInfo>,
    },

    /// Renew or release was rejected; the token no longer proves ownership
    #[error("Lock token rejected: {0}")]
    TokenInvalid(String),

    /// The push subscription failed or was dropped
    #[error("Push channel error: {0}")]
    Channel(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity could not be derived or persisted
    #[error("Identity error: {0}")]
    Identity(String),

    /// Operation is not valid in the current coordinator state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Get the stable error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "E100",
            Self::Protocol(_) => "E101",
            Self::Conflict { .. } => "E110",
            Self::TokenInvalid(_) => "E111",
            Self::Channel(_) => "E120",
            Self::Config(_) => "E130",
            Self::Identity(_) => "E131",
            Self::InvalidState(_) => "E140",
        }
    }

    /// Whether a retry may recover without giving up local assumptions
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Channel(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}
