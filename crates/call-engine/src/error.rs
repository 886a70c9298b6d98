//! Error types for the call engine

use std::net::SocketAddr;

use thiserror::Error;

use crate::state::CallState;

/// Result type for call engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the call engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A component could not bind its socket; fatal to startup
    #[error("{component} failed to bind {addr}: {source}")]
    Bind {
        component: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Command issued in a state that does not accept it
    #[error("Invalid state: {message} (current state: {state})")]
    InvalidState { state: CallState, message: String },

    /// Dial target not present in the peer directory
    #[error("Unknown peer: {address}")]
    UnknownPeer { address: String },

    /// Audio device collaborator failure
    #[error("Audio device error: {message}")]
    Audio { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Engine has been shut down
    #[error("Engine is shut down")]
    Shutdown,
}

impl EngineError {
    /// Create an invalid state error
    pub fn invalid_state(state: CallState, message: impl Into<String>) -> Self {
        Self::InvalidState {
            state,
            message: message.into(),
        }
    }

    /// Create an audio device error
    pub fn audio(message: impl Into<String>) -> Self {
        Self::Audio {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error came from a failed bind
    pub fn is_bind_failure(&self) -> bool {
        matches!(self, EngineError::Bind { .. })
    }
}
