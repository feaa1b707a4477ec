use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login rejected for {username}: {reason}")]
    InvalidCredentials { username: String, reason: String },
    #[error("transient network failure during login: {0}")]
    TransientNetwork(String),
    #[error("interactive login required: {message}")]
    InteractionRequired {
        message: String,
        login_url: Option<String>,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("unexpected login response: {0}")]
    Protocol(String),
}

impl AuthError {
    /// Errors an operator has to fix before another cycle can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthError::InvalidCredentials { .. })
    }
}

impl Retryable for AuthError {
    fn is_transient(&self) -> bool {
        matches!(self, AuthError::TransientNetwork(_))
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;
