use std::time::Duration;

use thiserror::Error;

use crate::{backend::BackendError, mechanism::MechanismType};

pub type SsmResult<T> = Result<T, SsmError>;

#[derive(Debug, Error)]
pub enum SsmError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("mechanism unsupported: {0}")]
    MechanismUnsupported(String),
    #[error("invalid initialization vector: {0}")]
    IvInvalid(String),
    #[error("authentication failed: ciphertext, tag or associated data rejected")]
    AuthenticationFailed,
    #[error("no session available within {0:?}")]
    PoolExhausted(Duration),
    #[error("session pool is shut down")]
    PoolClosed,
    #[error("update of {label}/{id} partially applied, key deleted but not recreated: {source}")]
    PartiallyApplied {
        label: String,
        id: u32,
        #[source]
        source: Box<SsmError>,
    },
    #[error("{operation} failed{}: {source}", mechanism_suffix(.mechanism))]
    Backend {
        operation: &'static str,
        mechanism: Option<MechanismType>,
        #[source]
        source: BackendError,
    },
    #[error("token expired")]
    JwtExpired,
    #[error("token not yet valid")]
    JwtNotYetValid,
    #[error("invalid token: {0}")]
    JwtInvalid(String),
    #[error("audit failure: {0}")]
    Audit(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

fn mechanism_suffix(mechanism: &Option<MechanismType>) -> String {
    mechanism
        .map(|mechanism| format!(" with {mechanism}"))
        .unwrap_or_default()
}

impl SsmError {
    pub fn backend(operation: &'static str, source: BackendError) -> Self {
        Self::Backend {
            operation,
            mechanism: None,
            source,
        }
    }

    pub fn backend_with(
        operation: &'static str,
        mechanism: MechanismType,
        source: BackendError,
    ) -> Self {
        Self::Backend {
            operation,
            mechanism: Some(mechanism),
            source,
        }
    }

    pub fn audit<E: std::fmt::Display>(err: E) -> Self {
        Self::Audit(err.to_string())
    }
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidRequest(err.to_string())
    }
    pub fn unexpected<E: std::fmt::Display>(err: E) -> Self {
        Self::Unexpected(err.to_string())
    }

    /// Distinguished absence, the outcome callers branch on to "create if missing".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
