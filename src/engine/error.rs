use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::store::StoreError;
use crate::token::TokenError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("overlaps reservation or block {0}")]
    Overlap(Ulid),
    #[error("weekly quota of {limit} reached for week of {week_start}")]
    QuotaExceeded { limit: u32, week_start: NaiveDate },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad integrity token")]
    BadIntegrityToken,
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Message safe to show the caller. Storage details stay in the server log.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Overlap(_) => {
                "Your reservation overlaps with an existing reservation or blocked time.".into()
            }
            EngineError::QuotaExceeded { limit, week_start } => format!(
                "You have reached the limit of {limit} reservations for the week of {week_start}."
            ),
            EngineError::Forbidden(msg) => msg.clone(),
            EngineError::BadIntegrityToken => "Invalid reservation token.".into(),
            EngineError::StorageFailure(_) => "unexpected error occurred".into(),
            EngineError::Validation(msg) => msg.clone(),
            EngineError::NotFound(_) => "Reservation not found.".into(),
            EngineError::LimitExceeded(what) => format!("Limit exceeded: {what}."),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) | StoreError::Inactive(id) => EngineError::NotFound(id),
            StoreError::Wal(msg) => EngineError::StorageFailure(msg),
        }
    }
}

impl From<TokenError> for EngineError {
    fn from(_: TokenError) -> Self {
        EngineError::BadIntegrityToken
    }
}
