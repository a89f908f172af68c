use thiserror::Error;

use crate::payments::PaymentError;
use crate::sqlite_store::StoreError;

#[derive(Debug, Error)]
pub enum LexamError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error("insufficient funds: balance={balance}")]
    InsufficientFunds { balance: i64 },
    #[error("no published content for {exam_type}")]
    ContentUnavailable { exam_type: String },
    #[error("{what} not found")]
    NotFound { what: &'static str },
    #[error("exam already submitted")]
    AlreadySubmitted,
    #[error("transaction already refunded")]
    AlreadyRefunded,
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("rate limit exceeded: {limit}")]
    RateLimited { limit: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("payment processor error: {message}")]
    ExternalService { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LexamError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds { balance } => Self::InsufficientFunds { balance },
            StoreError::ContentUnavailable { exam_type } => Self::ContentUnavailable { exam_type },
            StoreError::AccountDisabled => Self::Forbidden {
                reason: "account disabled".to_string(),
            },
            StoreError::EntryNotFound => Self::NotFound {
                what: "ledger entry",
            },
            StoreError::NotRefundable { reason } => Self::InvalidState {
                reason: reason.to_string(),
            },
            StoreError::AlreadyRefunded => Self::AlreadyRefunded,
            other => Self::Store(other),
        }
    }
}

impl From<PaymentError> for LexamError {
    fn from(err: PaymentError) -> Self {
        Self::ExternalService {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LexamError>;
