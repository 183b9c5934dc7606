//! Error types for the ledger and its backends.
use std::time::Duration;

use thiserror::Error;

use crate::bank::AccountType;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors surfaced to callers of the ledger. Every variant renders as a message fit for display.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Please enter a valid amount greater than 0")]
    InvalidAmount,
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("The amount exceeds the largest supported balance")]
    AmountTooLarge,
    #[error("Please select a valid account type")]
    InvalidAccountType,
    #[error("You already have a {0} account")]
    DuplicateAccountType(AccountType),
    #[error("Account not found")]
    AccountNotFound,
    #[error("Unable to process the request.{}", unavailable_hint(.primary_reachable))]
    OperationUnavailable { primary_reachable: bool },
}

fn unavailable_hint(primary_reachable: &bool) -> &'static str {
    if *primary_reachable {
        ""
    } else {
        " The remote database is not connected; check the MONGODB_URI setting."
    }
}

/// Failures of a single store call. These never leave the ledger; they select the fallback path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("filesystem is not writable, write skipped")]
    ReadOnly,
    #[error("malformed record data: {0}")]
    Malformed(String),
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("backend failure: {0}")]
    Failure(String),
}

impl BackendError {
    /// Whether the error means the backend itself cannot be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Unreachable(_) | BackendError::Timeout(_))
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Failure(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Malformed(err.to_string())
    }
}
