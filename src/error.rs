//! Error taxonomy for the ride coordinator and its components.

use crate::types::RideStatus;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("identifier {0:?} is not a valid user identity")]
    MalformedIdentity(String),
    #[error("address {0:?} is not a valid ride address")]
    MalformedAddress(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    Invalid(String),
}

#[derive(thiserror::Error, Debug)]
pub enum FareError {
    #[error("invalid fare input: {0}")]
    InvalidInput(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VaultError {
    #[error("sealed record does not parse as iv:ciphertext hex")]
    Malformed,
    #[error("sealed record failed authentication")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("unsealed material does not decode to a signing key")]
    InvalidKeyFormat,
}

/// Failures surfaced by the ledger gateway. `Timeout` and `TransportError`
/// are transient and retried inside the gateway; everything else is a final
/// answer from the ledger and propagates immediately.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger rejected the instruction signature")]
    SignatureRejected,
    #[error("a ledger account already exists at the derived address")]
    AccountAlreadyExists,
    #[error("no ledger account exists at the given address")]
    AccountNotFound,
    #[error("the ledger account is not in a valid state for this operation")]
    InvalidStateForOperation,
    #[error("ledger confirmation timed out")]
    Timeout,
    #[error("ledger transport failure: {0}")]
    TransportError(String),
}

impl LedgerError {
    /// Transient failures are worth retrying; logic-level rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Timeout | LedgerError::TransportError(_))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("index store failure: {0}")]
    Store(#[from] sled::Error),
    #[error("index codec failure: {0}")]
    Codec(String),
}

/// The stable error kinds the service surface exposes to callers.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("ride is {status:?}; {operation} is not permitted")]
    Conflict {
        operation: &'static str,
        status: RideStatus,
    },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("codec failure: {0}")]
    Codec(String),
}

impl From<FareError> for ServiceError {
    fn from(err: FareError) -> Self {
        ServiceError::Validation(ValidationError::Invalid(err.to_string()))
    }
}
