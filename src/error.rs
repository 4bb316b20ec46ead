//! Typed domain errors. Every variant maps to exactly one HTTP status so the
//! (out-of-scope) HTTP layer can render a response without re-deriving intent.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("no API key provided")]
    NoApiKey,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("caller does not own this resource")]
    NotOwner,
    #[error("API key not found")]
    KeyNotFound,

    #[error("insufficient available balance")]
    InsufficientBalance,
    #[error("insufficient headroom under session-key budget")]
    InsufficientHeadroom,
    #[error("a hold or escrow lock is already open for this reference")]
    ConflictingHold,

    #[error("session-key policy forbids this transaction")]
    PolicyViolation,
    #[error("risk engine blocked this transaction")]
    RiskBlocked,

    #[error("resource not found")]
    NotFound,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("slug already taken")]
    SlugTaken,
    #[error("maximum number of agents reached")]
    MaxAgents,

    #[error("payment verification failed")]
    PaymentVerificationFailed,
    #[error("payment amount is insufficient")]
    PaymentInsufficient,
    #[error("payment proof is invalid")]
    InvalidPaymentProof,

    #[error("daily spend limit exceeded")]
    DailyLimitExceeded,
    #[error("gas price too high")]
    GasPriceTooHigh,

    #[error("request blocked by SSRF guard")]
    SsrfBlocked,
    #[error("transaction hash is malformed")]
    TxHashInvalid,

    #[error("dependency unavailable")]
    Unavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

/// HTTP status class a caller should render this error as. Named, not
/// numeric, since the concrete router binding is out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    Unauthorized,
    Forbidden,
    BadRequest,
    Conflict,
    NotFound,
    PaymentRequired,
    ServiceUnavailable,
    InternalServerError,
}

impl CoreError {
    pub fn status_hint(&self) -> StatusHint {
        use CoreError::*;
        use StatusHint::*;
        match self {
            NoApiKey | InvalidApiKey => Unauthorized,
            NotOwner | PolicyViolation | RiskBlocked | MaxAgents | SsrfBlocked => Forbidden,
            KeyNotFound | NotFound => NotFound,
            InsufficientBalance | InsufficientHeadroom | DailyLimitExceeded | GasPriceTooHigh
            | TxHashInvalid | InvalidPaymentProof => BadRequest,
            ConflictingHold | AlreadyExists | SlugTaken => Conflict,
            PaymentVerificationFailed | PaymentInsufficient => PaymentRequired,
            Unavailable => ServiceUnavailable,
            Internal(_) => InternalServerError,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_collapse_to_unauthorized_or_forbidden() {
        assert_eq!(CoreError::NoApiKey.status_hint(), StatusHint::Unauthorized);
        assert_eq!(CoreError::InvalidApiKey.status_hint(), StatusHint::Unauthorized);
        assert_eq!(CoreError::NotOwner.status_hint(), StatusHint::Forbidden);
    }

    #[test]
    fn payment_errors_map_to_402() {
        assert_eq!(
            CoreError::PaymentVerificationFailed.status_hint(),
            StatusHint::PaymentRequired
        );
        assert_eq!(CoreError::PaymentInsufficient.status_hint(), StatusHint::PaymentRequired);
    }
}
