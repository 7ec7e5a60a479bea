//! Error taxonomy shared by every component of the ceremony core.

use thiserror::Error;

/// All failure modes a node can surface while running the curve layer,
/// the DKG engine, the signer engine, nonce derivation, or the ceremony
/// orchestrator built on top of them.
#[derive(Debug, Error)]
pub enum MpcError {
    #[error("invalid point/scalar encoding")]
    InvalidEncoding,

    #[error("operation not valid in current phase: {0}")]
    WrongPhase(&'static str),

    #[error("duplicate commitment from {0}")]
    DuplicateCommitment(String),

    #[error("wrong commitment count: expected {expected}, got {got}")]
    WrongCommitmentCount { expected: usize, got: usize },

    #[error("share from unknown sender: {0}")]
    UnknownSender(String),

    #[error("missing shares from: {0:?}")]
    MissingShares(Vec<String>),

    #[error("share verification failed for sender {0}")]
    ShareVerificationFailed(String),

    #[error("signing session already exists: {0}")]
    SessionExists(String),

    #[error("participant missing from signing session: {0}")]
    ParticipantMissing(String),

    #[error("this node is not a member of the signer set")]
    SelfNotInSet,

    #[error("lagrange denominator is not invertible (index collision)")]
    NonInvertibleDenominator,

    #[error("missing partial signature from: {0}")]
    MissingPartial(String),

    #[error("below signing threshold: need {needed}, have {got}")]
    BelowThreshold { needed: usize, got: usize },

    #[error("participant set is not the locked set for this session")]
    NotInLockedSet,

    #[error("combined signature failed verification")]
    BadCombination,

    #[error("nonce derivation produced a zero scalar")]
    DerivationZero,

    #[error("nonce has already been used for a different request")]
    NonceReuse,

    #[error("nonce commitment already recorded for this request")]
    AlreadyCommitted,

    #[error("modular inverse does not exist")]
    NotInvertible,

    #[error("HSM refused the operation: {0}")]
    SecurityError(String),

    #[error("mailbox transport error: {0}")]
    MailboxError(String),

    #[error("HSM error: {0}")]
    HsmError(String),

    #[error("state store error: {0}")]
    StateError(String),

    #[error("signing request not yet approved")]
    NotApproved,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MpcError>;
