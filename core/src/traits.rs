//! The three external collaborator interfaces the orchestrator depends on.
//! They are treated as non-core, specified only through these interfaces;
//! concrete implementations (PKCS#11, Git, JSON-plus-flock) live in the
//! `mpc-node` crate.

use crate::{error::Result, state::NodeState};

/// Demo mode relaxes HSM object attributes (SENSITIVE=false,
/// EXTRACTABLE=true) to permit testing of the external-share signing path;
/// production mode enforces SENSITIVE=true, EXTRACTABLE=false and refuses
/// any operation that would extract a secret, surfacing
/// `MpcError::SecurityError` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsmMode {
    Demo,
    Production,
}

impl HsmMode {
    pub fn is_production(self) -> bool {
        matches!(self, HsmMode::Production)
    }
}

/// A record of one nonce derivation, as stored under `NONCE_DERIV_<counter>`.
pub use crate::state::NonceDerivationRecord;

/// The HSM facade: identity RSA operations, sensitive object storage, and
/// the nonce-derivation subsystem. All "does this exist" questions return
/// `Ok(None)`/`Ok(false)` rather than using an error as a not-found signal.
pub trait Hsm {
    fn mode(&self) -> HsmMode;

    /// This node's identity RSA public key, PEM-encoded.
    fn identity_public_key_pem(&self) -> Result<String>;

    /// Decrypt a PKCS#1 v1.5 ciphertext under this node's identity key.
    fn decrypt_with_identity_key(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Encrypt `plaintext` (a 32-byte big-endian DKG share) under a peer's
    /// RSA public key using PKCS#1 v1.5 padding. Does not require a
    /// session on this node's identity key.
    fn encrypt_for_recipient(&self, recipient_pubkey_pem: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn has_dkg_share(&self, round_id: &str) -> Result<bool>;
    fn store_dkg_share(&self, round_id: &str, share_bytes: &[u8; 32]) -> Result<()>;
    /// Fails with `SecurityError` in production mode.
    fn get_dkg_share(&self, round_id: &str) -> Result<[u8; 32]>;

    /// Idempotent: creates `master_seed`/`counter = 0` if absent. Returns
    /// `true` if this call created them, `false` if they already existed.
    fn initialize_nonce_derivation(&self) -> Result<bool>;
    fn has_nonce_master_seed(&self) -> Result<bool>;

    /// Atomically increment the HSM-resident counter and compute
    /// `HMAC-SHA512(master_seed, input)` over
    /// `derivation_input(post_increment_counter, request_id, message_hash)`,
    /// without ever handing the master seed itself to the caller.
    /// Returns `(post_increment_counter, digest)`.
    fn compute_nonce_digest(
        &self,
        request_id: &str,
        message_hash: &[u8; 32],
    ) -> Result<(u64, [u8; 64])>;

    /// Recompute the HMAC digest for an *already-allocated* counter value,
    /// without incrementing the counter again. Used by `sign-finalize` to
    /// regenerate the exact nonce scalar `k` a prior `sign-approve`
    /// derived and discarded, as the node's own "disaster recovery"
    /// design intends (the counter, unlike `k`, is not secret and is
    /// durably recorded at approve time).
    fn replay_nonce_digest(
        &self,
        counter: u64,
        request_id: &str,
        message_hash: &[u8; 32],
    ) -> Result<[u8; 64]>;

    fn store_derivation_record(&self, record: &NonceDerivationRecord) -> Result<()>;
    /// Demo mode only; fails with `SecurityError` in production.
    fn list_derivation_records(&self) -> Result<Vec<NonceDerivationRecord>>;
    /// Whether a derivation audit record for `request_id` exists, without
    /// exposing its contents. Unlike `list_derivation_records`, this works
    /// in production mode too: a crash between writing the audit record and
    /// writing the `NONCE_<id>` commitment object must still be visible to
    /// the reuse guard.
    fn has_derivation_record_for(&self, request_id: &str) -> Result<bool>;

    fn has_nonce_commitment(&self, request_id: &str) -> Result<bool>;
    /// Fails with `SecurityError` if a commitment already exists for this
    /// `request_id` — a second layer of defense against replay alongside
    /// the orchestrator's own triple-layer guard.
    fn store_nonce_commitment(&self, request_id: &str, r_hex: &str) -> Result<()>;
    /// In production mode, returns a redacted placeholder rather than the
    /// real value.
    fn get_nonce_commitment(&self, request_id: &str) -> Result<Option<String>>;
    /// Every request_id with a recorded commitment, excluding the internal
    /// `NONCE_MASTER_SEED`/`NONCE_COUNTER`/`NONCE_DERIV_*` objects.
    fn list_used_nonces(&self) -> Result<Vec<String>>;
}

/// The asynchronous shared bulletin board: post, read, list, sync —
/// nothing else. Concurrent posters race; `post` surfaces
/// that as a retriable `MailboxError`, never as a silent overwrite.
pub trait Mailbox {
    fn sync(&self) -> Result<()>;
    fn post(&self, path: &str, data: &[u8]) -> Result<()>;
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;
    fn list(&self, dir: &str) -> Result<Vec<String>>;
}

/// Atomic, lock-protected persistence for `NodeState`. `load` takes a
/// shared lock; `update` takes an exclusive lock around a
/// read-modify-write.
pub trait StateStore {
    fn load(&self) -> Result<NodeState>;
    fn update(&self, f: &mut dyn FnMut(&mut NodeState) -> Result<()>) -> Result<()>;
}
