//! Persisted data model: the plain, serde-friendly snapshots that the
//! orchestrator hands to a `StateStore` implementation. All curve material
//! here is hex-encoded text rather than `Scalar`/`Point` — the wire format
//! of this document is a node-crate concern, the shapes themselves are not.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DkgPhase {
    None,
    Committed,
    Distributed,
    Finalized,
}

impl DkgPhase {
    /// `true` if `self -> next` is a legal forward transition.
    pub fn can_advance_to(self, next: DkgPhase) -> bool {
        use DkgPhase::*;
        matches!(
            (self, next),
            (None, Committed) | (Committed, Distributed) | (Distributed, Finalized)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgSessionState {
    pub round_id: String,
    pub phase: DkgPhase,
    pub threshold: usize,
    /// node_id -> index, bijective, all indices distinct and nonzero.
    pub participants: BTreeMap<String, u32>,
    /// Own polynomial coefficients, hex-encoded. Cleared (set to `vec![]`)
    /// once `finalized` is reached; never written to disk again afterwards.
    pub own_coefficients_hex: Vec<String>,
    pub own_commitments_hex: Vec<String>,
    /// node_id -> that node's t commitments, hex-encoded.
    pub received_commitments_hex: BTreeMap<String, Vec<String>>,
    /// node_id -> verified share received from that node, hex-encoded.
    pub received_shares_hex: BTreeMap<String, String>,
    pub group_public_key_hex: Option<String>,
}

impl DkgSessionState {
    pub fn new(round_id: String, threshold: usize, participants: BTreeMap<String, u32>) -> Self {
        DkgSessionState {
            round_id,
            phase: DkgPhase::None,
            threshold,
            participants,
            own_coefficients_hex: Vec::new(),
            own_commitments_hex: Vec::new(),
            received_commitments_hex: BTreeMap::new(),
            received_shares_hex: BTreeMap::new(),
            group_public_key_hex: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningSessionState {
    pub request_id: String,
    pub message_hash_hex: String,
    /// The HSM counter value this node's own nonce was derived at. Public
    /// (the counter is not secret); lets `sign-finalize` ask the HSM to
    /// replay the same HMAC digest without allocating a new counter value,
    /// since the nonce scalar `k` itself is never persisted.
    pub derivation_counter: Option<u64>,
    /// node_id -> R_hex. Never contains the nonce scalar `k` itself.
    pub r_commitments_hex: BTreeMap<String, String>,
    pub partials_hex: BTreeMap<String, String>,
    pub locked_participants: Option<Vec<String>>,
}

impl SigningSessionState {
    pub fn new(request_id: String, message_hash_hex: String) -> Self {
        SigningSessionState {
            request_id,
            message_hash_hex,
            derivation_counter: None,
            r_commitments_hex: BTreeMap::new(),
            partials_hex: BTreeMap::new(),
            locked_participants: None,
        }
    }
}

/// The persistent witness of nonce use: the local half of the triple-layer
/// guard. `request_id -> R_hex`.
pub type NonceUseRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceDerivationRecord {
    pub counter: u64,
    pub request_id: String,
    pub r_hex: String,
    pub message_hash_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub index: u32,
    pub dkg: Option<DkgSessionState>,
    pub signing_sessions: BTreeMap<String, SigningSessionState>,
    pub used_nonces: NonceUseRecord,
}

impl NodeState {
    pub fn new(node_id: String, index: u32) -> Self {
        NodeState {
            node_id,
            index,
            dkg: None,
            signing_sessions: BTreeMap::new(),
            used_nonces: BTreeMap::new(),
        }
    }
}

/// Derive a participant's index from its `node_id` by stripping `prefix`
/// and parsing the remainder as a positive integer.
pub fn index_from_node_id(node_id: &str, prefix: &str) -> Option<u32> {
    let rest = node_id.strip_prefix(prefix)?;
    let idx: u32 = rest.parse().ok()?;
    if idx == 0 {
        None
    } else {
        Some(idx)
    }
}
