//! Strongly-typed schemas for every mailbox path the core reads or writes.
//!
//! Deserialization rejects anything not matching exactly (no untyped JSON
//! travels past the mailbox boundary).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityMessage {
    pub node_id: String,
    pub pubkey_pem: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgCommitment {
    pub node_id: String,
    pub round_id: String,
    pub threshold: usize,
    pub total_nodes: usize,
    pub commitments: Vec<String>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningRequest {
    pub request_id: String,
    pub message_hash: String,
    pub message_preview: String,
    pub requester: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceCommitment {
    pub node_id: String,
    pub request_id: String,
    pub r_commitment: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLock {
    pub participants: Vec<String>,
    pub locked_by: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSignature {
    pub node_id: String,
    pub request_id: String,
    pub partial_s: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSignatureMessage {
    pub request_id: String,
    pub r: String,
    pub s: String,
    pub participants: Vec<String>,
    pub timestamp: f64,
}

pub fn identity_path(node_id: &str) -> String {
    format!("identity/{node_id}.json")
}

pub fn dkg_commitment_path(round_id: &str, node_id: &str) -> String {
    format!("dkg/{round_id}/commitments/{node_id}.json")
}

pub fn dkg_share_path(round_id: &str, from: &str, to: &str) -> String {
    format!("dkg/{round_id}/shares/{from}_to_{to}.enc")
}

pub fn signing_request_path(request_id: &str) -> String {
    format!("signing/{request_id}/request.json")
}

pub fn signing_commitment_path(request_id: &str, node_id: &str) -> String {
    format!("signing/{request_id}/commitments/{node_id}.json")
}

pub fn signing_session_path(request_id: &str) -> String {
    format!("signing/{request_id}/session.json")
}

pub fn signing_partial_path(request_id: &str, node_id: &str) -> String {
    format!("signing/{request_id}/partials/{node_id}.json")
}

pub fn signing_result_path(request_id: &str) -> String {
    format!("signing/{request_id}/result.json")
}
