//! Threshold Schnorr signing: nonce-commitment intake, challenge
//! derivation, Lagrange-weighted partial signatures, and combination.
//!
//! Design decision (deliberately preserved, not "fixed"): the challenge
//! hashes the ASCII hex encodings of `R` and `P`, not their raw bytes.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{
    curve::{self, Point, Scalar},
    error::{MpcError, Result},
};

/// `e = SHA256(R_hex || P_hex || message_hash) mod n`.
pub fn challenge(r: &Point, p: &Point, message_hash: &[u8; 32]) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(curve::serialize_point(r).as_bytes());
    hasher.update(curve::serialize_point(p).as_bytes());
    hasher.update(message_hash);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    curve::scalar_mod(&bytes)
}

/// `λ_i = Π_{j∈S, j≠i} (−j)(i−j)⁻¹ mod n`.
pub fn lagrange_coeff(i: u32, all_indices: &BTreeSet<u32>) -> Result<Scalar> {
    let mut result = Scalar::from_u64(1);
    let i_scalar = Scalar::from_u64(i as u64);
    for &j in all_indices {
        if j == i {
            continue
        }
        let j_scalar = Scalar::from_u64(j as u64);
        let neg_j = Scalar::zero() - j_scalar.clone();
        let diff = i_scalar.clone() - j_scalar;
        let inv = curve::mod_inverse(&diff).map_err(|_| MpcError::NonInvertibleDenominator)?;
        result = result * (neg_j * inv);
    }
    Ok(result)
}

struct PendingSession {
    message_hash: [u8; 32],
    k: Scalar,
    own_r: Point,
    nonce_commitments: BTreeMap<String, Point>,
}

/// Drives one node's side of possibly many concurrent signing sessions
/// against a single DKG result (own share `x_i`, group key `P`).
pub struct ThresholdSigner {
    own_node_id: String,
    x_i: Scalar,
    group_public_key: Point,
    sessions: BTreeMap<String, PendingSession>,
}

impl ThresholdSigner {
    pub fn new(own_node_id: String, x_i: Scalar, group_public_key: Point) -> Self {
        ThresholdSigner { own_node_id, x_i, group_public_key, sessions: BTreeMap::new() }
    }

    pub fn group_public_key(&self) -> Point {
        self.group_public_key
    }

    /// Record `k` and this node's own `R = k.G`. Returns `R`'s compressed
    /// hex so the caller can post it to the board.
    pub fn begin_session(
        &mut self,
        request_id: &str,
        message_hash: [u8; 32],
        k: Scalar,
    ) -> Result<String> {
        if self.sessions.contains_key(request_id) {
            return Err(MpcError::SessionExists(request_id.to_string()))
        }
        let own_r = Point::from_scalar(&k);
        let r_hex = curve::serialize_point(&own_r);
        self.sessions.insert(
            request_id.to_string(),
            PendingSession { message_hash, k, own_r, nonce_commitments: BTreeMap::new() },
        );
        Ok(r_hex)
    }

    pub fn receive_nonce_commitment(
        &mut self,
        request_id: &str,
        from_node: &str,
        r_hex: &str,
    ) -> Result<()> {
        let point = curve::deserialize_point(r_hex)?;
        let session = self
            .sessions
            .get_mut(request_id)
            .ok_or(MpcError::WrongPhase("no signer session for this request_id"))?;
        session.nonce_commitments.insert(from_node.to_string(), point);
        Ok(())
    }

    /// `s_i = (k + e . λ_i . x_i) mod n`. Zeroes `k` before returning,
    /// success or failure.
    pub fn compute_partial(
        &mut self,
        request_id: &str,
        participants: &BTreeMap<String, u32>,
    ) -> Result<Scalar> {
        let own_index = *participants.get(&self.own_node_id).ok_or(MpcError::SelfNotInSet)?;

        let session = self
            .sessions
            .get_mut(request_id)
            .ok_or(MpcError::WrongPhase("no signer session for this request_id"))?;

        let mut r_agg = Point::identity();
        for node_id in participants.keys() {
            let r_j = if node_id == &self.own_node_id {
                session.own_r
            } else {
                *session
                    .nonce_commitments
                    .get(node_id)
                    .ok_or_else(|| MpcError::ParticipantMissing(node_id.clone()))?
            };
            r_agg = curve::point_add(&r_agg, &r_j);
        }

        let e = challenge(&r_agg, &self.group_public_key, &session.message_hash);
        let all_indices: BTreeSet<u32> = participants.values().copied().collect();
        let lambda_i = match lagrange_coeff(own_index, &all_indices) {
            Ok(l) => l,
            Err(e) => {
                session.k.zeroize();
                return Err(e)
            },
        };

        let s_i = session.k.clone() + e * lambda_i * self.x_i.clone();
        session.k.zeroize();
        Ok(s_i)
    }
}

/// `R = Σ R_j`, `s = Σ s_j mod n` for `j ∈ participants`.
pub fn combine(
    partials: &BTreeMap<String, Scalar>,
    r_commitments: &BTreeMap<String, Point>,
    participants: &[String],
) -> Result<(String, String)> {
    let mut r_agg = Point::identity();
    let mut s_agg = Scalar::zero();
    for node_id in participants {
        let r_j =
            r_commitments.get(node_id).ok_or_else(|| MpcError::ParticipantMissing(node_id.clone()))?;
        let s_j =
            partials.get(node_id).ok_or_else(|| MpcError::MissingPartial(node_id.clone()))?;
        r_agg = curve::point_add(&r_agg, r_j);
        s_agg = s_agg + s_j.clone();
    }
    Ok((curve::serialize_point(&r_agg), s_agg.to_hex()))
}

/// `s.G == R + e.P`.
pub fn verify(r_hex: &str, s_hex: &str, group_public_key: &Point, message_hash: &[u8; 32]) -> bool {
    let (r, s) = match (curve::deserialize_point(r_hex), Scalar::from_hex(s_hex)) {
        (Ok(r), Ok(s)) => (r, s),
        _ => return false,
    };
    let e = challenge(&r, group_public_key, message_hash);
    let lhs = Point::from_scalar(&s);
    let rhs = curve::point_add(&r, &curve::point_mul(&e, group_public_key));
    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lagrange_coeff_single_party_is_one() {
        let all = BTreeSet::from([1u32]);
        assert_eq!(lagrange_coeff(1, &all).unwrap(), Scalar::from_u64(1));
    }

    #[test]
    fn lagrange_coeff_skips_self_term_without_dividing_by_zero() {
        // `j == i` is skipped by the product, so a participant set that
        // happens to contain the caller's own index never drives the
        // `(i-j)` denominator to zero through that term.
        let all = BTreeSet::from([1u32, 2u32, 3u32]);
        assert!(lagrange_coeff(1, &all).is_ok());
    }

    #[test]
    fn zero_denominator_is_rejected_by_mod_inverse() {
        // `lagrange_coeff`'s `NonInvertibleDenominator` error is a thin
        // `map_err` over `curve::mod_inverse`; with `u32` participant
        // indices the `(i-j)` difference can never reduce to zero mod `n`
        // for distinct `i != j` (`n` is ~2^256, vastly larger than `u32`),
        // so the only way to exercise the rejection is at the inverse
        // itself, which is what a genuine index collision would produce.
        assert!(curve::mod_inverse(&Scalar::zero()).is_err());
    }

    #[test]
    fn sign_and_verify_two_of_two() {
        let x1 = curve::scalar_random();
        let x2 = curve::scalar_random();
        let group_public_key = Point::from_scalar(&x1) + Point::from_scalar(&x2);

        let participants: BTreeMap<String, u32> =
            BTreeMap::from([("n1".to_string(), 1), ("n2".to_string(), 2)]);

        let mut signer1 = ThresholdSigner::new("n1".to_string(), x1.clone(), group_public_key);
        let mut signer2 = ThresholdSigner::new("n2".to_string(), x2.clone(), group_public_key);

        let message_hash = [7u8; 32];
        let request_id = "r1";

        let k1 = curve::scalar_random();
        let k2 = curve::scalar_random();
        let r1_hex = signer1.begin_session(request_id, message_hash, k1).unwrap();
        let r2_hex = signer2.begin_session(request_id, message_hash, k2).unwrap();

        signer1.receive_nonce_commitment(request_id, "n2", &r2_hex).unwrap();
        signer2.receive_nonce_commitment(request_id, "n1", &r1_hex).unwrap();

        let s1 = signer1.compute_partial(request_id, &participants).unwrap();
        let s2 = signer2.compute_partial(request_id, &participants).unwrap();

        let mut r_commitments = BTreeMap::new();
        r_commitments.insert("n1".to_string(), curve::deserialize_point(&r1_hex).unwrap());
        r_commitments.insert("n2".to_string(), curve::deserialize_point(&r2_hex).unwrap());

        let mut partials = BTreeMap::new();
        partials.insert("n1".to_string(), s1);
        partials.insert("n2".to_string(), s2);

        let (r_hex, s_hex) =
            combine(&partials, &r_commitments, &["n1".to_string(), "n2".to_string()]).unwrap();

        assert!(verify(&r_hex, &s_hex, &group_public_key, &message_hash));
    }
}
