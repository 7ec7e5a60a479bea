//! Feldman VSS distributed key generation.
//!
//! One `FeldmanDkg` carries a single participant through a `(t, n)` round:
//! generate a polynomial, hand out evaluations of it, verify the
//! evaluations handed back by everyone else, and assemble the final share
//! and group public key. The engine performs no I/O; the orchestrator owns
//! mailbox posts and HSM storage around it.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::{
    curve::{self, Point, Scalar},
    error::{MpcError, Result},
    state::DkgPhase,
};

/// Evaluate `Σ a_k x^k` via Horner's method.
fn poly_eval_scalar(coefficients: &[Scalar], x: u32) -> Scalar {
    let x = Scalar::from_u64(x as u64);
    let mut acc = Scalar::zero();
    for a_k in coefficients.iter().rev() {
        acc = &acc * &x + a_k.clone();
    }
    acc
}

/// Evaluate `Σ C_k x^k` via Horner's method on the curve.
fn poly_eval_point(commitments: &[Point], x: u32) -> Point {
    let x = Scalar::from_u64(x as u64);
    let mut acc = Point::identity();
    for c_k in commitments.iter().rev() {
        acc = curve::point_mul(&x, &acc) + *c_k;
    }
    acc
}

pub struct FeldmanDkg {
    own_node_id: String,
    own_index: u32,
    threshold: usize,
    /// node_id -> index, including self.
    participants: BTreeMap<String, u32>,
    phase: DkgPhase,
    coefficients: Vec<Scalar>,
    own_commitments: Vec<Point>,
    received_commitments: BTreeMap<String, Vec<Point>>,
    received_shares: BTreeMap<String, Scalar>,
}

impl FeldmanDkg {
    pub fn new(own_node_id: String, participants: BTreeMap<String, u32>, threshold: usize) -> Self {
        let own_index = participants[&own_node_id];
        FeldmanDkg {
            own_node_id,
            own_index,
            threshold,
            participants,
            phase: DkgPhase::None,
            coefficients: Vec::new(),
            own_commitments: Vec::new(),
            received_commitments: BTreeMap::new(),
            received_shares: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> DkgPhase {
        self.phase
    }

    /// Rehydrate an engine instance from a persisted snapshot, so the
    /// orchestrator can drive a DKG round across separate CLI invocations
    /// without keeping the engine resident in memory between them.
    pub fn from_state(own_node_id: String, s: &crate::state::DkgSessionState) -> Result<Self> {
        let own_index = *s
            .participants
            .get(&own_node_id)
            .ok_or_else(|| MpcError::UnknownSender(own_node_id.clone()))?;

        let mut coefficients = Vec::with_capacity(s.own_coefficients_hex.len());
        for h in &s.own_coefficients_hex {
            coefficients.push(Scalar::from_hex(h)?);
        }

        let mut own_commitments = Vec::with_capacity(s.own_commitments_hex.len());
        for h in &s.own_commitments_hex {
            own_commitments.push(curve::deserialize_point(h)?);
        }

        let mut received_commitments = BTreeMap::new();
        for (node_id, hexes) in &s.received_commitments_hex {
            let mut points = Vec::with_capacity(hexes.len());
            for h in hexes {
                points.push(curve::deserialize_point(h)?);
            }
            received_commitments.insert(node_id.clone(), points);
        }

        let mut received_shares = BTreeMap::new();
        for (node_id, h) in &s.received_shares_hex {
            received_shares.insert(node_id.clone(), Scalar::from_hex(h)?);
        }

        Ok(FeldmanDkg {
            own_node_id,
            own_index,
            threshold: s.threshold,
            participants: s.participants.clone(),
            phase: s.phase,
            coefficients,
            own_commitments,
            received_commitments,
            received_shares,
        })
    }

    /// Write this engine's state back into a persisted snapshot.
    pub fn export_into(&self, s: &mut crate::state::DkgSessionState) {
        s.phase = self.phase;
        s.own_coefficients_hex = self.coefficients.iter().map(Scalar::to_hex).collect();
        s.own_commitments_hex = self.own_commitments.iter().map(curve::serialize_point).collect();
        s.received_commitments_hex = self
            .received_commitments
            .iter()
            .map(|(node_id, points)| {
                (node_id.clone(), points.iter().map(curve::serialize_point).collect())
            })
            .collect();
        s.received_shares_hex =
            self.received_shares.iter().map(|(node_id, share)| (node_id.clone(), share.to_hex())).collect();
    }

    /// Sample `a_0..a_{t-1}` uniformly, commit `C_k = a_k . G`. Callable
    /// exactly once per session.
    pub fn generate_polynomial(&mut self) -> Result<&[Point]> {
        if self.phase != DkgPhase::None {
            return Err(MpcError::WrongPhase("generate_polynomial requires phase = none"))
        }
        let coefficients: Vec<Scalar> = (0..self.threshold).map(|_| curve::scalar_random()).collect();
        let commitments: Vec<Point> = coefficients.iter().map(Point::from_scalar).collect();
        self.coefficients = coefficients;
        self.own_commitments = commitments;
        self.phase = DkgPhase::Committed;
        debug!(node_id = %self.own_node_id, threshold = self.threshold, "generated DKG polynomial");
        Ok(&self.own_commitments)
    }

    pub fn own_commitments(&self) -> &[Point] {
        &self.own_commitments
    }

    /// `Σ_{k=0}^{t-1} a_k . j^k mod n`. `j` must be nonzero; `j` == own
    /// index is permitted (self-share).
    pub fn compute_share_for(&self, target_index: u32) -> Result<Scalar> {
        if self.phase == DkgPhase::None {
            return Err(MpcError::WrongPhase("compute_share_for requires a generated polynomial"))
        }
        if target_index == 0 {
            return Err(MpcError::InvalidEncoding)
        }
        Ok(poly_eval_scalar(&self.coefficients, target_index))
    }

    /// Store a peer's `t` commitment points.
    pub fn receive_commitment(&mut self, from_node: &str, commitments: Vec<Point>) -> Result<()> {
        if commitments.len() != self.threshold {
            return Err(MpcError::WrongCommitmentCount {
                expected: self.threshold,
                got: commitments.len(),
            })
        }
        if self.received_commitments.contains_key(from_node) {
            return Err(MpcError::DuplicateCommitment(from_node.to_string()))
        }
        self.received_commitments.insert(from_node.to_string(), commitments);
        Ok(())
    }

    /// Verify `share . G == Σ_k (my_index^k mod n) . C_k` against the
    /// commitments previously received from `from_node`. Stores the share
    /// only on success; on failure neither stores anything nor errors —
    /// `Ok(false)` is the protocol's dishonest-dealer signal.
    pub fn receive_share(&mut self, from_node: &str, share: &Scalar) -> Result<bool> {
        let commitments = self
            .received_commitments
            .get(from_node)
            .ok_or_else(|| MpcError::UnknownSender(from_node.to_string()))?;

        let expected = poly_eval_point(commitments, self.own_index);
        let actual = Point::from_scalar(share);

        if actual == expected {
            self.received_shares.insert(from_node.to_string(), share.clone());
            Ok(true)
        } else {
            warn!(from_node, "Feldman share verification failed");
            Ok(false)
        }
    }

    /// Require shares from every other participant; sum with our own
    /// self-share to produce `final_share`, and sum every participant's
    /// `C_0` to produce `group_public_key`.
    pub fn finalize(&mut self) -> Result<(Scalar, Point)> {
        let mut missing = Vec::new();
        for node_id in self.participants.keys() {
            if node_id != &self.own_node_id && !self.received_shares.contains_key(node_id) {
                missing.push(node_id.clone());
            }
        }
        if !missing.is_empty() {
            return Err(MpcError::MissingShares(missing))
        }

        let own_self_share = poly_eval_scalar(&self.coefficients, self.own_index);
        let mut final_share =
            self.received_shares.values().cloned().fold(own_self_share, |acc, s| acc + s);

        let mut group_public_key = self.own_commitments[0];
        for commitments in self.received_commitments.values() {
            group_public_key = group_public_key + commitments[0];
        }

        self.phase = DkgPhase::Finalized;
        for a_k in self.coefficients.iter_mut() {
            a_k.zeroize();
        }
        self.coefficients.clear();

        let result = (final_share.clone(), group_public_key);
        final_share.zeroize();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_participants() -> BTreeMap<String, u32> {
        BTreeMap::from([("n1".to_string(), 1), ("n2".to_string(), 2), ("n3".to_string(), 3)])
    }

    #[test]
    fn happy_dkg_2_of_3() {
        let participants = three_node_participants();
        let mut engines: BTreeMap<String, FeldmanDkg> = participants
            .keys()
            .map(|id| (id.clone(), FeldmanDkg::new(id.clone(), participants.clone(), 2)))
            .collect();

        for engine in engines.values_mut() {
            engine.generate_polynomial().unwrap();
        }

        let commitments: BTreeMap<String, Vec<Point>> =
            engines.iter().map(|(id, e)| (id.clone(), e.own_commitments().to_vec())).collect();

        for (id, engine) in engines.iter_mut() {
            for (peer, peer_commitments) in &commitments {
                if peer != id {
                    engine.receive_commitment(peer, peer_commitments.clone()).unwrap();
                }
            }
        }

        let shares: BTreeMap<(String, String), Scalar> = engines
            .iter()
            .flat_map(|(from, engine)| {
                participants.iter().filter_map(move |(to, &idx)| {
                    if to != from {
                        Some(((from.clone(), to.clone()), engine.compute_share_for(idx).unwrap()))
                    } else {
                        None
                    }
                })
            })
            .collect();

        for (to, engine) in engines.iter_mut() {
            for ((from, target), share) in &shares {
                if target == to {
                    assert!(engine.receive_share(from, share).unwrap());
                }
            }
        }

        let mut group_keys = Vec::new();
        let mut final_shares = Vec::new();
        for (id, engine) in engines.iter_mut() {
            let (share, group_key) = engine.finalize().unwrap();
            final_shares.push((participants[id], share));
            group_keys.push(group_key);
        }

        assert!(group_keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn dishonest_dealer_share_fails_verification() {
        let participants = three_node_participants();
        let mut n1 = FeldmanDkg::new("n1".to_string(), participants.clone(), 2);
        let mut n2 = FeldmanDkg::new("n2".to_string(), participants.clone(), 2);
        n1.generate_polynomial().unwrap();
        n2.generate_polynomial().unwrap();

        n1.receive_commitment("n2", n2.own_commitments().to_vec()).unwrap();

        let mut bad_share = n2.compute_share_for(1).unwrap();
        bad_share = bad_share + Scalar::from_u64(1);

        assert!(!n1.receive_share("n2", &bad_share).unwrap());
        assert!(n1.finalize().is_err());
    }

    #[test]
    fn receive_share_from_unknown_sender_errors() {
        let participants = three_node_participants();
        let mut n1 = FeldmanDkg::new("n1".to_string(), participants, 2);
        n1.generate_polynomial().unwrap();
        assert!(matches!(
            n1.receive_share("n2", &Scalar::from_u64(1)),
            Err(MpcError::UnknownSender(_))
        ));
    }

    #[test]
    fn duplicate_commitment_rejected() {
        let participants = three_node_participants();
        let mut n1 = FeldmanDkg::new("n1".to_string(), participants.clone(), 2);
        let mut n2 = FeldmanDkg::new("n2".to_string(), participants, 2);
        n2.generate_polynomial().unwrap();
        n1.receive_commitment("n2", n2.own_commitments().to_vec()).unwrap();
        assert!(matches!(
            n1.receive_commitment("n2", n2.own_commitments().to_vec()),
            Err(MpcError::DuplicateCommitment(_))
        ));
    }
}
