//! Sequences engine calls and external collaborator I/O to run a DKG round
//! or a signing ceremony end to end. Every public method here corresponds
//! to one CLI command in `mpc-node` and is meant to be called once per
//! process invocation; all state that must outlive a call is round-tripped
//! through the `StateStore`.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::{
    curve::{self, Point, Scalar},
    dkg::FeldmanDkg,
    error::{MpcError, Result},
    nonce,
    protocol::{self, DkgCommitment, FinalSignatureMessage, IdentityMessage, NonceCommitment, PartialSignature, SessionLock, SigningRequest},
    signer,
    state::{DkgPhase, DkgSessionState, NodeState, SigningSessionState},
    traits::{Hsm, Mailbox, StateStore},
};

pub struct Orchestrator<'a, MB: Mailbox, H: Hsm, S: StateStore> {
    pub node_id: String,
    pub participants: BTreeMap<String, u32>,
    pub mailbox: &'a MB,
    pub hsm: &'a H,
    pub state_store: &'a S,
}

/// Outcome of one `dkg-distribute` peer operation.
pub enum DistributeOutcome {
    Posted,
    NoIdentity,
}

impl<'a, MB: Mailbox, H: Hsm, S: StateStore> Orchestrator<'a, MB, H, S> {
    pub fn new(
        node_id: String,
        participants: BTreeMap<String, u32>,
        mailbox: &'a MB,
        hsm: &'a H,
        state_store: &'a S,
    ) -> Self {
        Orchestrator { node_id, participants, mailbox, hsm, state_store }
    }

    fn own_index(&self) -> u32 {
        self.participants[&self.node_id]
    }

    // ---------------------------------------------------------------
    // DKG state machine
    // ---------------------------------------------------------------

    /// `none -> committed`: generate a polynomial, persist it, and post
    /// our commitments to the board.
    pub fn dkg_start(&self, round_id: &str, threshold: usize) -> Result<Vec<Point>> {
        let mut result = None;
        self.state_store.update(&mut |node_state: &mut NodeState| {
            if let Some(existing) = &node_state.dkg {
                if existing.round_id == round_id && existing.phase != DkgPhase::None {
                    return Err(MpcError::WrongPhase("a DKG round is already in progress"))
                }
            }
            let mut session =
                DkgSessionState::new(round_id.to_string(), threshold, self.participants.clone());
            let mut engine = FeldmanDkg::from_state(self.node_id.clone(), &session)?;
            let commitments = engine.generate_polynomial()?.to_vec();
            engine.export_into(&mut session);
            node_state.dkg = Some(session);
            result = Some(commitments);
            Ok(())
        })?;
        let commitments = result.expect("update closure always sets result on success");

        let msg = DkgCommitment {
            node_id: self.node_id.clone(),
            round_id: round_id.to_string(),
            threshold,
            total_nodes: self.participants.len(),
            commitments: commitments.iter().map(curve::serialize_point).collect(),
            timestamp: current_timestamp(),
        };
        self.mailbox.post(
            &protocol::dkg_commitment_path(round_id, &self.node_id),
            &serde_json::to_vec(&msg).map_err(|e| MpcError::Other(e.to_string()))?,
        )?;
        info!(round_id, node_id = %self.node_id, "posted DKG commitments");
        Ok(commitments)
    }

    /// `committed -> distributed`: compute and post an encrypted share for
    /// every other participant. A peer with no known identity is reported,
    /// not fatal.
    pub fn dkg_distribute(&self, round_id: &str) -> Result<BTreeMap<String, DistributeOutcome>> {
        let node_state = self.state_store.load()?;
        let session = node_state
            .dkg
            .as_ref()
            .filter(|d| d.round_id == round_id)
            .ok_or(MpcError::WrongPhase("no matching DKG round"))?;
        if session.phase != DkgPhase::Committed {
            return Err(MpcError::WrongPhase("dkg_distribute requires phase = committed"))
        }

        let engine = FeldmanDkg::from_state(self.node_id.clone(), session)?;

        let mut outcomes = BTreeMap::new();
        for (peer_id, &peer_index) in &self.participants {
            if peer_id == &self.node_id {
                continue
            }
            let identity_bytes = self.mailbox.read(&protocol::identity_path(peer_id))?;
            let Some(identity_bytes) = identity_bytes else {
                warn!(peer_id, "no identity on board; skipping share distribution");
                outcomes.insert(peer_id.clone(), DistributeOutcome::NoIdentity);
                continue
            };
            let identity: IdentityMessage =
                serde_json::from_slice(&identity_bytes).map_err(|e| MpcError::Other(e.to_string()))?;

            let share = engine.compute_share_for(peer_index)?;
            let ciphertext =
                self.hsm.encrypt_for_recipient(&identity.pubkey_pem, &share.as_bytes())?;
            self.mailbox
                .post(&protocol::dkg_share_path(round_id, &self.node_id, peer_id), &ciphertext)?;
            outcomes.insert(peer_id.clone(), DistributeOutcome::Posted);
        }

        self.state_store.update(&mut |node_state: &mut NodeState| {
            if let Some(dkg) = &mut node_state.dkg {
                if dkg.round_id == round_id {
                    dkg.phase = DkgPhase::Distributed;
                }
            }
            Ok(())
        })?;

        Ok(outcomes)
    }

    /// `distributed -> finalized`: decrypt every incoming share, verify
    /// all of them, and only then assemble the final share and group key.
    pub fn dkg_finalize(&self, round_id: &str) -> Result<()> {
        let node_state = self.state_store.load()?;
        let session = node_state
            .dkg
            .clone()
            .filter(|d| d.round_id == round_id)
            .ok_or(MpcError::WrongPhase("no matching DKG round"))?;
        if session.phase != DkgPhase::Distributed {
            return Err(MpcError::WrongPhase("dkg_finalize requires phase = distributed"))
        }

        let mut engine = FeldmanDkg::from_state(self.node_id.clone(), &session)?;

        // Load peer commitments.
        for peer_id in self.participants.keys() {
            if peer_id == &self.node_id {
                continue
            }
            let data = self
                .mailbox
                .read(&protocol::dkg_commitment_path(round_id, peer_id))?
                .ok_or_else(|| MpcError::Other(format!("missing commitments from {peer_id}")))?;
            let msg: DkgCommitment =
                serde_json::from_slice(&data).map_err(|e| MpcError::Other(e.to_string()))?;
            if msg.commitments.len() != session.threshold {
                return Err(MpcError::WrongCommitmentCount {
                    expected: session.threshold,
                    got: msg.commitments.len(),
                })
            }
            let points: Result<Vec<Point>> =
                msg.commitments.iter().map(|h| curve::deserialize_point(h)).collect();
            // `receive_commitment` is a no-op if already recorded from a
            // previous (partial) finalize attempt.
            if !session.received_commitments_hex.contains_key(peer_id) {
                engine.receive_commitment(peer_id, points?)?;
            }
        }

        let share_files = self.mailbox.list(&format!("dkg/{round_id}/shares"))?;
        let suffix = format!("_to_{}.enc", self.node_id);
        let incoming: Vec<&String> = share_files.iter().filter(|f| f.ends_with(&suffix)).collect();

        let expected = self.participants.len() - 1;
        if incoming.len() < expected {
            return Err(MpcError::Other(format!(
                "InsufficientShares: have {}, need {expected}",
                incoming.len()
            )))
        }

        let mut failures = Vec::new();
        for file in &incoming {
            let from_node = file.trim_end_matches(&suffix).to_string();
            let path = format!("dkg/{round_id}/shares/{file}");
            let ciphertext = self
                .mailbox
                .read(&path)?
                .ok_or_else(|| MpcError::Other(format!("share file disappeared: {path}")))?;
            let plaintext = self.hsm.decrypt_with_identity_key(&ciphertext)?;
            if plaintext.len() != 32 {
                failures.push(format!("{from_node}: malformed share"));
                continue
            }
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&plaintext);
            let share = curve::scalar_mod(&bytes);
            match engine.receive_share(&from_node, &share) {
                Ok(true) => {},
                Ok(false) => failures.push(format!("{from_node}: verification failed")),
                Err(e) => failures.push(format!("{from_node}: {e}")),
            }
        }

        if !failures.is_empty() {
            warn!(round_id, ?failures, "DKG finalize aborted: dishonest dealer(s)");
            return Err(MpcError::ShareVerificationFailed(failures.join(", ")))
        }

        let (final_share, group_public_key) = engine.finalize()?;
        self.hsm.store_dkg_share(round_id, &final_share.as_bytes())?;

        self.state_store.update(&mut |node_state: &mut NodeState| {
            if let Some(dkg) = &mut node_state.dkg {
                if dkg.round_id == round_id {
                    engine.export_into(dkg);
                    dkg.group_public_key_hex = Some(curve::serialize_point(&group_public_key));
                }
            }
            Ok(())
        })?;

        info!(round_id, "DKG finalized");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Signing state machine
    // ---------------------------------------------------------------

    pub fn sign_request(&self, request_id: &str, message_hash: [u8; 32], message_preview: &str) -> Result<()> {
        let msg = SigningRequest {
            request_id: request_id.to_string(),
            message_hash: hex::encode(message_hash),
            message_preview: message_preview.to_string(),
            requester: self.node_id.clone(),
            timestamp: current_timestamp(),
        };
        self.mailbox.post(
            &protocol::signing_request_path(request_id),
            &serde_json::to_vec(&msg).map_err(|e| MpcError::Other(e.to_string()))?,
        )
    }

    /// The triple-layer guard plus deterministic nonce derivation and the
    /// first board post. Returns `Ok(())` on a clean approve, `Err(..)`
    /// (including the recoverable `AlreadyCommitted`) otherwise.
    pub fn sign_approve(&self, request_id: &str) -> Result<()> {
        let node_state = self.state_store.load()?;

        let dkg = node_state
            .dkg
            .as_ref()
            .filter(|d| d.phase == DkgPhase::Finalized)
            .ok_or(MpcError::WrongPhase("DKG is not finalized"))?;
        let round_id = dkg.round_id.clone();

        // Layer 1: local state.
        if node_state.used_nonces.contains_key(request_id) {
            return Err(MpcError::NonceReuse)
        }

        // Layer 2: HSM — either the commitment object or a derivation audit
        // record binding this request_id witnesses prior use; a crash
        // between writing one and the other must not look clean.
        let hsm_has_commitment = self.hsm.has_nonce_commitment(request_id)?
            || self.hsm.has_derivation_record_for(request_id)?;

        // Layer 3: board.
        let board_commitment =
            self.mailbox.read(&protocol::signing_commitment_path(request_id, &self.node_id))?;

        match (hsm_has_commitment, board_commitment.is_some()) {
            (false, false) => {}, // all three witnesses clean, proceed
            (false, true) => {
                // Recovery path: board alone remembers us.
                let data = board_commitment.expect("checked above");
                let existing: NonceCommitment =
                    serde_json::from_slice(&data).map_err(|e| MpcError::Other(e.to_string()))?;
                self.hsm.store_nonce_commitment(request_id, &existing.r_commitment)?;
                self.state_store.update(&mut |s: &mut NodeState| {
                    s.used_nonces.insert(request_id.to_string(), existing.r_commitment.clone());
                    Ok(())
                })?;
                return Err(MpcError::AlreadyCommitted)
            },
            _ => return Err(MpcError::NonceReuse),
        }

        let req_data = self
            .mailbox
            .read(&protocol::signing_request_path(request_id))?
            .ok_or_else(|| MpcError::Other(format!("signing request {request_id} not found")))?;
        let req: SigningRequest =
            serde_json::from_slice(&req_data).map_err(|e| MpcError::Other(e.to_string()))?;
        let message_hash_bytes = hex::decode(&req.message_hash).map_err(|_| MpcError::InvalidEncoding)?;
        if message_hash_bytes.len() != 32 {
            return Err(MpcError::InvalidEncoding)
        }
        let mut message_hash = [0u8; 32];
        message_hash.copy_from_slice(&message_hash_bytes);

        let (counter, digest) = self.hsm.compute_nonce_digest(request_id, &message_hash)?;
        let derivation = nonce::reduce_digest_to_nonce(counter, &digest, request_id, &message_hash)?;

        self.hsm.store_derivation_record(&crate::traits::NonceDerivationRecord {
            counter,
            request_id: request_id.to_string(),
            r_hex: derivation.r_hex.clone(),
            message_hash_hex: derivation.message_hash_hex.clone(),
        })?;

        // Local state write happens before the board post.
        self.state_store.update(&mut |s: &mut NodeState| {
            s.used_nonces.insert(request_id.to_string(), derivation.r_hex.clone());
            let mut session =
                SigningSessionState::new(request_id.to_string(), derivation.message_hash_hex.clone());
            session.derivation_counter = Some(counter);
            session.r_commitments_hex.insert(self.node_id.clone(), derivation.r_hex.clone());
            s.signing_sessions.insert(request_id.to_string(), session);
            Ok(())
        })?;

        let msg = NonceCommitment {
            node_id: self.node_id.clone(),
            request_id: request_id.to_string(),
            r_commitment: derivation.r_hex.clone(),
            timestamp: current_timestamp(),
        };
        self.mailbox.post(
            &protocol::signing_commitment_path(request_id, &self.node_id),
            &serde_json::to_vec(&msg).map_err(|e| MpcError::Other(e.to_string()))?,
        )?;

        match self.hsm.store_nonce_commitment(request_id, &derivation.r_hex) {
            Ok(()) => {},
            Err(MpcError::SecurityError(_)) => {
                // Already recorded via the derivation audit trail; fine.
            },
            Err(e) => return Err(e),
        }

        info!(request_id, counter, round_id, "sign-approve complete");
        Ok(())
    }

    /// Participant-set locking, per-participant partial-signature
    /// computation, and (once enough partials exist) combination and
    /// verification.
    pub fn sign_finalize(&self, request_id: &str) -> Result<Option<(String, String)>> {
        let node_state = self.state_store.load()?;
        let dkg = node_state
            .dkg
            .as_ref()
            .filter(|d| d.phase == DkgPhase::Finalized)
            .ok_or(MpcError::WrongPhase("DKG is not finalized"))?;
        let threshold = dkg.threshold;
        let group_public_key_hex =
            dkg.group_public_key_hex.clone().ok_or(MpcError::WrongPhase("missing group public key"))?;
        let group_public_key = curve::deserialize_point(&group_public_key_hex)?;

        let commit_files = self.mailbox.list(&format!("signing/{request_id}/commitments"))?;
        if commit_files.len() < threshold {
            return Err(MpcError::BelowThreshold { needed: threshold, got: commit_files.len() })
        }
        let own_file = format!("{}.json", self.node_id);
        if !commit_files.contains(&own_file) {
            return Err(MpcError::NotApproved)
        }

        let participants = self.lock_participant_set(request_id, &commit_files, threshold)?;
        if !participants.contains_key(&self.node_id) {
            return Err(MpcError::NotInLockedSet)
        }

        let mut r_commitments_hex = BTreeMap::new();
        for node_id in participants.keys() {
            let data = self
                .mailbox
                .read(&protocol::signing_commitment_path(request_id, node_id))?
                .ok_or_else(|| MpcError::ParticipantMissing(node_id.clone()))?;
            let msg: NonceCommitment =
                serde_json::from_slice(&data).map_err(|e| MpcError::Other(e.to_string()))?;
            r_commitments_hex.insert(node_id.clone(), msg.r_commitment);
        }

        let signing_session = node_state
            .signing_sessions
            .get(request_id)
            .ok_or(MpcError::WrongPhase("sign-approve has not run locally for this request_id"))?;
        let counter = signing_session
            .derivation_counter
            .ok_or(MpcError::WrongPhase("no recorded derivation counter"))?;
        let message_hash_bytes =
            hex::decode(&signing_session.message_hash_hex).map_err(|_| MpcError::InvalidEncoding)?;
        let mut message_hash = [0u8; 32];
        message_hash.copy_from_slice(&message_hash_bytes);

        let share_bytes = self.hsm.get_dkg_share(&dkg.round_id)?;
        let x_i = curve::scalar_mod(&share_bytes);

        let digest = self.hsm.replay_nonce_digest(counter, request_id, &message_hash)?;
        let derivation = nonce::reduce_digest_to_nonce(counter, &digest, request_id, &message_hash)?;

        let mut signer_engine = signer::ThresholdSigner::new(self.node_id.clone(), x_i, group_public_key);
        signer_engine.begin_session(request_id, message_hash, derivation.k.clone())?;
        for (node_id, r_hex) in &r_commitments_hex {
            if node_id != &self.node_id {
                signer_engine.receive_nonce_commitment(request_id, node_id, r_hex)?;
            }
        }
        let partial = signer_engine.compute_partial(request_id, &participants)?;

        self.mailbox.post(
            &protocol::signing_partial_path(request_id, &self.node_id),
            &serde_json::to_vec(&PartialSignature {
                node_id: self.node_id.clone(),
                request_id: request_id.to_string(),
                partial_s: partial.to_hex(),
                timestamp: current_timestamp(),
            })
            .map_err(|e| MpcError::Other(e.to_string()))?,
        )?;

        self.state_store.update(&mut |s: &mut NodeState| {
            if let Some(session) = s.signing_sessions.get_mut(request_id) {
                session.locked_participants = Some(participants.keys().cloned().collect());
                session.partials_hex.insert(self.node_id.clone(), partial.to_hex());
            }
            Ok(())
        })?;

        let partial_files = self.mailbox.list(&format!("signing/{request_id}/partials"))?;
        if partial_files.len() < threshold {
            info!(request_id, have = partial_files.len(), threshold, "awaiting more partials");
            return Ok(None)
        }

        let mut partials_hex = BTreeMap::new();
        let mut r_commitments = BTreeMap::new();
        for node_id in participants.keys() {
            let data = self
                .mailbox
                .read(&protocol::signing_partial_path(request_id, node_id))?
                .ok_or_else(|| MpcError::MissingPartial(node_id.clone()))?;
            let msg: PartialSignature =
                serde_json::from_slice(&data).map_err(|e| MpcError::Other(e.to_string()))?;
            partials_hex.insert(node_id.clone(), Scalar::from_hex(&msg.partial_s)?);
            r_commitments.insert(
                node_id.clone(),
                curve::deserialize_point(r_commitments_hex.get(node_id).expect("loaded above"))?,
            );
        }

        let ordered_participants: Vec<String> = participants.keys().cloned().collect();
        let (r_hex, s_hex) = signer::combine(&partials_hex, &r_commitments, &ordered_participants)?;

        if !signer::verify(&r_hex, &s_hex, &group_public_key, &message_hash) {
            warn!(request_id, "combined signature failed verification");
            return Err(MpcError::BadCombination)
        }

        self.mailbox.post(
            &protocol::signing_result_path(request_id),
            &serde_json::to_vec(&FinalSignatureMessage {
                request_id: request_id.to_string(),
                r: r_hex.clone(),
                s: s_hex.clone(),
                participants: ordered_participants,
                timestamp: current_timestamp(),
            })
            .map_err(|e| MpcError::Other(e.to_string()))?,
        )?;

        info!(request_id, "signing finalized");
        Ok(Some((r_hex, s_hex)))
    }

    /// Deterministic t-sized subset selection with a self-inclusion rule,
    /// resolved against whichever `session.json` lands first on the board.
    fn lock_participant_set(
        &self,
        request_id: &str,
        commit_files: &[String],
        threshold: usize,
    ) -> Result<BTreeMap<String, u32>> {
        if let Some(data) = self.mailbox.read(&protocol::signing_session_path(request_id))? {
            let lock: SessionLock =
                serde_json::from_slice(&data).map_err(|e| MpcError::Other(e.to_string()))?;
            return Ok(self.resolve_indices(&lock.participants))
        }

        let mut sorted: Vec<String> =
            commit_files.iter().map(|f| f.trim_end_matches(".json").to_string()).collect();
        sorted.sort();

        let selected: Vec<String> = if sorted.iter().take(threshold).any(|n| n == &self.node_id) {
            sorted.into_iter().take(threshold).collect()
        } else {
            let mut selected = vec![self.node_id.clone()];
            selected.extend(sorted.into_iter().filter(|n| n != &self.node_id).take(threshold - 1));
            selected
        };

        let lock = SessionLock {
            participants: selected.clone(),
            locked_by: self.node_id.clone(),
            timestamp: current_timestamp(),
        };
        match self.mailbox.post(
            &protocol::signing_session_path(request_id),
            &serde_json::to_vec(&lock).map_err(|e| MpcError::Other(e.to_string()))?,
        ) {
            Ok(()) => Ok(self.resolve_indices(&selected)),
            Err(_) => {
                // Lost the race; adopt whatever landed.
                let data = self
                    .mailbox
                    .read(&protocol::signing_session_path(request_id))?
                    .ok_or_else(|| MpcError::Other("session lock vanished after race".to_string()))?;
                let lock: SessionLock =
                    serde_json::from_slice(&data).map_err(|e| MpcError::Other(e.to_string()))?;
                Ok(self.resolve_indices(&lock.participants))
            },
        }
    }

    fn resolve_indices(&self, node_ids: &[String]) -> BTreeMap<String, u32> {
        node_ids
            .iter()
            .filter_map(|id| self.participants.get(id).map(|&idx| (id.clone(), idx)))
            .collect()
    }
}

fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
