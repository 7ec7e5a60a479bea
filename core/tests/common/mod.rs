//! In-memory `Hsm`/`Mailbox`/`StateStore` test doubles, shared by the
//! scenario tests in `scenarios.rs`. These stand in for `mpc-node`'s
//! PKCS#11/Git/JSON-file collaborators so the orchestrator's ceremony
//! logic can be exercised end to end without real I/O; the RSA-over-PKCS#11
//! identity encryption is replaced with an opaque tagged-hex encoding since
//! only the round-trip, not the asymmetric cryptography, is under test
//! here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use mpc_core::state::NodeState;
use mpc_core::traits::{Hsm, HsmMode, Mailbox, NonceDerivationRecord, StateStore};
use mpc_core::{nonce, MpcError, Result};

#[derive(Default)]
struct HsmInner {
    dkg_shares: BTreeMap<String, [u8; 32]>,
    master_seed: Option<[u8; 32]>,
    counter: u64,
    derivation_records: BTreeMap<u64, NonceDerivationRecord>,
    nonce_commitments: BTreeMap<String, String>,
}

pub struct InMemoryHsm {
    node_id: String,
    mode: HsmMode,
    inner: Mutex<HsmInner>,
}

impl InMemoryHsm {
    pub fn new(node_id: impl Into<String>, mode: HsmMode) -> Self {
        InMemoryHsm { node_id: node_id.into(), mode, inner: Mutex::new(HsmInner::default()) }
    }
}

impl Hsm for InMemoryHsm {
    fn mode(&self) -> HsmMode {
        self.mode
    }

    fn identity_public_key_pem(&self) -> Result<String> {
        Ok(self.node_id.clone())
    }

    fn decrypt_with_identity_key(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let text =
            String::from_utf8(ciphertext.to_vec()).map_err(|e| MpcError::HsmError(e.to_string()))?;
        let (to, payload) =
            text.split_once(':').ok_or_else(|| MpcError::HsmError("malformed ciphertext".to_string()))?;
        if to != self.node_id {
            return Err(MpcError::HsmError(format!("ciphertext addressed to {to}, not {}", self.node_id)))
        }
        hex::decode(payload).map_err(|e| MpcError::HsmError(e.to_string()))
    }

    fn encrypt_for_recipient(&self, recipient_pubkey_pem: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(format!("{recipient_pubkey_pem}:{}", hex::encode(plaintext)).into_bytes())
    }

    fn has_dkg_share(&self, round_id: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().dkg_shares.contains_key(round_id))
    }

    fn store_dkg_share(&self, round_id: &str, share_bytes: &[u8; 32]) -> Result<()> {
        self.inner.lock().unwrap().dkg_shares.insert(round_id.to_string(), *share_bytes);
        Ok(())
    }

    fn get_dkg_share(&self, round_id: &str) -> Result<[u8; 32]> {
        if self.mode.is_production() {
            return Err(MpcError::SecurityError("production mode refuses share extraction".to_string()))
        }
        self.inner
            .lock()
            .unwrap()
            .dkg_shares
            .get(round_id)
            .copied()
            .ok_or_else(|| MpcError::HsmError(format!("no DKG share for round {round_id}")))
    }

    fn initialize_nonce_derivation(&self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.master_seed.is_some() {
            return Ok(false)
        }
        let mut seed = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut seed);
        inner.master_seed = Some(seed);
        inner.counter = 0;
        Ok(true)
    }

    fn has_nonce_master_seed(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().master_seed.is_some())
    }

    fn compute_nonce_digest(&self, request_id: &str, message_hash: &[u8; 32]) -> Result<(u64, [u8; 64])> {
        let mut inner = self.inner.lock().unwrap();
        let seed = inner
            .master_seed
            .ok_or_else(|| MpcError::HsmError("nonce derivation not initialized".to_string()))?;
        inner.counter += 1;
        let counter = inner.counter;
        let input = nonce::derivation_input(counter, request_id, message_hash);
        Ok((counter, nonce::hmac_sha512(&seed, &input)))
    }

    fn replay_nonce_digest(
        &self,
        counter: u64,
        request_id: &str,
        message_hash: &[u8; 32],
    ) -> Result<[u8; 64]> {
        let inner = self.inner.lock().unwrap();
        let seed = inner
            .master_seed
            .ok_or_else(|| MpcError::HsmError("nonce derivation not initialized".to_string()))?;
        let input = nonce::derivation_input(counter, request_id, message_hash);
        Ok(nonce::hmac_sha512(&seed, &input))
    }

    fn store_derivation_record(&self, record: &NonceDerivationRecord) -> Result<()> {
        self.inner.lock().unwrap().derivation_records.insert(record.counter, record.clone());
        Ok(())
    }

    fn list_derivation_records(&self) -> Result<Vec<NonceDerivationRecord>> {
        if self.mode.is_production() {
            return Ok(Vec::new())
        }
        Ok(self.inner.lock().unwrap().derivation_records.values().cloned().collect())
    }

    fn has_derivation_record_for(&self, request_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .derivation_records
            .values()
            .any(|r| r.request_id == request_id))
    }

    fn has_nonce_commitment(&self, request_id: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().nonce_commitments.contains_key(request_id))
    }

    fn store_nonce_commitment(&self, request_id: &str, r_hex: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.nonce_commitments.contains_key(request_id) {
            return Err(MpcError::SecurityError(format!(
                "nonce commitment for {request_id} already exists"
            )))
        }
        inner.nonce_commitments.insert(request_id.to_string(), r_hex.to_string());
        Ok(())
    }

    fn get_nonce_commitment(&self, request_id: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().nonce_commitments.get(request_id).cloned())
    }

    fn list_used_nonces(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().nonce_commitments.keys().cloned().collect())
    }
}

pub struct InMemoryMailbox {
    board: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        InMemoryMailbox { board: Mutex::new(BTreeMap::new()) }
    }

    /// Simulates an attacker (or a rewound clone) deleting a single board
    /// entry — scenario E.
    pub fn delete(&self, path: &str) {
        self.board.lock().unwrap().remove(path);
    }

    /// Test-only escape hatch past `post`'s no-silent-overwrite rule, for
    /// directly tampering with posted ciphertext — scenario C.
    pub fn overwrite(&self, path: &str, data: Vec<u8>) {
        self.board.lock().unwrap().insert(path.to_string(), data);
    }
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox for InMemoryMailbox {
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn post(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut board = self.board.lock().unwrap();
        match board.get(path) {
            Some(existing) if existing != data => {
                Err(MpcError::MailboxError(format!("conflicting write to {path}")))
            },
            _ => {
                board.insert(path.to_string(), data.to_vec());
                Ok(())
            },
        }
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.board.lock().unwrap().get(path).cloned())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = format!("{dir}/");
        let board = self.board.lock().unwrap();
        let mut names = BTreeSet::new();
        for key in board.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }
}

pub struct InMemoryStateStore {
    state: Mutex<NodeState>,
}

impl InMemoryStateStore {
    pub fn new(node_id: impl Into<String>, index: u32) -> Self {
        InMemoryStateStore { state: Mutex::new(NodeState::new(node_id.into(), index)) }
    }

    /// Simulates an operator losing the local state file: the nonce
    /// witness and signing-session bookkeeping vanish, but nothing here
    /// rewinds the HSM or the board — scenario D.
    pub fn wipe_used_nonces(&self) {
        self.state.lock().unwrap().used_nonces.clear();
    }
}

impl StateStore for InMemoryStateStore {
    fn load(&self) -> Result<NodeState> {
        Ok(self.state.lock().unwrap().clone())
    }

    fn update(&self, f: &mut dyn FnMut(&mut NodeState) -> Result<()>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }
}

pub fn participants_map() -> BTreeMap<String, u32> {
    BTreeMap::from([("n1".to_string(), 1), ("n2".to_string(), 2), ("n3".to_string(), 3)])
}
