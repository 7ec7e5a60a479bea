//! PKCS#11-backed `Hsm` implementation.
//!
//! Identity RSA key lives in the token under the label `IDENTITY_KEY`; DKG
//! shares and nonce bookkeeping are generic secret objects under
//! `DKG_SHARE_<round_id>`, `NONCE_<request_id>`, `NONCE_MASTER_SEED`,
//! `NONCE_COUNTER`, and `NONCE_DERIV_<counter>`. `HsmMode` toggles the
//! `SENSITIVE`/`EXTRACTABLE` attributes on every object this facade
//! creates.

use std::sync::Mutex;

use cryptoki::context::Pkcs11;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use mpc_core::traits::{Hsm, HsmMode, NonceDerivationRecord};
use mpc_core::{MpcError, Result};
use rsa::pkcs1v15::Pkcs1v15Encrypt;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;

const IDENTITY_KEY_LABEL: &str = "IDENTITY_KEY";
const NONCE_MASTER_LABEL: &str = "NONCE_MASTER_SEED";
const NONCE_COUNTER_LABEL: &str = "NONCE_COUNTER";

fn dkg_share_label(round_id: &str) -> String {
    format!("DKG_SHARE_{round_id}")
}

fn nonce_label(request_id: &str) -> String {
    format!("NONCE_{request_id}")
}

fn derivation_label(counter: u64) -> String {
    format!("NONCE_DERIV_{counter}")
}

pub struct Pkcs11Hsm {
    mode: HsmMode,
    session: Mutex<Session>,
}

impl Pkcs11Hsm {
    /// Open a read/write session against the slot with id `slot_id` on the
    /// loaded module and log in with `pin`. `module_path` is typically
    /// SoftHSM's `libsofthsm2.so` in demo/test deployments, or the vendor's
    /// PKCS#11 module in production.
    pub fn open(module_path: &str, slot_id: u64, pin: &str, mode: HsmMode) -> Result<Self> {
        let pkcs11 = Pkcs11::new(module_path).map_err(|e| MpcError::HsmError(e.to_string()))?;
        pkcs11.initialize(cryptoki::context::CInitializeArgs::OsThreads).ok();
        let slot = Self::find_slot(&pkcs11, slot_id)?;
        let session =
            pkcs11.open_rw_session(slot).map_err(|e| MpcError::HsmError(e.to_string()))?;
        session
            .login(UserType::User, Some(&AuthPin::new(pin.to_string())))
            .map_err(|e| MpcError::HsmError(e.to_string()))?;
        Ok(Pkcs11Hsm { mode, session: Mutex::new(session) })
    }

    fn find_slot(pkcs11: &Pkcs11, slot_id: u64) -> Result<Slot> {
        pkcs11
            .get_all_slots()
            .map_err(|e| MpcError::HsmError(e.to_string()))?
            .into_iter()
            .find(|s| u64::from(s.id()) == slot_id)
            .ok_or_else(|| MpcError::HsmError(format!("no PKCS#11 slot with id {slot_id}")))
    }

    fn sensitive_attr(&self) -> bool {
        self.mode.is_production()
    }

    fn extractable_attr(&self) -> bool {
        !self.mode.is_production()
    }

    fn find_secret(session: &Session, label: &str) -> Result<Option<ObjectHandle>> {
        let template = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::Label(label.as_bytes().to_vec()),
        ];
        let handles =
            session.find_objects(&template).map_err(|e| MpcError::HsmError(e.to_string()))?;
        Ok(handles.into_iter().next())
    }

    fn read_value(session: &Session, handle: ObjectHandle) -> Result<Vec<u8>> {
        let attrs = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| MpcError::HsmError(e.to_string()))?;
        for attr in attrs {
            if let Attribute::Value(v) = attr {
                return Ok(v)
            }
        }
        Err(MpcError::HsmError("object has no VALUE attribute".to_string()))
    }

    fn create_secret(&self, session: &Session, label: &str, value: &[u8]) -> Result<()> {
        let template = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(cryptoki::object::KeyType::GENERIC_SECRET),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Value(value.to_vec()),
            Attribute::Sensitive(self.sensitive_attr()),
            Attribute::Extractable(self.extractable_attr()),
            Attribute::Token(true),
        ];
        session.create_object(&template).map_err(|e| MpcError::HsmError(e.to_string()))?;
        Ok(())
    }
}

impl Hsm for Pkcs11Hsm {
    fn mode(&self) -> HsmMode {
        self.mode
    }

    fn identity_public_key_pem(&self) -> Result<String> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::Label(IDENTITY_KEY_LABEL.as_bytes().to_vec()),
        ];
        let handles =
            session.find_objects(&template).map_err(|e| MpcError::HsmError(e.to_string()))?;
        let handle = handles
            .into_iter()
            .next()
            .ok_or_else(|| MpcError::HsmError("identity key not found".to_string()))?;
        let attrs = session
            .get_attributes(handle, &[AttributeType::Modulus, AttributeType::PublicExponent])
            .map_err(|e| MpcError::HsmError(e.to_string()))?;
        let (mut modulus, mut exponent) = (None, None);
        for attr in attrs {
            match attr {
                Attribute::Modulus(m) => modulus = Some(m),
                Attribute::PublicExponent(e) => exponent = Some(e),
                _ => {},
            }
        }
        let (modulus, exponent) = modulus
            .zip(exponent)
            .ok_or_else(|| MpcError::HsmError("identity key missing RSA attributes".to_string()))?;
        let public_key = rsa::RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(&modulus),
            rsa::BigUint::from_bytes_be(&exponent),
        )
        .map_err(|e| MpcError::HsmError(e.to_string()))?;
        use rsa::pkcs8::EncodePublicKey;
        public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| MpcError::HsmError(e.to_string()))
    }

    fn decrypt_with_identity_key(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Label(IDENTITY_KEY_LABEL.as_bytes().to_vec()),
        ];
        let handles =
            session.find_objects(&template).map_err(|e| MpcError::HsmError(e.to_string()))?;
        let handle = handles
            .into_iter()
            .next()
            .ok_or_else(|| MpcError::HsmError("identity key not found".to_string()))?;
        session
            .decrypt(&Mechanism::RsaPkcs, handle, ciphertext)
            .map_err(|e| MpcError::HsmError(e.to_string()))
    }

    fn encrypt_for_recipient(&self, recipient_pubkey_pem: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let public_key = RsaPublicKey::from_public_key_pem(recipient_pubkey_pem)
            .map_err(|e| MpcError::HsmError(format!("bad recipient pem: {e}")))?;
        let mut rng = rand::thread_rng();
        public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)
            .map_err(|e| MpcError::HsmError(e.to_string()))
    }

    fn has_dkg_share(&self, round_id: &str) -> Result<bool> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        Ok(Self::find_secret(&session, &dkg_share_label(round_id))?.is_some())
    }

    fn store_dkg_share(&self, round_id: &str, share_bytes: &[u8; 32]) -> Result<()> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let label = dkg_share_label(round_id);
        if let Some(existing) = Self::find_secret(&session, &label)? {
            session.destroy_object(existing).map_err(|e| MpcError::HsmError(e.to_string()))?;
        }
        self.create_secret(&session, &label, share_bytes)
    }

    fn get_dkg_share(&self, round_id: &str) -> Result<[u8; 32]> {
        if self.mode.is_production() {
            return Err(MpcError::SecurityError(
                "cannot extract DKG share in production mode; signing must happen inside the HSM"
                    .to_string(),
            ))
        }
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let handle = Self::find_secret(&session, &dkg_share_label(round_id))?
            .ok_or_else(|| MpcError::HsmError(format!("no DKG share for round {round_id}")))?;
        let value = Self::read_value(&session, handle)?;
        if value.len() != 32 {
            return Err(MpcError::HsmError("DKG share has unexpected length".to_string()))
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&value);
        Ok(out)
    }

    fn initialize_nonce_derivation(&self) -> Result<bool> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        if Self::find_secret(&session, NONCE_MASTER_LABEL)?.is_some() {
            return Ok(false)
        }
        let mut master_seed = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut master_seed);
        self.create_secret(&session, NONCE_MASTER_LABEL, &master_seed)?;
        self.create_secret(&session, NONCE_COUNTER_LABEL, &0u64.to_be_bytes())?;
        Ok(true)
    }

    fn has_nonce_master_seed(&self) -> Result<bool> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        Ok(Self::find_secret(&session, NONCE_MASTER_LABEL)?.is_some())
    }

    fn compute_nonce_digest(&self, request_id: &str, message_hash: &[u8; 32]) -> Result<(u64, [u8; 64])> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let counter_handle = Self::find_secret(&session, NONCE_COUNTER_LABEL)?
            .ok_or_else(|| MpcError::HsmError("nonce derivation not initialized".to_string()))?;
        let current = Self::read_value(&session, counter_handle)?;
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&current);
        let new_counter = u64::from_be_bytes(counter_bytes) + 1;

        // Delete-and-recreate simulates the HSM's atomic monotonic counter.
        session.destroy_object(counter_handle).map_err(|e| MpcError::HsmError(e.to_string()))?;
        self.create_secret(&session, NONCE_COUNTER_LABEL, &new_counter.to_be_bytes())?;

        let master_seed_handle = Self::find_secret(&session, NONCE_MASTER_LABEL)?
            .ok_or_else(|| MpcError::HsmError("nonce derivation not initialized".to_string()))?;
        let master_seed_bytes = Self::read_value(&session, master_seed_handle)?;
        let mut master_seed = [0u8; 32];
        master_seed.copy_from_slice(&master_seed_bytes);

        let input = mpc_core::nonce::derivation_input(new_counter, request_id, message_hash);
        let digest = mpc_core::nonce::hmac_sha512(&master_seed, &input);
        Ok((new_counter, digest))
    }

    fn replay_nonce_digest(&self, counter: u64, request_id: &str, message_hash: &[u8; 32]) -> Result<[u8; 64]> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let master_seed_handle = Self::find_secret(&session, NONCE_MASTER_LABEL)?
            .ok_or_else(|| MpcError::HsmError("nonce derivation not initialized".to_string()))?;
        let master_seed_bytes = Self::read_value(&session, master_seed_handle)?;
        let mut master_seed = [0u8; 32];
        master_seed.copy_from_slice(&master_seed_bytes);

        let input = mpc_core::nonce::derivation_input(counter, request_id, message_hash);
        Ok(mpc_core::nonce::hmac_sha512(&master_seed, &input))
    }

    fn store_derivation_record(&self, record: &NonceDerivationRecord) -> Result<()> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let payload = serde_json::to_vec(record).map_err(|e| MpcError::HsmError(e.to_string()))?;
        self.create_secret(&session, &derivation_label(record.counter), &payload)
    }

    fn list_derivation_records(&self) -> Result<Vec<NonceDerivationRecord>> {
        if self.mode.is_production() {
            return Ok(Vec::new())
        }
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let template = vec![Attribute::Class(ObjectClass::SECRET_KEY)];
        let handles =
            session.find_objects(&template).map_err(|e| MpcError::HsmError(e.to_string()))?;
        let mut records = Vec::new();
        for handle in handles {
            let attrs = session
                .get_attributes(handle, &[AttributeType::Label])
                .map_err(|e| MpcError::HsmError(e.to_string()))?;
            let Some(Attribute::Label(label)) = attrs.into_iter().next() else { continue };
            if !label.starts_with(b"NONCE_DERIV_") {
                continue
            }
            let value = Self::read_value(&session, handle)?;
            if let Ok(record) = serde_json::from_slice::<NonceDerivationRecord>(&value) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.counter);
        Ok(records)
    }

    fn has_derivation_record_for(&self, request_id: &str) -> Result<bool> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let template = vec![Attribute::Class(ObjectClass::SECRET_KEY)];
        let handles =
            session.find_objects(&template).map_err(|e| MpcError::HsmError(e.to_string()))?;
        for handle in handles {
            let attrs = session
                .get_attributes(handle, &[AttributeType::Label])
                .map_err(|e| MpcError::HsmError(e.to_string()))?;
            let Some(Attribute::Label(label)) = attrs.into_iter().next() else { continue };
            if !label.starts_with(b"NONCE_DERIV_") {
                continue
            }
            let value = Self::read_value(&session, handle)?;
            if let Ok(record) = serde_json::from_slice::<NonceDerivationRecord>(&value) {
                if record.request_id == request_id {
                    return Ok(true)
                }
            }
        }
        Ok(false)
    }

    fn has_nonce_commitment(&self, request_id: &str) -> Result<bool> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        Ok(Self::find_secret(&session, &nonce_label(request_id))?.is_some())
    }

    fn store_nonce_commitment(&self, request_id: &str, r_hex: &str) -> Result<()> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let label = nonce_label(request_id);
        if Self::find_secret(&session, &label)?.is_some() {
            return Err(MpcError::SecurityError(format!(
                "nonce commitment for {request_id} already exists in HSM; refusing to overwrite"
            )))
        }
        self.create_secret(&session, &label, r_hex.as_bytes())
    }

    fn get_nonce_commitment(&self, request_id: &str) -> Result<Option<String>> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let Some(handle) = Self::find_secret(&session, &nonce_label(request_id))? else {
            return Ok(None)
        };
        if self.mode.is_production() {
            return Ok(Some("[PROTECTED - commitment exists but value is non-extractable]".to_string()))
        }
        let value = Self::read_value(&session, handle)?;
        Ok(Some(String::from_utf8_lossy(&value).to_string()))
    }

    fn list_used_nonces(&self) -> Result<Vec<String>> {
        let session = self.session.lock().expect("HSM session mutex poisoned");
        let template = vec![Attribute::Class(ObjectClass::SECRET_KEY)];
        let handles =
            session.find_objects(&template).map_err(|e| MpcError::HsmError(e.to_string()))?;
        let excluded = ["NONCE_MASTER_SEED", "NONCE_COUNTER", "NONCE_DERIV_"];
        let mut used = Vec::new();
        for handle in handles {
            let attrs = session
                .get_attributes(handle, &[AttributeType::Label])
                .map_err(|e| MpcError::HsmError(e.to_string()))?;
            let Some(Attribute::Label(label)) = attrs.into_iter().next() else { continue };
            let Ok(label) = String::from_utf8(label) else { continue };
            if let Some(request_id) = label.strip_prefix("NONCE_") {
                if excluded.iter().any(|p| label.starts_with(p)) {
                    continue
                }
                used.push(request_id.to_string());
            }
        }
        Ok(used)
    }
}
