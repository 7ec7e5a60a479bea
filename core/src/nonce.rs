//! The HSM-anchored, counter-based nonce derivation formula.
//!
//! The formula itself is pure: given a post-increment counter value and the
//! 64-byte `HMAC-SHA512(master_seed, input)` digest, reduce the first 32
//! bytes mod `n` to get the nonce scalar `k`. Computing that digest is an
//! `Hsm` facade concern (production implementations sign with the
//! sensitive master-seed object in place via `CKM_SHA512_HMAC`, never
//! extracting it; demo implementations may extract and compute in
//! software).

use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroize;

use crate::{
    curve::{self, Point, Scalar},
    error::{MpcError, Result},
};

type HmacSha512 = Hmac<Sha512>;

/// A domain-separation byte prepended to every derivation input, so this
/// construction can never collide with some other future use of the same
/// master seed.
pub const DOMAIN_PREFIX: u8 = 0x00;

/// `0x00 || counter (8 bytes BE) || utf8(request_id) || message_hash`.
pub fn derivation_input(counter: u64, request_id: &str, message_hash: &[u8; 32]) -> Vec<u8> {
    let mut input = Vec::with_capacity(1 + 8 + request_id.len() + 32);
    input.push(DOMAIN_PREFIX);
    input.extend_from_slice(&counter.to_be_bytes());
    input.extend_from_slice(request_id.as_bytes());
    input.extend_from_slice(message_hash);
    input
}

/// Software HMAC-SHA512, used by demo-mode HSM facades that extract the
/// master seed rather than signing with it in place.
pub fn hmac_sha512(master_seed: &[u8; 32], input: &[u8]) -> [u8; 64] {
    let mut mac = HmacSha512::new_from_slice(master_seed).expect("HMAC accepts any key length");
    mac.update(input);
    let out = mac.finalize().into_bytes();
    let mut result = [0u8; 64];
    result.copy_from_slice(&out);
    result
}

#[derive(Zeroize)]
#[zeroize(drop)]
pub struct NonceDerivation {
    pub counter: u64,
    pub k: Scalar,
    #[zeroize(skip)]
    pub r_hex: String,
    #[zeroize(skip)]
    pub request_id: String,
    #[zeroize(skip)]
    pub message_hash_hex: String,
}

/// Reduce an HMAC-SHA512 digest to the nonce scalar and its public
/// commitment. Fails with `DerivationZero` on the ~2⁻²⁵⁶-probability event
/// that the reduction yields zero.
pub fn reduce_digest_to_nonce(
    counter: u64,
    digest: &[u8; 64],
    request_id: &str,
    message_hash: &[u8; 32],
) -> Result<NonceDerivation> {
    let mut first32 = [0u8; 32];
    first32.copy_from_slice(&digest[..32]);
    let k = curve::scalar_mod(&first32);
    if k.is_zero() {
        return Err(MpcError::DerivationZero)
    }
    let r = Point::from_scalar(&k);
    Ok(NonceDerivation {
        counter,
        k,
        r_hex: curve::serialize_point(&r),
        request_id: request_id.to_string(),
        message_hash_hex: hex::encode(message_hash),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_given_same_inputs() {
        let seed = [9u8; 32];
        let message_hash = [1u8; 32];
        let input = derivation_input(3, "req-1", &message_hash);
        let digest_a = hmac_sha512(&seed, &input);
        let digest_b = hmac_sha512(&seed, &input);
        assert_eq!(digest_a, digest_b);

        let out_a = reduce_digest_to_nonce(3, &digest_a, "req-1", &message_hash).unwrap();
        let out_b = reduce_digest_to_nonce(3, &digest_b, "req-1", &message_hash).unwrap();
        assert_eq!(out_a.r_hex, out_b.r_hex);
    }

    #[test]
    fn different_counters_yield_different_nonces() {
        let seed = [9u8; 32];
        let message_hash = [1u8; 32];
        let digest1 = hmac_sha512(&seed, &derivation_input(1, "req-1", &message_hash));
        let digest2 = hmac_sha512(&seed, &derivation_input(2, "req-1", &message_hash));
        let out1 = reduce_digest_to_nonce(1, &digest1, "req-1", &message_hash).unwrap();
        let out2 = reduce_digest_to_nonce(2, &digest2, "req-1", &message_hash).unwrap();
        assert_ne!(out1.r_hex, out2.r_hex);
    }
}
