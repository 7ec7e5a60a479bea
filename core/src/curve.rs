//! secp256k1 scalar/point arithmetic.
//!
//! `Scalar` and `Point` are newtypes over `secp256k1`'s `SecretKey`/`PublicKey`,
//! with `None` standing in for the additive identity (zero scalar / point at
//! infinity) since the underlying library has no representation for either.

use std::ops::{Add, Mul, Sub};

use num_bigint::BigUint;
use num_traits::identities::Zero;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{CURVE_ORDER, SECRET_KEY_SIZE},
    PublicKey, SecretKey, SECP256K1,
};
use zeroize::Zeroize;

use crate::error::{MpcError, Result};

/// The secp256k1 base point, compressed SEC1 encoding.
const GENERATOR_COMPRESSED: [u8; 33] = [
    0x02, 0x79, 0xBE, 0x66, 0x7E, 0xF9, 0xDC, 0xBB, 0xAC, 0x55, 0xA0, 0x62, 0x95, 0xCE, 0x87, 0x0B,
    0x07, 0x02, 0x9B, 0xFC, 0xDB, 0x2D, 0xCE, 0x28, 0xD9, 0x59, 0xF2, 0x81, 0x5B, 0x16, 0xF8, 0x17,
    0x98,
];

lazy_static::lazy_static! {
    static ref GROUP_ORDER: BigUint = BigUint::from_bytes_be(&CURVE_ORDER);
    static ref GENERATOR: Point = Point(Some(PublicKey::from_slice(&GENERATOR_COMPRESSED).unwrap()));
}

const ZERO_BYTES: [u8; 32] = [0; 32];

/// An element of Z/nZ for secp256k1's group order `n`. `None` is zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scalar(Option<SecretKey>);

impl Scalar {
    pub fn zero() -> Self {
        Scalar(None)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_none()
    }

    pub fn from_u64(x: u64) -> Self {
        if x == 0 {
            return Scalar(None)
        }
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&x.to_be_bytes());
        Scalar(Some(SecretKey::from_slice(&bytes).expect("u64 is within the group order")))
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        match &self.0 {
            Some(sk) => {
                let mut out = [0u8; 32];
                out.copy_from_slice(sk.as_ref());
                out
            },
            None => ZERO_BYTES,
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| MpcError::InvalidEncoding)?;
        if bytes.len() != 32 {
            return Err(MpcError::InvalidEncoding)
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(scalar_mod(&array))
    }

    fn from_reduced_bigint(x: &BigUint) -> Self {
        if x.is_zero() {
            return Scalar(None)
        }
        let x_bytes = x.to_bytes_be();
        let mut array = [0u8; SECRET_KEY_SIZE];
        array[SECRET_KEY_SIZE - x_bytes.len()..].copy_from_slice(&x_bytes);
        Scalar(Some(SecretKey::from_slice(&array).expect("reduced below group order")))
    }
}

impl Default for Scalar {
    fn default() -> Self {
        Scalar::zero()
    }
}

impl Zeroize for Scalar {
    fn zeroize(&mut self) {
        use core::sync::atomic;
        unsafe { std::ptr::write_volatile(self, Scalar::zero()) };
        atomic::compiler_fence(atomic::Ordering::SeqCst);
    }
}

impl Drop for Scalar {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl zeroize::ZeroizeOnDrop for Scalar {}

impl Add for &Scalar {
    type Output = Scalar;
    fn add(self, rhs: Self) -> Scalar {
        let inner = match (self.0, rhs.0) {
            (None, rhs) => rhs,
            (lhs, None) => lhs,
            (Some(lhs), Some(rhs)) => lhs.add_tweak(&rhs.into()).ok(),
        };
        Scalar(inner)
    }
}

impl Add for Scalar {
    type Output = Scalar;
    fn add(self, rhs: Self) -> Scalar {
        &self + &rhs
    }
}

impl Sub for &Scalar {
    type Output = Scalar;
    #[allow(clippy::suspicious_arithmetic_impl)]
    fn sub(self, rhs: Self) -> Scalar {
        match rhs.0 {
            None => self.clone(),
            Some(x) => self + &Scalar(Some(x.negate())),
        }
    }
}

impl Sub for Scalar {
    type Output = Scalar;
    fn sub(self, rhs: Self) -> Scalar {
        &self - &rhs
    }
}

impl Mul for &Scalar {
    type Output = Scalar;
    fn mul(self, rhs: Self) -> Scalar {
        let inner = match (self.0, rhs.0) {
            (None, _) | (_, None) => None,
            (Some(lhs), Some(rhs)) => Some(
                lhs.mul_tweak(&rhs.into())
                    .expect("product of two non-zero scalars is never zero mod prime order"),
            ),
        };
        Scalar(inner)
    }
}

impl Mul for Scalar {
    type Output = Scalar;
    fn mul(self, rhs: Self) -> Scalar {
        &self * &rhs
    }
}

impl std::iter::Sum for Scalar {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Scalar::zero(), |a, b| a + b)
    }
}

/// An element of the secp256k1 group, including the identity (point at
/// infinity), which `None` represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point(Option<PublicKey>);

impl Point {
    pub fn identity() -> Self {
        Point(None)
    }

    pub fn is_identity(&self) -> bool {
        self.0.is_none()
    }

    pub fn from_scalar(s: &Scalar) -> Self {
        point_mul(s, &GENERATOR)
    }

    pub fn generator() -> Self {
        *GENERATOR
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Self) -> Point {
        let inner = match (self.0, rhs.0) {
            (None, rhs) => rhs,
            (lhs, None) => lhs,
            (Some(lhs), Some(rhs)) => lhs.combine(&rhs).ok(),
        };
        Point(inner)
    }
}

impl std::iter::Sum for Point {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Point::identity(), |a, b| a + b)
    }
}

/// Uniform scalar in `[1, n)`; the curve layer never hands out a zero scalar
/// from `scalar_random` since a zero secret key is never a meaningful nonce
/// or polynomial coefficient.
pub fn scalar_random() -> Scalar {
    Scalar(Some(SecretKey::new(&mut OsRng)))
}

/// Reduce an arbitrary 32-byte big-endian integer modulo the group order.
pub fn scalar_mod(x: &[u8; 32]) -> Scalar {
    let mut x = BigUint::from_bytes_be(x);
    if x >= *GROUP_ORDER {
        x -= &*GROUP_ORDER;
    }
    Scalar::from_reduced_bigint(&x)
}

pub fn point_mul(k: &Scalar, p: &Point) -> Point {
    let inner = match (p.0, &k.0) {
        (None, _) | (_, None) => None,
        (Some(point), Some(scalar)) => {
            Some(point.mul_tweak(SECP256K1, &(*scalar).into()).expect("scalar is non-zero"))
        },
    };
    Point(inner)
}

pub fn point_add(p: &Point, q: &Point) -> Point {
    (*p) + (*q)
}

/// Compressed-hex encoding: `"00"` for the identity, else `"02"`/`"03"` plus
/// the 32-byte big-endian x-coordinate, matching the group's even/odd-y
/// parity of the compressed SEC1 encoding.
pub fn serialize_point(p: &Point) -> String {
    match p.0 {
        None => "00".to_string(),
        Some(pk) => hex::encode(pk.serialize()),
    }
}

pub fn deserialize_point(s: &str) -> Result<Point> {
    if s == "00" {
        return Ok(Point::identity())
    }
    let bytes = hex::decode(s).map_err(|_| MpcError::InvalidEncoding)?;
    if bytes.len() != 33 || (bytes[0] != 0x02 && bytes[0] != 0x03) {
        return Err(MpcError::InvalidEncoding)
    }
    PublicKey::from_slice(&bytes).map(|pk| Point(Some(pk))).map_err(|_| MpcError::InvalidEncoding)
}

/// Modular inverse of `a` mod `n` via Fermat's little theorem (`n` is prime).
/// Fails with `NotInvertible` when `a` is zero (the only non-invertible
/// residue mod a prime).
pub fn mod_inverse(a: &Scalar) -> Result<Scalar> {
    match &a.0 {
        None => Err(MpcError::NotInvertible),
        Some(sk) => {
            let x = BigUint::from_bytes_be(sk.as_ref());
            let order = &*GROUP_ORDER;
            let inverse = x.modpow(&(order - 2u32), order);
            Ok(Scalar::from_reduced_bigint(&inverse))
        },
    }
}
