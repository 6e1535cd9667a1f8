//! Security utilities for protecting sensitive protocol data
//!
//! This module provides:
//! - A zeroizing wrapper for secret scalars (ephemeral DH exponents)
//! - Constant-time comparison of encoded group elements and byte tags
//! - An OS-seeded CSPRNG usable wherever arkworks expects an RNG

use ark_ff::Field;
use ark_serialize::CanonicalSerialize;
use ark_std::rand::{CryptoRng, RngCore};
use ark_std::vec::Vec;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Wrapper for sensitive scalar field elements that ensures zeroization on drop
///
/// # Security
/// - Automatically zeroizes memory when dropped
/// - Prevents accidental leakage through Debug trait
#[derive(Clone)]
pub struct SensitiveScalar<F: Field> {
    value: F,
}

impl<F: Field> SensitiveScalar<F> {
    /// Create a new sensitive scalar from a field element
    pub fn new(value: F) -> Self {
        Self { value }
    }

    /// Get a reference to the inner value
    ///
    /// # Security Warning
    /// The caller must ensure this reference is not used to leak the value
    pub fn expose_secret(&self) -> &F {
        &self.value
    }
}

impl<F: Field> Zeroize for SensitiveScalar<F> {
    fn zeroize(&mut self) {
        // arkworks field elements don't expose their limbs, so overwrite with zero
        self.value = F::zero();
    }
}

impl<F: Field> ZeroizeOnDrop for SensitiveScalar<F> {}

impl<F: Field> Drop for SensitiveScalar<F> {
    fn drop(&mut self) {
        self.zeroize();
    }
}

// Prevent debug output from leaking sensitive data
impl<F: Field> std::fmt::Debug for SensitiveScalar<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SensitiveScalar([REDACTED])")
    }
}

/// Constant-time equality for any canonically serializable value
/// (group elements, field elements)
///
/// # Security Note
/// The group arithmetic producing `a` and `b` is not guaranteed to be
/// constant-time; only the final comparison is.
pub fn constant_time_eq<T: CanonicalSerialize>(a: &T, b: &T) -> bool {
    let mut a_bytes = Vec::new();
    let mut b_bytes = Vec::new();

    // If serialization fails, treat as not equal
    if a.serialize_compressed(&mut a_bytes).is_err() {
        return false;
    }
    if b.serialize_compressed(&mut b_bytes).is_err() {
        return false;
    }

    constant_time_eq_bytes(&a_bytes, &b_bytes)
}

/// Constant-time byte slice comparison
///
/// Length is not secret and is compared first.
pub fn constant_time_eq_bytes(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

/// ChaCha-based RNG seeded from the operating system
///
/// Bridges `rand`'s thread RNG into the `RngCore` version arkworks uses.
pub struct SessionRng {
    inner: rand::rngs::StdRng,
}

impl SessionRng {
    pub fn from_entropy() -> Self {
        use rand::{RngCore as _, SeedableRng};
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let inner = rand::rngs::StdRng::from_seed(seed);
        seed.zeroize();
        SessionRng { inner }
    }
}

impl RngCore for SessionRng {
    fn next_u32(&mut self) -> u32 {
        <rand::rngs::StdRng as rand::RngCore>::next_u32(&mut self.inner)
    }

    fn next_u64(&mut self) -> u64 {
        <rand::rngs::StdRng as rand::RngCore>::next_u64(&mut self.inner)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        <rand::rngs::StdRng as rand::RngCore>::fill_bytes(&mut self.inner, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), ark_std::rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for SessionRng {}

impl std::fmt::Debug for SessionRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionRng([REDACTED])")
    }
}
