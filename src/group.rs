//! Group parameters shared by the pairwise key exchange and the commitment layer.
//!
//! `g` is the curve generator. `h` is a second generator obtained by
//! hash-and-increment from a public domain label, so its discrete logarithm
//! relative to `g` is unknown to every participant (required for Pedersen
//! binding).

use ark_ec::{AffineRepr, CurveGroup, PrimeGroup};

use crate::error::DcNetError;
use crate::utils::hash_parts;

/// Domain label used to derive the independent generator `h`.
pub const H_GENERATOR_DOMAIN: &[u8] = b"dcnet-pedersen-h-v1";

/// Upper bound on hash-and-increment attempts; each attempt succeeds with
/// probability close to 1/2.
const MAX_GENERATOR_ATTEMPTS: u32 = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupParameters<C: CurveGroup> {
    pub g: C,
    pub h: C,
}

impl<C: CurveGroup> GroupParameters<C> {
    /// Parameters with the crate's fixed domain label. Every participant of a
    /// room must use the same parameters.
    pub fn new() -> Result<Self, DcNetError> {
        Self::with_domain(H_GENERATOR_DOMAIN)
    }

    /// Derives `h` from a caller-provided domain label.
    ///
    /// # Errors
    /// Returns an error if no valid point was found within the attempt budget.
    pub fn with_domain(domain: &[u8]) -> Result<Self, DcNetError> {
        let g = C::generator();
        for counter in 0..MAX_GENERATOR_ATTEMPTS {
            let bytes = hash_parts(domain, &[&counter.to_le_bytes()]);
            let Some(candidate) = C::Affine::from_random_bytes(&bytes) else {
                continue;
            };
            // land in the prime-order subgroup
            let candidate = candidate.clear_cofactor();
            if candidate.is_zero() {
                continue;
            }
            let h = candidate.into_group();
            if h == g {
                continue;
            }
            return Ok(Self { g, h });
        }

        Err(DcNetError::InvalidParameter(format!(
            "no generator found for domain {} after {} attempts",
            hex::encode(domain),
            MAX_GENERATOR_ATTEMPTS
        )))
    }
}
