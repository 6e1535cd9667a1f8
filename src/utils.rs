use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use blake2::{Blake2b512, Digest};

use crate::error::DcNetError;

/// Lifts an integer slot value into the scalar field.
pub fn u128_to_field<F: PrimeField>(value: u128) -> F {
    F::from(value)
}

/// Lowers a field element back to an integer.
///
/// Returns `None` when the canonical representative does not fit in 128 bits,
/// which for an aggregate of honest slot values never happens.
pub fn field_to_u128<F: PrimeField>(value: &F) -> Option<u128> {
    let repr = value.into_bigint();
    let limbs: &[u64] = repr.as_ref();
    if limbs.iter().skip(2).any(|limb| *limb != 0) {
        return None;
    }
    let low = limbs.first().copied().unwrap_or(0) as u128;
    let high = limbs.get(1).copied().unwrap_or(0) as u128;
    Some(low | (high << 64))
}

/// Hashes length-prefixed parts under a domain label and reduces the
/// Blake2b-512 digest modulo the field order.
pub fn hash_to_field<F: PrimeField>(domain: &[u8], parts: &[&[u8]]) -> F {
    let digest = hash_parts(domain, parts);
    F::from_le_bytes_mod_order(&digest)
}

/// Blake2b-512 over a domain label and length-prefixed parts.
pub fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Compressed canonical encoding of an arkworks value.
pub fn to_bytes<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>, DcNetError> {
    let mut bytes = Vec::with_capacity(value.compressed_size());
    value.serialize_compressed(&mut bytes)?;
    Ok(bytes)
}

/// Decodes (and validates) a compressed canonical encoding.
pub fn from_bytes<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T, DcNetError> {
    Ok(T::deserialize_compressed(bytes)?)
}
