//! Pedersen commitments and a Fiat-Shamir proof of knowledge of the opening.
//!
//! `commit(x, r) = x*G + r*H`. To prove knowledge of `(x, r)` the prover picks
//! `y, s`, publishes `d = y*G + s*H`, derives
//! `e = H(d, G, H, c, peer)` and answers `u = e*x + y`, `v = e*r + s`.
//! A verifier accepts iff `u*G + v*H == d + e*c`.

use ark_ec::{AffineRepr, CurveGroup};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::{CryptoRng, RngCore};
use ark_std::UniformRand;
use rayon::prelude::*;

use crate::error::DcNetError;
use crate::group::GroupParameters;
use crate::p2p::messages::ParticipantIndex;
use crate::security::{constant_time_eq, SensitiveScalar};
use crate::utils::{hash_to_field, to_bytes};

const CHALLENGE_DOMAIN: &[u8] = b"dcnet-pok-challenge-v1";

/// Commitment to a scalar `x` with blinding `r`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, CanonicalSerialize, CanonicalDeserialize)]
pub struct Commitment<C: CurveGroup> {
    pub point: C::Affine,
}

/// Non-interactive proof of knowledge of a commitment opening, bound to the
/// prover's participant index
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct ProofOfKnowledge<C: CurveGroup> {
    pub d: C::Affine,
    pub u: C::ScalarField,
    pub v: C::ScalarField,
    pub peer: u64,
}

#[derive(Clone, Debug)]
pub struct PedersenCommitment<C: CurveGroup> {
    params: GroupParameters<C>,
}

impl<C: CurveGroup> PedersenCommitment<C> {
    pub fn new(params: GroupParameters<C>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &GroupParameters<C> {
        &self.params
    }

    pub fn commit(&self, x: &C::ScalarField, r: &C::ScalarField) -> Commitment<C> {
        Commitment {
            point: (self.params.g * x + self.params.h * r).into_affine(),
        }
    }

    /// Fiat-Shamir challenge over the compressed encodings of the transcript.
    fn challenge(
        &self,
        d: &C::Affine,
        commitment: &Commitment<C>,
        peer: u64,
    ) -> Result<C::ScalarField, DcNetError> {
        let d = to_bytes(d)?;
        let g = to_bytes(&self.params.g.into_affine())?;
        let h = to_bytes(&self.params.h.into_affine())?;
        let c = to_bytes(&commitment.point)?;
        Ok(hash_to_field(
            CHALLENGE_DOMAIN,
            &[d.as_slice(), g.as_slice(), h.as_slice(), c.as_slice(), &peer.to_le_bytes()],
        ))
    }

    /// Proves knowledge of `(x, r)` opening `commit(x, r)`.
    pub fn prove_knowledge<R: RngCore + CryptoRng>(
        &self,
        x: &C::ScalarField,
        r: &C::ScalarField,
        peer: ParticipantIndex,
        rng: &mut R,
    ) -> Result<ProofOfKnowledge<C>, DcNetError> {
        let commitment = self.commit(x, r);
        let y = SensitiveScalar::new(C::ScalarField::rand(rng));
        let s = SensitiveScalar::new(C::ScalarField::rand(rng));
        let d = (self.params.g * y.expose_secret() + self.params.h * s.expose_secret()).into_affine();

        let peer = peer as u64;
        let e = self.challenge(&d, &commitment, peer)?;
        Ok(ProofOfKnowledge {
            d,
            u: e * x + y.expose_secret(),
            v: e * r + s.expose_secret(),
            peer,
        })
    }

    /// Checks a proof against a commitment and the index it must be bound to.
    pub fn verify(
        &self,
        proof: &ProofOfKnowledge<C>,
        commitment: &Commitment<C>,
        peer: ParticipantIndex,
    ) -> bool {
        if proof.peer != peer as u64 {
            return false;
        }
        let Ok(e) = self.challenge(&proof.d, commitment, proof.peer) else {
            return false;
        };
        let lhs = self.params.g * proof.u + self.params.h * proof.v;
        let rhs = proof.d.into_group() + commitment.point.into_group() * e;
        constant_time_eq(&lhs.into_affine(), &rhs.into_affine())
    }

    /// Verifies many `(peer, commitment, proof)` triples in parallel.
    ///
    /// Returns the lowest peer index whose proof fails, if any.
    pub fn verify_all(
        &self,
        items: &[(ParticipantIndex, Commitment<C>, ProofOfKnowledge<C>)],
    ) -> Result<(), ParticipantIndex> {
        let failed = items
            .par_iter()
            .filter(|(peer, commitment, proof)| !self.verify(proof, commitment, *peer))
            .map(|(peer, _, _)| *peer)
            .min();
        match failed {
            Some(peer) => Err(peer),
            None => Ok(()),
        }
    }

    /// Homomorphic check `sum(c_i) == slot_sum*G + randomness_sum*H`.
    pub fn verify_aggregate<'a, I>(
        &self,
        commitments: I,
        slot_sum: &C::ScalarField,
        randomness_sum: &C::ScalarField,
    ) -> bool
    where
        I: IntoIterator<Item = &'a Commitment<C>>,
    {
        let total: C = commitments
            .into_iter()
            .map(|commitment| commitment.point.into_group())
            .sum();
        let expected = self.params.g * slot_sum + self.params.h * randomness_sum;
        constant_time_eq(&total.into_affine(), &expected.into_affine())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{from_bytes, u128_to_field};
    use ark_bls12_381::{Fr, G1Projective as G1};
    use ark_std::rand::{rngs::StdRng, SeedableRng};
    use ark_std::{One, Zero};
    use proptest::prelude::*;

    fn layer() -> PedersenCommitment<G1> {
        PedersenCommitment::new(GroupParameters::new().unwrap())
    }

    #[test]
    fn test_proof_verifies() {
        let mut rng = StdRng::seed_from_u64(0);
        let pc = layer();
        let x = Fr::from(42u64);
        let r = Fr::rand(&mut rng);
        let c = pc.commit(&x, &r);
        let proof = pc.prove_knowledge(&x, &r, 3, &mut rng).unwrap();
        assert!(pc.verify(&proof, &c, 3));
    }

    #[test]
    fn test_tampered_proofs_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let pc = layer();
        let x = Fr::from(7u64);
        let r = Fr::rand(&mut rng);
        let c = pc.commit(&x, &r);
        let proof = pc.prove_knowledge(&x, &r, 2, &mut rng).unwrap();

        let mut bad = proof.clone();
        bad.d = (bad.d.into_group() + pc.params().g).into_affine();
        assert!(!pc.verify(&bad, &c, 2));

        let mut bad = proof.clone();
        bad.u += Fr::one();
        assert!(!pc.verify(&bad, &c, 2));

        let mut bad = proof.clone();
        bad.v += Fr::one();
        assert!(!pc.verify(&bad, &c, 2));

        // index binding: same proof presented for another peer
        assert!(!pc.verify(&proof, &c, 1));
        let mut bad = proof.clone();
        bad.peer = 1;
        assert!(!pc.verify(&bad, &c, 1));

        // different commitment
        let other = pc.commit(&Fr::from(8u64), &r);
        assert!(!pc.verify(&proof, &other, 2));
    }

    #[test]
    fn test_commitment_is_hiding_and_binding_shape() {
        let mut rng = ark_std::test_rng();
        let pc = layer();
        let x = Fr::from(5u64);
        let a = pc.commit(&x, &Fr::rand(&mut rng));
        let b = pc.commit(&x, &Fr::rand(&mut rng));
        assert_ne!(a, b);
        assert_eq!(pc.commit(&Fr::zero(), &Fr::zero()).point, G1::zero().into_affine());
    }

    #[test]
    fn test_aggregate_check_with_blinded_randomness() {
        let mut rng = ark_std::test_rng();
        let pc = layer();
        let xs = [Fr::from(0u64), Fr::from(21u64), Fr::from(9u64)];
        let rs: Vec<Fr> = (0..3).map(|_| Fr::rand(&mut rng)).collect();
        let commitments: Vec<_> = xs.iter().zip(&rs).map(|(x, r)| pc.commit(x, r)).collect();

        // blinding keys that cancel across the room
        let k1 = Fr::rand(&mut rng);
        let k2 = Fr::rand(&mut rng);
        let keys = [k1, k2, -(k1 + k2)];
        let randomness_sum: Fr = rs.iter().zip(&keys).map(|(r, k)| *r + k).sum();
        let slot_sum: Fr = xs.iter().sum();

        assert!(pc.verify_aggregate(&commitments, &slot_sum, &randomness_sum));
        assert!(!pc.verify_aggregate(&commitments, &(slot_sum + Fr::one()), &randomness_sum));
    }

    #[test]
    fn test_verify_all_reports_lowest_failing_peer() {
        let mut rng = StdRng::seed_from_u64(0);
        let pc = layer();
        let mut items = Vec::new();
        for peer in 1..=4usize {
            let x = Fr::from(peer as u64);
            let r = Fr::rand(&mut rng);
            let proof = pc.prove_knowledge(&x, &r, peer, &mut rng).unwrap();
            items.push((peer, pc.commit(&x, &r), proof));
        }
        assert_eq!(pc.verify_all(&items), Ok(()));

        items[3].2.u += Fr::one();
        items[2].2.v += Fr::one();
        assert_eq!(pc.verify_all(&items), Err(3));
    }

    #[test]
    fn test_proof_survives_serialization() {
        let mut rng = StdRng::seed_from_u64(0);
        let pc = layer();
        let x = Fr::from(11u64);
        let r = Fr::rand(&mut rng);
        let proof = pc.prove_knowledge(&x, &r, 5, &mut rng).unwrap();
        let decoded: ProofOfKnowledge<G1> = from_bytes(&to_bytes(&proof).unwrap()).unwrap();
        let c: Commitment<G1> = from_bytes(&to_bytes(&pc.commit(&x, &r)).unwrap()).unwrap();
        assert!(pc.verify(&decoded, &c, 5));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_proof_completeness(x in any::<u128>(), seed in any::<u64>(), peer in 1usize..=1024) {
            let mut rng = StdRng::seed_from_u64(seed);
            let pc = layer();
            let x: Fr = u128_to_field(x);
            let r = Fr::rand(&mut rng);
            let proof = pc.prove_knowledge(&x, &r, peer, &mut rng).unwrap();
            prop_assert!(pc.verify(&proof, &pc.commit(&x, &r), peer));
        }
    }
}
