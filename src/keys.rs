//! Pairwise Diffie-Hellman and the additive round keys derived from it.
//!
//! Participant `i` shares a seed `seed_ij` with every peer `j`. For each real
//! round it derives `k_ij = H(label, seed_ij, round, play)` and combines
//!
//! ```text
//! key_i = sum_{j > i} k_ij - sum_{j < i} k_ij
//! ```
//!
//! `play` counts the real rounds played so far, so a replayed round number
//! gets fresh keys.
//!
//! Every pairwise term enters the room-wide sum once with each sign, so the
//! keys of all participants add up to zero and blinding cancels.

use ark_ec::CurveGroup;
use ark_ff::PrimeField;
use ark_std::rand::{CryptoRng, RngCore};
use ark_std::{marker::PhantomData, UniformRand, Zero};
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::DcNetError;
use crate::group::GroupParameters;
use crate::p2p::messages::{CommandTag, DcNetMessage, ParticipantIndex};
use crate::p2p::traits::{RoomTransport, TransportError};
use crate::security::{constant_time_eq_bytes, SensitiveScalar};
use crate::session::SessionEvent;
use crate::utils::{from_bytes, hash_parts, hash_to_field, to_bytes};

const SEED_DOMAIN: &[u8] = b"dcnet-pairwise-seed-v1";
const CONFIRM_DOMAIN: &[u8] = b"dcnet-key-confirm-v1";
const ROUND_KEY_DOMAIN: &[u8] = b"dcnet-round-key-v1";

/// Stream label for slot blinding keys
const SLOT_LABEL: &[u8] = b"slot";
/// Stream label for commitment randomness blinding keys
const RANDOMNESS_LABEL: &[u8] = b"rand";

#[derive(Debug, thiserror::Error)]
pub enum KeyExchangeError {
    #[error("invalid key exchange parameters: {0}")]
    Parameters(#[from] DcNetError),

    #[error("no key share from peer {0}")]
    MissingShare(ParticipantIndex),

    #[error("malformed key share from peer {peer}: {reason}")]
    MalformedShare {
        peer: ParticipantIndex,
        reason: String,
    },

    #[error("peer {0} sent the identity as key share")]
    IdentityShare(ParticipantIndex),

    #[error("key confirmation with peer {0} failed")]
    ConfirmationMismatch(ParticipantIndex),

    #[error("unexpected {got:?} from peer {peer} during key exchange")]
    UnexpectedMessage {
        peer: ParticipantIndex,
        got: CommandTag,
    },

    #[error("transport failure during key exchange: {0}")]
    Transport(#[from] TransportError),
}

/// Who speaks first on a pairwise channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairRole {
    Initiator,
    Responder,
}

/// Lower index initiates, higher index responds.
pub fn pair_role(self_index: ParticipantIndex, peer: ParticipantIndex) -> PairRole {
    if self_index < peer {
        PairRole::Initiator
    } else {
        PairRole::Responder
    }
}

/// 64-byte secret shared by exactly two participants
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PairwiseSeed([u8; 64]);

impl PairwiseSeed {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PairwiseSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PairwiseSeed([REDACTED])")
    }
}

fn validate_room(self_index: ParticipantIndex, room_size: usize) -> Result<(), DcNetError> {
    if room_size < 2 {
        return Err(DcNetError::InvalidParameter(format!(
            "room needs at least 2 participants, got {}",
            room_size
        )));
    }
    if self_index == 0 || self_index > room_size {
        return Err(DcNetError::InvalidParameter(format!(
            "participant index {} outside 1..={}",
            self_index, room_size
        )));
    }
    Ok(())
}

/// One side of the pairwise Diffie-Hellman exchanges of a session.
///
/// Holds a fresh ephemeral exponent per peer; exponents are zeroized when the
/// exchange is finished or dropped.
pub struct KeyExchange<C: CurveGroup> {
    params: GroupParameters<C>,
    self_index: ParticipantIndex,
    room_size: usize,
    exponents: BTreeMap<ParticipantIndex, SensitiveScalar<C::ScalarField>>,
}

impl<C: CurveGroup> KeyExchange<C> {
    pub fn new<R: RngCore + CryptoRng>(
        params: GroupParameters<C>,
        self_index: ParticipantIndex,
        room_size: usize,
        rng: &mut R,
    ) -> Result<Self, KeyExchangeError> {
        validate_room(self_index, room_size)?;
        let exponents = (1..=room_size)
            .filter(|peer| *peer != self_index)
            .map(|peer| {
                let mut x = C::ScalarField::rand(rng);
                while x.is_zero() {
                    x = C::ScalarField::rand(rng);
                }
                (peer, SensitiveScalar::new(x))
            })
            .collect();

        Ok(Self {
            params,
            self_index,
            room_size,
            exponents,
        })
    }

    pub fn self_index(&self) -> ParticipantIndex {
        self.self_index
    }

    /// `x_peer * g` for the exponent reserved for `peer`
    pub fn public_share(&self, peer: ParticipantIndex) -> Result<C, KeyExchangeError> {
        let exponent = self.exponents.get(&peer).ok_or_else(|| {
            DcNetError::InvalidParameter(format!(
                "peer {} is not part of a room of {}",
                peer, self.room_size
            ))
        })?;
        Ok(self.params.g * exponent.expose_secret())
    }

    /// Decodes a share received off the wire, rejecting the identity.
    pub fn decode_share(peer: ParticipantIndex, bytes: &[u8]) -> Result<C, KeyExchangeError> {
        let share: C = from_bytes(bytes).map_err(|e| KeyExchangeError::MalformedShare {
            peer,
            reason: e.to_string(),
        })?;
        if share.is_zero() {
            return Err(KeyExchangeError::IdentityShare(peer));
        }
        Ok(share)
    }

    /// Combines our exponents with every peer's share into round key material.
    ///
    /// # Errors
    /// Fails if a share is missing or is the identity; the session must not
    /// continue with partial key material.
    pub fn finish(
        self,
        shares: &BTreeMap<ParticipantIndex, C>,
    ) -> Result<RoundKeyMaterial<C::ScalarField>, KeyExchangeError> {
        let mut seeds = BTreeMap::new();
        for (peer, exponent) in self.exponents.iter() {
            let share = shares
                .get(peer)
                .ok_or(KeyExchangeError::MissingShare(*peer))?;
            if share.is_zero() {
                return Err(KeyExchangeError::IdentityShare(*peer));
            }
            let shared = *share * exponent.expose_secret();
            let shared_bytes = to_bytes(&shared.into_affine())?;
            let low = self.self_index.min(*peer) as u64;
            let high = self.self_index.max(*peer) as u64;
            let seed = hash_parts(
                SEED_DOMAIN,
                &[shared_bytes.as_slice(), &low.to_le_bytes(), &high.to_le_bytes()],
            );
            seeds.insert(*peer, PairwiseSeed::from_bytes(seed));
        }
        Ok(RoundKeyMaterial::from_seeds(self.self_index, seeds))
    }
}

/// Per-session pairwise seeds of one participant.
pub struct RoundKeyMaterial<F: PrimeField> {
    self_index: ParticipantIndex,
    seeds: BTreeMap<ParticipantIndex, PairwiseSeed>,
    _field: PhantomData<F>,
}

impl<F: PrimeField> RoundKeyMaterial<F> {
    pub fn from_seeds(
        self_index: ParticipantIndex,
        seeds: BTreeMap<ParticipantIndex, PairwiseSeed>,
    ) -> Self {
        Self {
            self_index,
            seeds,
            _field: PhantomData,
        }
    }

    pub fn self_index(&self) -> ParticipantIndex {
        self.self_index
    }

    pub fn peer_count(&self) -> usize {
        self.seeds.len()
    }

    /// Additive key blinding the slot value of `round`, played as the
    /// `play`-th real round of the session.
    pub fn round_key(&self, round: u64, play: u64) -> F {
        self.combine(SLOT_LABEL, round, play)
    }

    /// Additive key blinding commitment randomness of `round`.
    pub fn randomness_key(&self, round: u64, play: u64) -> F {
        self.combine(RANDOMNESS_LABEL, round, play)
    }

    fn combine(&self, label: &[u8], round: u64, play: u64) -> F {
        self.seeds
            .iter()
            .fold(F::zero(), |acc, (peer, seed)| {
                let k: F = hash_to_field(
                    ROUND_KEY_DOMAIN,
                    &[label, seed.as_bytes(), &round.to_le_bytes(), &play.to_le_bytes()],
                );
                match pair_role(self.self_index, *peer) {
                    PairRole::Initiator => acc + k,
                    PairRole::Responder => acc - k,
                }
            })
    }

    /// Tag both ends of a pair compute from their shared seed.
    pub fn confirmation_tag(&self, peer: ParticipantIndex) -> Option<[u8; 64]> {
        self.seeds
            .get(&peer)
            .map(|seed| hash_parts(CONFIRM_DOMAIN, &[seed.as_bytes()]))
    }

    /// Checks a tag received from `peer` in constant time.
    pub fn confirm(&self, peer: ParticipantIndex, tag: &[u8]) -> Result<(), KeyExchangeError> {
        match self.confirmation_tag(peer) {
            Some(expected) if constant_time_eq_bytes(&expected, tag) => Ok(()),
            _ => Err(KeyExchangeError::ConfirmationMismatch(peer)),
        }
    }

    /// Runs the full exchange over the transport's pairwise channels.
    ///
    /// Peers are handled in ascending order; towards each one the lower index
    /// sends first. Shares are exchanged first, then confirmation tags.
    pub async fn establish<C, T, R>(
        params: GroupParameters<C>,
        transport: &T,
        events: Option<&UnboundedSender<SessionEvent>>,
        rng: &mut R,
    ) -> Result<Self, KeyExchangeError>
    where
        C: CurveGroup<ScalarField = F>,
        T: RoomTransport + ?Sized,
        R: RngCore + CryptoRng,
    {
        let me = transport.self_index();
        let exchange = KeyExchange::new(params, me, transport.room_size(), rng)?;
        let peers = transport.peers();

        let mut shares = BTreeMap::new();
        for (done, peer) in peers.iter().copied().enumerate() {
            let share = to_bytes(&exchange.public_share(peer)?.into_affine())?;
            let outgoing = DcNetMessage::KeyShare { sender: me, share };
            let incoming = match pair_role(me, peer) {
                PairRole::Initiator => {
                    transport.send_to(peer, outgoing).await?;
                    transport.recv_from(peer).await?
                }
                PairRole::Responder => {
                    let incoming = transport.recv_from(peer).await?;
                    transport.send_to(peer, outgoing).await?;
                    incoming
                }
            };
            let command = incoming.command();
            let DcNetMessage::KeyShare { share, .. } = incoming else {
                return Err(KeyExchangeError::UnexpectedMessage { peer, got: command });
            };
            shares.insert(peer, KeyExchange::<C>::decode_share(peer, &share)?);

            let remaining = peers.len() - done - 1;
            debug!("[{}] key share from {} ({} left)", me, peer, remaining);
            if let Some(events) = events {
                let _ = events.send(SessionEvent::ParticipantsRemaining(remaining));
            }
        }

        let material = exchange.finish(&shares)?;

        for peer in peers.iter().copied() {
            let tag = material
                .confirmation_tag(peer)
                .ok_or(KeyExchangeError::MissingShare(peer))?
                .to_vec();
            let outgoing = DcNetMessage::KeyConfirmation { sender: me, tag };
            let incoming = match pair_role(me, peer) {
                PairRole::Initiator => {
                    transport.send_to(peer, outgoing).await?;
                    transport.recv_from(peer).await?
                }
                PairRole::Responder => {
                    let incoming = transport.recv_from(peer).await?;
                    transport.send_to(peer, outgoing).await?;
                    incoming
                }
            };
            let command = incoming.command();
            let DcNetMessage::KeyConfirmation { tag, .. } = incoming else {
                return Err(KeyExchangeError::UnexpectedMessage { peer, got: command });
            };
            material.confirm(peer, &tag)?;
        }

        info!("[{}] pairwise keys confirmed with {} peers", me, peers.len());
        Ok(material)
    }
}

impl<F: PrimeField> std::fmt::Debug for RoundKeyMaterial<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundKeyMaterial")
            .field("self_index", &self.self_index)
            .field("peers", &self.seeds.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::memory::MemoryHub;
    use ark_bls12_381::{Fr, G1Projective as G1};
    use ark_std::rand::{rngs::StdRng, SeedableRng};
    use proptest::prelude::*;

    /// Runs every pairwise exchange of a room locally.
    fn local_room(n: usize, rng: &mut StdRng) -> Vec<RoundKeyMaterial<Fr>> {
        let params = GroupParameters::<G1>::new().unwrap();
        let exchanges: Vec<_> = (1..=n)
            .map(|i| KeyExchange::new(params.clone(), i, n, rng).unwrap())
            .collect();

        let shares: Vec<BTreeMap<usize, G1>> = (1..=n)
            .map(|i| {
                (1..=n)
                    .filter(|j| *j != i)
                    .map(|j| (j, exchanges[j - 1].public_share(i).unwrap()))
                    .collect()
            })
            .collect();

        exchanges
            .into_iter()
            .zip(shares.iter())
            .map(|(exchange, shares)| exchange.finish(shares).unwrap())
            .collect()
    }

    #[test]
    fn test_pair_role_is_symmetric() {
        assert_eq!(pair_role(1, 2), PairRole::Initiator);
        assert_eq!(pair_role(2, 1), PairRole::Responder);
        assert_eq!(pair_role(7, 3), PairRole::Responder);
    }

    #[test]
    fn test_round_keys_cancel() {
        let mut rng = StdRng::seed_from_u64(0);
        let room = local_room(5, &mut rng);
        for (round, play) in [(1u64, 1u64), (2, 2), (3, 2), (1, 3), (1000, 9)] {
            let sum: Fr = room.iter().map(|m| m.round_key(round, play)).sum();
            assert!(sum.is_zero());
            let sum: Fr = room.iter().map(|m| m.randomness_key(round, play)).sum();
            assert!(sum.is_zero());
        }
    }

    #[test]
    fn test_round_keys_differ_between_rounds_and_streams() {
        let mut rng = StdRng::seed_from_u64(0);
        let room = local_room(3, &mut rng);
        assert_ne!(room[0].round_key(1, 1), room[0].round_key(2, 1));
        assert_ne!(room[0].round_key(1, 1), room[0].randomness_key(1, 1));
    }

    #[test]
    fn test_replayed_round_gets_fresh_keys() {
        let mut rng = StdRng::seed_from_u64(0);
        let room = local_room(3, &mut rng);
        // round 1 replayed as the third real round
        assert_ne!(room[1].round_key(1, 1), room[1].round_key(1, 3));
        assert_ne!(room[1].randomness_key(1, 1), room[1].randomness_key(1, 3));
        let sum: Fr = room.iter().map(|m| m.round_key(1, 3)).sum();
        assert!(sum.is_zero());
    }

    #[test]
    fn test_confirmation_tags_match_across_pair() {
        let mut rng = StdRng::seed_from_u64(0);
        let room = local_room(3, &mut rng);
        let tag = room[0].confirmation_tag(3).unwrap();
        assert!(room[2].confirm(1, &tag).is_ok());
        assert!(matches!(
            room[1].confirm(1, &tag),
            Err(KeyExchangeError::ConfirmationMismatch(1))
        ));
    }

    #[test]
    fn test_finish_rejects_missing_and_identity_shares() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = GroupParameters::<G1>::new().unwrap();

        let exchange = KeyExchange::new(params.clone(), 1, 3, &mut rng).unwrap();
        let mut shares = BTreeMap::new();
        shares.insert(2, params.g);
        assert!(matches!(
            exchange.finish(&shares),
            Err(KeyExchangeError::MissingShare(3))
        ));

        let exchange = KeyExchange::new(params.clone(), 1, 3, &mut rng).unwrap();
        shares.insert(3, G1::zero());
        assert!(matches!(
            exchange.finish(&shares),
            Err(KeyExchangeError::IdentityShare(3))
        ));
    }

    #[test]
    fn test_decode_share_validation() {
        let identity = to_bytes(&G1::zero().into_affine()).unwrap();
        assert!(matches!(
            KeyExchange::<G1>::decode_share(2, &identity),
            Err(KeyExchangeError::IdentityShare(2))
        ));
        assert!(matches!(
            KeyExchange::<G1>::decode_share(2, &[1, 2, 3]),
            Err(KeyExchangeError::MalformedShare { peer: 2, .. })
        ));
    }

    #[test]
    fn test_invalid_room_parameters() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = GroupParameters::<G1>::new().unwrap();
        assert!(KeyExchange::new(params.clone(), 1, 1, &mut rng).is_err());
        assert!(KeyExchange::new(params.clone(), 0, 3, &mut rng).is_err());
        assert!(KeyExchange::new(params, 4, 3, &mut rng).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_seeds() {
        let seed = PairwiseSeed::from_bytes([0xAB; 64]);
        let rendered = format!("{:?}", seed);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }

    #[tokio::test]
    async fn test_establish_over_memory_transport() {
        let room = MemoryHub::room(3);
        let params = GroupParameters::<G1>::new().unwrap();
        let mut handles = Vec::new();
        for (seed, (transport, _source)) in room.into_iter().enumerate() {
            let params = params.clone();
            handles.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                RoundKeyMaterial::<Fr>::establish(params, &transport, None, &mut rng).await
            }));
        }

        let mut materials = Vec::new();
        for handle in handles {
            materials.push(handle.await.unwrap().unwrap());
        }
        let sum: Fr = materials.iter().map(|m| m.round_key(4, 2)).sum();
        assert!(sum.is_zero());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_diffie_hellman_keys_cancel(n in 2usize..=32, seed in any::<u64>(), round in any::<u64>(), play in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let room = local_room(n, &mut rng);
            let sum: Fr = room.iter().map(|m| m.round_key(round, play)).sum();
            prop_assert!(sum.is_zero());
        }
    }

    proptest! {
        #[test]
        fn prop_seeded_keys_cancel(n in 2usize..=32, seed in any::<u64>(), round in any::<u64>()) {
            // random symmetric seed matrix, no group arithmetic
            let mut rng = StdRng::seed_from_u64(seed);
            let mut matrix = vec![vec![[0u8; 64]; n + 1]; n + 1];
            for i in 1..=n {
                for j in (i + 1)..=n {
                    rng.fill_bytes(&mut matrix[i][j]);
                    matrix[j][i] = matrix[i][j];
                }
            }
            let sum: Fr = (1..=n)
                .map(|i| {
                    let seeds = (1..=n)
                        .filter(|j| *j != i)
                        .map(|j| (j, PairwiseSeed::from_bytes(matrix[i][j])))
                        .collect();
                    RoundKeyMaterial::<Fr>::from_seeds(i, seeds).round_key(round, 1)
                })
                .sum();
            prop_assert!(sum.is_zero());
        }
    }
}
