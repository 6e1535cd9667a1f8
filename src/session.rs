//! One participant's run of an anonymous broadcast session.
//!
//! The session task establishes pairwise keys, then drives the scheduler
//! round by round. For a real round it synchronizes with every peer, broadcasts
//! its blinded (and optionally attested) slot and sums the room's
//! contributions, which the receive task collects. Virtual rounds need no
//! network at all.

use ark_ec::CurveGroup;
use ark_std::rand::{CryptoRng, RngCore};
use ark_std::{UniformRand, Zero};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::commitment::{Commitment, PedersenCommitment, ProofOfKnowledge};
use crate::error::DcNetError;
use crate::group::GroupParameters;
use crate::keys::{KeyExchangeError, RoundKeyMaterial};
use crate::p2p::messages::{Attestation, DcNetMessage, ParticipantIndex, RoundContribution};
use crate::p2p::traits::{BroadcastSource, RoomTransport, TransportError};
use crate::receiver::{ReceiverError, ReceiverHandle};
use crate::room::Room;
use crate::scheduler::{
    RoundOutcome, Scheduled, SchedulerError, SchedulerState, DEFAULT_MAX_RETRIES,
};
use crate::security::SensitiveScalar;
use crate::slot::{SlotEncoder, SlotValue};
use crate::utils::{field_to_u128, from_bytes, to_bytes, u128_to_field};

/// Default capacity of the session/receive task channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This participant's index, `1..=room.size()`
    pub self_index: ParticipantIndex,
    pub room: Room,
    /// Message to broadcast anonymously; `0` stays silent
    pub message: u64,
    /// Commit to and prove every contribution
    pub attest_contributions: bool,
    /// Non-split retries tolerated per round before giving up
    pub max_retries: u32,
    pub channel_capacity: usize,
}

impl SessionConfig {
    pub fn new(self_index: ParticipantIndex, room: Room, message: u64) -> Self {
        Self {
            self_index,
            room,
            message,
            attest_contributions: true,
            max_retries: DEFAULT_MAX_RETRIES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

pub fn validate_config(config: &SessionConfig) -> Result<(), DcNetError> {
    if !config.room.contains(config.self_index) {
        return Err(DcNetError::InvalidParameter(format!(
            "self index {} outside room of {}",
            config.self_index,
            config.room.size()
        )));
    }
    if config.max_retries == 0 {
        return Err(DcNetError::InvalidParameter(
            "max_retries must be at least 1".to_string(),
        ));
    }
    if config.channel_capacity == 0 {
        return Err(DcNetError::InvalidParameter(
            "channel_capacity must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Why a round's contributions were rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisruptionKind {
    UnknownSender,
    DuplicateContribution,
    MissingContribution,
    MalformedContribution,
    MissingAttestation,
    InvalidProof,
    ReplayedCommitment,
    /// Commitments do not add up to the announced sums
    AggregateMismatch,
    /// The unblinded sum is not a possible slot aggregate
    AggregateOutOfRange,
}

impl fmt::Display for DisruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisruptionKind::UnknownSender => "contribution from outside the room",
            DisruptionKind::DuplicateContribution => "more than one contribution",
            DisruptionKind::MissingContribution => "no contribution",
            DisruptionKind::MalformedContribution => "undecodable contribution",
            DisruptionKind::MissingAttestation => "contribution without attestation",
            DisruptionKind::InvalidProof => "proof of knowledge does not verify",
            DisruptionKind::ReplayedCommitment => "commitment replayed",
            DisruptionKind::AggregateMismatch => "commitments inconsistent with aggregate",
            DisruptionKind::AggregateOutOfRange => "aggregate outside the slot range",
        };
        f.write_str(text)
    }
}

/// Progress notifications, consumed through `ParticipantSession::events`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Peers still missing from the key exchange
    ParticipantsRemaining(usize),
    KeysEstablished {
        peers: usize,
    },
    RoundPlayed {
        round: u64,
        real: bool,
        outcome: RoundOutcome,
    },
    MessageResolved {
        round: u64,
        message: u64,
    },
    DisruptionDetected {
        round: u64,
        peer: Option<ParticipantIndex>,
        kind: DisruptionKind,
    },
    Finished {
        total_rounds: u64,
        real_rounds: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] DcNetError),

    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("scheduler invariant violated: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("receive task error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("disruption in round {round} (peer {peer:?}): {kind}")]
    Disruption {
        round: u64,
        peer: Option<ParticipantIndex>,
        kind: DisruptionKind,
    },
}

/// Result of a completed session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Every resolved message, in resolution order
    pub messages: Vec<u64>,
    pub total_rounds: u64,
    pub real_rounds: u64,
    /// Round count at which the own message was confirmed, if any was sent
    pub own_message_round: Option<u64>,
}

/// A session that terminated on a fatal error
#[derive(Debug, thiserror::Error)]
#[error("session failed after {rounds_reached} rounds ({} resolved): {error}", .resolved.len())]
pub struct SessionFailure {
    #[source]
    pub error: SessionError,
    pub rounds_reached: u64,
    pub resolved: Vec<u64>,
}

pub struct ParticipantSession<C: CurveGroup> {
    config: SessionConfig,
    encoder: SlotEncoder,
    pedersen: PedersenCommitment<C>,
    session_id: String,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    seen_commitments: HashSet<Vec<u8>>,
}

impl<C: CurveGroup> ParticipantSession<C> {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        validate_config(&config)?;
        let encoder = SlotEncoder::new(config.room.size())?;
        let pedersen = PedersenCommitment::new(GroupParameters::new()?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id: [u8; 8] = rand::random();

        Ok(Self {
            config,
            encoder,
            pedersen,
            session_id: hex::encode(id),
            events_tx,
            events_rx: Some(events_rx),
            seen_commitments: HashSet::new(),
        })
    }

    /// Takes the event stream; returns `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs the session to completion. Consumes the session: key material and
    /// commitments are never reused across runs.
    pub async fn run<T, S, R>(
        mut self,
        transport: &T,
        source: S,
        rng: &mut R,
    ) -> Result<SessionReport, SessionFailure>
    where
        T: RoomTransport + ?Sized,
        S: BroadcastSource + 'static,
        R: RngCore + CryptoRng + Send,
    {
        let me = self.config.self_index;
        let mut scheduler = SchedulerState::new(
            self.encoder,
            self.config.room.policy(),
            self.config.message,
            self.config.max_retries,
        );
        info!(
            "[{}] session {} starting in a room of {} ({:?})",
            me,
            self.session_id,
            self.config.room.size(),
            self.config.room.policy()
        );

        match self.drive(transport, source, &mut scheduler, rng).await {
            Ok(()) => {
                let report = SessionReport {
                    messages: scheduler.resolved().to_vec(),
                    total_rounds: scheduler.total_rounds(),
                    real_rounds: scheduler.real_rounds(),
                    own_message_round: scheduler.own_message_round(),
                };
                self.emit(SessionEvent::Finished {
                    total_rounds: report.total_rounds,
                    real_rounds: report.real_rounds,
                });
                info!(
                    "[{}] session {} finished: {} messages in {} rounds ({} real)",
                    me,
                    self.session_id,
                    report.messages.len(),
                    report.total_rounds,
                    report.real_rounds
                );
                Ok(report)
            }
            Err(error) => {
                error!(
                    "[{}] session {} aborted after {} rounds: {}",
                    me,
                    self.session_id,
                    scheduler.total_rounds(),
                    error
                );
                Err(SessionFailure {
                    error,
                    rounds_reached: scheduler.total_rounds(),
                    resolved: scheduler.resolved().to_vec(),
                })
            }
        }
    }

    async fn drive<T, S, R>(
        &mut self,
        transport: &T,
        source: S,
        scheduler: &mut SchedulerState,
        rng: &mut R,
    ) -> Result<(), SessionError>
    where
        T: RoomTransport + ?Sized,
        S: BroadcastSource + 'static,
        R: RngCore + CryptoRng + Send,
    {
        if transport.self_index() != self.config.self_index
            || transport.room_size() != self.config.room.size()
        {
            return Err(DcNetError::InvalidParameter(format!(
                "transport is participant {} of {}, session expects {} of {}",
                transport.self_index(),
                transport.room_size(),
                self.config.self_index,
                self.config.room.size()
            ))
            .into());
        }

        let keys: RoundKeyMaterial<C::ScalarField> = RoundKeyMaterial::establish(
            self.pedersen.params().clone(),
            transport,
            Some(&self.events_tx),
            rng,
        )
        .await?;
        self.emit(SessionEvent::KeysEstablished {
            peers: keys.peer_count(),
        });

        let mut receiver = ReceiverHandle::spawn(
            source,
            self.config.room.size(),
            self.config.channel_capacity,
        );
        let played = self
            .play_rounds(transport, &mut receiver, &keys, scheduler, rng)
            .await;
        match played {
            Ok(()) => Ok(receiver.shutdown().await?),
            Err(err) => {
                // may be blocked on a round that will never complete
                receiver.abort();
                Err(err)
            }
        }
    }

    async fn play_rounds<T, R>(
        &mut self,
        transport: &T,
        receiver: &mut ReceiverHandle,
        keys: &RoundKeyMaterial<C::ScalarField>,
        scheduler: &mut SchedulerState,
        rng: &mut R,
    ) -> Result<(), SessionError>
    where
        T: RoomTransport + ?Sized,
        R: RngCore + CryptoRng + Send,
    {
        loop {
            match scheduler.next_round(rng)? {
                Scheduled::Finished => return Ok(()),
                Scheduled::Virtual {
                    round,
                    aggregate,
                    outcome,
                } => {
                    receiver.skip(round).await?;
                    debug!(
                        "[{}] virtual round {} reconstructed as {}",
                        self.config.self_index, round, aggregate
                    );
                    self.report_round(round, false, outcome);
                }
                Scheduled::Real { round, slot } => {
                    receiver.request(round).await?;
                    transport.barrier(round).await?;

                    let play = scheduler.real_rounds();
                    let contribution = self.build_contribution(round, play, slot, keys, rng)?;
                    transport
                        .broadcast(DcNetMessage::Contribution(contribution))
                        .await?;

                    let contributions = receiver.collect(round).await?;
                    let aggregate = self.aggregate(round, contributions)?;
                    let outcome = scheduler.complete_real_round(round, aggregate, rng)?;
                    self.report_round(round, true, outcome);
                }
            }
        }
    }

    fn build_contribution<R: RngCore + CryptoRng>(
        &self,
        round: u64,
        play: u64,
        slot: SlotValue,
        keys: &RoundKeyMaterial<C::ScalarField>,
        rng: &mut R,
    ) -> Result<RoundContribution, SessionError> {
        let me = self.config.self_index;
        let value: C::ScalarField = u128_to_field(slot);
        let blinded = value + keys.round_key(round, play);

        let attestation = if self.config.attest_contributions {
            let rho = SensitiveScalar::new(C::ScalarField::rand(rng));
            let commitment = self.pedersen.commit(&value, rho.expose_secret());
            let proof = self
                .pedersen
                .prove_knowledge(&value, rho.expose_secret(), me, rng)?;
            let blinded_randomness = *rho.expose_secret() + keys.randomness_key(round, play);
            Some(Attestation {
                commitment: to_bytes(&commitment)?,
                proof: to_bytes(&proof)?,
                blinded_randomness: to_bytes(&blinded_randomness)?,
            })
        } else {
            None
        };

        Ok(RoundContribution {
            sender: me,
            round,
            blinded_slot: to_bytes(&blinded)?,
            attestation,
        })
    }

    /// Checks a round's contributions and unblinds their sum.
    fn aggregate(
        &mut self,
        round: u64,
        contributions: Vec<RoundContribution>,
    ) -> Result<SlotValue, SessionError> {
        let mut by_sender = BTreeMap::new();
        for contribution in contributions {
            let sender = contribution.sender;
            if !self.config.room.contains(sender) {
                return Err(self.disruption(round, Some(sender), DisruptionKind::UnknownSender));
            }
            if by_sender.insert(sender, contribution).is_some() {
                return Err(self.disruption(
                    round,
                    Some(sender),
                    DisruptionKind::DuplicateContribution,
                ));
            }
        }
        if let Some(missing) = (1..=self.config.room.size()).find(|i| !by_sender.contains_key(i)) {
            return Err(self.disruption(round, Some(missing), DisruptionKind::MissingContribution));
        }

        let mut slot_sum = C::ScalarField::zero();
        for (sender, contribution) in &by_sender {
            let blinded: C::ScalarField = from_bytes(&contribution.blinded_slot).map_err(|_| {
                self.disruption(round, Some(*sender), DisruptionKind::MalformedContribution)
            })?;
            slot_sum += blinded;
        }

        if self.config.attest_contributions {
            self.check_attestations(round, &by_sender, &slot_sum)?;
        }

        let aggregate = field_to_u128(&slot_sum)
            .ok_or_else(|| self.disruption(round, None, DisruptionKind::AggregateOutOfRange))?;
        self.encoder
            .check_aggregate(aggregate)
            .map_err(|_| self.disruption(round, None, DisruptionKind::AggregateOutOfRange))?;
        Ok(aggregate)
    }

    fn check_attestations(
        &mut self,
        round: u64,
        by_sender: &BTreeMap<ParticipantIndex, RoundContribution>,
        slot_sum: &C::ScalarField,
    ) -> Result<(), SessionError> {
        let mut items: Vec<(ParticipantIndex, Commitment<C>, ProofOfKnowledge<C>)> =
            Vec::with_capacity(by_sender.len());
        let mut randomness_sum = C::ScalarField::zero();

        for (sender, contribution) in by_sender {
            let sender = *sender;
            let Some(attestation) = &contribution.attestation else {
                return Err(self.disruption(round, Some(sender), DisruptionKind::MissingAttestation));
            };
            if !self.seen_commitments.insert(attestation.commitment.clone()) {
                return Err(self.disruption(round, Some(sender), DisruptionKind::ReplayedCommitment));
            }

            let malformed = |_| self.disruption(round, Some(sender), DisruptionKind::MalformedContribution);
            let commitment: Commitment<C> = from_bytes(&attestation.commitment).map_err(malformed)?;
            let proof: ProofOfKnowledge<C> = from_bytes(&attestation.proof).map_err(malformed)?;
            let blinded_randomness: C::ScalarField =
                from_bytes(&attestation.blinded_randomness).map_err(malformed)?;

            randomness_sum += blinded_randomness;
            items.push((sender, commitment, proof));
        }

        self.pedersen
            .verify_all(&items)
            .map_err(|peer| self.disruption(round, Some(peer), DisruptionKind::InvalidProof))?;

        let commitments = items.iter().map(|(_, commitment, _)| commitment);
        if !self
            .pedersen
            .verify_aggregate(commitments, slot_sum, &randomness_sum)
        {
            return Err(self.disruption(round, None, DisruptionKind::AggregateMismatch));
        }
        Ok(())
    }

    fn report_round(&self, round: u64, real: bool, outcome: RoundOutcome) {
        info!(
            "[{}] round {} ({}): {:?}",
            self.config.self_index,
            round,
            if real { "real" } else { "virtual" },
            outcome
        );
        self.emit(SessionEvent::RoundPlayed {
            round,
            real,
            outcome,
        });
        if let RoundOutcome::Resolved { message } = outcome {
            self.emit(SessionEvent::MessageResolved { round, message });
        }
    }

    fn disruption(
        &self,
        round: u64,
        peer: Option<ParticipantIndex>,
        kind: DisruptionKind,
    ) -> SessionError {
        warn!(
            "[{}] disruption in round {} (peer {:?}): {}",
            self.config.self_index, round, peer, kind
        );
        self.emit(SessionEvent::DisruptionDetected { round, peer, kind });
        SessionError::Disruption { round, peer, kind }
    }

    fn emit(&self, event: SessionEvent) {
        // the caller may not listen
        let _ = self.events_tx.send(event);
    }
}
