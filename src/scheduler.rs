//! Binary-tree collision resolution.
//!
//! Rounds are numbered like a heap: a collision in round `k` is split into
//! round `2k` (real, played over the network) and round `2k + 1` (virtual,
//! `S_{2k+1} = S_k - S_{2k}`). Round 1 and every even round are real.
//!
//! All participants run identical `SchedulerState`s; the only per-participant
//! difference is the send permission, which decides whether the own message
//! goes into a real round's slot.

use ark_std::rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::error::DcNetError;
use crate::slot::{SlotEncoder, SlotValue};

/// Default limit of non-split retries of one parent round.
pub const DEFAULT_MAX_RETRIES: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("round queue exhausted before the session finished")]
    QueueExhausted,

    #[error("no aggregate recorded for round {0}")]
    MissingAggregate(u64),

    #[error("virtual round {round} would be negative: parent {parent} minus sibling {sibling}")]
    NegativeVirtualAggregate {
        round: u64,
        parent: SlotValue,
        sibling: SlotValue,
    },

    #[error("round {round} reports {count} senders but the collision had {collision_size}")]
    CollisionCountOutOfRange {
        round: u64,
        count: usize,
        collision_size: usize,
    },

    #[error("round {round} is beyond the bound for a collision of {collision_size}")]
    RoundBoundExceeded { round: u64, collision_size: usize },

    #[error("round {round} failed to split after {attempts} attempts")]
    RetryLimitExceeded { round: u64, attempts: u32 },

    #[error("round {got} completed but {expected:?} was scheduled")]
    UnexpectedRound { expected: Option<u64>, got: u64 },

    #[error("round {0} is still waiting for its aggregate")]
    RoundInProgress(u64),

    #[error("resolved value {0} does not fit a message")]
    ResolvedValueOutOfRange(u128),

    #[error("invalid room: {0}")]
    Room(#[from] DcNetError),
}

/// How a participant caught in a collision picks its next round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendPolicy {
    /// Messages at or below the collision's average go to `2k`, the rest to `2k + 1`
    AverageComparison,
    /// A fair coin chooses between `2k` and `2k + 1`
    CoinFlip,
}

impl ResendPolicy {
    pub fn from_non_probabilistic_mode(non_probabilistic: bool) -> Self {
        if non_probabilistic {
            ResendPolicy::AverageComparison
        } else {
            ResendPolicy::CoinFlip
        }
    }
}

pub fn is_real_round(round: u64) -> bool {
    round == 1 || round % 2 == 0
}

/// What a round revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Round 1 was empty; nobody transmits in this session
    Silent,
    /// Exactly one message in the round
    Resolved { message: u64 },
    /// More than one sender; children were scheduled
    Collision { size: usize },
    /// The split of `parent` failed and `parent` is played again
    Retry { parent: u64 },
    /// A virtual round without senders
    Empty,
}

/// Next step of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled {
    /// Broadcast `slot` and report the room aggregate through
    /// `complete_real_round`
    Real { round: u64, slot: SlotValue },
    /// Reconstructed locally and already applied
    Virtual {
        round: u64,
        aggregate: SlotValue,
        outcome: RoundOutcome,
    },
    Finished,
}

/// Append-only log of round aggregates.
///
/// A replayed round appends a new entry; lookups see the latest one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundHistory {
    entries: Vec<(u64, SlotValue)>,
}

impl RoundHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, round: u64, aggregate: SlotValue) {
        self.entries.push((round, aggregate));
    }

    pub fn latest(&self, round: u64) -> Option<SlotValue> {
        self.entries
            .iter()
            .rev()
            .find(|(r, _)| *r == round)
            .map(|(_, aggregate)| *aggregate)
    }

    pub fn entries(&self) -> &[(u64, SlotValue)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `S_k = S_{(k-1)/2} - S_{k-1}` for a virtual round `k`.
///
/// Both operands must be recorded. If either is zero the result is zero.
pub fn reconstruct_virtual(history: &RoundHistory, round: u64) -> Result<SlotValue, SchedulerError> {
    let parent_round = (round - 1) / 2;
    let sibling_round = round - 1;
    let parent = history
        .latest(parent_round)
        .ok_or(SchedulerError::MissingAggregate(parent_round))?;
    let sibling = history
        .latest(sibling_round)
        .ok_or(SchedulerError::MissingAggregate(sibling_round))?;

    if parent == 0 || sibling == 0 {
        return Ok(0);
    }
    parent
        .checked_sub(sibling)
        .ok_or(SchedulerError::NegativeVirtualAggregate {
            round,
            parent,
            sibling,
        })
}

/// Collision-resolution state of one participant.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    encoder: SlotEncoder,
    policy: ResendPolicy,
    own_message: u64,
    max_retries: u32,
    queue: VecDeque<u64>,
    history: RoundHistory,
    send_permission: u64,
    transmitted: bool,
    collision_size: Option<usize>,
    resolved: Vec<u64>,
    failed_splits: HashSet<u64>,
    retries: HashMap<u64, u32>,
    pending_real: Option<u64>,
    finished: bool,
    total_rounds: u64,
    real_rounds: u64,
    own_message_round: Option<u64>,
}

impl SchedulerState {
    /// `own_message == 0` means this participant stays silent.
    pub fn new(encoder: SlotEncoder, policy: ResendPolicy, own_message: u64, max_retries: u32) -> Self {
        Self {
            encoder,
            policy,
            own_message,
            max_retries,
            queue: VecDeque::from([1]),
            history: RoundHistory::new(),
            send_permission: 1,
            transmitted: false,
            collision_size: None,
            resolved: Vec::new(),
            failed_splits: HashSet::new(),
            retries: HashMap::new(),
            pending_real: None,
            finished: false,
            total_rounds: 0,
            real_rounds: 0,
            own_message_round: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn resolved(&self) -> &[u64] {
        &self.resolved
    }

    pub fn history(&self) -> &RoundHistory {
        &self.history
    }

    pub fn send_permission(&self) -> u64 {
        self.send_permission
    }

    pub fn transmitted(&self) -> bool {
        self.transmitted
    }

    pub fn collision_size(&self) -> Option<usize> {
        self.collision_size
    }

    pub fn total_rounds(&self) -> u64 {
        self.total_rounds
    }

    pub fn real_rounds(&self) -> u64 {
        self.real_rounds
    }

    /// Round count at which the own message was confirmed
    pub fn own_message_round(&self) -> Option<u64> {
        self.own_message_round
    }

    pub fn encoder(&self) -> &SlotEncoder {
        &self.encoder
    }

    /// Pops the next round. Virtual rounds are reconstructed and applied
    /// immediately; real rounds wait for `complete_real_round`.
    pub fn next_round<R: RngCore>(&mut self, rng: &mut R) -> Result<Scheduled, SchedulerError> {
        if self.finished {
            return Ok(Scheduled::Finished);
        }
        if let Some(round) = self.pending_real {
            return Err(SchedulerError::RoundInProgress(round));
        }

        let round = self.queue.pop_front().ok_or(SchedulerError::QueueExhausted)?;
        self.check_bound(round)?;
        self.total_rounds += 1;

        if is_real_round(round) {
            self.real_rounds += 1;
            self.pending_real = Some(round);
            let slot = if self.should_send(round) {
                self.encoder.encode(self.own_message)
            } else {
                0
            };
            debug!("round {} real, sending {}", round, slot != 0);
            return Ok(Scheduled::Real { round, slot });
        }

        let aggregate = reconstruct_virtual(&self.history, round)?;
        let outcome = self.apply(round, aggregate, false, rng)?;
        Ok(Scheduled::Virtual {
            round,
            aggregate,
            outcome,
        })
    }

    /// Feeds the room-wide aggregate of the pending real round.
    pub fn complete_real_round<R: RngCore>(
        &mut self,
        round: u64,
        aggregate: SlotValue,
        rng: &mut R,
    ) -> Result<RoundOutcome, SchedulerError> {
        if self.pending_real != Some(round) {
            return Err(SchedulerError::UnexpectedRound {
                expected: self.pending_real,
                got: round,
            });
        }
        self.pending_real = None;
        self.apply(round, aggregate, true, rng)
    }

    fn should_send(&self, round: u64) -> bool {
        self.own_message != 0 && !self.transmitted && self.send_permission == round
    }

    fn check_bound(&self, round: u64) -> Result<(), SchedulerError> {
        let Some(collision_size) = self.collision_size else {
            return Ok(());
        };
        if collision_size < 64 && round >= 1u64 << collision_size {
            return Err(SchedulerError::RoundBoundExceeded {
                round,
                collision_size,
            });
        }
        Ok(())
    }

    fn apply<R: RngCore>(
        &mut self,
        round: u64,
        aggregate: SlotValue,
        real: bool,
        rng: &mut R,
    ) -> Result<RoundOutcome, SchedulerError> {
        self.history.record(round, aggregate);
        let sum = self.encoder.decode(aggregate);
        debug!("C_{} = ({}, {})", round, sum.messages, sum.count);

        if round == 1 {
            self.collision_size = Some(sum.count);
            if sum.count == 0 {
                info!("room was silent");
                self.finished = true;
                return Ok(RoundOutcome::Silent);
            }
        }

        let collision_size = self.collision_size.unwrap_or(0);
        if sum.count > collision_size {
            return Err(SchedulerError::CollisionCountOutOfRange {
                round,
                count: sum.count,
                collision_size,
            });
        }

        if sum.count == 1 {
            let message = u64::try_from(sum.messages)
                .map_err(|_| SchedulerError::ResolvedValueOutOfRange(sum.messages))?;
            self.resolved.push(message);
            if message == self.own_message && self.should_send(round) {
                self.transmitted = true;
                self.own_message_round = Some(self.total_rounds);
            }
            if self.resolved.len() == collision_size {
                self.finished = true;
            }
            return Ok(RoundOutcome::Resolved { message });
        }

        if real && round != 1 {
            let parent = round / 2;
            let parent_aggregate = self
                .history
                .latest(parent)
                .ok_or(SchedulerError::MissingAggregate(parent))?;
            if sum.count == 0 || aggregate == parent_aggregate {
                return self.retry(round, parent);
            }
        }

        if sum.count == 0 {
            return Ok(RoundOutcome::Empty);
        }

        let left = round
            .checked_mul(2)
            .ok_or(SchedulerError::RoundBoundExceeded {
                round,
                collision_size,
            })?;
        let right = left + 1;

        if self.should_send(round) {
            let coin = self.policy == ResendPolicy::CoinFlip || self.failed_splits.contains(&round);
            let go_left = if coin {
                rng.gen_bool(0.5)
            } else {
                self.own_message as u128 <= sum.messages / sum.count as u128
            };
            self.send_permission = if go_left { left } else { right };
            debug!("collision in round {}, resending in {}", round, self.send_permission);
        }
        self.queue.push_back(left);
        self.queue.push_back(right);
        Ok(RoundOutcome::Collision { size: sum.count })
    }

    fn retry(&mut self, round: u64, parent: u64) -> Result<RoundOutcome, SchedulerError> {
        let attempts = self.retries.entry(parent).or_insert(0);
        *attempts += 1;
        if *attempts > self.max_retries {
            return Err(SchedulerError::RetryLimitExceeded {
                round: parent,
                attempts: *attempts,
            });
        }

        let sibling = round + 1;
        if let Some(position) = self.queue.iter().position(|r| *r == sibling) {
            self.queue.remove(position);
        }
        self.queue.push_front(parent);
        if self.send_permission == round || self.send_permission == sibling {
            self.send_permission = parent;
        }
        self.failed_splits.insert(parent);
        debug!("round {} did not split, replaying {}", round, parent);
        Ok(RoundOutcome::Retry { parent })
    }
}

/// Transcript of a simulated room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub resolved: Vec<u64>,
    pub total_rounds: u64,
    pub real_rounds: u64,
    /// `(round, outcome)` in play order
    pub outcomes: Vec<(u64, RoundOutcome)>,
    /// Per participant, the round count at which its message was confirmed
    pub own_message_rounds: Vec<Option<u64>>,
}

/// Runs one scheduler per message in lockstep with plain integer sums.
pub fn simulate_room<R: RngCore>(
    messages: &[u64],
    policy: ResendPolicy,
    rng: &mut R,
) -> Result<SimulationReport, SchedulerError> {
    let encoder = SlotEncoder::new(messages.len())?;
    let mut participants: Vec<SchedulerState> = messages
        .iter()
        .map(|m| SchedulerState::new(encoder, policy, *m, DEFAULT_MAX_RETRIES))
        .collect();
    let mut outcomes = Vec::new();

    loop {
        let mut steps = Vec::with_capacity(participants.len());
        for participant in participants.iter_mut() {
            steps.push(participant.next_round(rng)?);
        }

        match steps.first() {
            None | Some(Scheduled::Finished) => break,
            Some(Scheduled::Virtual { round, outcome, .. }) => outcomes.push((*round, *outcome)),
            Some(Scheduled::Real { round, .. }) => {
                let round = *round;
                let aggregate: SlotValue = steps
                    .iter()
                    .map(|step| match step {
                        Scheduled::Real { slot, .. } => *slot,
                        _ => 0,
                    })
                    .sum();
                let mut first = None;
                for participant in participants.iter_mut() {
                    let outcome = participant.complete_real_round(round, aggregate, rng)?;
                    first.get_or_insert(outcome);
                }
                if let Some(outcome) = first {
                    outcomes.push((round, outcome));
                }
            }
        }
    }

    let reference = participants.first();
    Ok(SimulationReport {
        resolved: reference.map(|p| p.resolved().to_vec()).unwrap_or_default(),
        total_rounds: reference.map(|p| p.total_rounds()).unwrap_or(0),
        real_rounds: reference.map(|p| p.real_rounds()).unwrap_or(0),
        outcomes,
        own_message_rounds: participants.iter().map(|p| p.own_message_round()).collect(),
    })
}
