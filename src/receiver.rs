//! Receive task: drains the broadcast channel on behalf of the session task.
//!
//! The session tells the task which round it plays (or that a round is
//! virtual) over a bounded channel and gets the round's contributions back.
//! Contributions that arrive early are buffered for a few rounds at most;
//! leftovers of a finished round are dropped.

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::p2p::messages::{ParticipantIndex, RoundContribution};
use crate::p2p::traits::{BroadcastSource, TransportError};

/// Instruction from the session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverCommand {
    /// Collect one contribution per participant for this real round
    Round(u64),
    /// Virtual round, nothing to receive
    Skip(u64),
    /// Stop; acknowledged with `ReceiverEvent::Stopped`
    Terminate,
}

/// Answer from the receive task
#[derive(Debug)]
pub enum ReceiverEvent {
    RoundData {
        round: u64,
        contributions: Vec<RoundContribution>,
    },
    Stopped,
    Failed(TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("receive task is gone")]
    Gone,

    #[error("receive task answered round {got} while round {expected} was requested")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("receive task failed: {0}")]
    Transport(#[from] TransportError),
}

/// Session-side end of the receive task.
pub struct ReceiverHandle {
    commands: mpsc::Sender<ReceiverCommand>,
    events: mpsc::Receiver<ReceiverEvent>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    pub fn spawn<S>(source: S, room_size: usize, capacity: usize) -> Self
    where
        S: BroadcastSource + 'static,
    {
        let capacity = capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let task = tokio::spawn(run_receiver(source, room_size, command_rx, event_tx));
        Self {
            commands: command_tx,
            events: event_rx,
            task,
        }
    }

    /// Announces the next real round.
    pub async fn request(&self, round: u64) -> Result<(), ReceiverError> {
        self.commands
            .send(ReceiverCommand::Round(round))
            .await
            .map_err(|_| ReceiverError::Gone)
    }

    /// Announces a virtual round.
    pub async fn skip(&self, round: u64) -> Result<(), ReceiverError> {
        self.commands
            .send(ReceiverCommand::Skip(round))
            .await
            .map_err(|_| ReceiverError::Gone)
    }

    /// Waits for the contributions of the requested round.
    pub async fn collect(&mut self, round: u64) -> Result<Vec<RoundContribution>, ReceiverError> {
        match self.events.recv().await {
            Some(ReceiverEvent::RoundData {
                round: got,
                contributions,
            }) => {
                if got != round {
                    return Err(ReceiverError::OutOfOrder {
                        expected: round,
                        got,
                    });
                }
                Ok(contributions)
            }
            Some(ReceiverEvent::Failed(err)) => Err(ReceiverError::Transport(err)),
            Some(ReceiverEvent::Stopped) | None => Err(ReceiverError::Gone),
        }
    }

    /// Stops the task without waiting, for sessions that failed mid-round.
    pub fn abort(self) {
        self.task.abort();
    }

    /// Sends the terminal command and waits for the acknowledgement.
    pub async fn shutdown(mut self) -> Result<(), ReceiverError> {
        if self.commands.send(ReceiverCommand::Terminate).await.is_err() {
            // task already exited, e.g. after a transport failure
            let _ = self.task.await;
            return Ok(());
        }
        loop {
            match self.events.recv().await {
                Some(ReceiverEvent::Stopped) | None => break,
                Some(ReceiverEvent::RoundData { round, .. }) => {
                    debug!("discarding unread data of round {}", round)
                }
                Some(ReceiverEvent::Failed(err)) => debug!("receive task failed during shutdown: {}", err),
            }
        }
        let _ = self.task.await;
        Ok(())
    }
}

/// Distinct future rounds the task keeps contributions for
pub const MAX_PENDING_ROUNDS: usize = 4;

/// Early contributions, at most `room_size` for each of
/// `MAX_PENDING_ROUNDS` rounds.
#[derive(Debug)]
struct PendingRounds {
    room_size: usize,
    rounds: BTreeMap<u64, Vec<RoundContribution>>,
}

impl PendingRounds {
    fn new(room_size: usize) -> Self {
        Self {
            room_size,
            rounds: BTreeMap::new(),
        }
    }

    /// Buffers `contribution`, returning false when it was dropped.
    fn insert(&mut self, contribution: RoundContribution) -> bool {
        if !self.rounds.contains_key(&contribution.round) && self.rounds.len() >= MAX_PENDING_ROUNDS {
            return false;
        }
        let buffered = self.rounds.entry(contribution.round).or_default();
        if buffered.len() >= self.room_size {
            return false;
        }
        buffered.push(contribution);
        true
    }

    fn take(&mut self, round: u64) -> Vec<RoundContribution> {
        self.rounds.remove(&round).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.rounds.values().map(Vec::len).sum()
    }
}

async fn run_receiver<S: BroadcastSource>(
    mut source: S,
    room_size: usize,
    mut commands: mpsc::Receiver<ReceiverCommand>,
    events: mpsc::Sender<ReceiverEvent>,
) {
    let mut pending = PendingRounds::new(room_size);
    let mut last_completed: Option<u64> = None;
    // peers whose connection closed after their last contribution
    let mut departed: BTreeSet<ParticipantIndex> = BTreeSet::new();

    while let Some(command) = commands.recv().await {
        let round = match command {
            ReceiverCommand::Terminate => {
                let _ = events.send(ReceiverEvent::Stopped).await;
                return;
            }
            ReceiverCommand::Skip(round) => {
                debug!("virtual round {}, nothing to receive", round);
                continue;
            }
            ReceiverCommand::Round(round) => round,
        };

        let mut batch = pending.take(round);
        if let Some(peer) = departed
            .iter()
            .find(|peer| !batch.iter().any(|c| c.sender == **peer))
        {
            let err = TransportError::Disconnected(*peer);
            let _ = events.send(ReceiverEvent::Failed(err)).await;
            return;
        }

        while batch.len() < room_size {
            let contribution = match source.next_broadcast().await {
                Ok(contribution) => contribution,
                Err(TransportError::Disconnected(peer))
                    if batch.iter().any(|c| c.sender == peer) =>
                {
                    debug!("participant {} left after contributing to round {}", peer, round);
                    departed.insert(peer);
                    continue;
                }
                Err(err) => {
                    let _ = events.send(ReceiverEvent::Failed(err)).await;
                    return;
                }
            };

            if contribution.round == round {
                batch.push(contribution);
            } else if Some(contribution.round) == last_completed {
                warn!(
                    "dropping stale contribution of participant {} for round {}",
                    contribution.sender, contribution.round
                );
            } else {
                let (sender, early) = (contribution.sender, contribution.round);
                if !pending.insert(contribution) {
                    warn!(
                        "no room to buffer round {}, dropping contribution of participant {} ({} buffered)",
                        early,
                        sender,
                        pending.len()
                    );
                }
            }
        }

        let leftover = batch.split_off(room_size);
        if !leftover.is_empty() {
            warn!("dropping {} surplus contributions for round {}", leftover.len(), round);
        }
        last_completed = Some(round);

        let data = ReceiverEvent::RoundData {
            round,
            contributions: batch,
        };
        if events.send(data).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    use crate::p2p::traits::TransportResult;

    struct ScriptedSource {
        script: VecDeque<RoundContribution>,
    }

    #[async_trait]
    impl BroadcastSource for ScriptedSource {
        async fn next_broadcast(&mut self) -> TransportResult<RoundContribution> {
            self.script.pop_front().ok_or(TransportError::BroadcastClosed)
        }
    }

    /// Source that never yields while its sender is alive.
    struct PendingSource {
        rx: mpsc::UnboundedReceiver<RoundContribution>,
    }

    #[async_trait]
    impl BroadcastSource for PendingSource {
        async fn next_broadcast(&mut self) -> TransportResult<RoundContribution> {
            self.rx.recv().await.ok_or(TransportError::BroadcastClosed)
        }
    }

    /// Source replaying what a transport reports, errors included.
    struct DisconnectingSource {
        rx: mpsc::UnboundedReceiver<TransportResult<RoundContribution>>,
    }

    #[async_trait]
    impl BroadcastSource for DisconnectingSource {
        async fn next_broadcast(&mut self) -> TransportResult<RoundContribution> {
            self.rx.recv().await.ok_or(TransportError::BroadcastClosed)?
        }
    }

    fn contribution(sender: usize, round: u64) -> RoundContribution {
        RoundContribution {
            sender,
            round,
            blinded_slot: vec![sender as u8],
            attestation: None,
        }
    }

    fn senders(contributions: &[RoundContribution]) -> Vec<usize> {
        let mut senders: Vec<usize> = contributions.iter().map(|c| c.sender).collect();
        senders.sort_unstable();
        senders
    }

    #[tokio::test]
    async fn test_buffers_future_rounds() {
        let script = VecDeque::from([
            contribution(1, 1),
            contribution(2, 2),
            contribution(2, 1),
            contribution(1, 2),
        ]);
        let mut handle = ReceiverHandle::spawn(ScriptedSource { script }, 2, 4);

        handle.request(1).await.unwrap();
        assert_eq!(senders(&handle.collect(1).await.unwrap()), vec![1, 2]);

        handle.skip(3).await.unwrap();
        handle.request(2).await.unwrap();
        let round_two = handle.collect(2).await.unwrap();
        assert_eq!(senders(&round_two), vec![1, 2]);
        assert!(round_two.iter().all(|c| c.round == 2));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_drops_stale_contributions() {
        let script = VecDeque::from([
            contribution(1, 1),
            contribution(2, 1),
            // late duplicate of a finished round
            contribution(2, 1),
            contribution(1, 2),
            contribution(2, 2),
        ]);
        let mut handle = ReceiverHandle::spawn(ScriptedSource { script }, 2, 4);

        handle.request(1).await.unwrap();
        handle.collect(1).await.unwrap();
        handle.request(2).await.unwrap();
        assert_eq!(senders(&handle.collect(2).await.unwrap()), vec![1, 2]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let script = VecDeque::from([contribution(1, 1)]);
        let mut handle = ReceiverHandle::spawn(ScriptedSource { script }, 3, 4);
        handle.request(1).await.unwrap();
        assert!(matches!(
            handle.collect(1).await,
            Err(ReceiverError::Transport(TransportError::BroadcastClosed))
        ));
        // the task is gone; shutdown still returns
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_while_waiting_for_contributions() {
        let (_tx, rx) = mpsc::unbounded_channel::<RoundContribution>();
        let handle = ReceiverHandle::spawn(PendingSource { rx }, 3, 4);
        handle.request(1).await.unwrap();
        handle.abort();
    }

    #[test]
    fn test_pending_rounds_are_bounded() {
        let mut pending = PendingRounds::new(3);
        for round in 10..10_000u64 {
            pending.insert(contribution(2, round));
        }
        assert_eq!(pending.rounds.len(), MAX_PENDING_ROUNDS);
        assert_eq!(pending.len(), MAX_PENDING_ROUNDS);

        // a buffered round still fills up to the room size, and no further
        for sender in 1..=5 {
            pending.insert(contribution(sender, 10));
        }
        assert_eq!(pending.take(10).len(), 3);
        assert!(pending.insert(contribution(1, 20_000)));
    }

    #[tokio::test]
    async fn test_flooded_future_rounds_are_dropped() {
        let mut script: VecDeque<RoundContribution> =
            (100..5_100u64).map(|round| contribution(2, round)).collect();
        script.push_back(contribution(1, 1));
        script.push_back(contribution(2, 1));
        let mut handle = ReceiverHandle::spawn(ScriptedSource { script }, 2, 4);

        handle.request(1).await.unwrap();
        assert_eq!(senders(&handle.collect(1).await.unwrap()), vec![1, 2]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_leaving_after_its_contribution() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = ReceiverHandle::spawn(DisconnectingSource { rx }, 3, 4);

        tx.send(Ok(contribution(2, 1))).unwrap();
        tx.send(Err(TransportError::Disconnected(2))).unwrap();
        tx.send(Ok(contribution(1, 1))).unwrap();
        tx.send(Ok(contribution(3, 1))).unwrap();
        handle.request(1).await.unwrap();
        assert_eq!(senders(&handle.collect(1).await.unwrap()), vec![1, 2, 3]);

        // participant 2 cannot contribute to a later round
        handle.request(2).await.unwrap();
        assert!(matches!(
            handle.collect(2).await,
            Err(ReceiverError::Transport(TransportError::Disconnected(2)))
        ));
    }

    #[tokio::test]
    async fn test_peer_leaving_mid_round_fails_the_round() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = ReceiverHandle::spawn(DisconnectingSource { rx }, 3, 4);

        tx.send(Ok(contribution(1, 1))).unwrap();
        tx.send(Err(TransportError::Disconnected(3))).unwrap();
        handle.request(1).await.unwrap();
        assert!(matches!(
            handle.collect(1).await,
            Err(ReceiverError::Transport(TransportError::Disconnected(3)))
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_acknowledged() {
        let (command_tx, command_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::channel(1);
        let source = ScriptedSource {
            script: VecDeque::new(),
        };
        let task = tokio::spawn(run_receiver(source, 2, command_rx, event_tx));

        command_tx.send(ReceiverCommand::Terminate).await.unwrap();
        assert!(matches!(event_rx.recv().await, Some(ReceiverEvent::Stopped)));
        task.await.unwrap();
    }
}
