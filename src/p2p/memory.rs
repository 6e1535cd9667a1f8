//! In-process transport used by tests, benchmarks and single-machine demos
//!
//! Every ordered pair of participants gets its own unbounded tokio channel;
//! broadcasts fan out to one inbox per participant, the sender's own included.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::messages::{CommandTag, DcNetMessage, ParticipantIndex, RoundContribution};
use super::traits::{BroadcastSource, RoomTransport, TransportError, TransportResult};

/// Builder for a fully connected in-memory room
pub struct MemoryHub;

impl MemoryHub {
    /// Wire up `room_size` participants; entry `i` belongs to index `i + 1`.
    pub fn room(room_size: usize) -> Vec<(MemoryTransport, MemoryBroadcastSource)> {
        let mut outgoing: Vec<HashMap<ParticipantIndex, mpsc::UnboundedSender<DcNetMessage>>> =
            (0..room_size).map(|_| HashMap::new()).collect();
        let mut incoming: Vec<HashMap<ParticipantIndex, Mutex<mpsc::UnboundedReceiver<DcNetMessage>>>> =
            (0..room_size).map(|_| HashMap::new()).collect();

        for from in 1..=room_size {
            for to in 1..=room_size {
                if from == to {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                outgoing[from - 1].insert(to, tx);
                incoming[to - 1].insert(from, Mutex::new(rx));
            }
        }

        let (broadcast_txs, broadcast_rxs): (Vec<_>, Vec<_>) =
            (0..room_size).map(|_| mpsc::unbounded_channel()).unzip();

        outgoing
            .into_iter()
            .zip(incoming)
            .zip(broadcast_rxs)
            .enumerate()
            .map(|(position, ((pairwise_tx, pairwise_rx), broadcast_rx))| {
                let transport = MemoryTransport {
                    self_index: position + 1,
                    room_size,
                    pairwise_tx,
                    pairwise_rx,
                    broadcast_tx: broadcast_txs.clone(),
                };
                (transport, MemoryBroadcastSource { rx: broadcast_rx })
            })
            .collect()
    }
}

pub struct MemoryTransport {
    self_index: ParticipantIndex,
    room_size: usize,
    pairwise_tx: HashMap<ParticipantIndex, mpsc::UnboundedSender<DcNetMessage>>,
    pairwise_rx: HashMap<ParticipantIndex, Mutex<mpsc::UnboundedReceiver<DcNetMessage>>>,
    broadcast_tx: Vec<mpsc::UnboundedSender<RoundContribution>>,
}

#[async_trait]
impl RoomTransport for MemoryTransport {
    fn self_index(&self) -> ParticipantIndex {
        self.self_index
    }

    fn room_size(&self) -> usize {
        self.room_size
    }

    async fn broadcast(&self, message: DcNetMessage) -> TransportResult<()> {
        let command = message.command();
        let DcNetMessage::Contribution(contribution) = message else {
            return Err(TransportError::UnexpectedMessage {
                peer: self.self_index,
                expected: CommandTag::Slot,
                got: command,
            });
        };

        for (position, inbox) in self.broadcast_tx.iter().enumerate() {
            if inbox.send(contribution.clone()).is_err() {
                // the receiver already finished its session
                debug!(
                    "[{}] broadcast inbox of {} closed",
                    self.self_index,
                    position + 1
                );
            }
        }
        Ok(())
    }

    async fn send_to(&self, peer: ParticipantIndex, message: DcNetMessage) -> TransportResult<()> {
        let tx = self
            .pairwise_tx
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        tx.send(message)
            .map_err(|_| TransportError::Disconnected(peer))
    }

    async fn recv_from(&self, peer: ParticipantIndex) -> TransportResult<DcNetMessage> {
        let rx = self
            .pairwise_rx
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(TransportError::Disconnected(peer))
    }
}

pub struct MemoryBroadcastSource {
    rx: mpsc::UnboundedReceiver<RoundContribution>,
}

#[async_trait]
impl BroadcastSource for MemoryBroadcastSource {
    async fn next_broadcast(&mut self) -> TransportResult<RoundContribution> {
        self.rx.recv().await.ok_or(TransportError::BroadcastClosed)
    }
}
