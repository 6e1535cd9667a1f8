//! Seams between the protocol core and whatever moves bytes between
//! participants.
//!
//! `RoomTransport` covers the point-to-point side (key exchange, barrier) and
//! the broadcast send. Incoming broadcasts are drained separately through a
//! `BroadcastSource`, which the receive task owns.

use async_trait::async_trait;
use std::time::Duration;

use super::messages::{CommandTag, DcNetMessage, ParticipantIndex, RoundContribution};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not part of the room")]
    UnknownPeer(ParticipantIndex),

    #[error("connection to peer {0} closed")]
    Disconnected(ParticipantIndex),

    #[error("broadcast channel closed")]
    BroadcastClosed,

    #[error("unexpected {got:?} from peer {peer}, expected {expected:?}")]
    UnexpectedMessage {
        peer: ParticipantIndex,
        expected: CommandTag,
        got: CommandTag,
    },

    #[error("peer {peer} answered barrier for round {got}, expected round {expected}")]
    BarrierMismatch {
        peer: ParticipantIndex,
        expected: u64,
        got: u64,
    },

    #[error("could not reach peer {peer} within {timeout:?}")]
    ConnectTimeout {
        peer: ParticipantIndex,
        timeout: Duration,
    },

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Point-to-point channels plus broadcast send for one participant.
#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// This participant's 1-based index
    fn self_index(&self) -> ParticipantIndex;

    /// Number of participants in the room, including this one
    fn room_size(&self) -> usize;

    /// Publish a message to every participant, this one included
    async fn broadcast(&self, message: DcNetMessage) -> TransportResult<()>;

    /// Send a message to a single peer
    async fn send_to(&self, peer: ParticipantIndex, message: DcNetMessage) -> TransportResult<()>;

    /// Wait for the next point-to-point message from `peer`
    async fn recv_from(&self, peer: ParticipantIndex) -> TransportResult<DcNetMessage>;

    /// Every index except our own, ascending
    fn peers(&self) -> Vec<ParticipantIndex> {
        let me = self.self_index();
        (1..=self.room_size()).filter(|peer| *peer != me).collect()
    }

    /// Pairwise request-reply handshake with every peer for `round`.
    ///
    /// Requests from lower-indexed peers are answered first, then this
    /// participant initiates towards every higher-indexed peer. Returns once
    /// all handshakes completed.
    async fn barrier(&self, round: u64) -> TransportResult<()> {
        let me = self.self_index();
        let peers = self.peers();

        for peer in peers.iter().copied().filter(|peer| *peer < me) {
            match self.recv_from(peer).await? {
                DcNetMessage::BarrierRequest { round: got, .. } if got == round => {}
                DcNetMessage::BarrierRequest { round: got, .. } => {
                    return Err(TransportError::BarrierMismatch {
                        peer,
                        expected: round,
                        got,
                    })
                }
                other => {
                    return Err(TransportError::UnexpectedMessage {
                        peer,
                        expected: CommandTag::Barrier,
                        got: other.command(),
                    })
                }
            }
            self.send_to(peer, DcNetMessage::BarrierReply { sender: me, round })
                .await?;
        }

        for peer in peers.iter().copied().filter(|peer| *peer > me) {
            self.send_to(peer, DcNetMessage::BarrierRequest { sender: me, round })
                .await?;
            match self.recv_from(peer).await? {
                DcNetMessage::BarrierReply { round: got, .. } if got == round => {}
                DcNetMessage::BarrierReply { round: got, .. } => {
                    return Err(TransportError::BarrierMismatch {
                        peer,
                        expected: round,
                        got,
                    })
                }
                other => {
                    return Err(TransportError::UnexpectedMessage {
                        peer,
                        expected: CommandTag::Barrier,
                        got: other.command(),
                    })
                }
            }
        }

        Ok(())
    }
}

/// Stream of round contributions seen on the broadcast channel.
#[async_trait]
pub trait BroadcastSource: Send {
    async fn next_broadcast(&mut self) -> TransportResult<RoundContribution>;
}
