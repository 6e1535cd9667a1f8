//! Wire messages exchanged between the participants of a room
//!
//! Group elements and scalars travel as ark-serialize compressed bytes; the
//! framing around a message is owned by the transport.

use serde::{Deserialize, Serialize};

/// 1-based participant index inside a room
pub type ParticipantIndex = usize;

/// Message type for room communication
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DcNetMessage {
    /// Key exchange: ephemeral Diffie-Hellman share for one peer
    KeyShare {
        sender: ParticipantIndex,
        share: Vec<u8>,
    },

    /// Key exchange: hash tag confirming both ends derived the same seed
    KeyConfirmation {
        sender: ParticipantIndex,
        tag: Vec<u8>,
    },

    /// Synchronization: ask a higher-indexed peer whether it is ready for `round`
    BarrierRequest {
        sender: ParticipantIndex,
        round: u64,
    },

    /// Synchronization: answer to a `BarrierRequest`
    BarrierReply {
        sender: ParticipantIndex,
        round: u64,
    },

    /// Round: blinded slot value, optionally attested
    Contribution(RoundContribution),
}

/// One participant's broadcast for one real round
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RoundContribution {
    pub sender: ParticipantIndex,
    pub round: u64,
    /// Slot value plus round key, as a scalar field element
    pub blinded_slot: Vec<u8>,
    pub attestation: Option<Attestation>,
}

/// Commitment material bound to a contribution
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Pedersen commitment to the unblinded slot value
    pub commitment: Vec<u8>,
    /// Proof of knowledge of the commitment opening
    pub proof: Vec<u8>,
    /// Commitment randomness plus randomness key
    pub blinded_randomness: Vec<u8>,
}

impl DcNetMessage {
    /// Get the sender index
    pub fn sender(&self) -> ParticipantIndex {
        match self {
            DcNetMessage::KeyShare { sender, .. } => *sender,
            DcNetMessage::KeyConfirmation { sender, .. } => *sender,
            DcNetMessage::BarrierRequest { sender, .. } => *sender,
            DcNetMessage::BarrierReply { sender, .. } => *sender,
            DcNetMessage::Contribution(contribution) => contribution.sender,
        }
    }

    /// Get the protocol phase this message belongs to
    pub fn command(&self) -> CommandTag {
        match self {
            DcNetMessage::KeyShare { .. } => CommandTag::KeyShare,
            DcNetMessage::KeyConfirmation { .. } => CommandTag::KeyConfirmation,
            DcNetMessage::BarrierRequest { .. } => CommandTag::Barrier,
            DcNetMessage::BarrierReply { .. } => CommandTag::Barrier,
            DcNetMessage::Contribution(RoundContribution {
                attestation: Some(_),
                ..
            }) => CommandTag::AttestedSlot,
            DcNetMessage::Contribution(_) => CommandTag::Slot,
        }
    }

    /// Whether the message travels on the broadcast channel rather than a
    /// pairwise one
    pub fn is_broadcast(&self) -> bool {
        matches!(self, DcNetMessage::Contribution(_))
    }
}

/// Message classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTag {
    KeyShare,
    KeyConfirmation,
    Barrier,
    Slot,
    AttestedSlot,
}
