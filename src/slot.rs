//! Slot encoding: turns "who sent a non-zero value" into an arithmetic signal.
//!
//! A participant of a room of `n` contributes `0` for silence and
//! `m * (n + 1) + 1` for message `m`. For any aggregate `S` of at most `n`
//! contributions, `S mod (n + 1)` is the number of senders and
//! `S div (n + 1)` is the sum of their messages.
//!
//! Two senders of the same value are still counted twice; what they cannot do
//! is split apart by comparing against the average. The scheduler handles
//! that case (see `scheduler`).

use crate::error::DcNetError;

/// Integer contributed to (or aggregated over) one slot.
pub type SlotValue = u128;

/// Largest room the encoding supports. Keeps `n * encode(u64::MAX)` far below
/// both `u128::MAX` and the order of any cryptographic group in use.
pub const MAX_ROOM_SIZE: usize = 1024;

/// Smallest room in which a sender can hide.
pub const MIN_ROOM_SIZE: usize = 2;

/// Room sizes accepted by the encoding and by `Room`.
pub fn check_room_size(room_size: usize) -> Result<(), DcNetError> {
    if !(MIN_ROOM_SIZE..=MAX_ROOM_SIZE).contains(&room_size) {
        return Err(DcNetError::InvalidParameter(format!(
            "room size must be in {}..={}, got {}",
            MIN_ROOM_SIZE, MAX_ROOM_SIZE, room_size
        )));
    }
    Ok(())
}

/// Decoded aggregate of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSum {
    /// Sum of the messages of every non-silent contributor
    pub messages: u128,
    /// Number of non-silent contributors
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEncoder {
    room_size: usize,
}

impl SlotEncoder {
    /// # Errors
    /// Returns an error if the room size is outside `MIN_ROOM_SIZE..=MAX_ROOM_SIZE`.
    pub fn new(room_size: usize) -> Result<Self, DcNetError> {
        check_room_size(room_size)?;
        Ok(Self { room_size })
    }

    pub fn room_size(&self) -> usize {
        self.room_size
    }

    fn modulus(&self) -> u128 {
        self.room_size as u128 + 1
    }

    /// Encodes a message; `0` means silence.
    pub fn encode(&self, message: u64) -> SlotValue {
        if message == 0 {
            0
        } else {
            message as u128 * self.modulus() + 1
        }
    }

    /// Splits an aggregate into message sum and contributor count.
    pub fn decode(&self, aggregate: SlotValue) -> SlotSum {
        SlotSum {
            messages: aggregate / self.modulus(),
            count: (aggregate % self.modulus()) as usize,
        }
    }

    /// Largest aggregate `n` honest contributions can produce.
    pub fn max_aggregate(&self) -> SlotValue {
        self.encode(u64::MAX) * self.room_size as u128
    }

    /// Checks that an aggregate could have come from this room.
    pub fn check_aggregate(&self, aggregate: SlotValue) -> Result<SlotSum, DcNetError> {
        if aggregate > self.max_aggregate() {
            return Err(DcNetError::EncodingError(format!(
                "aggregate {} exceeds room maximum {}",
                aggregate,
                self.max_aggregate()
            )));
        }
        Ok(self.decode(aggregate))
    }
}
