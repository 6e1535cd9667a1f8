//! Room membership, fixed for the lifetime of a session.

use std::net::SocketAddr;

use crate::error::DcNetError;
use crate::p2p::messages::ParticipantIndex;
use crate::scheduler::ResendPolicy;
use crate::slot::check_room_size;

/// Source of room membership, queried once at session start.
pub trait RoomDirectory {
    fn room_size(&self) -> usize;

    fn node_address(&self, index: ParticipantIndex) -> Option<SocketAddr>;

    fn non_probabilistic_mode(&self) -> bool;
}

/// Directory backed by a fixed address list (index `i` is entry `i - 1`).
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    addresses: Vec<SocketAddr>,
    non_probabilistic: bool,
}

impl StaticDirectory {
    pub fn new(addresses: Vec<SocketAddr>, non_probabilistic: bool) -> Self {
        Self {
            addresses,
            non_probabilistic,
        }
    }
}

impl RoomDirectory for StaticDirectory {
    fn room_size(&self) -> usize {
        self.addresses.len()
    }

    fn node_address(&self, index: ParticipantIndex) -> Option<SocketAddr> {
        index
            .checked_sub(1)
            .and_then(|position| self.addresses.get(position))
            .copied()
    }

    fn non_probabilistic_mode(&self) -> bool {
        self.non_probabilistic
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    size: usize,
    addresses: Vec<SocketAddr>,
    policy: ResendPolicy,
}

impl Room {
    /// Room without network addresses, for in-process transports.
    pub fn local(size: usize, policy: ResendPolicy) -> Result<Self, DcNetError> {
        check_room_size(size)?;
        Ok(Self {
            size,
            addresses: Vec::new(),
            policy,
        })
    }

    pub fn from_directory<D: RoomDirectory + ?Sized>(directory: &D) -> Result<Self, DcNetError> {
        let size = directory.room_size();
        check_room_size(size)?;
        let addresses = (1..=size)
            .map(|index| {
                directory.node_address(index).ok_or_else(|| {
                    DcNetError::InvalidParameter(format!("no address for participant {}", index))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            size,
            addresses,
            policy: ResendPolicy::from_non_probabilistic_mode(directory.non_probabilistic_mode()),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn policy(&self) -> ResendPolicy {
        self.policy
    }

    pub fn address(&self, index: ParticipantIndex) -> Option<SocketAddr> {
        index
            .checked_sub(1)
            .and_then(|position| self.addresses.get(position))
            .copied()
    }

    pub fn contains(&self, index: ParticipantIndex) -> bool {
        (1..=self.size).contains(&index)
    }
}
