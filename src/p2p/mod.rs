//! Networking for a room: wire messages, the transport seam and its
//! implementations
//!
//! # Channels
//!
//! ```text
//!   participant i ──pairwise──► participant j     key shares, confirmations,
//!                 ◄─pairwise──                    barrier request/reply
//!
//!   participant i ──broadcast──► every participant (i included)
//!                                                 round contributions
//! ```
//!
//! The session task talks to a `RoomTransport`; the receive task drains the
//! matching `BroadcastSource`. `MemoryHub` wires a room inside one process,
//! the TCP transport (feature `distributed`) connects separate processes.

pub mod memory;
pub mod messages;
pub mod traits;
#[cfg(feature = "distributed")]
pub mod transport;

pub use memory::{MemoryBroadcastSource, MemoryHub, MemoryTransport};
pub use messages::{Attestation, CommandTag, DcNetMessage, ParticipantIndex, RoundContribution};
pub use traits::{BroadcastSource, RoomTransport, TransportError, TransportResult};
#[cfg(feature = "distributed")]
pub use transport::{TcpBroadcastSource, TcpRoomTransport};
