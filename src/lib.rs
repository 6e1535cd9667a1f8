//! DC-net anonymous broadcast
//!
//! This library implements a Dining-Cryptographers network: a fixed room of
//! `n` participants in which every participant may publish one message per
//! session without anyone learning who sent which message.
//!
//! ## Overview
//!
//! Every participant adds a blinding key to its slot value. The keys are
//! derived from pairwise Diffie-Hellman seeds and sum to zero over the room,
//! so the sum of all broadcasts is the sum of the slot values and nothing
//! else. Slot values encode a message together with a sender count; when
//! several participants send in the same round the collision is split with a
//! binary tree of rounds, half of which can be reconstructed locally.
//!
//! ## Key Components
//!
//! - **Slot encoding** (`slot`): message `m` becomes `m * (n + 1) + 1`
//! - **Round keys** (`keys`): pairwise key agreement and per-round blinding
//! - **Commitments** (`commitment`): Pedersen commitments with a proof of
//!   knowledge, used to attest contributions
//! - **Scheduler** (`scheduler`): binary-tree collision resolution
//! - **Session** (`session`, `receiver`): the per-participant protocol driver
//!   and its receive task
//! - **Transport** (`p2p`): in-memory and TCP rooms
//!
//! ## Example
//!
//! ```rust,no_run
//! use ark_bls12_381::G1Projective;
//! use dcnet::p2p::MemoryHub;
//! use dcnet::room::Room;
//! use dcnet::scheduler::ResendPolicy;
//! use dcnet::security::SessionRng;
//! use dcnet::session::{ParticipantSession, SessionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let room = Room::local(3, ResendPolicy::AverageComparison)?;
//! let messages = [0u64, 5, 0];
//!
//! let mut tasks = Vec::new();
//! for (position, (transport, source)) in MemoryHub::room(3).into_iter().enumerate() {
//!     let config = SessionConfig::new(position + 1, room.clone(), messages[position]);
//!     let session = ParticipantSession::<G1Projective>::new(config)?;
//!     tasks.push(tokio::spawn(async move {
//!         let mut rng = SessionRng::from_entropy();
//!         session.run(&transport, source, &mut rng).await
//!     }));
//! }
//!
//! for task in tasks {
//!     let report = task.await??;
//!     assert_eq!(report.messages, vec![5]);
//! }
//! # Ok(())
//! # }
//! ```

pub mod commitment;
pub mod error;
pub mod group;
pub mod keys;
pub mod p2p;
pub mod receiver;
pub mod room;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod slot;
pub mod utils;

pub use error::DcNetError;
pub use room::Room;
pub use scheduler::{simulate_room, ResendPolicy, RoundOutcome};
pub use session::{ParticipantSession, SessionConfig, SessionEvent, SessionReport};
pub use slot::SlotEncoder;
