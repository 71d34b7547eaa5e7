//! Offline operation queue.
//!
//! Mutations that fail because the backend is unreachable are recorded
//! here, per establishment and in order, until the synchronizer replays
//! them.

mod operation;
mod store;

pub use operation::{Mutation, OfflineOperation};
pub use store::{OfflineQueue, QueueError};
