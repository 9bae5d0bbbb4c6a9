//! Durable request queue: the Change data model and its file-backed store.

pub mod change;
pub mod queue;

pub use change::{Change, ChangeStatus, ElementDescriptor};
pub use queue::ChangeStore;
