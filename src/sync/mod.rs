//! Consistency with the durable tier.
//!
//! - [`write_queue`]: bounded queue of durable writes awaiting replay
//! - [`flusher`]: replays the queue against the durable tier
//! - [`migration`]: lock-protected moves of items between containers

pub mod flusher;
pub mod migration;
pub mod write_queue;
