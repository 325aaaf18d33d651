//! The two agents, composed from the loader, attachment, state, consumer
//! and lifecycle pieces.

pub mod fcntl;
pub mod guard;
