//! Client sessions and their visualization consumers.
//!
//! Every connected client gets its own [`Session`]: a render state machine,
//! a handoff queue and a consumer thread feeding a [`Display`]. Nothing is
//! shared between sessions.

mod consumer;
mod manager;

pub use consumer::*;
pub use manager::*;
