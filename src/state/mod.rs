//! Render state and the producer/consumer handoff.
//!
//! - [`RenderStateMachine`] - one render cycle per session, lock-guarded
//! - [`HandoffQueue`] - non-blocking push, timed poll
//! - [`SessionRenderOutput`] - what consumers receive

mod machine;
mod output;
mod queue;

pub use machine::*;
pub use output::*;
pub use queue::*;
