//! Per-session render state machine.
//!
//! ```text
//! Idle --start_render--> Rendering --publish--> Processing --> Visualizing
//!  ^                        |                       |              |
//!  |                   mark_error                 (bad payload)    |
//!  |                        v                       v              |
//!  +------- reset -------- Error <------------------+              |
//!  +------------------------ finish_visualizing -------------------+
//! ```
//!
//! Transitions are serialized by one lock that also guards the current
//! output slot. The state itself lives in an atomic so queries never wait
//! on a transition, which keeps `Processing` observable mid-publish.
//!
//! Every `start_render` and `reset` opens a new generation. A publish only
//! lands if its generation is still current when conversion finishes, and
//! `finish_visualizing` only idles the machine for the current generation.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use super::output::{RawRenderData, SessionRenderOutput};
use super::queue::{HandoffQueue, QueuePolicy};
use crate::util::Error;

/// Render cycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RenderState {
    Idle = 0,
    Rendering = 1,
    Processing = 2,
    Visualizing = 3,
    Error = 4,
}

impl RenderState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Rendering,
            2 => Self::Processing,
            3 => Self::Visualizing,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for RenderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Rendering => "rendering",
            Self::Processing => "processing",
            Self::Visualizing => "visualizing",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// What `publish` did with a payload.
#[derive(Debug)]
pub enum PublishOutcome {
    /// Stored in the slot and queued for the consumer.
    Published(Arc<SessionRenderOutput>),
    /// Not in `Rendering` (or reset mid-publish); payload discarded.
    Ignored(RenderState),
    /// Payload was malformed; machine is now in `Error`.
    Failed(Error),
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }
}

#[derive(Default)]
struct Slot {
    current: Option<Arc<SessionRenderOutput>>,
    published: u64,
    generation: u64,
}

/// Guards one render -> process -> publish cycle of a session.
pub struct RenderStateMachine {
    state: AtomicU8,
    slot: Mutex<Slot>,
    queue: HandoffQueue<Arc<SessionRenderOutput>>,
}

impl RenderStateMachine {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            state: AtomicU8::new(RenderState::Idle as u8),
            slot: Mutex::new(Slot::default()),
            queue: HandoffQueue::new(policy),
        }
    }

    #[inline]
    pub fn state(&self) -> RenderState {
        RenderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Only call with `slot` locked.
    #[inline]
    fn set_state(&self, state: RenderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `Idle -> Rendering`. Returns false (and does nothing) otherwise.
    pub fn start_render(&self) -> bool {
        let mut slot = self.slot.lock();
        if self.state() != RenderState::Idle {
            return false;
        }
        slot.generation += 1;
        self.set_state(RenderState::Rendering);
        true
    }

    /// Turn a raw payload into the session output and hand it off.
    ///
    /// Valid only from `Rendering`. Conversion runs outside the lock; if a
    /// `reset` lands in between, the result is discarded even when a newer
    /// render has since moved the machine back to `Processing`.
    pub fn publish(&self, raw: RawRenderData) -> PublishOutcome {
        let (sequence, generation) = {
            let slot = self.slot.lock();
            let state = self.state();
            if state != RenderState::Rendering {
                debug!(%state, "publish ignored");
                return PublishOutcome::Ignored(state);
            }
            self.set_state(RenderState::Processing);
            (slot.published, slot.generation)
        };

        let built = SessionRenderOutput::from_raw(raw, sequence);

        let mut slot = self.slot.lock();
        let state = self.state();
        if state != RenderState::Processing || slot.generation != generation {
            debug!(%state, generation, current = slot.generation, "publish superseded by reset");
            return PublishOutcome::Ignored(state);
        }

        match built {
            Ok(mut output) => {
                output.metadata.generation = generation;
                let output = Arc::new(output);
                slot.current = Some(Arc::clone(&output));
                slot.published += 1;
                if self.queue.push(Arc::clone(&output)).is_some() {
                    debug!("handoff queue full, dropped oldest output");
                }
                self.set_state(RenderState::Visualizing);
                debug!(sequence, points = output.num_points(), "published render output");
                PublishOutcome::Published(output)
            }
            Err(e) => {
                error!("Error processing render output: {}", e);
                self.set_state(RenderState::Error);
                PublishOutcome::Failed(e)
            }
        }
    }

    /// `Rendering -> Error`, for callers whose render failed.
    pub fn mark_error(&self) -> bool {
        let _slot = self.slot.lock();
        if self.state() != RenderState::Rendering {
            return false;
        }
        self.set_state(RenderState::Error);
        true
    }

    /// `Visualizing -> Idle`, once the consumer has shown an output of
    /// `generation`. Outputs from an earlier generation leave state alone.
    pub fn finish_visualizing(&self, generation: u64) -> bool {
        let slot = self.slot.lock();
        if self.state() != RenderState::Visualizing || slot.generation != generation {
            return false;
        }
        self.set_state(RenderState::Idle);
        true
    }

    /// Back to `Idle` from anywhere; clears the slot and pending outputs.
    pub fn reset(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        self.set_state(RenderState::Idle);
        slot.current = None;
        let drained = self.queue.drain();
        if drained > 0 {
            debug!(drained, "reset discarded pending outputs");
        }
    }

    /// Most recently published output, kept for late readers.
    pub fn current_output(&self) -> Option<Arc<SessionRenderOutput>> {
        self.slot.lock().current.clone()
    }

    /// Next queued output, waiting up to `timeout`.
    pub fn poll(&self, timeout: Duration) -> Option<Arc<SessionRenderOutput>> {
        self.queue.poll(timeout)
    }

    /// Discard queued outputs without touching state or slot.
    pub fn drain_queue(&self) -> usize {
        self.queue.drain()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Outputs published since creation.
    pub fn published(&self) -> u64 {
        self.slot.lock().published
    }

    /// Current render generation.
    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    pub fn is_idle(&self) -> bool {
        self.state() == RenderState::Idle
    }

    pub fn is_rendering(&self) -> bool {
        self.state() == RenderState::Rendering
    }

    pub fn is_processing(&self) -> bool {
        self.state() == RenderState::Processing
    }

    pub fn is_visualizing(&self) -> bool {
        self.state() == RenderState::Visualizing
    }

    pub fn has_error(&self) -> bool {
        self.state() == RenderState::Error
    }
}

impl Default for RenderStateMachine {
    fn default() -> Self {
        Self::new(QueuePolicy::Unbounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::output::{COLORS, DEPTHS, POINTS};
    use crate::util::Tensor;

    fn cloud(n: usize) -> RawRenderData {
        RawRenderData::new()
            .with(POINTS, Tensor::zeros((n, 3)))
            .with(COLORS, Tensor::zeros((n, 3)))
            .with(DEPTHS, Tensor::zeros(n))
    }

    #[test]
    fn test_initial_state() {
        let m = RenderStateMachine::default();
        assert!(m.is_idle());
        assert!(m.current_output().is_none());
        assert_eq!(m.pending(), 0);
    }

    #[test]
    fn test_full_cycle() {
        let m = RenderStateMachine::default();
        assert!(m.start_render());
        assert!(m.is_rendering());
        // Already rendering: not restarted
        assert!(!m.start_render());

        let out = match m.publish(cloud(3)) {
            PublishOutcome::Published(o) => o,
            other => panic!("unexpected {:?}", other),
        };
        assert!(m.is_visualizing());
        assert_eq!(out.num_points(), 3);
        assert!(Arc::ptr_eq(&m.current_output().unwrap(), &out));
        assert!(Arc::ptr_eq(&m.poll(Duration::ZERO).unwrap(), &out));
        assert_eq!(out.metadata.generation, m.generation());

        assert!(m.finish_visualizing(out.metadata.generation));
        assert!(m.is_idle());
    }

    #[test]
    fn test_publish_outside_rendering_is_noop() {
        let m = RenderStateMachine::default();
        assert!(matches!(m.publish(cloud(1)), PublishOutcome::Ignored(RenderState::Idle)));
        assert!(m.is_idle());
        assert!(m.current_output().is_none());
        assert_eq!(m.pending(), 0);

        assert!(!m.finish_visualizing(m.generation()));
        assert!(!m.mark_error());
        assert!(m.is_idle());
    }

    #[test]
    fn test_malformed_publish_goes_to_error() {
        let m = RenderStateMachine::default();
        m.start_render();
        let outcome = m.publish(RawRenderData::new());
        assert!(matches!(outcome, PublishOutcome::Failed(Error::MalformedOutput(_))));
        assert!(m.has_error());
        assert!(m.current_output().is_none());
        assert_eq!(m.pending(), 0);

        // Error does not auto-recover
        assert!(!m.start_render());
        m.reset();
        assert!(m.start_render());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let m = RenderStateMachine::default();
        m.start_render();
        m.publish(cloud(2));
        assert_eq!(m.pending(), 1);

        m.reset();
        m.reset();
        assert!(m.is_idle());
        assert!(m.current_output().is_none());
        assert_eq!(m.pending(), 0);
    }

    #[test]
    fn test_fifo_and_current_slot() {
        let m = RenderStateMachine::default();
        for n in 1..=3 {
            assert!(m.start_render());
            assert!(m.publish(cloud(n)).is_published());
            assert_eq!(m.current_output().unwrap().num_points(), n);
            assert!(m.finish_visualizing(m.generation()));
        }
        let seen: Vec<_> = std::iter::from_fn(|| m.poll(Duration::ZERO))
            .map(|o| (o.metadata.sequence, o.num_points()))
            .collect();
        assert_eq!(seen, vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(m.published(), 3);
        // Slot survives draining
        assert_eq!(m.current_output().unwrap().num_points(), 3);
    }

    #[test]
    fn test_mark_error() {
        let m = RenderStateMachine::default();
        m.start_render();
        assert!(m.mark_error());
        assert!(m.has_error());
        assert!(matches!(m.publish(cloud(1)), PublishOutcome::Ignored(RenderState::Error)));
    }

    #[test]
    fn test_drop_oldest_policy() {
        let m = RenderStateMachine::new(QueuePolicy::DropOldest { capacity: 1 });
        for n in 1..=2 {
            m.start_render();
            m.publish(cloud(n));
            m.finish_visualizing(m.generation());
        }
        assert_eq!(m.pending(), 1);
        assert_eq!(m.poll(Duration::ZERO).unwrap().num_points(), 2);
    }

    #[test]
    fn test_stale_finish_keeps_new_render() {
        let m = RenderStateMachine::default();
        m.start_render();
        let old = match m.publish(cloud(1)) {
            PublishOutcome::Published(o) => o,
            other => panic!("unexpected {:?}", other),
        };
        m.reset();
        m.start_render();
        let new = match m.publish(cloud(2)) {
            PublishOutcome::Published(o) => o,
            other => panic!("unexpected {:?}", other),
        };
        assert!(new.metadata.generation > old.metadata.generation);

        // Consumer finishing the old output must not idle the new one
        assert!(!m.finish_visualizing(old.metadata.generation));
        assert!(m.is_visualizing());
        assert!(m.finish_visualizing(new.metadata.generation));
        assert!(m.is_idle());
    }

    #[test]
    fn test_reset_during_publish_discards_stale_output() {
        const BIG: usize = 2_000_000;
        for _ in 0..3 {
            let m = Arc::new(RenderStateMachine::default());
            assert!(m.start_render());

            let stale = {
                let m = Arc::clone(&m);
                std::thread::spawn(move || m.publish(cloud(BIG)))
            };
            // Wait until the slow publish has claimed the render
            while m.is_rendering() {
                std::thread::yield_now();
            }
            m.reset();
            assert!(m.start_render());
            let fresh = m.publish(cloud(12));
            let stale = stale.join().unwrap();

            let PublishOutcome::Published(fresh) = fresh else {
                panic!("fresh render not published: {:?}", fresh);
            };
            if let PublishOutcome::Published(old) = &stale {
                // Finished before the reset; the reset dropped it
                assert!(old.metadata.generation < fresh.metadata.generation);
            }
            let current = m.current_output().unwrap();
            assert!(Arc::ptr_eq(&current, &fresh));
            assert_eq!(current.num_points(), 12);
            assert!(m.is_visualizing());

            let queued: Vec<usize> = std::iter::from_fn(|| m.poll(Duration::ZERO))
                .map(|o| o.num_points())
                .collect();
            assert_eq!(queued, vec![12]);
        }
    }
}
