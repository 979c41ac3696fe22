//! Background consumer that moves published outputs onto a display.
//!
//! One thread per session. It polls the session's handoff queue with a
//! short timeout so a stop request is noticed promptly, and never touches
//! the render path.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::ClientId;
use crate::settings::ViewerOptions;
use crate::state::{RenderStateMachine, SessionRenderOutput};
use crate::util::{Bounds, Result, Vec3};

/// Something that shows published outputs.
pub trait Display: Send {
    fn apply(&mut self, output: Arc<SessionRenderOutput>) -> Result<()>;
}

/// Display that only remembers what it was given.
#[derive(Clone, Default)]
pub struct RecordingDisplay {
    applied: Arc<Mutex<Vec<Arc<SessionRenderOutput>>>>,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs applied so far, in order.
    pub fn applied(&self) -> Vec<Arc<SessionRenderOutput>> {
        self.applied.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.applied.lock().len()
    }
}

impl Display for RecordingDisplay {
    fn apply(&mut self, output: Arc<SessionRenderOutput>) -> Result<()> {
        self.applied.lock().push(output);
        Ok(())
    }
}

/// One render sample, sized by its weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplePoint {
    pub position: Vec3,
    pub color: Vec3,
    pub radius: f32,
    pub opacity: f32,
}

/// Drawable snapshot of the latest output.
#[derive(Clone, Debug)]
pub struct ViewerScene {
    pub points: Vec<Vec3>,
    pub colors: Vec<Vec3>,
    pub point_size: f32,
    pub normal_lines: Option<Vec<[Vec3; 2]>>,
    /// Weighted sample points, when the render carried samples.
    pub samples: Vec<SamplePoint>,
    /// Ray origin to sample depth, drawn when `show_depth` is on.
    pub depth_lines: Option<Vec<[Vec3; 2]>>,
    pub bounds: Option<Bounds>,
    pub status: String,
}

/// Display that replaces a shared scene snapshot for a front end to draw.
#[derive(Clone)]
pub struct SceneDisplay {
    options: ViewerOptions,
    scene: Arc<Mutex<Option<ViewerScene>>>,
}

impl SceneDisplay {
    pub fn new(options: ViewerOptions) -> Self {
        Self {
            options,
            scene: Arc::new(Mutex::new(None)),
        }
    }

    /// Latest scene, if anything was applied yet.
    pub fn scene(&self) -> Option<ViewerScene> {
        self.scene.lock().clone()
    }
}

impl Display for SceneDisplay {
    fn apply(&mut self, output: Arc<SessionRenderOutput>) -> Result<()> {
        let opts = &self.options;
        let normal_lines = (opts.show_normals && output.has_normals())
            .then(|| output.normal_segments(opts.normal_length));

        let (samples, depth_lines) = match &output.samples {
            Some(cloud) => {
                let points = cloud
                    .points
                    .iter()
                    .zip(&cloud.colors)
                    .zip(&cloud.weights)
                    .map(|((p, c), w)| SamplePoint {
                        position: *p,
                        color: *c,
                        radius: opts.point_size * *w,
                        opacity: opts.point_opacity,
                    })
                    .collect();
                let lines = (opts.show_depth && !cloud.ray_depths.is_empty()).then(|| cloud.depth_segments());
                (points, lines)
            }
            None => (Vec::new(), None),
        };

        let status = match &output.samples {
            Some(cloud) => format!("Points: {} (samples: {})", output.num_points(), cloud.len()),
            None => format!("Points: {}", output.num_points()),
        };
        let scene = ViewerScene {
            points: output.points.clone(),
            colors: output.colors.clone(),
            point_size: opts.point_size,
            normal_lines,
            samples,
            depth_lines,
            bounds: output.bounds(),
            status,
        };
        *self.scene.lock() = Some(scene);
        Ok(())
    }
}

/// Handle to a session's consumer thread.
pub struct ConsumerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Spawn the consumer loop for one session.
    pub fn spawn(
        client: ClientId,
        machine: Arc<RenderStateMachine>,
        display: Box<dyn Display>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("rayflow-consumer-{}", client))
                .spawn(move || consumer_loop(client, machine, display, stop, poll_interval))?
        };

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the loop to exit at its next poll timeout.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to finish.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("consumer thread panicked");
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Main consumer loop - runs in background thread.
fn consumer_loop(
    client: ClientId,
    machine: Arc<RenderStateMachine>,
    mut display: Box<dyn Display>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    debug!(client, "consumer started");
    while !stop.load(Ordering::Acquire) {
        let Some(output) = machine.poll(poll_interval) else {
            continue;
        };

        let _span = tracing::info_span!("apply_output", client, sequence = output.metadata.sequence).entered();
        let applied = panic::catch_unwind(AssertUnwindSafe(|| display.apply(Arc::clone(&output))));
        match applied {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(client, "Error in visualization loop: {}", e),
            Err(_) => warn!(client, "display panicked while applying output"),
        }
        if !machine.finish_visualizing(output.metadata.generation) {
            debug!(client, generation = output.metadata.generation, "output outlived its render");
        }
    }

    let drained = machine.drain_queue();
    debug!(client, drained, "consumer stopped");
}
