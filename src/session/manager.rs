//! Per-client sessions: registry, lifecycle hooks and event routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::consumer::{ConsumerHandle, Display};
use crate::render::{ChunkAggregator, Evaluator, RayBatch};
use crate::settings::RenderConfig;
use crate::state::{PublishOutcome, RawRenderData, RenderStateMachine, SessionRenderOutput};
use crate::util::{Mat4, Result};

/// Connection-layer identifier of a client.
pub type ClientId = u64;

/// Client viewpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    /// Vertical field of view in radians.
    pub fov: f32,
    pub aspect: f32,
    /// Camera-to-world transform.
    pub c2w: Mat4,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            fov: std::f32::consts::FRAC_PI_3,
            aspect: 4.0 / 3.0,
            c2w: Mat4::IDENTITY,
        }
    }
}

/// Something a client did that may need a new render.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    CameraMoved(CameraState),
    /// Re-render from the last known camera.
    Refresh,
}

/// Produces the ray batch for a viewpoint.
pub trait RaySource: Send + Sync {
    fn rays_for(&self, camera: &CameraState) -> Result<RayBatch>;
}

/// One client's isolated render/visualize lifecycle.
pub struct Session {
    id: ClientId,
    machine: Arc<RenderStateMachine>,
    consumer: Mutex<ConsumerHandle>,
    camera: Mutex<Option<CameraState>>,
}

impl Session {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state_machine(&self) -> &Arc<RenderStateMachine> {
        &self.machine
    }

    pub fn current_output(&self) -> Option<Arc<SessionRenderOutput>> {
        self.machine.current_output()
    }

    pub fn last_camera(&self) -> Option<CameraState> {
        *self.camera.lock()
    }

    pub fn is_consuming(&self) -> bool {
        self.consumer.lock().is_running()
    }

    /// Stop the consumer loop and wait for it.
    fn shutdown(&self) {
        self.consumer.lock().stop();
    }
}

/// Owns every live session and drives their render cycles.
///
/// Sessions render independently; there is no global render lock.
pub struct SessionManager {
    sessions: RwLock<HashMap<ClientId, Arc<Session>>>,
    evaluator: Arc<dyn Evaluator>,
    rays: Arc<dyn RaySource>,
    aggregator: ChunkAggregator,
    config: RenderConfig,
    ready: AtomicBool,
}

impl SessionManager {
    pub fn new(evaluator: Arc<dyn Evaluator>, rays: Arc<dyn RaySource>, config: RenderConfig) -> Self {
        let config = config.validated();
        Self {
            sessions: RwLock::new(HashMap::new()),
            evaluator,
            rays,
            aggregator: ChunkAggregator::from_config(&config),
            config,
            ready: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Client events are dropped until the manager is marked ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Register a client with a fresh state machine, queue and consumer.
    ///
    /// A reconnect under the same id replaces (and shuts down) the old session.
    pub fn on_connect(&self, id: ClientId, display: Box<dyn Display>) -> Result<Arc<Session>> {
        let machine = Arc::new(RenderStateMachine::new(self.config.queue_policy));
        let consumer = ConsumerHandle::spawn(
            id,
            Arc::clone(&machine),
            display,
            self.config.poll_interval(),
        )?;

        let session = Arc::new(Session {
            id,
            machine,
            consumer: Mutex::new(consumer),
            camera: Mutex::new(None),
        });

        let previous = self.sessions.write().insert(id, Arc::clone(&session));
        if let Some(old) = previous {
            warn!(client = id, "client reconnected, replacing session");
            old.shutdown();
        }
        info!(client = id, "client connected");
        Ok(session)
    }

    /// Stop the client's consumer and forget the session.
    ///
    /// Returns false for unknown clients.
    pub fn on_disconnect(&self, id: ClientId) -> bool {
        let removed = self.sessions.write().remove(&id);
        match removed {
            Some(session) => {
                session.shutdown();
                info!(client = id, "client disconnected");
                true
            }
            None => false,
        }
    }

    /// Route a client event to its session and run a render cycle.
    ///
    /// Returns `Ok(None)` when the event was dropped: unknown client, not
    /// ready, no camera yet, or a render already in flight.
    pub fn on_client_event(
        &self,
        id: ClientId,
        event: ClientEvent,
    ) -> Result<Option<Arc<SessionRenderOutput>>> {
        let Some(session) = self.session(id) else {
            debug!(client = id, "event for unknown client dropped");
            return Ok(None);
        };
        if !self.is_ready() {
            return Ok(None);
        }

        let camera = match event {
            ClientEvent::CameraMoved(camera) => {
                *session.camera.lock() = Some(camera);
                camera
            }
            ClientEvent::Refresh => match session.last_camera() {
                Some(camera) => camera,
                None => return Ok(None),
            },
        };

        self.run_cycle(&session, &camera)
    }

    fn run_cycle(&self, session: &Session, camera: &CameraState) -> Result<Option<Arc<SessionRenderOutput>>> {
        let machine = &session.machine;
        if !machine.start_render() {
            debug!(client = session.id, state = %machine.state(), "render in flight, event dropped");
            return Ok(None);
        }

        let _span = tracing::info_span!("render_cycle", client = session.id).entered();
        let raw = self.rays.rays_for(camera).and_then(|batch| {
            let output = self.aggregator.render(&batch, self.evaluator.as_ref())?;
            RawRenderData::from_aggregated(&output, &batch, &self.config.color_field, &self.config.depth_field)
        });

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                warn!(client = session.id, "render failed: {}", e);
                machine.mark_error();
                return Err(e);
            }
        };

        match machine.publish(raw) {
            PublishOutcome::Published(output) => Ok(Some(output)),
            PublishOutcome::Ignored(_) => Ok(None),
            PublishOutcome::Failed(e) => Err(e),
        }
    }

    pub fn session(&self, id: ClientId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect every client.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.shutdown();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{BatchContext, Chunk, ChunkResult, ImageGrid};
    use crate::session::RecordingDisplay;
    use crate::util::{Error, Tensor, Vec3};

    struct LineRays;

    impl RaySource for LineRays {
        fn rays_for(&self, camera: &CameraState) -> Result<RayBatch> {
            let origin = camera.c2w.w_axis.truncate();
            RayBatch::new(
                Tensor::from_vec3s(&[origin; 4]),
                Tensor::from_vec3s(&[Vec3::Z; 4]),
                BatchContext::default(),
                ImageGrid::new(2, 2, 1),
            )
        }
    }

    fn flat_eval(c: &Chunk) -> Result<ChunkResult> {
        Ok(ChunkResult::coarse([
            ("rgb", Tensor::zeros((c.len(), 3))),
            ("depth", Tensor::column(vec![2.0; c.len()])),
        ]))
    }

    fn manager() -> SessionManager {
        let config = RenderConfig {
            chunk_size: 3,
            poll_interval_ms: 5,
            ..Default::default()
        };
        SessionManager::new(Arc::new(flat_eval), Arc::new(LineRays), config)
    }

    #[test]
    fn test_connect_disconnect() {
        let m = manager();
        let s = m.on_connect(7, Box::new(RecordingDisplay::new())).unwrap();
        assert_eq!(m.client_ids(), vec![7]);
        assert!(s.is_consuming());
        assert!(s.current_output().is_none());

        assert!(m.on_disconnect(7));
        assert!(!s.is_consuming());
        assert!(m.is_empty());
        assert!(!m.on_disconnect(7));
    }

    #[test]
    fn test_events_dropped_until_ready() {
        let m = manager();
        m.on_connect(1, Box::new(RecordingDisplay::new())).unwrap();
        let moved = ClientEvent::CameraMoved(CameraState::default());

        assert!(m.on_client_event(1, moved.clone()).unwrap().is_none());
        assert!(m.on_client_event(99, moved.clone()).unwrap().is_none());

        m.set_ready(true);
        let out = m.on_client_event(1, moved).unwrap().unwrap();
        assert_eq!(out.num_points(), 4);
        // Origin at zero, direction +Z, depth 2
        assert_eq!(out.points[0], Vec3::new(0.0, 0.0, 2.0));
    }

    #[test]
    fn test_refresh_needs_camera() {
        let m = manager();
        m.set_ready(true);
        m.on_connect(1, Box::new(RecordingDisplay::new())).unwrap();
        assert!(m.on_client_event(1, ClientEvent::Refresh).unwrap().is_none());
    }

    #[test]
    fn test_render_failure_marks_error() {
        let failing = |c: &Chunk| -> Result<ChunkResult> { Err(Error::evaluator(c.index, "nan weights")) };
        let m = SessionManager::new(Arc::new(failing), Arc::new(LineRays), RenderConfig::default());
        m.set_ready(true);
        let s = m.on_connect(3, Box::new(RecordingDisplay::new())).unwrap();

        let err = m
            .on_client_event(3, ClientEvent::CameraMoved(CameraState::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Evaluator { .. }));
        assert!(s.state_machine().has_error());

        // Stays in error until reset
        assert!(m.on_client_event(3, ClientEvent::Refresh).unwrap().is_none());
        s.state_machine().reset();
        assert!(s.state_machine().is_idle());
    }

    #[test]
    fn test_reconnect_replaces_session() {
        let m = manager();
        let first = m.on_connect(5, Box::new(RecordingDisplay::new())).unwrap();
        let second = m.on_connect(5, Box::new(RecordingDisplay::new())).unwrap();
        assert!(!first.is_consuming());
        assert!(second.is_consuming());
        assert!(Arc::ptr_eq(&m.session(5).unwrap(), &second));
        assert_eq!(m.len(), 1);
    }
}
