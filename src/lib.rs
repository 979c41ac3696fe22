//! # Rayflow
//!
//! Streams a large, fixed-order batch of rays through an expensive external
//! evaluator (a volumetric rendering function) in bounded chunks, merges the
//! per-chunk results back into image-shaped buffers and hands finished
//! renders to per-client visualization consumers without blocking the
//! producer.
//!
//! ## Modules
//!
//! - [`util`] - Basic types (ndarray-backed tensors, errors, math)
//! - [`render`] - Ray batches, chunking and the chunk aggregator
//! - [`state`] - Render state machine and handoff queue
//! - [`session`] - Per-client sessions and consumer loops
//! - [`settings`] - Persisted render and viewer settings
//! - [`synthetic`] - Analytic evaluator and ray source for demos and tests
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rayflow::prelude::*;
//! use rayflow::synthetic::{PinholeRaySource, SphereEvaluator};
//!
//! let manager = SessionManager::new(
//!     Arc::new(SphereEvaluator::default()),
//!     Arc::new(PinholeRaySource::new(320, 240, 1)),
//!     RenderConfig::default(),
//! );
//! manager.on_connect(1, Box::new(RecordingDisplay::new()))?;
//! manager.set_ready(true);
//! manager.on_client_event(1, ClientEvent::CameraMoved(CameraState::default()))?;
//! ```

pub mod util;
pub mod render;
pub mod state;
pub mod session;
pub mod settings;
pub mod synthetic;

// Re-export commonly used types
pub use util::{Error, Result, Tensor};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{Error, Result, Tensor};
    pub use crate::render::{
        AggregatedOutput, BatchContext, Chunk, ChunkAggregator, ChunkResult, Evaluator, ImageGrid,
        LateFieldPolicy, RayBatch, SampleData,
    };
    pub use crate::state::{
        HandoffQueue, PublishOutcome, QueuePolicy, RawRenderData, RenderState, RenderStateMachine,
        SampleCloud, SessionRenderOutput,
    };
    pub use crate::session::{
        CameraState, ClientEvent, ClientId, Display, RaySource, RecordingDisplay, SceneDisplay,
        Session, SessionManager,
    };
    pub use crate::settings::{RenderConfig, Settings, ViewerOptions};
}
