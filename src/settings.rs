//! Render and viewer settings, persisted as JSON between runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::render::LateFieldPolicy;
use crate::state::QueuePolicy;
use crate::util::Result;

/// Knobs for the chunked render and the handoff to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Rays per evaluator call.
    pub chunk_size: usize,
    /// Pixel stride used when generating rays.
    pub render_stride: usize,
    /// Consumer poll timeout; also bounds how long a stop request can go unseen.
    pub poll_interval_ms: u64,
    pub queue_policy: QueuePolicy,
    pub late_fields: LateFieldPolicy,
    /// Slice the batch prior depth into chunks.
    pub use_prior_depth: bool,
    /// Tier field read as point color.
    pub color_field: String,
    /// Tier field read as per-ray depth.
    pub depth_field: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            render_stride: 1,
            poll_interval_ms: 100,
            queue_policy: QueuePolicy::Unbounded,
            late_fields: LateFieldPolicy::Ignore,
            use_prior_depth: false,
            color_field: "rgb".into(),
            depth_field: "depth".into(),
        }
    }
}

impl RenderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Clamp values that would stall or divide by zero.
    pub fn validated(mut self) -> Self {
        self.chunk_size = self.chunk_size.max(1);
        self.render_stride = self.render_stride.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        if let QueuePolicy::DropOldest { capacity } = &mut self.queue_policy {
            *capacity = (*capacity).max(1);
        }
        self
    }
}

/// How a consumer draws published point clouds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerOptions {
    /// Point radius; sample points scale it by their weight.
    pub point_size: f32,
    pub point_opacity: f32,
    pub show_normals: bool,
    /// Draw ray origin to sample depth lines when samples are present.
    pub show_depth: bool,
    /// Length of drawn normal segments in scene units.
    pub normal_length: f32,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            point_size: 0.01,
            point_opacity: 0.8,
            show_normals: true,
            show_depth: true,
            normal_length: 0.1,
        }
    }
}

/// Everything that persists between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub render: RenderConfig,
    pub viewer: ViewerOptions,

    // Demo image
    pub image_width: usize,
    pub image_height: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            render: RenderConfig::default(),
            viewer: ViewerOptions::default(),
            image_width: 320,
            image_height: 240,
        }
    }
}

impl Settings {
    /// Get settings file path
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("rayflow");
            p.push("settings.json");
            p
        })
    }

    /// Load settings from the default location, falling back to defaults.
    pub fn load() -> Self {
        let settings = Self::path()
            .and_then(|p| Self::load_from(&p).ok())
            .unwrap_or_default();
        settings.validated()
    }

    /// Load settings from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        Ok(settings.validated())
    }

    /// Save settings to the default location
    pub fn save(&self) {
        if let Some(path) = Self::path() {
            if let Err(e) = self.save_to(&path) {
                tracing::warn!("could not save settings to {}: {}", path.display(), e);
            }
        }
    }

    /// Save settings to an explicit file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn validated(mut self) -> Self {
        self.render = self.render.validated();
        self.image_width = self.image_width.max(1);
        self.image_height = self.image_height.max(1);
        if !self.viewer.point_size.is_finite() || self.viewer.point_size <= 0.0 {
            self.viewer.point_size = ViewerOptions::default().point_size;
        }
        self.viewer.point_opacity = if self.viewer.point_opacity.is_finite() {
            self.viewer.point_opacity.clamp(0.0, 1.0)
        } else {
            ViewerOptions::default().point_opacity
        };
        self
    }
}
