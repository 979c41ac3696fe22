//! Analytic stand-ins for the external collaborators.
//!
//! [`PinholeRaySource`] turns a camera into a strided ray batch and
//! [`SphereEvaluator`] answers chunks with a closed-form sphere render.
//! Both are deterministic, which makes them handy for the CLI demo and tests.

use crate::render::{BatchContext, Chunk, ChunkResult, Evaluator, ImageGrid, RayBatch, SampleData, WEIGHTS};
use crate::session::{CameraState, RaySource};
use crate::util::{Result, Tensor, Vec3};

/// Generates one ray per strided pixel of a pinhole camera.
#[derive(Clone, Debug)]
pub struct PinholeRaySource {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub near: f32,
    pub far: f32,
}

impl PinholeRaySource {
    pub fn new(width: usize, height: usize, stride: usize) -> Self {
        Self {
            width,
            height,
            stride: stride.max(1),
            near: 0.1,
            far: 10.0,
        }
    }
}

impl RaySource for PinholeRaySource {
    fn rays_for(&self, camera: &CameraState) -> Result<RayBatch> {
        let grid = ImageGrid::new(self.height, self.width, self.stride);
        let focal = 0.5 * self.height as f32 / (0.5 * camera.fov).tan();
        let origin = camera.c2w.w_axis.truncate();

        let mut origins = Vec::with_capacity(grid.num_rays());
        let mut directions = Vec::with_capacity(grid.num_rays());
        for row in (0..self.height).step_by(grid.stride) {
            for col in (0..self.width).step_by(grid.stride) {
                // Camera looks down -Z with +Y up
                let local = Vec3::new(
                    (col as f32 + 0.5 - 0.5 * self.width as f32) / focal,
                    -(row as f32 + 0.5 - 0.5 * self.height as f32) / focal,
                    -1.0,
                );
                origins.push(origin);
                directions.push(camera.c2w.transform_vector3(local).normalize());
            }
        }

        let mut camera_params = vec![
            self.height as f32,
            self.width as f32,
            camera.fov,
            camera.aspect,
        ];
        camera_params.extend_from_slice(&camera.c2w.to_cols_array());

        let context = BatchContext {
            camera: Tensor::column(camera_params),
            depth_range: Tensor::column(vec![self.near, self.far]),
            src_rgbs: None,
            src_cameras: None,
        };
        RayBatch::new(
            Tensor::from_vec3s(&origins),
            Tensor::from_vec3s(&directions),
            context,
            grid,
        )
    }
}

/// Closed-form render of a diffuse sphere.
#[derive(Clone, Debug)]
pub struct SphereEvaluator {
    pub center: Vec3,
    pub radius: f32,
    /// Uniform samples per ray between near and far.
    pub samples: usize,
    /// Also emit a fine tier.
    pub fine: bool,
    pub background: Vec3,
}

impl Default for SphereEvaluator {
    fn default() -> Self {
        Self {
            center: Vec3::new(0.0, 0.0, -4.0),
            radius: 1.0,
            samples: 16,
            fine: true,
            background: Vec3::ONE,
        }
    }
}

impl SphereEvaluator {
    /// Distance to the first hit, if any.
    fn hit(&self, origin: Vec3, dir: Vec3) -> Option<f32> {
        let oc = origin - self.center;
        let b = oc.dot(dir);
        let c = oc.length_squared() - self.radius * self.radius;
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        let t = -b - disc.sqrt();
        (t > 0.0).then_some(t)
    }
}

impl Evaluator for SphereEvaluator {
    fn evaluate(&self, chunk: &Chunk) -> Result<ChunkResult> {
        let near = chunk.context.depth_range.data().first().copied().unwrap_or(0.0);
        let far = chunk.context.depth_range.data().get(1).copied().unwrap_or(1.0);
        let origins = chunk.origins.to_vec3s()?;
        let directions = chunk.directions.to_vec3s()?;
        let n = chunk.len();
        let s = self.samples.max(1);

        let mut rgb = Vec::with_capacity(n);
        let mut depth = Vec::with_capacity(n);
        let mut weights = vec![0.0f32; n * s];
        let mut z_values = Vec::with_capacity(n * s);
        let mut positions = Vec::with_capacity(n * s);
        let mut densities = Vec::with_capacity(n * s);

        let step = (far - near) / s as f32;
        for (i, (o, d)) in origins.iter().zip(&directions).enumerate() {
            match self.hit(*o, *d) {
                Some(t) => {
                    let normal = (*o + *d * t - self.center).normalize();
                    rgb.push(normal * 0.5 + 0.5);
                    depth.push(t);
                    let bin = (((t - near) / step).max(0.0) as usize).min(s - 1);
                    weights[i * s + bin] = 1.0;
                }
                None => {
                    rgb.push(self.background);
                    depth.push(far);
                }
            }
            for k in 0..s {
                let z = near + step * (k as f32 + 0.5);
                let p = *o + *d * z;
                z_values.push(z);
                positions.push(p);
                let inside = (p - self.center).length() <= self.radius;
                densities.push(if inside { 1.0 } else { 0.0 });
            }
        }

        let rgb = Tensor::from_vec3s(&rgb);
        let depth = Tensor::column(depth);
        let samples = SampleData {
            positions: Some(Tensor::from_vec3s(&positions)),
            features: None,
            colors: None,
            densities: Some(Tensor::column(densities)),
            z_values: Some(Tensor::new((n, s), z_values)?),
        };

        let mut result = ChunkResult::coarse([
            ("rgb", rgb.clone()),
            ("depth", depth.clone()),
            (WEIGHTS, Tensor::new((n, s), weights)?),
        ])
        .with_samples(samples);
        if self.fine {
            result = result.with_fine([("rgb", rgb), ("depth", depth)]);
        }
        Ok(result)
    }
}
