//! The unit of work handed to visualization consumers.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::render::{AggregatedOutput, RayBatch};
use crate::util::{Bounds, Error, Result, Tensor, Vec3};

pub const POINTS: &str = "points";
pub const COLORS: &str = "colors";
pub const DEPTHS: &str = "depths";
pub const NORMALS: &str = "normals";

/// Per-sample positions, `(M, 3)`. Presence turns on the sample cloud.
pub const SAMPLE_POINTS: &str = "sample_points";
/// Per-sample colors, `(M, 3)`.
pub const SAMPLE_COLORS: &str = "sample_colors";
/// Per-sample weights, `M` values.
pub const SAMPLE_WEIGHTS: &str = "sample_weights";
pub const RAY_ORIGINS: &str = "ray_origins";
pub const RAY_DIRECTIONS: &str = "ray_directions";
/// Sample depths along each ray, `(N, S)`.
pub const Z_VALUES: &str = "z_values";

/// Loosely-typed payload as produced by a render; validated on publish.
#[derive(Clone, Debug, Default)]
pub struct RawRenderData {
    fields: BTreeMap<String, Tensor>,
}

impl RawRenderData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Build a point cloud from a finished render.
    ///
    /// One point per ray at `origin + direction * depth`, colored by
    /// `color_field`. The fine tier is used when present.
    pub fn from_aggregated(
        output: &AggregatedOutput,
        batch: &RayBatch,
        color_field: &str,
        depth_field: &str,
    ) -> Result<Self> {
        let tier = output.best_tier();
        let depth = tier
            .get(depth_field)
            .ok_or_else(|| Error::malformed(format!("render has no '{}' field", depth_field)))?;
        let color = tier
            .get(color_field)
            .ok_or_else(|| Error::malformed(format!("render has no '{}' field", color_field)))?;

        let n = batch.len();
        if depth.data().len() != n {
            return Err(Error::shape(format!("{} depths", n), depth.shape()));
        }
        if color.data().len() != n * 3 {
            return Err(Error::shape(format!("{} x 3 colors", n), color.shape()));
        }

        let origins = batch.origins().to_vec3s()?;
        let directions = batch.directions().to_vec3s()?;
        let points: Vec<Vec3> = origins
            .iter()
            .zip(&directions)
            .zip(depth.data())
            .map(|((o, d), z)| *o + *d * *z)
            .collect();

        let colors = Tensor::new((n, 3), color.data().to_vec())?;
        let mut raw = Self::new()
            .with(POINTS, Tensor::from_vec3s(&points))
            .with(DEPTHS, Tensor::column(depth.data().to_vec()));
        raw.insert_samples(output, batch, &colors)?;
        raw.insert(COLORS, colors);
        Ok(raw)
    }

    /// Carry the render's sample positions over as a weighted cloud.
    ///
    /// Missing sample colors fall back to the owning ray's color, missing
    /// weights to 1.
    fn insert_samples(&mut self, output: &AggregatedOutput, batch: &RayBatch, ray_colors: &Tensor) -> Result<()> {
        let samples = &output.samples;
        let Some(positions) = &samples.positions else {
            return Ok(());
        };
        let n = batch.len();
        let m = positions.rows();
        if n == 0 || m % n != 0 {
            return Err(Error::shape(format!("a multiple of {} samples", n), positions.shape()));
        }
        let per_ray = m / n;

        let colors = match &samples.colors {
            Some(c) if c.data().len() == m * 3 => Tensor::new((m, 3), c.data().to_vec())?,
            _ => {
                let data = ray_colors
                    .data()
                    .chunks_exact(3)
                    .flat_map(|rgb| std::iter::repeat(rgb).take(per_ray).flatten().copied())
                    .collect();
                Tensor::new((m, 3), data)?
            }
        };
        let weights = match &samples.weights {
            Some(w) if w.data().len() == m => Tensor::column(w.data().to_vec()),
            _ => Tensor::column(vec![1.0; m]),
        };

        self.insert(SAMPLE_POINTS, positions.clone());
        self.insert(SAMPLE_COLORS, colors);
        self.insert(SAMPLE_WEIGHTS, weights);
        self.insert(RAY_ORIGINS, batch.origins().clone());
        self.insert(RAY_DIRECTIONS, batch.directions().clone());
        if let Some(z) = &samples.z_values {
            if z.rows() == n {
                self.insert(Z_VALUES, z.clone());
            }
        }
        Ok(())
    }
}

/// Bookkeeping attached when an output is published.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderMetadata {
    pub num_points: usize,
    pub completed_at: SystemTime,
    /// Publish counter of the owning session, starting at 0.
    pub sequence: u64,
    /// Render generation the output belongs to; set by the state machine.
    pub generation: u64,
}

/// Weighted per-sample points behind a render, with the rays they came from.
#[derive(Clone, Debug, Default)]
pub struct SampleCloud {
    pub points: Vec<Vec3>,
    pub colors: Vec<Vec3>,
    pub weights: Vec<f32>,
    pub ray_origins: Vec<Vec3>,
    pub ray_directions: Vec<Vec3>,
    /// Farthest sample depth per ray; empty when the render had none.
    pub ray_depths: Vec<f32>,
}

impl SampleCloud {
    fn from_raw(raw: &RawRenderData) -> Result<Option<Self>> {
        let Some(points) = raw.get(SAMPLE_POINTS) else {
            return Ok(None);
        };
        let points = points.to_vec3s()?;
        let m = points.len();
        let colors = required(raw, SAMPLE_COLORS)?.to_vec3s()?;
        let weights = required(raw, SAMPLE_WEIGHTS)?.data().to_vec();
        if colors.len() != m || weights.len() != m {
            return Err(Error::malformed(format!(
                "{} sample colors and {} weights for {} samples",
                colors.len(),
                weights.len(),
                m
            )));
        }

        let ray_origins = required(raw, RAY_ORIGINS)?.to_vec3s()?;
        let ray_directions = required(raw, RAY_DIRECTIONS)?.to_vec3s()?;
        if ray_directions.len() != ray_origins.len() {
            return Err(Error::malformed(format!(
                "{} ray directions for {} origins",
                ray_directions.len(),
                ray_origins.len()
            )));
        }
        let ray_depths = match raw.get(Z_VALUES) {
            Some(z) if z.rows() == ray_origins.len() => (0..z.rows())
                .filter_map(|i| z.row(i).and_then(|r| r.last().copied()))
                .collect(),
            Some(z) => return Err(Error::shape(format!("{} rows of z values", ray_origins.len()), z.shape())),
            None => Vec::new(),
        };

        Ok(Some(Self {
            points,
            colors,
            weights,
            ray_origins,
            ray_directions,
            ray_depths,
        }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `origin -> origin + direction * z` for every ray with a depth.
    pub fn depth_segments(&self) -> Vec<[Vec3; 2]> {
        self.ray_origins
            .iter()
            .zip(&self.ray_directions)
            .zip(&self.ray_depths)
            .map(|((o, d), z)| [*o, *o + *d * *z])
            .collect()
    }
}

/// One completed render cycle, ready to display.
#[derive(Clone, Debug)]
pub struct SessionRenderOutput {
    pub points: Vec<Vec3>,
    pub colors: Vec<Vec3>,
    pub depths: Vec<f32>,
    pub normals: Option<Vec<Vec3>>,
    pub samples: Option<SampleCloud>,
    pub metadata: RenderMetadata,
}

impl SessionRenderOutput {
    /// Validate a raw payload. Needs `points`, `colors` and `depths`;
    /// `normals` and the sample fields are optional.
    pub fn from_raw(raw: RawRenderData, sequence: u64) -> Result<Self> {
        let points = required(&raw, POINTS)?.to_vec3s()?;
        let colors = required(&raw, COLORS)?.to_vec3s()?;
        let depths = required(&raw, DEPTHS)?.data().to_vec();
        let normals = raw.get(NORMALS).map(Tensor::to_vec3s).transpose()?;

        let n = points.len();
        if colors.len() != n {
            return Err(Error::malformed(format!("{} colors for {} points", colors.len(), n)));
        }
        if depths.len() != n {
            return Err(Error::malformed(format!("{} depths for {} points", depths.len(), n)));
        }
        if let Some(normals) = &normals {
            if normals.len() != n {
                return Err(Error::malformed(format!("{} normals for {} points", normals.len(), n)));
            }
        }

        let samples = SampleCloud::from_raw(&raw)?;

        Ok(Self {
            points,
            colors,
            depths,
            normals,
            samples,
            metadata: RenderMetadata {
                num_points: n,
                completed_at: SystemTime::now(),
                sequence,
                generation: 0,
            },
        })
    }

    #[inline]
    pub fn num_points(&self) -> usize {
        self.metadata.num_points
    }

    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.points)
    }

    /// Start/end pairs for drawing normals of the given length.
    pub fn normal_segments(&self, length: f32) -> Vec<[Vec3; 2]> {
        match &self.normals {
            Some(normals) => self
                .points
                .iter()
                .zip(normals)
                .map(|(p, n)| [*p, *p + *n * length])
                .collect(),
            None => Vec::new(),
        }
    }
}

fn required<'a>(raw: &'a RawRenderData, name: &str) -> Result<&'a Tensor> {
    raw.get(name)
        .ok_or_else(|| Error::malformed(format!("missing '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(n: usize) -> RawRenderData {
        RawRenderData::new()
            .with(POINTS, Tensor::zeros((n, 3)))
            .with(COLORS, Tensor::zeros((n, 3)))
            .with(DEPTHS, Tensor::zeros(n))
    }

    #[test]
    fn test_from_raw() {
        let out = SessionRenderOutput::from_raw(cloud(4), 7).unwrap();
        assert_eq!(out.num_points(), 4);
        assert_eq!(out.metadata.sequence, 7);
        assert!(!out.has_normals());
        assert!(out.normal_segments(0.1).is_empty());
    }

    #[test]
    fn test_from_raw_malformed() {
        let missing = RawRenderData::new().with(POINTS, Tensor::zeros((2, 3)));
        assert!(matches!(
            SessionRenderOutput::from_raw(missing, 0),
            Err(Error::MalformedOutput(_))
        ));

        let short_colors = cloud(3).with(COLORS, Tensor::zeros((2, 3)));
        assert!(SessionRenderOutput::from_raw(short_colors, 0).is_err());

        let flat_points = cloud(3).with(POINTS, Tensor::zeros(9));
        assert!(SessionRenderOutput::from_raw(flat_points, 0).is_err());
    }

    #[test]
    fn test_normals() {
        let raw = cloud(1)
            .with(POINTS, Tensor::from_vec3s(&[Vec3::ONE]))
            .with(NORMALS, Tensor::from_vec3s(&[Vec3::Y]));
        let out = SessionRenderOutput::from_raw(raw, 0).unwrap();
        let seg = out.normal_segments(0.5);
        assert_eq!(seg, vec![[Vec3::ONE, Vec3::new(1.0, 1.5, 1.0)]]);
        assert_eq!(out.bounds().unwrap().center(), Vec3::ONE);
    }

    #[test]
    fn test_sample_cloud() {
        let raw = cloud(2)
            .with(SAMPLE_POINTS, Tensor::from_vec3s(&[Vec3::X, Vec3::Y, Vec3::Z, Vec3::ONE]))
            .with(SAMPLE_COLORS, Tensor::zeros((4, 3)))
            .with(SAMPLE_WEIGHTS, Tensor::column(vec![0.0, 1.0, 0.5, 0.25]))
            .with(RAY_ORIGINS, Tensor::from_vec3s(&[Vec3::ZERO, Vec3::X]))
            .with(RAY_DIRECTIONS, Tensor::from_vec3s(&[Vec3::Z, Vec3::NEG_Z]))
            .with(Z_VALUES, Tensor::new((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        let out = SessionRenderOutput::from_raw(raw, 0).unwrap();

        let samples = out.samples.unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples.weights[3], 0.25);
        assert_eq!(samples.ray_depths, vec![2.0, 4.0]);
        assert_eq!(
            samples.depth_segments(),
            vec![[Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0)], [Vec3::X, Vec3::new(1.0, 0.0, -4.0)]]
        );
        assert!(SessionRenderOutput::from_raw(cloud(1), 0).unwrap().samples.is_none());
    }

    #[test]
    fn test_sample_cloud_malformed() {
        let short_weights = cloud(1)
            .with(SAMPLE_POINTS, Tensor::zeros((3, 3)))
            .with(SAMPLE_COLORS, Tensor::zeros((3, 3)))
            .with(SAMPLE_WEIGHTS, Tensor::column(vec![1.0]))
            .with(RAY_ORIGINS, Tensor::zeros((1, 3)))
            .with(RAY_DIRECTIONS, Tensor::zeros((1, 3)));
        assert!(matches!(
            SessionRenderOutput::from_raw(short_weights, 0),
            Err(Error::MalformedOutput(_))
        ));

        let no_rays = cloud(1)
            .with(SAMPLE_POINTS, Tensor::zeros((1, 3)))
            .with(SAMPLE_COLORS, Tensor::zeros((1, 3)))
            .with(SAMPLE_WEIGHTS, Tensor::column(vec![1.0]));
        assert!(SessionRenderOutput::from_raw(no_rays, 0).is_err());
    }
}
