//! Evaluator outputs and their aggregated, image-shaped form.

use std::collections::BTreeMap;

use crate::util::{Result, Tensor};

/// Importance-sampling diagnostic; carried per chunk, never put on the grid.
pub const RANDOM_SIGMA: &str = "random_sigma";
/// Depth covariance; carried per chunk, never put on the grid.
pub const DEPTH_COV: &str = "depth_cov";
/// Per-ray sample weights, mirrored into the sample data from the coarse tier.
pub const WEIGHTS: &str = "weights";

/// Fields that skip concatenation and reshape.
pub const EXEMPT_FIELDS: [&str; 2] = [RANDOM_SIGMA, DEPTH_COV];

#[inline]
pub fn is_exempt(field: &str) -> bool {
    EXEMPT_FIELDS.contains(&field)
}

/// Field name to per-ray tensor for one tier. `None` values count as absent.
pub type OutputTier = BTreeMap<String, Option<Tensor>>;

/// Per-sample (not per-ray) data produced alongside a chunk.
#[derive(Clone, Debug, Default)]
pub struct SampleData {
    /// 3D sample positions.
    pub positions: Option<Tensor>,
    /// Per-sample features.
    pub features: Option<Tensor>,
    /// Per-sample colors.
    pub colors: Option<Tensor>,
    /// Per-sample densities.
    pub densities: Option<Tensor>,
    /// Depth of each sample along its ray.
    pub z_values: Option<Tensor>,
}

/// Output of one evaluator call.
#[derive(Clone, Debug, Default)]
pub struct ChunkResult {
    pub coarse: OutputTier,
    /// `None` when the evaluator has no fine network.
    pub fine: Option<OutputTier>,
    pub samples: Option<SampleData>,
}

impl ChunkResult {
    /// Coarse-only result from `(name, tensor)` pairs.
    pub fn coarse<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: Into<String>,
    {
        Self {
            coarse: tier(fields),
            fine: None,
            samples: None,
        }
    }

    /// Set the fine tier.
    pub fn with_fine<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: Into<String>,
    {
        self.fine = Some(tier(fields));
        self
    }

    pub fn with_samples(mut self, samples: SampleData) -> Self {
        self.samples = Some(samples);
        self
    }
}

/// Build a tier with every field present.
pub fn tier<I, S>(fields: I) -> OutputTier
where
    I: IntoIterator<Item = (S, Tensor)>,
    S: Into<String>,
{
    fields
        .into_iter()
        .map(|(name, t)| (name.into(), Some(t)))
        .collect()
}

/// One tier after all chunks were merged.
#[derive(Clone, Debug, Default)]
pub struct AggregatedTier {
    /// Image-shaped fields: `(rows, cols)` or `(rows, cols, channels)`.
    pub fields: BTreeMap<String, Tensor>,
    /// Exempt fields, one tensor per chunk in chunk order.
    pub per_chunk: BTreeMap<String, Vec<Tensor>>,
}

impl AggregatedTier {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Names of every field the first chunk reported, grid-shaped or not.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .chain(self.per_chunk.keys())
            .map(String::as_str)
    }

    /// Concatenate an exempt field along the ray axis on demand.
    pub fn concat_per_chunk(&self, name: &str) -> Result<Option<Tensor>> {
        match self.per_chunk.get(name) {
            Some(parts) if !parts.is_empty() => Tensor::concat_rows(parts).map(Some),
            _ => Ok(None),
        }
    }
}

/// Sample data concatenated across chunks along the sample axis.
#[derive(Clone, Debug, Default)]
pub struct AggregatedSamples {
    pub ray_origins: Option<Tensor>,
    pub ray_directions: Option<Tensor>,
    pub positions: Option<Tensor>,
    pub features: Option<Tensor>,
    pub colors: Option<Tensor>,
    pub densities: Option<Tensor>,
    pub weights: Option<Tensor>,
    pub z_values: Option<Tensor>,
}

/// Result of one full chunked render.
#[derive(Clone, Debug, Default)]
pub struct AggregatedOutput {
    pub coarse: AggregatedTier,
    /// `None` when the first chunk had no fine tier.
    pub fine: Option<AggregatedTier>,
    pub samples: AggregatedSamples,
    /// Output grid `(rows, cols)` after stride.
    pub grid: (usize, usize),
    pub num_rays: usize,
    pub num_chunks: usize,
}

impl AggregatedOutput {
    /// Fine tier if present, otherwise coarse.
    pub fn best_tier(&self) -> &AggregatedTier {
        self.fine.as_ref().unwrap_or(&self.coarse)
    }
}
