//! Chunked rendering: split a ray batch, evaluate each chunk, merge the
//! outputs back into image-shaped tensors.
//!
//! The first chunk's result fixes the schema of both tiers. Every later
//! chunk must report the same fields; fields that only show up later are
//! handled by [`LateFieldPolicy`].

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::batch::{chunk_ranges, Chunk, RayBatch};
use super::output::{
    is_exempt, AggregatedOutput, AggregatedSamples, AggregatedTier, ChunkResult, OutputTier,
    SampleData, WEIGHTS,
};
use crate::settings::RenderConfig;
use crate::util::{Error, Result, Tensor};

/// Per-chunk volumetric evaluator.
///
/// Implementations must be safe to call from several sessions at once;
/// nothing here serializes calls across sessions.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, chunk: &Chunk) -> Result<ChunkResult>;
}

impl<F> Evaluator for F
where
    F: Fn(&Chunk) -> Result<ChunkResult> + Send + Sync,
{
    fn evaluate(&self, chunk: &Chunk) -> Result<ChunkResult> {
        self(chunk)
    }
}

/// What to do with a field that first appears after chunk 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LateFieldPolicy {
    /// Drop it; chunk 0 stays authoritative.
    #[default]
    Ignore,
    /// Fail the render with [`Error::UnexpectedField`].
    Reject,
}

/// Streams a ray batch through an evaluator in bounded chunks.
#[derive(Clone, Debug)]
pub struct ChunkAggregator {
    chunk_size: usize,
    late_fields: LateFieldPolicy,
    use_prior_depth: bool,
}

impl ChunkAggregator {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            late_fields: LateFieldPolicy::default(),
            use_prior_depth: false,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            late_fields: config.late_fields,
            use_prior_depth: config.use_prior_depth,
        }
    }

    pub fn with_late_fields(mut self, policy: LateFieldPolicy) -> Self {
        self.late_fields = policy;
        self
    }

    pub fn with_prior_depth(mut self, enabled: bool) -> Self {
        self.use_prior_depth = enabled;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Render every ray of `batch` and merge the results.
    ///
    /// Evaluator errors abort the call and are returned as-is; nothing
    /// partial is produced.
    #[tracing::instrument(skip_all, fields(rays = batch.len(), chunk_size = self.chunk_size))]
    pub fn render<E>(&self, batch: &RayBatch, evaluator: &E) -> Result<AggregatedOutput>
    where
        E: Evaluator + ?Sized,
    {
        if self.chunk_size == 0 {
            return Err(Error::InvalidChunkSize(self.chunk_size));
        }
        if batch.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let grid = batch.grid();
        if grid.num_rays() != batch.len() {
            return Err(Error::shape(
                format!("{} rays for grid {:?}", grid.num_rays(), grid.dims()),
                batch.len(),
            ));
        }

        let mut coarse: Option<TierAccumulator> = None;
        let mut fine: Option<TierAccumulator> = None;
        let mut samples = SampleAccumulator::default();
        let mut consumed = 0;
        let mut num_chunks = 0;

        for (index, rays) in chunk_ranges(batch.len(), self.chunk_size).enumerate() {
            let chunk = batch.chunk(index, rays, self.use_prior_depth)?;
            debug!(chunk = index, start = chunk.rays.start, len = chunk.len(), "evaluating chunk");

            let result = evaluator.evaluate(&chunk)?;
            samples.push_rays(&chunk);

            let ChunkResult {
                coarse: coarse_tier,
                fine: fine_tier,
                samples: chunk_samples,
            } = result;

            if let Some(Some(weights)) = coarse_tier.get(WEIGHTS) {
                samples.weights.push(weights.clone());
            }
            if let Some(data) = chunk_samples {
                samples.push(data);
            }

            match coarse.as_mut() {
                None => coarse = Some(TierAccumulator::discover("coarse", coarse_tier)),
                Some(acc) => acc.append(coarse_tier, index, self.late_fields)?,
            }

            if index == 0 {
                fine = fine_tier.map(|t| TierAccumulator::discover("fine", t));
            } else {
                match (fine.as_mut(), fine_tier) {
                    (Some(acc), Some(t)) => acc.append(t, index, self.late_fields)?,
                    (Some(acc), None) => return Err(acc.missing(index)),
                    (None, Some(t)) => late_tier("fine", &t, index, self.late_fields)?,
                    (None, None) => {}
                }
            }

            consumed += chunk.len();
            num_chunks += 1;
        }
        debug_assert_eq!(consumed, batch.len());

        let dims = grid.dims();
        let coarse = match coarse {
            Some(acc) => acc.finish(dims)?,
            None => AggregatedTier::default(),
        };
        let fine = fine.map(|acc| acc.finish(dims)).transpose()?;

        debug!(chunks = num_chunks, rows = dims.0, cols = dims.1, "render merged");
        Ok(AggregatedOutput {
            coarse,
            fine,
            samples: samples.finish()?,
            grid: dims,
            num_rays: consumed,
            num_chunks,
        })
    }
}

/// Handle a whole tier that was absent in chunk 0.
fn late_tier(tier: &'static str, fields: &OutputTier, chunk: usize, policy: LateFieldPolicy) -> Result<()> {
    let Some(field) = fields.iter().find(|(_, v)| v.is_some()).map(|(k, _)| k) else {
        return Ok(());
    };
    match policy {
        LateFieldPolicy::Ignore => {
            debug!(tier, chunk, "ignoring tier absent from first chunk");
            Ok(())
        }
        LateFieldPolicy::Reject => Err(Error::UnexpectedField {
            tier,
            field: field.clone(),
            chunk,
        }),
    }
}

/// Accumulation lists for one tier, keyed by the fields chunk 0 reported.
struct TierAccumulator {
    tier: &'static str,
    fields: BTreeMap<String, Vec<Tensor>>,
}

impl TierAccumulator {
    fn discover(tier: &'static str, first: OutputTier) -> Self {
        let fields = first
            .into_iter()
            .filter_map(|(name, value)| value.map(|t| (name, vec![t])))
            .collect();
        Self { tier, fields }
    }

    fn append(&mut self, mut values: OutputTier, chunk: usize, policy: LateFieldPolicy) -> Result<()> {
        for (name, parts) in self.fields.iter_mut() {
            match values.remove(name) {
                Some(Some(t)) => parts.push(t),
                _ => {
                    return Err(Error::SchemaMismatch {
                        tier: self.tier,
                        field: name.clone(),
                        chunk,
                    })
                }
            }
        }

        for (name, value) in values {
            if value.is_none() {
                continue;
            }
            match policy {
                LateFieldPolicy::Ignore => {
                    debug!(tier = self.tier, field = %name, chunk, "ignoring field absent from first chunk");
                }
                LateFieldPolicy::Reject => {
                    return Err(Error::UnexpectedField {
                        tier: self.tier,
                        field: name,
                        chunk,
                    })
                }
            }
        }
        Ok(())
    }

    /// Error for a chunk that dropped the whole tier.
    fn missing(&self, chunk: usize) -> Error {
        Error::SchemaMismatch {
            tier: self.tier,
            field: self.fields.keys().next().cloned().unwrap_or_default(),
            chunk,
        }
    }

    /// Concatenate along the ray axis and reshape to `(rows, cols, C)`.
    fn finish(self, (rows, cols): (usize, usize)) -> Result<AggregatedTier> {
        let tier = self.tier;
        let (per_chunk, merged): (BTreeMap<_, _>, BTreeMap<_, _>) =
            self.fields.into_iter().partition(|(name, _)| is_exempt(name));

        let fields = merged
            .into_par_iter()
            .map(|(name, parts)| {
                let image = Tensor::concat_rows(&parts)
                    .and_then(|t| t.into_grid(rows, cols))
                    .map_err(|e| {
                        warn!(tier, field = %name, "cannot reshape to image grid: {}", e);
                        e
                    })?;
                Ok((name, image.squeeze_trailing()))
            })
            .collect::<Result<BTreeMap<String, Tensor>>>()?;

        Ok(AggregatedTier { fields, per_chunk })
    }
}

/// Per-sample data gathered across chunks, appended in chunk order.
#[derive(Default)]
struct SampleAccumulator {
    ray_origins: Vec<Tensor>,
    ray_directions: Vec<Tensor>,
    positions: Vec<Tensor>,
    features: Vec<Tensor>,
    colors: Vec<Tensor>,
    densities: Vec<Tensor>,
    weights: Vec<Tensor>,
    z_values: Vec<Tensor>,
}

impl SampleAccumulator {
    fn push_rays(&mut self, chunk: &Chunk) {
        self.ray_origins.push(chunk.origins.clone());
        self.ray_directions.push(chunk.directions.clone());
    }

    fn push(&mut self, data: SampleData) {
        let SampleData {
            positions,
            features,
            colors,
            densities,
            z_values,
        } = data;
        self.positions.extend(positions);
        self.features.extend(features);
        self.colors.extend(colors);
        self.densities.extend(densities);
        self.z_values.extend(z_values);
    }

    fn finish(self) -> Result<AggregatedSamples> {
        fn cat(parts: Vec<Tensor>) -> Result<Option<Tensor>> {
            if parts.is_empty() {
                Ok(None)
            } else {
                Tensor::concat_rows(&parts).map(Some)
            }
        }

        Ok(AggregatedSamples {
            ray_origins: cat(self.ray_origins)?,
            ray_directions: cat(self.ray_directions)?,
            positions: cat(self.positions)?,
            features: cat(self.features)?,
            colors: cat(self.colors)?,
            densities: cat(self.densities)?,
            weights: cat(self.weights)?,
            z_values: cat(self.z_values)?,
        })
    }
}
