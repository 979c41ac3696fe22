//! Chunked ray rendering.
//!
//! - [`RayBatch`] / [`Chunk`] - the rays of one frame and the views cut from them
//! - [`Evaluator`] - the external per-chunk volumetric function
//! - [`ChunkAggregator`] - drives the evaluator and merges its outputs
//! - [`AggregatedOutput`] - image-shaped tiers plus concatenated sample data

mod aggregator;
mod batch;
mod output;

pub use aggregator::*;
pub use batch::*;
pub use output::*;
