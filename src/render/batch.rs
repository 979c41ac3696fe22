//! Ray batches and the chunks cut from them.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use crate::util::{Error, Result, Tensor};

/// Batch-level inputs handed to every chunk unchanged.
///
/// These are never sliced: every chunk sees the same camera, depth range
/// and source views through a shared `Arc`.
#[derive(Clone, Debug, Default)]
pub struct BatchContext {
    /// Target camera parameters (intrinsics + pose, layout owned by the evaluator).
    pub camera: Tensor,
    /// Near/far depth range.
    pub depth_range: Tensor,
    /// Source view images, if the evaluator is image-conditioned.
    pub src_rgbs: Option<Tensor>,
    /// Source view cameras.
    pub src_cameras: Option<Tensor>,
}

/// Image the batch was sampled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageGrid {
    pub height: usize,
    pub width: usize,
    /// Pixel stride used when generating rays (1 = every pixel).
    pub stride: usize,
}

impl ImageGrid {
    pub fn new(height: usize, width: usize, stride: usize) -> Self {
        Self {
            height,
            width,
            stride: stride.max(1),
        }
    }

    /// Rows and columns after stride subsampling (`[::stride]` on each axis).
    pub fn dims(&self) -> (usize, usize) {
        (
            self.height.div_ceil(self.stride),
            self.width.div_ceil(self.stride),
        )
    }

    /// Number of rays a batch for this grid must contain.
    pub fn num_rays(&self) -> usize {
        let (h, w) = self.dims();
        h * w
    }
}

/// Ordered set of rays for one frame.
///
/// Ray `r * width + c` (at stride) belongs to output pixel `(r, c)`.
#[derive(Clone, Debug)]
pub struct RayBatch {
    origins: Tensor,
    directions: Tensor,
    per_ray: BTreeMap<String, Option<Tensor>>,
    prior_depth: Option<Tensor>,
    context: Arc<BatchContext>,
    grid: ImageGrid,
}

impl RayBatch {
    /// Create a batch from `(N, 3)` origins and directions.
    pub fn new(
        origins: Tensor,
        directions: Tensor,
        context: impl Into<Arc<BatchContext>>,
        grid: ImageGrid,
    ) -> Result<Self> {
        if origins.ndim() != 2 || origins.shape()[1] != 3 {
            return Err(Error::shape("[N x 3] origins", origins.shape()));
        }
        if directions.shape() != origins.shape() {
            return Err(Error::shape(origins.shape(), directions.shape()));
        }
        if origins.rows() == 0 {
            return Err(Error::EmptyBatch);
        }
        Ok(Self {
            origins,
            directions,
            per_ray: BTreeMap::new(),
            prior_depth: None,
            context: context.into(),
            grid,
        })
    }

    /// Attach an extra per-ray field. `None` is passed to every chunk as `None`.
    pub fn with_field(mut self, name: impl Into<String>, value: Option<Tensor>) -> Result<Self> {
        if let Some(t) = &value {
            self.check_rows(t)?;
        }
        self.per_ray.insert(name.into(), value);
        Ok(self)
    }

    /// Attach a per-ray prior depth.
    pub fn with_prior_depth(mut self, depth: Tensor) -> Result<Self> {
        self.check_rows(&depth)?;
        self.prior_depth = Some(depth);
        Ok(self)
    }

    fn check_rows(&self, t: &Tensor) -> Result<()> {
        if t.ndim() == 0 || t.rows() != self.len() {
            return Err(Error::shape(
                format!("{} rows", self.len()),
                t.shape(),
            ));
        }
        Ok(())
    }

    /// Number of rays.
    #[inline]
    pub fn len(&self) -> usize {
        self.origins.rows()
    }

    /// Batches always hold at least one ray.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn origins(&self) -> &Tensor {
        &self.origins
    }

    pub fn directions(&self) -> &Tensor {
        &self.directions
    }

    pub fn field(&self, name: &str) -> Option<&Tensor> {
        self.per_ray.get(name).and_then(|v| v.as_ref())
    }

    pub fn prior_depth(&self) -> Option<&Tensor> {
        self.prior_depth.as_ref()
    }

    pub fn context(&self) -> &Arc<BatchContext> {
        &self.context
    }

    pub fn grid(&self) -> ImageGrid {
        self.grid
    }

    /// Build the view for one chunk.
    ///
    /// Per-ray fields are sliced to `rays`; the context is shared as-is.
    /// The prior depth is only sliced in when `with_prior_depth` is set.
    pub fn chunk(&self, index: usize, rays: Range<usize>, with_prior_depth: bool) -> Result<Chunk> {
        let mut per_ray = BTreeMap::new();
        for (name, value) in &self.per_ray {
            let sliced = match value {
                Some(t) => Some(t.slice_rows(rays.clone())?),
                None => None,
            };
            per_ray.insert(name.clone(), sliced);
        }

        let prior_depth = match (&self.prior_depth, with_prior_depth) {
            (Some(t), true) => Some(t.slice_rows(rays.clone())?),
            _ => None,
        };

        Ok(Chunk {
            index,
            origins: self.origins.slice_rows(rays.clone())?,
            directions: self.directions.slice_rows(rays.clone())?,
            rays,
            per_ray,
            prior_depth,
            context: Arc::clone(&self.context),
        })
    }
}

/// Contiguous, order-preserving ranges of at most `chunk_size` covering `0..len`.
pub fn chunk_ranges(len: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = chunk_size.max(1);
    (0..len).step_by(step).map(move |start| start..(start + step).min(len))
}

/// One evaluator call's worth of rays.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Position of this chunk in the batch.
    pub index: usize,
    /// Ray indices of the batch covered by this chunk.
    pub rays: Range<usize>,
    pub origins: Tensor,
    pub directions: Tensor,
    pub per_ray: BTreeMap<String, Option<Tensor>>,
    pub prior_depth: Option<Tensor>,
    pub context: Arc<BatchContext>,
}

impl Chunk {
    #[inline]
    pub fn len(&self) -> usize {
        self.rays.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rays.is_empty()
    }
}
