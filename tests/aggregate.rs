//! Chunked rendering end to end: ordering, reshaping and failure handling.

use std::sync::Arc;

use parking_lot::Mutex;
use rayflow::prelude::*;
use rayflow::state::{COLORS, DEPTHS, POINTS};
use rayflow::util::Vec3;

/// Ray batch whose origin x-coordinate encodes the ray index.
fn indexed_batch(height: usize, width: usize, stride: usize) -> RayBatch {
    let grid = ImageGrid::new(height, width, stride);
    let n = grid.num_rays();
    let origins: Vec<Vec3> = (0..n).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
    RayBatch::new(
        Tensor::from_vec3s(&origins),
        Tensor::from_vec3s(&vec![Vec3::Z; n]),
        BatchContext::default(),
        grid,
    )
    .unwrap()
}

/// Echo the ray index back as `depth` and as a 3-channel `rgb`.
fn echo(chunk: &Chunk) -> Result<ChunkResult> {
    let ids: Vec<f32> = chunk.origins.to_vec3s()?.iter().map(|o| o.x).collect();
    let rgb: Vec<Vec3> = ids.iter().map(|&i| Vec3::splat(i)).collect();
    Ok(ChunkResult::coarse([
        ("rgb", Tensor::from_vec3s(&rgb)),
        ("depth", Tensor::column(ids)),
    ]))
}

/// Small deterministic generator for parameter sweeps.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound
    }
}

#[test]
fn every_ray_evaluated_once_in_order() {
    let mut rng = Lcg(0x5eed);
    for _ in 0..40 {
        let h = 1 + rng.next(9);
        let w = 1 + rng.next(9);
        let chunk_size = 1 + rng.next(h * w + 3);
        let batch = indexed_batch(h, w, 1);

        let seen = Mutex::new(Vec::new());
        let recording = |c: &Chunk| -> Result<ChunkResult> {
            seen.lock().push((c.index, c.rays.clone()));
            echo(c)
        };
        let out = ChunkAggregator::new(chunk_size).render(&batch, &recording).unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), (h * w).div_ceil(chunk_size));
        assert_eq!(out.num_chunks, seen.len());
        assert_eq!(out.num_rays, h * w);

        let mut next = 0;
        for (expected_index, (index, rays)) in seen.iter().enumerate() {
            assert_eq!(*index, expected_index);
            assert_eq!(rays.start, next);
            assert!(rays.len() <= chunk_size && !rays.is_empty());
            next = rays.end;
        }
        assert_eq!(next, h * w);

        // Merged depth is the identity over ray indices
        let depth = out.coarse.get("depth").unwrap();
        let expected: Vec<f32> = (0..h * w).map(|i| i as f32).collect();
        assert_eq!(depth.data(), expected.as_slice());
    }
}

#[test]
fn outputs_take_strided_image_shape() {
    let mut rng = Lcg(42);
    for _ in 0..20 {
        let height = 1 + rng.next(20);
        let width = 1 + rng.next(20);
        let stride = 1 + rng.next(4);
        let batch = indexed_batch(height, width, stride);
        let (rows, cols) = (height.div_ceil(stride), width.div_ceil(stride));
        assert_eq!(batch.len(), rows * cols);

        let out = ChunkAggregator::new(1 + rng.next(17)).render(&batch, &echo).unwrap();
        assert_eq!(out.grid, (rows, cols));
        assert_eq!(out.coarse.get("rgb").unwrap().shape(), &[rows, cols, 3]);
        assert_eq!(out.coarse.get("depth").unwrap().shape(), &[rows, cols]);
        assert!(out.fine.is_none());
    }
}

#[test]
fn ten_rays_in_chunks_of_four() {
    let batch = indexed_batch(2, 5, 1);
    let lens = Mutex::new(Vec::new());
    let eval = |c: &Chunk| -> Result<ChunkResult> {
        lens.lock().push(c.len());
        echo(c)
    };

    let out = ChunkAggregator::new(4).render(&batch, &eval).unwrap();
    assert_eq!(*lens.lock(), vec![4, 4, 2]);

    let depth = out.coarse.get("depth").unwrap();
    assert_eq!(depth.shape(), &[2, 5]);
    assert_eq!(depth.row(1), Some(&[5.0, 6.0, 7.0, 8.0, 9.0][..]));
}

#[test]
fn failing_chunk_leaves_machine_rendering() {
    let batch = indexed_batch(3, 4, 1);
    let calls = Mutex::new(0usize);
    let eval = |c: &Chunk| -> Result<ChunkResult> {
        *calls.lock() += 1;
        if c.index == 1 {
            return Err(Error::evaluator(c.index, "out of memory"));
        }
        echo(c)
    };

    let machine = RenderStateMachine::default();
    assert!(machine.start_render());
    let err = ChunkAggregator::new(4).render(&batch, &eval).unwrap_err();
    assert!(matches!(err, Error::Evaluator { chunk: 1, .. }));
    // Chunk 2 of 3 never ran
    assert_eq!(*calls.lock(), 2);

    // Nothing was published, so only a reset gets the machine going again
    assert!(machine.is_rendering());
    assert!(machine.current_output().is_none());
    assert!(!machine.start_render());
    machine.reset();
    assert!(machine.start_render());
}

#[test]
fn merged_render_publishes_point_cloud() {
    let batch = indexed_batch(2, 3, 1);
    let out = ChunkAggregator::new(4).render(&batch, &echo).unwrap();
    let raw = RawRenderData::from_aggregated(&out, &batch, "rgb", "depth").unwrap();
    assert_eq!(raw.get(POINTS).unwrap().rows(), 6);
    assert_eq!(raw.get(COLORS).unwrap().rows(), 6);
    assert_eq!(raw.get(DEPTHS).unwrap().rows(), 6);

    let machine = RenderStateMachine::default();
    machine.start_render();
    let outcome = machine.publish(raw);
    let PublishOutcome::Published(output) = outcome else {
        panic!("expected publish, got {:?}", outcome);
    };
    // Ray i starts at (i, 0, 0), points along +Z and has depth i
    for (i, p) in output.points.iter().enumerate() {
        assert_eq!(*p, Vec3::new(i as f32, 0.0, i as f32));
    }
    assert!(Arc::ptr_eq(&output, &machine.current_output().unwrap()));
}

#[test]
fn sphere_render_carries_weighted_samples() {
    use rayflow::synthetic::SphereEvaluator;

    let batch = indexed_batch(3, 4, 1);
    let eval = SphereEvaluator {
        samples: 5,
        ..Default::default()
    };
    let out = ChunkAggregator::new(5).render(&batch, &eval).unwrap();
    let raw = RawRenderData::from_aggregated(&out, &batch, "rgb", "depth").unwrap();

    let machine = RenderStateMachine::default();
    machine.start_render();
    let PublishOutcome::Published(output) = machine.publish(raw) else {
        panic!("sample render not published");
    };
    let samples = output.samples.as_ref().unwrap();
    assert_eq!(samples.len(), 12 * 5);
    assert_eq!(samples.weights.len(), 12 * 5);
    // No per-sample colors from the sphere: each sample takes its ray's color
    assert_eq!(samples.colors[5 * 7 + 2], output.colors[7]);
    assert_eq!(samples.depth_segments().len(), 12);

    // Evaluators without samples publish a plain cloud
    let plain = ChunkAggregator::new(5).render(&batch, &echo).unwrap();
    let raw = RawRenderData::from_aggregated(&plain, &batch, "rgb", "depth").unwrap();
    assert!(SessionRenderOutput::from_raw(raw, 0).unwrap().samples.is_none());
}
