//! Mask cleanup on the assembled probability volume.
//!
//! Both passes use 6-connectivity (face neighbours) and treat "above a
//! threshold" as strictly greater than it.

use ndarray::Array3;
use tracing::debug;

/// Value written into voxels reached by region closing.
pub const FILLED_CONFIDENCE: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FloodFillStats {
    pub seeds: usize,
    pub filled: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmallObjectStats {
    pub components: usize,
    pub removed_components: usize,
    pub removed_voxels: usize,
}

/// Flat-index neighbourhood helper for a C-ordered 3D array.
struct Grid {
    dims: [usize; 3],
}

impl Grid {
    fn new(mask: &Array3<f32>) -> Self {
        let (d0, d1, d2) = mask.dim();
        Self { dims: [d0, d1, d2] }
    }

    fn len(&self) -> usize {
        self.dims.iter().product()
    }

    fn for_each_neighbor(&self, idx: usize, mut visit: impl FnMut(usize)) {
        let [_, d1, d2] = self.dims;
        let plane = d1 * d2;
        let i = idx / plane;
        let j = (idx % plane) / d2;
        let k = idx % d2;

        if i > 0 {
            visit(idx - plane);
        }
        if i + 1 < self.dims[0] {
            visit(idx + plane);
        }
        if j > 0 {
            visit(idx - d2);
        }
        if j + 1 < d1 {
            visit(idx + d2);
        }
        if k > 0 {
            visit(idx - 1);
        }
        if k + 1 < d2 {
            visit(idx + 1);
        }
    }
}

/// Region closing.
///
/// Voxels above `high_confidence_threshold` seed a flood fill that spreads through
/// voxels above `low_confidence_threshold`; every reached voxel is raised to
/// [`FILLED_CONFIDENCE`]. Low-confidence voxels without a path to a seed keep
/// their value.
pub fn clean_flood_fill(
    mask: &mut Array3<f32>,
    high_confidence_threshold: f32,
    low_confidence_threshold: f32,
) -> FloodFillStats {
    let grid = Grid::new(mask);
    let Some(values) = mask.as_slice_mut() else {
        let mut standard = mask.as_standard_layout().into_owned();
        let stats = clean_flood_fill(&mut standard, high_confidence_threshold, low_confidence_threshold);
        mask.assign(&standard);
        return stats;
    };

    let mut visited = vec![false; grid.len()];
    let mut stack = Vec::new();
    let mut stats = FloodFillStats::default();

    for seed in 0..values.len() {
        if visited[seed] || values[seed] <= high_confidence_threshold {
            continue;
        }
        stats.seeds += 1;
        visited[seed] = true;
        stack.push(seed);

        while let Some(idx) = stack.pop() {
            if values[idx] < FILLED_CONFIDENCE {
                values[idx] = FILLED_CONFIDENCE;
                stats.filled += 1;
            }
            grid.for_each_neighbor(idx, |n| {
                if !visited[n] && values[n] > low_confidence_threshold {
                    visited[n] = true;
                    stack.push(n);
                }
            });
        }
    }

    debug!(
        seeds = stats.seeds,
        filled = stats.filled,
        high = high_confidence_threshold,
        low = low_confidence_threshold,
        "Region closing finished"
    );
    stats
}

/// Zero every connected component of voxels above `probability_threshold` that
/// has fewer than `size_threshold` voxels.
pub fn remove_small_objects(
    mask: &mut Array3<f32>,
    probability_threshold: f32,
    size_threshold: usize,
) -> SmallObjectStats {
    let grid = Grid::new(mask);
    let Some(values) = mask.as_slice_mut() else {
        let mut standard = mask.as_standard_layout().into_owned();
        let stats = remove_small_objects(&mut standard, probability_threshold, size_threshold);
        mask.assign(&standard);
        return stats;
    };

    let mut visited = vec![false; grid.len()];
    let mut stack = Vec::new();
    let mut component = Vec::new();
    let mut stats = SmallObjectStats::default();

    for start in 0..values.len() {
        if visited[start] || values[start] <= probability_threshold {
            continue;
        }

        component.clear();
        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            component.push(idx);
            grid.for_each_neighbor(idx, |n| {
                if !visited[n] && values[n] > probability_threshold {
                    visited[n] = true;
                    stack.push(n);
                }
            });
        }

        stats.components += 1;
        if component.len() < size_threshold {
            for &idx in &component {
                values[idx] = 0.0;
            }
            stats.removed_components += 1;
            stats.removed_voxels += component.len();
        }
    }

    debug!(
        components = stats.components,
        removed_components = stats.removed_components,
        removed_voxels = stats.removed_voxels,
        probability_threshold,
        size_threshold,
        "Small object removal finished"
    );
    stats
}
