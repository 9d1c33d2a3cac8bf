//! Tiling plan for valid-convolution models.
//!
//! The model maps an input window of `input_shape` to a centred output window of
//! `output_shape`; the difference is split evenly into a context margin on each
//! side. The planner partitions the target subvolume into output tiles and
//! derives the input window every tile needs.
//!
//! Tile order is row-major with axis 2 varying fastest and axis 0 slowest.

use anyhow::{bail, Result};

use crate::aabb::{Aabb, Shape3};

/// One unit of work.
///
/// `input_window`/`output_window` are the nominal model windows (full model
/// shapes). `input` is the part of the input window that is actually read (clipped
/// to the volume and to the required input extent) and `output` is the part of
/// the output window that lies inside the subvolume. A tile shrunk at the end of
/// an axis keeps the start-anchored windows of its full-size counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub index: usize,
    pub input_window: Aabb,
    pub output_window: Aabb,
    pub input: Aabb,
    pub output: Aabb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingPlan {
    volume: Aabb,
    subvolume: Aabb,
    input_shape: Shape3,
    output_shape: Shape3,
    margin: Shape3,
    grid: Shape3,
}

impl TilingPlan {
    /// Validate shapes and clip the subvolume to the whole volume.
    pub fn new(
        whole_volume_shape: Shape3,
        subvolume: Aabb,
        output_shape: Shape3,
        input_shape: Shape3,
    ) -> Result<Self> {
        if whole_volume_shape.iter().any(|d| *d == 0) {
            bail!("whole volume shape {whole_volume_shape:?} must be positive on every axis");
        }
        if output_shape.iter().any(|d| *d == 0) {
            bail!("model output shape {output_shape:?} must be positive on every axis");
        }

        let mut margin = [0usize; 3];
        for axis in 0..3 {
            if input_shape[axis] < output_shape[axis] {
                bail!(
                    "model input shape {input_shape:?} is smaller than output shape {output_shape:?} on axis {axis}"
                );
            }
            let context = input_shape[axis] - output_shape[axis];
            if context % 2 != 0 {
                bail!(
                    "model input shape {input_shape:?} and output shape {output_shape:?} differ by an odd amount on axis {axis}"
                );
            }
            margin[axis] = context / 2;
        }

        let subvolume = Aabb::new(subvolume.start, subvolume.end)?;
        let volume = Aabb::from_shape(whole_volume_shape);
        let clipped = subvolume.intersect(&volume);
        if clipped.is_empty() {
            bail!("target subvolume {subvolume} lies outside the whole volume {volume}");
        }

        let sub_shape = clipped.shape();
        let grid = [
            sub_shape[0].div_ceil(output_shape[0]),
            sub_shape[1].div_ceil(output_shape[1]),
            sub_shape[2].div_ceil(output_shape[2]),
        ];

        Ok(Self {
            volume,
            subvolume: clipped,
            input_shape,
            output_shape,
            margin,
            grid,
        })
    }

    pub fn volume(&self) -> Aabb {
        self.volume
    }

    /// The target subvolume, clipped to the whole volume.
    pub fn subvolume(&self) -> Aabb {
        self.subvolume
    }

    pub fn input_shape(&self) -> Shape3 {
        self.input_shape
    }

    pub fn output_shape(&self) -> Shape3 {
        self.output_shape
    }

    pub fn margin(&self) -> Shape3 {
        self.margin
    }

    /// Tiles per axis.
    pub fn grid_shape(&self) -> Shape3 {
        self.grid
    }

    /// The subvolume grown by the context margin; not clipped.
    pub fn required_input_extent(&self) -> Aabb {
        self.subvolume.expand(self.margin)
    }

    /// [`Self::required_input_extent`] clipped to the whole volume; this is what
    /// gets read from storage.
    pub fn clipped_input_extent(&self) -> Aabb {
        self.required_input_extent().intersect(&self.volume)
    }

    pub fn tile_count(&self) -> usize {
        self.grid.iter().product()
    }

    pub fn tile(&self, index: usize) -> Option<Tile> {
        if index >= self.tile_count() {
            return None;
        }

        let g2 = index % self.grid[2];
        let g1 = (index / self.grid[2]) % self.grid[1];
        let g0 = index / (self.grid[2] * self.grid[1]);
        let cell = [g0, g1, g2];

        let mut start = [0i64; 3];
        for axis in 0..3 {
            start[axis] = self.subvolume.start[axis] + (cell[axis] * self.output_shape[axis]) as i64;
        }

        let output_window = Aabb::from_start_shape(start, self.output_shape);
        let input_window = output_window.expand(self.margin);
        let output = output_window.intersect(&self.subvolume);
        let input = input_window.intersect(&self.clipped_input_extent());

        Some(Tile {
            index,
            input_window,
            output_window,
            input,
            output,
        })
    }

    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.tile_count()).filter_map(move |index| self.tile(index))
    }

    pub fn tile_grid(&self) -> Vec<Tile> {
        self.tiles().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(volume: Shape3, sub: ([i64; 3], [i64; 3]), output: Shape3, input: Shape3) -> TilingPlan {
        TilingPlan::new(volume, Aabb::new(sub.0, sub.1).unwrap(), output, input).unwrap()
    }

    #[test]
    fn rejects_input_smaller_than_output() {
        let err = TilingPlan::new(
            [100, 100, 100],
            Aabb::from_shape([10, 10, 10]),
            [12, 12, 12],
            [20, 10, 20],
        )
        .unwrap_err();
        assert!(err.to_string().contains("smaller than output"));
    }

    #[test]
    fn rejects_odd_context() {
        assert!(TilingPlan::new(
            [100, 100, 100],
            Aabb::from_shape([10, 10, 10]),
            [12, 12, 12],
            [21, 20, 20],
        )
        .is_err());
    }

    #[test]
    fn rejects_subvolume_outside_volume() {
        let err = TilingPlan::new(
            [100, 100, 100],
            Aabb::new([100, 0, 0], [120, 10, 10]).unwrap(),
            [12, 12, 12],
            [20, 20, 20],
        )
        .unwrap_err();
        assert!(err.to_string().contains("outside the whole volume"));
    }

    #[test]
    fn clips_partially_outside_subvolume() {
        let plan = plan([100, 100, 100], ([90, -5, 0], [110, 10, 10]), [12, 12, 12], [20, 20, 20]);
        assert_eq!(plan.subvolume(), Aabb::new([90, 0, 0], [100, 10, 10]).unwrap());
    }

    #[test]
    fn required_extent_expands_by_margin() {
        let plan = plan([300, 300, 300], ([100, 100, 100], [232, 232, 232]), [132; 3], [220; 3]);
        assert_eq!(plan.margin(), [44, 44, 44]);
        assert_eq!(
            plan.required_input_extent(),
            Aabb::new([56, 56, 56], [276, 276, 276]).unwrap()
        );
        assert_eq!(plan.tile_count(), 1);
    }

    #[test]
    fn grid_order_is_axis_two_fastest() {
        let plan = plan([100, 100, 100], ([0, 0, 0], [24, 24, 36]), [12, 12, 12], [20, 20, 20]);
        assert_eq!(plan.grid_shape(), [2, 2, 3]);
        assert_eq!(plan.tile_count(), 12);

        let tiles = plan.tile_grid();
        assert_eq!(tiles[0].output.start, [0, 0, 0]);
        assert_eq!(tiles[1].output.start, [0, 0, 12]);
        assert_eq!(tiles[3].output.start, [0, 12, 0]);
        assert_eq!(tiles[6].output.start, [12, 0, 0]);
        assert!(tiles.iter().enumerate().all(|(i, t)| t.index == i));
        assert!(plan.tile(12).is_none());
    }

    #[test]
    fn tiles_cover_subvolume_exactly_once() {
        let plan = plan([64, 64, 64], ([5, 7, 3], [40, 33, 29]), [8, 10, 12], [14, 16, 18]);
        let sub = plan.subvolume();
        let mut hits = vec![0u8; sub.voxel_count()];
        let [s0, s1, s2] = sub.shape();

        for tile in plan.tiles() {
            assert!(sub.contains(&tile.output));
            for i in tile.output.start[0]..tile.output.end[0] {
                for j in tile.output.start[1]..tile.output.end[1] {
                    for k in tile.output.start[2]..tile.output.end[2] {
                        let li = (i - sub.start[0]) as usize;
                        let lj = (j - sub.start[1]) as usize;
                        let lk = (k - sub.start[2]) as usize;
                        hits[(li * s1 + lj) * s2 + lk] += 1;
                    }
                }
            }
        }

        assert_eq!(hits.len(), s0 * s1 * s2);
        assert!(hits.iter().all(|h| *h == 1));
    }

    #[test]
    fn tile_inputs_stay_inside_clipped_required_extent() {
        let plan = plan([50, 60, 70], ([0, 20, 55], [50, 45, 70]), [12, 12, 12], [20, 20, 20]);
        let clipped = plan.clipped_input_extent();
        for tile in plan.tiles() {
            assert!(clipped.contains(&tile.input.intersect(&plan.volume())));
            assert!(tile.input_window.contains(&tile.input));
            assert_eq!(tile.input_window.shape(), [20, 20, 20]);
            assert_eq!(tile.output_window.shape(), [12, 12, 12]);
            assert!(tile.input_window.contains(&tile.output_window));
        }
    }

    #[test]
    fn boundary_tile_is_clipped_and_anchored() {
        let plan = plan([100, 100, 100], ([90, 90, 90], [100, 100, 100]), [12, 12, 12], [20, 20, 20]);
        assert_eq!(plan.tile_count(), 1);

        let tile = plan.tile(0).unwrap();
        assert_eq!(tile.output, Aabb::new([90, 90, 90], [100, 100, 100]).unwrap());
        assert_eq!(tile.output.shape(), [10, 10, 10]);
        assert_eq!(tile.output_window.start, [90, 90, 90]);
        assert_eq!(tile.input, Aabb::new([86, 86, 86], [100, 100, 100]).unwrap());
        assert!(tile.input.start.iter().all(|c| *c >= 0));
        assert!(tile.input.end.iter().all(|c| *c <= 100));
    }

    #[test]
    fn origin_tile_input_never_negative() {
        let plan = plan([100, 100, 100], ([0, 0, 0], [12, 12, 12]), [12, 12, 12], [20, 20, 20]);
        assert_eq!(plan.required_input_extent().start, [-4, -4, -4]);
        let tile = plan.tile(0).unwrap();
        assert_eq!(tile.input, Aabb::new([0, 0, 0], [16, 16, 16]).unwrap());
        assert_eq!(tile.input_window.start, [-4, -4, -4]);
    }
}
