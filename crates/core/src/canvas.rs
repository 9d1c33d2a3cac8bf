//! Absolute-coordinate canvas over an in-memory block of a larger volume.

use anyhow::{bail, Result};
use ndarray::{s, Array3, ArrayView3};

use crate::aabb::{Aabb, Shape3};

/// A dense `f32` buffer that knows which absolute region of the volume it holds.
///
/// All reads and writes take absolute boxes. Requests outside the owned area are
/// contract violations and fail instead of being silently ignored.
#[derive(Debug, Clone)]
pub struct Canvas {
    volume: Aabb,
    area: Aabb,
    image: Array3<f32>,
}

impl Canvas {
    pub fn new(whole_volume_shape: Shape3, area: Aabb, image: Array3<f32>) -> Result<Self> {
        let volume = Aabb::from_shape(whole_volume_shape);
        if !volume.contains(&area) {
            bail!("canvas area {area} exceeds the whole volume {volume}");
        }

        let image_shape = image.dim();
        if [image_shape.0, image_shape.1, image_shape.2] != area.shape() {
            bail!(
                "canvas image shape {:?} does not match area {area} (shape {:?})",
                image.shape(),
                area.shape()
            );
        }

        Ok(Self {
            volume,
            area,
            image,
        })
    }

    /// Zero-initialised canvas, used for the output mask.
    pub fn zeros(whole_volume_shape: Shape3, area: Aabb) -> Result<Self> {
        let [d0, d1, d2] = area.shape();
        Self::new(whole_volume_shape, area, Array3::zeros((d0, d1, d2)))
    }

    pub fn area(&self) -> Aabb {
        self.area
    }

    pub fn image(&self) -> &Array3<f32> {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Array3<f32> {
        &mut self.image
    }

    pub fn into_image(self) -> Array3<f32> {
        self.image
    }

    /// Copy out the region `aabb`, clipped to the whole volume first.
    ///
    /// The returned array has the shape of the clipped box.
    pub fn read(&self, aabb: &Aabb) -> Result<Array3<f32>> {
        let clipped = aabb.intersect(&self.volume);
        if !self.area.contains(&clipped) {
            bail!(
                "canvas read out of bounds: {aabb} (clipped {clipped}) is not inside canvas area {}",
                self.area
            );
        }

        let [o0, o1, o2] = clipped.offset_within(&self.area)?;
        let [d0, d1, d2] = clipped.shape();
        Ok(self
            .image
            .slice(s![o0..o0 + d0, o1..o1 + d1, o2..o2 + d2])
            .to_owned())
    }

    /// Overwrite the region `aabb` with `data`. No blending.
    pub fn write(&mut self, aabb: &Aabb, data: ArrayView3<'_, f32>) -> Result<()> {
        if !self.area.contains(aabb) {
            bail!(
                "canvas write out of bounds: {aabb} is not inside canvas area {}",
                self.area
            );
        }

        let [d0, d1, d2] = aabb.shape();
        if data.dim() != (d0, d1, d2) {
            bail!(
                "canvas write shape mismatch: data {:?} for box {aabb} (shape {:?})",
                data.shape(),
                aabb.shape()
            );
        }
        if aabb.is_empty() {
            return Ok(());
        }

        let [o0, o1, o2] = aabb.offset_within(&self.area)?;
        self.image
            .slice_mut(s![o0..o0 + d0, o1..o1 + d1, o2..o2 + d2])
            .assign(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Shape3) -> Array3<f32> {
        Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
            (i * 10_000 + j * 100 + k) as f32
        })
    }

    #[test]
    fn new_rejects_shape_mismatch() {
        let area = Aabb::new([0, 0, 0], [4, 4, 4]).unwrap();
        let err = Canvas::new([10, 10, 10], area, Array3::zeros((4, 4, 3))).unwrap_err();
        assert!(err.to_string().contains("does not match area"));
    }

    #[test]
    fn new_rejects_area_outside_volume() {
        let area = Aabb::new([8, 0, 0], [12, 4, 4]).unwrap();
        assert!(Canvas::new([10, 10, 10], area, Array3::zeros((4, 4, 4))).is_err());
    }

    #[test]
    fn read_uses_absolute_coordinates() {
        let area = Aabb::new([10, 20, 30], [14, 24, 34]).unwrap();
        let canvas = Canvas::new([100, 100, 100], area, ramp([4, 4, 4])).unwrap();

        let block = canvas
            .read(&Aabb::new([11, 22, 33], [13, 24, 34]).unwrap())
            .unwrap();
        assert_eq!(block.shape(), &[2, 2, 1]);
        assert_eq!(block[[0, 0, 0]], 10_203.0);
        assert_eq!(block[[1, 1, 0]], 20_303.0);
    }

    #[test]
    fn read_clips_to_whole_volume() {
        let area = Aabb::new([96, 0, 0], [100, 4, 4]).unwrap();
        let canvas = Canvas::new([100, 100, 100], area, ramp([4, 4, 4])).unwrap();

        let block = canvas
            .read(&Aabb::new([98, -2, 0], [104, 2, 4]).unwrap())
            .unwrap();
        assert_eq!(block.shape(), &[2, 2, 4]);
        assert_eq!(block[[0, 0, 0]], 20_000.0);
    }

    #[test]
    fn read_outside_area_is_a_bounds_error() {
        let area = Aabb::new([10, 10, 10], [20, 20, 20]).unwrap();
        let canvas = Canvas::zeros([100, 100, 100], area).unwrap();
        let err = canvas
            .read(&Aabb::new([5, 10, 10], [15, 20, 20]).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn write_then_read_returns_written_block() {
        let area = Aabb::new([0, 0, 0], [8, 8, 8]).unwrap();
        let mut canvas = Canvas::zeros([8, 8, 8], area).unwrap();
        let target = Aabb::new([2, 3, 4], [4, 6, 8]).unwrap();
        let data = ramp(target.shape());

        canvas.write(&target, data.view()).unwrap();
        assert_eq!(canvas.read(&target).unwrap(), data);
        assert_eq!(canvas.image()[[0, 0, 0]], 0.0);
    }

    #[test]
    fn write_rejects_mismatched_data_and_foreign_box() {
        let area = Aabb::new([0, 0, 0], [8, 8, 8]).unwrap();
        let mut canvas = Canvas::zeros([16, 16, 16], area).unwrap();

        let target = Aabb::new([0, 0, 0], [2, 2, 2]).unwrap();
        assert!(canvas.write(&target, Array3::<f32>::zeros((2, 2, 3)).view()).is_err());

        let outside = Aabb::new([6, 6, 6], [10, 10, 10]).unwrap();
        assert!(canvas.write(&outside, Array3::<f32>::zeros((4, 4, 4)).view()).is_err());
    }

    #[test]
    fn read_then_write_same_box_is_identity() {
        let area = Aabb::new([3, 3, 3], [9, 9, 9]).unwrap();
        let mut canvas = Canvas::new([20, 20, 20], area, ramp([6, 6, 6])).unwrap();
        let before = canvas.image().clone();

        let region = Aabb::new([4, 5, 6], [9, 8, 7]).unwrap();
        let block = canvas.read(&region).unwrap();
        canvas.write(&region, block.view()).unwrap();

        assert_eq!(canvas.image(), &before);
    }
}
