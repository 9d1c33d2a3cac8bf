//! Binds a [`TilingPlan`] to an input canvas and an output mask canvas.
//!
//! Inputs are produced lazily and zero-padded to the model input shape; model
//! predictions are cropped start-anchored and written back at their absolute
//! location. Writes must follow the plan order exactly once per tile.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::{s, Array3};

use crate::canvas::Canvas;
use crate::tiling::{Tile, TilingPlan};

/// Fixed-shape model input for one tile.
#[derive(Debug, Clone)]
pub struct TileInput {
    pub tile: Tile,
    pub data: Array3<f32>,
}

#[derive(Debug)]
pub struct Tiler {
    plan: TilingPlan,
    input: Arc<Canvas>,
    mask: Canvas,
    produced: Arc<AtomicUsize>,
    written: usize,
}

impl Tiler {
    pub fn new(plan: TilingPlan, input: Canvas, mask: Canvas) -> Result<Self> {
        let required = plan.clipped_input_extent();
        if !input.area().contains(&required) {
            bail!(
                "input canvas {} does not cover the required input extent {required}",
                input.area()
            );
        }
        if mask.area() != plan.subvolume() {
            bail!(
                "output canvas {} must cover exactly the target subvolume {}",
                mask.area(),
                plan.subvolume()
            );
        }

        Ok(Self {
            plan,
            input: Arc::new(input),
            mask,
            produced: Arc::new(AtomicUsize::new(0)),
            written: 0,
        })
    }

    pub fn plan(&self) -> &TilingPlan {
        &self.plan
    }

    pub fn len(&self) -> usize {
        self.plan.tile_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tiles written so far; also the next index `write_slice` accepts.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn is_exhausted(&self) -> bool {
        self.written == self.len()
    }

    /// A fresh pass over all tile inputs in plan order.
    ///
    /// Each call starts again at tile 0. The iterator owns a handle to the input
    /// canvas, so it can be moved to a producer thread.
    pub fn produce_input_sequence(&self) -> TileInputs {
        TileInputs {
            plan: self.plan.clone(),
            input: Arc::clone(&self.input),
            produced: Arc::clone(&self.produced),
            next: 0,
        }
    }

    /// Deposit the model prediction for tile `index` into the mask.
    pub fn write_slice(&mut self, index: usize, predicted: &Array3<f32>) -> Result<()> {
        let total = self.len();
        if index >= total {
            bail!("tile index {index} is out of range (tiler has {total} tiles)");
        }
        if index < self.written {
            bail!("tile {index} has already been written");
        }
        if index > self.written {
            bail!(
                "tile {index} written out of order; next expected tile is {}",
                self.written
            );
        }
        if index >= self.produced.load(Ordering::Acquire) {
            bail!("tile {index} has not been produced yet");
        }

        let output_shape = self.plan.output_shape();
        if predicted.dim() != (output_shape[0], output_shape[1], output_shape[2]) {
            bail!(
                "prediction for tile {index} has shape {:?}, expected {:?}",
                predicted.shape(),
                output_shape
            );
        }

        let tile = self
            .plan
            .tile(index)
            .with_context(|| format!("tile {index} missing from plan"))?;
        let [o0, o1, o2] = tile.output.offset_within(&tile.output_window)?;
        let [d0, d1, d2] = tile.output.shape();
        let cropped = predicted.slice(s![o0..o0 + d0, o1..o1 + d1, o2..o2 + d2]);

        self.mask
            .write(&tile.output, cropped)
            .with_context(|| format!("failed to write tile {index}"))?;
        self.written += 1;
        Ok(())
    }

    pub fn mask(&self) -> &Canvas {
        &self.mask
    }

    pub fn into_mask(self) -> Canvas {
        self.mask
    }
}

/// Lazy iterator over padded tile inputs. See [`Tiler::produce_input_sequence`].
pub struct TileInputs {
    plan: TilingPlan,
    input: Arc<Canvas>,
    produced: Arc<AtomicUsize>,
    next: usize,
}

impl Iterator for TileInputs {
    type Item = Result<TileInput>;

    fn next(&mut self) -> Option<Self::Item> {
        let tile = self.plan.tile(self.next)?;
        self.next += 1;

        let result = pad_tile_input(&self.input, &tile, self.plan.input_shape())
            .with_context(|| format!("failed to produce input for tile {}", tile.index));
        if result.is_ok() {
            self.produced.fetch_max(tile.index + 1, Ordering::AcqRel);
        }
        Some(result.map(|data| TileInput { tile, data }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plan.tile_count().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileInputs {}

/// Read the clipped input region and place it in a zero buffer of the model
/// input shape, at the offset the region has inside the nominal input window.
fn pad_tile_input(canvas: &Canvas, tile: &Tile, input_shape: [usize; 3]) -> Result<Array3<f32>> {
    let mut padded = Array3::<f32>::zeros((input_shape[0], input_shape[1], input_shape[2]));
    if tile.input.is_empty() {
        return Ok(padded);
    }

    let block = canvas.read(&tile.input)?;
    let [o0, o1, o2] = tile.input.offset_within(&tile.input_window)?;
    let (d0, d1, d2) = block.dim();
    padded
        .slice_mut(s![o0..o0 + d0, o1..o1 + d1, o2..o2 + d2])
        .assign(&block);
    Ok(padded)
}
