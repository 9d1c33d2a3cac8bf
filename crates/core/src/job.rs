//! End-to-end segmentation of one block: read, scale, tile, predict, clean, write.
//!
//! Storage and the network are injected, so the same flow runs against N5 and
//! ONNX in the binary and against in-memory fakes in tests.

use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::aabb::{Aabb, Shape3};
use crate::canvas::Canvas;
use crate::model::TileModel;
use crate::n5::{VolumeReader, VolumeWriter};
use crate::postprocess::{
    clean_flood_fill, remove_small_objects, FloodFillStats, SmallObjectStats,
};
use crate::preprocess::{calculate_scaling_factor, scale_image};
use crate::runner::{ProgressCallback, TileRunner, DEFAULT_BATCH_SIZE, DEFAULT_PREFETCH};
use crate::tiler::Tiler;
use crate::tiling::TilingPlan;

pub const DEFAULT_MODEL_INPUT_SHAPE: Shape3 = [220, 220, 220];
pub const DEFAULT_MODEL_OUTPUT_SHAPE: Shape3 = [132, 132, 132];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcessingParams {
    pub high_confidence_threshold: f32,
    pub low_confidence_threshold: f32,
    pub small_region_probability_threshold: f32,
    pub small_region_size_threshold: usize,
}

impl Default for PostProcessingParams {
    fn default() -> Self {
        Self {
            high_confidence_threshold: 0.98,
            low_confidence_threshold: 0.2,
            small_region_probability_threshold: 0.2,
            small_region_size_threshold: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentationJob {
    pub whole_volume_shape: Shape3,
    pub subvolume: Aabb,
    pub model_input_shape: Shape3,
    pub model_output_shape: Shape3,
    /// Fixed intensity factor; estimated from the input block when `None`.
    pub scaling: Option<f32>,
    pub post_processing: Option<PostProcessingParams>,
    pub batch_size: usize,
    pub prefetch: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub output: Aabb,
    pub input: Aabb,
    pub tiles: usize,
    pub scaling_factor: f32,
    pub flood_fill: Option<FloodFillStats>,
    pub small_objects: Option<SmallObjectStats>,
}

impl SegmentationJob {
    pub fn new(whole_volume_shape: Shape3, subvolume: Aabb) -> Self {
        Self {
            whole_volume_shape,
            subvolume,
            model_input_shape: DEFAULT_MODEL_INPUT_SHAPE,
            model_output_shape: DEFAULT_MODEL_OUTPUT_SHAPE,
            scaling: None,
            post_processing: None,
            batch_size: DEFAULT_BATCH_SIZE,
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Validate the geometry without touching storage.
    pub fn plan(&self) -> Result<TilingPlan> {
        TilingPlan::new(
            self.whole_volume_shape,
            self.subvolume,
            self.model_output_shape,
            self.model_input_shape,
        )
        .context("invalid tiling configuration")
    }

    pub async fn run<R, W, M>(
        &self,
        reader: &R,
        writer: &W,
        model: M,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<JobSummary>
    where
        R: VolumeReader + ?Sized,
        W: VolumeWriter + ?Sized,
        M: TileModel,
    {
        let started = Instant::now();
        let plan = self.plan()?;
        let input_area = plan.clipped_input_extent();
        let output_area = plan.subvolume();

        info!(
            subvolume = %output_area,
            input = %input_area,
            voxels = output_area.voxel_count(),
            tiles = plan.tile_count(),
            grid = ?plan.grid_shape(),
            "Starting segmentation job"
        );

        let mut image = reader
            .read_block(input_area.start, input_area.end)
            .with_context(|| format!("failed to read input block {input_area}"))?;

        let scaling_factor = match self.scaling {
            Some(factor) => factor,
            None => {
                let factor = calculate_scaling_factor(&image);
                debug!(factor, "Estimated intensity scaling factor");
                factor
            }
        };
        scale_image(&mut image, scaling_factor);
        info!(scaling_factor, "Input block scaled");

        let input = Canvas::new(self.whole_volume_shape, input_area, image)?;
        let mask = Canvas::zeros(self.whole_volume_shape, output_area)?;
        let tiler = Tiler::new(plan, input, mask)?;
        let tiles = tiler.len();

        let tiler = TileRunner::new(self.batch_size, self.prefetch)
            .run(tiler, model, progress_callback)
            .await?;
        let mut mask = tiler.into_mask().into_image();

        let (flood_fill, small_objects) = match &self.post_processing {
            Some(params) => {
                let flood_fill = clean_flood_fill(
                    &mut mask,
                    params.high_confidence_threshold,
                    params.low_confidence_threshold,
                );
                let small_objects = remove_small_objects(
                    &mut mask,
                    params.small_region_probability_threshold,
                    params.small_region_size_threshold,
                );
                info!(
                    filled = flood_fill.filled,
                    removed_components = small_objects.removed_components,
                    removed_voxels = small_objects.removed_voxels,
                    "Post-processing finished"
                );
                (Some(flood_fill), Some(small_objects))
            }
            None => (None, None),
        };

        writer
            .write_block(output_area.start, mask.view())
            .with_context(|| format!("failed to write output block {output_area}"))?;

        info!(
            subvolume = %output_area,
            tiles,
            elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
            "Segmentation job finished"
        );

        Ok(JobSummary {
            output: output_area,
            input: input_area,
            tiles,
            scaling_factor,
            flood_fill,
            small_objects,
        })
    }
}
