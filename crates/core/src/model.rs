//! Segmentation network adapter.
//!
//! The runner only sees [`TileModel`]: a batch of fixed-shape input tiles in,
//! one foreground-probability block per tile out. [`OnnxModel`] backs it with an
//! `ort::Session`; tests plug in closures.

use std::path::Path;

use anyhow::{bail, Context, Result};
use half::f16;
use ndarray::{Array3, Array5, ArrayViewD, Axis, Ix3};
use ort::{
    execution_providers::{ArenaExtendStrategy, CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    tensor::TensorElementType,
    value::{Tensor, ValueType},
};
use tracing::{debug, info, warn};

/// Channel of the network output that carries the foreground class.
pub const FOREGROUND_CHANNEL: usize = 1;

/// Device setup resolved once at the entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Grow device memory on demand instead of reserving power-of-two arenas.
    pub memory_growth: bool,
}

pub trait TileModel: Send + 'static {
    fn name(&self) -> &str {
        "TileModel"
    }

    /// Predict a batch of input tiles; returns one 3D probability block per tile.
    fn predict(&mut self, batch: &[Array3<f32>]) -> Result<Vec<Array3<f32>>>;
}

impl<F> TileModel for F
where
    F: FnMut(&[Array3<f32>]) -> Result<Vec<Array3<f32>>> + Send + 'static,
{
    fn predict(&mut self, batch: &[Array3<f32>]) -> Result<Vec<Array3<f32>>> {
        self(batch)
    }
}

pub struct OnnxModel {
    session: Session,
    name: String,
    input_name: String,
    output_name: String,
    is_fp16_input: bool,
    is_fp16_output: bool,
}

impl OnnxModel {
    pub fn load(model_path: &Path, options: &DeviceOptions) -> Result<Self> {
        let session = build_session(model_path, options)?;

        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let is_fp16_input = is_fp16(session.inputs()[0].dtype());
        let is_fp16_output = is_fp16(session.outputs()[0].dtype());

        debug!(
            %input_name, %output_name, is_fp16_input, is_fp16_output,
            "Detected model IO"
        );

        Ok(Self {
            session,
            name: model_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "onnx".to_string()),
            input_name,
            output_name,
            is_fp16_input,
            is_fp16_output,
        })
    }
}

impl TileModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&mut self, batch: &[Array3<f32>]) -> Result<Vec<Array3<f32>>> {
        let input = stack_channel_last(batch)?;

        let outputs = if self.is_fp16_input {
            let tensor = Tensor::from_array(input.mapv(f16::from_f32))?;
            self.session
                .run(ort::inputs![self.input_name.as_str() => &tensor])
                .context("model inference failed")?
        } else {
            let tensor = Tensor::from_array(input)?;
            self.session
                .run(ort::inputs![self.input_name.as_str() => &tensor])
                .context("model inference failed")?
        };

        let output = &outputs[self.output_name.as_str()];
        let probabilities = if self.is_fp16_output {
            let view = output.try_extract_array::<f16>()?;
            foreground_probability(view.mapv(f16::to_f32).view())?
        } else {
            foreground_probability(output.try_extract_array::<f32>()?)?
        };

        if probabilities.len() != batch.len() {
            bail!(
                "model returned {} tiles for a batch of {}",
                probabilities.len(),
                batch.len()
            );
        }
        Ok(probabilities)
    }
}

fn is_fp16(dtype: &ValueType) -> bool {
    match dtype {
        ValueType::Tensor { ty, .. } => *ty == TensorElementType::Float16,
        _ => false,
    }
}

fn build_session(model_path: &Path, options: &DeviceOptions) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let cuda = CUDAExecutionProvider::default();
    if !cuda.is_available().unwrap_or(false) {
        warn!("CUDA EP is not available, inference will fall back to CPU");
    }

    let cuda = if options.memory_growth {
        cuda.with_arena_extend_strategy(ArenaExtendStrategy::SameAsRequested)
    } else {
        cuda
    };

    let session = builder
        .with_execution_providers([cuda.build()])?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    info!(
        model = %model_path.display(),
        memory_growth = options.memory_growth,
        "Model session ready"
    );
    Ok(session)
}

/// Stack equally shaped tiles into `[batch, d0, d1, d2, 1]`.
pub fn stack_channel_last(batch: &[Array3<f32>]) -> Result<Array5<f32>> {
    let Some(first) = batch.first() else {
        bail!("cannot run the model on an empty batch");
    };
    let (d0, d1, d2) = first.dim();

    let mut stacked = Array5::<f32>::zeros((batch.len(), d0, d1, d2, 1));
    for (index, tile) in batch.iter().enumerate() {
        if tile.dim() != (d0, d1, d2) {
            bail!(
                "batch tile {index} has shape {:?}, expected {:?}",
                tile.shape(),
                [d0, d1, d2]
            );
        }
        stacked
            .index_axis_mut(Axis(0), index)
            .index_axis_mut(Axis(3), 0)
            .assign(tile);
    }
    Ok(stacked)
}

/// Reduce a `[batch, o0, o1, o2, C]` network output to per-tile foreground
/// probabilities: softmax over the channel axis keeping [`FOREGROUND_CHANNEL`],
/// or the single channel unchanged when `C == 1`.
pub fn foreground_probability(output: ArrayViewD<'_, f32>) -> Result<Vec<Array3<f32>>> {
    if output.ndim() != 5 {
        bail!(
            "expected a [batch, d0, d1, d2, channels] output, got shape {:?}",
            output.shape()
        );
    }
    let channels = output.shape()[4];
    if channels == 0 {
        bail!("model output has no channels");
    }

    let mut tiles = Vec::with_capacity(output.shape()[0]);
    for sample in output.axis_iter(Axis(0)) {
        let probability = if channels == 1 {
            sample.index_axis(Axis(3), 0).to_owned()
        } else {
            let foreground = sample.index_axis(Axis(3), FOREGROUND_CHANNEL);
            let mut probability = foreground.to_owned();
            for (value, logits) in probability.iter_mut().zip(sample.lanes(Axis(3))) {
                let max = logits.fold(f32::NEG_INFINITY, |acc, v| acc.max(*v));
                let denominator: f32 = logits.iter().map(|v| (v - max).exp()).sum();
                *value = (*value - max).exp() / denominator;
            }
            probability
        };
        tiles.push(
            probability
                .into_dimensionality::<Ix3>()
                .context("model output sample is not three-dimensional")?,
        );
    }
    Ok(tiles)
}
