//! Two-stage streaming inference over a [`Tiler`].
//!
//! A producer task pads tile inputs and pushes them through a bounded queue; a
//! consumer task batches them, runs the model and writes predictions back in
//! plan order. Both stages run on the blocking pool.

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array3;
use tokio::sync::mpsc;

use crate::model::TileModel;
use crate::tiler::{TileInput, TileInputs, Tiler};

pub const DEFAULT_PREFETCH: usize = 2;
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Called after every written batch with `(tiles_written, total_tiles)`.
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send>;

pub struct TileRunner {
    batch_size: usize,
    prefetch: usize,
}

impl TileRunner {
    pub fn new(batch_size: usize, prefetch: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            prefetch: prefetch.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    /// Run every tile of `tiler` through `model` and hand the filled tiler back.
    pub async fn run<M>(
        &self,
        tiler: Tiler,
        model: M,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<Tiler>
    where
        M: TileModel,
    {
        let (tile_tx, tile_rx) = mpsc::channel(self.prefetch);
        let inputs = tiler.produce_input_sequence();
        let batch_size = self.batch_size;

        let producer = tokio::task::spawn_blocking(move || run_producer_loop(inputs, tile_tx));
        let consumer = tokio::task::spawn_blocking(move || {
            let mut tiler = tiler;
            let mut model = model;
            let result = run_consumer_loop(
                &mut tiler,
                &mut model,
                tile_rx,
                batch_size,
                progress_callback,
            );
            (tiler, result)
        });

        let producer_result = producer
            .await
            .map_err(|join_error| anyhow!("tile producer task panicked: {join_error}"))
            .and_then(|result| result.context("tile producer failed"));
        let (tiler, consumer_result) = consumer
            .await
            .map_err(|join_error| anyhow!("tile consumer task panicked: {join_error}"))?;

        // A failed producer closes the queue early, which the consumer also reports.
        producer_result?;
        consumer_result.context("tile consumer failed")?;
        Ok(tiler)
    }
}

impl Default for TileRunner {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_PREFETCH)
    }
}

fn run_producer_loop(mut inputs: TileInputs, output: mpsc::Sender<TileInput>) -> Result<usize> {
    let mut produced = 0_usize;
    let mut total_produce_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;

    loop {
        let t_produce = Instant::now();
        let Some(input) = inputs.next() else {
            break;
        };
        let input = input?;
        total_produce_ms += t_produce.elapsed().as_secs_f64() * 1000.0;

        let t_send = Instant::now();
        if output.blocking_send(input).is_err() {
            break;
        }
        total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;

        produced += 1;
    }

    if produced > 0 {
        tracing::info!(
            tiles = produced,
            avg_produce_ms = format!("{:.1}", total_produce_ms / produced as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / produced as f64),
            total_produce_ms = format!("{:.0}", total_produce_ms),
            total_send_wait_ms = format!("{:.0}", total_send_ms),
            "Producer stage summary"
        );
    }

    Ok(produced)
}

fn run_consumer_loop<M>(
    tiler: &mut Tiler,
    model: &mut M,
    mut input: mpsc::Receiver<TileInput>,
    batch_size: usize,
    progress_callback: Option<ProgressCallback>,
) -> Result<()>
where
    M: TileModel,
{
    let total = tiler.len();
    let mut batches = 0_usize;
    let mut total_recv_ms = 0.0_f64;
    let mut total_predict_ms = 0.0_f64;
    let mut total_write_ms = 0.0_f64;

    let mut indices = Vec::with_capacity(batch_size);
    let mut batch: Vec<Array3<f32>> = Vec::with_capacity(batch_size);

    loop {
        indices.clear();
        batch.clear();

        let t_recv = Instant::now();
        while batch.len() < batch_size {
            let Some(tile_input) = input.blocking_recv() else {
                break;
            };
            indices.push(tile_input.tile.index);
            batch.push(tile_input.data);
        }
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        if batch.is_empty() {
            break;
        }

        let t_predict = Instant::now();
        let first = indices[0];
        let predictions = model
            .predict(&batch)
            .with_context(|| format!("model '{}' failed on tile batch at {first}", model.name()))?;
        total_predict_ms += t_predict.elapsed().as_secs_f64() * 1000.0;

        if predictions.len() != batch.len() {
            bail!(
                "model '{}' returned {} predictions for {} tiles",
                model.name(),
                predictions.len(),
                batch.len()
            );
        }

        let t_write = Instant::now();
        for (index, prediction) in indices.iter().zip(predictions.iter()) {
            tiler.write_slice(*index, prediction)?;
        }
        total_write_ms += t_write.elapsed().as_secs_f64() * 1000.0;

        batches += 1;
        if let Some(callback) = progress_callback.as_ref() {
            callback(tiler.written(), total);
        }
    }

    if batches > 0 {
        tracing::info!(
            tiles = tiler.written(),
            batches,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / batches as f64),
            avg_predict_ms = format!("{:.1}", total_predict_ms / batches as f64),
            avg_write_ms = format!("{:.1}", total_write_ms / batches as f64),
            total_predict_ms = format!("{:.0}", total_predict_ms),
            model = model.name(),
            "Consumer stage summary"
        );
    }

    if !tiler.is_exhausted() {
        bail!(
            "tile queue closed after {} of {total} tiles",
            tiler.written()
        );
    }
    Ok(())
}
