//! Core crate for out-of-core volumetric segmentation.

pub mod aabb;
pub mod canvas;
pub mod config;
pub mod job;
pub mod logging;
pub mod model;
pub mod n5;
pub mod postprocess;
pub mod preprocess;
pub mod runner;
pub mod runtime;
pub mod tiler;
pub mod tiling;
