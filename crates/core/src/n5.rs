//! Minimal N5 block storage for `raw` and `gzip` datasets.
//!
//! Datasets are exposed in C order: array axis `i` maps to N5 dimension `2 - i`
//! (N5 lists its fastest-varying dimension first). Missing blocks read as zeros.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aabb::{Aabb, Shape3};

const ATTRIBUTES_FILE: &str = "attributes.json";
const BLOCK_MODE_DEFAULT: u16 = 0;

/// Block read access by absolute start/end coordinates.
pub trait VolumeReader {
    fn read_block(&self, start: [i64; 3], end: [i64; 3]) -> Result<Array3<f32>>;
}

/// Block write access into an existing dataset.
pub trait VolumeWriter {
    fn write_block(&self, start: [i64; 3], data: ArrayView3<'_, f32>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            Self::Uint8 => bytes[0] as f32,
            Self::Int8 => bytes[0] as i8 as f32,
            Self::Uint16 => u16::from_be_bytes([bytes[0], bytes[1]]) as f32,
            Self::Int16 => i16::from_be_bytes([bytes[0], bytes[1]]) as f32,
            Self::Uint32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::Int32 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::Float32 => f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::Float64 => f64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as f32,
        }
    }

    fn encode(self, value: f32, out: &mut Vec<u8>) {
        match self {
            Self::Uint8 => out.push(value as u8),
            Self::Int8 => out.push(value as i8 as u8),
            Self::Uint16 => out.extend_from_slice(&(value as u16).to_be_bytes()),
            Self::Int16 => out.extend_from_slice(&(value as i16).to_be_bytes()),
            Self::Uint32 => out.extend_from_slice(&(value as u32).to_be_bytes()),
            Self::Int32 => out.extend_from_slice(&(value as i32).to_be_bytes()),
            Self::Float32 => out.extend_from_slice(&value.to_be_bytes()),
            Self::Float64 => out.extend_from_slice(&(value as f64).to_be_bytes()),
        }
    }
}

/// The `compression` object of `attributes.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
    /// n5-java writes a zlib stream instead of gzip when set.
    #[serde(default, rename = "useZlib", skip_serializing_if = "Option::is_none")]
    pub use_zlib: Option<bool>,
}

impl Compression {
    pub fn raw() -> Self {
        Self {
            kind: "raw".to_string(),
            level: None,
            use_zlib: None,
        }
    }

    /// `level` of -1 selects the deflate default, as in n5-java.
    pub fn gzip(level: i32) -> Self {
        Self {
            kind: "gzip".to_string(),
            level: Some(level),
            use_zlib: None,
        }
    }
}

/// Block payload codec resolved from [`Compression`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Raw,
    Gzip { level: u32, zlib: bool },
}

impl Codec {
    fn from_attributes(compression: &Compression, path: &Path) -> Result<Self> {
        match compression.kind.as_str() {
            "raw" => Ok(Self::Raw),
            "gzip" => {
                let level = match compression.level {
                    Some(level) if level >= 0 => (level as u32).min(9),
                    _ => flate2::Compression::default().level(),
                };
                Ok(Self::Gzip {
                    level,
                    zlib: compression.use_zlib.unwrap_or(false),
                })
            }
            other => bail!(
                "unsupported N5 compression '{other}' in {} (only 'raw' and 'gzip' are supported)",
                path.display()
            ),
        }
    }

    fn decode(self, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::Raw => out.extend_from_slice(payload),
            Self::Gzip { zlib: false, .. } => {
                GzDecoder::new(payload).read_to_end(&mut out)?;
            }
            Self::Gzip { zlib: true, .. } => {
                ZlibDecoder::new(payload).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }

    /// Append the encoded `samples` to `out`, which already holds the header.
    fn encode_into(self, samples: &[u8], out: Vec<u8>) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Raw => {
                let mut out = out;
                out.extend_from_slice(samples);
                Ok(out)
            }
            Self::Gzip { level, zlib: false } => {
                let mut encoder = GzEncoder::new(out, flate2::Compression::new(level));
                encoder.write_all(samples)?;
                encoder.finish()
            }
            Self::Gzip { level, zlib: true } => {
                let mut encoder = ZlibEncoder::new(out, flate2::Compression::new(level));
                encoder.write_all(samples)?;
                encoder.finish()
            }
        }
    }
}

/// `attributes.json` of an N5 dataset. Dimensions are in N5 order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAttributes {
    pub dimensions: Vec<u64>,
    pub block_size: Vec<u64>,
    pub data_type: DataType,
    pub compression: Compression,
}

#[derive(Debug, Clone)]
pub struct N5Dataset {
    path: PathBuf,
    shape: Shape3,
    block_shape: Shape3,
    data_type: DataType,
    codec: Codec,
}

impl N5Dataset {
    pub fn open(root: &Path, dataset: &str) -> Result<Self> {
        let path = dataset_path(root, dataset);
        let attributes_path = path.join(ATTRIBUTES_FILE);
        let raw = fs::read_to_string(&attributes_path).with_context(|| {
            format!(
                "failed to read N5 attributes: {}",
                attributes_path.display()
            )
        })?;
        let attributes: DatasetAttributes = serde_json::from_str(&raw).with_context(|| {
            format!(
                "failed to parse N5 attributes: {}",
                attributes_path.display()
            )
        })?;
        Self::from_attributes(path, &attributes)
    }

    /// Create an uncompressed dataset and write its `attributes.json`.
    pub fn create(
        root: &Path,
        dataset: &str,
        shape: Shape3,
        block_shape: Shape3,
        data_type: DataType,
    ) -> Result<Self> {
        Self::create_with_compression(
            root,
            dataset,
            shape,
            block_shape,
            data_type,
            Compression::raw(),
        )
    }

    pub fn create_with_compression(
        root: &Path,
        dataset: &str,
        shape: Shape3,
        block_shape: Shape3,
        data_type: DataType,
        compression: Compression,
    ) -> Result<Self> {
        let path = dataset_path(root, dataset);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create N5 dataset: {}", path.display()))?;

        let attributes = DatasetAttributes {
            dimensions: shape.iter().rev().map(|d| *d as u64).collect(),
            block_size: block_shape.iter().rev().map(|d| *d as u64).collect(),
            data_type,
            compression,
        };
        let encoded = serde_json::to_string_pretty(&attributes)
            .context("failed to serialize N5 attributes")?;
        fs::write(path.join(ATTRIBUTES_FILE), encoded)
            .with_context(|| format!("failed to write N5 attributes: {}", path.display()))?;

        Self::from_attributes(path, &attributes)
    }

    fn from_attributes(path: PathBuf, attributes: &DatasetAttributes) -> Result<Self> {
        let codec = Codec::from_attributes(&attributes.compression, &path)?;
        let shape = reversed_shape(&attributes.dimensions, "dimensions", &path)?;
        let block_shape = reversed_shape(&attributes.block_size, "blockSize", &path)?;
        if block_shape.iter().any(|d| *d == 0) {
            bail!("N5 dataset {} has an empty block size", path.display());
        }

        Ok(Self {
            path,
            shape,
            block_shape,
            data_type: attributes.data_type,
            codec,
        })
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn block_shape(&self) -> Shape3 {
        self.block_shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    fn extent(&self) -> Aabb {
        Aabb::from_shape(self.shape)
    }

    fn block_box(&self, grid: [usize; 3]) -> Aabb {
        let start = [
            (grid[0] * self.block_shape[0]) as i64,
            (grid[1] * self.block_shape[1]) as i64,
            (grid[2] * self.block_shape[2]) as i64,
        ];
        Aabb::from_start_shape(start, self.block_shape).intersect(&self.extent())
    }

    fn block_file(&self, grid: [usize; 3]) -> PathBuf {
        self.path
            .join(grid[2].to_string())
            .join(grid[1].to_string())
            .join(grid[0].to_string())
    }

    /// Block grid cells intersecting `region`, in C order.
    fn blocks_touching(&self, region: &Aabb) -> Vec<[usize; 3]> {
        let mut first = [0usize; 3];
        let mut last = [0usize; 3];
        for axis in 0..3 {
            first[axis] = region.start[axis] as usize / self.block_shape[axis];
            last[axis] = (region.end[axis] as usize - 1) / self.block_shape[axis];
        }

        let mut cells = Vec::new();
        for g0 in first[0]..=last[0] {
            for g1 in first[1]..=last[1] {
                for g2 in first[2]..=last[2] {
                    cells.push([g0, g1, g2]);
                }
            }
        }
        cells
    }

    fn read_block_file(&self, grid: [usize; 3]) -> Result<Array3<f32>> {
        let block = self.block_box(grid);
        let [d0, d1, d2] = block.shape();
        let file = self.block_file(grid);
        if !file.exists() {
            return Ok(Array3::zeros((d0, d1, d2)));
        }

        let bytes = fs::read(&file)
            .with_context(|| format!("failed to read N5 block: {}", file.display()))?;
        let (dims, payload) = parse_block_header(&bytes)
            .with_context(|| format!("malformed N5 block: {}", file.display()))?;
        let payload = self
            .codec
            .decode(payload)
            .with_context(|| format!("failed to decompress N5 block: {}", file.display()))?;
        if dims != [d2, d1, d0] {
            bail!(
                "N5 block {} has dimensions {:?}, expected {:?}",
                file.display(),
                dims,
                [d2, d1, d0]
            );
        }

        let sample = self.data_type.size();
        let expected = d0 * d1 * d2 * sample;
        if payload.len() < expected {
            bail!(
                "N5 block {} is truncated: {} bytes, expected {expected}",
                file.display(),
                payload.len()
            );
        }

        let values: Vec<f32> = payload[..expected]
            .chunks_exact(sample)
            .map(|chunk| self.data_type.decode(chunk))
            .collect();
        Ok(Array3::from_shape_vec((d0, d1, d2), values)?)
    }

    fn write_block_file(&self, grid: [usize; 3], data: &Array3<f32>) -> Result<()> {
        let (d0, d1, d2) = data.dim();
        let file = self.block_file(grid);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create N5 block dir: {}", parent.display()))?;
        }

        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&BLOCK_MODE_DEFAULT.to_be_bytes());
        header.extend_from_slice(&3u16.to_be_bytes());
        for dim in [d2, d1, d0] {
            header.extend_from_slice(&(dim as u32).to_be_bytes());
        }
        let mut samples = Vec::with_capacity(d0 * d1 * d2 * self.data_type.size());
        for value in data.iter() {
            self.data_type.encode(*value, &mut samples);
        }
        let bytes = self
            .codec
            .encode_into(&samples, header)
            .with_context(|| format!("failed to compress N5 block: {}", file.display()))?;

        fs::write(&file, bytes)
            .with_context(|| format!("failed to write N5 block: {}", file.display()))
    }
}

impl VolumeReader for N5Dataset {
    fn read_block(&self, start: [i64; 3], end: [i64; 3]) -> Result<Array3<f32>> {
        let region = Aabb::new(start, end)?;
        if !self.extent().contains(&region) {
            bail!(
                "read region {region} exceeds dataset {} of shape {:?}",
                self.path.display(),
                self.shape
            );
        }

        let [r0, r1, r2] = region.shape();
        let mut out = Array3::<f32>::zeros((r0, r1, r2));
        if region.is_empty() {
            return Ok(out);
        }

        for grid in self.blocks_touching(&region) {
            let block_box = self.block_box(grid);
            let overlap = block_box.intersect(&region);
            let block = self.read_block_file(grid)?;

            let [b0, b1, b2] = overlap.offset_within(&block_box)?;
            let [o0, o1, o2] = overlap.offset_within(&region)?;
            let [d0, d1, d2] = overlap.shape();
            out.slice_mut(s![o0..o0 + d0, o1..o1 + d1, o2..o2 + d2])
                .assign(&block.slice(s![b0..b0 + d0, b1..b1 + d1, b2..b2 + d2]));
        }

        debug!(
            dataset = %self.path.display(),
            region = %region,
            "Read N5 region"
        );
        Ok(out)
    }
}

impl VolumeWriter for N5Dataset {
    fn write_block(&self, start: [i64; 3], data: ArrayView3<'_, f32>) -> Result<()> {
        let (d0, d1, d2) = data.dim();
        let region = Aabb::from_start_shape(start, [d0, d1, d2]);
        if !self.extent().contains(&region) {
            bail!(
                "write region {region} exceeds dataset {} of shape {:?}",
                self.path.display(),
                self.shape
            );
        }
        if region.is_empty() {
            return Ok(());
        }

        for grid in self.blocks_touching(&region) {
            let block_box = self.block_box(grid);
            let overlap = block_box.intersect(&region);
            let mut block = if overlap == block_box {
                let [b0, b1, b2] = block_box.shape();
                Array3::zeros((b0, b1, b2))
            } else {
                self.read_block_file(grid)?
            };

            let [b0, b1, b2] = overlap.offset_within(&block_box)?;
            let [o0, o1, o2] = overlap.offset_within(&region)?;
            let [e0, e1, e2] = overlap.shape();
            block
                .slice_mut(s![b0..b0 + e0, b1..b1 + e1, b2..b2 + e2])
                .assign(&data.slice(s![o0..o0 + e0, o1..o1 + e1, o2..o2 + e2]));
            self.write_block_file(grid, &block)?;
        }

        debug!(
            dataset = %self.path.display(),
            region = %region,
            "Wrote N5 region"
        );
        Ok(())
    }
}

/// Read `[start, end)` from `root/dataset`.
pub fn read_n5_block(
    root: &Path,
    dataset: &str,
    start: [i64; 3],
    end: [i64; 3],
) -> Result<Array3<f32>> {
    N5Dataset::open(root, dataset)?.read_block(start, end)
}

/// Write `data` into `root/dataset` at `[start, end)`; the dataset must exist.
pub fn write_n5_block(
    root: &Path,
    dataset: &str,
    start: [i64; 3],
    end: [i64; 3],
    data: ArrayView3<'_, f32>,
) -> Result<()> {
    let expected = Aabb::new(start, end)?.shape();
    let (d0, d1, d2) = data.dim();
    if [d0, d1, d2] != expected {
        bail!(
            "block of shape {:?} does not match write region {:?}..{:?}",
            data.shape(),
            start,
            end
        );
    }
    N5Dataset::open(root, dataset)?.write_block(start, data)
}

fn dataset_path(root: &Path, dataset: &str) -> PathBuf {
    let relative = dataset.trim_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

fn reversed_shape(values: &[u64], field: &str, path: &Path) -> Result<Shape3> {
    if values.len() != 3 {
        bail!(
            "N5 dataset {} has {} {field}, only 3D datasets are supported",
            path.display(),
            values.len()
        );
    }
    Ok([values[2] as usize, values[1] as usize, values[0] as usize])
}

fn parse_block_header(bytes: &[u8]) -> Result<([usize; 3], &[u8])> {
    if bytes.len() < 4 {
        bail!("block header is truncated");
    }
    let mode = u16::from_be_bytes([bytes[0], bytes[1]]);
    if mode != BLOCK_MODE_DEFAULT {
        bail!("unsupported N5 block mode {mode}");
    }
    let ndim = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if ndim != 3 {
        bail!("expected a 3D block, got {ndim} dimensions");
    }

    let header_len = 4 + 4 * ndim;
    if bytes.len() < header_len {
        bail!("block header is truncated");
    }
    let mut dims = [0usize; 3];
    for (axis, dim) in dims.iter_mut().enumerate() {
        let offset = 4 + 4 * axis;
        *dim = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
    }
    Ok((dims, &bytes[header_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ramp(shape: Shape3) -> Array3<f32> {
        Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
            (i * 400 + j * 20 + k) as f32
        })
    }

    #[test]
    fn attributes_use_n5_field_names() {
        let raw = r#"{"dimensions":[30,20,10],"blockSize":[8,8,8],"dataType":"uint16","compression":{"type":"raw"}}"#;
        let attributes: DatasetAttributes = serde_json::from_str(raw).unwrap();
        assert_eq!(attributes.data_type, DataType::Uint16);
        assert_eq!(attributes.compression.kind, "raw");
    }

    #[test]
    fn create_reverses_dimension_order() {
        let dir = tempdir().unwrap();
        let dataset =
            N5Dataset::create(dir.path(), "/s0", [10, 20, 30], [4, 5, 6], DataType::Float32)
                .unwrap();
        assert_eq!(dataset.shape(), [10, 20, 30]);

        let raw = fs::read_to_string(dir.path().join("s0").join(ATTRIBUTES_FILE)).unwrap();
        let attributes: DatasetAttributes = serde_json::from_str(&raw).unwrap();
        assert_eq!(attributes.dimensions, vec![30, 20, 10]);
        assert_eq!(attributes.block_size, vec![6, 5, 4]);
    }

    #[test]
    fn write_then_read_across_block_boundaries() {
        let dir = tempdir().unwrap();
        N5Dataset::create(dir.path(), "s0", [10, 12, 9], [4, 5, 4], DataType::Float32).unwrap();

        let data = ramp([10, 12, 9]);
        write_n5_block(dir.path(), "/s0", [0, 0, 0], [10, 12, 9], data.view()).unwrap();

        let region = read_n5_block(dir.path(), "/s0", [3, 4, 2], [9, 11, 9]).unwrap();
        assert_eq!(region, data.slice(s![3..9, 4..11, 2..9]).to_owned());
    }

    #[test]
    fn partial_write_preserves_neighbouring_voxels() {
        let dir = tempdir().unwrap();
        let dataset =
            N5Dataset::create(dir.path(), "s0", [8, 8, 8], [8, 8, 8], DataType::Uint8).unwrap();
        dataset
            .write_block([0, 0, 0], Array3::from_elem((8, 8, 8), 7.0).view())
            .unwrap();
        dataset
            .write_block([2, 2, 2], Array3::from_elem((2, 2, 2), 3.0).view())
            .unwrap();

        let all = dataset.read_block([0, 0, 0], [8, 8, 8]).unwrap();
        assert_eq!(all[[0, 0, 0]], 7.0);
        assert_eq!(all[[2, 2, 2]], 3.0);
        assert_eq!(all[[3, 3, 3]], 3.0);
        assert_eq!(all[[4, 4, 4]], 7.0);
    }

    #[test]
    fn missing_blocks_read_as_zero() {
        let dir = tempdir().unwrap();
        let dataset =
            N5Dataset::create(dir.path(), "s0", [6, 6, 6], [3, 3, 3], DataType::Uint16).unwrap();
        let block = dataset.read_block([1, 1, 1], [5, 5, 5]).unwrap();
        assert!(block.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn block_files_are_laid_out_in_n5_order() {
        let dir = tempdir().unwrap();
        let dataset =
            N5Dataset::create(dir.path(), "s0", [4, 4, 8], [4, 4, 4], DataType::Uint8).unwrap();
        dataset
            .write_block([0, 0, 4], Array3::from_elem((4, 4, 4), 1.0).view())
            .unwrap();
        // array axis 2 is the first N5 dimension
        assert!(dir.path().join("s0").join("1").join("0").join("0").is_file());
    }

    #[test]
    fn rejects_out_of_range_reads_and_unknown_compression() {
        let dir = tempdir().unwrap();
        let dataset =
            N5Dataset::create(dir.path(), "s0", [4, 4, 4], [2, 2, 2], DataType::Float32).unwrap();
        assert!(dataset.read_block([0, 0, 0], [5, 4, 4]).is_err());

        let gz = dir.path().join("gz");
        fs::create_dir_all(&gz).unwrap();
        fs::write(
            gz.join(ATTRIBUTES_FILE),
            r#"{"dimensions":[4,4,4],"blockSize":[2,2,2],"dataType":"uint8","compression":{"type":"blosc","cname":"lz4"}}"#,
        )
        .unwrap();
        let err = N5Dataset::open(dir.path(), "gz").unwrap_err();
        assert!(err.to_string().contains("blosc"));
    }

    #[test]
    fn integer_writes_saturate() {
        let dir = tempdir().unwrap();
        let dataset =
            N5Dataset::create(dir.path(), "s0", [1, 1, 2], [1, 1, 2], DataType::Uint8).unwrap();
        let data = Array3::from_shape_vec((1, 1, 2), vec![300.0, -5.0]).unwrap();
        dataset.write_block([0, 0, 0], data.view()).unwrap();
        let back = dataset.read_block([0, 0, 0], [1, 1, 2]).unwrap();
        assert_eq!(back[[0, 0, 0]], 255.0);
        assert_eq!(back[[0, 0, 1]], 0.0);
    }

    #[test]
    fn gzip_dataset_round_trips_across_blocks() {
        let dir = tempdir().unwrap();
        let dataset = N5Dataset::create_with_compression(
            dir.path(),
            "s0",
            [10, 12, 9],
            [4, 5, 4],
            DataType::Uint16,
            Compression::gzip(-1),
        )
        .unwrap();

        let data = ramp([10, 12, 9]);
        dataset.write_block([0, 0, 0], data.view()).unwrap();
        dataset
            .write_block([1, 1, 1], Array3::from_elem((2, 2, 2), 5.0).view())
            .unwrap();

        let reopened = N5Dataset::open(dir.path(), "s0").unwrap();
        let back = reopened.read_block([0, 0, 0], [10, 12, 9]).unwrap();
        let mut expected = data.clone();
        expected.slice_mut(s![1..3, 1..3, 1..3]).fill(5.0);
        assert_eq!(back, expected);

        // the payload after the 16 byte header is a gzip stream
        let block = fs::read(dir.path().join("s0").join("0").join("0").join("0")).unwrap();
        assert_eq!(&block[16..18], &[0x1f, 0x8b]);
    }

    #[test]
    fn reads_zlib_blocks_written_by_other_tools() {
        let dir = tempdir().unwrap();
        let dataset_dir = dir.path().join("s0");
        fs::create_dir_all(dataset_dir.join("0").join("0")).unwrap();
        fs::write(
            dataset_dir.join(ATTRIBUTES_FILE),
            r#"{"dimensions":[3,2,1],"blockSize":[3,2,1],"dataType":"uint8","compression":{"type":"gzip","level":6,"useZlib":true}}"#,
        )
        .unwrap();

        let mut block = vec![0, 0, 0, 3];
        for dim in [3u32, 2, 1] {
            block.extend_from_slice(&dim.to_be_bytes());
        }
        let mut encoder = ZlibEncoder::new(block, flate2::Compression::default());
        encoder.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        fs::write(dataset_dir.join("0").join("0").join("0"), encoder.finish().unwrap()).unwrap();

        let values = read_n5_block(dir.path(), "s0", [0, 0, 0], [1, 2, 3]).unwrap();
        assert_eq!(
            values,
            Array3::from_shape_vec((1, 2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
        );
    }

    #[test]
    fn gzip_attributes_keep_n5_field_names() {
        let raw = r#"{"type":"gzip","level":-1,"useZlib":false}"#;
        let compression: Compression = serde_json::from_str(raw).unwrap();
        assert_eq!(compression.level, Some(-1));
        assert_eq!(compression.use_zlib, Some(false));

        let encoded = serde_json::to_string(&Compression::gzip(4)).unwrap();
        assert_eq!(encoded, r#"{"type":"gzip","level":4}"#);
        assert_eq!(
            serde_json::to_string(&Compression::raw()).unwrap(),
            r#"{"type":"raw"}"#
        );
    }
}
