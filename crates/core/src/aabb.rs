//! Axis-aligned 3D bounding boxes in absolute voxel coordinates.
//!
//! Boxes are half-open (`start <= p < end`) and signed, because an unclipped
//! model input extent can reach below the volume origin.

use std::fmt;

use anyhow::{bail, Context, Result};

pub type Shape3 = [usize; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Aabb {
    pub start: [i64; 3],
    pub end: [i64; 3],
}

impl Aabb {
    /// Build a box, rejecting `start > end` on any axis.
    pub fn new(start: [i64; 3], end: [i64; 3]) -> Result<Self> {
        for axis in 0..3 {
            if start[axis] > end[axis] {
                bail!(
                    "invalid bounding box: start {:?} exceeds end {:?} on axis {axis}",
                    start,
                    end
                );
            }
        }
        Ok(Self { start, end })
    }

    /// Box `[0, shape)`.
    pub fn from_shape(shape: Shape3) -> Self {
        Self {
            start: [0; 3],
            end: [shape[0] as i64, shape[1] as i64, shape[2] as i64],
        }
    }

    pub fn from_start_shape(start: [i64; 3], shape: Shape3) -> Self {
        Self {
            start,
            end: [
                start[0] + shape[0] as i64,
                start[1] + shape[1] as i64,
                start[2] + shape[2] as i64,
            ],
        }
    }

    pub fn shape(&self) -> Shape3 {
        [
            (self.end[0] - self.start[0]).max(0) as usize,
            (self.end[1] - self.start[1]).max(0) as usize,
            (self.end[2] - self.start[2]).max(0) as usize,
        ]
    }

    pub fn voxel_count(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.end[axis] <= self.start[axis])
    }

    /// True when `other` lies fully inside `self`. Empty boxes are contained anywhere.
    pub fn contains(&self, other: &Aabb) -> bool {
        if other.is_empty() {
            return true;
        }
        (0..3).all(|axis| self.start[axis] <= other.start[axis] && other.end[axis] <= self.end[axis])
    }

    /// Intersection; collapses to an empty box anchored at the clamped start.
    pub fn intersect(&self, other: &Aabb) -> Aabb {
        let mut start = [0i64; 3];
        let mut end = [0i64; 3];
        for axis in 0..3 {
            start[axis] = self.start[axis].max(other.start[axis]);
            end[axis] = self.end[axis].min(other.end[axis]).max(start[axis]);
        }
        Aabb { start, end }
    }

    /// Grow by `margin` voxels on both sides of each axis.
    pub fn expand(&self, margin: Shape3) -> Aabb {
        let mut out = *self;
        for axis in 0..3 {
            out.start[axis] -= margin[axis] as i64;
            out.end[axis] += margin[axis] as i64;
        }
        out
    }

    /// Position of `self.start` relative to `origin.start`, as array indices.
    ///
    /// Fails when `self` starts before `origin` on any axis.
    pub fn offset_within(&self, origin: &Aabb) -> Result<Shape3> {
        let mut offset = [0usize; 3];
        for axis in 0..3 {
            let delta = self.start[axis] - origin.start[axis];
            if delta < 0 {
                bail!("{self} starts before {origin} on axis {axis}");
            }
            offset[axis] = delta as usize;
        }
        Ok(offset)
    }
}

impl fmt::Display for Aabb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{} .. {},{},{}]",
            self.start[0], self.start[1], self.start[2], self.end[0], self.end[1], self.end[2]
        )
    }
}

/// Parse a comma separated list of exactly `expected` integers, e.g. `"10,20,30"`.
pub fn parse_coords<T>(text: &str, expected: usize) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let values = text
        .split(',')
        .map(str::trim)
        .map(|part| {
            part.parse::<T>()
                .with_context(|| format!("invalid coordinate '{part}' in '{text}'"))
        })
        .collect::<Result<Vec<T>>>()?;

    if values.len() != expected {
        bail!(
            "expected {expected} comma separated values, got {} in '{text}'",
            values.len()
        );
    }
    Ok(values)
}

/// Parse `"a,b,c"` into a point.
pub fn parse_point(text: &str) -> Result<[i64; 3]> {
    let values = parse_coords::<i64>(text, 3)?;
    Ok([values[0], values[1], values[2]])
}

/// Parse `"a,b,c"` into a strictly positive shape.
pub fn parse_shape(text: &str) -> Result<Shape3> {
    let values = parse_coords::<usize>(text, 3)?;
    if values.iter().any(|v| *v == 0) {
        bail!("shape '{text}' must be positive on every axis");
    }
    Ok([values[0], values[1], values[2]])
}
