use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use ndarray::{Array3, Axis, s};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::detection::preprocessing::{ChannelStats, channel_stats};
use crate::error::{DetectionError, Result};

/// Numeric type a tensor is cast to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelType {
    U8,
    U16,
    #[default]
    F32,
}

/// A single preprocessing operation on a (rows, cols, channels) tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ImageOp {
    /// Round and clamp values to the range of an integer type
    Cast { pixel_type: PixelType },

    /// Keep the listed channels, in the listed order
    Channels { indices: Vec<usize> },

    /// Colour deconvolution of an RGB image into stain channels.
    /// Each row of `stains` is a stain's optical density vector.
    Deconvolve { stains: [[f64; 3]; 3], max_value: f64 },

    /// Add one value to all channels, or one value per channel
    Add { values: Vec<f64> },

    Subtract { values: Vec<f64> },

    Multiply { values: Vec<f64> },

    /// Map the `min` and `max` percentiles of the tile to 0 and 1
    NormalizePercentiles {
        min: f64,
        max: f64,
        per_channel: bool,
        eps: f64,
    },

    /// Zero mean and unit variance over the tile
    NormalizeMeanStd { per_channel: bool, eps: f64 },

    /// `(value - subtract) * scale`, with fixed per-channel parameters
    Affine { subtract: Vec<f64>, scale: Vec<f64> },

    GaussianBlur { sigma: f32 },

    /// Median over a square window of side `2 * radius + 1`
    Median { radius: usize },
}

impl ImageOp {
    /// Human-readable name for this op (used in log output)
    pub fn name(&self) -> &'static str {
        match self {
            ImageOp::Cast { .. } => "cast",
            ImageOp::Channels { .. } => "channels",
            ImageOp::Deconvolve { .. } => "deconvolve",
            ImageOp::Add { .. } => "add",
            ImageOp::Subtract { .. } => "subtract",
            ImageOp::Multiply { .. } => "multiply",
            ImageOp::NormalizePercentiles { .. } => "normalize percentiles",
            ImageOp::NormalizeMeanStd { .. } => "normalize mean/std",
            ImageOp::Affine { .. } => "affine",
            ImageOp::GaussianBlur { .. } => "gaussian blur",
            ImageOp::Median { .. } => "median",
        }
    }

    /// Check parameters that do not depend on the input
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(DetectionError::InvalidOptions(format!("{}: {}", self.name(), reason)))
        };
        match self {
            ImageOp::Channels { indices } if indices.is_empty() => fail("no channels selected"),
            ImageOp::Deconvolve { max_value, .. } if !(*max_value > 0.0) => {
                fail("max value must be positive")
            }
            ImageOp::Deconvolve { stains, .. } if invert3(stains).is_none() => {
                fail("stain vectors are not independent")
            }
            ImageOp::Add { values } | ImageOp::Subtract { values } | ImageOp::Multiply { values }
                if values.is_empty() =>
            {
                fail("no values given")
            }
            ImageOp::NormalizePercentiles { min, max, .. }
                if !(0.0..=100.0).contains(min) || !(0.0..=100.0).contains(max) || min > max =>
            {
                fail("percentiles must satisfy 0 <= min <= max <= 100")
            }
            ImageOp::Affine { subtract, scale } if subtract.len() != scale.len() || scale.is_empty() => {
                fail("subtract and scale must have the same, non-zero length")
            }
            ImageOp::GaussianBlur { sigma } if !(*sigma > 0.0) => fail("sigma must be positive"),
            _ => Ok(()),
        }
    }

    /// Apply this op, consuming the input tensor
    pub fn apply(&self, tensor: Array3<f32>) -> Result<Array3<f32>> {
        match self {
            ImageOp::Cast { pixel_type } => Ok(cast(tensor, *pixel_type)),
            ImageOp::Channels { indices } => select_channels(&tensor, indices),
            ImageOp::Deconvolve { stains, max_value } => deconvolve(&tensor, stains, *max_value),
            ImageOp::Add { values } => per_channel(self.name(), tensor, values, |v, a| v + a),
            ImageOp::Subtract { values } => per_channel(self.name(), tensor, values, |v, a| v - a),
            ImageOp::Multiply { values } => per_channel(self.name(), tensor, values, |v, a| v * a),
            ImageOp::NormalizePercentiles {
                min,
                max,
                per_channel: separate,
                eps,
            } => {
                let stats = channel_stats(tensor.view(), None, *separate);
                let (subtract, scale) = percentile_affine(&stats, *min, *max, *eps);
                affine(self.name(), tensor, &subtract, &scale)
            }
            ImageOp::NormalizeMeanStd {
                per_channel: separate,
                eps,
            } => {
                let stats = channel_stats(tensor.view(), None, *separate);
                let (subtract, scale) = mean_std_affine(&stats, *eps);
                affine(self.name(), tensor, &subtract, &scale)
            }
            ImageOp::Affine { subtract, scale } => affine(self.name(), tensor, subtract, scale),
            ImageOp::GaussianBlur { sigma } => Ok(blur(&tensor, *sigma)),
            ImageOp::Median { radius } => Ok(median(&tensor, *radius)),
        }
    }
}

/// Ordered preprocessing applied to every tile before inference
#[derive(Debug, Clone)]
pub struct Preprocessor {
    ops: Vec<ImageOp>,
}

impl Preprocessor {
    /// Create an empty preprocessor
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Append an op; ops run in the order they are added
    pub fn add_op(mut self, op: ImageOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn add_ops(mut self, ops: impl IntoIterator<Item = ImageOp>) -> Self {
        self.ops.extend(ops);
        self
    }

    pub fn ops(&self) -> &[ImageOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Run every op in order
    pub fn run(&self, mut tensor: Array3<f32>) -> Result<Array3<f32>> {
        for op in &self.ops {
            trace!(op = op.name(), shape = ?tensor.dim(), "applying preprocessing op");
            tensor = op.apply(tensor)?;
        }
        Ok(tensor)
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-channel affine parameters mapping percentiles `min` and `max` to 0 and 1
pub(crate) fn percentile_affine(stats: &[ChannelStats], min: f64, max: f64, eps: f64) -> (Vec<f64>, Vec<f64>) {
    stats
        .iter()
        .map(|s| {
            let lo = s.percentile(min);
            let hi = s.percentile(max);
            let range = hi - lo + eps;
            let scale = if range.abs() > f64::EPSILON { 1.0 / range } else { 1.0 };
            (lo, scale)
        })
        .unzip()
}

/// Per-channel affine parameters for zero mean and unit variance
pub(crate) fn mean_std_affine(stats: &[ChannelStats], eps: f64) -> (Vec<f64>, Vec<f64>) {
    stats
        .iter()
        .map(|s| {
            let denom = s.std_dev() + eps;
            let scale = if denom.abs() > f64::EPSILON { 1.0 / denom } else { 1.0 };
            (s.mean(), scale)
        })
        .unzip()
}

fn cast(mut tensor: Array3<f32>, pixel_type: PixelType) -> Array3<f32> {
    let max = match pixel_type {
        PixelType::F32 => return tensor,
        PixelType::U8 => u8::MAX as f32,
        PixelType::U16 => u16::MAX as f32,
    };
    tensor.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.round().clamp(0.0, max) });
    tensor
}

fn select_channels(tensor: &Array3<f32>, indices: &[usize]) -> Result<Array3<f32>> {
    let n_channels = tensor.dim().2;
    if let Some(bad) = indices.iter().find(|&&c| c >= n_channels) {
        return Err(DetectionError::Preprocessing {
            op: "channels",
            reason: format!("channel {bad} requested but the image has {n_channels}"),
        });
    }
    Ok(tensor.select(Axis(2), indices))
}

fn expand_values(op: &'static str, values: &[f64], n_channels: usize) -> Result<Vec<f64>> {
    match values.len() {
        1 => Ok(vec![values[0]; n_channels]),
        n if n == n_channels => Ok(values.to_vec()),
        n => Err(DetectionError::Preprocessing {
            op,
            reason: format!("{n} values given for {n_channels} channels"),
        }),
    }
}

fn per_channel(
    op: &'static str,
    mut tensor: Array3<f32>,
    values: &[f64],
    f: impl Fn(f32, f32) -> f32,
) -> Result<Array3<f32>> {
    let values = expand_values(op, values, tensor.dim().2)?;
    for (mut plane, value) in tensor.axis_iter_mut(Axis(2)).zip(values) {
        plane.mapv_inplace(|v| f(v, value as f32));
    }
    Ok(tensor)
}

fn affine(op: &'static str, mut tensor: Array3<f32>, subtract: &[f64], scale: &[f64]) -> Result<Array3<f32>> {
    let n_channels = tensor.dim().2;
    let subtract = expand_values(op, subtract, n_channels)?;
    let scale = expand_values(op, scale, n_channels)?;
    for ((mut plane, sub), mul) in tensor.axis_iter_mut(Axis(2)).zip(subtract).zip(scale) {
        plane.mapv_inplace(|v| ((v as f64 - sub) * mul) as f32);
    }
    Ok(tensor)
}

fn deconvolve(tensor: &Array3<f32>, stains: &[[f64; 3]; 3], max_value: f64) -> Result<Array3<f32>> {
    let (rows, cols, n_channels) = tensor.dim();
    if n_channels != 3 {
        return Err(DetectionError::Preprocessing {
            op: "deconvolve",
            reason: format!("expected an RGB image, got {n_channels} channels"),
        });
    }
    let normalized = stains.map(|row| {
        let norm = (row[0] * row[0] + row[1] * row[1] + row[2] * row[2]).sqrt();
        if norm > 0.0 { row.map(|v| v / norm) } else { row }
    });
    let inverse = invert3(&normalized).ok_or_else(|| DetectionError::Preprocessing {
        op: "deconvolve",
        reason: "stain vectors are not independent".to_string(),
    })?;

    let mut output = Array3::<f32>::zeros((rows, cols, 3));
    for y in 0..rows {
        for x in 0..cols {
            let od: [f64; 3] = std::array::from_fn(|c| {
                let value = (tensor[[y, x, c]] as f64).max(1.0);
                -(value / max_value).log10()
            });
            for stain in 0..3 {
                let amount = od[0] * inverse[0][stain] + od[1] * inverse[1][stain] + od[2] * inverse[2][stain];
                output[[y, x, stain]] = amount as f32;
            }
        }
    }
    Ok(output)
}

fn invert3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let cofactor = |r: usize, c: usize| {
        let rows: Vec<usize> = (0..3).filter(|&i| i != r).collect();
        let cols: Vec<usize> = (0..3).filter(|&i| i != c).collect();
        let minor = m[rows[0]][cols[0]] * m[rows[1]][cols[1]] - m[rows[0]][cols[1]] * m[rows[1]][cols[0]];
        if (r + c) % 2 == 0 { minor } else { -minor }
    };
    // Inverse is the transposed cofactor matrix over the determinant
    Some(std::array::from_fn(|r| std::array::from_fn(|c| cofactor(c, r) / det)))
}

fn blur(tensor: &Array3<f32>, sigma: f32) -> Array3<f32> {
    let (rows, cols, n_channels) = tensor.dim();
    let mut output = Array3::<f32>::zeros((rows, cols, n_channels));
    for c in 0..n_channels {
        let plane = tensor.slice(s![.., .., c]);
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| Luma([plane[[y as usize, x as usize]]]));
        let blurred = gaussian_blur_f32(&buffer, sigma);
        for (x, y, pixel) in blurred.enumerate_pixels() {
            output[[y as usize, x as usize, c]] = pixel[0];
        }
    }
    output
}

fn median(tensor: &Array3<f32>, radius: usize) -> Array3<f32> {
    if radius == 0 {
        return tensor.clone();
    }
    let (rows, cols, n_channels) = tensor.dim();
    let mut output = Array3::<f32>::zeros((rows, cols, n_channels));
    let mut window = Vec::with_capacity((2 * radius + 1).pow(2));
    for c in 0..n_channels {
        for y in 0..rows {
            for x in 0..cols {
                window.clear();
                let y0 = y.saturating_sub(radius);
                let y1 = (y + radius + 1).min(rows);
                let x0 = x.saturating_sub(radius);
                let x1 = (x + radius + 1).min(cols);
                window.extend(tensor.slice(s![y0..y1, x0..x1, c]).iter().copied());
                let mid = window.len() / 2;
                let (_, value, _) = window.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
                output[[y, x, c]] = *value;
            }
        }
    }
    output
}
