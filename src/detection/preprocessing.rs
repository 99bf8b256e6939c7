use geo::{Contains, Point, Polygon};
use ndarray::{Array2, ArrayView3, Axis};
use tracing::debug;

use crate::config::{GlobalNormalization, NormalizationMode};
use crate::error::Result;
use crate::image_source::{ImageSource, RegionRequest};
use crate::pipeline::{ImageOp, mean_std_affine, percentile_affine};

/// Sorted finite samples of one channel (or of all channels jointly)
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    sorted: Vec<f32>,
}

impl ChannelStats {
    pub fn from_values(values: impl IntoIterator<Item = f32>) -> Self {
        let mut sorted: Vec<f32> = values.into_iter().filter(|v| v.is_finite()).collect();
        sorted.sort_unstable_by(|a, b| a.total_cmp(b));
        Self { sorted }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Percentile in `[0, 100]`, interpolating linearly between closest ranks
    pub fn percentile(&self, p: f64) -> f64 {
        let n = self.sorted.len();
        if n == 0 {
            return 0.0;
        }
        let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let frac = rank - lo as f64;
        let a = self.sorted[lo] as f64;
        let b = self.sorted[hi] as f64;
        a + (b - a) * frac
    }

    pub fn mean(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        self.sorted.iter().map(|&v| v as f64).sum::<f64>() / self.sorted.len() as f64
    }

    /// Population standard deviation
    pub fn std_dev(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .sorted
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / self.sorted.len() as f64;
        var.sqrt()
    }
}

/// Statistics for every channel of a tensor.
///
/// With `per_channel` false, one joint statistic is computed and repeated for
/// each channel. Pixels where `mask` is false are ignored.
pub fn channel_stats(
    tensor: ArrayView3<f32>,
    mask: Option<&Array2<bool>>,
    per_channel: bool,
) -> Vec<ChannelStats> {
    let n_channels = tensor.dim().2;
    let samples = |c: usize| {
        let plane = tensor.index_axis(Axis(2), c);
        plane
            .indexed_iter()
            .filter(|(idx, _)| mask.is_none_or(|m| m.get(*idx).copied().unwrap_or(false)))
            .map(|(_, &v)| v)
            .collect::<Vec<f32>>()
    };
    if per_channel {
        (0..n_channels).map(|c| ChannelStats::from_values(samples(c))).collect()
    } else {
        let joint = ChannelStats::from_values((0..n_channels).flat_map(samples));
        vec![joint; n_channels]
    }
}

/// Compute normalization across the whole target region and express it as a
/// fixed per-channel [`ImageOp::Affine`] to be applied to every tile.
pub fn global_normalization_op(
    source: &dyn ImageSource,
    target: &RegionRequest,
    mask: Option<&Polygon<f64>>,
    channels: &[usize],
    normalization: &GlobalNormalization,
) -> Result<ImageOp> {
    let longest = target.width.max(target.height) as f64;
    let fitted = longest / normalization.max_dimension as f64;
    let downsample = normalization
        .downsample
        .unwrap_or(fitted)
        .max(target.downsample)
        .max(1.0);
    let request = RegionRequest { downsample, ..*target };

    let mut pixels = source.read_region(&request)?;
    if !channels.is_empty() {
        pixels = ImageOp::Channels {
            indices: channels.to_vec(),
        }
        .apply(pixels)?;
    }

    let pixel_mask = match mask {
        Some(mask) if normalization.use_mask => Some(mask_raster(&request, pixels.dim().0, pixels.dim().1, mask)),
        _ => None,
    };
    let stats = channel_stats(pixels.view(), pixel_mask.as_ref(), normalization.per_channel);
    debug!(
        downsample,
        samples = stats.first().map(|s| s.len()).unwrap_or(0),
        "computed global normalization statistics"
    );

    let (subtract, scale) = match normalization.mode {
        NormalizationMode::Percentiles { min, max } => percentile_affine(&stats, min, max, normalization.eps),
        NormalizationMode::MeanStd => mean_std_affine(&stats, normalization.eps),
    };
    Ok(ImageOp::Affine { subtract, scale })
}

/// Which pixels of a read region have their centres inside `mask`
pub(crate) fn mask_raster<G>(request: &RegionRequest, rows: usize, cols: usize, mask: &G) -> Array2<bool>
where
    G: Contains<Point<f64>>,
{
    let sx = request.width as f64 / cols as f64;
    let sy = request.height as f64 / rows as f64;
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        let px = request.x as f64 + (x as f64 + 0.5) * sx;
        let py = request.y as f64 + (y as f64 + 0.5) * sy;
        mask.contains(&Point::new(px, py))
    })
}
