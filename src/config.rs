use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::detection::inference::TensorLayout;
use crate::error::{DetectionError, Result};
use crate::pipeline::ImageOp;

/// Default tile width and height, in pixels at the detection resolution
pub const DEFAULT_TILE_SIZE: usize = 1024;

/// Default padding added around each tile, in pixels at the detection resolution
pub const DEFAULT_PADDING: usize = 32;

/// Options controlling a detection run.
///
/// Every field has a default, so a JSON configuration only needs to name the
/// values it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionOptions {
    /// Minimum probability for a pixel to produce a candidate, between 0 and 1
    pub threshold: f64,

    /// Pixel size to detect at, in the same calibrated units as the image.
    /// `None` detects at full resolution.
    pub pixel_size: Option<f64>,

    pub tile_width: usize,
    pub tile_height: usize,

    /// Pixels requested around each tile to reduce boundary artifacts
    pub padding: usize,

    /// Visvalingam-Whyatt tolerance; 0 disables simplification
    pub simplify: f64,

    /// Distance to expand nuclei into cells, in calibrated units; 0 disables cells
    pub cell_expansion: f64,

    /// Upper bound for a cell as a multiple of its nucleus size
    pub cell_constrain_scale: Option<f64>,

    /// Clip nuclei and cells to the parent mask
    pub constrain_to_parent: bool,

    pub ignore_cell_overlaps: bool,
    pub include_probability: bool,
    pub keep_classified_background: bool,
    pub create_annotations: bool,
    pub measure_shape: bool,
    pub measure_intensity: bool,

    /// Label applied when no per-class label exists
    pub classify: Option<String>,

    /// Labels for the classification channels of the prediction
    pub classifications: BTreeMap<i32, String>,

    /// Input channels passed to the network; empty means all channels
    pub channels: Vec<usize>,

    /// Per-tile operations, applied after any global normalization
    pub preprocessing: Vec<ImageOp>,

    /// Normalization computed once across the whole target region
    pub global_normalization: Option<GlobalNormalization>,

    pub layout: TensorLayout,

    /// Worker threads for tile processing; `None` uses the global pool
    pub threads: Option<usize>,

    /// Report progress at info level rather than debug
    pub log_progress: bool,
}

impl DetectionOptions {
    pub fn new() -> Self {
        Self {
            threshold: 0.5,
            pixel_size: None,
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            padding: DEFAULT_PADDING,
            simplify: 1.4,
            cell_expansion: 0.0,
            cell_constrain_scale: None,
            constrain_to_parent: true,
            ignore_cell_overlaps: false,
            include_probability: false,
            keep_classified_background: false,
            create_annotations: false,
            measure_shape: false,
            measure_intensity: false,
            classify: None,
            classifications: BTreeMap::new(),
            channels: Vec::new(),
            preprocessing: Vec::new(),
            global_normalization: None,
            layout: TensorLayout::default(),
            threads: None,
            log_progress: false,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_pixel_size(mut self, pixel_size: f64) -> Self {
        self.pixel_size = Some(pixel_size);
        self
    }

    pub fn with_tile_size(mut self, width: usize, height: usize) -> Self {
        self.tile_width = width;
        self.tile_height = height;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_simplify(mut self, tolerance: f64) -> Self {
        self.simplify = tolerance;
        self
    }

    pub fn with_cell_expansion(mut self, distance: f64) -> Self {
        self.cell_expansion = distance;
        self
    }

    pub fn with_cell_constrain_scale(mut self, scale: f64) -> Self {
        self.cell_constrain_scale = Some(scale);
        self
    }

    pub fn with_constrain_to_parent(mut self, constrain: bool) -> Self {
        self.constrain_to_parent = constrain;
        self
    }

    pub fn with_ignore_cell_overlaps(mut self, ignore: bool) -> Self {
        self.ignore_cell_overlaps = ignore;
        self
    }

    pub fn with_include_probability(mut self, include: bool) -> Self {
        self.include_probability = include;
        self
    }

    pub fn with_keep_classified_background(mut self, keep: bool) -> Self {
        self.keep_classified_background = keep;
        self
    }

    pub fn with_create_annotations(mut self, annotations: bool) -> Self {
        self.create_annotations = annotations;
        self
    }

    pub fn with_measure_shape(mut self, measure: bool) -> Self {
        self.measure_shape = measure;
        self
    }

    pub fn with_measure_intensity(mut self, measure: bool) -> Self {
        self.measure_intensity = measure;
        self
    }

    pub fn with_classify(mut self, label: impl Into<String>) -> Self {
        self.classify = Some(label.into());
        self
    }

    pub fn with_classification(mut self, index: i32, label: impl Into<String>) -> Self {
        self.classifications.insert(index, label.into());
        self
    }

    pub fn with_channels(mut self, channels: Vec<usize>) -> Self {
        self.channels = channels;
        self
    }

    /// Append a per-tile preprocessing operation
    pub fn add_op(mut self, op: ImageOp) -> Self {
        self.preprocessing.push(op);
        self
    }

    /// Shorthand for per-tile percentile normalization, applied per channel
    pub fn normalize_percentiles(self, min: f64, max: f64) -> Self {
        self.add_op(ImageOp::NormalizePercentiles {
            min,
            max,
            per_channel: true,
            eps: 0.0,
        })
    }

    pub fn with_global_normalization(mut self, normalization: GlobalNormalization) -> Self {
        self.global_normalization = Some(normalization);
        self
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_log_progress(mut self, log: bool) -> Self {
        self.log_progress = log;
        self
    }

    /// Reject option combinations that cannot produce a valid run
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() {
            return Err(invalid("threshold must be finite"));
        }
        if self.tile_width <= 2 * self.padding || self.tile_height <= 2 * self.padding {
            return Err(invalid(format!(
                "tile size {}x{} must exceed twice the padding ({})",
                self.tile_width, self.tile_height, self.padding
            )));
        }
        if !self.simplify.is_finite() {
            return Err(invalid("simplify tolerance must be finite"));
        }
        if !self.cell_expansion.is_finite() || self.cell_expansion < 0.0 {
            return Err(invalid("cell expansion must be a non-negative number"));
        }
        if let Some(scale) = self.cell_constrain_scale {
            if scale.is_nan() || scale <= 0.0 {
                return Err(invalid("cell constrain scale must be positive"));
            }
        }
        if let Some(pixel_size) = self.pixel_size {
            if !pixel_size.is_finite() || pixel_size <= 0.0 {
                return Err(invalid("pixel size must be a positive number"));
            }
        }
        if self.threads == Some(0) {
            return Err(invalid("thread count must be at least 1"));
        }
        if let Some(normalization) = &self.global_normalization {
            normalization.validate()?;
        }
        for op in &self.preprocessing {
            op.validate()?;
        }
        Ok(())
    }
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// How global normalization statistics are computed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizationMode {
    /// Map the `min` and `max` percentiles to 0 and 1
    Percentiles { min: f64, max: f64 },
    /// Subtract the mean and divide by the standard deviation
    MeanStd,
}

/// Normalization based upon the whole target region rather than single tiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalNormalization {
    pub mode: NormalizationMode,
    pub per_channel: bool,
    pub eps: f64,

    /// Downsample used to compute statistics; `None` picks one from `max_dimension`
    pub downsample: Option<f64>,

    /// Largest side of the image read to compute statistics
    pub max_dimension: usize,

    /// Restrict statistics to pixels inside the mask
    pub use_mask: bool,
}

impl GlobalNormalization {
    pub fn percentiles(min: f64, max: f64) -> Self {
        Self {
            mode: NormalizationMode::Percentiles { min, max },
            ..Self::default()
        }
    }

    pub fn mean_std() -> Self {
        Self {
            mode: NormalizationMode::MeanStd,
            ..Self::default()
        }
    }

    pub fn with_per_channel(mut self, per_channel: bool) -> Self {
        self.per_channel = per_channel;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_downsample(mut self, downsample: f64) -> Self {
        self.downsample = Some(downsample);
        self
    }

    pub fn with_max_dimension(mut self, max_dimension: usize) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn with_use_mask(mut self, use_mask: bool) -> Self {
        self.use_mask = use_mask;
        self
    }

    fn validate(&self) -> Result<()> {
        if let NormalizationMode::Percentiles { min, max } = self.mode {
            if !(0.0..=100.0).contains(&min) || !(0.0..=100.0).contains(&max) || min > max {
                return Err(invalid(format!(
                    "invalid normalization percentiles {min}..{max}"
                )));
            }
        }
        if let Some(downsample) = self.downsample {
            if !downsample.is_finite() || downsample < 1.0 {
                return Err(invalid("normalization downsample must be at least 1"));
            }
        }
        if self.max_dimension == 0 {
            return Err(invalid("normalization max dimension must be positive"));
        }
        Ok(())
    }
}

impl Default for GlobalNormalization {
    fn default() -> Self {
        Self {
            mode: NormalizationMode::Percentiles { min: 0.0, max: 99.8 },
            per_channel: false,
            eps: 0.0,
            downsample: None,
            max_dimension: 2048,
            use_mask: false,
        }
    }
}

fn invalid(reason: impl Into<String>) -> DetectionError {
    DetectionError::InvalidOptions(reason.into())
}
