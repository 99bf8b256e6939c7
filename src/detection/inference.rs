use ndarray::{Array2, Array3, ArrayD, Axis, s};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::RunState;
use crate::error::{BackendError, DetectionError, Result};

/// Spatial dimensions are padded to a multiple of this before inference
pub const SIZE_MULTIPLE: usize = 64;

/// A tensor exchanged with a prediction backend, keyed by name
pub type NamedTensor = (String, ArrayD<f32>);

/// A black-box network that maps named input tensors to named outputs
pub trait PredictionBackend: Send + Sync {
    /// Name under which the input tensor is passed
    fn input_name(&self) -> &str {
        "input"
    }

    fn predict(&self, inputs: Vec<NamedTensor>) -> std::result::Result<Vec<NamedTensor>, BackendError>;

    /// Whether `predict` may be called from several threads at once
    fn is_thread_safe(&self) -> bool {
        false
    }

    /// Release any resources held by the backend
    fn close(&mut self) -> std::result::Result<(), BackendError> {
        Ok(())
    }
}

/// Axis order of the tensors a model expects and produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Yxc,
    Byxc,
    Cyx,
    Bcyx,
}

impl TensorLayout {
    fn has_batch(self) -> bool {
        matches!(self, TensorLayout::Byxc | TensorLayout::Bcyx)
    }

    fn channels_first(self) -> bool {
        matches!(self, TensorLayout::Cyx | TensorLayout::Bcyx)
    }

    /// Convert a (rows, cols, channels) tensor into this layout
    pub fn from_yxc(self, tensor: Array3<f32>) -> ArrayD<f32> {
        let tensor = if self.channels_first() {
            tensor.permuted_axes([2, 0, 1])
        } else {
            tensor
        };
        let tensor = tensor.as_standard_layout().into_owned().into_dyn();
        if self.has_batch() {
            tensor.insert_axis(Axis(0))
        } else {
            tensor
        }
    }

    /// Convert a tensor in this layout back to (rows, cols, channels).
    /// Two-dimensional outputs are treated as a single channel.
    pub fn to_yxc(self, tensor: ArrayD<f32>) -> std::result::Result<Array3<f32>, BackendError> {
        let shape = tensor.shape().to_vec();
        let shape_error = |reason: &str| BackendError::Shape {
            shape: shape.clone(),
            reason: reason.to_string(),
        };
        let mut tensor = tensor;
        if self.has_batch() && tensor.ndim() == 4 {
            if tensor.shape()[0] != 1 {
                return Err(shape_error("batch size must be 1"));
            }
            tensor = tensor.index_axis_move(Axis(0), 0);
        }
        let tensor = match tensor.ndim() {
            2 => tensor.insert_axis(Axis(2)),
            3 if self.channels_first() => tensor.permuted_axes(vec![1, 2, 0]),
            3 => tensor,
            _ => return Err(shape_error("expected two or three spatial/channel axes")),
        };
        tensor
            .as_standard_layout()
            .into_owned()
            .into_dimensionality()
            .map_err(|e| shape_error(&e.to_string()))
    }
}

/// Border added to a tile so its sides are multiples of [`SIZE_MULTIPLE`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Padding {
    pub x1: usize,
    pub x2: usize,
    pub y1: usize,
    pub y2: usize,
}

/// Per-tile network output, split into its components
#[derive(Debug, Clone)]
pub struct RawPrediction {
    /// Probability raster, (rows, cols)
    pub probability: Array2<f32>,
    /// Ray distances, (rows, cols, rays)
    pub rays: Array3<f32>,
    /// Classification scores, (rows, cols, classes)
    pub classes: Option<Array3<f32>>,
    /// Input pixels per output pixel along x
    pub scale_x: f64,
    /// Input pixels per output pixel along y
    pub scale_y: f64,
    /// Padding added to the input before inference
    pub padding: Padding,
}

/// Reflect-pad a tensor (edge pixels repeated) so both spatial dimensions are
/// multiples of `multiple`, splitting the extra pixels evenly between sides.
pub fn pad_to_multiple(tensor: &Array3<f32>, multiple: usize) -> (Array3<f32>, Padding) {
    let (rows, cols, n_channels) = tensor.dim();
    let target_rows = rows.div_ceil(multiple) * multiple;
    let target_cols = cols.div_ceil(multiple) * multiple;
    let padding = Padding {
        x1: (target_cols - cols) / 2,
        x2: target_cols - cols - (target_cols - cols) / 2,
        y1: (target_rows - rows) / 2,
        y2: target_rows - rows - (target_rows - rows) / 2,
    };
    if target_rows == rows && target_cols == cols {
        return (tensor.clone(), padding);
    }
    let padded = Array3::from_shape_fn((target_rows, target_cols, n_channels), |(y, x, c)| {
        let sy = reflect(y as isize - padding.y1 as isize, rows);
        let sx = reflect(x as isize - padding.x1 as isize, cols);
        tensor[[sy, sx, c]]
    });
    (padded, padding)
}

/// Map an out-of-range index back into `0..n` by mirroring, repeating the edge
fn reflect(mut i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            return i as usize;
        }
    }
}

/// Wraps a prediction backend with padding, layout conversion and output splitting
pub struct InferenceAdapter<'a> {
    backend: &'a dyn PredictionBackend,
    lock: Option<&'a Mutex<()>>,
    layout: TensorLayout,
    n_classifications: usize,
}

impl<'a> InferenceAdapter<'a> {
    /// `lock` serializes calls into backends that are not thread safe
    pub fn new(
        backend: &'a dyn PredictionBackend,
        lock: &'a Mutex<()>,
        layout: TensorLayout,
        n_classifications: usize,
    ) -> Self {
        let lock = if backend.is_thread_safe() { None } else { Some(lock) };
        Self {
            backend,
            lock,
            layout,
            n_classifications,
        }
    }

    /// Pad a preprocessed tile, run the backend and split its output
    pub fn predict(&self, tile: &Array3<f32>, state: &RunState) -> Result<RawPrediction> {
        let (padded, padding) = pad_to_multiple(tile, SIZE_MULTIPLE);
        let (input_rows, input_cols, _) = padded.dim();
        if input_rows == 0 || input_cols == 0 {
            return Err(DetectionError::InvalidPrediction("tile has no pixels".to_string()));
        }

        let inputs = vec![(self.backend.input_name().to_string(), self.layout.from_yxc(padded))];
        let outputs = match self.lock {
            Some(lock) => {
                let _guard = lock.lock().map_err(|_| {
                    BackendError::Inference("backend lock was poisoned".to_string())
                })?;
                self.backend.predict(inputs)?
            }
            None => self.backend.predict(inputs)?,
        };
        let outputs = outputs
            .into_iter()
            .map(|(name, tensor)| Ok((name, self.layout.to_yxc(tensor)?)))
            .collect::<std::result::Result<Vec<_>, BackendError>>()?;

        let (probability, rays, classes) = self.split_outputs(outputs)?;

        if state.take_first_run() && self.n_classifications > 0 {
            let available = classes.as_ref().map(|c| c.dim().2).unwrap_or(0);
            if self.n_classifications > available || self.n_classifications + 1 < available {
                warn!(
                    "{} classifications provided, {} available in the prediction",
                    self.n_classifications, available
                );
            } else {
                debug!(
                    "{} classifications provided, {} available in the prediction",
                    self.n_classifications, available
                );
            }
        }

        let (prob_rows, prob_cols) = probability.dim();
        if prob_rows == 0 || prob_cols == 0 {
            return Err(DetectionError::InvalidPrediction(format!(
                "probability raster has shape {prob_rows}x{prob_cols}"
            )));
        }
        if rays.dim().0 != prob_rows || rays.dim().1 != prob_cols {
            return Err(DetectionError::InvalidPrediction(format!(
                "ray raster {:?} does not match probability raster {prob_rows}x{prob_cols}",
                rays.dim()
            )));
        }
        if let Some(classes) = &classes {
            if classes.dim().0 != prob_rows || classes.dim().1 != prob_cols {
                return Err(DetectionError::InvalidPrediction(format!(
                    "classification raster {:?} does not match probability raster {prob_rows}x{prob_cols}",
                    classes.dim()
                )));
            }
        }

        let scale_x = (input_cols as f64 / prob_cols as f64).round();
        let scale_y = (input_rows as f64 / prob_rows as f64).round();
        if scale_x != 1.0 || scale_y != 1.0 {
            if scale_x != 2.0 || scale_y != 2.0 {
                warn!("Unexpected prediction rescaling x={}, y={}", scale_x, scale_y);
            } else {
                debug!("Prediction rescaling x={}, y={}", scale_x, scale_y);
            }
        }
        // A zero ratio means the output is larger than the input; decode at 1:1
        let scale_x = scale_x.max(1.0);
        let scale_y = scale_y.max(1.0);

        Ok(RawPrediction {
            probability,
            rays,
            classes,
            scale_x,
            scale_y,
            padding,
        })
    }

    /// Separate probability, rays and classifications.
    ///
    /// A single output is split by channel: probability first, then rays, then
    /// one channel per configured classification. Several outputs are told
    /// apart by channel count.
    fn split_outputs(
        &self,
        mut outputs: Vec<(String, Array3<f32>)>,
    ) -> Result<(Array2<f32>, Array3<f32>, Option<Array3<f32>>)> {
        if outputs.len() == 1 {
            let (name, output) = outputs.remove(0);
            let n_channels = output.dim().2;
            let n_rays = n_channels as isize - 1 - self.n_classifications as isize;
            if n_rays < 3 {
                return Err(DetectionError::InvalidPrediction(format!(
                    "output '{name}' has {n_channels} channels, too few for probability, rays and {} classifications",
                    self.n_classifications
                )));
            }
            let n_rays = n_rays as usize;
            let probability = output.index_axis(Axis(2), 0).to_owned();
            let rays = output.slice(s![.., .., 1..=n_rays]).to_owned();
            let classes = (self.n_classifications > 0).then(|| output.slice(s![.., .., n_rays + 1..]).to_owned());
            return Ok((probability, rays, classes));
        }

        let mut probability = None;
        let mut rays: Option<Array3<f32>> = None;
        let mut classes = None;
        for (_, output) in outputs {
            if output.dim().2 == 1 {
                probability = Some(output.index_axis_move(Axis(2), 0));
            } else if let Some(current) = rays.take() {
                if output.dim().2 > current.dim().2 {
                    classes = Some(current);
                    rays = Some(output);
                } else {
                    classes = Some(output);
                    rays = Some(current);
                }
            } else {
                rays = Some(output);
            }
        }
        match (probability, rays) {
            (Some(probability), Some(rays)) => Ok((probability, rays, classes)),
            _ => Err(DetectionError::InvalidPrediction(
                "outputs must include a single-channel probability and a multi-channel ray tensor".to_string(),
            )),
        }
    }
}
