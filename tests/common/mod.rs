mod fixtures;
pub use fixtures::*;

use ndarray::{Array3, ArrayD, Axis, IxDyn};
use starseg::{BackendError, NamedTensor, PredictionBackend};

/// Stands in for a trained network on images of bright disks.
///
/// Every foreground pixel (channel 0 above 127) casts rays until it leaves the
/// foreground; its probability is the ratio of shortest to longest ray, so
/// disk centres score close to 1. The output is one tensor holding the
/// probability, the rays and, optionally, background and foreground class scores.
pub struct DiskOracleBackend {
    pub n_rays: usize,
    pub with_classes: bool,
}

impl DiskOracleBackend {
    pub fn new(n_rays: usize) -> Self {
        Self {
            n_rays,
            with_classes: false,
        }
    }

    pub fn with_classes(mut self) -> Self {
        self.with_classes = true;
        self
    }

    fn predict_yxc(&self, input: &Array3<f32>) -> Array3<f32> {
        let (rows, cols, _) = input.dim();
        let n_classes = if self.with_classes { 2 } else { 0 };
        let mut output = Array3::<f32>::zeros((rows, cols, 1 + self.n_rays + n_classes));
        let foreground = |x: f64, y: f64| {
            let (xi, yi) = (x.round(), y.round());
            xi >= 0.0 && yi >= 0.0 && (xi as usize) < cols && (yi as usize) < rows && input[[yi as usize, xi as usize, 0]] > 127.0
        };

        for y in 0..rows {
            for x in 0..cols {
                if !foreground(x as f64, y as f64) {
                    if self.with_classes {
                        output[[y, x, 1 + self.n_rays]] = 1.0;
                    }
                    continue;
                }
                let mut shortest = f64::INFINITY;
                let mut longest: f64 = 0.0;
                for ray in 0..self.n_rays {
                    let theta = 2.0 * std::f64::consts::PI * ray as f64 / self.n_rays as f64;
                    let (dx, dy) = (theta.cos(), theta.sin());
                    let mut t = 0.0;
                    while foreground(x as f64 + (t + 0.25) * dx, y as f64 + (t + 0.25) * dy) {
                        t += 0.25;
                    }
                    let length = t + 0.5;
                    output[[y, x, 1 + ray]] = length as f32;
                    shortest = shortest.min(length);
                    longest = longest.max(length);
                }
                output[[y, x, 0]] = (shortest / longest) as f32;
                if self.with_classes {
                    output[[y, x, 1 + self.n_rays]] = 0.1;
                    output[[y, x, 2 + self.n_rays]] = 0.9;
                }
            }
        }
        output
    }
}

impl PredictionBackend for DiskOracleBackend {
    fn predict(&self, inputs: Vec<NamedTensor>) -> Result<Vec<NamedTensor>, BackendError> {
        let (_, tensor) = inputs
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Inference("no input".to_string()))?;
        let input: Array3<f32> = tensor.into_dimensionality().map_err(|e| BackendError::Shape {
            shape: vec![],
            reason: e.to_string(),
        })?;
        Ok(vec![("output".to_string(), self.predict_yxc(&input).into_dyn())])
    }

    fn is_thread_safe(&self) -> bool {
        true
    }
}

/// Backend whose output is computed by a closure from the input tensor
pub struct FnBackend<F>(F);

impl<F> FnBackend<F>
where
    F: Fn(&ArrayD<f32>) -> Result<Vec<NamedTensor>, BackendError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> PredictionBackend for FnBackend<F>
where
    F: Fn(&ArrayD<f32>) -> Result<Vec<NamedTensor>, BackendError> + Send + Sync,
{
    fn predict(&self, inputs: Vec<NamedTensor>) -> Result<Vec<NamedTensor>, BackendError> {
        let (_, tensor) = inputs
            .first()
            .ok_or_else(|| BackendError::Inference("no input".to_string()))?;
        (self.0)(tensor)
    }
}

/// Backend that always fails
pub struct FailingBackend;

impl PredictionBackend for FailingBackend {
    fn predict(&self, _inputs: Vec<NamedTensor>) -> Result<Vec<NamedTensor>, BackendError> {
        Err(BackendError::Inference("model exploded".to_string()))
    }
}

/// Zero tensor with the spatial size of a (rows, cols, channels) input, halved
pub fn half_resolution(input: &ArrayD<f32>, channels: usize) -> ArrayD<f32> {
    let rows = input.len_of(Axis(0)) / 2;
    let cols = input.len_of(Axis(1)) / 2;
    ArrayD::zeros(IxDyn(&[rows, cols, channels]))
}
