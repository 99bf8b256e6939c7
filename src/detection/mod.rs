pub mod assemble;
pub mod cells;
pub mod decode;
pub mod inference;
pub mod measurements;
pub mod overlaps;
pub mod preprocessing;
pub mod tiles;

use geo::{BooleanOps, MultiPolygon, Polygon};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

use crate::config::DetectionOptions;
use crate::error::{DetectionError, Result};
use crate::geometry::attempt;
use crate::image_source::ImageSource;
use crate::models::{FinalObject, PotentialNucleus};
use crate::pipeline::{ImageOp, PixelType, Preprocessor};
use assemble::AssembleParams;
use decode::DecodeParams;
use inference::{InferenceAdapter, PredictionBackend};
use measurements::{IntensityMeasurements, MeasurementProvider, ShapeMeasurements};
use tiles::{Tile, TileScheduler};

/// Log at info when progress logging is enabled, otherwise at debug
macro_rules! progress {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Shared flag used to cancel detection from another thread.
///
/// Once set, in-flight and future runs return no objects until [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State scoped to a single `detect` call
#[derive(Debug)]
pub struct RunState {
    first_run: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            first_run: AtomicBool::new(true),
        }
    }

    /// True exactly once per run, for one-off diagnostics
    pub fn take_first_run(&self) -> bool {
        self.first_run.swap(false, Ordering::SeqCst)
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Detects nuclei (and optionally cells) with a star-convex polygon network
pub struct NucleusDetector {
    backend: Option<Box<dyn PredictionBackend>>,
    backend_lock: Mutex<()>,
    options: DetectionOptions,
    cancel: CancelFlag,
    providers: Vec<Box<dyn MeasurementProvider>>,
}

impl NucleusDetector {
    pub fn new(backend: impl PredictionBackend + 'static, options: DetectionOptions) -> Result<Self> {
        Self::from_boxed(Box::new(backend), options)
    }

    pub fn from_boxed(backend: Box<dyn PredictionBackend>, options: DetectionOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            backend: Some(backend),
            backend_lock: Mutex::new(()),
            options,
            cancel: CancelFlag::new(),
            providers: Vec::new(),
        })
    }

    /// Add a measurement run over every detected object
    pub fn add_measurement(mut self, provider: impl MeasurementProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Share a cancel flag created elsewhere, e.g. one held by a UI or a backend
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &DetectionOptions {
        &self.options
    }

    /// Handle that cancels running and future detections when set
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    /// Release the backend. Later calls to `detect` fail with [`DetectionError::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut backend) = self.backend.take() {
            backend.close()?;
            debug!("Closed prediction backend");
        }
        Ok(())
    }

    /// Detect objects inside `region` (the whole image when `None`).
    ///
    /// `mask` restricts which candidates are kept and clips the output; it
    /// defaults to `region`. A cancelled run returns an empty list.
    pub fn detect(
        &self,
        source: &dyn ImageSource,
        region: Option<&Polygon<f64>>,
        mask: Option<&Polygon<f64>>,
    ) -> Result<Vec<FinalObject>> {
        let backend = self.backend.as_deref().ok_or(DetectionError::Closed)?;
        let mask = mask.or(region);
        match self.options.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
                pool.install(|| self.run(backend, source, region, mask))
            }
            None => self.run(backend, source, region, mask),
        }
    }

    fn run(
        &self,
        backend: &dyn PredictionBackend,
        source: &dyn ImageSource,
        region: Option<&Polygon<f64>>,
        mask: Option<&Polygon<f64>>,
    ) -> Result<Vec<FinalObject>> {
        let options = &self.options;
        let log = options.log_progress;
        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let downsample = match options.pixel_size {
            Some(pixel_size) => pixel_size / source.pixel_size(),
            None => 1.0,
        };
        if !downsample.is_finite() || downsample <= 0.0 {
            return Err(DetectionError::InvalidOptions(format!(
                "cannot detect at downsample {downsample}"
            )));
        }

        let scheduler = TileScheduler {
            image_width: source.width(),
            image_height: source.height(),
            tile_width: options.tile_width,
            tile_height: options.tile_height,
            padding: options.padding,
            downsample,
        };
        let target = scheduler.target(region);
        let tiles = scheduler.schedule(&target, mask);
        if tiles.is_empty() {
            progress!(log, "No tiles to process");
            return Ok(Vec::new());
        }

        let preprocessor = self.build_preprocessor(source, &target, mask)?;
        let adapter = InferenceAdapter::new(
            backend,
            &self.backend_lock,
            options.layout,
            options.classifications.len(),
        );
        let state = RunState::new();
        let multi_tile = tiles.len() > 1;
        let user_mask = mask.map(|m| MultiPolygon::new(vec![m.clone()]));

        if multi_tile {
            progress!(log, "Detecting nuclei for {} tiles", tiles.len());
        } else {
            progress!(log, "Detecting nuclei");
        }
        let mut nuclei: Vec<PotentialNucleus> = tiles
            .par_iter()
            .flat_map_iter(|tile| {
                self.detect_tile(tile, source, &preprocessor, &adapter, &state, user_mask.as_ref(), multi_tile)
            })
            .collect();

        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        if multi_tile {
            progress!(log, "Resolving nucleus overlaps");
            nuclei = overlaps::resolve_overlaps(nuclei);
        }

        let expansion = options.cell_expansion / source.pixel_size();
        let params = AssembleParams::from_options(options, expansion, user_mask.as_ref());
        let mut objects: Vec<FinalObject> = nuclei
            .par_iter()
            .filter_map(|nucleus| match assemble::convert(nucleus, &params) {
                Ok(object) => object,
                Err(e) => {
                    tracing::warn!("Error converting to object: {}", e);
                    None
                }
            })
            .collect();

        if expansion > 0.0 && !options.ignore_cell_overlaps {
            progress!(log, "Resolving cell overlaps");
            cells::resolve_cell_overlaps(&mut objects);
        }

        let shape = ShapeMeasurements;
        let intensity = IntensityMeasurements { downsample };
        let mut providers: Vec<&dyn MeasurementProvider> = Vec::new();
        if options.measure_shape {
            providers.push(&shape);
        }
        if options.measure_intensity {
            providers.push(&intensity);
        }
        providers.extend(self.providers.iter().map(|p| p.as_ref()));
        if !objects.is_empty() && !providers.is_empty() {
            progress!(log, "Making measurements");
            measurements::apply_measurements(&mut objects, &providers, source);
        }

        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        progress!(log, "Detected {} cells", objects.len());
        Ok(objects)
    }

    /// Channel selection, global normalization, then the configured ops
    fn build_preprocessor(
        &self,
        source: &dyn ImageSource,
        target: &crate::image_source::RegionRequest,
        mask: Option<&Polygon<f64>>,
    ) -> Result<Preprocessor> {
        let options = &self.options;
        let mut preprocessor = Preprocessor::new();
        if !options.channels.is_empty() {
            preprocessor = preprocessor.add_op(ImageOp::Channels {
                indices: options.channels.clone(),
            });
        }
        if let Some(normalization) = &options.global_normalization {
            let op = preprocessing::global_normalization_op(source, target, mask, &options.channels, normalization)?;
            preprocessor = preprocessor.add_op(op);
        }
        preprocessor = preprocessor.add_ops(options.preprocessing.iter().cloned());
        if !preprocessor.is_empty() {
            preprocessor = preprocessor.add_op(ImageOp::Cast {
                pixel_type: PixelType::F32,
            });
        }
        Ok(preprocessor)
    }

    #[allow(clippy::too_many_arguments)]
    fn detect_tile(
        &self,
        tile: &Tile,
        source: &dyn ImageSource,
        preprocessor: &Preprocessor,
        adapter: &InferenceAdapter,
        state: &RunState,
        mask: Option<&MultiPolygon<f64>>,
        exclude_on_bounds: bool,
    ) -> Vec<PotentialNucleus> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }

        // Only keep candidates centred inside this tile's core
        let core = MultiPolygon::new(vec![tile.core.to_polygon()]);
        let tile_mask = match mask {
            Some(mask) => match attempt("intersection", || mask.intersection(&core)) {
                Ok(clipped) => clipped,
                Err(e) => {
                    error!("Failed to clip mask to tile at ({}, {}): {}", tile.core.x, tile.core.y, e);
                    return Vec::new();
                }
            },
            None => core,
        };

        let prediction = source
            .read_region(&tile.padded)
            .and_then(|pixels| preprocessor.run(pixels))
            .and_then(|input| adapter.predict(&input, state));
        let prediction = match prediction {
            Ok(prediction) => prediction,
            Err(e) => {
                error!("Tile at ({}, {}) failed: {}", tile.core.x, tile.core.y, e);
                return Vec::new();
            }
        };

        let downsample = tile.padded.downsample;
        let params = DecodeParams {
            threshold: self.options.threshold,
            downsample,
            origin_x: tile.padded.x as f64 - downsample * prediction.padding.x1 as f64,
            origin_y: tile.padded.y as f64 - downsample * prediction.padding.y1 as f64,
            mask: Some(&tile_mask),
            keep_classified_background: self.options.keep_classified_background,
            simplify: self.options.simplify,
        };
        let mut nuclei = decode::decode(&prediction, &params);
        if exclude_on_bounds {
            decode::exclude_on_bounds(&mut nuclei, &tile.padded, source.width(), source.height());
        }
        overlaps::resolve_overlaps(nuclei)
    }
}

impl Drop for NucleusDetector {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close prediction backend: {}", e);
        }
    }
}
