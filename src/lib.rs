pub mod config;
pub mod detection;
pub mod error;
pub mod geometry;
pub mod image_source;
pub mod models;
pub mod pipeline;

#[cfg(feature = "rten")]
pub mod backend;

pub use config::{DetectionOptions, GlobalNormalization, NormalizationMode};
pub use detection::inference::{NamedTensor, PredictionBackend, TensorLayout};
pub use detection::measurements::{IntensityMeasurements, MeasurementProvider, ShapeMeasurements};
pub use detection::{CancelFlag, NucleusDetector};
pub use error::{BackendError, DetectionError, GeometryError, Result};
pub use image_source::{ImageBufferSource, ImageSource, RegionRequest};
pub use models::{FinalObject, ObjectKind, PotentialNucleus};
pub use pipeline::{ImageOp, PixelType, Preprocessor};
