use thiserror::Error;

/// Errors raised while running detection
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("failed to read region ({x}, {y}, {width}x{height}): {reason}")]
    Read {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        reason: String,
    },

    #[error("preprocessing failed in {op}: {reason}")]
    Preprocessing { op: &'static str, reason: String },

    #[error("invalid prediction: {0}")]
    InvalidPrediction(String),

    #[error("detector has been closed")]
    Closed,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("measurement failed: {0}")]
    Measurement(String),
}

/// Errors raised by a prediction backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unexpected tensor shape {shape:?}: {reason}")]
    Shape { shape: Vec<usize>, reason: String },

    #[error("backend has been closed")]
    Closed,
}

/// Errors raised by polygon operations
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("{0} panicked")]
    Panicked(&'static str),

    #[error("{0} produced an empty geometry")]
    Empty(&'static str),

    #[error("{0} produced a non-finite coordinate")]
    NonFinite(&'static str),
}

pub type Result<T> = std::result::Result<T, DetectionError>;
