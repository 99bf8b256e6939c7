use geo::{Area, BoundingRect, Centroid, EuclideanLength, Point, Polygon};
use serde::Serialize;
use std::collections::BTreeMap;

/// Classification index used when the model has no classification output
pub const UNCLASSIFIED: i32 = -1;

/// Measurement key used when detection probabilities are requested
pub const PROBABILITY_MEASUREMENT: &str = "Detection probability";

/// A candidate nucleus decoded from a single prediction pixel.
///
/// The area is captured once at construction and never recomputed, so later
/// trimming can be judged against the size the candidate started with.
#[derive(Debug, Clone)]
pub struct PotentialNucleus {
    pub geometry: Polygon<f64>,
    pub probability: f64,
    pub classification: i32,
    original_area: f64,
}

impl PotentialNucleus {
    pub fn new(geometry: Polygon<f64>, probability: f64, classification: i32) -> Self {
        let original_area = geometry.unsigned_area();
        Self {
            geometry,
            probability,
            classification,
            original_area,
        }
    }

    /// Area of the geometry this candidate was created with
    pub fn original_area(&self) -> f64 {
        self.original_area
    }

    pub fn centroid(&self) -> Option<Point<f64>> {
        self.geometry.centroid()
    }
}

/// How a detected object should be represented by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    #[default]
    Detection,
    Annotation,
}

/// A detected nucleus, optionally with an estimated cell boundary
#[derive(Debug, Clone, Serialize)]
pub struct FinalObject {
    pub(crate) nucleus: Polygon<f64>,
    pub(crate) cell: Option<Polygon<f64>>,
    pub(crate) classification: i32,
    pub(crate) label: Option<String>,
    pub(crate) probability: f64,
    pub(crate) kind: ObjectKind,
    pub(crate) measurements: BTreeMap<String, f64>,
}

impl FinalObject {
    pub fn nucleus(&self) -> &Polygon<f64> {
        &self.nucleus
    }

    pub fn cell(&self) -> Option<&Polygon<f64>> {
        self.cell.as_ref()
    }

    /// The outermost boundary: the cell if one was estimated, else the nucleus
    pub fn boundary(&self) -> &Polygon<f64> {
        self.cell.as_ref().unwrap_or(&self.nucleus)
    }

    pub fn classification(&self) -> i32 {
        self.classification
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn measurements(&self) -> &BTreeMap<String, f64> {
        &self.measurements
    }

    pub fn measurement(&self, name: &str) -> Option<f64> {
        self.measurements.get(name).copied()
    }

    pub fn nucleus_area(&self) -> f64 {
        self.nucleus.unsigned_area()
    }

    pub fn nucleus_perimeter(&self) -> f64 {
        perimeter(&self.nucleus)
    }

    /// Circularity = 4π × area / perimeter², 1.0 for a perfect circle
    pub fn nucleus_circularity(&self) -> f64 {
        circularity(&self.nucleus)
    }

    pub fn centroid(&self) -> Option<Point<f64>> {
        self.nucleus.centroid()
    }

    /// Bounding box of the outermost boundary as (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        self.boundary()
            .bounding_rect()
            .map(|r| (r.min().x, r.min().y, r.max().x, r.max().y))
    }
}

pub(crate) fn perimeter(polygon: &Polygon<f64>) -> f64 {
    polygon.exterior().euclidean_length()
        + polygon
            .interiors()
            .iter()
            .map(|ring| ring.euclidean_length())
            .sum::<f64>()
}

pub(crate) fn circularity(polygon: &Polygon<f64>) -> f64 {
    let perimeter = perimeter(polygon);
    if perimeter <= 0.0 {
        return 0.0;
    }
    4.0 * std::f64::consts::PI * polygon.unsigned_area() / (perimeter * perimeter)
}
