//! Polygon helpers shared by the decoder, resolver and cell estimator.
//!
//! Boolean operations in `geo` can panic on degenerate input. Every such call
//! goes through [`attempt`] so a bad polygon costs one object, not the run.

use geo::{Area, BoundingRect, Coord, MultiPolygon, Polygon, Rect, SimplifyVwPreserve};
use geo_clipper::{Clipper, EndType, JoinType};
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::GeometryError;

/// Fixed-point scale used when offsetting with Clipper
const CLIPPER_FACTOR: f64 = 256.0;

/// Maximum deviation of round joins from the true arc, in pixels
const ARC_TOLERANCE: f64 = 0.05;

/// Run a geometry operation, turning a panic into an error
pub fn attempt<T>(name: &'static str, op: impl FnOnce() -> T) -> Result<T, GeometryError> {
    catch_unwind(AssertUnwindSafe(op)).map_err(|_| GeometryError::Panicked(name))
}

/// Axis-aligned envelope of a polygon
pub fn envelope(polygon: &Polygon<f64>) -> Option<Rect<f64>> {
    polygon.bounding_rect()
}

/// The only polygon of a result, if it has exactly one non-empty part
pub fn single_polygon(multi: MultiPolygon<f64>) -> Option<Polygon<f64>> {
    let mut parts = multi
        .0
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0);
    let first = parts.next()?;
    match parts.next() {
        Some(_) => None,
        None => Some(first),
    }
}

/// The part with the largest area, dropping slivers and empty parts
pub fn largest_polygon(multi: MultiPolygon<f64>) -> Option<Polygon<f64>> {
    multi
        .0
        .into_iter()
        .map(|p| (p.unsigned_area(), p))
        .filter(|(area, _)| *area > 0.0)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, p)| p)
}

/// Vertex-reducing, topology-preserving simplification.
///
/// Vertices whose effective triangle area falls below `tolerance²` are removed.
/// A tolerance of zero or less, or a simplification that fails or degenerates,
/// returns the input unchanged.
pub fn simplify(polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
    if tolerance <= 0.0 {
        return polygon.clone();
    }
    let epsilon = tolerance * tolerance;
    match attempt("simplify", || polygon.simplify_vw_preserve(&epsilon)) {
        Ok(simplified) if is_usable(&simplified) => simplified,
        _ => polygon.clone(),
    }
}

/// Expand a polygon outwards by `distance` with round joins
pub fn buffer(polygon: &Polygon<f64>, distance: f64) -> Result<MultiPolygon<f64>, GeometryError> {
    let buffered = attempt("buffer", || {
        polygon.offset(
            distance,
            JoinType::Round(ARC_TOLERANCE * CLIPPER_FACTOR),
            EndType::ClosedPolygon,
            CLIPPER_FACTOR,
        )
    })?;
    if buffered.0.is_empty() {
        return Err(GeometryError::Empty("buffer"));
    }
    Ok(buffered)
}

/// A closed ring with at least three distinct vertices, finite coordinates and area
pub fn is_usable(polygon: &Polygon<f64>) -> bool {
    let ring = polygon.exterior();
    ring.0.len() >= 4
        && ring.0.iter().all(|c| c.x.is_finite() && c.y.is_finite())
        && polygon.unsigned_area() > 0.0
}

/// A quadrilateral covering the half-plane on `origin`'s side of the
/// perpendicular bisector between `origin` and `other`, clipped to `extent`
/// around the midpoint.
pub fn bisector_half_plane(origin: Coord<f64>, other: Coord<f64>, extent: f64) -> Option<Polygon<f64>> {
    let dx = other.x - origin.x;
    let dy = other.y - origin.y;
    let length = dx.hypot(dy);
    if !(length > 0.0) || !extent.is_finite() {
        return None;
    }
    // Unit vector towards the neighbour, and its perpendicular
    let (ux, uy) = (dx / length, dy / length);
    let (px, py) = (-uy, ux);
    let mid = Coord {
        x: origin.x + dx / 2.0,
        y: origin.y + dy / 2.0,
    };
    let corner = |along: f64, back: f64| Coord {
        x: mid.x + px * along - ux * back,
        y: mid.y + py * along - uy * back,
    };
    Some(Polygon::new(
        vec![
            corner(extent, 0.0),
            corner(-extent, 0.0),
            corner(-extent, extent),
            corner(extent, extent),
            corner(extent, 0.0),
        ]
        .into(),
        vec![],
    ))
}
