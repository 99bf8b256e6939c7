use geo::coordinate_position::{CoordPos, CoordinatePosition};
use geo::{BoundingRect, Centroid, Coord, LineString, MultiPolygon, Polygon};
use tracing::{trace, warn};

use super::inference::RawPrediction;
use crate::error::GeometryError;
use crate::geometry;
use crate::image_source::RegionRequest;
use crate::models::{PotentialNucleus, UNCLASSIFIED};

/// Smallest ray length used when building a polygon
pub const MIN_RAY_LENGTH: f64 = 1e-3;

/// Parameters mapping one tile's prediction back into image space
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams<'a> {
    pub threshold: f64,
    pub downsample: f64,
    /// Image x-coordinate of the top-left pixel of the network input
    pub origin_x: f64,
    /// Image y-coordinate of the top-left pixel of the network input
    pub origin_y: f64,
    /// Candidates whose centroid lies outside this are dropped
    pub mask: Option<&'a MultiPolygon<f64>>,
    pub keep_classified_background: bool,
    pub simplify: f64,
}

/// Unit direction of each of `n` equally spaced rays, starting along +x
pub fn ray_directions(n: usize) -> Vec<(f64, f64)> {
    (0..n)
        .map(|i| {
            let theta = 2.0 * std::f64::consts::PI / n as f64 * i as f64;
            (theta.cos(), theta.sin())
        })
        .collect()
}

/// Turn every pixel at or above the threshold into a star-convex candidate
pub fn decode(prediction: &RawPrediction, params: &DecodeParams) -> Vec<PotentialNucleus> {
    let (rows, cols) = prediction.probability.dim();
    let directions = ray_directions(prediction.rays.dim().2);
    let mut nuclei = Vec::new();

    for y in 0..rows {
        for x in 0..cols {
            let probability = prediction.probability[[y, x]] as f64;
            if !(probability >= params.threshold) {
                continue;
            }
            match decode_pixel(prediction, params, &directions, x, y, probability) {
                Ok(Some(nucleus)) => nuclei.push(nucleus),
                Ok(None) => {}
                Err(e) => warn!("Error creating nucleus at ({}, {}): {}", x, y, e),
            }
        }
    }
    nuclei
}

fn decode_pixel(
    prediction: &RawPrediction,
    params: &DecodeParams,
    directions: &[(f64, f64)],
    x: usize,
    y: usize,
    probability: f64,
) -> Result<Option<PotentialNucleus>, GeometryError> {
    let cx = x as f64 * prediction.scale_x;
    let cy = y as f64 * prediction.scale_y;

    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(directions.len() + 1);
    for (ray, &(cos, sin)) in directions.iter().enumerate() {
        let length = prediction.rays[[y, x, ray]] as f64;
        if !length.is_finite() {
            continue;
        }
        let length = length.max(MIN_RAY_LENGTH);
        let coord = Coord {
            x: params.origin_x + (cx + length * cos) * params.downsample,
            y: params.origin_y + (cy + length * sin) * params.downsample,
        };
        if coords.last() != Some(&coord) {
            coords.push(coord);
        }
    }
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return Ok(None);
    }

    // LineString -> Polygon closes the ring
    let polygon = Polygon::new(LineString::from(coords), vec![]);
    if !geometry::is_usable(&polygon) {
        trace!(x, y, "skipping degenerate polygon");
        return Ok(None);
    }

    if let Some(mask) = params.mask {
        let centroid = geometry::attempt("centroid", || polygon.centroid())?
            .ok_or(GeometryError::Empty("centroid"))?;
        if mask.coordinate_position(&centroid.0) == CoordPos::Outside {
            return Ok(None);
        }
    }

    let classification = match &prediction.classes {
        Some(classes) => argmax(classes.slice(ndarray::s![y, x, ..]).iter().copied()),
        None => UNCLASSIFIED,
    };
    if classification == 0 && !params.keep_classified_background {
        return Ok(None);
    }

    let geometry = geometry::simplify(&polygon, params.simplify);
    Ok(Some(PotentialNucleus::new(geometry, probability, classification)))
}

fn argmax(scores: impl Iterator<Item = f32>) -> i32 {
    let mut best = UNCLASSIFIED;
    let mut best_score = f32::NEG_INFINITY;
    for (i, score) in scores.enumerate() {
        if score > best_score {
            best = i as i32;
            best_score = score;
        }
    }
    best
}

/// Drop candidates that reach the right or bottom edge of a padded request.
///
/// Those predictions are truncated by the tile border; the neighbouring tile
/// produces them whole. Edges that coincide with the image border have no
/// neighbour and are left alone, so objects touching the right or bottom of
/// the image survive. StarDist's QuPath extension drops those too; this
/// deliberately does not.
pub fn exclude_on_bounds(
    nuclei: &mut Vec<PotentialNucleus>,
    padded: &RegionRequest,
    image_width: i64,
    image_height: i64,
) {
    let check_x = padded.max_x() < image_width;
    let check_y = padded.max_y() < image_height;
    if !check_x && !check_y {
        return;
    }
    let max_x = padded.max_x() as f64;
    let max_y = padded.max_y() as f64;
    nuclei.retain(|n| match n.geometry.bounding_rect() {
        Some(env) => !(check_x && env.max().x >= max_x) && !(check_y && env.max().y >= max_y),
        None => false,
    });
}
