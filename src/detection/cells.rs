use geo::{
    Area, BooleanOps, BoundingRect, Centroid, Contains, Intersects, MultiPolygon, Polygon, PreparedGeometry,
    Rect, Relate, Scale,
};
use tracing::{debug, warn};

use super::overlaps::{EnvelopeIndex, PREPARE_THRESHOLD};
use crate::error::GeometryError;
use crate::geometry::{self, attempt};
use crate::models::FinalObject;

/// Approximate a cell by expanding its nucleus.
///
/// With `constrain_scale`, the cell is also limited to the nucleus scaled by
/// that factor about its centroid.
pub fn estimate_cell_boundary(
    nucleus: &Polygon<f64>,
    distance: f64,
    constrain_scale: Option<f64>,
) -> Result<Polygon<f64>, GeometryError> {
    let mut cell = geometry::buffer(nucleus, distance)?;
    if let Some(scale) = constrain_scale.filter(|s| s.is_finite() && *s > 1.0) {
        let centroid = nucleus.centroid().ok_or(GeometryError::Empty("centroid"))?;
        let limit = nucleus.scale_around_point(scale, scale, centroid);
        cell = attempt("intersection", || cell.intersection(&MultiPolygon::new(vec![limit])))?;
    }
    geometry::largest_polygon(cell).ok_or(GeometryError::Empty("cell boundary"))
}

/// Clip `polygon` to `mask`, keeping the largest part
pub fn clip(polygon: &Polygon<f64>, mask: &MultiPolygon<f64>) -> Result<Option<Polygon<f64>>, GeometryError> {
    let clipped = attempt("intersection", || MultiPolygon::new(vec![polygon.clone()]).intersection(mask))?;
    Ok(geometry::largest_polygon(clipped))
}

/// Make cells pairwise non-overlapping without touching any nucleus.
///
/// Where two cells overlap, each keeps only its own side of the perpendicular
/// bisector between the nucleus centroids, so contested space is split as in
/// a Voronoi tessellation. A cell always keeps its own nucleus and never
/// claims a neighbour's. Objects are visited in descending probability.
pub fn resolve_cell_overlaps(objects: &mut [FinalObject]) {
    let mut order: Vec<usize> = (0..objects.len()).filter(|&i| objects[i].cell.is_some()).collect();
    order.sort_by(|&a, &b| objects[b].probability.total_cmp(&objects[a].probability));

    let boundaries: Vec<&Polygon<f64>> = objects.iter().map(FinalObject::boundary).collect();
    let index = EnvelopeIndex::build(boundaries.iter().copied());
    let centroids: Vec<_> = objects.iter().map(|o| o.nucleus.centroid()).collect();

    let mut updates = Vec::new();
    let mut errors = 0;
    for &slot in &order {
        let Some(cell) = objects[slot].cell.as_ref() else {
            continue;
        };
        let Some(envelope) = cell.bounding_rect() else {
            continue;
        };
        let candidates: Vec<usize> = index
            .query(&envelope)
            .into_iter()
            .filter(|&other| other != slot)
            .collect();
        if candidates.is_empty() {
            continue;
        }

        let prepared = (candidates.len() > PREPARE_THRESHOLD).then(|| PreparedGeometry::from(cell));
        let neighbours: Vec<usize> = candidates
            .into_iter()
            .filter(|&other| {
                let boundary = boundaries[other];
                attempt("intersects", || match &prepared {
                    Some(prepared) => prepared.relate(boundary).is_intersects(),
                    None => cell.intersects(boundary),
                })
                .unwrap_or(true)
            })
            .collect();
        if neighbours.is_empty() {
            continue;
        }

        match split_cell(objects, &centroids, slot, &neighbours) {
            Ok(Some((cell, nucleus))) => updates.push((slot, cell, nucleus)),
            Ok(None) => {}
            Err(e) => {
                debug!("Keeping cell unchanged after geometry error: {}", e);
                errors += 1;
            }
        }
    }

    if errors > 0 {
        warn!("Could not resolve overlaps for {} cell(s)", errors);
    }
    for (slot, cell, nucleus) in updates {
        objects[slot].cell = Some(cell);
        objects[slot].nucleus = nucleus;
    }
}

type CellUpdate = (Polygon<f64>, Polygon<f64>);

fn split_cell(
    objects: &[FinalObject],
    centroids: &[Option<geo::Point<f64>>],
    slot: usize,
    neighbours: &[usize],
) -> Result<Option<CellUpdate>, GeometryError> {
    let object = &objects[slot];
    let Some(cell) = object.cell.as_ref() else {
        return Ok(None);
    };
    let Some(origin) = centroids[slot] else {
        return Ok(None);
    };

    let mut region = MultiPolygon::new(vec![cell.clone()]);
    for &other in neighbours {
        let Some(towards) = centroids[other] else {
            continue;
        };
        let extent = combined_extent(cell, objects[other].boundary());
        if let Some(half) = geometry::bisector_half_plane(origin.0, towards.0, extent) {
            region = attempt("intersection", || region.intersection(&MultiPolygon::new(vec![half])))?;
        }
    }

    let own = MultiPolygon::new(vec![object.nucleus.clone()]);
    region = attempt("union", || region.union(&own))?;
    let others = MultiPolygon::new(neighbours.iter().map(|&o| objects[o].nucleus.clone()).collect());
    region = attempt("difference", || region.difference(&others))?;

    let Some(new_cell) = geometry::largest_polygon(region) else {
        return Ok(Some((object.nucleus.clone(), object.nucleus.clone())));
    };
    let nucleus = if new_cell.contains(&object.nucleus) {
        object.nucleus.clone()
    } else {
        clip(&object.nucleus, &MultiPolygon::new(vec![new_cell.clone()]))?
            .ok_or(GeometryError::Empty("nucleus"))?
    };
    if new_cell.unsigned_area() < nucleus.unsigned_area() {
        return Ok(Some((nucleus.clone(), nucleus)));
    }
    Ok(Some((new_cell, nucleus)))
}

/// Length covering both envelopes, used to size bisector half-planes
fn combined_extent(a: &Polygon<f64>, b: &Polygon<f64>) -> f64 {
    let union = match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) => Rect::new(
            geo::coord! { x: ra.min().x.min(rb.min().x), y: ra.min().y.min(rb.min().y) },
            geo::coord! { x: ra.max().x.max(rb.max().x), y: ra.max().y.max(rb.max().y) },
        ),
        _ => return 1.0,
    };
    2.0 * union.width().hypot(union.height()) + 1.0
}
