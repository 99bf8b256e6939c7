//! Polygon non-maximum suppression.
//!
//! Candidates are visited from most to least probable. Each visited candidate
//! is accepted and trims every lower-probability candidate it overlaps; a
//! trimmed candidate survives only while it stays in one piece and keeps more
//! than half of the area it was created with.

use geo::{Area, BooleanOps, Intersects, Polygon, PreparedGeometry, Rect, Relate};
use rstar::{AABB, RTree, RTreeObject};
use tracing::{debug, warn};

use crate::error::GeometryError;
use crate::geometry::{self, attempt};
use crate::models::PotentialNucleus;

/// Overlap lists longer than this are tested against a prepared geometry
pub const PREPARE_THRESHOLD: usize = 5;

/// Differences removing less than this fraction of a candidate leave it untouched
const AREA_TOLERANCE: f64 = 1e-6;

/// Arena slot in an R-tree of envelopes
#[derive(Debug, Clone)]
struct IndexedEnvelope {
    slot: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

pub(crate) fn to_aabb(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// R-tree over arena slots, keyed by the envelope each slot had when built
pub(crate) struct EnvelopeIndex {
    tree: RTree<IndexedEnvelope>,
}

impl EnvelopeIndex {
    pub(crate) fn build<'a>(geometries: impl Iterator<Item = &'a Polygon<f64>>) -> Self {
        let items = geometries
            .enumerate()
            .filter_map(|(slot, geom)| {
                geometry::envelope(geom).map(|rect| IndexedEnvelope {
                    slot,
                    envelope: to_aabb(&rect),
                })
            })
            .collect();
        Self {
            tree: RTree::bulk_load(items),
        }
    }

    /// Slots whose indexed envelope intersects `rect`, in ascending order
    pub(crate) fn query(&self, rect: &Rect<f64>) -> Vec<usize> {
        let mut slots: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&to_aabb(rect))
            .map(|item| item.slot)
            .collect();
        slots.sort_unstable();
        slots
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Accepted,
    Skipped,
}

enum Trim {
    Unchanged,
    Replaced(Polygon<f64>),
    Skip,
}

/// Statistics from one resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub accepted: usize,
    pub trimmed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Resolve overlaps, returning survivors in descending order of probability
pub fn resolve_overlaps(nuclei: Vec<PotentialNucleus>) -> Vec<PotentialNucleus> {
    resolve_overlaps_with_stats(nuclei).0
}

pub fn resolve_overlaps_with_stats(mut nuclei: Vec<PotentialNucleus>) -> (Vec<PotentialNucleus>, ResolveStats) {
    // Stable, so equal probabilities keep their input order
    nuclei.sort_by(|a, b| b.probability.total_cmp(&a.probability));

    let original_areas: Vec<f64> = nuclei.iter().map(PotentialNucleus::original_area).collect();
    let index = EnvelopeIndex::build(nuclei.iter().map(|n| &n.geometry));
    let mut status = vec![Status::Pending; nuclei.len()];
    let mut order = Vec::new();
    let mut stats = ResolveStats::default();

    for slot in 0..nuclei.len() {
        if status[slot] == Status::Skipped {
            continue;
        }
        status[slot] = Status::Accepted;
        order.push(slot);

        let accepted = nuclei[slot].geometry.clone();
        let Some(envelope) = geometry::envelope(&accepted) else {
            continue;
        };

        let overlaps: Vec<usize> = index
            .query(&envelope)
            .into_iter()
            .filter(|&other| other != slot && status[other] == Status::Pending)
            .filter(|&other| {
                geometry::envelope(&nuclei[other].geometry).is_some_and(|env| env.intersects(&envelope))
            })
            .collect();
        if overlaps.is_empty() {
            continue;
        }

        let prepared = (overlaps.len() > PREPARE_THRESHOLD).then(|| PreparedGeometry::from(&accepted));
        let intersects = |candidate: &Polygon<f64>| -> Result<bool, GeometryError> {
            attempt("intersects", || match &prepared {
                Some(prepared) => prepared.relate(candidate).is_intersects(),
                None => accepted.intersects(candidate),
            })
        };

        for other in overlaps {
            let outcome = intersects(&nuclei[other].geometry).and_then(|hit| {
                if hit {
                    trim(&nuclei[other].geometry, &accepted, original_areas[other])
                } else {
                    Ok(Trim::Unchanged)
                }
            });
            match outcome {
                Ok(Trim::Unchanged) => {}
                Ok(Trim::Replaced(trimmed)) => {
                    nuclei[other].geometry = trimmed;
                    stats.trimmed += 1;
                }
                Ok(Trim::Skip) => status[other] = Status::Skipped,
                Err(e) => {
                    debug!("Skipping nucleus after geometry error: {}", e);
                    status[other] = Status::Skipped;
                    stats.errors += 1;
                }
            }
        }
    }

    stats.accepted = order.len();
    stats.skipped = status.iter().filter(|&&s| s == Status::Skipped).count();
    if stats.errors > 0 {
        let what = if stats.errors == 1 {
            "1 nucleus".to_string()
        } else {
            format!("{} nuclei", stats.errors)
        };
        warn!(
            "Skipped {} due to error in resolving overlaps ({:.1}% of all skipped)",
            what,
            stats.errors as f64 * 100.0 / stats.skipped.max(1) as f64
        );
    }

    let mut slots: Vec<Option<PotentialNucleus>> = nuclei.into_iter().map(Some).collect();
    let resolved = order.into_iter().filter_map(|slot| slots[slot].take()).collect();
    (resolved, stats)
}

/// Subtract an accepted geometry from an overlapping candidate
fn trim(candidate: &Polygon<f64>, accepted: &Polygon<f64>, original_area: f64) -> Result<Trim, GeometryError> {
    let difference = attempt("difference", || candidate.difference(accepted))?;
    let current = candidate.unsigned_area();
    let removed = current - difference.unsigned_area();
    if removed <= AREA_TOLERANCE * current {
        return Ok(Trim::Unchanged);
    }
    match geometry::single_polygon(difference) {
        Some(remaining) if remaining.unsigned_area() > original_area / 2.0 => Ok(Trim::Replaced(remaining)),
        _ => Ok(Trim::Skip),
    }
}
