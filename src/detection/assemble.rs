use geo::{Centroid, Contains, MultiPolygon};
use std::collections::BTreeMap;
use tracing::warn;

use super::cells::{clip, estimate_cell_boundary};
use crate::config::DetectionOptions;
use crate::error::GeometryError;
use crate::geometry;
use crate::models::{FinalObject, ObjectKind, PROBABILITY_MEASUREMENT, PotentialNucleus};

/// Settings for turning surviving nuclei into final objects
#[derive(Debug, Clone)]
pub struct AssembleParams<'a> {
    pub simplify: f64,
    /// Cell expansion in full-resolution pixels; 0 disables cells
    pub expansion: f64,
    pub constrain_scale: Option<f64>,
    /// Parent mask that nuclei and cells are clipped to
    pub mask: Option<&'a MultiPolygon<f64>>,
    pub include_probability: bool,
    pub classify: Option<&'a str>,
    pub classifications: &'a BTreeMap<i32, String>,
    pub kind: ObjectKind,
}

impl<'a> AssembleParams<'a> {
    pub fn from_options(options: &'a DetectionOptions, expansion: f64, mask: Option<&'a MultiPolygon<f64>>) -> Self {
        Self {
            simplify: options.simplify,
            expansion,
            constrain_scale: options.cell_constrain_scale,
            mask: mask.filter(|_| options.constrain_to_parent),
            include_probability: options.include_probability,
            classify: options.classify.as_deref(),
            classifications: &options.classifications,
            kind: if options.create_annotations {
                ObjectKind::Annotation
            } else {
                ObjectKind::Detection
            },
        }
    }

    /// Label for a classification index, falling back to the global label
    pub fn label_for(&self, classification: i32) -> Option<String> {
        self.classifications
            .get(&classification)
            .map(String::as_str)
            .or(self.classify)
            .map(str::to_string)
    }
}

/// Convert a surviving nucleus into a final object.
///
/// Returns `Ok(None)` when clipping leaves nothing of the nucleus or its cell.
pub fn convert(nucleus: &PotentialNucleus, params: &AssembleParams) -> Result<Option<FinalObject>, GeometryError> {
    let mut geom_nucleus = geometry::simplify(&nucleus.geometry, params.simplify);
    let mut geom_cell = None;

    if params.expansion > 0.0 {
        let mut cell = estimate_cell_boundary(&geom_nucleus, params.expansion, params.constrain_scale)?;
        if let Some(mask) = params.mask {
            let Some(clipped) = clip(&cell, mask)? else {
                warn_empty("cell boundary", nucleus);
                return Ok(None);
            };
            cell = clipped;
        }
        cell = geometry::simplify(&cell, params.simplify);
        if !cell.contains(&geom_nucleus) {
            let Some(clipped) = clip(&geom_nucleus, &MultiPolygon::new(vec![cell.clone()]))? else {
                warn_empty("nucleus", nucleus);
                return Ok(None);
            };
            geom_nucleus = clipped;
        }
        geom_cell = Some(cell);
    } else if let Some(mask) = params.mask {
        match clip(&geom_nucleus, mask)? {
            Some(clipped) => geom_nucleus = clipped,
            None => return Ok(None),
        }
    }

    let mut measurements = BTreeMap::new();
    if params.include_probability {
        measurements.insert(PROBABILITY_MEASUREMENT.to_string(), nucleus.probability);
    }

    Ok(Some(FinalObject {
        nucleus: geom_nucleus,
        cell: geom_cell,
        classification: nucleus.classification,
        label: params.label_for(nucleus.classification),
        probability: nucleus.probability,
        kind: params.kind,
        measurements,
    }))
}

fn warn_empty(what: &str, nucleus: &PotentialNucleus) {
    match nucleus.geometry.centroid() {
        Some(c) => warn!("Empty {} at ({:.1}, {:.1}) will be skipped", what, c.x(), c.y()),
        None => warn!("Empty {} will be skipped", what),
    }
}
