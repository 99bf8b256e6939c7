use geo::{Area, BoundingRect, Polygon};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::warn;

use super::preprocessing::{channel_stats, mask_raster};
use crate::error::Result;
use crate::image_source::{ImageSource, RegionRequest};
use crate::models::{FinalObject, circularity, perimeter};

/// Adds measurements to finished objects
pub trait MeasurementProvider: Send + Sync {
    /// Human-readable name for this provider (used in log output)
    fn name(&self) -> &str;

    fn measure(&self, object: &FinalObject, source: &dyn ImageSource) -> Result<BTreeMap<String, f64>>;
}

/// Area, perimeter and circularity of the nucleus and cell, in calibrated units
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeMeasurements;

impl MeasurementProvider for ShapeMeasurements {
    fn name(&self) -> &str {
        "shape"
    }

    fn measure(&self, object: &FinalObject, source: &dyn ImageSource) -> Result<BTreeMap<String, f64>> {
        let pixel_size = source.pixel_size();
        let mut values = BTreeMap::new();
        let mut add_shape = |compartment: &str, polygon: &Polygon<f64>| {
            values.insert(format!("{compartment}: Area"), polygon.unsigned_area() * pixel_size * pixel_size);
            values.insert(format!("{compartment}: Perimeter"), perimeter(polygon) * pixel_size);
            values.insert(format!("{compartment}: Circularity"), circularity(polygon));
        };
        add_shape("Nucleus", object.nucleus());
        if let Some(cell) = object.cell() {
            add_shape("Cell", cell);
        }
        Ok(values)
    }
}

/// Per-channel intensity statistics inside the nucleus and cell
#[derive(Debug, Clone, Copy)]
pub struct IntensityMeasurements {
    /// Downsample at which pixels are read
    pub downsample: f64,
}

impl Default for IntensityMeasurements {
    fn default() -> Self {
        Self { downsample: 1.0 }
    }
}

impl MeasurementProvider for IntensityMeasurements {
    fn name(&self) -> &str {
        "intensity"
    }

    fn measure(&self, object: &FinalObject, source: &dyn ImageSource) -> Result<BTreeMap<String, f64>> {
        let Some(rect) = object.boundary().bounding_rect() else {
            return Ok(BTreeMap::new());
        };
        let x = (rect.min().x.floor() as i64).max(0);
        let y = (rect.min().y.floor() as i64).max(0);
        let max_x = (rect.max().x.ceil() as i64).min(source.width());
        let max_y = (rect.max().y.ceil() as i64).min(source.height());
        let request = RegionRequest::new(x, y, max_x - x, max_y - y, self.downsample.max(1.0));
        if request.is_empty() {
            return Ok(BTreeMap::new());
        }
        let pixels = source.read_region(&request)?;
        let (rows, cols, _) = pixels.dim();

        let mut values = BTreeMap::new();
        let mut compartments = vec![("Nucleus", object.nucleus())];
        if let Some(cell) = object.cell() {
            compartments.push(("Cell", cell));
        }
        for (compartment, polygon) in compartments {
            let mask = mask_raster(&request, rows, cols, polygon);
            for (c, stats) in channel_stats(pixels.view(), Some(&mask), true).iter().enumerate() {
                if stats.is_empty() {
                    continue;
                }
                let prefix = format!("{compartment}: Channel {}", c + 1);
                values.insert(format!("{prefix} mean"), stats.mean());
                values.insert(format!("{prefix} median"), stats.percentile(50.0));
                values.insert(format!("{prefix} min"), stats.percentile(0.0));
                values.insert(format!("{prefix} max"), stats.percentile(100.0));
                values.insert(format!("{prefix} std dev"), stats.std_dev());
            }
        }
        Ok(values)
    }
}

/// Run every provider over every object in parallel, merging the results.
/// A failing provider leaves that object's other measurements intact.
pub fn apply_measurements(
    objects: &mut [FinalObject],
    providers: &[&dyn MeasurementProvider],
    source: &dyn ImageSource,
) {
    if providers.is_empty() {
        return;
    }
    objects.par_iter_mut().for_each(|object| {
        for provider in providers {
            match provider.measure(object, source) {
                Ok(values) => object.measurements.extend(values),
                Err(e) => warn!("{} measurement failed: {}", provider.name(), e),
            }
        }
    });
}
