mod common;

use common::*;
use geo::{Area, BooleanOps, Centroid};
use image::ImageReader;
use starseg::models::PROBABILITY_MEASUREMENT;
use starseg::{
    BackendError, CancelFlag, DetectionError, DetectionOptions, FinalObject, NamedTensor, NucleusDetector, ObjectKind,
    PredictionBackend,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const THREE_DISKS: [Disk; 3] = [disk(126, 64, 14), disk(50, 40, 10), disk(200, 90, 10)];

fn centroids(objects: &[FinalObject]) -> Vec<(f64, f64)> {
    let mut points: Vec<(f64, f64)> = objects
        .iter()
        .filter_map(|o| o.centroid())
        .map(|c| (c.x(), c.y()))
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    points
}

#[test]
fn test_detects_single_disk() -> anyhow::Result<()> {
    let source = disk_source(128, 128, &[disk(64, 64, 12)]);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), DetectionOptions::new())?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 1);

    let object = &objects[0];
    let centroid = object.centroid().ok_or_else(|| anyhow::anyhow!("no centroid"))?;
    assert!((centroid.x() - 64.0).abs() < 1.5);
    assert!((centroid.y() - 64.0).abs() < 1.5);

    let expected = std::f64::consts::PI * 12.0 * 12.0;
    let area = object.nucleus_area();
    assert!(area > 0.7 * expected && area < 1.3 * expected, "area {area}");
    assert!(object.cell().is_none());
    assert_eq!(object.kind(), ObjectKind::Detection);
    assert_eq!(object.classification(), -1);
    assert!(object.nucleus_circularity() > 0.8);
    Ok(())
}

#[test]
fn test_probabilities_meet_threshold() -> anyhow::Result<()> {
    let source = disk_source(256, 128, &THREE_DISKS);
    let options = DetectionOptions::new().with_threshold(0.6).with_include_probability(true);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), options)?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 3);
    for object in &objects {
        assert!(object.probability() >= 0.6);
        assert_eq!(object.measurement(PROBABILITY_MEASUREMENT), Some(object.probability()));
    }
    Ok(())
}

#[test]
fn test_tiled_detection_matches_single_tile() -> anyhow::Result<()> {
    let source = disk_source(256, 128, &THREE_DISKS);

    let whole = NucleusDetector::new(DiskOracleBackend::new(32), DetectionOptions::new().with_tile_size(512, 512))?;
    let whole_objects = whole.detect(&source, None, None)?;

    // Cores are 128 wide, so the first disk straddles the seam at x = 128
    let backend = DiskOracleBackend::new(32);
    let tiled_options = DetectionOptions::new()
        .with_tile_size(192, 192)
        .with_padding(32)
        .with_threads(2);
    let tiled = NucleusDetector::new(backend, tiled_options)?;
    let tiled_objects = tiled.detect(&source, None, None)?;

    assert_eq!(whole_objects.len(), 3);
    assert_eq!(tiled_objects.len(), 3);
    for (a, b) in centroids(&whole_objects).iter().zip(centroids(&tiled_objects)) {
        assert!((a.0 - b.0).abs() < 0.5 && (a.1 - b.1).abs() < 0.5, "{a:?} vs {b:?}");
    }
    Ok(())
}

#[test]
fn test_region_restricts_detection() -> anyhow::Result<()> {
    let source = disk_source(256, 128, &THREE_DISKS);
    let detector = NucleusDetector::new(DiskOracleBackend::new(16), DetectionOptions::new().with_tile_size(192, 192))?;

    // Only the disk at (50, 40) has its centre inside the region
    let objects = detector.detect(&source, Some(&rect(0.0, 0.0, 100.0, 128.0)), None)?;
    assert_eq!(objects.len(), 1);

    // An explicit mask overrides the region
    let objects = detector.detect(&source, None, Some(&rect(150.0, 0.0, 106.0, 128.0)))?;
    assert_eq!(objects.len(), 1);
    assert!(objects[0].centroid().is_some_and(|c| (c.x() - 200.0).abs() < 1.5));
    Ok(())
}

#[test]
fn test_region_limits_and_clips_objects() -> anyhow::Result<()> {
    let source = disk_source(256, 128, &THREE_DISKS);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), DetectionOptions::new())?;

    let region = rect(0.0, 0.0, 128.0, 128.0);
    let objects = detector.detect(&source, Some(&region), None)?;
    assert_eq!(objects.len(), 2);
    for object in &objects {
        let (_, _, max_x, _) = object.bounds().ok_or_else(|| anyhow::anyhow!("no bounds"))?;
        assert!(max_x <= 128.0 + 1e-6, "max_x {max_x}");
    }

    let unclipped = NucleusDetector::new(
        DiskOracleBackend::new(32),
        DetectionOptions::new().with_constrain_to_parent(false),
    )?;
    let objects = unclipped.detect(&source, Some(&region), None)?;
    assert_eq!(objects.len(), 2);
    assert!(objects.iter().any(|o| o.bounds().is_some_and(|b| b.2 > 130.0)));
    Ok(())
}

#[test]
fn test_cells_contain_nuclei_and_do_not_overlap() -> anyhow::Result<()> {
    let distance = 10.0;
    let source = disk_source(160, 128, &[disk(40, 64, 12), disk(70, 64, 12), disk(120, 30, 12)]);
    let options = DetectionOptions::new().with_cell_expansion(distance);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), options)?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 3);

    let bound = std::f64::consts::PI * (13.5 + distance) * (13.5 + distance);
    for object in &objects {
        let cell = object.cell().ok_or_else(|| anyhow::anyhow!("missing cell"))?;
        let nucleus = object.nucleus();
        let inside = nucleus.intersection(cell).unsigned_area();
        assert!(inside >= 0.99 * nucleus.unsigned_area());
        assert!(cell.unsigned_area() <= bound);
        assert!(cell.unsigned_area() > nucleus.unsigned_area());
    }
    for (i, a) in objects.iter().enumerate() {
        for b in &objects[i + 1..] {
            assert!(a.boundary().intersection(b.boundary()).unsigned_area() < 0.5);
        }
    }
    Ok(())
}

#[test]
fn test_cell_overlaps_can_be_ignored() -> anyhow::Result<()> {
    let source = disk_source(128, 128, &[disk(40, 64, 12), disk(70, 64, 12)]);
    let options = DetectionOptions::new()
        .with_cell_expansion(10.0)
        .with_ignore_cell_overlaps(true);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), options)?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 2);
    assert!(objects[0].boundary().intersection(objects[1].boundary()).unsigned_area() > 10.0);
    Ok(())
}

#[test]
fn test_detects_at_lower_resolution() -> anyhow::Result<()> {
    let source = disk_source(256, 256, &[disk(128, 128, 20)]);
    let options = DetectionOptions::new().with_pixel_size(2.0);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), options)?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 1);
    let centroid = objects[0].centroid().ok_or_else(|| anyhow::anyhow!("no centroid"))?;
    assert!((centroid.x() - 128.0).abs() < 2.5);
    assert!((centroid.y() - 128.0).abs() < 2.5);
    let expected = std::f64::consts::PI * 20.0 * 20.0;
    let area = objects[0].nucleus_area();
    assert!(area > 0.7 * expected && area < 1.3 * expected, "area {area}");
    Ok(())
}

#[test]
fn test_classifications_become_labels() -> anyhow::Result<()> {
    let source = disk_source(128, 128, &[disk(64, 64, 12)]);
    let options = DetectionOptions::new()
        .with_classification(0, "Background")
        .with_classification(1, "Tumor")
        .with_create_annotations(true);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32).with_classes(), options)?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].classification(), 1);
    assert_eq!(objects[0].label(), Some("Tumor"));
    assert_eq!(objects[0].kind(), ObjectKind::Annotation);

    let labelled = NucleusDetector::new(DiskOracleBackend::new(32), DetectionOptions::new().with_classify("Nucleus"))?;
    let objects = labelled.detect(&source, None, None)?;
    assert_eq!(objects[0].label(), Some("Nucleus"));
    Ok(())
}

#[test]
fn test_shape_and_intensity_measurements() -> anyhow::Result<()> {
    let source = disk_source(128, 128, &[disk(64, 64, 12)]).with_pixel_size(0.5);
    let options = DetectionOptions::new()
        .with_cell_expansion(4.0)
        .with_measure_shape(true)
        .with_measure_intensity(true);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), options)?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 1);
    let object = &objects[0];

    let area = object.measurement("Nucleus: Area").ok_or_else(|| anyhow::anyhow!("missing area"))?;
    assert!((area - object.nucleus_area() * 0.25).abs() < 1e-9);
    assert!(object.measurement("Cell: Area").is_some_and(|cell| cell > area));
    assert!(object.measurement("Nucleus: Circularity").is_some_and(|c| c > 0.8 && c <= 1.0));

    let nucleus_mean = object
        .measurement("Nucleus: Channel 1 mean")
        .ok_or_else(|| anyhow::anyhow!("missing intensity"))?;
    let cell_mean = object
        .measurement("Cell: Channel 1 mean")
        .ok_or_else(|| anyhow::anyhow!("missing intensity"))?;
    assert!(nucleus_mean > 150.0);
    assert!(cell_mean < nucleus_mean);
    assert_eq!(object.measurement("Nucleus: Channel 1 max"), Some(255.0));
    Ok(())
}

#[test]
fn test_cancelled_detection_returns_nothing() -> anyhow::Result<()> {
    let source = disk_source(256, 128, &THREE_DISKS);
    let detector = NucleusDetector::new(DiskOracleBackend::new(16), DetectionOptions::new())?;

    let cancel = detector.cancel_flag();
    cancel.cancel();
    assert!(detector.detect(&source, None, None)?.is_empty());

    cancel.reset();
    assert_eq!(detector.detect(&source, None, None)?.len(), 3);
    Ok(())
}

/// Disk oracle that raises the cancel flag while predicting its first tile
struct CancelOnFirstTile {
    inner: DiskOracleBackend,
    cancel: CancelFlag,
    calls: Arc<AtomicUsize>,
}

impl PredictionBackend for CancelOnFirstTile {
    fn predict(&self, inputs: Vec<NamedTensor>) -> Result<Vec<NamedTensor>, BackendError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.cancel.cancel();
        }
        self.inner.predict(inputs)
    }

    fn is_thread_safe(&self) -> bool {
        true
    }
}

#[test]
fn test_cancelling_mid_run_returns_nothing() -> anyhow::Result<()> {
    let source = disk_source(256, 128, &THREE_DISKS);
    let cancel = CancelFlag::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = CancelOnFirstTile {
        inner: DiskOracleBackend::new(16),
        cancel: cancel.clone(),
        calls: Arc::clone(&calls),
    };
    let options = DetectionOptions::new()
        .with_tile_size(64, 64)
        .with_padding(16)
        .with_threads(1);
    let detector = NucleusDetector::new(backend, options)?.with_cancel_flag(cancel.clone());

    let objects = detector.detect(&source, None, None)?;
    assert!(objects.is_empty());
    assert!(cancel.is_cancelled());
    // Tiles scheduled after the cancellation never reach the backend
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cancel.reset();
    assert_eq!(detector.detect(&source, None, None)?.len(), 3);
    assert!(calls.load(Ordering::SeqCst) > 1);
    Ok(())
}

#[test]
fn test_intensity_measured_at_detection_resolution() -> anyhow::Result<()> {
    let source = disk_source(256, 256, &[disk(128, 128, 20)]);
    let options = DetectionOptions::new().with_pixel_size(2.0).with_measure_intensity(true);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), options)?;

    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 1);
    let mean = objects[0]
        .measurement("Nucleus: Channel 1 mean")
        .ok_or_else(|| anyhow::anyhow!("missing intensity"))?;
    let max = objects[0]
        .measurement("Nucleus: Channel 1 max")
        .ok_or_else(|| anyhow::anyhow!("missing intensity"))?;
    // Downsampled reads keep the 8-bit range
    assert!(mean > 150.0, "mean {mean}");
    assert!(max > 200.0 && max <= 255.0 + 1e-3, "max {max}");
    Ok(())
}

#[test]
fn test_mismatched_class_raster_skips_tile() -> anyhow::Result<()> {
    let source = disk_source(64, 64, &[disk(32, 32, 8)]);
    let backend = FnBackend::new(|input| {
        let shape = input.shape();
        let (rows, cols) = (shape[0], shape[1]);
        Ok(vec![
            ("prob".to_string(), ndarray::ArrayD::from_elem(ndarray::IxDyn(&[rows, cols, 1]), 0.9)),
            ("dist".to_string(), ndarray::ArrayD::from_elem(ndarray::IxDyn(&[rows, cols, 8]), 3.0)),
            ("class".to_string(), ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 1, 2]))),
        ])
    });
    let options = DetectionOptions::new()
        .with_classification(0, "Background")
        .with_classification(1, "Tumor");
    let detector = NucleusDetector::new(backend, options)?;
    assert!(detector.detect(&source, None, None)?.is_empty());
    Ok(())
}

#[test]
fn test_detect_after_close_fails() -> anyhow::Result<()> {
    let source = disk_source(64, 64, &[disk(32, 32, 8)]);
    let mut detector = NucleusDetector::new(DiskOracleBackend::new(16), DetectionOptions::new())?;
    assert!(!detector.is_closed());

    detector.close()?;
    assert!(detector.is_closed());
    assert!(matches!(detector.detect(&source, None, None), Err(DetectionError::Closed)));
    detector.close()?;
    Ok(())
}

#[test]
fn test_failed_tiles_are_skipped() -> anyhow::Result<()> {
    let source = disk_source(64, 64, &[disk(32, 32, 8)]);
    let detector = NucleusDetector::new(FailingBackend, DetectionOptions::new())?;
    assert!(detector.detect(&source, None, None)?.is_empty());
    Ok(())
}

#[test]
fn test_invalid_options_are_rejected() -> anyhow::Result<()> {
    let options = DetectionOptions::new().with_tile_size(64, 64).with_padding(32);
    let result = NucleusDetector::new(DiskOracleBackend::new(16), options);
    assert!(matches!(result, Err(DetectionError::InvalidOptions(_))));

    let result = NucleusDetector::new(DiskOracleBackend::new(16), DetectionOptions::new().with_threads(0));
    assert!(matches!(result, Err(DetectionError::InvalidOptions(_))));
    Ok(())
}

#[test]
fn test_detects_from_image_file() -> anyhow::Result<()> {
    let file = create_test_image(96, 96, &[disk(30, 30, 9), disk(66, 60, 11)]);
    let img = ImageReader::open(file.path())?.decode()?;
    let source = starseg::ImageBufferSource::from_image(&img);

    let detector = NucleusDetector::new(DiskOracleBackend::new(32), DetectionOptions::new())?;
    let objects = detector.detect(&source, None, None)?;
    assert_eq!(objects.len(), 2);

    let json = serde_json::to_value(&objects)?;
    assert_eq!(json.as_array().map(Vec::len), Some(2));
    assert!(json[0]["nucleus"].is_object());
    Ok(())
}

#[test]
fn test_nucleus_centroid_is_inside_disk() -> anyhow::Result<()> {
    let source = disk_source(128, 128, &[disk(64, 64, 12)]);
    let detector = NucleusDetector::new(DiskOracleBackend::new(32), DetectionOptions::new().with_simplify(0.0))?;
    let objects = detector.detect(&source, None, None)?;
    let centroid = objects[0].nucleus().centroid().ok_or_else(|| anyhow::anyhow!("no centroid"))?;
    assert!((centroid.x() - 64.0).hypot(centroid.y() - 64.0) < 1.0);
    // 32 rays without simplification
    assert_eq!(objects[0].nucleus().exterior().0.len(), 33);
    Ok(())
}
