use geo::{Polygon, Rect, coord};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::drawing::draw_filled_circle_mut;
use ndarray::Array3;
use starseg::{ImageBufferSource, PotentialNucleus};
use tempfile::NamedTempFile;

/// A disk drawn at (x, y) with the given radius
#[derive(Debug, Clone, Copy)]
pub struct Disk {
    pub x: i32,
    pub y: i32,
    pub radius: i32,
}

pub const fn disk(x: i32, y: i32, radius: i32) -> Disk {
    Disk { x, y, radius }
}

/// Black image with white disks
pub fn disk_image(width: u32, height: u32, disks: &[Disk]) -> GrayImage {
    let mut img = GrayImage::from_pixel(width, height, Luma([0u8]));
    for d in disks {
        draw_filled_circle_mut(&mut img, (d.x, d.y), d.radius, Luma([255u8]));
    }
    img
}

pub fn disk_source(width: u32, height: u32, disks: &[Disk]) -> ImageBufferSource {
    ImageBufferSource::from_image(&DynamicImage::ImageLuma8(disk_image(width, height, disks)))
}

/// Saves a disk image to a temporary PNG.
/// The file will be automatically cleaned up when dropped.
pub fn create_test_image(width: u32, height: u32, disks: &[Disk]) -> NamedTempFile {
    let file = tempfile::Builder::new()
        .suffix(".png")
        .tempfile()
        .expect("Failed to create temp image file");
    disk_image(width, height, disks)
        .save_with_format(file.path(), image::ImageFormat::Png)
        .expect("Failed to save test image");
    file
}

/// A (rows, cols, channels) tensor whose value at each pixel is `f(y, x, c)`
pub fn tensor(rows: usize, cols: usize, channels: usize, f: impl Fn(usize, usize, usize) -> f32) -> Array3<f32> {
    Array3::from_shape_fn((rows, cols, channels), |(y, x, c)| f(y, x, c))
}

pub fn rect(x: f64, y: f64, width: f64, height: f64) -> Polygon<f64> {
    Rect::new(coord! { x: x, y: y }, coord! { x: x + width, y: y + height }).to_polygon()
}

pub fn square(x: f64, y: f64, size: f64) -> Polygon<f64> {
    rect(x, y, size, size)
}

pub fn candidate(geometry: Polygon<f64>, probability: f64) -> PotentialNucleus {
    PotentialNucleus::new(geometry, probability, -1)
}

/// Regular polygon approximating a circle
pub fn circle(cx: f64, cy: f64, radius: f64, n: usize) -> Polygon<f64> {
    let coords: Vec<_> = (0..n)
        .map(|i| {
            let theta = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            coord! { x: cx + radius * theta.cos(), y: cy + radius * theta.sin() }
        })
        .collect();
    Polygon::new(coords.into(), vec![])
}
