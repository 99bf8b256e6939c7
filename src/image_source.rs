use geo::{Polygon, Rect, coord};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma, Pixel};
use ndarray::{Array3, s};

use crate::error::{DetectionError, Result};

/// A rectangle in full-resolution image pixels, read at a downsample.
///
/// The raster returned for a request has `round(width / downsample)` columns
/// and `round(height / downsample)` rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionRequest {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub downsample: f64,
}

impl RegionRequest {
    pub fn new(x: i64, y: i64, width: i64, height: i64, downsample: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            downsample,
        }
    }

    pub fn max_x(&self) -> i64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> i64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Raster size (columns, rows) produced when this request is read
    pub fn output_size(&self) -> (usize, usize) {
        let w = (self.width as f64 / self.downsample).round().max(1.0) as usize;
        let h = (self.height as f64 / self.downsample).round().max(1.0) as usize;
        (w, h)
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.x as f64, y: self.y as f64 },
            coord! { x: self.max_x() as f64, y: self.max_y() as f64 },
        )
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        self.to_rect().to_polygon()
    }
}

/// Random-access source of pixels for detection
pub trait ImageSource: Send + Sync {
    /// Full-resolution width in pixels
    fn width(&self) -> i64;

    /// Full-resolution height in pixels
    fn height(&self) -> i64;

    fn n_channels(&self) -> usize;

    /// Calibrated size of one full-resolution pixel
    fn pixel_size(&self) -> f64 {
        1.0
    }

    /// Read a region as a (rows, cols, channels) raster
    fn read_region(&self, request: &RegionRequest) -> Result<Array3<f32>>;
}

/// An in-memory image held as a float raster
#[derive(Debug, Clone)]
pub struct ImageBufferSource {
    pixels: Array3<f32>,
    pixel_size: f64,
}

impl ImageBufferSource {
    /// Wrap a decoded image, keeping the stored sample values and dropping alpha
    pub fn from_image(image: &DynamicImage) -> Self {
        let pixels = match image {
            DynamicImage::ImageLuma8(buf) => buffer_to_array(buf, 1),
            DynamicImage::ImageLumaA8(buf) => buffer_to_array(buf, 1),
            DynamicImage::ImageLuma16(buf) => buffer_to_array(buf, 1),
            DynamicImage::ImageLumaA16(buf) => buffer_to_array(buf, 1),
            DynamicImage::ImageRgb8(buf) => buffer_to_array(buf, 3),
            DynamicImage::ImageRgba8(buf) => buffer_to_array(buf, 3),
            DynamicImage::ImageRgb16(buf) => buffer_to_array(buf, 3),
            DynamicImage::ImageRgba16(buf) => buffer_to_array(buf, 3),
            DynamicImage::ImageRgb32F(buf) => buffer_to_array(buf, 3),
            DynamicImage::ImageRgba32F(buf) => buffer_to_array(buf, 3),
            other => buffer_to_array(&other.to_rgb32f(), 3),
        };
        Self {
            pixels,
            pixel_size: 1.0,
        }
    }

    /// Wrap a raster already laid out as (rows, cols, channels)
    pub fn from_array(pixels: Array3<f32>) -> Self {
        Self {
            pixels,
            pixel_size: 1.0,
        }
    }

    pub fn with_pixel_size(mut self, pixel_size: f64) -> Self {
        self.pixel_size = pixel_size;
        self
    }

    pub fn pixels(&self) -> &Array3<f32> {
        &self.pixels
    }
}

impl ImageSource for ImageBufferSource {
    fn width(&self) -> i64 {
        self.pixels.dim().1 as i64
    }

    fn height(&self) -> i64 {
        self.pixels.dim().0 as i64
    }

    fn n_channels(&self) -> usize {
        self.pixels.dim().2
    }

    fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    fn read_region(&self, request: &RegionRequest) -> Result<Array3<f32>> {
        let read_error = |reason: &str| DetectionError::Read {
            x: request.x,
            y: request.y,
            width: request.width,
            height: request.height,
            reason: reason.to_string(),
        };
        if request.is_empty() {
            return Err(read_error("empty region"));
        }
        if !request.downsample.is_finite() || request.downsample <= 0.0 {
            return Err(read_error("downsample must be positive"));
        }
        if request.x < 0
            || request.y < 0
            || request.max_x() > self.width()
            || request.max_y() > self.height()
        {
            return Err(read_error("region extends beyond the image"));
        }

        let crop = self.pixels.slice(s![
            request.y as usize..request.max_y() as usize,
            request.x as usize..request.max_x() as usize,
            ..
        ]);
        let (out_w, out_h) = request.output_size();
        if out_w == request.width as usize && out_h == request.height as usize {
            return Ok(crop.to_owned());
        }

        // Resample each channel independently. `imageops::resize` clamps float
        // samples to [0, 1], so each plane is mapped into that range and back.
        let n_channels = self.n_channels();
        let mut output = Array3::<f32>::zeros((out_h, out_w, n_channels));
        for c in 0..n_channels {
            let plane = crop.slice(s![.., .., c]);
            let (min, max) = plane
                .iter()
                .filter(|v| v.is_finite())
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if min > max {
                output.slice_mut(s![.., .., c]).fill(f32::NAN);
                continue;
            }
            let range = (max - min) as f64;
            if range == 0.0 {
                output.slice_mut(s![.., .., c]).fill(min);
                continue;
            }
            let buffer: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_fn(
                request.width as u32,
                request.height as u32,
                |x, y| Luma([((plane[[y as usize, x as usize]] - min) as f64 / range) as f32]),
            );
            let resized = imageops::resize(&buffer, out_w as u32, out_h as u32, FilterType::Triangle);
            for (x, y, pixel) in resized.enumerate_pixels() {
                output[[y as usize, x as usize, c]] = (min as f64 + pixel[0] as f64 * range) as f32;
            }
        }
        Ok(output)
    }
}

fn buffer_to_array<P>(buffer: &ImageBuffer<P, Vec<P::Subpixel>>, channels: usize) -> Array3<f32>
where
    P: Pixel,
    P::Subpixel: Into<f32>,
{
    let (width, height) = buffer.dimensions();
    let mut array = Array3::<f32>::zeros((height as usize, width as usize, channels));
    for (x, y, pixel) in buffer.enumerate_pixels() {
        for (c, value) in pixel.channels().iter().take(channels).enumerate() {
            array[[y as usize, x as usize, c]] = (*value).into();
        }
    }
    array
}
