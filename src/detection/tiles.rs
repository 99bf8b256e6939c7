use geo::{BoundingRect, Intersects, Polygon};

use crate::image_source::RegionRequest;

/// One unit of tile work.
///
/// `core` is the area this tile is responsible for; cores never overlap.
/// `padded` is the region actually read, grown around the core and clipped to
/// the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tile {
    pub core: RegionRequest,
    pub padded: RegionRequest,
}

/// Computes the tiles covering a target region
#[derive(Debug, Clone, Copy)]
pub struct TileScheduler {
    pub image_width: i64,
    pub image_height: i64,
    /// Requested tile size at the detection resolution, padding included
    pub tile_width: usize,
    pub tile_height: usize,
    /// Padding at the detection resolution
    pub padding: usize,
    pub downsample: f64,
}

impl TileScheduler {
    /// Core tile size in full-resolution pixels
    pub fn core_size(&self) -> (i64, i64) {
        let core = |size: usize| {
            let pixels = size.saturating_sub(2 * self.padding) as f64 * self.downsample;
            (pixels.round() as i64).max(1)
        };
        (core(self.tile_width), core(self.tile_height))
    }

    /// Bounding box of `region` clipped to the image, or the whole image
    pub fn target(&self, region: Option<&Polygon<f64>>) -> RegionRequest {
        let (x, y, max_x, max_y) = match region.and_then(|r| r.bounding_rect()) {
            Some(rect) => (
                (rect.min().x.floor() as i64).max(0),
                (rect.min().y.floor() as i64).max(0),
                (rect.max().x.ceil() as i64).min(self.image_width),
                (rect.max().y.ceil() as i64).min(self.image_height),
            ),
            None if region.is_some() => (0, 0, 0, 0),
            None => (0, 0, self.image_width, self.image_height),
        };
        RegionRequest::new(x, y, (max_x - x).max(0), (max_y - y).max(0), self.downsample)
    }

    /// Tile `target` with non-overlapping cores, keeping those that touch `mask`
    pub fn schedule(&self, target: &RegionRequest, mask: Option<&Polygon<f64>>) -> Vec<Tile> {
        if target.is_empty() {
            return Vec::new();
        }
        let (core_w, core_h) = self.core_size();
        let mut tiles = Vec::new();
        let mut y = target.y;
        while y < target.max_y() {
            let h = core_h.min(target.max_y() - y);
            let mut x = target.x;
            while x < target.max_x() {
                let w = core_w.min(target.max_x() - x);
                let core = RegionRequest::new(x, y, w, h, self.downsample);
                if mask.is_none_or(|m| m.intersects(&core.to_rect())) {
                    tiles.push(Tile {
                        core,
                        padded: self.pad(&core),
                    });
                }
                x += core_w;
            }
            y += core_h;
        }
        tiles
    }

    /// Grow a core region by the padding on every side, clamped to the image
    pub fn pad(&self, core: &RegionRequest) -> RegionRequest {
        let pad = self.downsample * self.padding as f64;
        let x1 = ((core.x as f64 - pad).round() as i64).max(0);
        let y1 = ((core.y as f64 - pad).round() as i64).max(0);
        let x2 = ((core.max_x() as f64 + pad).round() as i64).min(self.image_width);
        let y2 = ((core.max_y() as f64 + pad).round() as i64).min(self.image_height);
        RegionRequest::new(x1, y1, x2 - x1, y2 - y1, self.downsample)
    }
}
