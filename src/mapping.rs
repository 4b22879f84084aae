use crate::error::StampError;
use crate::types::{DocRect, Point, Size};

/// Axis-aligned mapping between the preview canvas (pixels, origin
/// top-left) and a page (points, origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMapping {
    page_size: Size,
    canvas_size: Size,
    scale_x: f64,
    scale_y: f64,
}

impl ViewportMapping {
    pub fn new(page_size: Size, canvas_size: Size) -> Result<Self, StampError> {
        if canvas_size.is_empty() {
            return Err(StampError::Raster(format!(
                "canvas {}x{} cannot be mapped",
                canvas_size.width, canvas_size.height
            )));
        }
        if page_size.is_empty() {
            return Err(StampError::Pdf(format!(
                "page {}x{} cannot be mapped",
                page_size.width, page_size.height
            )));
        }
        Ok(Self {
            page_size,
            canvas_size,
            scale_x: page_size.width as f64 / canvas_size.width as f64,
            scale_y: page_size.height as f64 / canvas_size.height as f64,
        })
    }

    pub fn page_size(&self) -> Size {
        self.page_size
    }

    pub fn canvas_size(&self) -> Size {
        self.canvas_size
    }

    pub fn scale_x(&self) -> f64 {
        self.scale_x
    }

    pub fn scale_y(&self) -> f64 {
        self.scale_y
    }

    /// Canvas rectangle (top-left at `pos`) to a document rectangle whose
    /// origin is its bottom-left corner.
    pub fn to_document(&self, pos: Point, size: Size) -> DocRect {
        let width = size.width as f64 * self.scale_x;
        let height = size.height as f64 * self.scale_y;
        DocRect {
            x: pos.x * self.scale_x,
            y: self.page_size.height as f64 - pos.y * self.scale_y - height,
            width,
            height,
        }
    }

    pub fn to_canvas(&self, rect: DocRect) -> (Point, Size) {
        let width = rect.width / self.scale_x;
        let height = rect.height / self.scale_y;
        let x = rect.x / self.scale_x;
        let y = (self.page_size.height as f64 - rect.y - rect.height) / self.scale_y;
        (Point::new(x, y), Size::new(width as f32, height as f32))
    }

    /// Backing-store ratio for the export stamp: at least 2, and enough to
    /// cover one document point with one device pixel.
    pub fn export_pixel_ratio(&self, device_density: f32) -> f32 {
        let density = if device_density.is_finite() {
            device_density.max(1.0) as f64
        } else {
            1.0
        };
        let needed = (self.scale_x.max(self.scale_y) * density).ceil();
        needed.max(2.0) as f32
    }
}
