use crate::error::StampError;
use tiny_skia::Pixmap;

/// Decoded stamp logo. Held behind an `Arc` and only ever read.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pixmap: Pixmap,
    format: Option<image::ImageFormat>,
}

impl BaseImage {
    pub fn decode(data: &[u8]) -> Result<Self, StampError> {
        let format = image::guess_format(data).ok();
        let decoded = match format {
            Some(fmt) => image::load_from_memory_with_format(data, fmt)?,
            None => image::load_from_memory(data)?,
        };
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        let pixmap = rgba_to_pixmap(rgba.as_raw(), width, height).ok_or_else(|| {
            StampError::Image(format!("unsupported image size {}x{}", width, height))
        })?;
        Ok(Self { pixmap, format })
    }

    pub fn from_pixmap(pixmap: Pixmap) -> Self {
        Self {
            pixmap,
            format: None,
        }
    }

    pub fn natural_width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn natural_height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Width over height; 1.0 for degenerate images.
    pub fn aspect_ratio(&self) -> f32 {
        let h = self.pixmap.height();
        if h == 0 {
            return 1.0;
        }
        let ratio = self.pixmap.width() as f32 / h as f32;
        if ratio.is_finite() && ratio > 0.0 { ratio } else { 1.0 }
    }

    pub fn format(&self) -> Option<image::ImageFormat> {
        self.format
    }

    pub(crate) fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }
}

/// Straight RGBA8 → premultiplied pixmap.
pub(crate) fn rgba_to_pixmap(src: &[u8], width: u32, height: u32) -> Option<Pixmap> {
    let mut pixmap = Pixmap::new(width, height)?;
    let dst = pixmap.data_mut();
    if src.len() < dst.len() {
        return None;
    }
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

pub(crate) fn unpremul_u8(channel: u8, alpha: u8) -> u8 {
    if alpha == 0 {
        return 0;
    }
    let value = (channel as u32 * 255 + alpha as u32 / 2) / alpha as u32;
    value.min(255) as u8
}
