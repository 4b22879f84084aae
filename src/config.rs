use crate::debug::DebugLogger;
use crate::error::StampError;
use crate::font::FontRegistry;
use crate::raster::{LopdfRasterizer, PageRasterizer};
use crate::session::{SessionParts, StampSession};
use crate::stamp::{Clock, DEFAULT_UTC_OFFSET_HOURS, SystemClock};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Preview bitmaps are rendered at this many device pixels per point.
pub const DEFAULT_RENDER_SCALE: f32 = 1.5;

pub struct StampSessionBuilder {
    render_scale: f32,
    device_pixel_density: f32,
    utc_offset_hours: i32,
    clock: Option<Box<dyn Clock>>,
    rasterizer: Option<Box<dyn PageRasterizer>>,
    font_dirs: Vec<PathBuf>,
    font_files: Vec<PathBuf>,
    font_bytes: Vec<(Vec<u8>, Option<String>)>,
    system_fonts: bool,
    debug_path: Option<PathBuf>,
    debug_writer: Option<Box<dyn Write + Send>>,
}

impl Default for StampSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StampSessionBuilder {
    pub fn new() -> Self {
        Self {
            render_scale: DEFAULT_RENDER_SCALE,
            device_pixel_density: 1.0,
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
            clock: None,
            rasterizer: None,
            font_dirs: Vec::new(),
            font_files: Vec::new(),
            font_bytes: Vec::new(),
            system_fonts: true,
            debug_path: None,
            debug_writer: None,
        }
    }

    /// Fixed for the lifetime of the session.
    pub fn render_scale(mut self, scale: f32) -> Self {
        self.render_scale = scale;
        self
    }

    pub fn device_pixel_density(mut self, density: f32) -> Self {
        self.device_pixel_density = density;
        self
    }

    /// Offset used for the stamp date when no clock is supplied.
    pub fn utc_offset_hours(mut self, hours: i32) -> Self {
        self.utc_offset_hours = hours;
        self
    }

    pub fn clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the built-in lopdf rasterizer.
    pub fn rasterizer(mut self, rasterizer: Box<dyn PageRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn register_font_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_dirs.push(path.into());
        self
    }

    pub fn register_font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    pub fn register_font_bytes(mut self, data: Vec<u8>, alias: Option<&str>) -> Self {
        self.font_bytes.push((data, alias.map(str::to_string)));
        self
    }

    // Off keeps rendering independent of the host's installed fonts.
    pub fn system_fonts(mut self, enabled: bool) -> Self {
        self.system_fonts = enabled;
        self
    }

    /// JSONL diagnostics written to `path`.
    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    pub fn debug_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.debug_writer = Some(Box::new(writer));
        self
    }

    pub fn build(self) -> Result<StampSession, StampError> {
        if !self.render_scale.is_finite() || self.render_scale <= 0.0 {
            return Err(StampError::InvalidConfiguration(format!(
                "render_scale must be > 0, got {}",
                self.render_scale
            )));
        }
        if !self.device_pixel_density.is_finite() || self.device_pixel_density < 1.0 {
            return Err(StampError::InvalidConfiguration(format!(
                "device_pixel_density must be >= 1, got {}",
                self.device_pixel_density
            )));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(StampError::InvalidConfiguration(format!(
                "utc_offset_hours out of range: {}",
                self.utc_offset_hours
            )));
        }

        let mut registry = FontRegistry::new();
        registry.set_system_fallback(self.system_fonts);
        for dir in &self.font_dirs {
            registry.register_dir(dir);
        }
        for file in &self.font_files {
            registry.register_file(file);
        }
        for (data, alias) in self.font_bytes {
            registry.register_bytes(data, alias.as_deref())?;
        }
        let fonts = Arc::new(registry);

        let debug = match (self.debug_writer, self.debug_path) {
            (Some(writer), _) => Some(DebugLogger::from_boxed(writer)),
            (None, Some(path)) => Some(DebugLogger::new(path)?),
            (None, None) => None,
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Box::new(SystemClock::new(self.utc_offset_hours)));
        let rasterizer = self
            .rasterizer
            .unwrap_or_else(|| Box::new(LopdfRasterizer::new(fonts.clone())));

        Ok(StampSession::from_parts(SessionParts {
            render_scale: self.render_scale,
            device_pixel_density: self.device_pixel_density,
            fonts,
            clock,
            rasterizer,
            debug,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_scales_are_rejected() {
        let err = StampSessionBuilder::new()
            .render_scale(0.0)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StampError::InvalidConfiguration(_)));
        let err = StampSessionBuilder::new()
            .render_scale(f32::NAN)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StampError::InvalidConfiguration(_)));
        let err = StampSessionBuilder::new()
            .device_pixel_density(0.5)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StampError::InvalidConfiguration(_)));
        let err = StampSessionBuilder::new()
            .utc_offset_hours(20)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StampError::InvalidConfiguration(_)));
    }

    #[test]
    fn invalid_font_bytes_fail_the_build() {
        let err = StampSessionBuilder::new()
            .system_fonts(false)
            .register_font_bytes(vec![1, 2, 3], Some("Broken"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StampError::Font(_)));
    }

    #[test]
    fn defaults_build() {
        let session = StampSessionBuilder::new().system_fonts(false).build().unwrap();
        assert_eq!(session.render_scale(), DEFAULT_RENDER_SCALE);
        assert!(session.document().is_none());
    }
}
