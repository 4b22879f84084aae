use crate::base_image::BaseImage;
use crate::error::StampError;
use crate::font::{FontFamily, FontRegistry};
use crate::text;
use crate::types::{Color, Size};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;
use tiny_skia::{FilterQuality, Pixmap, PixmapPaint, Transform};

pub const MIN_DISPLAY_WIDTH: f32 = 16.0;
pub const MAX_DISPLAY_WIDTH: f32 = 1600.0;
pub const MIN_FONT_SIZE: f32 = 6.0;
pub const MAX_FONT_SIZE: f32 = 512.0;
/// Backing-store budget for one stamp bitmap. Pixel ratios that would
/// exceed it are lowered until the bitmap fits.
pub const MAX_STAMP_PIXELS: u64 = 1 << 22;
pub const TEXT_PAD_TOP: f32 = 6.0;
pub const TEXT_PAD_BOTTOM: f32 = 6.0;
pub const NAME_PLACEHOLDER: &str = "—";
pub const DEFAULT_NAME: &str = "Usuario";
pub const DEFAULT_DISPLAY_WIDTH: f32 = 100.0;
pub const DEFAULT_FONT_SIZE: f32 = 14.0;

/// America/Guayaquil; the zone has no daylight saving time.
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = -5;

pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset_hours: i32,
}

impl SystemClock {
    pub fn new(offset_hours: i32) -> Self {
        Self { offset_hours }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(DEFAULT_UTC_OFFSET_HOURS)
    }
}

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        local_date(Utc::now(), self.offset_hours)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

fn local_date(now: DateTime<Utc>, offset_hours: i32) -> NaiveDate {
    match FixedOffset::east_opt(offset_hours.saturating_mul(3600)) {
        Some(offset) => now.with_timezone(&offset).date_naive(),
        None => now.date_naive(),
    }
}

/// `dd/mm/yyyy`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Everything the stamp bitmap is built from.
#[derive(Clone)]
pub struct StampDescriptor {
    pub base_image: Option<Arc<BaseImage>>,
    pub display_width: f32,
    pub font_family: FontFamily,
    pub font_size: f32,
    pub font_color: Color,
    pub name_text: String,
    date_text: String,
}

impl StampDescriptor {
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            base_image: None,
            display_width: DEFAULT_DISPLAY_WIDTH,
            font_family: FontFamily::default(),
            font_size: DEFAULT_FONT_SIZE,
            font_color: Color::BLACK,
            name_text: DEFAULT_NAME.to_string(),
            date_text: format_date(clock.today()),
        }
    }

    pub fn date_text(&self) -> &str {
        &self.date_text
    }

    pub(crate) fn refresh_date(&mut self, clock: &dyn Clock) {
        self.date_text = format_date(clock.today());
    }

    fn display_name(&self) -> &str {
        let trimmed = self.name_text.trim();
        if trimmed.is_empty() {
            NAME_PLACEHOLDER
        } else {
            trimmed
        }
    }

    fn effective_width(&self) -> f32 {
        if self.display_width.is_finite() {
            self.display_width.clamp(MIN_DISPLAY_WIDTH, MAX_DISPLAY_WIDTH)
        } else {
            MIN_DISPLAY_WIDTH
        }
    }

    fn effective_font_size(&self) -> f32 {
        if self.font_size.is_finite() {
            self.font_size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
        } else {
            MIN_FONT_SIZE
        }
    }
}

impl std::fmt::Debug for StampDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampDescriptor")
            .field("has_base_image", &self.base_image.is_some())
            .field("display_width", &self.display_width)
            .field("font_family", &self.font_family)
            .field("font_size", &self.font_size)
            .field("font_color", &self.font_color)
            .field("name_text", &self.name_text)
            .field("date_text", &self.date_text)
            .finish()
    }
}

/// A rendered stamp. `pixmap` is `ceil(logical * pixel_ratio)` on each axis.
#[derive(Debug, Clone)]
pub struct StampBitmap {
    pub pixmap: Pixmap,
    pub logical_width: u32,
    pub logical_height: u32,
    pub pixel_ratio: f32,
}

impl StampBitmap {
    pub fn logical_size(&self) -> Size {
        Size::from_pixels(self.logical_width, self.logical_height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StampLayout {
    width: u32,
    height: u32,
    image_height: u32,
    font_size: f32,
    text_top: f32,
}

fn layout(descriptor: &StampDescriptor, image: &BaseImage) -> StampLayout {
    let width = descriptor.effective_width().round().max(1.0);
    let natural_w = image.natural_width().max(1) as f32;
    let natural_h = image.natural_height().max(1) as f32;
    let image_height = (width * natural_h / natural_w).round().max(1.0);
    let font_size = descriptor.effective_font_size();
    let strip = TEXT_PAD_TOP + font_size + TEXT_PAD_BOTTOM;
    StampLayout {
        width: width as u32,
        height: (image_height + strip).ceil() as u32,
        image_height: image_height as u32,
        font_size,
        text_top: image_height + TEXT_PAD_TOP,
    }
}

/// Builds the stamp at `pixel_ratio` device pixels per logical pixel.
///
/// Fails with `MissingBaseImage` while no base image is loaded, and with a
/// raster error when even the logical size does not fit `MAX_STAMP_PIXELS`.
pub(crate) fn build_stamp(
    descriptor: &StampDescriptor,
    pixel_ratio: f32,
    fonts: &FontRegistry,
) -> Result<StampBitmap, StampError> {
    let image = descriptor
        .base_image
        .as_deref()
        .ok_or(StampError::MissingBaseImage)?;
    let requested = if pixel_ratio.is_finite() {
        pixel_ratio.max(1.0)
    } else {
        1.0
    };
    let layout = layout(descriptor, image);
    let logical_pixels = layout.width as u64 * layout.height as u64;
    if logical_pixels > MAX_STAMP_PIXELS {
        return Err(StampError::Raster(format!(
            "stamp of {}x{} exceeds the {} pixel budget",
            layout.width, layout.height, MAX_STAMP_PIXELS
        )));
    }
    let ratio = fit_ratio(requested, logical_pixels);
    if ratio < requested {
        log::debug!(
            "stamp pixel ratio lowered from {} to {:.3} to fit {}x{}",
            requested,
            ratio,
            layout.width,
            layout.height
        );
    }
    let pixel_w = (layout.width as f32 * ratio).ceil().max(1.0) as u32;
    let pixel_h = (layout.height as f32 * ratio).ceil().max(1.0) as u32;
    let mut pixmap = Pixmap::new(pixel_w, pixel_h).ok_or_else(|| {
        StampError::Raster(format!("cannot allocate a {pixel_w}x{pixel_h} stamp"))
    })?;

    let base = Transform::from_scale(ratio, ratio);
    let image_sx = layout.width as f32 / image.natural_width().max(1) as f32;
    let image_sy = layout.image_height as f32 / image.natural_height().max(1) as f32;
    let paint = PixmapPaint {
        quality: FilterQuality::Bicubic,
        ..PixmapPaint::default()
    };
    pixmap.draw_pixmap(
        0,
        0,
        image.pixmap().as_ref(),
        &paint,
        base.pre_scale(image_sx, image_sy),
        None,
    );

    match fonts.resolve_family(descriptor.font_family) {
        Some(font) => {
            let name = descriptor.display_name();
            text::draw_text(
                &mut pixmap,
                &font.data,
                layout.font_size,
                descriptor.font_color,
                name,
                0.0,
                layout.text_top,
                base,
            );
            let date = descriptor.date_text();
            let date_width = text::measure_width(&font.data, layout.font_size, date);
            text::draw_text(
                &mut pixmap,
                &font.data,
                layout.font_size,
                descriptor.font_color,
                date,
                layout.width as f32 - date_width,
                layout.text_top,
                base,
            );
        }
        None => log::warn!(
            "no font for {:?}; stamp text skipped",
            descriptor.font_family
        ),
    }

    Ok(StampBitmap {
        pixmap,
        logical_width: layout.width,
        logical_height: layout.height,
        pixel_ratio: ratio,
    })
}

/// Largest ratio up to `requested` whose bitmap stays within budget.
fn fit_ratio(requested: f32, logical_pixels: u64) -> f32 {
    let fits = MAX_STAMP_PIXELS as f64 / logical_pixels.max(1) as f64;
    let ceiling = fits.sqrt() as f32;
    // Per-axis ceil() may add a row and a column on top of the budget.
    let ceiling = (ceiling * 0.995).max(1.0);
    requested.min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn no_fonts() -> FontRegistry {
        let mut fonts = FontRegistry::new();
        fonts.set_system_fallback(false);
        fonts
    }

    fn descriptor_with_image(w: u32, h: u32) -> StampDescriptor {
        let clock = FixedClock(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        let mut descriptor = StampDescriptor::new(&clock);
        let pixmap = crate::base_image::rgba_to_pixmap(
            &vec![200u8; (w * h * 4) as usize],
            w,
            h,
        )
        .unwrap();
        descriptor.base_image = Some(Arc::new(BaseImage::from_pixmap(pixmap)));
        descriptor
    }

    #[test]
    fn no_stamp_without_base_image() {
        let clock = FixedClock(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let descriptor = StampDescriptor::new(&clock);
        let err = build_stamp(&descriptor, 1.0, &no_fonts()).unwrap_err();
        assert!(matches!(err, StampError::MissingBaseImage));
    }

    #[test]
    fn height_is_image_plus_text_strip() {
        let mut descriptor = descriptor_with_image(320, 180);
        descriptor.display_width = 160.0;
        descriptor.name_text = "Ana".into();
        let stamp = build_stamp(&descriptor, 1.0, &no_fonts()).unwrap();
        assert_eq!(stamp.logical_width, 160);
        assert_eq!(stamp.logical_height, 90 + 6 + 14 + 6);
        assert_eq!(stamp.pixmap.width(), 160);
        assert_eq!(stamp.pixmap.height(), 116);
    }

    #[test]
    fn pixel_ratio_scales_backing_store_only() {
        let mut descriptor = descriptor_with_image(320, 180);
        descriptor.display_width = 160.0;
        let stamp = build_stamp(&descriptor, 2.5, &no_fonts()).unwrap();
        assert_eq!(stamp.logical_width, 160);
        assert_eq!(stamp.logical_height, 116);
        assert_eq!(stamp.pixmap.width(), 400);
        assert_eq!(stamp.pixmap.height(), 290);

        let floored = build_stamp(&descriptor, 0.25, &no_fonts()).unwrap();
        assert_eq!(floored.pixel_ratio, 1.0);
        assert_eq!(floored.pixmap.width(), 160);
    }

    #[test]
    fn degenerate_sizes_are_floored() {
        let mut descriptor = descriptor_with_image(100, 100);
        descriptor.display_width = -40.0;
        descriptor.font_size = 0.0;
        let stamp = build_stamp(&descriptor, 1.0, &no_fonts()).unwrap();
        assert_eq!(stamp.logical_width, 16);
        assert_eq!(stamp.logical_height, 16 + 6 + 6 + 6);
    }

    #[test]
    fn oversized_input_is_clamped() {
        let mut descriptor = descriptor_with_image(10, 10);
        descriptor.display_width = 100_000.0;
        descriptor.font_size = 1.0e6;
        let stamp = build_stamp(&descriptor, 1.0, &no_fonts()).unwrap();
        assert_eq!(stamp.logical_width, MAX_DISPLAY_WIDTH as u32);
        assert_eq!(
            stamp.logical_height,
            MAX_DISPLAY_WIDTH as u32 + (TEXT_PAD_TOP + MAX_FONT_SIZE + TEXT_PAD_BOTTOM) as u32
        );
        descriptor.display_width = f32::INFINITY;
        let stamp = build_stamp(&descriptor, 1.0, &no_fonts()).unwrap();
        assert_eq!(stamp.logical_width, MIN_DISPLAY_WIDTH as u32);
    }

    #[test]
    fn high_ratios_are_lowered_to_the_pixel_budget() {
        let mut descriptor = descriptor_with_image(10, 10);
        descriptor.display_width = MAX_DISPLAY_WIDTH;
        let stamp = build_stamp(&descriptor, 8.0, &no_fonts()).unwrap();
        assert_eq!(stamp.logical_width, MAX_DISPLAY_WIDTH as u32);
        assert!(stamp.pixel_ratio >= 1.0 && stamp.pixel_ratio < 8.0);
        let pixels = stamp.pixmap.width() as u64 * stamp.pixmap.height() as u64;
        assert!(pixels <= MAX_STAMP_PIXELS, "{pixels} pixels");
        assert_eq!(
            stamp.pixmap.width(),
            (stamp.logical_width as f32 * stamp.pixel_ratio).ceil() as u32
        );
    }

    #[test]
    fn stamp_beyond_budget_at_ratio_one_is_a_raster_error() {
        // 1:100 aspect at full width is 160000 logical rows.
        let mut descriptor = descriptor_with_image(1, 100);
        descriptor.display_width = MAX_DISPLAY_WIDTH;
        let err = build_stamp(&descriptor, 2.0, &no_fonts()).unwrap_err();
        assert!(matches!(err, StampError::Raster(_)));
        assert!(!err.is_precondition());
    }

    /// (min_x, min_y, max_x, max_y) of pixels with any coverage at or
    /// below `from_row`.
    fn ink_bounds(pixmap: &Pixmap, from_row: u32) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in from_row..pixmap.height() {
            for x in 0..pixmap.width() {
                if pixmap.pixel(x, y).unwrap().alpha() == 0 {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }
        bounds
    }

    #[test]
    fn name_and_date_sit_at_the_strip_edges() {
        let Some(fonts) = crate::font::tests::registry_with_host_font() else {
            return;
        };
        let mut descriptor = descriptor_with_image(320, 180);
        descriptor.display_width = 160.0;
        descriptor.name_text = "Ana".into();

        let stamp = build_stamp(&descriptor, 1.0, &fonts).unwrap();
        let strip_top = 90 + TEXT_PAD_TOP as u32;
        let (min_x, min_y, max_x, max_y) = ink_bounds(&stamp.pixmap, 90).expect("text ink");
        assert!(min_x <= 3, "name starts at {min_x}");
        assert!(max_x >= stamp.logical_width - 4, "date ends at {max_x}");
        assert!(min_y + 1 >= strip_top, "ink starts at row {min_y}");
        assert!(max_y < stamp.logical_height);

        let hi_res = build_stamp(&descriptor, 3.0, &fonts).unwrap();
        assert_eq!(hi_res.logical_size(), stamp.logical_size());
        let (hx0, hy0, hx1, hy1) = ink_bounds(&hi_res.pixmap, 270).expect("text ink");
        let close = |hi: u32, lo: u32| (hi as f32 / 3.0 - lo as f32).abs() <= 2.0;
        assert!(close(hx0, min_x) && close(hy0, min_y), "({hx0}, {hy0})");
        assert!(close(hx1, max_x) && close(hy1, max_y), "({hx1}, {hy1})");
    }

    #[test]
    fn identical_inputs_build_identical_bitmaps() {
        let mut descriptor = descriptor_with_image(64, 32);
        descriptor.display_width = 120.0;
        let fonts = no_fonts();
        let a = build_stamp(&descriptor, 2.0, &fonts).unwrap();
        let b = build_stamp(&descriptor, 2.0, &fonts).unwrap();
        assert_eq!(a.pixmap.data(), b.pixmap.data());
        assert_eq!(a.logical_size(), b.logical_size());
    }

    #[test]
    fn image_is_scaled_into_the_top_band() {
        let descriptor = descriptor_with_image(10, 10);
        let stamp = build_stamp(&descriptor, 1.0, &no_fonts()).unwrap();
        // 100x100 image, then a transparent strip.
        let top = stamp.pixmap.pixel(50, 50).unwrap();
        assert!(top.alpha() > 0);
        let strip = stamp.pixmap.pixel(50, 110).unwrap();
        assert_eq!(strip.alpha(), 0);
    }

    #[test]
    fn empty_name_uses_placeholder() {
        let mut descriptor = descriptor_with_image(4, 4);
        descriptor.name_text = "   ".into();
        assert_eq!(descriptor.display_name(), NAME_PLACEHOLDER);
        descriptor.name_text = "  Ana ".into();
        assert_eq!(descriptor.display_name(), "Ana");
    }

    #[test]
    fn dates_use_the_fixed_offset() {
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
        assert_eq!(
            local_date(instant, -5),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()
        );
        assert_eq!(
            format_date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()),
            "09/03/2024"
        );
        let descriptor = descriptor_with_image(1, 1);
        assert_eq!(descriptor.date_text(), "09/03/2024");
    }
}
