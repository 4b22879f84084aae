use crate::types::Color;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use tiny_skia::{FillRule, Paint, Path, PathBuilder, Pixmap, Transform};
use ttf_parser::{GlyphId, OutlineBuilder};

#[derive(Debug, Clone, Copy)]
struct GlyphPlacement {
    glyph_id: u16,
    x: f32,
    y: f32,
}

/// A shaped line of text in y-down pixel space, origin at its top-left.
#[derive(Debug, Clone)]
pub(crate) struct TextLine {
    glyphs: Vec<GlyphPlacement>,
    scale: f32,
    baseline: f32,
    pub(crate) width: f32,
}

pub(crate) fn layout_line(font_data: &[u8], text: &str, font_size: f32) -> Option<TextLine> {
    let face = ttf_parser::Face::parse(font_data, 0).ok()?;
    let upem = face.units_per_em().max(1) as f32;
    let scale = font_size / upem;
    let ascender = face.ascender() as f32;
    let descender = face.descender() as f32;
    let extent = ascender - descender;
    // textBaseline = "top": the em box top sits on y.
    let baseline = if extent > 0.0 {
        font_size * ascender / extent
    } else {
        font_size * 0.8
    };

    let (glyphs, width) = shape(font_data, text, font_size)
        .unwrap_or_else(|| shape_unshaped(&face, text, font_size));
    Some(TextLine {
        glyphs,
        scale,
        baseline,
        width,
    })
}

fn shape(font_data: &[u8], text: &str, font_size: f32) -> Option<(Vec<GlyphPlacement>, f32)> {
    let face = HbFace::from_slice(font_data, 0)?;
    let units = face.units_per_em().max(1) as f32;
    let mut buffer = UnicodeBuffer::new();
    buffer.set_direction(detect_direction(text));
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();
    if infos.is_empty() || infos.len() != positions.len() {
        return None;
    }

    let mut out = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        if gid != 0 {
            out.push(GlyphPlacement {
                glyph_id: gid,
                x: pen_x + (pos.x_offset as f32 / units) * font_size,
                y: -(pos.y_offset as f32 / units) * font_size,
            });
        }
        pen_x += (pos.x_advance as f32 / units) * font_size;
    }
    Some((out, pen_x))
}

fn shape_unshaped(
    face: &ttf_parser::Face<'_>,
    text: &str,
    font_size: f32,
) -> (Vec<GlyphPlacement>, f32) {
    let units = face.units_per_em().max(1) as f32;
    let mut out = Vec::new();
    let mut pen_x = 0.0f32;
    for ch in text.chars() {
        let gid = face.glyph_index(ch).map(|id| id.0).unwrap_or(0);
        if gid == 0 {
            pen_x += font_size * 0.5;
            continue;
        }
        out.push(GlyphPlacement {
            glyph_id: gid,
            x: pen_x,
            y: 0.0,
        });
        let advance = face.glyph_hor_advance(GlyphId(gid)).unwrap_or(0) as f32;
        let advance = (advance / units) * font_size;
        pen_x += if advance > 0.0 { advance } else { font_size * 0.5 };
    }
    (out, pen_x)
}

/// Fills the glyph outlines of `line` with its top-left corner at (x, y).
/// `transform` maps layout units to device pixels.
pub(crate) fn draw_line(
    pixmap: &mut Pixmap,
    font_data: &[u8],
    line: &TextLine,
    x: f32,
    y: f32,
    color: Color,
    transform: Transform,
) -> usize {
    let Ok(face) = ttf_parser::Face::parse(font_data, 0) else {
        return 0;
    };
    let mut paint = Paint::default();
    paint.set_color(color.to_skia(1.0));
    paint.anti_alias = true;

    let mut drawn = 0usize;
    for glyph in &line.glyphs {
        let mut builder =
            GlyphPathBuilder::y_flipped(x + glyph.x, y + line.baseline + glyph.y, line.scale);
        if face
            .outline_glyph(GlyphId(glyph.glyph_id), &mut builder)
            .is_none()
        {
            continue;
        }
        let Some(path) = builder.finish() else {
            continue;
        };
        pixmap.fill_path(&path, &paint, FillRule::Winding, transform, None);
        drawn += 1;
    }
    drawn
}

/// Advance width of `text` at `font_size`, in layout units.
pub(crate) fn measure_width(font_data: &[u8], font_size: f32, text: &str) -> f32 {
    layout_line(font_data, text, font_size)
        .map(|line| line.width)
        .unwrap_or(0.0)
}

/// Shapes and draws `text` with the top of its em box at `y_top`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn draw_text(
    pixmap: &mut Pixmap,
    font_data: &[u8],
    font_size: f32,
    color: Color,
    text: &str,
    x: f32,
    y_top: f32,
    transform: Transform,
) -> usize {
    match layout_line(font_data, text, font_size) {
        Some(line) => draw_line(pixmap, font_data, &line, x, y_top, color, transform),
        None => 0,
    }
}

fn detect_direction(text: &str) -> HbDirection {
    for ch in text.chars() {
        let code = ch as u32;
        let rtl = matches!(
            code,
            0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF | 0x1EE00..=0x1EEFF
        );
        if rtl {
            return HbDirection::RightToLeft;
        }
    }
    HbDirection::LeftToRight
}

/// Collects a glyph outline, mapping font units through an affine
/// transform as the points arrive.
pub(crate) struct GlyphPathBuilder {
    builder: PathBuilder,
    transform: Transform,
}

impl GlyphPathBuilder {
    pub(crate) fn new(transform: Transform) -> Self {
        Self {
            builder: PathBuilder::new(),
            transform,
        }
    }

    /// Font units are y-up; the pixmap is y-down, so y is mirrored around
    /// the baseline at `origin_y`.
    pub(crate) fn y_flipped(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self::new(Transform::from_row(scale, 0.0, 0.0, -scale, origin_x, origin_y))
    }

    pub(crate) fn finish(self) -> Option<Path> {
        self.builder.finish()
    }

    fn map(&self, x: f32, y: f32) -> (f32, f32) {
        let t = &self.transform;
        (t.sx * x + t.kx * y + t.tx, t.ky * x + t.sy * y + t.ty)
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x, y) = self.map(x, y);
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x2, y2) = self.map(x2, y2);
        let (x, y) = self.map(x, y);
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}
