/// Width/height pair. Document pages are measured in points, canvases and
/// bitmaps in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn letter() -> Self {
        // 8.5in x 11in at 72pt/in.
        Self {
            width: 612.0,
            height: 792.0,
        }
    }

    pub fn from_pixels(width: u32, height: u32) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Rectangle in document space: origin bottom-left, units in points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DocRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };

    pub const WHITE: Color = Color {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Parses `#rrggbb`, `rrggbb` or `#rgb`. Anything else is black, which is
    /// what a colour input reports before the user touches it.
    pub fn from_hex(hex: &str) -> Self {
        let digits = hex.trim().trim_start_matches('#');
        let expanded: String = match digits.len() {
            3 => digits.chars().flat_map(|c| [c, c]).collect(),
            6 => digits.to_string(),
            _ => return Color::BLACK,
        };
        let Ok(value) = u32::from_str_radix(&expanded, 16) else {
            return Color::BLACK;
        };
        let r = ((value >> 16) & 0xff) as f32 / 255.0;
        let g = ((value >> 8) & 0xff) as f32 / 255.0;
        let b = (value & 0xff) as f32 / 255.0;
        Color { r, g, b }
    }

    pub(crate) fn to_skia(self, opacity: f32) -> tiny_skia::Color {
        let r = self.r.clamp(0.0, 1.0);
        let g = self.g.clamp(0.0, 1.0);
        let b = self.b.clamp(0.0, 1.0);
        let a = opacity.clamp(0.0, 1.0);
        tiny_skia::Color::from_rgba(r, g, b, a)
            .unwrap_or_else(|| tiny_skia::Color::from_rgba8(0, 0, 0, 255))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_colors_parse_long_and_short_forms() {
        let c = Color::from_hex("#ff8000");
        assert!((c.r - 1.0).abs() < 1e-6);
        assert!((c.g - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(c.b, 0.0);
        assert_eq!(Color::from_hex("#fff"), Color::WHITE);
        assert_eq!(Color::from_hex("000000"), Color::BLACK);
    }

    #[test]
    fn malformed_hex_falls_back_to_black() {
        assert_eq!(Color::from_hex("#12"), Color::BLACK);
        assert_eq!(Color::from_hex("#zzzzzz"), Color::BLACK);
    }
}
