use crate::document::PageRef;
use crate::error::StampError;
use crate::mapping::ViewportMapping;
use crate::placement::Placement;
use crate::raster::{CancelToken, PageRasterizer};
use crate::stamp::StampBitmap;
use crate::types::Size;
use tiny_skia::{FilterQuality, Pixmap, PixmapPaint, Transform};

/// Identifies one render request. Only the most recently issued ticket can
/// apply its result.
#[derive(Debug, Clone)]
pub struct RenderTicket {
    generation: u64,
    page: PageRef,
    token: CancelToken,
}

impl RenderTicket {
    pub fn page(&self) -> PageRef {
        self.page
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub pixmap: Pixmap,
    pub page_size: Size,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderOutcome {
    Applied(ViewportMapping),
    Discarded,
}

/// Owns the page background, the visible canvas and the mapping between
/// them. The canvas is always the size of the background.
pub struct PreviewRenderer {
    rasterizer: Box<dyn PageRasterizer>,
    render_scale: f32,
    background: Option<Pixmap>,
    canvas: Option<Pixmap>,
    mapping: Option<ViewportMapping>,
    generation: u64,
    in_flight: Option<CancelToken>,
}

impl PreviewRenderer {
    pub fn new(rasterizer: Box<dyn PageRasterizer>, render_scale: f32) -> Self {
        Self {
            rasterizer,
            render_scale,
            background: None,
            canvas: None,
            mapping: None,
            generation: 0,
            in_flight: None,
        }
    }

    pub fn render_scale(&self) -> f32 {
        self.render_scale
    }

    /// Hands a consumable copy of a new document to the rasterizer. Any
    /// in-flight render is cancelled and the old preview dropped.
    pub fn load(&mut self, bytes: Vec<u8>) -> Result<usize, StampError> {
        let count = self.rasterizer.load(bytes)?;
        self.cancel_in_flight();
        self.generation += 1;
        self.background = None;
        self.canvas = None;
        self.mapping = None;
        Ok(count)
    }

    fn cancel_in_flight(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
    }

    pub fn begin_render(&mut self, page: PageRef) -> RenderTicket {
        self.cancel_in_flight();
        self.generation += 1;
        let token = CancelToken::new();
        self.in_flight = Some(token.clone());
        RenderTicket {
            generation: self.generation,
            page,
            token,
        }
    }

    pub fn rasterize(&self, ticket: &RenderTicket) -> Result<RenderedPage, StampError> {
        let page_size = self.rasterizer.page_size(ticket.page)?;
        let pixmap = self
            .rasterizer
            .rasterize(ticket.page, self.render_scale, &ticket.token)?;
        Ok(RenderedPage { pixmap, page_size })
    }

    pub fn is_current(&self, ticket: &RenderTicket) -> bool {
        ticket.generation == self.generation
    }

    /// Applies a finished render. Stale tickets are discarded whatever
    /// their result; a failed current render leaves the previous preview
    /// in place.
    pub fn complete_render(
        &mut self,
        ticket: RenderTicket,
        result: Result<RenderedPage, StampError>,
    ) -> Result<RenderOutcome, StampError> {
        if !self.is_current(&ticket) {
            log::debug!(
                "discarding stale render of page {} (generation {} < {})",
                ticket.page.number(),
                ticket.generation,
                self.generation
            );
            return Ok(RenderOutcome::Discarded);
        }
        self.in_flight = None;
        let rendered = result?;
        let canvas_size = Size::from_pixels(rendered.pixmap.width(), rendered.pixmap.height());
        let mapping = ViewportMapping::new(rendered.page_size, canvas_size)?;
        self.canvas = Some(rendered.pixmap.clone());
        self.background = Some(rendered.pixmap);
        self.mapping = Some(mapping);
        Ok(RenderOutcome::Applied(mapping))
    }

    pub fn render_page(&mut self, page: PageRef) -> Result<RenderOutcome, StampError> {
        let ticket = self.begin_render(page);
        let result = self.rasterize(&ticket);
        self.complete_render(ticket, result)
    }

    /// Redraws the canvas from the background and, when present, the stamp
    /// at its logical size.
    pub fn composite(&mut self, stamp: Option<&StampBitmap>, placement: Placement) {
        let (Some(background), Some(canvas)) = (self.background.as_ref(), self.canvas.as_mut())
        else {
            return;
        };
        canvas.data_mut().copy_from_slice(background.data());
        let Some(stamp) = stamp else {
            return;
        };
        let inv = 1.0 / stamp.pixel_ratio.max(1.0);
        let transform = Transform::from_translate(placement.x as f32, placement.y as f32)
            .pre_scale(inv, inv);
        let paint = PixmapPaint {
            quality: FilterQuality::Bilinear,
            ..PixmapPaint::default()
        };
        canvas.draw_pixmap(0, 0, stamp.pixmap.as_ref(), &paint, transform, None);
    }

    pub fn canvas(&self) -> Option<&Pixmap> {
        self.canvas.as_ref()
    }

    pub fn background(&self) -> Option<&Pixmap> {
        self.background.as_ref()
    }

    pub fn canvas_size(&self) -> Option<Size> {
        self.canvas
            .as_ref()
            .map(|c| Size::from_pixels(c.width(), c.height()))
    }

    pub fn mapping(&self) -> Option<ViewportMapping> {
        self.mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Solid-colour pages; records the scales it was asked for.
    struct FakeRasterizer {
        pages: Vec<Size>,
        fail: Arc<Mutex<bool>>,
    }

    impl PageRasterizer for FakeRasterizer {
        fn load(&mut self, _bytes: Vec<u8>) -> Result<usize, StampError> {
            Ok(self.pages.len())
        }

        fn page_size(&self, page: PageRef) -> Result<Size, StampError> {
            self.pages
                .get(page.index())
                .copied()
                .ok_or_else(|| StampError::Raster("out of range".into()))
        }

        fn rasterize(
            &self,
            page: PageRef,
            scale: f32,
            cancel: &CancelToken,
        ) -> Result<Pixmap, StampError> {
            if *self.fail.lock().unwrap() {
                return Err(StampError::Raster("boom".into()));
            }
            if cancel.is_cancelled() {
                return Err(StampError::Cancelled);
            }
            let size = self.page_size(page)?;
            let (w, h) = crate::raster::raster_size(size, scale);
            let mut pixmap = Pixmap::new(w, h).unwrap();
            pixmap.fill(tiny_skia::Color::WHITE);
            Ok(pixmap)
        }
    }

    fn renderer(pages: Vec<Size>) -> (PreviewRenderer, Arc<Mutex<bool>>) {
        let fail = Arc::new(Mutex::new(false));
        let fake = FakeRasterizer {
            pages,
            fail: fail.clone(),
        };
        let mut renderer = PreviewRenderer::new(Box::new(fake), 1.5);
        renderer.load(Vec::new()).unwrap();
        (renderer, fail)
    }

    fn stamp(w: u32, h: u32, ratio: f32) -> StampBitmap {
        let pw = (w as f32 * ratio).ceil() as u32;
        let ph = (h as f32 * ratio).ceil() as u32;
        let mut pixmap = Pixmap::new(pw, ph).unwrap();
        pixmap.fill(tiny_skia::Color::from_rgba8(255, 0, 0, 255));
        StampBitmap {
            pixmap,
            logical_width: w,
            logical_height: h,
            pixel_ratio: ratio,
        }
    }

    #[test]
    fn applied_render_resizes_canvas_and_maps() {
        let (mut r, _) = renderer(vec![Size::letter()]);
        let outcome = r.render_page(PageRef::FIRST).unwrap();
        let RenderOutcome::Applied(mapping) = outcome else {
            panic!("expected applied render");
        };
        assert_eq!(r.canvas_size(), Some(Size::new(918.0, 1188.0)));
        assert!((mapping.scale_x() - 612.0 / 918.0).abs() < 1e-9);
        assert_eq!(r.mapping(), Some(mapping));
    }

    #[test]
    fn stale_ticket_is_discarded() {
        let (mut r, _) = renderer(vec![Size::letter(), Size::new(842.0, 595.0)]);
        let first = r.begin_render(PageRef::FIRST);
        let second = r.begin_render(PageRef::clamped(2, 2));
        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());

        let late = r.rasterize(&first);
        let current = r.rasterize(&second);
        let applied = r.complete_render(second, current).unwrap();
        assert!(matches!(applied, RenderOutcome::Applied(_)));
        let outcome = r.complete_render(first, late).unwrap();
        assert_eq!(outcome, RenderOutcome::Discarded);
        assert_eq!(r.canvas_size(), Some(Size::new(1263.0, 892.0)));
    }

    #[test]
    fn failed_render_keeps_previous_preview() {
        let (mut r, fail) = renderer(vec![Size::letter(), Size::new(842.0, 595.0)]);
        r.render_page(PageRef::FIRST).unwrap();
        let before = r.mapping();
        *fail.lock().unwrap() = true;
        assert!(r.render_page(PageRef::clamped(2, 2)).is_err());
        assert_eq!(r.mapping(), before);
        assert_eq!(r.canvas_size(), Some(Size::new(918.0, 1188.0)));
    }

    #[test]
    fn composite_draws_stamp_at_logical_size() {
        let (mut r, _) = renderer(vec![Size::new(100.0, 100.0)]);
        r.render_page(PageRef::FIRST).unwrap();
        let hi_res = stamp(20, 10, 2.0);
        r.composite(Some(&hi_res), Placement { x: 30, y: 40 });
        let canvas = r.canvas().unwrap();
        let inside = canvas.pixel(39, 44).unwrap();
        assert_eq!((inside.red(), inside.green()), (255, 0));
        // 20 logical pixels wide, not 40.
        let past = canvas.pixel(55, 44).unwrap();
        assert_eq!((past.red(), past.green()), (255, 255));
        let below = canvas.pixel(39, 52).unwrap();
        assert_eq!(below.green(), 255);
    }

    #[test]
    fn composite_without_stamp_restores_background() {
        let (mut r, _) = renderer(vec![Size::new(100.0, 100.0)]);
        r.render_page(PageRef::FIRST).unwrap();
        r.composite(Some(&stamp(20, 10, 1.0)), Placement { x: 0, y: 0 });
        r.composite(None, Placement { x: 0, y: 0 });
        assert_eq!(r.canvas().unwrap().data(), r.background().unwrap().data());
    }
}
