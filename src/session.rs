use crate::base_image::BaseImage;
use crate::debug::{DebugLogger, Field};
use crate::document::{MasterDocument, PageCursor, PageJump, PageRef, SourceFile};
use crate::error::StampError;
use crate::export::{ExportRequest, ExportedPdf, export_document};
use crate::font::{FontFamily, FontRegistry};
use crate::mapping::ViewportMapping;
use crate::placement::{DragState, Placement, PlacementController};
use crate::preview::{PreviewRenderer, RenderOutcome};
use crate::raster::PageRasterizer;
use crate::stamp::{Clock, StampBitmap, StampDescriptor, build_stamp};
use crate::types::{Color, Point, Size};
use std::sync::Arc;
use std::time::Instant;
use tiny_skia::Pixmap;

pub(crate) struct SessionParts {
    pub(crate) render_scale: f32,
    pub(crate) device_pixel_density: f32,
    pub(crate) fonts: Arc<FontRegistry>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) rasterizer: Box<dyn PageRasterizer>,
    pub(crate) debug: Option<DebugLogger>,
}

/// One stamping session: a master document, the stamp being designed and
/// where it sits on the preview.
///
/// Every operation runs to completion on the caller's thread. Failed
/// renders and exports leave the last good state in place and return the
/// error; `StampError::user_message` is what the user should see.
pub struct StampSession {
    device_pixel_density: f32,
    fonts: Arc<FontRegistry>,
    clock: Box<dyn Clock>,
    debug: Option<DebugLogger>,
    document: Option<MasterDocument>,
    cursor: PageCursor,
    descriptor: StampDescriptor,
    stamp_dirty: bool,
    preview_stamp: Option<StampBitmap>,
    stamp_failure: Option<String>,
    placement: PlacementController,
    preview: PreviewRenderer,
}

impl StampSession {
    pub(crate) fn from_parts(parts: SessionParts) -> Self {
        let descriptor = StampDescriptor::new(parts.clock.as_ref());
        Self {
            device_pixel_density: parts.device_pixel_density,
            fonts: parts.fonts,
            clock: parts.clock,
            debug: parts.debug,
            document: None,
            cursor: PageCursor::new(0),
            descriptor,
            stamp_dirty: true,
            preview_stamp: None,
            stamp_failure: None,
            placement: PlacementController::new(),
            preview: PreviewRenderer::new(parts.rasterizer, parts.render_scale),
        }
    }

    pub fn render_scale(&self) -> f32 {
        self.preview.render_scale()
    }

    pub fn load_document(&mut self, source: SourceFile) -> Result<usize, StampError> {
        let master = match MasterDocument::load(source) {
            Ok(master) => master,
            Err(err) => return Err(self.failed("document.load", err)),
        };
        let count = match self.preview.load(master.clone_for_consumption()) {
            Ok(count) => count,
            Err(err) => return Err(self.failed("document.load", err)),
        };
        log::info!(
            "loaded {} ({} pages, {} bytes)",
            master.stem(),
            count,
            master.len()
        );
        self.document = Some(master);
        self.cursor = PageCursor::new(count);
        self.render_current()?;
        Ok(count)
    }

    /// Decodes a new stamp logo. A new logo also releases a locked stamp.
    pub fn load_base_image(&mut self, bytes: &[u8]) -> Result<(), StampError> {
        let image = match BaseImage::decode(bytes) {
            Ok(image) => image,
            Err(err) => return Err(self.failed("image.load", err)),
        };
        self.descriptor.base_image = Some(Arc::new(image));
        self.placement.unlock();
        self.invalidate_stamp();
        Ok(())
    }

    pub fn set_name(&mut self, name: &str) {
        self.descriptor.name_text = name.to_string();
        self.invalidate_stamp();
    }

    pub fn set_font_family(&mut self, family: FontFamily) {
        self.descriptor.font_family = family;
        self.invalidate_stamp();
    }

    pub fn set_font_size(&mut self, size: f32) {
        self.descriptor.font_size = size;
        self.invalidate_stamp();
    }

    pub fn set_font_color(&mut self, color: Color) {
        self.descriptor.font_color = color;
        self.invalidate_stamp();
    }

    pub fn set_display_width(&mut self, width: f32) {
        self.descriptor.display_width = width;
        self.invalidate_stamp();
    }

    fn invalidate_stamp(&mut self) {
        self.stamp_dirty = true;
        self.composite();
    }

    fn ensure_stamp(&mut self) {
        if !self.stamp_dirty {
            return;
        }
        self.descriptor.refresh_date(self.clock.as_ref());
        let ratio = self.device_pixel_density.max(1.0);
        self.stamp_dirty = false;
        self.stamp_failure = None;
        match build_stamp(&self.descriptor, ratio, &self.fonts) {
            Ok(stamp) => {
                if let Some(debug) = &self.debug {
                    let font = self.fonts.resolve_family(self.descriptor.font_family);
                    let font_name = font.as_ref().map_or("", |f| f.name.as_str());
                    debug.event(
                        "stamp.rebuilt",
                        &[
                            ("width", Field::Int(stamp.logical_width as i64)),
                            ("height", Field::Int(stamp.logical_height as i64)),
                            ("ratio", Field::Num(stamp.pixel_ratio as f64)),
                            ("text", Field::Bool(font.is_some())),
                            ("font", Field::Str(font_name)),
                        ],
                    );
                }
                self.preview_stamp = Some(stamp);
            }
            Err(StampError::MissingBaseImage) => self.preview_stamp = None,
            Err(err) => {
                self.preview_stamp = None;
                let message = match &err {
                    StampError::Raster(message) => message.clone(),
                    other => other.to_string(),
                };
                self.failed("stamp", err);
                self.stamp_failure = Some(message);
            }
        }
    }

    /// Why there is no preview stamp: nothing loaded yet, or a failed build.
    fn stamp_unavailable(&self) -> StampError {
        match &self.stamp_failure {
            Some(message) => StampError::Raster(message.clone()),
            None => StampError::MissingStamp,
        }
    }

    fn composite(&mut self) {
        self.ensure_stamp();
        self.preview
            .composite(self.preview_stamp.as_ref(), self.placement.placement());
    }

    fn render_current(&mut self) -> Result<(), StampError> {
        let page = self.cursor.current();
        let started = Instant::now();
        match self.preview.render_page(page) {
            Ok(RenderOutcome::Applied(mapping)) => {
                if let Some(debug) = &self.debug {
                    debug.event(
                        "render.page",
                        &[
                            ("page", Field::Int(page.number() as i64)),
                            ("canvas_w", Field::Num(mapping.canvas_size().width as f64)),
                            ("canvas_h", Field::Num(mapping.canvas_size().height as f64)),
                        ],
                    );
                    debug.span_ms("render", started.elapsed().as_secs_f64() * 1000.0);
                }
                self.composite();
                Ok(())
            }
            Ok(RenderOutcome::Discarded) => {
                if let Some(debug) = &self.debug {
                    debug.event(
                        "render.discarded",
                        &[("page", Field::Int(page.number() as i64))],
                    );
                }
                Ok(())
            }
            Err(err) => Err(self.failed("render", err)),
        }
    }

    /// Logs a rendering or IO failure and hands the error back.
    fn failed(&self, context: &str, err: StampError) -> StampError {
        log::error!("{context} failed: {err}");
        if let Some(debug) = &self.debug {
            let kind = match context {
                "render" => "render.failed",
                "export" => "export.failed",
                "stamp" => "stamp.failed",
                _ => "operation.failed",
            };
            let message = err.to_string();
            debug.event(
                kind,
                &[
                    ("context", Field::Str(context)),
                    ("error", Field::Str(&message)),
                ],
            );
        }
        err
    }

    fn require_document(&self) -> Result<(), StampError> {
        match self.document {
            Some(_) => Ok(()),
            None => Err(StampError::MissingDocument),
        }
    }

    pub fn next_page(&mut self) -> Result<bool, StampError> {
        self.require_document()?;
        if !self.cursor.next() {
            return Ok(false);
        }
        self.render_current()?;
        Ok(true)
    }

    pub fn prev_page(&mut self) -> Result<bool, StampError> {
        self.require_document()?;
        if !self.cursor.prev() {
            return Ok(false);
        }
        self.render_current()?;
        Ok(true)
    }

    /// Jumps to a typed page number. Input that is not a page of the
    /// document leaves the current page in place.
    pub fn jump_to_page(&mut self, input: &str) -> Result<PageJump, StampError> {
        self.require_document()?;
        let jump = self.cursor.jump(input);
        if jump.changed {
            self.render_current()?;
        }
        Ok(jump)
    }

    fn stamp_size(&mut self) -> Option<Size> {
        self.ensure_stamp();
        self.preview_stamp.as_ref().map(StampBitmap::logical_size)
    }

    pub fn pointer_down(&mut self, pointer: Point) -> bool {
        let size = self.stamp_size();
        let moved = self.placement.pointer_down(pointer, size);
        if moved {
            self.composite();
        }
        moved
    }

    pub fn pointer_move(&mut self, pointer: Point) -> bool {
        let size = self.stamp_size();
        let moved = self.placement.pointer_move(pointer, size);
        if moved {
            self.composite();
        }
        moved
    }

    pub fn pointer_up(&mut self) {
        self.placement.pointer_up();
    }

    pub fn lock_stamp(&mut self) -> Result<(), StampError> {
        self.ensure_stamp();
        if self.preview_stamp.is_none() {
            return Err(self.stamp_unavailable());
        }
        self.placement.lock(true)
    }

    pub fn reset_placement(&mut self) {
        self.placement.reset();
        self.composite();
    }

    pub fn export(&mut self) -> Result<ExportedPdf, StampError> {
        self.require_document()?;
        self.ensure_stamp();
        if self.preview_stamp.is_none() {
            let err = self.stamp_unavailable();
            if err.is_precondition() {
                return Err(err);
            }
            return Err(self.failed("export", err));
        }
        let started = Instant::now();
        let result = export_document(ExportRequest {
            master: self.document.as_ref(),
            page: self.cursor.current(),
            descriptor: &self.descriptor,
            preview_stamp: self.preview_stamp.as_ref(),
            placement: self.placement.placement(),
            canvas_size: self.preview.canvas_size(),
            device_density: self.device_pixel_density,
            fonts: &self.fonts,
        });
        match result {
            Ok(pdf) => {
                if let Some(debug) = &self.debug {
                    debug.event(
                        "export.done",
                        &[
                            ("page", Field::Int(self.cursor.current().number() as i64)),
                            ("bytes", Field::Int(pdf.bytes.len() as i64)),
                            ("x", Field::Num(pdf.document_rect.x)),
                            ("y", Field::Num(pdf.document_rect.y)),
                            ("ratio", Field::Num(pdf.pixel_ratio as f64)),
                            ("file", Field::Str(&pdf.file_name)),
                        ],
                    );
                    debug.span_ms("export", started.elapsed().as_secs_f64() * 1000.0);
                }
                Ok(pdf)
            }
            Err(err) if err.is_precondition() => Err(err),
            Err(err) => Err(self.failed("export", err)),
        }
    }

    pub fn document(&self) -> Option<&MasterDocument> {
        self.document.as_ref()
    }

    pub fn current_page(&self) -> PageRef {
        self.cursor.current()
    }

    pub fn page_count(&self) -> usize {
        self.cursor.count()
    }

    /// Whether page navigation controls should be shown.
    pub fn needs_navigation(&self) -> bool {
        self.cursor.needs_navigation()
    }

    pub fn canvas(&self) -> Option<&Pixmap> {
        self.preview.canvas()
    }

    pub fn mapping(&self) -> Option<ViewportMapping> {
        self.preview.mapping()
    }

    pub fn placement(&self) -> Placement {
        self.placement.placement()
    }

    pub fn drag_state(&self) -> DragState {
        self.placement.state()
    }

    pub fn is_locked(&self) -> bool {
        self.placement.is_locked()
    }

    pub fn descriptor(&self) -> &StampDescriptor {
        &self.descriptor
    }

    pub fn stamp(&mut self) -> Option<&StampBitmap> {
        self.ensure_stamp();
        self.preview_stamp.as_ref()
    }

    pub fn flush_debug(&self) {
        if let Some(debug) = &self.debug {
            debug.emit_summary("session");
            debug.flush();
        }
    }
}

impl Drop for StampSession {
    fn drop(&mut self) {
        self.flush_debug();
    }
}
