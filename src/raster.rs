use crate::base_image::rgba_to_pixmap;
use crate::document::{PageBox, PageRef, obj_to_f32, page_box_for_id};
use crate::error::StampError;
use crate::font::{FontRegistry, LoadedFont};
use crate::text::GlyphPathBuilder;
use crate::types::{Color, Size};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tiny_skia::{
    FillRule, FilterQuality, Mask, Paint, Path, PathBuilder, Pixmap, PixmapPaint, Stroke,
    Transform,
};
use ttf_parser::GlyphId;

/// Shared cancellation flag for one in-flight rasterization.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Turns pages of a loaded document into bitmaps.
pub trait PageRasterizer: Send {
    /// Takes ownership of a consumable copy of the document; returns the
    /// page count.
    fn load(&mut self, bytes: Vec<u8>) -> Result<usize, StampError>;

    fn page_size(&self, page: PageRef) -> Result<Size, StampError>;

    /// Renders `page` at `scale` device pixels per point. The result is
    /// `floor(page_size * scale)` on each axis.
    fn rasterize(
        &self,
        page: PageRef,
        scale: f32,
        cancel: &CancelToken,
    ) -> Result<Pixmap, StampError>;
}

/// Backing size of a page rendered at `scale`.
pub fn raster_size(page: Size, scale: f32) -> (u32, u32) {
    let w = (page.width * scale).floor().max(1.0) as u32;
    let h = (page.height * scale).floor().max(1.0) as u32;
    (w, h)
}

/// In-process rasterizer over lopdf content streams.
pub struct LopdfRasterizer {
    doc: Option<LoDocument>,
    pages: Vec<(ObjectId, PageBox)>,
    fonts: Arc<FontRegistry>,
}

impl LopdfRasterizer {
    pub(crate) fn new(fonts: Arc<FontRegistry>) -> Self {
        Self {
            doc: None,
            pages: Vec::new(),
            fonts,
        }
    }

    fn page_entry(&self, page: PageRef) -> Result<(&LoDocument, ObjectId, PageBox), StampError> {
        let doc = self
            .doc
            .as_ref()
            .ok_or_else(|| StampError::Raster("no document loaded".to_string()))?;
        let (id, page_box) = self
            .pages
            .get(page.index())
            .copied()
            .ok_or_else(|| StampError::Raster(format!("page {} out of range", page.number())))?;
        Ok((doc, id, page_box))
    }
}

impl PageRasterizer for LopdfRasterizer {
    fn load(&mut self, bytes: Vec<u8>) -> Result<usize, StampError> {
        let doc = LoDocument::load_mem(&bytes)?;
        let mut pages = Vec::new();
        for id in doc.get_pages().values() {
            pages.push((*id, page_box_for_id(&doc, *id)?));
        }
        let count = pages.len();
        self.doc = Some(doc);
        self.pages = pages;
        Ok(count)
    }

    fn page_size(&self, page: PageRef) -> Result<Size, StampError> {
        let (_, _, page_box) = self.page_entry(page)?;
        Ok(page_box.size)
    }

    fn rasterize(
        &self,
        page: PageRef,
        scale: f32,
        cancel: &CancelToken,
    ) -> Result<Pixmap, StampError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(StampError::Raster(format!("invalid render scale {scale}")));
        }
        let (doc, page_id, page_box) = self.page_entry(page)?;
        let (width, height) = raster_size(page_box.size, scale);
        let mut pixmap = Pixmap::new(width, height).ok_or_else(|| {
            StampError::Raster(format!("cannot allocate {width}x{height} page bitmap"))
        })?;
        pixmap.fill(tiny_skia::Color::WHITE);

        // PDF user space (y-up, MediaBox origin) to device pixels (y-down).
        let base = Transform::from_row(
            scale,
            0.0,
            0.0,
            -scale,
            -page_box.origin_x * scale,
            (page_box.origin_y + page_box.size.height) * scale,
        );

        let content_bytes = doc.get_page_content(page_id)?;
        let content = Content::decode(&content_bytes)?;
        let mut resources = ResourceStack::default();
        if let Some(dict) = page_resources(doc, page_id) {
            resources.push(dict);
        }

        let mut ctx = RenderContext {
            doc,
            fonts: self.fonts.as_ref(),
            cancel,
            pixmap,
            base,
            font_cache: HashMap::new(),
            image_cache: HashMap::new(),
            visited_forms: HashSet::new(),
        };
        let mut state = GraphicsState::default();
        ctx.run(&content.operations, &mut resources, &mut state)?;
        log::debug!(
            "rasterized page {} at {:.2}x ({}x{})",
            page.number(),
            scale,
            width,
            height
        );
        Ok(ctx.pixmap)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    fn new(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    fn translation(tx: f32, ty: f32) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    /// `self` applied first, then `rhs`.
    fn then(self, rhs: Self) -> Self {
        Self {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    fn apply(self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    fn mean_scale(self) -> f32 {
        (self.a * self.d - self.b * self.c).abs().sqrt()
    }

    fn to_skia(self) -> Transform {
        Transform::from_row(self.a, self.b, self.c, self.d, self.e, self.f)
    }
}

#[derive(Clone)]
struct TextState {
    font_key: Option<Vec<u8>>,
    size: f32,
    leading: f32,
    char_spacing: f32,
    word_spacing: f32,
    h_scale: f32,
    rise: f32,
    render_mode: i64,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            font_key: None,
            size: 12.0,
            leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            h_scale: 1.0,
            rise: 0.0,
            render_mode: 0,
        }
    }
}

#[derive(Clone)]
struct GraphicsState {
    ctm: Matrix,
    fill: Color,
    stroke: Color,
    fill_alpha: f32,
    stroke_alpha: f32,
    line_width: f32,
    clip: Option<Mask>,
    text: TextState,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            fill: Color::BLACK,
            stroke: Color::BLACK,
            fill_alpha: 1.0,
            stroke_alpha: 1.0,
            line_width: 1.0,
            clip: None,
            text: TextState::default(),
        }
    }
}

/// Page resources with Form XObject resources layered on top.
#[derive(Default)]
struct ResourceStack {
    dicts: Vec<LoDictionary>,
}

impl ResourceStack {
    fn push(&mut self, dict: LoDictionary) {
        self.dicts.push(dict);
    }

    fn pop(&mut self) {
        self.dicts.pop();
    }

    fn lookup<'d>(
        &'d self,
        doc: &'d LoDocument,
        category: &[u8],
        name: &[u8],
    ) -> Option<&'d LoObject> {
        self.dicts.iter().rev().find_map(|dict| {
            let group = resolve(doc, dict.get(category).ok()?)?.as_dict().ok()?;
            group.get(name).ok()
        })
    }
}

enum FontProgram {
    Embedded(Vec<u8>),
    Registered(Arc<LoadedFont>),
}

impl FontProgram {
    fn bytes(&self) -> &[u8] {
        match self {
            FontProgram::Embedded(data) => data,
            FontProgram::Registered(font) => &font.data,
        }
    }
}

struct PdfFont {
    program: Option<FontProgram>,
    first_char: i64,
    widths: Vec<f32>,
    missing_width: f32,
}

impl PdfFont {
    /// Glyph advance in thousandths of text space.
    fn advance(&self, code: u8, face: Option<&ttf_parser::Face<'_>>) -> f32 {
        let slot = code as i64 - self.first_char;
        if slot >= 0 {
            if let Some(width) = self.widths.get(slot as usize) {
                return *width;
            }
        }
        if let Some(face) = face {
            if let Some(gid) = glyph_for_code(face, code) {
                let upem = face.units_per_em().max(1) as f32;
                if let Some(adv) = face.glyph_hor_advance(gid) {
                    return adv as f32 * 1000.0 / upem;
                }
            }
        }
        if self.missing_width > 0.0 {
            self.missing_width
        } else {
            500.0
        }
    }
}

struct RenderContext<'a> {
    doc: &'a LoDocument,
    fonts: &'a FontRegistry,
    cancel: &'a CancelToken,
    pixmap: Pixmap,
    base: Transform,
    font_cache: HashMap<Vec<u8>, Option<Arc<PdfFont>>>,
    image_cache: HashMap<ObjectId, Option<Arc<Pixmap>>>,
    visited_forms: HashSet<ObjectId>,
}

/// Current path in page space, plus a pending `W`/`W*` clip.
#[derive(Default)]
struct PathState {
    builder: PathBuilder,
    has_path: bool,
    start: Option<(f32, f32)>,
    current: Option<(f32, f32)>,
    pending_clip: Option<FillRule>,
}

impl PathState {
    fn move_to(&mut self, p: (f32, f32)) {
        self.builder.move_to(p.0, p.1);
        self.start = Some(p);
        self.current = Some(p);
        self.has_path = true;
    }

    fn line_to(&mut self, p: (f32, f32)) {
        if self.current.is_none() {
            self.move_to(p);
            return;
        }
        self.builder.line_to(p.0, p.1);
        self.current = Some(p);
    }

    fn cubic_to(&mut self, c1: (f32, f32), c2: (f32, f32), p: (f32, f32)) {
        if self.current.is_none() {
            self.move_to(c1);
        }
        self.builder.cubic_to(c1.0, c1.1, c2.0, c2.1, p.0, p.1);
        self.current = Some(p);
    }

    fn close(&mut self) {
        if self.has_path {
            self.builder.close();
            self.current = self.start;
        }
    }

    fn take(&mut self) -> Option<Path> {
        let had_path = self.has_path;
        self.has_path = false;
        self.start = None;
        self.current = None;
        let builder = std::mem::replace(&mut self.builder, PathBuilder::new());
        if had_path { builder.finish() } else { None }
    }
}

#[derive(Clone, Copy)]
enum PaintMode {
    Fill(FillRule),
    Stroke,
    FillStroke(FillRule),
    None,
}

impl<'a> RenderContext<'a> {
    fn run(
        &mut self,
        operations: &[Operation],
        resources: &mut ResourceStack,
        state: &mut GraphicsState,
    ) -> Result<(), StampError> {
        let mut stack: Vec<GraphicsState> = Vec::new();
        let mut path = PathState::default();
        let mut text_matrix = Matrix::IDENTITY;
        let mut line_matrix = Matrix::IDENTITY;

        for op in operations {
            if self.cancel.is_cancelled() {
                return Err(StampError::Cancelled);
            }
            let ctm = state.ctm;
            match op.operator.as_str() {
                "q" => stack.push(state.clone()),
                "Q" => {
                    if let Some(prev) = stack.pop() {
                        *state = prev;
                    }
                }
                "cm" => {
                    if let Some([a, b, c, d, e, f]) = op_numbers::<6>(op) {
                        state.ctm = Matrix::new(a, b, c, d, e, f).then(state.ctm);
                    }
                }
                "w" => {
                    if let Some(width) = op_number(op, 0) {
                        state.line_width = width.max(0.0);
                    }
                }
                "gs" => {
                    if let Some(name) = op_name(op, 0) {
                        self.apply_ext_gstate(resources, name, state);
                    }
                }
                "g" => set_color(op, &mut state.fill),
                "G" => set_color(op, &mut state.stroke),
                "rg" => set_color(op, &mut state.fill),
                "RG" => set_color(op, &mut state.stroke),
                "k" => set_color(op, &mut state.fill),
                "K" => set_color(op, &mut state.stroke),
                "sc" | "scn" => set_color(op, &mut state.fill),
                "SC" | "SCN" => set_color(op, &mut state.stroke),
                "cs" | "CS" => {}
                "m" => {
                    if let Some([x, y]) = op_numbers::<2>(op) {
                        path.move_to(ctm.apply(x, y));
                    }
                }
                "l" => {
                    if let Some([x, y]) = op_numbers::<2>(op) {
                        path.line_to(ctm.apply(x, y));
                    }
                }
                "c" => {
                    if let Some([x1, y1, x2, y2, x, y]) = op_numbers::<6>(op) {
                        path.cubic_to(ctm.apply(x1, y1), ctm.apply(x2, y2), ctm.apply(x, y));
                    }
                }
                "v" => {
                    if let (Some([x2, y2, x, y]), Some(cur)) = (op_numbers::<4>(op), path.current)
                    {
                        path.cubic_to(cur, ctm.apply(x2, y2), ctm.apply(x, y));
                    }
                }
                "y" => {
                    if let Some([x1, y1, x, y]) = op_numbers::<4>(op) {
                        let end = ctm.apply(x, y);
                        path.cubic_to(ctm.apply(x1, y1), end, end);
                    }
                }
                "re" => {
                    if let Some([x, y, w, h]) = op_numbers::<4>(op) {
                        path.move_to(ctm.apply(x, y));
                        path.line_to(ctm.apply(x + w, y));
                        path.line_to(ctm.apply(x + w, y + h));
                        path.line_to(ctm.apply(x, y + h));
                        path.close();
                    }
                }
                "h" => path.close(),
                "W" => path.pending_clip = Some(FillRule::Winding),
                "W*" => path.pending_clip = Some(FillRule::EvenOdd),
                "f" | "F" => {
                    self.paint_path(&mut path, state, PaintMode::Fill(FillRule::Winding))
                }
                "f*" => {
                    self.paint_path(&mut path, state, PaintMode::Fill(FillRule::EvenOdd))
                }
                "S" => self.paint_path(&mut path, state, PaintMode::Stroke),
                "s" => {
                    path.close();
                    self.paint_path(&mut path, state, PaintMode::Stroke);
                }
                "B" => {
                    self.paint_path(&mut path, state, PaintMode::FillStroke(FillRule::Winding))
                }
                "B*" => {
                    self.paint_path(&mut path, state, PaintMode::FillStroke(FillRule::EvenOdd))
                }
                "b" => {
                    path.close();
                    self.paint_path(&mut path, state, PaintMode::FillStroke(FillRule::Winding));
                }
                "b*" => {
                    path.close();
                    self.paint_path(&mut path, state, PaintMode::FillStroke(FillRule::EvenOdd));
                }
                "n" => self.paint_path(&mut path, state, PaintMode::None),
                "BT" => {
                    text_matrix = Matrix::IDENTITY;
                    line_matrix = Matrix::IDENTITY;
                }
                "ET" => {}
                "Tf" => {
                    if let Some(name) = op_name(op, 0) {
                        state.text.font_key = Some(name.to_vec());
                    }
                    if let Some(size) = op_number(op, 1) {
                        state.text.size = size;
                    }
                }
                "Tc" => {
                    if let Some(v) = op_number(op, 0) {
                        state.text.char_spacing = v;
                    }
                }
                "Tw" => {
                    if let Some(v) = op_number(op, 0) {
                        state.text.word_spacing = v;
                    }
                }
                "Tz" => {
                    if let Some(v) = op_number(op, 0) {
                        state.text.h_scale = v / 100.0;
                    }
                }
                "TL" => {
                    if let Some(v) = op_number(op, 0) {
                        state.text.leading = v;
                    }
                }
                "Ts" => {
                    if let Some(v) = op_number(op, 0) {
                        state.text.rise = v;
                    }
                }
                "Tr" => {
                    if let Some(v) = op.operands.first().and_then(|o| o.as_i64().ok()) {
                        state.text.render_mode = v;
                    }
                }
                "Td" | "TD" => {
                    if let Some([tx, ty]) = op_numbers::<2>(op) {
                        if op.operator == "TD" {
                            state.text.leading = -ty;
                        }
                        line_matrix = Matrix::translation(tx, ty).then(line_matrix);
                        text_matrix = line_matrix;
                    }
                }
                "Tm" => {
                    if let Some([a, b, c, d, e, f]) = op_numbers::<6>(op) {
                        line_matrix = Matrix::new(a, b, c, d, e, f);
                        text_matrix = line_matrix;
                    }
                }
                "T*" => {
                    line_matrix = Matrix::translation(0.0, -state.text.leading).then(line_matrix);
                    text_matrix = line_matrix;
                }
                "Tj" => {
                    if let Some(bytes) = op.operands.first().and_then(|o| o.as_str().ok()) {
                        self.show_text(resources, state, &mut text_matrix, bytes);
                    }
                }
                "'" => {
                    line_matrix = Matrix::translation(0.0, -state.text.leading).then(line_matrix);
                    text_matrix = line_matrix;
                    if let Some(bytes) = op.operands.first().and_then(|o| o.as_str().ok()) {
                        self.show_text(resources, state, &mut text_matrix, bytes);
                    }
                }
                "\"" => {
                    if let (Some(aw), Some(ac)) = (op_number(op, 0), op_number(op, 1)) {
                        state.text.word_spacing = aw;
                        state.text.char_spacing = ac;
                    }
                    line_matrix = Matrix::translation(0.0, -state.text.leading).then(line_matrix);
                    text_matrix = line_matrix;
                    if let Some(bytes) = op.operands.get(2).and_then(|o| o.as_str().ok()) {
                        self.show_text(resources, state, &mut text_matrix, bytes);
                    }
                }
                "TJ" => {
                    let Some(items) = op.operands.first().and_then(|o| o.as_array().ok()) else {
                        continue;
                    };
                    for item in items {
                        if let Ok(bytes) = item.as_str() {
                            self.show_text(resources, state, &mut text_matrix, bytes);
                        } else if let Some(adjust) = obj_to_f32(item) {
                            let tx = -adjust / 1000.0 * state.text.size * state.text.h_scale;
                            text_matrix = Matrix::translation(tx, 0.0).then(text_matrix);
                        }
                    }
                }
                "Do" => {
                    if let Some(name) = op_name(op, 0) {
                        self.draw_xobject(resources, state, name)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn paint_path(&mut self, path: &mut PathState, state: &mut GraphicsState, mode: PaintMode) {
        let clip_rule = path.pending_clip.take();
        let Some(built) = path.take() else {
            return;
        };
        match mode {
            PaintMode::Fill(rule) => self.fill(&built, state, rule),
            PaintMode::Stroke => self.stroke(&built, state),
            PaintMode::FillStroke(rule) => {
                self.fill(&built, state, rule);
                self.stroke(&built, state);
            }
            PaintMode::None => {}
        }
        if let Some(rule) = clip_rule {
            self.intersect_clip(state, &built, rule);
        }
    }

    fn fill(&mut self, path: &Path, state: &GraphicsState, rule: FillRule) {
        let paint = solid_paint(state.fill, state.fill_alpha);
        self.pixmap
            .fill_path(path, &paint, rule, self.base, state.clip.as_ref());
    }

    fn stroke(&mut self, path: &Path, state: &GraphicsState) {
        let paint = solid_paint(state.stroke, state.stroke_alpha);
        let stroke = Stroke {
            // Path points are already in page space.
            width: (state.line_width * state.ctm.mean_scale()).max(0.0),
            ..Stroke::default()
        };
        self.pixmap
            .stroke_path(path, &paint, &stroke, self.base, state.clip.as_ref());
    }

    fn intersect_clip(&mut self, state: &mut GraphicsState, path: &Path, rule: FillRule) {
        if let Some(mask) = state.clip.as_mut() {
            mask.intersect_path(path, rule, true, self.base);
            return;
        }
        let Some(mut mask) = Mask::new(self.pixmap.width(), self.pixmap.height()) else {
            return;
        };
        mask.fill_path(path, rule, true, self.base);
        state.clip = Some(mask);
    }

    fn apply_ext_gstate(&self, resources: &ResourceStack, name: &[u8], state: &mut GraphicsState) {
        let Some(dict) = resources
            .lookup(self.doc, b"ExtGState", name)
            .and_then(|obj| resolve(self.doc, obj))
            .and_then(|obj| obj.as_dict().ok())
        else {
            return;
        };
        if let Some(alpha) = dict.get(b"ca").ok().and_then(obj_to_f32) {
            state.fill_alpha = alpha.clamp(0.0, 1.0);
        }
        if let Some(alpha) = dict.get(b"CA").ok().and_then(obj_to_f32) {
            state.stroke_alpha = alpha.clamp(0.0, 1.0);
        }
        if let Some(width) = dict.get(b"LW").ok().and_then(obj_to_f32) {
            state.line_width = width.max(0.0);
        }
    }

    fn draw_xobject(
        &mut self,
        resources: &mut ResourceStack,
        state: &GraphicsState,
        name: &[u8],
    ) -> Result<(), StampError> {
        let Some(id) = resources
            .lookup(self.doc, b"XObject", name)
            .and_then(|obj| obj.as_reference().ok())
        else {
            return Ok(());
        };
        let Ok(stream) = self.doc.get_object(id).and_then(LoObject::as_stream) else {
            return Ok(());
        };
        let subtype = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|o| o.as_name().ok())
            .unwrap_or_default();

        if subtype == b"Form" {
            if !self.visited_forms.insert(id) {
                log::warn!("form xobject {:?} references itself; skipped", id);
                return Ok(());
            }
            let content = stream
                .get_plain_content()
                .map_err(|e| StampError::Pdf(format!("form xobject {:?}: {e}", id)))?;
            let content = Content::decode(&content)?;
            let matrix = stream
                .dict
                .get(b"Matrix")
                .ok()
                .and_then(parse_matrix)
                .unwrap_or(Matrix::IDENTITY);
            let form_resources = stream
                .dict
                .get(b"Resources")
                .ok()
                .and_then(|obj| resolve(self.doc, obj))
                .and_then(|obj| obj.as_dict().ok())
                .cloned();
            let pushed = form_resources.is_some();
            if let Some(dict) = form_resources {
                resources.push(dict);
            }
            let mut nested = state.clone();
            nested.ctm = matrix.then(state.ctm);
            let result = self.run(&content.operations, resources, &mut nested);
            if pushed {
                resources.pop();
            }
            self.visited_forms.remove(&id);
            return result;
        }

        if subtype == b"Image" {
            let image = match self.image_cache.get(&id) {
                Some(cached) => cached.clone(),
                None => {
                    let decoded = decode_image_xobject(self.doc, stream).map(Arc::new);
                    if decoded.is_none() {
                        log::debug!("image xobject {:?} has an unsupported encoding", id);
                    }
                    self.image_cache.insert(id, decoded.clone());
                    decoded
                }
            };
            if let Some(image) = image {
                self.draw_image(&image, state);
            }
        }
        Ok(())
    }

    fn draw_image(&mut self, image: &Pixmap, state: &GraphicsState) {
        let w = image.width() as f32;
        let h = image.height() as f32;
        // Image space is the unit square with row 0 at the top.
        let unit = Transform::from_row(1.0 / w, 0.0, 0.0, -1.0 / h, 0.0, 1.0);
        let transform = self.base.pre_concat(state.ctm.to_skia()).pre_concat(unit);
        let paint = PixmapPaint {
            opacity: state.fill_alpha,
            quality: FilterQuality::Bilinear,
            ..PixmapPaint::default()
        };
        self.pixmap
            .draw_pixmap(0, 0, image.as_ref(), &paint, transform, state.clip.as_ref());
    }

    fn font_for(&mut self, resources: &ResourceStack, key: &[u8]) -> Option<Arc<PdfFont>> {
        let obj = resources.lookup(self.doc, b"Font", key)?;
        let cache_key = match obj.as_reference() {
            Ok((num, generation)) => format!("ref:{num}:{generation}").into_bytes(),
            Err(_) => key.to_vec(),
        };
        if let Some(cached) = self.font_cache.get(&cache_key) {
            return cached.clone();
        }
        let font = resolve(self.doc, obj)
            .and_then(|o| o.as_dict().ok())
            .map(|dict| Arc::new(load_pdf_font(self.doc, dict, self.fonts)));
        self.font_cache.insert(cache_key, font.clone());
        font
    }

    fn show_text(
        &mut self,
        resources: &ResourceStack,
        state: &GraphicsState,
        text_matrix: &mut Matrix,
        bytes: &[u8],
    ) {
        let text = &state.text;
        let font = text
            .font_key
            .as_deref()
            .and_then(|key| self.font_for(resources, key));
        let face = font
            .as_ref()
            .and_then(|f| f.program.as_ref())
            .and_then(|p| ttf_parser::Face::parse(p.bytes(), 0).ok());
        let visible = !matches!(text.render_mode, 3 | 7);
        let paint = solid_paint(state.fill, state.fill_alpha);

        for &code in bytes {
            let advance = font
                .as_ref()
                .map(|f| f.advance(code, face.as_ref()))
                .unwrap_or(500.0);
            if visible {
                if let Some(face) = face.as_ref() {
                    let upem = face.units_per_em().max(1) as f32;
                    let glyph_space = Matrix::new(
                        text.size * text.h_scale / upem,
                        0.0,
                        0.0,
                        text.size / upem,
                        0.0,
                        text.rise,
                    );
                    let to_page = glyph_space.then(*text_matrix).then(state.ctm);
                    if let Some(gid) = glyph_for_code(face, code) {
                        let mut builder = GlyphPathBuilder::new(to_page.to_skia());
                        if face.outline_glyph(gid, &mut builder).is_some() {
                            if let Some(path) = builder.finish() {
                                self.pixmap.fill_path(
                                    &path,
                                    &paint,
                                    FillRule::Winding,
                                    self.base,
                                    state.clip.as_ref(),
                                );
                            }
                        }
                    }
                }
            }
            let mut tx = advance / 1000.0 * text.size + text.char_spacing;
            if code == b' ' {
                tx += text.word_spacing;
            }
            *text_matrix = Matrix::translation(tx * text.h_scale, 0.0).then(*text_matrix);
        }
    }
}

/// Single-byte codes read as Latin-1, then the symbolic (0xF000) range.
fn glyph_for_code(face: &ttf_parser::Face<'_>, code: u8) -> Option<GlyphId> {
    face.glyph_index(code as char)
        .or_else(|| char::from_u32(0xF000 + code as u32).and_then(|c| face.glyph_index(c)))
}

fn load_pdf_font(doc: &LoDocument, dict: &LoDictionary, registry: &FontRegistry) -> PdfFont {
    let base_font = dict
        .get(b"BaseFont")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(|n| String::from_utf8_lossy(n).into_owned())
        .unwrap_or_else(|| "Helvetica".to_string());
    let first_char = dict
        .get(b"FirstChar")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .unwrap_or(0);
    let widths = dict
        .get(b"Widths")
        .ok()
        .and_then(|o| resolve(doc, o))
        .and_then(|o| o.as_array().ok())
        .map(|arr| {
            arr.iter()
                .map(|w| resolve(doc, w).and_then(obj_to_f32).unwrap_or(0.0))
                .collect()
        })
        .unwrap_or_default();
    let descriptor = dict
        .get(b"FontDescriptor")
        .ok()
        .and_then(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok());
    let missing_width = descriptor
        .and_then(|d| d.get(b"MissingWidth").ok())
        .and_then(obj_to_f32)
        .unwrap_or(0.0);

    let embedded = descriptor.and_then(|d| embedded_font_program(doc, d));
    let program = match embedded {
        Some(data) => Some(FontProgram::Embedded(data)),
        None => registry
            .resolve_pdf_font(&base_font)
            .map(FontProgram::Registered),
    };
    if program.is_none() {
        log::warn!("no font program for {base_font}; its text is not drawn");
    }
    PdfFont {
        program,
        first_char,
        widths,
        missing_width,
    }
}

fn embedded_font_program(doc: &LoDocument, descriptor: &LoDictionary) -> Option<Vec<u8>> {
    for key in [b"FontFile2".as_slice(), b"FontFile3".as_slice()] {
        let Some(stream) = descriptor
            .get(key)
            .ok()
            .and_then(|o| resolve(doc, o))
            .and_then(|o| o.as_stream().ok())
        else {
            continue;
        };
        let Ok(data) = stream.get_plain_content() else {
            continue;
        };
        if ttf_parser::Face::parse(&data, 0).is_ok() {
            return Some(data);
        }
    }
    None
}

#[derive(Clone, Copy)]
enum ColorModel {
    Gray,
    Rgb,
    Cmyk,
}

impl ColorModel {
    fn channels(self) -> usize {
        match self {
            ColorModel::Gray => 1,
            ColorModel::Rgb => 3,
            ColorModel::Cmyk => 4,
        }
    }

    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"DeviceGray" | b"G" | b"CalGray" => Some(ColorModel::Gray),
            b"DeviceRGB" | b"RGB" | b"CalRGB" => Some(ColorModel::Rgb),
            b"DeviceCMYK" | b"CMYK" => Some(ColorModel::Cmyk),
            _ => None,
        }
    }

    fn rgb(self, px: &[u8]) -> [u8; 3] {
        match self {
            ColorModel::Gray => [px[0], px[0], px[0]],
            ColorModel::Rgb => [px[0], px[1], px[2]],
            ColorModel::Cmyk => {
                let k = 255 - px[3] as u16;
                let ch = |v: u8| ((255 - v as u16) * k / 255) as u8;
                [ch(px[0]), ch(px[1]), ch(px[2])]
            }
        }
    }
}

enum ImageColorSpace {
    Direct(ColorModel),
    Indexed { base: ColorModel, lookup: Vec<u8> },
}

fn image_color_space(doc: &LoDocument, obj: &LoObject) -> Option<ImageColorSpace> {
    match resolve(doc, obj)? {
        LoObject::Name(name) => ColorModel::from_name(name).map(ImageColorSpace::Direct),
        LoObject::Array(arr) => {
            let head = resolve(doc, arr.first()?)?.as_name().ok()?;
            if let Some(model) = ColorModel::from_name(head) {
                return Some(ImageColorSpace::Direct(model));
            }
            match head {
                b"ICCBased" => {
                    let stream = resolve(doc, arr.get(1)?)?.as_stream().ok()?;
                    let n = stream.dict.get(b"N").ok()?.as_i64().ok()?;
                    let model = match n {
                        1 => ColorModel::Gray,
                        3 => ColorModel::Rgb,
                        4 => ColorModel::Cmyk,
                        _ => return None,
                    };
                    Some(ImageColorSpace::Direct(model))
                }
                b"Indexed" | b"I" => {
                    let base = match image_color_space(doc, arr.get(1)?)? {
                        ImageColorSpace::Direct(model) => model,
                        ImageColorSpace::Indexed { .. } => return None,
                    };
                    let lookup = match resolve(doc, arr.get(3)?)? {
                        LoObject::String(bytes, _) => bytes.clone(),
                        LoObject::Stream(stream) => stream.get_plain_content().ok()?,
                        _ => return None,
                    };
                    Some(ImageColorSpace::Indexed { base, lookup })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn dict_u32(dict: &LoDictionary, key: &[u8]) -> Option<u32> {
    dict.get(key)
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
}

fn decode_image_xobject(doc: &LoDocument, stream: &lopdf::Stream) -> Option<Pixmap> {
    let width = dict_u32(&stream.dict, b"Width")?;
    let height = dict_u32(&stream.dict, b"Height")?;
    let filters = stream.filters().unwrap_or_default();

    let mut rgba = if filters.iter().any(|f| *f == b"DCTDecode") {
        if filters.len() != 1 {
            return None;
        }
        image::load_from_memory_with_format(&stream.content, image::ImageFormat::Jpeg)
            .ok()?
            .to_rgba8()
            .into_raw()
    } else if filters.iter().any(|f| *f == b"JPXDecode") {
        return None;
    } else {
        let bpc = dict_u32(&stream.dict, b"BitsPerComponent").unwrap_or(8);
        if bpc != 8 {
            return None;
        }
        let plain = stream.get_plain_content().ok()?;
        let space = match stream.dict.get(b"ColorSpace") {
            Ok(obj) => image_color_space(doc, obj)?,
            Err(_) => ImageColorSpace::Direct(ColorModel::Gray),
        };
        raw_samples_to_rgba(&plain, width, height, &space)?
    };

    if rgba.len() != (width as usize) * (height as usize) * 4 {
        return None;
    }
    if let Some(alpha) = soft_mask(doc, stream, width, height) {
        for (px, a) in rgba.chunks_exact_mut(4).zip(alpha) {
            px[3] = a;
        }
    }
    rgba_to_pixmap(&rgba, width, height)
}

fn raw_samples_to_rgba(
    plain: &[u8],
    width: u32,
    height: u32,
    space: &ImageColorSpace,
) -> Option<Vec<u8>> {
    let pixels = (width as usize) * (height as usize);
    let channels = match space {
        ImageColorSpace::Direct(model) => model.channels(),
        ImageColorSpace::Indexed { .. } => 1,
    };
    if plain.len() < pixels * channels {
        return None;
    }
    let mut out = Vec::with_capacity(pixels * 4);
    for sample in plain.chunks_exact(channels).take(pixels) {
        let rgb = match space {
            ImageColorSpace::Direct(model) => model.rgb(sample),
            ImageColorSpace::Indexed { base, lookup } => {
                let n = base.channels();
                let offset = sample[0] as usize * n;
                let entry = lookup.get(offset..offset + n)?;
                base.rgb(entry)
            }
        };
        out.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
    }
    Some(out)
}

fn soft_mask(
    doc: &LoDocument,
    stream: &lopdf::Stream,
    width: u32,
    height: u32,
) -> Option<Vec<u8>> {
    let mask = resolve(doc, stream.dict.get(b"SMask").ok()?)?.as_stream().ok()?;
    if dict_u32(&mask.dict, b"Width")? != width || dict_u32(&mask.dict, b"Height")? != height {
        return None;
    }
    let data = mask.get_plain_content().ok()?;
    let expected = (width as usize) * (height as usize);
    if data.len() < expected {
        return None;
    }
    Some(data[..expected].to_vec())
}

fn page_resources(doc: &LoDocument, mut id: ObjectId) -> Option<LoDictionary> {
    loop {
        let dict = doc.get_object(id).ok()?.as_dict().ok()?;
        if let Some(resources) = dict
            .get(b"Resources")
            .ok()
            .and_then(|o| resolve(doc, o))
            .and_then(|o| o.as_dict().ok())
        {
            return Some(resources.clone());
        }
        id = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
}

fn resolve<'d>(doc: &'d LoDocument, mut obj: &'d LoObject) -> Option<&'d LoObject> {
    for _ in 0..32 {
        match obj {
            LoObject::Reference(id) => obj = doc.get_object(*id).ok()?,
            other => return Some(other),
        }
    }
    None
}

fn parse_matrix(obj: &LoObject) -> Option<Matrix> {
    let arr = obj.as_array().ok()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Matrix::new(
        obj_to_f32(&arr[0])?,
        obj_to_f32(&arr[1])?,
        obj_to_f32(&arr[2])?,
        obj_to_f32(&arr[3])?,
        obj_to_f32(&arr[4])?,
        obj_to_f32(&arr[5])?,
    ))
}

fn set_color(op: &Operation, target: &mut Color) {
    let values: Vec<f32> = op.operands.iter().filter_map(obj_to_f32).collect();
    *target = match values.as_slice() {
        [g] => Color::rgb(*g, *g, *g),
        [r, g, b] => Color::rgb(*r, *g, *b),
        [c, m, y, k] => Color::rgb(
            (1.0 - c) * (1.0 - k),
            (1.0 - m) * (1.0 - k),
            (1.0 - y) * (1.0 - k),
        ),
        _ => return,
    };
}

fn solid_paint(color: Color, alpha: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(color.to_skia(alpha));
    paint.anti_alias = true;
    paint
}

fn op_name(op: &Operation, idx: usize) -> Option<&[u8]> {
    op.operands.get(idx)?.as_name().ok()
}

fn op_number(op: &Operation, idx: usize) -> Option<f32> {
    obj_to_f32(op.operands.get(idx)?)
}

fn op_numbers<const N: usize>(op: &Operation) -> Option<[f32; N]> {
    let mut out = [0.0f32; N];
    for (idx, slot) in out.iter_mut().enumerate() {
        *slot = op_number(op, idx)?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::make_pdf;
    use lopdf::{Stream as LoStream, dictionary};

    fn rasterizer() -> LopdfRasterizer {
        let mut fonts = FontRegistry::new();
        fonts.set_system_fallback(false);
        LopdfRasterizer::new(Arc::new(fonts))
    }

    fn rgba_at(pixmap: &Pixmap, x: u32, y: u32) -> [u8; 4] {
        let px = pixmap.pixel(x, y).unwrap().demultiply();
        [px.red(), px.green(), px.blue(), px.alpha()]
    }

    #[test]
    fn text_operators_draw_glyphs_with_a_registered_font() {
        let Some(fonts) = crate::font::tests::registry_with_host_font() else {
            return;
        };
        let resources = dictionary! {
            "Font" => dictionary! {
                "F1" => dictionary! {
                    "Type" => "Font",
                    "Subtype" => "Type1",
                    "BaseFont" => "Helvetica",
                },
            },
        };
        let pdf = crate::document::tests::make_pdf_with(
            &[[0, 0, 100, 100]],
            "0 g BT /F1 12 Tf 10 10 Td (A) Tj ET",
            resources,
        );
        let mut r = LopdfRasterizer::new(Arc::new(fonts));
        r.load(pdf).unwrap();
        let pixmap = r
            .rasterize(PageRef::FIRST, 2.0, &CancelToken::new())
            .unwrap();
        // Baseline at y=10pt sits on row 180 at this scale; the glyph is
        // at most 12pt tall and starts right of x=10pt.
        let mut inked = 0;
        for y in 0..pixmap.height() {
            for x in 0..pixmap.width() {
                let [red, ..] = rgba_at(&pixmap, x, y);
                if red < 128 {
                    inked += 1;
                    assert!((18..=60).contains(&x), "ink at column {x}");
                    assert!((150..=182).contains(&y), "ink at row {y}");
                }
            }
        }
        assert!(inked > 20, "only {inked} inked pixels");
    }

    #[test]
    fn raster_size_is_floored() {
        assert_eq!(raster_size(Size::new(612.0, 792.0), 1.5), (918, 1188));
        assert_eq!(raster_size(Size::new(595.3, 841.9), 1.5), (892, 1262));
    }

    #[test]
    fn blank_page_renders_white_at_scale() {
        let mut r = rasterizer();
        let count = r.load(make_pdf(&[(200, 100)], "")).unwrap();
        assert_eq!(count, 1);
        assert_eq!(r.page_size(PageRef::FIRST).unwrap(), Size::new(200.0, 100.0));
        let pixmap = r
            .rasterize(PageRef::FIRST, 1.5, &CancelToken::new())
            .unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (300, 150));
        assert_eq!(rgba_at(&pixmap, 10, 10), [255, 255, 255, 255]);
    }

    #[test]
    fn filled_rect_lands_with_y_flipped() {
        let mut r = rasterizer();
        // Red square in the bottom-left quarter of a 100x100 page.
        r.load(make_pdf(&[(100, 100)], "1 0 0 rg 0 0 50 50 re f"))
            .unwrap();
        let pixmap = r
            .rasterize(PageRef::FIRST, 1.0, &CancelToken::new())
            .unwrap();
        assert_eq!(rgba_at(&pixmap, 25, 75), [255, 0, 0, 255]);
        assert_eq!(rgba_at(&pixmap, 25, 25), [255, 255, 255, 255]);
        assert_eq!(rgba_at(&pixmap, 75, 75), [255, 255, 255, 255]);
    }

    #[test]
    fn cm_and_restore_apply_in_order() {
        let mut r = rasterizer();
        let content = "q 1 0 0 1 50 50 cm 0 0 1 rg 0 0 50 50 re f Q 0 g 0 0 10 10 re f";
        r.load(make_pdf(&[(100, 100)], content)).unwrap();
        let pixmap = r
            .rasterize(PageRef::FIRST, 1.0, &CancelToken::new())
            .unwrap();
        assert_eq!(rgba_at(&pixmap, 75, 25), [0, 0, 255, 255]);
        assert_eq!(rgba_at(&pixmap, 5, 95), [0, 0, 0, 255]);
    }

    #[test]
    fn clip_limits_later_fills() {
        let mut r = rasterizer();
        let content = "0 0 50 100 re W n 0 1 0 rg 0 0 100 100 re f";
        r.load(make_pdf(&[(100, 100)], content)).unwrap();
        let pixmap = r
            .rasterize(PageRef::FIRST, 1.0, &CancelToken::new())
            .unwrap();
        assert_eq!(rgba_at(&pixmap, 20, 50), [0, 255, 0, 255]);
        assert_eq!(rgba_at(&pixmap, 80, 50), [255, 255, 255, 255]);
    }

    #[test]
    fn cancelled_token_aborts_rasterization() {
        let mut r = rasterizer();
        r.load(make_pdf(&[(100, 100)], "0 0 10 10 re f")).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = r.rasterize(PageRef::FIRST, 1.0, &token).unwrap_err();
        assert!(matches!(err, StampError::Cancelled));
    }

    #[test]
    fn raw_rgb_image_keeps_top_row_on_top() {
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        // 1x2 image: red on top, blue below.
        let image_id = doc.add_object(LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 2,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![255, 0, 0, 0, 0, 255],
        ));
        let content_id = doc.add_object(LoStream::new(
            dictionary! {},
            b"q 100 0 0 100 0 0 cm /Im1 Do Q".to_vec(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "XObject" => dictionary! { "Im1" => image_id } },
            "MediaBox" => vec![0.into(), 0.into(), 100.into(), 100.into()],
        });
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();

        let mut r = rasterizer();
        r.load(bytes).unwrap();
        let pixmap = r
            .rasterize(PageRef::FIRST, 1.0, &CancelToken::new())
            .unwrap();
        let top = rgba_at(&pixmap, 50, 10);
        let bottom = rgba_at(&pixmap, 50, 90);
        assert!(top[0] > top[2], "top sample {:?}", top);
        assert!(bottom[2] > bottom[0], "bottom sample {:?}", bottom);
    }

    #[test]
    fn unsupported_page_is_an_error() {
        let r = rasterizer();
        assert!(r.page_size(PageRef::FIRST).is_err());
    }

    #[test]
    fn matrix_then_applies_left_first() {
        let scale = Matrix::new(2.0, 0.0, 0.0, 2.0, 0.0, 0.0);
        let shift = Matrix::translation(10.0, 0.0);
        assert_eq!(scale.then(shift).apply(1.0, 1.0), (12.0, 2.0));
        assert_eq!(shift.then(scale).apply(1.0, 1.0), (22.0, 2.0));
    }
}
