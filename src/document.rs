use crate::error::StampError;
use crate::types::Size;
use base64::Engine;
use lopdf::{Document as LoDocument, Object as LoObject, ObjectId};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

pub const PDF_MIME: &str = "application/pdf";
pub const EXPORT_SUFFIX: &str = "-revisado";

/// Raw bytes handed over by the host, plus the stem used to name the export.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub bytes: Vec<u8>,
    pub stem: String,
}

impl SourceFile {
    pub fn new(bytes: Vec<u8>, stem: impl Into<String>) -> Self {
        Self {
            bytes,
            stem: stem.into(),
        }
    }

    /// Decodes a `data:<mime>;base64,<payload>` URL, the form image pickers
    /// usually hand back.
    pub fn from_data_uri(uri: &str, stem: impl Into<String>) -> Result<Self, StampError> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| StampError::Image("not a data: url".to_string()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| StampError::Image("data: url without payload".to_string()))?;
        let bytes = if header.ends_with(";base64") {
            base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| StampError::Image(format!("base64 decode failed: {e}")))?
        } else {
            payload.as_bytes().to_vec()
        };
        Ok(Self::new(bytes, stem))
    }
}

/// Supplies the bytes of a user-selected file.
pub trait FileSource {
    fn read(&self) -> Result<SourceFile, StampError>;
}

pub struct PathSource {
    path: PathBuf,
}

impl PathSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FileSource for PathSource {
    fn read(&self) -> Result<SourceFile, StampError> {
        let bytes = std::fs::read(&self.path)?;
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(SourceFile::new(bytes, stem))
    }
}

pub fn export_file_name(stem: &str) -> String {
    let stem = stem.trim();
    let stem = stem.strip_suffix(".pdf").unwrap_or(stem);
    let stem = if stem.is_empty() { "documento" } else { stem };
    format!("{stem}{EXPORT_SUFFIX}.pdf")
}

/// Physical page box in document units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageBox {
    pub origin_x: f32,
    pub origin_y: f32,
    pub size: Size,
}

/// The pristine copy of the loaded PDF. The bytes are never handed to a
/// consumer directly; renderers and writers get `clone_for_consumption()`.
#[derive(Debug, Clone)]
pub struct MasterDocument {
    bytes: Arc<[u8]>,
    pages: Vec<PageBox>,
    stem: String,
    fingerprint: String,
}

impl MasterDocument {
    pub fn load(source: SourceFile) -> Result<Self, StampError> {
        let doc = LoDocument::load_mem(&source.bytes)?;
        if doc.is_encrypted() {
            return Err(StampError::Pdf("document is encrypted".to_string()));
        }
        let pages = page_boxes(&doc)?;
        if pages.is_empty() {
            return Err(StampError::Pdf("document has no pages".to_string()));
        }
        let fingerprint = sha256_hex(&source.bytes);
        Ok(Self {
            bytes: Arc::from(source.bytes),
            pages,
            stem: source.stem,
            fingerprint,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_box(&self, page: PageRef) -> PageBox {
        self.pages[page.clamped_index(self.pages.len())]
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clone_for_consumption(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

pub(crate) fn page_boxes(doc: &LoDocument) -> Result<Vec<PageBox>, StampError> {
    doc.get_pages()
        .values()
        .map(|id| page_box_for_id(doc, *id))
        .collect()
}

/// Walks up the page tree until a MediaBox is found; missing boxes fall back
/// to US Letter.
pub(crate) fn page_box_for_id(doc: &LoDocument, mut id: ObjectId) -> Result<PageBox, StampError> {
    loop {
        let dict = doc.get_object(id)?.as_dict()?;
        if let Ok(obj) = dict.get(b"MediaBox") {
            let resolved = match obj {
                LoObject::Reference(r) => doc.get_object(*r)?,
                other => other,
            };
            if let Some(page_box) = resolved.as_array().ok().and_then(|a| parse_media_box(a)) {
                return Ok(page_box);
            }
        }
        id = match dict.get(b"Parent").and_then(LoObject::as_reference) {
            Ok(parent_id) => parent_id,
            Err(_) => break,
        };
    }
    Ok(PageBox {
        origin_x: 0.0,
        origin_y: 0.0,
        size: Size::letter(),
    })
}

fn parse_media_box(arr: &[LoObject]) -> Option<PageBox> {
    if arr.len() < 4 {
        return None;
    }
    let x0 = obj_to_f32(&arr[0])?;
    let y0 = obj_to_f32(&arr[1])?;
    let x1 = obj_to_f32(&arr[2])?;
    let y1 = obj_to_f32(&arr[3])?;
    Some(PageBox {
        origin_x: x0.min(x1),
        origin_y: y0.min(y1),
        size: Size::new((x1 - x0).abs().max(1.0), (y1 - y0).abs().max(1.0)),
    })
}

pub(crate) fn obj_to_f32(obj: &LoObject) -> Option<f32> {
    if let Ok(v) = obj.as_float() {
        return Some(v);
    }
    obj.as_i64().ok().map(|v| v as f32)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// 1-based page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageRef(usize);

impl PageRef {
    pub const FIRST: PageRef = PageRef(1);

    pub fn clamped(number: usize, page_count: usize) -> Self {
        PageRef(number.clamp(1, page_count.max(1)))
    }

    pub fn number(self) -> usize {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 - 1
    }

    fn clamped_index(self, page_count: usize) -> usize {
        self.index().min(page_count.saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageJump {
    pub page: PageRef,
    pub changed: bool,
    /// Value the page field should show afterwards.
    pub display: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    current: PageRef,
    count: usize,
}

impl PageCursor {
    pub fn new(count: usize) -> Self {
        Self {
            current: PageRef::FIRST,
            count: count.max(1),
        }
    }

    pub fn current(&self) -> PageRef {
        self.current
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn needs_navigation(&self) -> bool {
        self.count > 1
    }

    pub fn next(&mut self) -> bool {
        self.go_to(self.current.number() + 1)
    }

    pub fn prev(&mut self) -> bool {
        self.go_to(self.current.number().saturating_sub(1))
    }

    fn go_to(&mut self, number: usize) -> bool {
        let target = PageRef::clamped(number, self.count);
        let changed = target != self.current;
        self.current = target;
        changed
    }

    /// Free-text jump. Anything that is not a page number in
    /// `[1, count]` reverts to the current page.
    pub fn jump(&mut self, input: &str) -> PageJump {
        let parsed = input
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 1 && (*n as u64) <= self.count as u64);
        let changed = match parsed {
            Some(n) => {
                let target = PageRef(n as usize);
                let changed = target != self.current;
                self.current = target;
                changed
            }
            None => false,
        };
        PageJump {
            page: self.current,
            changed,
            display: self.current.number().to_string(),
        }
    }
}
