//! Stamp a logo, a name and the current date onto a PDF page.
//!
//! A [`StampSession`] holds the master document, renders page previews and
//! tracks where the user drags the stamp. [`StampSession::export`] maps the
//! preview placement back into PDF user space and embeds a high-resolution
//! stamp image into a fresh copy of the master.

mod base_image;
mod config;
mod debug;
mod document;
mod error;
mod export;
mod font;
mod mapping;
mod placement;
mod preview;
mod raster;
mod session;
mod stamp;
mod text;
mod types;

pub use base_image::BaseImage;
pub use config::{DEFAULT_RENDER_SCALE, StampSessionBuilder};
pub use document::{
    EXPORT_SUFFIX, FileSource, MasterDocument, PDF_MIME, PageBox, PageCursor, PageJump, PageRef,
    PathSource, SourceFile, export_file_name,
};
pub use error::{ErrorKind, GENERIC_FAILURE_MESSAGE, StampError};
pub use export::ExportedPdf;
pub use font::FontFamily;
pub use mapping::ViewportMapping;
pub use placement::{DEFAULT_PLACEMENT, DragState, Placement, PlacementController};
pub use preview::{PreviewRenderer, RenderOutcome, RenderTicket, RenderedPage};
pub use raster::{CancelToken, PageRasterizer, raster_size};
pub use session::StampSession;
pub use stamp::{
    Clock, DEFAULT_DISPLAY_WIDTH, DEFAULT_FONT_SIZE, DEFAULT_NAME, DEFAULT_UTC_OFFSET_HOURS,
    FixedClock, MAX_DISPLAY_WIDTH, MAX_FONT_SIZE, MAX_STAMP_PIXELS, MIN_DISPLAY_WIDTH, MIN_FONT_SIZE,
    NAME_PLACEHOLDER, StampBitmap, StampDescriptor, SystemClock, TEXT_PAD_BOTTOM, TEXT_PAD_TOP,
    format_date,
};
pub use types::{Color, DocRect, Point, Size};

pub use tiny_skia::Pixmap;
