use crate::document::{MasterDocument, PDF_MIME, PageRef, export_file_name, page_box_for_id};
use crate::error::StampError;
use crate::font::FontRegistry;
use crate::mapping::ViewportMapping;
use crate::placement::Placement;
use crate::stamp::{StampBitmap, StampDescriptor, build_stamp};
use crate::types::{DocRect, Size};
use lopdf::{
    Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId,
    Stream as LoStream, dictionary,
};
use rayon::prelude::*;

const XOBJECT_BASE_NAME: &str = "StampIm";

/// Everything one export reads. Nothing here is mutated.
pub(crate) struct ExportRequest<'a> {
    pub(crate) master: Option<&'a MasterDocument>,
    pub(crate) page: PageRef,
    pub(crate) descriptor: &'a StampDescriptor,
    pub(crate) preview_stamp: Option<&'a StampBitmap>,
    pub(crate) placement: Placement,
    pub(crate) canvas_size: Option<Size>,
    pub(crate) device_density: f32,
    pub(crate) fonts: &'a FontRegistry,
}

#[derive(Debug, Clone)]
pub struct ExportedPdf {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime: &'static str,
    pub document_rect: DocRect,
    pub pixel_ratio: f32,
    pub source_fingerprint: String,
}

pub(crate) fn export_document(request: ExportRequest<'_>) -> Result<ExportedPdf, StampError> {
    let master = request.master.ok_or(StampError::MissingDocument)?;
    let preview_stamp = request.preview_stamp.ok_or(StampError::MissingStamp)?;
    let canvas_size = request
        .canvas_size
        .ok_or_else(|| StampError::Raster("no preview canvas to map from".to_string()))?;

    let mut doc = LoDocument::load_mem(&master.clone_for_consumption())?;
    if doc.is_encrypted() {
        return Err(StampError::Pdf("document is encrypted".to_string()));
    }
    let page_id = *doc
        .get_pages()
        .get(&(request.page.number() as u32))
        .ok_or_else(|| {
            StampError::Pdf(format!("page {} not in document", request.page.number()))
        })?;
    let page_box = page_box_for_id(&doc, page_id)?;

    let mapping = ViewportMapping::new(page_box.size, canvas_size)?;
    let pixel_ratio = mapping.export_pixel_ratio(request.device_density);
    // The builder may lower the ratio to stay within its pixel budget.
    let hi_res = build_stamp(request.descriptor, pixel_ratio, request.fonts)?;
    let pixel_ratio = hi_res.pixel_ratio;
    let rect = mapping.to_document(request.placement.as_point(), preview_stamp.logical_size());

    let image_id = embed_stamp_image(&mut doc, &hi_res);
    let name = attach_xobject(&mut doc, page_id, image_id)?;
    let draw = format!(
        "q {:.4} 0 0 {:.4} {:.4} {:.4} cm /{} Do Q\n",
        rect.width,
        rect.height,
        rect.x + page_box.origin_x as f64,
        rect.y + page_box.origin_y as f64,
        name
    );
    wrap_page_contents(&mut doc, page_id, draw.into_bytes())?;

    doc.compress();
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    log::info!(
        "exported page {} with stamp at ({:.2}, {:.2}) {:.2}x{:.2}pt, ratio {}",
        request.page.number(),
        rect.x,
        rect.y,
        rect.width,
        rect.height,
        pixel_ratio
    );

    Ok(ExportedPdf {
        bytes,
        file_name: export_file_name(master.stem()),
        mime: PDF_MIME,
        document_rect: rect,
        pixel_ratio,
        source_fingerprint: master.fingerprint().to_string(),
    })
}

/// Adds the stamp as a DeviceRGB image with a DeviceGray soft mask.
fn embed_stamp_image(doc: &mut LoDocument, stamp: &StampBitmap) -> ObjectId {
    let width = stamp.pixmap.width() as i64;
    let height = stamp.pixmap.height() as i64;
    let (rgb, alpha) = split_alpha(stamp.pixmap.data());

    let smask_id = doc.add_object(LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width,
            "Height" => height,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        alpha,
    ));
    doc.add_object(LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width,
            "Height" => height,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => smask_id,
        },
        rgb,
    ))
}

/// Premultiplied RGBA to straight RGB plus an alpha plane.
fn split_alpha(premultiplied: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let (rgb, alpha): (Vec<[u8; 3]>, Vec<u8>) = premultiplied
        .par_chunks_exact(4)
        .map(|px| {
            let a = px[3];
            let un = |c: u8| crate::base_image::unpremul_u8(c, a);
            ([un(px[0]), un(px[1]), un(px[2])], a)
        })
        .unzip();
    (rgb.concat(), alpha)
}

fn inherited_resources(doc: &LoDocument, mut id: ObjectId) -> LoDictionary {
    loop {
        let Ok(dict) = doc.get_object(id).and_then(LoObject::as_dict) else {
            return LoDictionary::new();
        };
        match dict.get(b"Resources") {
            Ok(LoObject::Dictionary(d)) => return d.clone(),
            Ok(LoObject::Reference(rid)) => {
                return doc
                    .get_object(*rid)
                    .ok()
                    .and_then(|o| o.as_dict().ok())
                    .cloned()
                    .unwrap_or_default();
            }
            _ => {}
        }
        id = match dict.get(b"Parent").and_then(LoObject::as_reference) {
            Ok(parent) => parent,
            Err(_) => return LoDictionary::new(),
        };
    }
}

/// Registers the image under a name unused on this page; the page gets its
/// own resource dictionary so shared ones stay untouched.
fn attach_xobject(
    doc: &mut LoDocument,
    page_id: ObjectId,
    image_id: ObjectId,
) -> Result<String, StampError> {
    let mut resources = inherited_resources(doc, page_id);
    let mut xobjects = match resources.get(b"XObject") {
        Ok(LoObject::Dictionary(d)) => d.clone(),
        Ok(LoObject::Reference(id)) => doc
            .get_object(*id)
            .ok()
            .and_then(|o| o.as_dict().ok())
            .cloned()
            .unwrap_or_default(),
        _ => LoDictionary::new(),
    };
    let name = unused_name(&xobjects);
    xobjects.set(name.as_bytes().to_vec(), LoObject::Reference(image_id));
    resources.set("XObject", LoObject::Dictionary(xobjects));

    let page = doc.get_object_mut(page_id).and_then(LoObject::as_dict_mut)?;
    page.set("Resources", LoObject::Dictionary(resources));
    Ok(name)
}

fn unused_name(xobjects: &LoDictionary) -> String {
    if !xobjects.has(XOBJECT_BASE_NAME.as_bytes()) {
        return XOBJECT_BASE_NAME.to_string();
    }
    (1..)
        .map(|n| format!("{XOBJECT_BASE_NAME}{n}"))
        .find(|candidate| !xobjects.has(candidate.as_bytes()))
        .unwrap_or_else(|| XOBJECT_BASE_NAME.to_string())
}

/// Brackets the existing page content in `q … Q` so an unbalanced graphics
/// state cannot leak into the stamp, then appends `draw`.
fn wrap_page_contents(
    doc: &mut LoDocument,
    page_id: ObjectId,
    draw: Vec<u8>,
) -> Result<(), StampError> {
    let existing: Vec<LoObject> = {
        let page = doc.get_object(page_id).and_then(LoObject::as_dict)?;
        match page.get(b"Contents") {
            Ok(LoObject::Array(items)) => items.clone(),
            Ok(obj @ LoObject::Reference(_)) => vec![obj.clone()],
            _ => Vec::new(),
        }
    };
    let open_id = doc.add_object(LoStream::new(dictionary! {}, b"q\n".to_vec()));
    let mut closing = b"\nQ\n".to_vec();
    closing.extend_from_slice(&draw);
    let close_id = doc.add_object(LoStream::new(dictionary! {}, closing));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(LoObject::Reference(open_id));
    contents.extend(existing);
    contents.push(LoObject::Reference(close_id));

    let page = doc.get_object_mut(page_id).and_then(LoObject::as_dict_mut)?;
    page.set("Contents", LoObject::Array(contents));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_image::BaseImage;
    use crate::document::SourceFile;
    use crate::document::tests::make_pdf;
    use crate::stamp::FixedClock;
    use chrono::NaiveDate;
    use lopdf::content::Content;
    use std::sync::Arc;

    fn no_fonts() -> FontRegistry {
        let mut fonts = FontRegistry::new();
        fonts.set_system_fallback(false);
        fonts
    }

    fn descriptor() -> StampDescriptor {
        let clock = FixedClock(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        let mut descriptor = StampDescriptor::new(&clock);
        let pixmap =
            crate::base_image::rgba_to_pixmap(&[10, 20, 30, 128].repeat(320 * 180), 320, 180)
                .unwrap();
        descriptor.base_image = Some(Arc::new(BaseImage::from_pixmap(pixmap)));
        descriptor.display_width = 160.0;
        descriptor
    }

    fn master(content: &str) -> MasterDocument {
        MasterDocument::load(SourceFile::new(make_pdf(&[(612, 792)], content), "acta.pdf"))
            .unwrap()
    }

    fn stamp_ops(bytes: &[u8]) -> (LoDocument, Vec<lopdf::content::Operation>) {
        let doc = LoDocument::load_mem(bytes).unwrap();
        let page_id = *doc.get_pages().get(&1).unwrap();
        let content = Content::decode(&doc.get_page_content(page_id).unwrap()).unwrap();
        (doc, content.operations)
    }

    #[test]
    fn export_places_stamp_at_mapped_rect() {
        let master = master("0 0 1 rg 10 10 50 50 re f");
        let descriptor = descriptor();
        let fonts = no_fonts();
        let preview = build_stamp(&descriptor, 1.0, &fonts).unwrap();
        let out = export_document(ExportRequest {
            master: Some(&master),
            page: PageRef::FIRST,
            descriptor: &descriptor,
            preview_stamp: Some(&preview),
            placement: Placement { x: 120, y: 105 },
            canvas_size: Some(Size::new(900.0, 1165.0)),
            device_density: 1.0,
            fonts: &fonts,
        })
        .unwrap();

        assert_eq!(out.file_name, "acta-revisado.pdf");
        assert_eq!(out.mime, "application/pdf");
        assert_eq!(out.pixel_ratio, 2.0);
        assert_eq!(out.source_fingerprint, master.fingerprint());
        let sy = 792.0 / 1165.0;
        assert!((out.document_rect.x - 81.6).abs() < 1e-6);
        assert!((out.document_rect.height - 116.0 * sy).abs() < 1e-6);
        assert!((out.document_rect.y - (792.0 - 105.0 * sy - 116.0 * sy)).abs() < 1e-6);

        let (_, ops) = stamp_ops(&out.bytes);
        let names: Vec<&str> = ops.iter().map(|op| op.operator.as_str()).collect();
        assert_eq!(names.first(), Some(&"q"));
        let cm = ops
            .iter()
            .rev()
            .find(|op| op.operator == "cm")
            .expect("stamp cm");
        let e = crate::document::obj_to_f32(&cm.operands[4]).unwrap() as f64;
        assert!((e - 81.6).abs() < 1e-3);
        assert_eq!(names.last(), Some(&"Q"));
        assert!(names.contains(&"Do"));
    }

    #[test]
    fn exported_image_is_hi_res_with_soft_mask() {
        let master = master("");
        let descriptor = descriptor();
        let fonts = no_fonts();
        let preview = build_stamp(&descriptor, 1.0, &fonts).unwrap();
        let out = export_document(ExportRequest {
            master: Some(&master),
            page: PageRef::FIRST,
            descriptor: &descriptor,
            preview_stamp: Some(&preview),
            placement: Placement::default(),
            canvas_size: Some(Size::new(918.0, 1188.0)),
            device_density: 1.0,
            fonts: &fonts,
        })
        .unwrap();

        let doc = LoDocument::load_mem(&out.bytes).unwrap();
        let page_id = *doc.get_pages().get(&1).unwrap();
        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        let image_ref = xobjects.get(b"StampIm").unwrap().as_reference().unwrap();
        let image = doc.get_object(image_ref).unwrap().as_stream().unwrap();
        assert_eq!(image.dict.get(b"Width").unwrap().as_i64().unwrap(), 320);
        assert_eq!(image.dict.get(b"Height").unwrap().as_i64().unwrap(), 232);
        assert!(image.dict.get(b"SMask").unwrap().as_reference().is_ok());
    }

    #[test]
    fn xobject_names_do_not_collide() {
        let mut xobjects = LoDictionary::new();
        assert_eq!(unused_name(&xobjects), "StampIm");
        xobjects.set("StampIm", LoObject::Null);
        xobjects.set("StampIm1", LoObject::Null);
        assert_eq!(unused_name(&xobjects), "StampIm2");
    }

    #[test]
    fn alpha_is_split_and_unpremultiplied() {
        let (rgb, alpha) = split_alpha(&[64, 32, 0, 128, 0, 0, 0, 0]);
        assert_eq!(alpha, vec![128, 0]);
        assert_eq!(rgb.len(), 6);
        assert!((rgb[0] as i32 - 127).abs() <= 1);
        assert_eq!(&rgb[3..], &[0, 0, 0]);
    }

    #[test]
    fn missing_preconditions_are_reported() {
        let descriptor = descriptor();
        let fonts = no_fonts();
        let master = master("");
        let err = export_document(ExportRequest {
            master: None,
            page: PageRef::FIRST,
            descriptor: &descriptor,
            preview_stamp: None,
            placement: Placement::default(),
            canvas_size: None,
            device_density: 1.0,
            fonts: &fonts,
        })
        .unwrap_err();
        assert!(matches!(err, StampError::MissingDocument));

        let err = export_document(ExportRequest {
            master: Some(&master),
            page: PageRef::FIRST,
            descriptor: &descriptor,
            preview_stamp: None,
            placement: Placement::default(),
            canvas_size: Some(Size::new(918.0, 1188.0)),
            device_density: 1.0,
            fonts: &fonts,
        })
        .unwrap_err();
        assert!(matches!(err, StampError::MissingStamp));
    }
}
