//! Shared lopdf plumbing: loading, saving and page-tree lookups.
//!
//! Every mutation opens its own [`Document`] from the artifact bytes, works on
//! it exclusively and serialises it back through [`save_document`]. Nothing in
//! the crate keeps a document handle across calls.

use crate::error::AnonError;
use crate::geometry::{PageFrame, UserRect};
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::debug;

/// US Letter, used when a page has no usable box.
const DEFAULT_PAGE_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// Parse PDF bytes, distinguishing "not a PDF" from "broken PDF".
pub fn load_document(bytes: &[u8], label: &str) -> Result<Document, AnonError> {
    if !bytes.starts_with(b"%PDF") {
        let mut magic = [0u8; 4];
        for (dst, src) in magic.iter_mut().zip(bytes.iter()) {
            *dst = *src;
        }
        return Err(AnonError::NotAPdf {
            path: label.to_string(),
            magic,
        });
    }
    let doc = Document::load_mem(bytes).map_err(|e| AnonError::CorruptPdf {
        path: label.to_string(),
        detail: e.to_string(),
    })?;
    if doc.is_encrypted() {
        return Err(AnonError::CorruptPdf {
            path: label.to_string(),
            detail: "encrypted documents are not supported".into(),
        });
    }
    Ok(doc)
}

/// Serialise a document. With `compact`, unreachable objects are dropped and
/// streams deflated first, so purged content leaves the file.
pub fn save_document(doc: &mut Document, compact: bool) -> Result<Vec<u8>, AnonError> {
    if compact {
        let pruned = doc.prune_objects();
        debug!("Pruned {} unreachable objects", pruned.len());
        doc.compress();
    }
    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(|e| AnonError::MutationFailed {
        detail: format!("serialising PDF: {e}"),
    })?;
    Ok(out)
}

/// 0-indexed page list.
pub fn page_ids(doc: &Document) -> Vec<ObjectId> {
    doc.get_pages().into_values().collect()
}

/// Collect every index not in `[0, page_count)`, sorted and deduplicated.
pub fn invalid_pages(indices: impl IntoIterator<Item = usize>, page_count: usize) -> Vec<usize> {
    let mut invalid: Vec<usize> = indices.into_iter().filter(|&p| p >= page_count).collect();
    invalid.sort_unstable();
    invalid.dedup();
    invalid
}

/// Reject the whole request when any index is out of range.
pub fn check_pages(
    indices: impl IntoIterator<Item = usize>,
    page_count: usize,
) -> Result<(), AnonError> {
    let invalid = invalid_pages(indices, page_count);
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(AnonError::InvalidPages {
            invalid,
            page_count,
        })
    }
}

// ── Object helpers ───────────────────────────────────────────────────────

pub fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Follow one level of indirection.
pub fn deref<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Resolve an object to a dictionary (a stream yields its dictionary).
pub fn dict_of<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match deref(doc, obj)? {
        Object::Dictionary(d) => Some(d),
        Object::Stream(s) => Some(&s.dict),
        _ => None,
    }
}

pub fn array_of<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Vec<Object>> {
    match deref(doc, obj)? {
        Object::Array(a) => Some(a),
        _ => None,
    }
}

/// Look up a page attribute, walking `/Parent` for inheritable keys.
pub fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    for _ in 0..64 {
        if let Ok(value) = current.get(key) {
            return deref(doc, value);
        }
        current = dict_of(doc, current.get(b"Parent").ok()?)?;
    }
    None
}

fn box_of(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<UserRect> {
    let arr = match inherited(doc, page_id, key)? {
        Object::Array(a) => a,
        _ => return None,
    };
    let v: Vec<f64> = arr
        .iter()
        .filter_map(|o| deref(doc, o).and_then(number))
        .collect();
    if v.len() != 4 {
        return None;
    }
    let r = UserRect::new(v[0], v[1], v[2], v[3]);
    (r.width() > 0.0 && r.height() > 0.0).then_some(r)
}

/// Visible frame of a page: CropBox clipped to MediaBox, plus `/Rotate`.
pub fn page_frame(doc: &Document, page_id: ObjectId) -> PageFrame {
    let media = box_of(doc, page_id, b"MediaBox").unwrap_or_else(|| {
        let [a, b, c, d] = DEFAULT_PAGE_BOX;
        UserRect::new(a, b, c, d)
    });
    let bounds = box_of(doc, page_id, b"CropBox")
        .and_then(|crop| crop.intersection(&media))
        .unwrap_or(media);
    let rotation = match inherited(doc, page_id, b"Rotate") {
        Some(Object::Integer(r)) => *r,
        _ => 0,
    };
    PageFrame::new(bounds, rotation)
}

/// Decoded bytes of a page's content, concatenating arrays of streams.
pub fn page_content(doc: &Document, page_id: ObjectId) -> Result<Vec<u8>, AnonError> {
    let page = doc.get_dictionary(page_id)?;
    let contents = match page.get(b"Contents") {
        Ok(c) => c,
        Err(_) => return Ok(Vec::new()),
    };
    let mut out = Vec::new();
    let streams: Vec<&Object> = match deref(doc, contents) {
        Some(Object::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    };
    for item in streams {
        if let Some(Object::Stream(stream)) = deref(doc, item) {
            let data = stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone());
            out.extend_from_slice(&data);
            out.push(b'\n');
        }
    }
    Ok(out)
}

/// Page resources as an owned dictionary (inherited if needed).
pub fn page_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    match inherited(doc, page_id, b"Resources") {
        Some(Object::Dictionary(d)) => d.clone(),
        Some(Object::Stream(s)) => s.dict.clone(),
        _ => Dictionary::new(),
    }
}

/// Give the page its own inline `/Resources` with inline `/XObject` and
/// `/Font` sub-dictionaries, so edits never leak into pages sharing them.
pub fn localize_resources(doc: &mut Document, page_id: ObjectId) -> Result<(), AnonError> {
    let mut resources = page_resources(doc, page_id);
    for key in [b"XObject".as_slice(), b"Font".as_slice()] {
        let resolved = resources
            .get(key)
            .ok()
            .and_then(|o| dict_of(doc, o))
            .cloned();
        if let Some(sub) = resolved {
            resources.set(key, Object::Dictionary(sub));
        }
    }
    doc.get_dictionary_mut(page_id)?
        .set("Resources", Object::Dictionary(resources));
    Ok(())
}

/// Mutable access to a sub-dictionary of the page's (already localized) resources.
pub fn resource_dict_mut<'a>(
    doc: &'a mut Document,
    page_id: ObjectId,
    key: &[u8],
) -> Result<&'a mut Dictionary, AnonError> {
    let page = doc.get_dictionary_mut(page_id)?;
    let resources = match page.get_mut(b"Resources") {
        Ok(Object::Dictionary(d)) => d,
        _ => {
            return Err(AnonError::Internal(
                "page resources must be localized before editing".into(),
            ))
        }
    };
    if !matches!(resources.get(key), Ok(Object::Dictionary(_))) {
        resources.set(key, Object::Dictionary(Dictionary::new()));
    }
    match resources.get_mut(key) {
        Ok(Object::Dictionary(d)) => Ok(d),
        _ => Err(AnonError::Internal("resource dictionary vanished".into())),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_a_pdf_reports_magic() {
        let err = load_document(b"PK\x03\x04zip", "a.zip").unwrap_err();
        match err {
            AnonError::NotAPdf { magic, .. } => assert_eq!(&magic, b"PK\x03\x04"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_pdf_is_corrupt() {
        let err = load_document(b"%PDF-1.7\n garbage", "x.pdf").unwrap_err();
        assert!(matches!(err, AnonError::CorruptPdf { .. }));
    }

    #[test]
    fn frame_inherits_mediabox() {
        let doc = load_document(&fixtures::numbered(2), "t.pdf").unwrap();
        let pages = page_ids(&doc);
        let frame = page_frame(&doc, pages[1]);
        assert_eq!(frame.view_size(), (612.0, 792.0));
        assert_eq!(frame.rotation, 0);
    }

    #[test]
    fn invalid_pages_sorted_and_deduped() {
        assert_eq!(invalid_pages([7, 1, 9, 7], 3), vec![7, 9]);
        assert!(check_pages([0, 2], 3).is_ok());
    }

    #[test]
    fn localized_resources_are_inline() {
        let mut doc = load_document(&fixtures::numbered(2), "t.pdf").unwrap();
        let pages = page_ids(&doc);
        localize_resources(&mut doc, pages[0]).unwrap();
        resource_dict_mut(&mut doc, pages[0], b"XObject").unwrap();
        let page = doc.get_dictionary(pages[0]).unwrap();
        assert!(matches!(page.get(b"Resources"), Ok(Object::Dictionary(_))));
        // The second page still points at the shared resources object.
        let other = doc.get_dictionary(pages[1]).unwrap();
        assert!(matches!(other.get(b"Resources"), Ok(Object::Reference(_))));
    }
}
