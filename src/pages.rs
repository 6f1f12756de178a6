//! Page-set editing and document inspection.

use crate::error::AnonError;
use crate::pdf::{check_pages, load_document, page_frame, page_ids, save_document};
use crate::redact::content;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Average extracted characters per page below which a document counts as scanned.
const SCANNED_CHARS_PER_PAGE: f64 = 50.0;

/// Result of [`delete_pages`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedPages {
    /// 0-indexed, ascending, deduplicated.
    pub deleted_pages: Vec<usize>,
    pub original_page_count: usize,
    pub new_page_count: usize,
}

/// Remove whole pages (0-indexed). The request is all-or-nothing.
pub fn delete_pages(bytes: &[u8], indices: &[usize]) -> Result<(Vec<u8>, DeletedPages), AnonError> {
    if indices.is_empty() {
        return Err(AnonError::EmptyPageSelection);
    }
    let mut doc = load_document(bytes, "current artifact")?;
    let original_page_count = page_ids(&doc).len();
    check_pages(indices.iter().copied(), original_page_count)?;

    let mut pages = indices.to_vec();
    pages.sort_unstable();
    pages.dedup();
    if pages.len() == original_page_count {
        // A PDF needs at least one page.
        return Err(AnonError::InvalidPages {
            invalid: pages,
            page_count: original_page_count,
        });
    }

    // Highest first, so the remaining indices stay valid.
    for &page in pages.iter().rev() {
        doc.delete_pages(&[page as u32 + 1]);
    }
    let new_page_count = page_ids(&doc).len();
    let out = save_document(&mut doc, true)?;

    info!(
        "Deleted pages {:?}: {} -> {} pages",
        pages, original_page_count, new_page_count
    );
    Ok((
        out,
        DeletedPages {
            deleted_pages: pages,
            original_page_count,
            new_page_count,
        },
    ))
}

/// Basic facts about a document, read without rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub page_count: usize,
    /// Displayed (width, height) in points per page.
    pub page_sizes: Vec<(f64, f64)>,
    /// True when the pages carry little or no extractable text.
    pub is_scanned: bool,
}

pub fn inspect(bytes: &[u8]) -> Result<DocumentInfo, AnonError> {
    let doc = load_document(bytes, "document")?;
    let pages = page_ids(&doc);
    let mut chars = 0usize;
    let mut page_sizes = Vec::with_capacity(pages.len());
    for &page in &pages {
        page_sizes.push(page_frame(&doc, page).view_size());
        chars += content::page_text(&doc, page)?
            .chars()
            .filter(|c| !c.is_whitespace())
            .count();
    }
    let is_scanned =
        pages.is_empty() || (chars as f64 / pages.len() as f64) < SCANNED_CHARS_PER_PAGE;
    Ok(DocumentInfo {
        page_count: pages.len(),
        page_sizes,
        is_scanned,
    })
}
