//! Redaction engine: finding redaction, text replacement, block deletion and
//! the page block listing that edits are picked from.
//!
//! Every mutation follows the same two-phase protocol:
//!
//! 1. open the artifact into an owned [`Redactor`] and queue every mark
//!    (covers, purge rects, text inserts) for the whole document;
//! 2. call [`Redactor::flatten`] exactly once, which rewrites each marked
//!    page's content, draws the overlay, garbage-collects unreachable
//!    objects and serialises the result.
//!
//! Nothing is written between the two phases, so a failed operation leaves
//! no partial artifact behind.

pub mod content;
pub mod fonts;
pub mod image;

use crate::error::AnonError;
use crate::geometry::{to_normalized, NormBox, PageFrame, Rect, UserRect};
use crate::job::{Action, Finding};
use crate::pdf::{
    check_pages, load_document, localize_resources, page_content, page_frame, page_ids,
    resource_dict_mut, save_document,
};
use content::{purge_page, PurgeStats, TextRun, COVER_TAG};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Resource name of the font used for inserted text.
const INSERT_FONT: &[u8] = b"AnonHelv";

// ── Instructions ─────────────────────────────────────────────────────────

/// Fill colour, components in 0..=1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb(pub f64, pub f64, pub f64);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0.0, 0.0, 0.0);
    pub const WHITE: Rgb = Rgb(1.0, 1.0, 1.0);
}

/// Where a redaction applies on its page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Area {
    /// Percent of the displayed page, origin top-left.
    Normalized(NormBox),
    /// Points of the displayed page, origin top-left.
    Absolute(Rect),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RedactionOp {
    /// Opaque cover; the content underneath stays in the file.
    Mask { color: Rgb },
    /// Remove the content underneath, then fill the hole.
    Delete { fill: Rgb },
}

/// One queued redaction. `page` is 0-indexed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedactionInstruction {
    pub page: usize,
    pub area: Area,
    pub op: RedactionOp,
}

/// Text replacement request. `page: None` targets every page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replacement {
    pub find: String,
    #[serde(default)]
    pub replace: String,
    #[serde(default)]
    pub page: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Delete,
    Replace,
}

/// Audit entry for one replaced or deleted occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub page: usize,
    pub find: String,
    pub replace: String,
    /// Matched text box in page points, origin top-left.
    pub bbox: Rect,
    /// How far the cover was extended to the left to fit a longer replacement.
    pub left_shift: f64,
    pub action: ChangeAction,
}

/// A region to delete, as drawn by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub page: usize,
    pub bbox: NormBox,
}

/// Font used for replacement text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    /// Base-14 font name.
    pub font: String,
    /// Size used when the matched span has no usable size.
    pub default_size: f64,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font: "Helvetica".to_string(),
            default_size: 10.0,
        }
    }
}

/// Kind of a listed page block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Image,
}

/// One selectable region of a page, for picking block deletions and search
/// strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageBlock {
    #[serde(rename = "type")]
    pub kind: BlockKind,
    /// Line text; `[IMAGE]` for images.
    pub text: String,
    pub bbox: NormBox,
    /// Zero for images.
    pub font_size: f64,
}

/// Blocks of one page, with the displayed page size in points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageBlocks {
    pub page: usize,
    pub width: f64,
    pub height: f64,
    pub blocks: Vec<PageBlock>,
}

// ── Redactor ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TextInsert {
    text: String,
    /// Baseline start in view coordinates.
    x: f64,
    y: f64,
    size: f64,
}

#[derive(Debug, Default)]
struct PageMarks {
    purge: Vec<UserRect>,
    covers: Vec<(UserRect, Rgb)>,
    inserts: Vec<TextInsert>,
}

/// Owned single-writer handle over one document.
pub struct Redactor {
    doc: Document,
    pages: Vec<ObjectId>,
    marks: BTreeMap<usize, PageMarks>,
    font: String,
    font_id: Option<ObjectId>,
}

impl Redactor {
    /// Parse artifact bytes. `label` names the artifact in errors.
    pub fn open(bytes: &[u8], label: &str) -> Result<Self, AnonError> {
        let doc = load_document(bytes, label)?;
        let pages = page_ids(&doc);
        Ok(Self {
            doc,
            pages,
            marks: BTreeMap::new(),
            font: TextStyle::default().font,
            font_id: None,
        })
    }

    /// Base-14 font for inserted text.
    pub fn with_font(mut self, font: impl Into<String>) -> Self {
        self.font = font.into();
        self
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Reject the whole request if any index is out of range.
    pub fn check_pages(&self, pages: impl IntoIterator<Item = usize>) -> Result<(), AnonError> {
        check_pages(pages, self.pages.len())
    }

    fn page_id(&self, page: usize) -> Result<ObjectId, AnonError> {
        self.pages
            .get(page)
            .copied()
            .ok_or_else(|| AnonError::InvalidPages {
                invalid: vec![page],
                page_count: self.pages.len(),
            })
    }

    pub fn frame(&self, page: usize) -> Result<PageFrame, AnonError> {
        Ok(page_frame(&self.doc, self.page_id(page)?))
    }

    /// Placed text of a page as it is before any queued mark is applied.
    pub fn extract(&self, page: usize) -> Result<Vec<TextRun>, AnonError> {
        content::extract(&self.doc, self.page_id(page)?)
    }

    fn marks(&mut self, page: usize) -> Result<&mut PageMarks, AnonError> {
        self.page_id(page)?;
        Ok(self.marks.entry(page).or_default())
    }

    /// Queue one instruction.
    pub fn apply(&mut self, instruction: &RedactionInstruction) -> Result<(), AnonError> {
        let frame = self.frame(instruction.page)?;
        let rect = match instruction.area {
            Area::Normalized(b) => frame.norm_to_user(&b)?,
            Area::Absolute(r) => frame.to_user_space(&r),
        };
        match instruction.op {
            RedactionOp::Mask { color } => self.cover(instruction.page, rect, color),
            RedactionOp::Delete { fill } => {
                self.purge(instruction.page, rect)?;
                self.cover(instruction.page, rect, fill)
            }
        }
    }

    /// Draw an opaque rectangle over `rect` (user space).
    pub fn cover(&mut self, page: usize, rect: UserRect, color: Rgb) -> Result<(), AnonError> {
        self.marks(page)?.covers.push((rect, color));
        Ok(())
    }

    /// Remove all content under `rect` (user space).
    pub fn purge(&mut self, page: usize, rect: UserRect) -> Result<(), AnonError> {
        self.marks(page)?.purge.push(rect);
        Ok(())
    }

    /// Draw `text` with its baseline starting at view point `(x, y)`.
    pub fn insert_text(
        &mut self,
        page: usize,
        text: &str,
        x: f64,
        y: f64,
        size: f64,
    ) -> Result<(), AnonError> {
        self.marks(page)?.inserts.push(TextInsert {
            text: text.to_string(),
            x,
            y,
            size,
        });
        Ok(())
    }

    fn insert_font(&mut self) -> ObjectId {
        if let Some(id) = self.font_id {
            return id;
        }
        let id = self.doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => Object::Name(self.font.clone().into_bytes()),
            "Encoding" => "WinAnsiEncoding",
        });
        self.font_id = Some(id);
        id
    }

    fn overlay(frame: &PageFrame, marks: &PageMarks) -> Result<Vec<u8>, AnonError> {
        let real = |v: f64| Object::Real(v as f32);
        let mut ops = Vec::new();
        for (rect, color) in &marks.covers {
            ops.push(Operation::new("BMC", vec![Object::Name(COVER_TAG.to_vec())]));
            ops.push(Operation::new("q", vec![]));
            ops.push(Operation::new(
                "rg",
                vec![real(color.0), real(color.1), real(color.2)],
            ));
            ops.push(Operation::new(
                "re",
                vec![
                    real(rect.llx),
                    real(rect.lly),
                    real(rect.width()),
                    real(rect.height()),
                ],
            ));
            ops.push(Operation::new("f", vec![]));
            ops.push(Operation::new("Q", vec![]));
            ops.push(Operation::new("EMC", vec![]));
        }
        for insert in &marks.inserts {
            let (ox, oy) = frame.view_point_to_user(insert.x, insert.y);
            let (rx, ry) = frame.view_point_to_user(insert.x + 1.0, insert.y);
            let (ux, uy) = frame.view_point_to_user(insert.x, insert.y - 1.0);
            ops.push(Operation::new("q", vec![]));
            ops.push(Operation::new("BT", vec![]));
            ops.push(Operation::new(
                "Tf",
                vec![Object::Name(INSERT_FONT.to_vec()), real(insert.size)],
            ));
            ops.push(Operation::new("g", vec![real(0.0)]));
            ops.push(Operation::new(
                "Tm",
                vec![
                    real(rx - ox),
                    real(ry - oy),
                    real(ux - ox),
                    real(uy - oy),
                    real(ox),
                    real(oy),
                ],
            ));
            ops.push(Operation::new(
                "Tj",
                vec![Object::String(
                    fonts::encode_win_ansi(&insert.text),
                    StringFormat::Literal,
                )],
            ));
            ops.push(Operation::new("ET", vec![]));
            ops.push(Operation::new("Q", vec![]));
        }
        Ok(Content { operations: ops }.encode()?)
    }

    /// Apply every queued mark and serialise the document, compacted.
    pub fn flatten(mut self) -> Result<(Vec<u8>, PurgeStats), AnonError> {
        let mut stats = PurgeStats::default();
        let marks = std::mem::take(&mut self.marks);

        for (page, marks) in &marks {
            let page_id = self.pages[*page];
            let frame = page_frame(&self.doc, page_id);
            let body = if marks.purge.is_empty() {
                page_content(&self.doc, page_id)?
            } else {
                let outcome = purge_page(&mut self.doc, page_id, &marks.purge)?;
                stats.merge(&outcome.stats);
                outcome.body
            };
            debug!(
                "Page {}: {} covers, {} purge rects, {} inserts",
                page,
                marks.covers.len(),
                marks.purge.len(),
                marks.inserts.len()
            );

            if !marks.inserts.is_empty() {
                let font_id = self.insert_font();
                localize_resources(&mut self.doc, page_id)?;
                resource_dict_mut(&mut self.doc, page_id, b"Font")?.set(INSERT_FONT, font_id);
            }

            let mut data = b"q\n".to_vec();
            data.extend_from_slice(&body);
            data.extend_from_slice(b"\nQ\n");
            data.extend_from_slice(&Self::overlay(&frame, marks)?);
            let content_id = self.doc.add_object(Stream::new(dictionary! {}, data));
            self.doc
                .get_dictionary_mut(page_id)?
                .set("Contents", content_id);
        }

        let bytes = save_document(&mut self.doc, true)?;
        Ok((bytes, stats))
    }
}

// ── Operations ───────────────────────────────────────────────────────────

/// Redact every finding whose effective action is `mask` or `remove`.
///
/// Returns the new artifact and the number of redactions applied.
pub fn apply_findings(
    bytes: &[u8],
    findings: &[Finding],
    decisions: &BTreeMap<String, Action>,
) -> Result<(Vec<u8>, usize), AnonError> {
    let mut redactor = Redactor::open(bytes, "current artifact")?;

    let mut queued = Vec::new();
    for finding in findings {
        let action = finding.resolve(decisions);
        if !action.redacts() {
            continue;
        }
        let page = finding.page_index().ok_or_else(|| AnonError::InvalidInstruction {
            detail: format!("finding {} has page 0; pages are 1-indexed", finding.id),
        })?;
        let op = match action {
            Action::Remove => RedactionOp::Delete { fill: Rgb::WHITE },
            _ => RedactionOp::Mask { color: Rgb::BLACK },
        };
        queued.push(RedactionInstruction {
            page,
            area: Area::Normalized(finding.bbox),
            op,
        });
    }
    redactor.check_pages(queued.iter().map(|i| i.page))?;

    for instruction in &queued {
        redactor.apply(instruction)?;
    }
    info!(
        "Applying {} redactions ({} findings reviewed)",
        queued.len(),
        findings.len()
    );
    let (out, stats) = redactor.flatten()?;
    debug!("Redaction purge stats: {:?}", stats);
    Ok((out, queued.len()))
}

/// Replace or delete literal text occurrences.
///
/// Matching is case-sensitive and runs over whole lines, so an occurrence
/// may span several show operators. Zero matches is not an error.
pub fn text_replace(
    bytes: &[u8],
    replacements: &[Replacement],
    style: &TextStyle,
) -> Result<(Vec<u8>, Vec<ChangeRecord>), AnonError> {
    let mut redactor = Redactor::open(bytes, "current artifact")?.with_font(style.font.clone());

    if let Some(empty) = replacements.iter().find(|r| r.find.is_empty()) {
        return Err(AnonError::InvalidInstruction {
            detail: format!("empty search text (replacement {:?})", empty.replace),
        });
    }
    redactor.check_pages(replacements.iter().filter_map(|r| r.page))?;

    let mut runs_by_page: BTreeMap<usize, Vec<TextRun>> = BTreeMap::new();
    let mut changes = Vec::new();

    for replacement in replacements {
        let pages: Vec<usize> = match replacement.page {
            Some(p) => vec![p],
            None => (0..redactor.page_count()).collect(),
        };
        for page in pages {
            if !runs_by_page.contains_key(&page) {
                runs_by_page.insert(page, content::lines(redactor.extract(page)?));
            }
            let frame = redactor.frame(page)?;
            let matches: Vec<(UserRect, (f64, f64), f64)> = runs_by_page[&page]
                .iter()
                .flat_map(|run| {
                    run.find(&replacement.find).into_iter().filter_map(move |range| {
                        let first = &run.glyphs[range.start];
                        Some((run.bbox(range.clone())?, first.origin, first.font_size))
                    })
                })
                .collect();

            for (user_box, origin, size) in matches {
                let view = frame.to_view(&user_box);
                changes.push(queue_replacement(
                    &mut redactor,
                    page,
                    &frame,
                    replacement,
                    style,
                    user_box,
                    view,
                    origin,
                    size,
                )?);
            }
        }
    }

    info!(
        "Text replace: {} occurrences across {} instructions",
        changes.len(),
        replacements.len()
    );
    let (out, stats) = redactor.flatten()?;
    debug!("Text replace purge stats: {:?}", stats);
    Ok((out, changes))
}

#[allow(clippy::too_many_arguments)]
fn queue_replacement(
    redactor: &mut Redactor,
    page: usize,
    frame: &PageFrame,
    replacement: &Replacement,
    style: &TextStyle,
    user_box: UserRect,
    view: Rect,
    origin: (f64, f64),
    size: f64,
) -> Result<ChangeRecord, AnonError> {
    let find_len = replacement.find.chars().count() as f64;
    let replace_len = replacement.replace.chars().count() as f64;
    let orig_w = view.width();
    let avg = orig_w / find_len;
    let shift = (replace_len * avg - orig_w).max(0.0);

    redactor.purge(page, user_box)?;
    let action = if replacement.replace.is_empty() {
        ChangeAction::Delete
    } else {
        let cover = Rect::new(view.x0 - shift - 2.0, view.y0 - 1.0, view.x1 + 2.0, view.y1 + 1.0);
        redactor.cover(page, frame.to_user_space(&cover), Rgb::WHITE)?;
        let (_, baseline) = frame.user_point_to_view(origin.0, origin.1);
        let size = if size.is_finite() && size > 0.0 {
            size
        } else {
            style.default_size
        };
        redactor.insert_text(page, &replacement.replace, view.x0 - shift, baseline, size)?;
        ChangeAction::Replace
    };

    Ok(ChangeRecord {
        page,
        find: replacement.find.clone(),
        replace: replacement.replace.clone(),
        bbox: view,
        left_shift: shift,
        action,
    })
}

/// Remove the content of operator-drawn blocks and paint them white.
/// The page count never changes.
pub fn delete_blocks(bytes: &[u8], blocks: &[Block]) -> Result<Vec<u8>, AnonError> {
    let mut redactor = Redactor::open(bytes, "current artifact")?;
    redactor.check_pages(blocks.iter().map(|b| b.page))?;

    for block in blocks {
        redactor.apply(&RedactionInstruction {
            page: block.page,
            area: Area::Normalized(block.bbox),
            op: RedactionOp::Delete { fill: Rgb::WHITE },
        })?;
    }
    info!("Deleting {} blocks", blocks.len());
    let (out, stats) = redactor.flatten()?;
    debug!("Block delete purge stats: {:?}", stats);
    Ok(out)
}

/// List text lines and images with normalized boxes, for one page or all.
pub fn text_blocks(bytes: &[u8], page: Option<usize>) -> Result<Vec<PageBlocks>, AnonError> {
    let doc = load_document(bytes, "current artifact")?;
    let ids = page_ids(&doc);
    let pages: Vec<usize> = match page {
        Some(p) => {
            check_pages([p], ids.len())?;
            vec![p]
        }
        None => (0..ids.len()).collect(),
    };

    let mut out = Vec::with_capacity(pages.len());
    for page in pages {
        let page_id = ids[page];
        let frame = page_frame(&doc, page_id);
        let (width, height) = frame.view_size();
        let found = content::placements(&doc, page_id)?;
        let normalized = |u: &UserRect| to_normalized(width, height, &frame.to_view(u));

        let mut blocks = Vec::new();
        for line in content::lines(found.runs) {
            let text = line.text().trim().to_string();
            if text.is_empty() {
                continue;
            }
            let Some(user) = line.bbox(0..line.glyphs.len()) else {
                continue;
            };
            blocks.push(PageBlock {
                kind: BlockKind::Text,
                text,
                bbox: normalized(&user)?,
                font_size: line.glyphs[0].font_size,
            });
        }
        for image in &found.images {
            blocks.push(PageBlock {
                kind: BlockKind::Image,
                text: "[IMAGE]".to_string(),
                bbox: normalized(image)?,
                font_size: 0.0,
            });
        }
        debug!("Page {}: {} blocks", page, blocks.len());
        out.push(PageBlocks {
            page,
            width,
            height,
            blocks,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::{bytes, line, numbered};

    fn text_of(pdf: &[u8], page: usize) -> String {
        let r = Redactor::open(pdf, "out").unwrap();
        content::lines(r.extract(page).unwrap())
            .iter()
            .map(TextRun::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn finding(id: &str, page: usize, bbox: NormBox, action: Option<Action>) -> Finding {
        Finding {
            id: id.into(),
            category: "contact".into(),
            label: "Phone".into(),
            value_preview: "+48 …".into(),
            page,
            bbox,
            confidence: 0.9,
            suggested_action: action,
        }
    }

    #[test]
    fn remove_purges_text_under_box() {
        // y = 700 baseline on a 792pt page is ~11.6% from the top.
        let pdf = bytes(&[vec![
            line(72.0, 700.0, 12.0, "Dealer: Jan Kowalski"),
            line(72.0, 400.0, 12.0, "Price 100000 PLN"),
        ]]);
        let findings = vec![finding(
            "f1",
            1,
            NormBox::new(0.0, 10.0, 100.0, 3.0),
            Some(Action::Remove),
        )];
        let (out, applied) = apply_findings(&pdf, &findings, &BTreeMap::new()).unwrap();
        assert_eq!(applied, 1);
        let text = text_of(&out, 0);
        assert!(!text.contains("Kowalski"), "got: {text}");
        assert!(text.contains("Price 100000 PLN"), "got: {text}");
    }

    #[test]
    fn mask_keeps_text_but_counts() {
        let pdf = bytes(&[vec![line(72.0, 700.0, 12.0, "Dealer: Jan Kowalski")]]);
        let findings = vec![finding(
            "f1",
            1,
            NormBox::new(0.0, 10.0, 100.0, 3.0),
            Some(Action::Mask),
        )];
        let (out, applied) = apply_findings(&pdf, &findings, &BTreeMap::new()).unwrap();
        assert_eq!(applied, 1);
        assert!(text_of(&out, 0).contains("Kowalski"));
    }

    #[test]
    fn keep_decision_overrides_suggestion() {
        let pdf = numbered(1);
        let findings = vec![finding(
            "f1",
            1,
            NormBox::new(0.0, 0.0, 50.0, 50.0),
            Some(Action::Remove),
        )];
        let decisions = BTreeMap::from([("f1".to_string(), Action::Keep)]);
        let (_, applied) = apply_findings(&pdf, &findings, &decisions).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn finding_on_missing_page_rejected() {
        let pdf = numbered(2);
        let findings = vec![
            finding("a", 5, NormBox::new(0.0, 0.0, 1.0, 1.0), Some(Action::Mask)),
            finding("b", 3, NormBox::new(0.0, 0.0, 1.0, 1.0), Some(Action::Mask)),
        ];
        let err = apply_findings(&pdf, &findings, &BTreeMap::new()).unwrap_err();
        match err {
            AnonError::InvalidPages { invalid, page_count } => {
                assert_eq!(invalid, vec![2, 4]);
                assert_eq!(page_count, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn replace_swaps_extracted_text() {
        let pdf = bytes(&[vec![line(72.0, 700.0, 12.0, "Sold by ACME Motors")]]);
        let (out, changes) = text_replace(
            &pdf,
            &[Replacement {
                find: "ACME".into(),
                replace: "Dealer".into(),
                page: None,
            }],
            &TextStyle::default(),
        )
        .unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.action, ChangeAction::Replace);
        // "Dealer" is longer than "ACME", so the cover grows leftwards.
        assert!(change.left_shift > 0.0);
        assert!((change.left_shift - change.bbox.width() / 2.0).abs() < 1e-6);

        let text = text_of(&out, 0);
        assert!(!text.contains("ACME"), "got: {text}");
        assert!(text.contains("Dealer"), "got: {text}");
        assert!(text.contains("Motors"), "got: {text}");
    }

    #[test]
    fn empty_replace_deletes_without_insert() {
        let pdf = bytes(&[vec![line(72.0, 700.0, 12.0, "Call 600123456 now")]]);
        let (out, changes) = text_replace(
            &pdf,
            &[Replacement {
                find: "600123456".into(),
                replace: String::new(),
                page: Some(0),
            }],
            &TextStyle::default(),
        )
        .unwrap();
        assert_eq!(changes[0].action, ChangeAction::Delete);
        assert_eq!(changes[0].left_shift, 0.0);
        let text = text_of(&out, 0);
        assert!(!text.contains("600123456"), "got: {text}");
        assert!(text.contains("now"));
    }

    #[test]
    fn replace_without_match_is_not_an_error() {
        let pdf = numbered(2);
        let (_, changes) = text_replace(
            &pdf,
            &[Replacement {
                find: "absent".into(),
                replace: "x".into(),
                page: None,
            }],
            &TextStyle::default(),
        )
        .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn replace_rejects_bad_page_and_empty_find() {
        let pdf = numbered(2);
        let bad_page = Replacement {
            find: "Page".into(),
            replace: "P".into(),
            page: Some(9),
        };
        assert!(matches!(
            text_replace(&pdf, &[bad_page], &TextStyle::default()),
            Err(AnonError::InvalidPages { .. })
        ));
        let empty = Replacement {
            find: String::new(),
            replace: "P".into(),
            page: None,
        };
        assert!(matches!(
            text_replace(&pdf, &[empty], &TextStyle::default()),
            Err(AnonError::InvalidInstruction { .. })
        ));
    }

    #[test]
    fn blocks_keep_page_count() {
        let pdf = numbered(3);
        let out = delete_blocks(
            &pdf,
            &[Block {
                page: 0,
                bbox: NormBox::new(0.0, 0.0, 100.0, 15.0),
            }],
        )
        .unwrap();
        let r = Redactor::open(&out, "out").unwrap();
        assert_eq!(r.page_count(), 3);
        assert!(!text_of(&out, 0).contains("Page 1"));
        assert!(text_of(&out, 1).contains("Page 2"));
    }

    #[test]
    fn rotated_page_insert_is_extractable() {
        let mut doc = crate::pdf::fixtures::document(&[vec![line(72.0, 700.0, 12.0, "VIN ABC123")]]);
        let page = page_ids(&doc)[0];
        doc.get_dictionary_mut(page).unwrap().set("Rotate", 90);
        let mut pdf = Vec::new();
        doc.save_to(&mut pdf).unwrap();

        let (out, changes) = text_replace(
            &pdf,
            &[Replacement {
                find: "ABC123".into(),
                replace: "XXXXXX".into(),
                page: Some(0),
            }],
            &TextStyle::default(),
        )
        .unwrap();
        assert_eq!(changes.len(), 1);
        let text = text_of(&out, 0);
        assert!(text.contains("XXXXXX"), "got: {text}");
        assert!(!text.contains("ABC123"), "got: {text}");
    }

    #[test]
    fn replace_matches_across_show_operators() {
        // "Dealer: Jan" is 61.356pt wide in 12pt Helvetica.
        let pdf = bytes(&[vec![
            line(72.0, 700.0, 12.0, "Dealer: Jan"),
            line(133.356, 700.0, 12.0, " Kowalski"),
        ]]);
        assert_eq!(text_of(&pdf, 0), "Dealer: Jan Kowalski");

        let (out, changes) = text_replace(
            &pdf,
            &[Replacement {
                find: "Jan Kowalski".into(),
                replace: String::new(),
                page: Some(0),
            }],
            &TextStyle::default(),
        )
        .unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        // The box spans both operators.
        assert!(change.bbox.x0 < 133.0 && change.bbox.x1 > 180.0, "{:?}", change.bbox);
        let text = text_of(&out, 0);
        assert!(!text.contains("Jan"), "got: {text}");
        assert!(!text.contains("Kowalski"), "got: {text}");
        assert!(text.contains("Dealer:"), "got: {text}");
    }

    #[test]
    fn positioned_gap_reads_as_a_space() {
        // "Jan" is 19.344pt wide; the surname starts 4pt later.
        let pdf = bytes(&[vec![
            line(72.0, 700.0, 12.0, "Jan"),
            line(95.344, 700.0, 12.0, "Kowalski"),
        ]]);
        let (out, changes) = text_replace(
            &pdf,
            &[Replacement {
                find: "Jan Kowalski".into(),
                replace: "Klient".into(),
                page: None,
            }],
            &TextStyle::default(),
        )
        .unwrap();
        assert_eq!(changes.len(), 1);
        let text = text_of(&out, 0);
        assert!(!text.contains("Kowalski"), "got: {text}");
        assert!(text.contains("Klient"), "got: {text}");
    }

    #[test]
    fn block_delete_drops_vector_art_inside() {
        let mut doc = crate::pdf::fixtures::document(&[vec![line(72.0, 400.0, 12.0, "Total")]]);
        let page = page_ids(&doc)[0];
        let body = Content {
            operations: vec![
                // Backdrop enclosing the block: kept.
                Operation::new("rg", vec![1.into(), 1.into(), 0.9.into()]),
                Operation::new("re", vec![0.into(), 0.into(), 612.into(), 792.into()]),
                Operation::new("f", vec![]),
                // Red square inside the block: dropped.
                Operation::new("rg", vec![1.into(), 0.into(), 0.into()]),
                Operation::new("re", vec![100.into(), 720.into(), 50.into(), 40.into()]),
                Operation::new("f", vec![]),
                // Signature stroke straddling the block edge: dropped.
                Operation::new("m", vec![300.into(), 680.into()]),
                Operation::new("c", vec![320.into(), 700.into(), 340.into(), 650.into(), 360.into(), 670.into()]),
                Operation::new("S", vec![]),
            ],
        };
        let mut data = body.encode().unwrap();
        data.extend_from_slice(b"\n");
        data.extend_from_slice(&page_content(&doc, page).unwrap());
        let content_id = doc.add_object(Stream::new(dictionary! {}, data));
        doc.get_dictionary_mut(page).unwrap().set("Contents", content_id);
        let mut pdf = Vec::new();
        doc.save_to(&mut pdf).unwrap();

        let out = delete_blocks(
            &pdf,
            &[Block {
                page: 0,
                bbox: NormBox::new(0.0, 0.0, 100.0, 15.0),
            }],
        )
        .unwrap();

        let r = Redactor::open(&out, "out").unwrap();
        let ops = Content::decode(&page_content(&r.doc, r.pages[0]).unwrap())
            .unwrap()
            .operations;
        let rects: Vec<Vec<f64>> = ops
            .iter()
            .filter(|o| o.operator == "re")
            .map(|o| o.operands.iter().filter_map(crate::pdf::number).collect())
            .collect();
        assert!(rects.contains(&vec![0.0, 0.0, 612.0, 792.0]));
        assert!(!rects.contains(&vec![100.0, 720.0, 50.0, 40.0]), "{rects:?}");
        assert!(!ops.iter().any(|o| o.operator == "c"));
        assert!(text_of(&out, 0).contains("Total"));
    }

    #[test]
    fn text_blocks_list_lines_and_images() {
        let mut doc = crate::pdf::fixtures::document(&[
            vec![
                line(72.0, 720.0, 12.0, "Oferta nr 7"),
                line(72.0, 696.0, 10.0, "Cena 99 000 PLN"),
            ],
            vec![line(72.0, 700.0, 12.0, "Page 2")],
        ]);
        let page = page_ids(&doc)[0];
        let image = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![0],
        ));
        let mut data = page_content(&doc, page).unwrap();
        data.extend_from_slice(b"\nq 61.2 0 0 79.2 306 396 cm /Im1 Do Q\n");
        let content_id = doc.add_object(Stream::new(dictionary! {}, data));
        let page_dict = doc.get_dictionary_mut(page).unwrap();
        page_dict.set("Contents", content_id);
        localize_resources(&mut doc, page).unwrap();
        resource_dict_mut(&mut doc, page, b"XObject")
            .unwrap()
            .set("Im1", image);
        let mut pdf = Vec::new();
        doc.save_to(&mut pdf).unwrap();

        let pages = text_blocks(&pdf, None).unwrap();
        assert_eq!(pages.len(), 2);
        let first = &pages[0];
        assert_eq!((first.width, first.height), (612.0, 792.0));
        let texts: Vec<&str> = first
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Text)
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(texts, vec!["Oferta nr 7", "Cena 99 000 PLN"]);
        let heading = &first.blocks[0];
        assert!((heading.bbox.x - 72.0 / 612.0 * 100.0).abs() < 1e-6);
        assert!((heading.font_size - 12.0).abs() < 1e-6);

        let image = first
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::Image)
            .unwrap();
        assert_eq!(image.text, "[IMAGE]");
        assert!((image.bbox.x - 50.0).abs() < 1e-3);
        assert!((image.bbox.y - 40.0).abs() < 1e-3);
        assert!((image.bbox.w - 10.0).abs() < 1e-3);

        let only = text_blocks(&pdf, Some(1)).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].blocks[0].text, "Page 2");
        assert!(matches!(
            text_blocks(&pdf, Some(5)),
            Err(AnonError::InvalidPages { .. })
        ));
    }

    #[test]
    fn later_purge_keeps_earlier_covers() {
        let pdf = bytes(&[vec![line(72.0, 700.0, 12.0, "Sold by ACME Motors")]]);
        let (replaced, _) = text_replace(
            &pdf,
            &[Replacement {
                find: "ACME".into(),
                replace: "Dealer".into(),
                page: None,
            }],
            &TextStyle::default(),
        )
        .unwrap();
        let out = delete_blocks(
            &replaced,
            &[Block {
                page: 0,
                bbox: NormBox::new(0.0, 10.0, 20.0, 3.0),
            }],
        )
        .unwrap();

        let r = Redactor::open(&out, "out").unwrap();
        let ops = Content::decode(&page_content(&r.doc, r.pages[0]).unwrap())
            .unwrap()
            .operations;
        // One cover from the replacement, one from the block.
        assert_eq!(ops.iter().filter(|o| o.operator == "re").count(), 2);
    }
}
