//! Content-stream walker.
//!
//! One pass over a page's operators tracks the graphics and text state well
//! enough to place every glyph, image and form XObject in user space. The
//! same pass serves two callers:
//!
//! - [`extract`] collects placed glyphs grouped per show operator, for search
//!   and for checking what text survives a mutation;
//! - [`purge_page`] rebuilds the operator list with everything under the
//!   purge rectangles taken out.
//!
//! A glyph is purged when the centre of its box lies inside a purge rect.
//! Purged glyphs become `TJ` displacements of the same advance, so the text
//! that survives keeps its position. Images fully inside a rect are dropped;
//! partially covered ones get a repainted copy when their pixels can be
//! decoded, and are dropped otherwise. A painted path is dropped when its
//! box meets a rect, unless it encloses the rect (page backdrops, frames).

use super::fonts::{FontMetrics, ASCENT, DESCENT};
use super::image::paint_over;
use crate::error::AnonError;
use crate::geometry::UserRect;
use crate::pdf::{
    array_of, deref, dict_of, localize_resources, number, page_content, page_resources,
    resource_dict_mut,
};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::rc::Rc;
use tracing::debug;

/// Nesting limit for form XObjects.
const MAX_FORM_DEPTH: usize = 8;

/// Marked-content tag around covers drawn by earlier edits. Paths inside
/// it are never purged.
pub const COVER_TAG: &[u8] = b"AnonCover";

// ── Matrix ───────────────────────────────────────────────────────────────

/// A PDF transformation matrix `[a b c d e f]` (row-vector convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0);

    pub const fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    pub const fn translate(tx: f64, ty: f64) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    pub fn from_operands(operands: &[Object]) -> Option<Self> {
        let v: Vec<f64> = operands.iter().filter_map(number).collect();
        match v.as_slice() {
            [a, b, c, d, e, f] => Some(Self::new(*a, *b, *c, *d, *e, *f)),
            _ => None,
        }
    }

    /// `self × other`: apply `self` first, then `other`.
    pub fn then(&self, o: &Matrix) -> Matrix {
        Matrix {
            a: self.a * o.a + self.b * o.c,
            b: self.a * o.b + self.b * o.d,
            c: self.c * o.a + self.d * o.c,
            d: self.c * o.b + self.d * o.d,
            e: self.e * o.a + self.f * o.c + o.e,
            f: self.e * o.b + self.f * o.d + o.f,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    pub fn det(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    pub fn invert(&self) -> Option<Matrix> {
        let det = self.det();
        if det.abs() < 1e-12 {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        Some(Matrix {
            a,
            b,
            c,
            d,
            e: -(self.e * a + self.f * c),
            f: -(self.e * b + self.f * d),
        })
    }

    /// Axis-aligned hull of a rectangle after transformation.
    pub fn transform_rect(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> UserRect {
        let pts = [
            self.apply(x0, y0),
            self.apply(x1, y0),
            self.apply(x0, y1),
            self.apply(x1, y1),
        ];
        let (mut lx, mut ly, mut ux, mut uy) = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for (x, y) in pts {
            lx = lx.min(x);
            ly = ly.min(y);
            ux = ux.max(x);
            uy = uy.max(y);
        }
        UserRect::new(lx, ly, ux, uy)
    }
}

// ── Extracted text ───────────────────────────────────────────────────────

/// A glyph positioned in user space.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedGlyph {
    pub text: String,
    pub bbox: UserRect,
    /// Baseline origin.
    pub origin: (f64, f64),
    /// Effective size in user-space points.
    pub font_size: f64,
}

/// Glyphs in drawing order: those of one show operator, or a whole line
/// once runs are joined by [`lines`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextRun {
    pub glyphs: Vec<PlacedGlyph>,
}

impl TextRun {
    pub fn text(&self) -> String {
        self.glyphs.iter().map(|g| g.text.as_str()).collect()
    }

    /// Glyph index ranges of every non-overlapping literal occurrence of `needle`.
    pub fn find(&self, needle: &str) -> Vec<Range<usize>> {
        if needle.is_empty() {
            return Vec::new();
        }
        let mut text = String::new();
        let mut starts = Vec::with_capacity(self.glyphs.len());
        for g in &self.glyphs {
            starts.push(text.len());
            text.push_str(&g.text);
        }
        let owner = |byte: usize| starts.partition_point(|&s| s <= byte).saturating_sub(1);
        text.match_indices(needle)
            .map(|(at, m)| owner(at)..owner(at + m.len() - 1) + 1)
            .collect()
    }

    /// Union of the boxes of a glyph range.
    pub fn bbox(&self, range: Range<usize>) -> Option<UserRect> {
        self.glyphs[range]
            .iter()
            .map(|g| g.bbox)
            .reduce(|a, b| {
                UserRect::new(
                    a.llx.min(b.llx),
                    a.lly.min(b.lly),
                    a.urx.max(b.urx),
                    a.ury.max(b.ury),
                )
            })
    }
}

/// Join consecutive runs that continue the same baseline into one run per
/// line, so a search can match text split across show operators.
///
/// A run continues the previous one when its first glyph sits on the same
/// baseline and starts no further than one em past the previous glyph's end.
/// A visible gap wider than a fraction of the font size becomes a synthetic
/// space glyph covering the gap.
pub fn lines(runs: Vec<TextRun>) -> Vec<TextRun> {
    let mut out: Vec<TextRun> = Vec::new();
    for run in runs {
        let Some(first) = run.glyphs.first() else {
            continue;
        };
        let joined = out.last_mut().and_then(|line| {
            let last = line.glyphs.last()?;
            let size = last.font_size.max(first.font_size).max(1.0);
            let same_baseline = (first.origin.1 - last.origin.1).abs() <= 0.2 * size;
            let gap = first.bbox.llx - last.bbox.urx;
            (same_baseline && gap >= -0.2 * size && gap <= size).then_some((line, gap, size))
        });
        match joined {
            Some((line, gap, size)) => {
                let needs_space = gap > 0.15 * size
                    && !line.glyphs.last().is_some_and(|g| g.text.ends_with(' '))
                    && !first.text.starts_with(' ');
                if needs_space {
                    if let Some(last) = line.glyphs.last() {
                        let space = PlacedGlyph {
                            text: " ".to_string(),
                            bbox: UserRect::new(
                                last.bbox.urx,
                                last.bbox.lly,
                                first.bbox.llx,
                                last.bbox.ury,
                            ),
                            origin: (last.bbox.urx, last.origin.1),
                            font_size: last.font_size,
                        };
                        line.glyphs.push(space);
                    }
                }
                line.glyphs.extend(run.glyphs);
            }
            None => out.push(run),
        }
    }
    out
}

/// Counters reported by [`purge_page`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub glyphs_removed: usize,
    pub images_removed: usize,
    pub images_patched: usize,
    pub inline_images_removed: usize,
    pub forms_rewritten: usize,
    pub paths_removed: usize,
}

impl PurgeStats {
    pub fn merge(&mut self, other: &PurgeStats) {
        self.glyphs_removed += other.glyphs_removed;
        self.images_removed += other.images_removed;
        self.images_patched += other.images_patched;
        self.inline_images_removed += other.inline_images_removed;
        self.forms_rewritten += other.forms_rewritten;
        self.paths_removed += other.paths_removed;
    }
}

/// Rewritten page body plus what was taken out.
#[derive(Debug)]
pub struct PurgeOutcome {
    pub body: Vec<u8>,
    pub stats: PurgeStats,
}

// ── Walker ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct GState {
    ctm: Matrix,
    font: Option<Rc<FontMetrics>>,
    font_size: f64,
    char_spacing: f64,
    word_spacing: f64,
    h_scale: f64,
    leading: f64,
    rise: f64,
}

impl Default for GState {
    fn default() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            font: None,
            font_size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            h_scale: 1.0,
            leading: 0.0,
            rise: 0.0,
        }
    }
}

/// Replacement XObject to register on the page under `name`.
struct Patch {
    name: Vec<u8>,
    stream: Stream,
}

/// State shared across nested form walks.
#[derive(Default)]
struct Shared {
    runs: Vec<TextRun>,
    images: Vec<UserRect>,
    patches: Vec<Patch>,
    stats: PurgeStats,
    taken: HashSet<Vec<u8>>,
    counter: usize,
}

impl Shared {
    fn fresh_name(&mut self, prefix: &str) -> Vec<u8> {
        loop {
            self.counter += 1;
            let name = format!("{prefix}{}", self.counter).into_bytes();
            if self.taken.insert(name.clone()) {
                return name;
            }
        }
    }
}

enum DoOutcome {
    Keep,
    Replace(Operation),
    Drop,
}

/// Accumulates a rewritten `TJ` array, merging adjacent strings and numbers.
#[derive(Default)]
struct Rebuilt {
    items: Vec<Object>,
    text: Vec<u8>,
    format: Option<lopdf::StringFormat>,
    gap: f64,
}

impl Rebuilt {
    fn keep(&mut self, raw: &[u8], format: &lopdf::StringFormat) {
        if self.gap != 0.0 {
            self.flush_text();
            self.items.push(Object::Real(self.gap as f32));
            self.gap = 0.0;
        } else if self.format.as_ref() != Some(format) {
            self.flush_text();
        }
        self.format = Some(format.clone());
        self.text.extend_from_slice(raw);
    }

    fn gap(&mut self, n: f64) {
        self.flush_text();
        self.gap += n;
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let format = self.format.clone().unwrap_or(lopdf::StringFormat::Literal);
            self.items
                .push(Object::String(std::mem::take(&mut self.text), format));
        }
    }

    fn finish(mut self) -> Vec<Object> {
        self.flush_text();
        if self.gap != 0.0 {
            self.items.push(Object::Real(self.gap as f32));
        }
        self.items
    }
}

fn contains_point(r: &UserRect, x: f64, y: f64) -> bool {
    r.llx <= x && x <= r.urx && r.lly <= y && y <= r.ury
}

fn is_path_construction(operator: &str) -> bool {
    matches!(operator, "m" | "l" | "c" | "v" | "y" | "re" | "h")
}

fn is_path_paint(operator: &str) -> bool {
    matches!(
        operator,
        "S" | "s" | "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" | "n"
    )
}

/// Grow `acc` by the user-space points a path construction operator adds.
fn extend_path_box(acc: &mut Option<UserRect>, op: &Operation, ctm: &Matrix) {
    let v = operand_numbers(op);
    let added = if op.operator == "re" {
        match v.as_slice() {
            [x, y, w, h] => Some(ctm.transform_rect(*x, *y, x + w, y + h)),
            _ => None,
        }
    } else {
        v.chunks_exact(2)
            .map(|p| {
                let (x, y) = ctm.apply(p[0], p[1]);
                UserRect::new(x, y, x, y)
            })
            .reduce(|a, b| {
                UserRect::new(
                    a.llx.min(b.llx),
                    a.lly.min(b.lly),
                    a.urx.max(b.urx),
                    a.ury.max(b.ury),
                )
            })
    };
    if let Some(b) = added {
        *acc = Some(match acc.take() {
            Some(a) => UserRect::new(
                a.llx.min(b.llx),
                a.lly.min(b.lly),
                a.urx.max(b.urx),
                a.ury.max(b.ury),
            ),
            None => b,
        });
    }
}

fn operand_numbers(op: &Operation) -> Vec<f64> {
    op.operands.iter().filter_map(number).collect()
}

fn name_of(doc: &Document, obj: Option<&Object>) -> Option<Vec<u8>> {
    match obj.and_then(|o| deref(doc, o))? {
        Object::Name(n) => Some(n.clone()),
        _ => None,
    }
}

struct Walker<'d> {
    doc: &'d Document,
    purge: &'d [UserRect],
    resources: Dictionary,
    fonts: HashMap<Vec<u8>, Rc<FontMetrics>>,
    depth: usize,
}

impl<'d> Walker<'d> {
    fn new(doc: &'d Document, purge: &'d [UserRect], resources: Dictionary, depth: usize) -> Self {
        Self {
            doc,
            purge,
            resources,
            fonts: HashMap::new(),
            depth,
        }
    }

    fn font(&mut self, name: &[u8]) -> Rc<FontMetrics> {
        if let Some(f) = self.fonts.get(name) {
            return f.clone();
        }
        let metrics = self
            .resources
            .get(b"Font")
            .ok()
            .and_then(|o| dict_of(self.doc, o))
            .and_then(|fonts| fonts.get(name).ok())
            .and_then(|o| dict_of(self.doc, o))
            .map(|d| FontMetrics::load(self.doc, d))
            .unwrap_or_default();
        let metrics = Rc::new(metrics);
        self.fonts.insert(name.to_vec(), metrics.clone());
        metrics
    }

    fn xobject(&self, name: &[u8]) -> Option<&Stream> {
        let entry = self
            .resources
            .get(b"XObject")
            .ok()
            .and_then(|o| dict_of(self.doc, o))?
            .get(name)
            .ok()?;
        match deref(self.doc, entry)? {
            Object::Stream(s) => Some(s),
            _ => None,
        }
    }

    fn hits(&self, bbox: &UserRect) -> bool {
        self.purge.iter().any(|r| r.intersects(bbox))
    }

    /// A path is purged when it meets a rect without enclosing it.
    fn hits_path(&self, bbox: &UserRect) -> bool {
        self.purge
            .iter()
            .any(|r| r.intersects(bbox) && !bbox.contains(r))
    }

    fn walk(
        &mut self,
        ops: Vec<Operation>,
        mut gs: GState,
        shared: &mut Shared,
    ) -> Result<(Vec<Operation>, bool), AnonError> {
        let mut stack: Vec<GState> = Vec::new();
        let mut tm = Matrix::IDENTITY;
        let mut tlm = Matrix::IDENTITY;
        let mut out = Vec::with_capacity(ops.len());
        let mut changed = false;
        let mut path: Vec<Operation> = Vec::new();
        let mut path_box: Option<UserRect> = None;
        let mut marked: Vec<bool> = Vec::new();
        let mut iter = ops.into_iter().peekable();

        while let Some(op) = iter.next() {
            let clip = op.operator == "W" || op.operator == "W*";
            if is_path_construction(&op.operator) {
                extend_path_box(&mut path_box, &op, &gs.ctm);
                path.push(op);
                continue;
            }
            if clip {
                path.push(op);
                continue;
            }
            if is_path_paint(&op.operator) {
                let built = std::mem::take(&mut path);
                let bbox = path_box.take();
                let ours = marked.contains(&true);
                if op.operator != "n" && !ours && bbox.is_some_and(|b| self.hits_path(&b)) {
                    shared.stats.paths_removed += 1;
                    changed = true;
                    if built.iter().any(|p| p.operator == "W" || p.operator == "W*") {
                        // Keep the clip, drop the paint.
                        out.extend(built);
                        out.push(Operation::new("n", vec![]));
                    }
                    continue;
                }
                out.extend(built);
                out.push(op);
                continue;
            }
            if !path.is_empty() {
                // Unterminated path; pass it through.
                out.append(&mut path);
                path_box = None;
            }
            match op.operator.as_str() {
                "BMC" | "BDC" => marked.push(matches!(
                    op.operands.first(),
                    Some(Object::Name(tag)) if tag.as_slice() == COVER_TAG
                )),
                "EMC" => {
                    marked.pop();
                }
                "q" => stack.push(gs.clone()),
                "Q" => {
                    if let Some(prev) = stack.pop() {
                        gs = prev;
                    }
                }
                "cm" => {
                    if let Some(m) = Matrix::from_operands(&op.operands) {
                        gs.ctm = m.then(&gs.ctm);
                    }
                }
                "BT" => {
                    tm = Matrix::IDENTITY;
                    tlm = Matrix::IDENTITY;
                }
                "Tf" => {
                    if let [Object::Name(name), size] = op.operands.as_slice() {
                        gs.font = Some(self.font(name));
                        gs.font_size = number(size).unwrap_or(gs.font_size);
                    }
                }
                "Tc" | "Tw" | "Tz" | "TL" | "Ts" => {
                    if let Some(v) = operand_numbers(&op).first().copied() {
                        match op.operator.as_str() {
                            "Tc" => gs.char_spacing = v,
                            "Tw" => gs.word_spacing = v,
                            "Tz" => gs.h_scale = v / 100.0,
                            "TL" => gs.leading = v,
                            _ => gs.rise = v,
                        }
                    }
                }
                "Td" | "TD" => {
                    if let [tx, ty] = operand_numbers(&op).as_slice() {
                        if op.operator == "TD" {
                            gs.leading = -ty;
                        }
                        tlm = Matrix::translate(*tx, *ty).then(&tlm);
                        tm = tlm;
                    }
                }
                "Tm" => {
                    if let Some(m) = Matrix::from_operands(&op.operands) {
                        tlm = m;
                        tm = m;
                    }
                }
                "T*" => {
                    tlm = Matrix::translate(0.0, -gs.leading).then(&tlm);
                    tm = tlm;
                }
                "Tj" | "TJ" | "'" | "\"" => {
                    if let Some(replacement) =
                        self.show(&op, &mut gs, &mut tm, &mut tlm, shared)
                    {
                        changed = true;
                        out.extend(replacement);
                        continue;
                    }
                }
                "Do" => match self.do_xobject(&op, &gs, shared)? {
                    DoOutcome::Keep => {}
                    DoOutcome::Replace(new_op) => {
                        changed = true;
                        out.push(new_op);
                        continue;
                    }
                    DoOutcome::Drop => {
                        changed = true;
                        continue;
                    }
                },
                "BI" => {
                    let bbox = gs.ctm.transform_rect(0.0, 0.0, 1.0, 1.0);
                    shared.images.push(bbox);
                    if self.hits(&bbox) {
                        shared.stats.inline_images_removed += 1;
                        changed = true;
                        if iter.peek().is_some_and(|next| next.operator == "ID") {
                            for skipped in iter.by_ref() {
                                if skipped.operator == "EI" {
                                    break;
                                }
                            }
                        }
                        continue;
                    }
                }
                _ => {}
            }
            out.push(op);
        }
        out.append(&mut path);
        Ok((out, changed))
    }

    /// Place the glyphs of a show operator. Returns replacement operators when
    /// any glyph falls under a purge rect.
    fn show(
        &mut self,
        op: &Operation,
        gs: &mut GState,
        tm: &mut Matrix,
        tlm: &mut Matrix,
        shared: &mut Shared,
    ) -> Option<Vec<Operation>> {
        let mut prefix = Vec::new();
        let elements: Vec<Object> = match op.operator.as_str() {
            "TJ" => match op.operands.first() {
                Some(Object::Array(items)) => items.clone(),
                _ => return None,
            },
            "\"" => {
                let [aw, ac, s] = op.operands.as_slice() else {
                    return None;
                };
                gs.word_spacing = number(aw).unwrap_or(gs.word_spacing);
                gs.char_spacing = number(ac).unwrap_or(gs.char_spacing);
                prefix.push(Operation::new("Tw", vec![aw.clone()]));
                prefix.push(Operation::new("Tc", vec![ac.clone()]));
                vec![s.clone()]
            }
            _ => op.operands.first().cloned().into_iter().collect(),
        };
        if op.operator == "'" || op.operator == "\"" {
            *tlm = Matrix::translate(0.0, -gs.leading).then(tlm);
            *tm = *tlm;
            prefix.push(Operation::new("T*", vec![]));
        }

        let font = gs.font.clone().unwrap_or_default();
        let fs = gs.font_size;
        let th = gs.h_scale;
        let can_purge = fs != 0.0 && th != 0.0 && !self.purge.is_empty();
        let mut run = TextRun::default();
        let mut rebuilt = Rebuilt::default();
        let mut removed = 0;

        for element in &elements {
            let Object::String(bytes, format) = element else {
                if let Some(n) = number(element) {
                    *tm = Matrix::translate(-n / 1000.0 * fs * th, 0.0).then(tm);
                    rebuilt.gap(n);
                }
                continue;
            };
            for (code, raw) in font.codes(bytes) {
                let w0 = font.width(code) / 1000.0;
                let text_to_user = tm.then(&gs.ctm);
                let trm = Matrix::new(fs * th, 0.0, 0.0, fs, 0.0, gs.rise).then(&text_to_user);
                let bbox = trm.transform_rect(0.0, DESCENT, w0, ASCENT);
                let spacing = gs.char_spacing
                    + if !font.is_two_byte() && code == 32 {
                        gs.word_spacing
                    } else {
                        0.0
                    };
                let tx = (w0 * fs + spacing) * th;

                let cx = (bbox.llx + bbox.urx) / 2.0;
                let cy = (bbox.lly + bbox.ury) / 2.0;
                if can_purge && self.purge.iter().any(|r| contains_point(r, cx, cy)) {
                    removed += 1;
                    rebuilt.gap(-tx / (fs * th) * 1000.0);
                } else {
                    run.glyphs.push(PlacedGlyph {
                        text: font.decode(code),
                        bbox,
                        origin: trm.apply(0.0, 0.0),
                        font_size: fs * text_to_user.det().abs().sqrt(),
                    });
                    rebuilt.keep(&raw, format);
                }
                *tm = Matrix::translate(tx, 0.0).then(tm);
            }
        }

        if !run.glyphs.is_empty() {
            shared.runs.push(run);
        }
        if removed == 0 {
            return None;
        }
        shared.stats.glyphs_removed += removed;
        prefix.push(Operation::new("TJ", vec![Object::Array(rebuilt.finish())]));
        Some(prefix)
    }

    fn do_xobject(
        &self,
        op: &Operation,
        gs: &GState,
        shared: &mut Shared,
    ) -> Result<DoOutcome, AnonError> {
        let Some(Object::Name(name)) = op.operands.first() else {
            return Ok(DoOutcome::Keep);
        };
        let Some(stream) = self.xobject(name) else {
            return Ok(DoOutcome::Keep);
        };

        match name_of(self.doc, stream.dict.get(b"Subtype").ok()).as_deref() {
            Some(b"Image") => {
                let bbox = gs.ctm.transform_rect(0.0, 0.0, 1.0, 1.0);
                shared.images.push(bbox);
                if !self.hits(&bbox) {
                    return Ok(DoOutcome::Keep);
                }
                let covered = self.purge.iter().any(|r| r.contains(&bbox));
                if !covered && self.depth == 0 {
                    if let Some(patched) = paint_over(stream, &gs.ctm, self.purge) {
                        let new_name = shared.fresh_name("AnonIm");
                        debug!(
                            "Repainted image {} as {}",
                            String::from_utf8_lossy(name),
                            String::from_utf8_lossy(&new_name)
                        );
                        shared.patches.push(Patch {
                            name: new_name.clone(),
                            stream: patched,
                        });
                        shared.stats.images_patched += 1;
                        return Ok(DoOutcome::Replace(Operation::new(
                            "Do",
                            vec![Object::Name(new_name)],
                        )));
                    }
                }
                shared.stats.images_removed += 1;
                Ok(DoOutcome::Drop)
            }
            Some(b"Form") => self.form(name, stream, gs, shared),
            _ => Ok(DoOutcome::Keep),
        }
    }

    fn form(
        &self,
        name: &[u8],
        stream: &Stream,
        gs: &GState,
        shared: &mut Shared,
    ) -> Result<DoOutcome, AnonError> {
        let matrix = stream
            .dict
            .get(b"Matrix")
            .ok()
            .and_then(|o| array_of(self.doc, o))
            .and_then(|a| Matrix::from_operands(a))
            .unwrap_or(Matrix::IDENTITY);
        let ctm = matrix.then(&gs.ctm);

        if self.depth + 1 >= MAX_FORM_DEPTH {
            let bbox = stream
                .dict
                .get(b"BBox")
                .ok()
                .and_then(|o| array_of(self.doc, o))
                .map(|a| a.iter().filter_map(number).collect::<Vec<f64>>());
            let hit = match bbox.as_deref() {
                Some([x0, y0, x1, y1]) => self.hits(&ctm.transform_rect(*x0, *y0, *x1, *y1)),
                _ => !self.purge.is_empty(),
            };
            return Ok(if hit { DoOutcome::Drop } else { DoOutcome::Keep });
        }

        let data = stream
            .decompressed_content()
            .unwrap_or_else(|_| stream.content.clone());
        let ops = Content::decode(&data)?.operations;
        let resources = stream
            .dict
            .get(b"Resources")
            .ok()
            .and_then(|o| dict_of(self.doc, o))
            .cloned()
            .unwrap_or_else(|| self.resources.clone());

        let mut child = Walker::new(self.doc, self.purge, resources, self.depth + 1);
        let child_gs = GState { ctm, ..gs.clone() };
        let (new_ops, changed) = child.walk(ops, child_gs, shared)?;
        if !changed {
            return Ok(DoOutcome::Keep);
        }
        if self.depth > 0 {
            return Ok(DoOutcome::Drop);
        }

        let mut dict = stream.dict.clone();
        dict.remove(b"Filter");
        dict.remove(b"DecodeParms");
        let copy = Stream::new(dict, Content { operations: new_ops }.encode()?);
        let new_name = shared.fresh_name("AnonFm");
        debug!(
            "Rewrote form {} as {}",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(&new_name)
        );
        shared.patches.push(Patch {
            name: new_name.clone(),
            stream: copy,
        });
        shared.stats.forms_rewritten += 1;
        Ok(DoOutcome::Replace(Operation::new(
            "Do",
            vec![Object::Name(new_name)],
        )))
    }
}

fn do_names(ops: &[Operation]) -> BTreeSet<Vec<u8>> {
    ops.iter()
        .filter(|op| op.operator == "Do")
        .filter_map(|op| match op.operands.first() {
            Some(Object::Name(n)) => Some(n.clone()),
            _ => None,
        })
        .collect()
}

fn page_operations(doc: &Document, page_id: ObjectId) -> Result<Vec<Operation>, AnonError> {
    let content = page_content(doc, page_id)?;
    Ok(Content::decode(&content)?.operations)
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Everything [`placements`] finds on a page.
#[derive(Debug, Clone, Default)]
pub struct Placements {
    pub runs: Vec<TextRun>,
    /// User-space boxes of image XObjects and inline images.
    pub images: Vec<UserRect>,
}

/// Placed text and images of a page, including those inside form XObjects.
pub fn placements(doc: &Document, page_id: ObjectId) -> Result<Placements, AnonError> {
    let ops = page_operations(doc, page_id)?;
    let mut shared = Shared::default();
    Walker::new(doc, &[], page_resources(doc, page_id), 0).walk(
        ops,
        GState::default(),
        &mut shared,
    )?;
    Ok(Placements {
        runs: shared.runs,
        images: shared.images,
    })
}

/// Placed text of a page, one run per show operator, including form XObjects.
pub fn extract(doc: &Document, page_id: ObjectId) -> Result<Vec<TextRun>, AnonError> {
    Ok(placements(doc, page_id)?.runs)
}

/// Page text, one line per joined baseline.
pub fn page_text(doc: &Document, page_id: ObjectId) -> Result<String, AnonError> {
    Ok(lines(extract(doc, page_id)?)
        .iter()
        .map(TextRun::text)
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Rebuild a page's operators without anything under `purge`.
///
/// Replacement XObjects are registered in the page's (localized) resources
/// and XObject names the page no longer draws are unregistered. The caller
/// owns writing `body` back as the page content.
pub fn purge_page(
    doc: &mut Document,
    page_id: ObjectId,
    purge: &[UserRect],
) -> Result<PurgeOutcome, AnonError> {
    let ops = page_operations(doc, page_id)?;
    let old_names = do_names(&ops);
    let resources = page_resources(doc, page_id);

    let mut shared = Shared::default();
    if let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| dict_of(doc, o)) {
        shared.taken = xobjects.iter().map(|(k, _)| k.clone()).collect();
    }
    let (new_ops, _) =
        Walker::new(doc, purge, resources, 0).walk(ops, GState::default(), &mut shared)?;
    let new_names = do_names(&new_ops);

    localize_resources(doc, page_id)?;
    for patch in shared.patches {
        let id = doc.add_object(patch.stream);
        resource_dict_mut(doc, page_id, b"XObject")?.set(patch.name, id);
    }
    let xobjects = resource_dict_mut(doc, page_id, b"XObject")?;
    for stale in old_names.difference(&new_names) {
        xobjects.remove(stale);
    }

    Ok(PurgeOutcome {
        body: Content { operations: new_ops }.encode()?,
        stats: shared.stats,
    })
}
