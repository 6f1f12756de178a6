//! Shared fixtures for the integration tests: in-memory offer PDFs, a
//! rasterizer that needs no pdfium, and a classifier with canned answers.

#![allow(dead_code)]

use async_trait::async_trait;
use image::DynamicImage;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use offer_anonymizer::job::{FindingsReport, SectionsReport};
use offer_anonymizer::pdf::{load_document, page_ids};
use offer_anonymizer::redact::content;
use offer_anonymizer::{
    Action, AnonError, Classifier, ClassifierError, DigitalTwin, Finding, FsStorage, JobPipeline,
    JobStatus, MemoryJobStore, NormBox, PageRasterizer, ParseOutcome, PipelineConfig,
    PipelineObserver, RenderedPage, Section,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

// ── PDF fixtures ─────────────────────────────────────────────────────────────

/// Build a 612×792 document, one page per entry. Each line is drawn in
/// 12pt Helvetica at (72, y) with y stepping down from 720.
pub fn offer_pdf(pages: &[&[&str]]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    for lines in pages {
        let mut ops = Vec::new();
        for (i, text) in lines.iter().enumerate() {
            let y = 720.0 - 24.0 * i as f32;
            ops.push(Operation::new("BT", vec![]));
            ops.push(Operation::new("Tf", vec!["F1".into(), Object::Real(12.0)]));
            ops.push(Operation::new(
                "Td",
                vec![Object::Real(72.0), Object::Real(y)],
            ));
            ops.push(Operation::new("Tj", vec![Object::string_literal(*text)]));
            ops.push(Operation::new("ET", vec![]));
        }
        let content = Content { operations: ops };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).expect("save fixture");
    out
}

/// A three-page dealer offer with a customer block on page 1, pricing on
/// page 2 and the dealer footer on page 3.
pub fn dealer_offer() -> Vec<u8> {
    offer_pdf(&[
        &[
            "Oferta nr 2024/118 dla klienta",
            "Klient: Jan Kowalski, tel. 600 123 456",
            "Toyota Corolla 1.8 Hybrid Comfort, kolor srebrny",
        ],
        &[
            "Cena katalogowa: 129 900 PLN brutto",
            "Rabat dealerski: 8 000 PLN",
            "Cena koncowa: 121 900 PLN brutto",
        ],
        &[
            "Salon Auto Nowak Sp. z o.o., ul. Polna 5, Warszawa",
            "Doradca: Anna Wisniewska, anna@autonowak.pl",
        ],
    ])
}

pub fn page_count(bytes: &[u8]) -> usize {
    Document::load_mem(bytes).expect("load").get_pages().len()
}

/// Text shown on a 0-indexed page, one run per line.
pub fn page_text(bytes: &[u8], page: usize) -> String {
    let doc = load_document(bytes, "fixture").expect("load");
    let ids = page_ids(&doc);
    content::page_text(&doc, ids[page]).expect("page text")
}

// ── Rasterizer stub ──────────────────────────────────────────────────────────

/// Renders every page as a blank 16×16 image; counts pages with lopdf.
/// Thumbnail rendering can be switched to fail.
#[derive(Default)]
pub struct BlankRasterizer {
    pub fail_thumbnails: AtomicBool,
}

fn blank_pages(pdf: &[u8], limit: usize) -> Result<Vec<RenderedPage>, AnonError> {
    let doc = Document::load_mem(pdf).map_err(|e| AnonError::CorruptPdf {
        path: "fixture".into(),
        detail: e.to_string(),
    })?;
    Ok((0..doc.get_pages().len().min(limit))
        .map(|index| RenderedPage {
            index,
            image: DynamicImage::new_rgb8(16, 16),
        })
        .collect())
}

#[async_trait]
impl PageRasterizer for BlankRasterizer {
    async fn render_pages(
        &self,
        pdf: &[u8],
        _dpi: u32,
        max_pages: usize,
    ) -> Result<Vec<RenderedPage>, AnonError> {
        blank_pages(pdf, max_pages)
    }

    async fn thumbnails(
        &self,
        pdf: &[u8],
        _max_width: u32,
    ) -> Result<Vec<RenderedPage>, AnonError> {
        if self.fail_thumbnails.load(Ordering::SeqCst) {
            return Err(AnonError::Internal("pdfium library not bound".into()));
        }
        blank_pages(pdf, usize::MAX)
    }
}

// ── Classifier stub ──────────────────────────────────────────────────────────

pub fn finding(id: &str, category: &str, page: usize, bbox: NormBox, action: Action) -> Finding {
    Finding {
        id: id.into(),
        category: category.into(),
        label: format!("{category} on page {page}"),
        value_preview: String::new(),
        page,
        bbox,
        confidence: 0.9,
        suggested_action: Some(action),
    }
}

/// Findings matching [`dealer_offer`]: customer name (page 1), discount
/// (page 2) and the dealer footer (page 3).
pub fn dealer_findings() -> Vec<Finding> {
    vec![
        finding(
            "finding_001",
            "personal",
            1,
            NormBox::new(10.0, 10.0, 60.0, 4.0),
            Action::Remove,
        ),
        finding(
            "finding_002",
            "discount",
            2,
            NormBox::new(10.0, 10.0, 60.0, 4.0),
            Action::Mask,
        ),
        finding(
            "finding_003",
            "dealer",
            3,
            NormBox::new(10.0, 8.0, 80.0, 8.0),
            Action::Remove,
        ),
    ]
}

/// Classifier with fixed answers. Can be switched to "unreachable".
pub struct CannedClassifier {
    pub findings: Vec<Finding>,
    pub calls: AtomicUsize,
    pub unreachable: AtomicBool,
}

impl CannedClassifier {
    pub fn new(findings: Vec<Finding>) -> Arc<Self> {
        Arc::new(Self {
            findings,
            calls: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ClassifierError::Unreachable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Classifier for CannedClassifier {
    async fn detect_sections(
        &self,
        _images: &[Vec<u8>],
    ) -> Result<ParseOutcome<SectionsReport>, ClassifierError> {
        self.enter()?;
        Ok(ParseOutcome::Parsed(SectionsReport {
            document_type: "dealer_offer".into(),
            sections: vec![Section {
                id: "section_001".into(),
                title: "Pricing".into(),
                category: "pricing".into(),
                page_range: vec![2, 2],
                confidence: 0.8,
            }],
        }))
    }

    async fn detect_findings(
        &self,
        _images: &[Vec<u8>],
    ) -> Result<ParseOutcome<FindingsReport>, ClassifierError> {
        self.enter()?;
        Ok(ParseOutcome::Parsed(FindingsReport {
            findings: self.findings.clone(),
        }))
    }

    async fn extract_structured(
        &self,
        _images: &[Vec<u8>],
        filename: &str,
    ) -> Result<ParseOutcome<DigitalTwin>, ClassifierError> {
        self.enter()?;
        let mut twin = DigitalTwin::empty(filename);
        twin.vehicle.brand = Some("Toyota".into());
        twin.vehicle.model = Some("Corolla".into());
        twin.pricing.final_price = Some(121_900.0);
        twin.confidence = 0.75;
        Ok(ParseOutcome::Parsed(twin))
    }
}

// ── Observer ─────────────────────────────────────────────────────────────────

/// Records every status and progress notification.
#[derive(Default)]
pub struct RecordingObserver {
    pub statuses: Mutex<Vec<JobStatus>>,
    pub progress: Mutex<Vec<u8>>,
    pub advisories: Mutex<Vec<String>>,
    pub failures: Mutex<Vec<String>>,
}

impl PipelineObserver for RecordingObserver {
    fn on_status(&self, _job_id: Uuid, status: JobStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_progress(&self, _job_id: Uuid, progress: u8) {
        self.progress.lock().unwrap().push(progress);
    }

    fn on_advisory(&self, _job_id: Uuid, message: &str) {
        self.advisories.lock().unwrap().push(message.to_string());
    }

    fn on_failed(&self, _job_id: Uuid, error: &str) {
        self.failures.lock().unwrap().push(error.to_string());
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub pipeline: Arc<JobPipeline>,
    pub classifier: Arc<CannedClassifier>,
    pub rasterizer: Arc<BlankRasterizer>,
    pub observer: Arc<RecordingObserver>,
    pub dir: TempDir,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("offer_anonymizer=debug")
        .try_init();
}

pub fn harness(findings: Vec<Finding>) -> Harness {
    harness_with(findings, |b| b)
}

pub fn harness_with(
    findings: Vec<Finding>,
    configure: impl FnOnce(offer_anonymizer::PipelineConfigBuilder) -> offer_anonymizer::PipelineConfigBuilder,
) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = configure(PipelineConfig::builder().storage_root(dir.path()))
        .build()
        .expect("config");
    let classifier = CannedClassifier::new(findings);
    let observer = Arc::new(RecordingObserver::default());
    let rasterizer = Arc::new(BlankRasterizer::default());
    let pipeline = JobPipeline::new(
        Arc::new(FsStorage::new(dir.path())),
        Arc::new(MemoryJobStore::new()),
        rasterizer.clone(),
        classifier.clone(),
        config,
    )
    .with_observer(observer.clone());
    Harness {
        pipeline: Arc::new(pipeline),
        classifier,
        rasterizer,
        observer,
        dir,
    }
}
