//! Job and analysis data model.
//!
//! A [`Job`] is one document's trip through the pipeline. It is persisted as
//! a whole entity (read-modify-write) through [`crate::store::JobStore`]; the
//! pipeline mutates the in-memory struct and calls `save` at each checkpoint.

use crate::analysis::blend_confidence;
use crate::geometry::NormBox;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ── Status & mode ────────────────────────────────────────────────────────

/// Pipeline status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Analyzing,
    Review,
    Rendering,
    Done,
    Failed,
}

impl JobStatus {
    /// Statuses in which a worker is (or was) actively running the job.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Processing | JobStatus::Analyzing | JobStatus::Rendering
        )
    }

    /// Statuses in which the document may be edited or rendered.
    pub fn is_editable(self) -> bool {
        matches!(self, JobStatus::Review | JobStatus::Done)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Review => "review",
            JobStatus::Rendering => "rendering",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Output mode chosen at upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Full structured extraction plus redacted PDF.
    #[default]
    Unify,
    /// In-place redaction only.
    Layout,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Unify => f.write_str("unify"),
            Mode::Layout => f.write_str("layout"),
        }
    }
}

/// Operator decision for a finding or section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Cover and purge the underlying content.
    Remove,
    /// Cover visually; content stays in the file.
    Mask,
    #[default]
    Keep,
}

impl Action {
    pub fn redacts(self) -> bool {
        !matches!(self, Action::Keep)
    }
}

// ── Analysis results ─────────────────────────────────────────────────────

/// A sensitive region detected by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub category: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub value_preview: String,
    /// 1-indexed page as reported by the classifier.
    pub page: usize,
    pub bbox: NormBox,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub suggested_action: Option<Action>,
}

impl Finding {
    /// 0-indexed page, or `None` when the classifier reported page 0.
    pub fn page_index(&self) -> Option<usize> {
        self.page.checked_sub(1)
    }

    /// Operator decision if one exists, else the suggestion, else keep.
    pub fn resolve(&self, decisions: &BTreeMap<String, Action>) -> Action {
        decisions
            .get(&self.id)
            .copied()
            .or(self.suggested_action)
            .unwrap_or_default()
    }
}

/// A logical section of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub category: String,
    /// `[start_page, end_page]`, 1-indexed inclusive.
    #[serde(default)]
    pub page_range: Vec<usize>,
    #[serde(default)]
    pub confidence: f64,
}

/// Output of the section-detection stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SectionsReport {
    #[serde(default = "default_document_type")]
    pub document_type: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

fn default_document_type() -> String {
    "other".to_string()
}

/// Output of the finding-detection stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FindingsReport {
    #[serde(default)]
    pub findings: Vec<Finding>,
}

// ── Structured record ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleInfo {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub year: Option<i32>,
    pub vin: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    pub mileage_km: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PowertrainInfo {
    /// ICE, HEV, PHEV or BEV.
    pub engine_type: Option<String>,
    pub engine_name: Option<String>,
    pub fuel_type: Option<String>,
    pub displacement_cc: Option<u32>,
    pub power_hp: Option<u32>,
    pub power_kw: Option<u32>,
    pub torque_nm: Option<u32>,
    pub transmission: Option<String>,
    pub drivetrain: Option<String>,
    pub battery_kwh: Option<f64>,
    pub range_km: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentInfo {
    pub packages: Vec<String>,
    pub options: Vec<String>,
    pub standard_features: Vec<String>,
    pub safety: Vec<String>,
    pub comfort: Vec<String>,
    pub multimedia: Vec<String>,
    pub exterior: Vec<String>,
    pub interior: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionsInfo {
    pub length_mm: Option<u32>,
    pub width_mm: Option<u32>,
    pub height_mm: Option<u32>,
    pub wheelbase_mm: Option<u32>,
    pub boot_capacity_l: Option<u32>,
    pub curb_weight_kg: Option<u32>,
    pub gross_weight_kg: Option<u32>,
}

/// Sanitised pricing: discounts are never carried over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingInfo {
    pub list_price: Option<f64>,
    pub final_price: Option<f64>,
    pub currency: String,
    pub tax_type: String,
    pub discounts_removed: bool,
    /// `final_only` or `msrp_only`.
    pub pricing_strategy: String,
}

impl Default for PricingInfo {
    fn default() -> Self {
        Self {
            list_price: None,
            final_price: None,
            currency: "PLN".to_string(),
            tax_type: "VAT".to_string(),
            discounts_removed: true,
            pricing_strategy: "final_only".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityInfo {
    pub status: Option<String>,
    pub delivery_time: Option<String>,
    /// City or region only.
    pub location_general: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinSection {
    pub id: String,
    pub title: String,
    pub category: String,
    pub content_md: Option<String>,
    pub source_pages: Vec<usize>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Provenance {
    pub field_path: String,
    pub source_page: usize,
    pub evidence_snippet: String,
    pub confidence: f64,
}

/// One operator or pipeline action recorded in the twin's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditAction {
    /// `mask`, `remove_section`, `remove_page`, `edit_field`, `extract`, ...
    pub action_type: String,
    pub target: String,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Structured record extracted in `unify` mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalTwin {
    pub source_file: String,
    pub processed_at: DateTime<Utc>,
    pub mode: Mode,
    pub confidence: f64,
    pub vehicle: VehicleInfo,
    pub powertrain: PowertrainInfo,
    pub equipment: EquipmentInfo,
    pub dimensions: DimensionsInfo,
    pub pricing: PricingInfo,
    pub availability: AvailabilityInfo,
    pub sections: Vec<TwinSection>,
    pub provenance: Vec<Provenance>,
    pub audit: Vec<AuditAction>,
    pub notes: Option<String>,
}

impl Default for DigitalTwin {
    fn default() -> Self {
        Self {
            source_file: String::new(),
            processed_at: Utc::now(),
            mode: Mode::Unify,
            confidence: 0.0,
            vehicle: VehicleInfo::default(),
            powertrain: PowertrainInfo::default(),
            equipment: EquipmentInfo::default(),
            dimensions: DimensionsInfo::default(),
            pricing: PricingInfo::default(),
            availability: AvailabilityInfo::default(),
            sections: Vec::new(),
            provenance: Vec::new(),
            audit: Vec::new(),
            notes: None,
        }
    }
}

impl DigitalTwin {
    /// The zero-confidence record a degraded extraction stage yields.
    pub fn empty(source_file: &str) -> Self {
        Self {
            source_file: source_file.to_string(),
            ..Self::default()
        }
    }
}

// ── Artifacts & audit ────────────────────────────────────────────────────

/// A superseded artifact kept for audit. Never re-entered into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: String,
    /// Operation that superseded this artifact.
    pub superseded_by: String,
    pub at: DateTime<Utc>,
}

/// Audit record written by a successful render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub mode: Mode,
    pub decisions: BTreeMap<String, Action>,
    pub findings_count: usize,
    pub redactions_applied: usize,
}

// ── Job ──────────────────────────────────────────────────────────────────

/// One document's processing lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub filename: String,
    pub mode: Mode,
    pub status: JobStatus,
    /// 0–100, non-decreasing within a run; reset only by retry.
    pub progress: u8,
    pub page_count: usize,
    pub file_size: u64,

    /// Storage path of the artifact every operation reads from.
    pub current_input_path: String,
    #[serde(default)]
    pub artifact_history: Vec<ArtifactRecord>,
    #[serde(default)]
    pub thumbnails: Vec<String>,

    pub output_pdf_path: Option<String>,
    pub output_json_path: Option<String>,
    pub audit_path: Option<String>,

    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub twin: Option<DigitalTwin>,
    #[serde(default)]
    pub decisions: BTreeMap<String, Action>,
    pub confidence: f64,

    pub error_message: Option<String>,
    /// Non-fatal notes: page cap applied, degraded analysis stages.
    #[serde(default)]
    pub advisories: Vec<String>,

    #[serde(default)]
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh queued job pointing at its uploaded artifact.
    pub fn new(filename: impl Into<String>, mode: Mode, input_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            mode,
            status: JobStatus::Queued,
            progress: 0,
            page_count: 0,
            file_size: 0,
            current_input_path: input_path.into(),
            artifact_history: Vec::new(),
            thumbnails: Vec::new(),
            output_pdf_path: None,
            output_json_path: None,
            audit_path: None,
            document_type: None,
            sections: Vec::new(),
            findings: Vec::new(),
            twin: None,
            decisions: BTreeMap::new(),
            confidence: 0.0,
            error_message: None,
            advisories: Vec::new(),
            pinned: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `status`, recording the time.
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Advance progress; never moves backwards.
    pub fn advance(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        self.updated_at = Utc::now();
    }

    /// Enter `failed` with the error message captured verbatim.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Effective action for a finding: operator decision, else the
    /// classifier's suggestion, else keep.
    pub fn effective_action(&self, finding: &Finding) -> Action {
        finding.resolve(&self.decisions)
    }

    /// Recompute the aggregate confidence:
    /// `max(extraction confidence, mean finding confidence)`.
    pub fn recompute_confidence(&mut self) {
        self.confidence = blend_confidence(self.twin.as_ref(), &self.findings).clamp(0.0, 1.0);
    }

    /// True when `path` is the current artifact or one of the retained ones.
    pub fn is_retained(&self, path: &str) -> bool {
        self.current_input_path == path || self.artifact_history.iter().any(|a| a.path == path)
    }

    /// Swap the current artifact pointer, retaining the old one for audit.
    pub fn swap_artifact(&mut self, new_path: impl Into<String>, operation: &str) {
        let old = std::mem::replace(&mut self.current_input_path, new_path.into());
        self.artifact_history.push(ArtifactRecord {
            path: old,
            superseded_by: operation.to_string(),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }
}
