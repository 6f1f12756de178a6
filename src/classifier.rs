//! Vision classifier over `edgequake-llm`.
//!
//! Sends every analysed page image in a single multimodal request per stage
//! and parses the JSON the model returns. Prompts live in [`crate::prompts`].
//!
//! ## Retry strategy
//!
//! Rate limits and 5xx responses are retried with exponential backoff
//! (`retry_backoff_ms * 2^attempt`). The retries run inside the caller's
//! per-call deadline, so a slow provider still degrades the stage on time.
//! A transport that cannot be reached at all is not retried.

use crate::analysis::{Classifier, ClassifierError, ParseOutcome};
use crate::config::PipelineConfig;
use crate::error::AnonError;
use crate::job::{
    AvailabilityInfo, DigitalTwin, DimensionsInfo, EquipmentInfo, FindingsReport, Mode,
    PowertrainInfo, PricingInfo, SectionsReport, VehicleInfo,
};
use crate::pipeline::encode::image_data;
use crate::prompts::{extraction_context, EXTRACTION_PROMPT, FINDINGS_PROMPT, SECTIONS_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Default vision model when a provider is named without one.
const DEFAULT_MODEL: &str = "gpt-4.1-nano";

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)```").unwrap());
static FENCED_ANY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)```").unwrap());

/// Error text fragments that mean the transport itself is down.
const UNREACHABLE_MARKERS: &[&str] = &[
    "connection refused",
    "error trying to connect",
    "dns error",
    "failed to lookup address",
    "network is unreachable",
    "no route to host",
    "tcp connect error",
];

/// [`Classifier`] backed by an `edgequake-llm` provider.
pub struct VisionClassifier {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl VisionClassifier {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Resolve the provider from the config and environment.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, AnonError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }

    async fn ask(
        &self,
        stage: &str,
        system: &str,
        text: &str,
        images: &[Vec<u8>],
    ) -> Result<String, ClassifierError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user_with_images(text, images.iter().map(|png| image_data(png)).collect()),
        ];
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    stage, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "{}: {} input tokens, {} output tokens, {:?}",
                        stage,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    let err_msg = format!("{}", e);
                    if is_unreachable(&err_msg) {
                        return Err(ClassifierError::Unreachable(err_msg));
                    }
                    warn!("{}: attempt {} failed: {}", stage, attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }
        Err(ClassifierError::Failed(
            last_err.unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }
}

#[async_trait]
impl Classifier for VisionClassifier {
    async fn detect_sections(
        &self,
        images: &[Vec<u8>],
    ) -> Result<ParseOutcome<SectionsReport>, ClassifierError> {
        let raw = self.ask("sections", SECTIONS_PROMPT, "", images).await?;
        Ok(parse_json(&raw))
    }

    async fn detect_findings(
        &self,
        images: &[Vec<u8>],
    ) -> Result<ParseOutcome<FindingsReport>, ClassifierError> {
        let raw = self.ask("findings", FINDINGS_PROMPT, "", images).await?;
        Ok(parse_json(&raw))
    }

    async fn extract_structured(
        &self,
        images: &[Vec<u8>],
        filename: &str,
    ) -> Result<ParseOutcome<DigitalTwin>, ClassifierError> {
        let context = extraction_context(filename, images.len());
        let raw = self.ask("extraction", EXTRACTION_PROMPT, &context, images).await?;
        Ok(parse_twin(&raw, filename))
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, AnonError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        AnonError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider, most specific first: the pre-built provider, the
/// named provider, `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, an OpenAI
/// key, then full auto-detection.
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, AnonError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| AnonError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, GEMINI_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

// ── Response parsing ─────────────────────────────────────────────────────

fn is_unreachable(message: &str) -> bool {
    let lower = message.to_lowercase();
    UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// The JSON payload of a model response: the first ```json fence, else the
/// first fence of any kind, else the outermost `{...}`.
pub fn extract_json(text: &str) -> &str {
    if let Some(c) = FENCED_JSON.captures(text).and_then(|c| c.get(1)) {
        return c.as_str().trim();
    }
    if let Some(c) = FENCED_ANY.captures(text).and_then(|c| c.get(1)) {
        return c.as_str().trim();
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}

fn parse_json<T: DeserializeOwned>(raw: &str) -> ParseOutcome<T> {
    match serde_json::from_str(extract_json(raw)) {
        Ok(value) => ParseOutcome::Parsed(value),
        Err(e) => ParseOutcome::Malformed {
            detail: e.to_string(),
        },
    }
}

/// Lenient twin parsing: each top-level group is read on its own and a group
/// that does not fit its schema is left at its default.
fn parse_twin(raw: &str, filename: &str) -> ParseOutcome<DigitalTwin> {
    let value: Value = match serde_json::from_str(extract_json(raw)) {
        Ok(v @ Value::Object(_)) => v,
        Ok(other) => {
            return ParseOutcome::Malformed {
                detail: format!("expected a JSON object, got {}", kind_of(&other)),
            }
        }
        Err(e) => {
            return ParseOutcome::Malformed {
                detail: e.to_string(),
            }
        }
    };

    let mut twin = DigitalTwin::empty(filename);
    twin.mode = Mode::Unify;
    twin.vehicle = group::<VehicleInfo>(&value, "vehicle");
    twin.powertrain = group::<PowertrainInfo>(&value, "powertrain");
    twin.equipment = group::<EquipmentInfo>(&value, "equipment");
    twin.dimensions = group::<DimensionsInfo>(&value, "dimensions");
    twin.availability = group::<AvailabilityInfo>(&value, "availability");
    twin.pricing = group::<PricingInfo>(&value, "pricing");
    // Discounts never survive extraction, whatever the model says.
    twin.pricing.discounts_removed = true;
    twin.confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    twin.notes = value.get("notes").and_then(Value::as_str).map(str::to_string);
    ParseOutcome::Parsed(twin)
}

fn group<T: DeserializeOwned + Default>(value: &Value, key: &str) -> T {
    match value.get(key) {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            debug!("Ignoring malformed '{}' group: {}", key, e);
            T::default()
        }),
        _ => T::default(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
