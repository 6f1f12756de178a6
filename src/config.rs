//! Configuration types for the anonymization pipeline.
//!
//! Every tunable lives in [`PipelineConfig`], built through
//! [`PipelineConfigBuilder`]. The safety limits (file-size cap, classifier
//! page cap, timeout bounds) are plain fields so a deployment can tighten
//! them without touching code, and so a failed job can be diagnosed against
//! the exact limits it ran under.

use crate::error::AnonError;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the anonymization pipeline.
///
/// # Example
/// ```rust
/// use offer_anonymizer::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .storage_root("/var/lib/anon")
///     .max_analysis_pages(20)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_analysis_pages, 20);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root directory for every stored artifact. Default: `./storage`.
    pub storage_root: PathBuf,

    /// DPI used to render classifier input images. Range: 36–600. Default: 150.
    pub analysis_dpi: u32,

    /// Maximum thumbnail width in pixels. Default: 2480 (A4 at 300 DPI).
    pub thumbnail_max_width: u32,

    /// Hard cap on pages sent to the classifier. Default: 30.
    ///
    /// Documents longer than this are analysed on their first
    /// `max_analysis_pages` pages and the job gets an advisory note.
    pub max_analysis_pages: usize,

    /// Hard cap on input file size in megabytes. Default: 30.
    pub max_file_size_mb: u64,

    /// Per-page share of the per-call classifier timeout. Default: 10 s.
    pub per_page_timeout: Duration,

    /// Lower bound of the per-call classifier timeout. Default: 60 s.
    pub min_call_timeout: Duration,

    /// Upper bound of the per-call classifier timeout. Default: 180 s.
    pub max_call_timeout: Duration,

    /// Watchdog over the whole analysis sequence, as a multiple of the
    /// per-call timeout. Default: 3.
    pub watchdog_factor: u32,

    /// Font size used for replacement text when the matched span has none. Default: 10.
    pub default_font_size: f64,

    /// Base-14 font used to draw replacement text. Default: `Helvetica`.
    pub replacement_font: String,

    /// LLM model identifier for the vision classifier.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for classifier calls. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens per classifier response. Default: 8192.
    pub max_tokens: usize,

    /// Retries on a transient classifier failure (inside one call's deadline). Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Directory containing the pdfium shared library.
    /// If None, `PDFIUM_LIB_PATH` is consulted, then the system library.
    pub pdfium_lib_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./storage"),
            analysis_dpi: 150,
            thumbnail_max_width: 2480,
            max_analysis_pages: 30,
            max_file_size_mb: 30,
            per_page_timeout: Duration::from_secs(10),
            min_call_timeout: Duration::from_secs(60),
            max_call_timeout: Duration::from_secs(180),
            watchdog_factor: 3,
            default_font_size: 10.0,
            replacement_font: "Helvetica".to_string(),
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 8192,
            max_retries: 2,
            retry_backoff_ms: 500,
            pdfium_lib_path: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("storage_root", &self.storage_root)
            .field("analysis_dpi", &self.analysis_dpi)
            .field("thumbnail_max_width", &self.thumbnail_max_width)
            .field("max_analysis_pages", &self.max_analysis_pages)
            .field("max_file_size_mb", &self.max_file_size_mb)
            .field("per_page_timeout", &self.per_page_timeout)
            .field("min_call_timeout", &self.min_call_timeout)
            .field("max_call_timeout", &self.max_call_timeout)
            .field("watchdog_factor", &self.watchdog_factor)
            .field("default_font_size", &self.default_font_size)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Per-call classifier timeout for a run that analyses `pages` pages:
    /// `clamp(pages × per_page_timeout, min_call_timeout, max_call_timeout)`.
    pub fn call_timeout(&self, pages: usize) -> Duration {
        let scaled = self
            .per_page_timeout
            .saturating_mul(u32::try_from(pages).unwrap_or(u32::MAX));
        scaled.clamp(self.min_call_timeout, self.max_call_timeout)
    }

    /// Aggregate deadline over the whole analysis sequence.
    pub fn watchdog_timeout(&self, pages: usize) -> Duration {
        self.call_timeout(pages).saturating_mul(self.watchdog_factor)
    }

    /// File-size cap in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    pub fn analysis_dpi(mut self, dpi: u32) -> Self {
        self.config.analysis_dpi = dpi.clamp(36, 600);
        self
    }

    pub fn thumbnail_max_width(mut self, px: u32) -> Self {
        self.config.thumbnail_max_width = px.max(64);
        self
    }

    pub fn max_analysis_pages(mut self, n: usize) -> Self {
        self.config.max_analysis_pages = n.max(1);
        self
    }

    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.config.max_file_size_mb = mb.max(1);
        self
    }

    pub fn per_page_timeout(mut self, d: Duration) -> Self {
        self.config.per_page_timeout = d;
        self
    }

    pub fn call_timeout_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_call_timeout = min;
        self.config.max_call_timeout = max;
        self
    }

    pub fn watchdog_factor(mut self, factor: u32) -> Self {
        self.config.watchdog_factor = factor.max(1);
        self
    }

    pub fn default_font_size(mut self, size: f64) -> Self {
        self.config.default_font_size = size;
        self
    }

    pub fn replacement_font(mut self, font: impl Into<String>) -> Self {
        self.config.replacement_font = font.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, AnonError> {
        let c = &self.config;
        if c.min_call_timeout > c.max_call_timeout {
            return Err(AnonError::InvalidConfig(format!(
                "min_call_timeout ({:?}) exceeds max_call_timeout ({:?})",
                c.min_call_timeout, c.max_call_timeout
            )));
        }
        if !(c.default_font_size.is_finite() && c.default_font_size > 0.0) {
            return Err(AnonError::InvalidConfig(format!(
                "default_font_size must be positive, got {}",
                c.default_font_size
            )));
        }
        if c.replacement_font.is_empty() {
            return Err(AnonError::InvalidConfig(
                "replacement_font must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_timeout_is_clamped() {
        let c = PipelineConfig::default();
        assert_eq!(c.call_timeout(1), Duration::from_secs(60));
        assert_eq!(c.call_timeout(9), Duration::from_secs(90));
        assert_eq!(c.call_timeout(40), Duration::from_secs(180));
    }

    #[test]
    fn watchdog_is_three_calls() {
        let c = PipelineConfig::default();
        assert_eq!(c.watchdog_timeout(12), Duration::from_secs(360));
    }

    #[test]
    fn builder_clamps() {
        let c = PipelineConfig::builder()
            .analysis_dpi(5000)
            .max_analysis_pages(0)
            .build()
            .unwrap();
        assert_eq!(c.analysis_dpi, 600);
        assert_eq!(c.max_analysis_pages, 1);
    }

    #[test]
    fn inverted_timeout_bounds_rejected() {
        let err = PipelineConfig::builder()
            .call_timeout_bounds(Duration::from_secs(100), Duration::from_secs(10))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("min_call_timeout"), "got: {err}");
    }

    #[test]
    fn debug_hides_provider() {
        let dbg = format!("{:?}", PipelineConfig::default());
        assert!(dbg.contains("max_analysis_pages"));
    }
}
