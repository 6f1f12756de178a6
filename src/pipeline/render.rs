//! PDF rasterisation: thumbnails and classifier inputs via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with process-global state. Every render runs on
//! the blocking pool so Tokio worker threads never stall on a large page.
//!
//! ## Binding
//!
//! The library is bound per call, in order: the configured path, the
//! `PDFIUM_LIB_PATH` directory, then the system library. A binding failure
//! is reported as [`AnonError::PdfiumBindingFailed`] rather than a panic.

use crate::error::AnonError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

/// One rendered page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// 0-indexed page number.
    pub index: usize,
    pub image: DynamicImage,
}

/// Renders PDF pages to raster images.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Render the first `max_pages` pages at `dpi`.
    async fn render_pages(
        &self,
        pdf: &[u8],
        dpi: u32,
        max_pages: usize,
    ) -> Result<Vec<RenderedPage>, AnonError>;

    /// Render every page scaled to `max_width` pixels wide.
    async fn thumbnails(&self, pdf: &[u8], max_width: u32)
        -> Result<Vec<RenderedPage>, AnonError>;
}

#[derive(Debug, Clone, Copy)]
enum Scale {
    Dpi(u32),
    Width(u32),
}

/// [`PageRasterizer`] backed by pdfium-render.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    lib_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(lib_path: Option<PathBuf>) -> Self {
        Self { lib_path }
    }

    async fn render(
        &self,
        pdf: &[u8],
        scale: Scale,
        max_pages: usize,
    ) -> Result<Vec<RenderedPage>, AnonError> {
        let bytes = pdf.to_vec();
        let lib_path = self.lib_path.clone();

        tokio::task::spawn_blocking(move || {
            render_blocking(&bytes, lib_path.as_ref(), scale, max_pages)
        })
        .await
        .map_err(|e| AnonError::Internal(format!("Render task panicked: {}", e)))?
    }
}

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn render_pages(
        &self,
        pdf: &[u8],
        dpi: u32,
        max_pages: usize,
    ) -> Result<Vec<RenderedPage>, AnonError> {
        self.render(pdf, Scale::Dpi(dpi), max_pages).await
    }

    async fn thumbnails(
        &self,
        pdf: &[u8],
        max_width: u32,
    ) -> Result<Vec<RenderedPage>, AnonError> {
        self.render(pdf, Scale::Width(max_width), usize::MAX).await
    }
}

fn bind(lib_path: Option<&PathBuf>) -> Result<Pdfium, AnonError> {
    let candidates = lib_path
        .cloned()
        .into_iter()
        .chain(std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));
    for dir in candidates {
        let lib = Pdfium::pdfium_platform_library_name_at_path(&dir);
        debug!("Trying pdfium at {:?}", lib);
        if let Ok(bindings) = Pdfium::bind_to_library(&lib) {
            return Ok(Pdfium::new(bindings));
        }
    }
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| AnonError::PdfiumBindingFailed(format!("{:?}", e)))
}

fn render_blocking(
    bytes: &[u8],
    lib_path: Option<&PathBuf>,
    scale: Scale,
    max_pages: usize,
) -> Result<Vec<RenderedPage>, AnonError> {
    let pdfium = bind(lib_path)?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| AnonError::CorruptPdf {
            path: "current artifact".into(),
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    let count = total.min(max_pages);
    info!("Rendering {} of {} pages ({:?})", count, total, scale);

    let mut results = Vec::with_capacity(count);
    for idx in 0..count {
        let page = pages
            .get(idx as u16)
            .map_err(|e| AnonError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let config = match scale {
            Scale::Dpi(dpi) => PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0),
            Scale::Width(width) => PdfRenderConfig::new().set_target_width(width as i32),
        };
        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| AnonError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push(RenderedPage { index: idx, image });
    }
    Ok(results)
}
