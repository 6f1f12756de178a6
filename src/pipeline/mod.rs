//! Raster stages shared by processing and mutations.
//!
//! ```text
//! PDF bytes ──▶ render ──▶ encode
//!              (pdfium)   (PNG / base64)
//! ```
//!
//! 1. [`render`] rasterises pages for thumbnails and classifier input; runs
//!    in `spawn_blocking` because pdfium is not async-safe
//! 2. [`encode`] PNG-encodes each `DynamicImage` and wraps it for the
//!    multimodal request body

pub mod encode;
pub mod render;
