//! Image encoding: rendered pages → PNG bytes and base64 `ImageData`.
//!
//! Thumbnails are stored as PNG files; classifier inputs are the same PNG
//! bytes base64-wrapped for the multimodal request body. PNG keeps small
//! print (prices, phone numbers) crisp, which matters more than file size.

use crate::error::AnonError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, AnonError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| AnonError::Internal(format!("PNG encoding failed: {}", e)))?;
    Ok(buf)
}

/// Wrap PNG bytes for the VLM API.
///
/// `detail: "high"` keeps the full tile budget on providers that tile images,
/// so fine print stays legible to the classifier.
pub fn image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}
