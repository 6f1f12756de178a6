//! Pixel-level redaction of image XObjects that are only partly covered.

use super::content::Matrix;
use crate::geometry::UserRect;
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use lopdf::{Object, Stream};
use std::io::Cursor;
use tracing::{debug, warn};

const EPS: f64 = 1e-9;

fn int(stream: &Stream, key: &[u8]) -> Option<u32> {
    match stream.dict.get(key).ok()? {
        Object::Integer(v) if *v > 0 => u32::try_from(*v).ok(),
        _ => None,
    }
}

fn is_dct(stream: &Stream) -> bool {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(n)) => n == b"DCTDecode",
        Ok(Object::Array(a)) => matches!(a.as_slice(), [Object::Name(n)] if n == b"DCTDecode"),
        _ => false,
    }
}

fn decode(stream: &Stream, width: u32, height: u32) -> Option<RgbImage> {
    if is_dct(stream) {
        return image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .ok()
            .map(|img| img.to_rgb8());
    }
    let bits = int(stream, b"BitsPerComponent").unwrap_or(8);
    if bits != 8 {
        return None;
    }
    let data = if stream.dict.get(b"Filter").is_ok() {
        stream.decompressed_content().ok()?
    } else {
        stream.content.clone()
    };
    let pixels = width as usize * height as usize;
    match stream.dict.get(b"ColorSpace") {
        Ok(Object::Name(n)) if n == b"DeviceRGB" && data.len() == pixels * 3 => {
            RgbImage::from_raw(width, height, data)
        }
        Ok(Object::Name(n)) if n == b"DeviceGray" && data.len() == pixels => {
            GrayImage::from_raw(width, height, data)
                .map(|g| DynamicImage::ImageLuma8(g).to_rgb8())
        }
        _ => None,
    }
}

/// Paint the parts of an image under `purge` black and return the new stream.
///
/// Only axis-aligned placements of 8-bit DeviceRGB/DeviceGray or baseline
/// JPEG images are handled. `None` means the caller has to drop the image.
pub fn paint_over(stream: &Stream, ctm: &Matrix, purge: &[UserRect]) -> Option<Stream> {
    if ctm.b.abs() > EPS || ctm.c.abs() > EPS || ctm.a.abs() < EPS || ctm.d.abs() < EPS {
        debug!("Image placement is rotated or skewed, cannot repaint");
        return None;
    }
    let width = int(stream, b"Width")?;
    let height = int(stream, b"Height")?;
    let Some(mut img) = decode(stream, width, height) else {
        warn!("Image encoding not supported for repainting ({}x{})", width, height);
        return None;
    };
    if img.dimensions() != (width, height) {
        return None;
    }

    let inv = ctm.invert()?;
    let (w, h) = (f64::from(width), f64::from(height));
    let black = Rgb([0u8, 0, 0]);
    let mut painted = false;
    for r in purge {
        let (u0, v0) = inv.apply(r.llx, r.lly);
        let (u1, v1) = inv.apply(r.urx, r.ury);
        let (u_lo, u_hi) = (u0.min(u1).max(0.0), u0.max(u1).min(1.0));
        let (v_lo, v_hi) = (v0.min(v1).max(0.0), v0.max(v1).min(1.0));
        if u_hi <= u_lo || v_hi <= v_lo {
            continue;
        }
        // Image row 0 is the top edge, at v = 1.
        let x0 = (u_lo * w).floor() as u32;
        let x1 = ((u_hi * w).ceil() as u32).min(width);
        let y0 = ((1.0 - v_hi) * h).floor() as u32;
        let y1 = (((1.0 - v_lo) * h).ceil() as u32).min(height);
        for y in y0..y1 {
            for x in x0..x1 {
                img.put_pixel(x, y, black);
            }
        }
        painted = true;
    }
    if !painted {
        return None;
    }

    let mut dict = stream.dict.clone();
    dict.set("ColorSpace", Object::Name(b"DeviceRGB".to_vec()));
    dict.set("BitsPerComponent", 8);
    dict.remove(b"DecodeParms");
    dict.remove(b"Decode");

    if is_dct(stream) {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .ok()?;
        Some(Stream::new(dict, out))
    } else {
        dict.remove(b"Filter");
        let mut s = Stream::new(dict, img.into_raw());
        s.compress().ok();
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn gray(width: i64, height: i64, fill: u8) -> Stream {
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![fill; (width * height) as usize],
        )
    }

    fn pixels(s: &Stream) -> Vec<u8> {
        s.decompressed_content().unwrap_or_else(|_| s.content.clone())
    }

    #[test]
    fn left_half_painted_black() {
        let stream = gray(4, 2, 255);
        // Drawn at 100..200 x 100..150.
        let ctm = Matrix::new(100.0, 0.0, 0.0, 50.0, 100.0, 100.0);
        let purge = [UserRect::new(0.0, 0.0, 150.0, 300.0)];
        let patched = paint_over(&stream, &ctm, &purge).unwrap();
        let data = pixels(&patched);
        assert_eq!(data.len(), 4 * 2 * 3);
        for row in data.chunks(12) {
            assert_eq!(&row[..6], &[0; 6]);
            assert_eq!(&row[6..], &[255; 6]);
        }
    }

    #[test]
    fn top_band_maps_to_first_rows() {
        let stream = gray(1, 4, 200);
        let ctm = Matrix::new(10.0, 0.0, 0.0, 40.0, 0.0, 0.0);
        // Top quarter in user space is y 30..40.
        let purge = [UserRect::new(-5.0, 30.0, 15.0, 45.0)];
        let patched = paint_over(&stream, &ctm, &purge).unwrap();
        let data = pixels(&patched);
        assert_eq!(&data[..3], &[0, 0, 0]);
        assert_eq!(&data[3..], &[200; 9]);
    }

    #[test]
    fn rotated_placement_refused() {
        let stream = gray(2, 2, 255);
        let ctm = Matrix::new(0.0, 50.0, -50.0, 0.0, 100.0, 100.0);
        assert!(paint_over(&stream, &ctm, &[UserRect::new(0.0, 0.0, 500.0, 500.0)]).is_none());
    }

    #[test]
    fn unsupported_encoding_refused() {
        let mut stream = gray(2, 2, 255);
        stream.dict.set("BitsPerComponent", 1);
        let ctm = Matrix::new(10.0, 0.0, 0.0, 10.0, 0.0, 0.0);
        assert!(paint_over(&stream, &ctm, &[UserRect::new(0.0, 0.0, 5.0, 5.0)]).is_none());
    }
}
