//! Image encoding: `DynamicImage` → PNG bytes / base64 `ImageData`.
//!
//! PNG keeps rendered text crisp; `detail: "high"` asks tiling vision models
//! for their full tile budget so fine print and small tables survive.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG bytes.
fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Encode a page or figure image as a base64 PNG ready for a vision model.
pub fn encode_image(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let b64 = STANDARD.encode(png_bytes(img)?);
    debug!("Encoded image → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Downscale so the longest side is at most `max_dim`, keeping aspect ratio.
///
/// Images already within bounds are returned unchanged.
pub fn fit_within(img: DynamicImage, max_dim: u32) -> DynamicImage {
    if img.width().max(img.height()) <= max_dim {
        return img;
    }
    img.resize(max_dim, max_dim, FilterType::Lanczos3)
}
