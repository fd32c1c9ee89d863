//! Uploaded image decoding.

use crate::error::VisionError;
use image::GrayImage;

/// Decode an uploaded photo (PNG, JPEG, ...) into an 8-bit grayscale frame.
///
/// Empty, corrupt, unsupported or zero-area input is rejected as
/// [`VisionError::UnreadableImage`].
pub fn decode_image(bytes: &[u8]) -> Result<GrayImage, VisionError> {
    if bytes.is_empty() {
        return Err(VisionError::UnreadableImage("empty payload".into()));
    }

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| VisionError::UnreadableImage(e.to_string()))?;
    let gray = decoded.to_luma8();

    if gray.width() == 0 || gray.height() == 0 {
        return Err(VisionError::UnreadableImage("image has zero area".into()));
    }

    Ok(gray)
}
