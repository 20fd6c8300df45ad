//! MJPEG payload validation utilities.
//!
//! USB cameras deliver each frame as a standalone JPEG image, usually with
//! trailing zero padding up to the driver's worst-case buffer size. These
//! helpers let decode collaborators and tests sanity-check a payload and
//! read its geometry without a full decoder.

use crate::error::{CaptureError, Result};

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Strip the zero padding drivers append after the end-of-image marker.
fn trim_trailing_padding(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    data.get(..end).unwrap_or(data)
}

/// Whether the payload carries the JPEG start- and end-of-image markers.
#[must_use]
pub fn is_jpeg(data: &[u8]) -> bool {
    let trimmed = trim_trailing_padding(data);
    trimmed.len() >= 4 && trimmed.starts_with(&SOI) && trimmed.ends_with(&EOI)
}

/// Validate that a payload is a plausibly complete JPEG frame.
///
/// # Errors
///
/// Returns [`CaptureError::DecodeFailed`] naming the missing marker when the
/// payload is truncated or not JPEG at all.
pub fn validate_frame(data: &[u8]) -> Result<()> {
    let trimmed = trim_trailing_padding(data);
    if trimmed.len() < 4 {
        return Err(CaptureError::DecodeFailed(format!(
            "payload too short: {} bytes",
            data.len()
        )));
    }
    if !trimmed.starts_with(&SOI) {
        return Err(CaptureError::DecodeFailed(
            "missing JPEG start-of-image marker".to_owned(),
        ));
    }
    if !trimmed.ends_with(&EOI) {
        return Err(CaptureError::DecodeFailed(
            "missing JPEG end-of-image marker".to_owned(),
        ));
    }
    Ok(())
}

/// Parse the frame geometry from the first start-of-frame segment.
///
/// Returns `(width, height)`, or `None` when no SOF segment precedes the
/// scan data. Handles marker fill bytes and skips non-SOF segments by their
/// declared length.
#[must_use]
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if !data.starts_with(&SOI) {
        return None;
    }
    let mut i = 2usize;
    loop {
        if *data.get(i)? != 0xFF {
            return None;
        }
        let marker = *data.get(i + 1)?;
        match marker {
            // Fill byte before the real marker.
            0xFF => i += 1,
            // Standalone markers without a length field.
            0x01 | 0xD0..=0xD8 => i += 2,
            // Scan data or end of image before any SOF segment.
            0xD9 | 0xDA => return None,
            // SOF0-15, minus DHT (C4), JPG (C8) and DAC (CC):
            // length(2) precision(1) height(2) width(2) ...
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                let height = u16::from_be_bytes([*data.get(i + 5)?, *data.get(i + 6)?]);
                let width = u16::from_be_bytes([*data.get(i + 7)?, *data.get(i + 8)?]);
                return Some((width, height));
            }
            _ => {
                let length = u16::from_be_bytes([*data.get(i + 2)?, *data.get(i + 3)?]);
                i += 2 + length as usize;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tiny_jpeg;

    #[test]
    fn accepts_minimal_frame() {
        let frame = tiny_jpeg(640, 480);
        assert!(is_jpeg(&frame));
        validate_frame(&frame).expect("minimal frame is valid");
    }

    #[test]
    fn tolerates_driver_padding() {
        let mut frame = tiny_jpeg(640, 480);
        frame.extend_from_slice(&[0u8; 512]);
        assert!(is_jpeg(&frame));
        validate_frame(&frame).expect("padded frame is valid");
    }

    #[test]
    fn rejects_truncated_and_foreign_payloads() {
        let err = validate_frame(&[]).expect_err("empty payload");
        assert!(matches!(err, CaptureError::DecodeFailed(_)));

        let err = validate_frame(&[0x52, 0x49, 0x46, 0x46, 0x00, 0x01]).expect_err("RIFF header");
        assert!(err.to_string().contains("start-of-image"));

        let mut cut = tiny_jpeg(640, 480);
        cut.truncate(cut.len() - 2);
        let err = validate_frame(&cut).expect_err("missing EOI");
        assert!(err.to_string().contains("end-of-image"));
    }

    #[test]
    fn reads_geometry_from_sof() {
        assert_eq!(jpeg_dimensions(&tiny_jpeg(1280, 720)), Some((1280, 720)));
        assert_eq!(jpeg_dimensions(&[0xFF, 0xD8, 0xFF, 0xD9]), None);
        assert_eq!(jpeg_dimensions(b"not jpeg"), None);
    }

    #[test]
    fn skips_intervening_segments_before_sof() {
        // SOI, a 4-byte COM segment, then the SOF-bearing remainder.
        let mut frame = vec![0xFF, 0xD8, 0xFF, 0xFE, 0x00, 0x04, 0xAA, 0xBB];
        frame.extend_from_slice(&tiny_jpeg(64, 32)[2..]);
        assert_eq!(jpeg_dimensions(&frame), Some((64, 32)));
    }
}
