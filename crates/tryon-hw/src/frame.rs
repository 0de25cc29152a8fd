//! Frame type and pixel conversion — YUYV to RGB, dark-frame detection.

/// A captured color camera frame, packed RGB8, unmirrored.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap an already-converted RGB buffer, validating its length.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = (width * height * 3) as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        })
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// BT.601 luma from RGB.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8
}

/// Convert packed YUYV (4:2:2) to packed RGB8 using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.push((c + 1.596 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c - 0.392 * u - 0.813 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c + 2.017 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

/// Check whether more than `threshold_pct` of the RGB pixels have luma below 32.
pub fn is_dark_frame(rgb: &[u8], threshold_pct: f32) -> bool {
    let pixels = rgb.len() / 3;
    if pixels == 0 {
        return true;
    }
    let dark_count = rgb
        .chunks_exact(3)
        .filter(|px| luma(px[0], px[1], px[2]) < 32)
        .count();
    (dark_count as f32 / pixels as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_gray_pixels() {
        // Neutral chroma (U=V=128) yields equal RGB channels.
        let yuyv = vec![126, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.len(), 6);
        assert_eq!(rgb[0], rgb[1]);
        assert_eq!(rgb[1], rgb[2]);
        assert_eq!(&rgb[3..6], &[255, 255, 255]);
    }

    #[test]
    fn test_yuyv_black_level() {
        let yuyv = vec![16, 128, 16, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0; 6]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down.
        let yuyv = vec![81, 90, 81, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert!(rgb[0] > 200, "red = {}", rgb[0]);
        assert!(rgb[1] < 30, "green = {}", rgb[1]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_from_rgb_validates_length() {
        assert!(Frame::from_rgb(vec![0; 11], 2, 2, 0).is_err());
        let frame = Frame::from_rgb(vec![200; 12], 2, 2, 7).unwrap();
        assert_eq!(frame.sequence, 7);
        assert!(!frame.is_dark);
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&vec![0u8; 300], 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&vec![128u8; 300], 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright → not dark
        let mut rgb = vec![10u8; 940 * 3];
        rgb.extend(vec![128u8; 60 * 3]);
        assert!(!is_dark_frame(&rgb, 0.95));
    }
}
