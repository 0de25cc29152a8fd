//! Final canvas: raw video underneath, rendered overlay on top.
//!
//! The canvas stays in raw (unmirrored) coordinates. The selfie mirror is
//! applied exactly once, when the canvas is presented or captured.

use image::{imageops, ImageFormat, RgbImage, RgbaImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("video frame is {actual} bytes, expected {expected} for {width}x{height} RGB")]
    BadVideoFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("overlay is {actual:?}, canvas is {expected:?}")]
    OverlaySize { expected: (u32, u32), actual: (u32, u32) },
    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

pub struct Compositor {
    canvas: RgbaImage,
}

impl Compositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: RgbaImage::new(width, height),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }

    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    /// Clear, draw the raw video frame, then the overlay surface at the origin
    /// when one is given.
    pub fn compose(
        &mut self,
        video_rgb: &[u8],
        width: u32,
        height: u32,
        overlay: Option<&RgbaImage>,
    ) -> Result<&RgbaImage, CompositeError> {
        let video = RgbImage::from_raw(width, height, video_rgb.to_vec()).ok_or(
            CompositeError::BadVideoFrame {
                width,
                height,
                expected: width as usize * height as usize * 3,
                actual: video_rgb.len(),
            },
        )?;

        if self.canvas.dimensions() != (width, height) {
            tracing::debug!(width, height, "resizing canvas");
            self.canvas = RgbaImage::new(width, height);
        }

        for (dst, src) in self.canvas.pixels_mut().zip(video.pixels()) {
            let [r, g, b] = src.0;
            dst.0 = [r, g, b, 255];
        }

        if let Some(overlay) = overlay {
            if overlay.dimensions() != (width, height) {
                return Err(CompositeError::OverlaySize {
                    expected: (width, height),
                    actual: overlay.dimensions(),
                });
            }
            imageops::overlay(&mut self.canvas, overlay, 0, 0);
        }

        Ok(&self.canvas)
    }

    /// The canvas as the user sees it.
    pub fn present_mirrored(&self) -> RgbaImage {
        imageops::flip_horizontal(&self.canvas)
    }

    /// Mirrored display x for a raw canvas x.
    pub fn mirror_x(&self, x: u32) -> u32 {
        self.canvas.width().saturating_sub(1).saturating_sub(x)
    }

    /// PNG of the mirrored canvas.
    pub fn encode_png(&self) -> Result<Vec<u8>, CompositeError> {
        let mut out = Cursor::new(Vec::new());
        self.present_mirrored().write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn gray_frame(w: u32, h: u32) -> Vec<u8> {
        vec![40; (w * h * 3) as usize]
    }

    #[test]
    fn test_video_only_when_no_face() {
        let mut c = Compositor::new(8, 4);
        let canvas = c.compose(&gray_frame(8, 4), 8, 4, None).unwrap();
        assert!(canvas.pixels().all(|p| p.0 == [40, 40, 40, 255]));
    }

    #[test]
    fn test_overlay_on_top_and_transparent_elsewhere() {
        let mut c = Compositor::new(8, 4);
        let mut overlay = RgbaImage::new(8, 4);
        overlay.put_pixel(2, 1, Rgba([255, 0, 0, 255]));
        let canvas = c.compose(&gray_frame(8, 4), 8, 4, Some(&overlay)).unwrap();
        assert_eq!(canvas.get_pixel(2, 1).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(3, 1).0, [40, 40, 40, 255]);
    }

    #[test]
    fn test_mirror_consistency() {
        // A video pixel and an overlay element at the same raw coordinate end up
        // at the same mirrored coordinate.
        let (w, h) = (10, 6);
        let mut video = gray_frame(w, h);
        let (x, y) = (3u32, 2u32);
        let i = ((y * w + x) * 3) as usize;
        video[i..i + 3].copy_from_slice(&[0, 255, 0]);

        let mut c = Compositor::new(w, h);
        c.compose(&video, w, h, None).unwrap();
        let shown_video = c.present_mirrored();

        let mut overlay = RgbaImage::new(w, h);
        overlay.put_pixel(x, y, Rgba([0, 0, 255, 255]));
        c.compose(&gray_frame(w, h), w, h, Some(&overlay)).unwrap();
        let shown_overlay = c.present_mirrored();

        let mx = c.mirror_x(x);
        assert_eq!(mx, 6);
        assert_eq!(shown_video.get_pixel(mx, y).0, [0, 255, 0, 255]);
        assert_eq!(shown_overlay.get_pixel(mx, y).0, [0, 0, 255, 255]);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mut c = Compositor::new(4, 4);
        assert!(matches!(
            c.compose(&[0; 5], 4, 4, None),
            Err(CompositeError::BadVideoFrame { .. })
        ));
        let small = RgbaImage::new(2, 2);
        assert!(matches!(
            c.compose(&gray_frame(4, 4), 4, 4, Some(&small)),
            Err(CompositeError::OverlaySize { .. })
        ));
    }

    #[test]
    fn test_png_is_mirrored() {
        let mut c = Compositor::new(4, 2);
        let mut video = gray_frame(4, 2);
        video[0..3].copy_from_slice(&[255, 255, 255]);
        c.compose(&video, 4, 2, None).unwrap();
        let png = c.encode_png().unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(3, 0).0, [255, 255, 255, 255]);
        assert_eq!(decoded.get_pixel(0, 0).0, [40, 40, 40, 255]);
    }
}
