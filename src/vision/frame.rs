//! Owned BGR frames as delivered by the camera collaborator.

use crate::error::{AppResult, ProbeError};
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use std::path::Path;

/// An H×W×3 byte grid in blue-green-red channel order.
#[derive(Clone, PartialEq, Eq)]
pub struct BgrFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for BgrFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgrFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl BgrFrame {
    /// Wrap raw interleaved BGR bytes.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> AppResult<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|p| p.checked_mul(3))
            .ok_or_else(|| ProbeError::Instrument("frame size overflow".to_string()))?;
        if data.len() != expected {
            return Err(ProbeError::Instrument(format!(
                "frame buffer holds {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled with a single BGR color.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    /// Convert from an RGB image (as decoded from disk).
    pub fn from_rgb(image: &RgbImage) -> Self {
        let mut data = Vec::with_capacity(image.as_raw().len());
        for px in image.pixels() {
            data.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        Self {
            width: image.width(),
            height: image.height(),
            data,
        }
    }

    /// Expand a grayscale image to three identical channels.
    pub fn from_gray(image: &GrayImage) -> Self {
        let data = image.as_raw().iter().flat_map(|&v| [v, v, v]).collect();
        Self {
            width: image.width(),
            height: image.height(),
            data,
        }
    }

    /// Decode an image file into a BGR frame.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let decoded = image::open(path)?.to_rgb8();
        Ok(Self::from_rgb(&decoded))
    }

    /// Encode the frame to an image file; the format follows the extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let rgb = RgbImage::from_fn(self.width, self.height, |x, y| {
            let [b, g, r] = self.pixel(x, y);
            Rgb([r, g, b])
        });
        rgb.save(path)?;
        Ok(())
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw interleaved BGR bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// BGR triple at (x, y).
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Overwrite the BGR triple at (x, y).
    pub fn put_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        self.data[i..i + 3].copy_from_slice(&bgr);
    }

    /// Copy `patch` into this frame with its top-left corner at (x, y), clipped
    /// to the frame bounds.
    pub fn blit(&mut self, patch: &BgrFrame, x: u32, y: u32) {
        for py in 0..patch.height {
            let ty = y + py;
            if ty >= self.height {
                break;
            }
            for px in 0..patch.width {
                let tx = x + px;
                if tx >= self.width {
                    break;
                }
                self.put_pixel(tx, ty, patch.pixel(px, py));
            }
        }
    }

    /// Luma conversion with the BT.601 weights used for BGR camera frames.
    pub fn to_gray(&self) -> GrayImage {
        let pixels = self
            .data
            .chunks_exact(3)
            .map(|bgr| {
                let y = 0.114 * bgr[0] as f32 + 0.587 * bgr[1] as f32 + 0.299 * bgr[2] as f32;
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect();
        ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Bilinear resize to the given dimensions.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        // Channel order is irrelevant to interpolation, so the RGB buffer type is reused.
        let Some(buffer) =
            ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(self.width, self.height, self.data.clone())
        else {
            return Self::filled(width, height, [0, 0, 0]);
        };
        let out = image::imageops::resize(
            &buffer,
            width,
            height,
            image::imageops::FilterType::Triangle,
        );
        Self {
            width,
            height,
            data: out.into_raw(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(BgrFrame::new(2, 2, vec![0; 11]).is_err());
        assert!(BgrFrame::new(2, 2, vec![0; 12]).is_ok());
    }

    #[test]
    fn test_rgb_conversion_swaps_channels() {
        let mut rgb = RgbImage::new(1, 1);
        rgb.put_pixel(0, 0, Rgb([10, 20, 30]));
        let frame = BgrFrame::from_rgb(&rgb);
        assert_eq!(frame.pixel(0, 0), [30, 20, 10]);
    }

    #[test]
    fn test_gray_weights_follow_channel_order() {
        // Pure red in BGR order
        let frame = BgrFrame::filled(1, 1, [0, 0, 255]);
        assert_eq!(frame.to_gray().get_pixel(0, 0)[0], 76);
        let frame = BgrFrame::filled(1, 1, [255, 0, 0]);
        assert_eq!(frame.to_gray().get_pixel(0, 0)[0], 29);
    }

    #[test]
    fn test_blit_clips_to_bounds() {
        let mut frame = BgrFrame::filled(4, 4, [0, 0, 0]);
        let patch = BgrFrame::filled(3, 3, [9, 9, 9]);
        frame.blit(&patch, 2, 2);
        assert_eq!(frame.pixel(3, 3), [9, 9, 9]);
        assert_eq!(frame.pixel(1, 1), [0, 0, 0]);
    }
}
