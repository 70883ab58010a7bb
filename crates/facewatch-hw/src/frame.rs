//! Frame type and YUYV, GREY and Y16 to RGB conversion.

use image::RgbImage;
use std::time::Instant;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: Instant,
    /// Driver sequence number of the buffer.
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0), used by camera diagnostics.
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.pixels().len();
        if pixels == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .image
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .sum();
        sum / pixels as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn into_image(width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength { expected, actual })
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        (y + 1.402 * v).round().clamp(0.0, 255.0) as u8,
        (y - 0.344_136 * u - 0.714_136 * v).round().clamp(0.0, 255.0) as u8,
        (y + 1.772 * u).round().clamp(0.0, 255.0) as u8,
    ]
}

/// Convert packed YUYV (4:2:2) to RGB with BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    into_image(width, height, rgb)
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(grey, pixels)?;
    let rgb = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    into_image(width, height, rgb)
}

/// Y16: 16-bit little-endian per pixel, downscaled to 8-bit and replicated.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(buf, pixels * 2)?;
    let rgb = buf[..pixels * 2]
        .chunks_exact(2)
        .flat_map(|c| {
            let g = (u16::from_le_bytes([c[0], c[1]]) >> 8) as u8;
            [g, g, g]
        })
        .collect();
    into_image(width, height, rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let img = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [100, 100, 100]);
        assert_eq!(img.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down
        let img = yuyv_to_rgb(&[76, 85, 76, 255], 2, 1).unwrap();
        let p = img.get_pixel(0, 0).0;
        assert!(p[0] > 240 && p[1] < 20 && p[2] < 20, "got {p:?}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let img = grey_to_rgb(&[7, 9], 2, 1).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [9, 9, 9]);
    }

    #[test]
    fn test_y16_takes_high_byte() {
        let img = y16_to_rgb(&[0xff, 0x12, 0x00, 0xab], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0x12; 3]);
        assert_eq!(img.get_pixel(1, 0).0, [0xab; 3]);
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(RgbImage::from_pixel(4, 4, image::Rgb([100, 100, 100])), 0);
        assert!((frame.avg_brightness() - 100.0).abs() < 0.01);
    }
}
