//! Conversion of device pixel layouts into interleaved RGB24.

use anyhow::{anyhow, Result};

/// Pixel layouts a capture backend may hand to the acquisition loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    /// Map a V4L2-style fourcc to a pixel format.
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"BGR3" => Some(Self::Bgr24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

pub fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            check_len("RGB", pixels, packed_len(width, height, 3)?)?;
            Ok(pixels.to_vec())
        }
        PixelFormat::Bgr24 => {
            check_len("BGR", pixels, packed_len(width, height, 3)?)?;
            let mut rgb = pixels.to_vec();
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(rgb)
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
        PixelFormat::Mjpeg => mjpeg_to_rgb(pixels, width, height),
    }
}

fn packed_len(width: u32, height: u32, bytes_per_pixel: usize) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(bytes_per_pixel))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn check_len(label: &str, pixels: &[u8], expected: usize) -> Result<()> {
    if pixels.len() != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            label,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if width % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", width));
    }
    check_len("YUYV", pixels, packed_len(width, height, 2)?)?;

    let mut rgb = Vec::with_capacity(packed_len(width, height, 3)?);
    for quad in pixels.chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let (r, g, b) = yuv_to_rgb(y as f32, u, v);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    Ok(rgb)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    check_len("NV12", pixels, expected)?;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let (r, g, b) = yuv_to_rgb(y, u, v);
            let offset = (j * w + i) * 3;
            rgb[offset] = r;
            rgb[offset + 1] = g;
            rgb[offset + 2] = b;
        }
    }

    Ok(rgb)
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> (u8, u8, u8) {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    (clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b))
}

#[cfg(feature = "mjpeg")]
fn mjpeg_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory_with_format(pixels, image::ImageFormat::Jpeg)
        .map_err(|e| anyhow!("MJPEG decode failed: {}", e))?
        .to_rgb8();
    if decoded.width() != width || decoded.height() != height {
        return Err(anyhow!(
            "MJPEG frame is {}x{}, expected {}x{}",
            decoded.width(),
            decoded.height(),
            width,
            height
        ));
    }
    Ok(decoded.into_raw())
}

#[cfg(not(feature = "mjpeg"))]
fn mjpeg_to_rgb(_pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<u8>> {
    Err(anyhow!("MJPEG frames require the mjpeg feature"))
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let width = 2;
        let height = 2;
        let y_plane = vec![128u8; 4];
        let uv_plane = vec![128u8; 2];
        let nv12 = [y_plane, uv_plane].concat();

        let rgb = normalize_to_rgb(&nv12, width, height, PixelFormat::Nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);

        Ok(())
    }

    #[test]
    fn yuyv_conversion_produces_gray() -> Result<()> {
        let yuyv = vec![90u8, 128, 90, 128];
        let rgb = normalize_to_rgb(&yuyv, 2, 1, PixelFormat::Yuyv)?;
        assert_eq!(rgb, vec![90u8; 6]);
        Ok(())
    }

    #[test]
    fn bgr_is_swapped() -> Result<()> {
        let bgr = vec![1u8, 2, 3, 4, 5, 6];
        let rgb = normalize_to_rgb(&bgr, 2, 1, PixelFormat::Bgr24)?;
        assert_eq!(rgb, vec![3u8, 2, 1, 6, 5, 4]);
        Ok(())
    }

    #[test]
    fn rgb_pass_through_validates_length() -> Result<()> {
        let pixels = vec![1u8; 9];
        let rgb = normalize_to_rgb(&pixels, 1, 3, PixelFormat::Rgb24)?;
        assert_eq!(rgb, pixels);
        assert!(normalize_to_rgb(&pixels, 2, 3, PixelFormat::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }
}
