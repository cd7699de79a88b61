//! Grayscale frame processing: YUYV conversion, CLAHE, blur scoring,
//! face cropping.

use image::imageops::FilterType;
use image::{GrayImage, Luma};
use imageproc::filter::laplacian_filter;
use jarvis_core::{BoundingBox, ImageSize};

/// CLAHE tile grid (8x8) and clip limit (2x the mean bin height).
const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP: f32 = 2.0 / 256.0;

/// One camera capture reduced to 8-bit luma, row-major.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn into_image(self) -> Result<GrayImage, FrameError> {
        let expected = (self.width * self.height) as usize;
        let actual = self.data.len();
        GrayImage::from_raw(self.width, self.height, self.data)
            .ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// Keep the luma bytes of a packed `[Y0 U Y1 V]` buffer.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    let packed = yuyv.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })?;
    Ok(packed.chunks_exact(2).map(|px| px[0]).collect())
}

/// Halve the frame (cubic) and normalise contrast with CLAHE.
pub fn preprocess(frame: &GrayImage) -> GrayImage {
    let w = (frame.width() / 2).max(1);
    let h = (frame.height() / 2).max(1);
    let mut small = image::imageops::resize(frame, w, h, FilterType::CatmullRom);
    clahe_enhance(&mut small, CLAHE_TILES, CLAHE_CLIP);
    small
}

/// Contrast-limited adaptive histogram equalisation, in place.
///
/// Builds a clipped CDF per tile and blends neighbouring tile CDFs
/// bilinearly for each pixel.
pub fn clahe_enhance(img: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let t = tiles as usize;
    if t == 0 {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[img.get_pixel(x as u32, y as u32).0[0] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist + u32::from(i < leftover);
            }

            let mut cdf = [0f32; 256];
            let mut acc = 0f32;
            for (i, &count) in hist.iter().enumerate() {
                acc += count as f32;
                cdf[i] = acc;
            }
            let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;
        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let pixel = img.get_pixel(x as u32, y as u32).0[0] as usize;
            let top = cdfs[r0 * t + c0][pixel] * (1.0 - dx) + cdfs[r0 * t + c1][pixel] * dx;
            let bot = cdfs[r1 * t + c0][pixel] * (1.0 - dx) + cdfs[r1 * t + c1][pixel] * dx;
            let val = top * (1.0 - dy) + bot * dy;
            img.put_pixel(x as u32, y as u32, Luma([val.round().clamp(0.0, 255.0) as u8]));
        }
    }
}

/// Sharpness score: variance of the 3x3 Laplacian response.
pub fn laplacian_variance(img: &GrayImage) -> f64 {
    if img.width() == 0 || img.height() == 0 {
        return 0.0;
    }
    let response = laplacian_filter(img);
    let n = response.as_raw().len() as f64;
    let (sum, sum_sq) = response.as_raw().iter().fold((0.0, 0.0), |(s, sq), &v| {
        let v = f64::from(v);
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Cut `bbox` out of `img` and resize it to `size`. `None` if the box is
/// empty once clamped to the image.
pub fn crop_face(img: &GrayImage, bbox: &BoundingBox, size: ImageSize) -> Option<GrayImage> {
    let b = bbox.clamp_to(img.width(), img.height());
    if b.width() == 0 || b.height() == 0 {
        return None;
    }
    let crop = image::imageops::crop_imm(img, b.x0 as u32, b.y0 as u32, b.width(), b.height()).to_image();
    Some(image::imageops::resize(&crop, size.width, size.height, FilterType::CatmullRom))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
