//! Image preprocessing variants fed to the recognition backends.
//!
//! All transforms work on 8-bit grayscale and are CPU bound; callers run
//! [`render_variants`] on the blocking pool.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use imageproc::contrast::{self, ThresholdType};
use imageproc::definitions::Image;
use imageproc::filter::gaussian_blur_f32;
use imageproc::integral_image::{integral_image, sum_image_pixels};
use imageproc::morphology::{self, Mask};
use serde::Serialize;
use thiserror::Error;

/// Adaptive threshold neighbourhood (pixels per side).
const ADAPTIVE_BLOCK: u32 = 31;
/// Constant subtracted from the neighbourhood mean.
const ADAPTIVE_C: f64 = 10.0;
/// Gaussian sigma for the unsharp mask.
const SHARPEN_SIGMA: f32 = 3.0;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to decode image: {0}")]
    Decode(image::ImageError),
    #[error("Failed to encode variant: {0}")]
    Encode(image::ImageError),
}

/// A preprocessing transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Input bytes as uploaded.
    Original,
    Gray,
    /// Global Otsu threshold.
    Otsu,
    /// Mean adaptive threshold.
    Adaptive,
    /// Unsharp mask.
    Sharp,
    /// Morphological opening of the Otsu image.
    Morph,
}

impl Variant {
    /// Grayscale-derived variants in evaluation order.
    pub const STANDARD: [Variant; 5] = [
        Variant::Gray,
        Variant::Otsu,
        Variant::Adaptive,
        Variant::Sharp,
        Variant::Morph,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Original => "original",
            Variant::Gray => "gray",
            Variant::Otsu => "otsu",
            Variant::Adaptive => "adaptive",
            Variant::Sharp => "sharp",
            Variant::Morph => "morph",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode `image` once and render each requested variant as PNG, in order.
pub fn render_variants(
    image: &[u8],
    variants: &[Variant],
) -> Result<Vec<(Variant, Vec<u8>)>, PreprocessError> {
    let decoded = image::load_from_memory(image).map_err(PreprocessError::Decode)?;

    let mut gray: Option<GrayImage> = None;
    let mut otsu: Option<GrayImage> = None;

    let mut rendered = Vec::with_capacity(variants.len());
    for &variant in variants {
        if variant == Variant::Original {
            rendered.push((variant, image.to_vec()));
            continue;
        }

        let g: &GrayImage = gray.get_or_insert_with(|| decoded.to_luma8());
        let out = match variant {
            Variant::Otsu => otsu.get_or_insert_with(|| otsu_binarize(g)).clone(),
            Variant::Adaptive => adaptive_threshold(g, ADAPTIVE_BLOCK, ADAPTIVE_C),
            Variant::Sharp => sharpen(g, SHARPEN_SIGMA),
            Variant::Morph => morph_open(otsu.get_or_insert_with(|| otsu_binarize(g))),
            Variant::Gray | Variant::Original => g.clone(),
        };
        rendered.push((variant, encode_png(out)?));
    }

    Ok(rendered)
}

fn encode_png(img: GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(PreprocessError::Encode)?;
    Ok(buf)
}

/// Binary image: white where the pixel is above the Otsu level.
pub fn otsu_binarize(gray: &GrayImage) -> GrayImage {
    contrast::threshold(gray, contrast::otsu_level(gray), ThresholdType::Binary)
}

/// White where the pixel is above its neighbourhood mean minus `c`.
pub fn adaptive_threshold(gray: &GrayImage, block: u32, c: f64) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let integral: Image<Luma<u64>> = integral_image::<_, u64>(gray);

    let radius = block / 2;
    GrayImage::from_fn(w, h, |x, y| {
        let x0 = x.saturating_sub(radius);
        let y0 = y.saturating_sub(radius);
        let x1 = (x + radius).min(w - 1);
        let y1 = (y + radius).min(h - 1);

        let sum = sum_image_pixels(&integral, x0, y0, x1, y1)[0];
        let count = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f64;
        let mean = sum as f64 / count;

        Luma([if gray.get_pixel(x, y)[0] as f64 > mean - c { 255 } else { 0 }])
    })
}

/// Unsharp mask: `1.5 * gray - 0.5 * blur(gray)`.
pub fn sharpen(gray: &GrayImage, sigma: f32) -> GrayImage {
    let blurred = gaussian_blur_f32(gray, sigma);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let p = gray.get_pixel(x, y)[0] as f32;
        let b = blurred.get_pixel(x, y)[0] as f32;
        Luma([(1.5 * p - 0.5 * b).round().clamp(0.0, 255.0) as u8])
    })
}

/// Opening with a 2x2 rectangle. Removes white specks smaller than the
/// kernel.
pub fn morph_open(binary: &GrayImage) -> GrayImage {
    let kernel = Mask::from_image(&GrayImage::from_pixel(2, 2, Luma([255])), 0, 0);
    morphology::grayscale_open(binary, &kernel)
}
