//! Per-page enhancement: brightness, contrast, gamma, sharpen, threshold.

use image::{DynamicImage, GenericImageView, ImageBuffer, Luma, RgbImage, imageops};
use serde::Serialize;

/// Whether pages keep their colours or are reduced to black and white.
///
/// Thresholding only ever happens in [`ColorMode::Binarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ColorMode {
    PreserveColor,
    Binarize {
        /// Luma at or above which a pixel becomes white.
        threshold: u8,
    },
}

/// Central rectangle, as fractions of page width and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CenterRegion {
    pub width_fraction: f32,
    pub height_fraction: f32,
}

/// Fixed enhancement parameters applied to every page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformConfig {
    pub dpi: u32,
    /// Percent; `10.0` brightens by a tenth of full scale.
    pub brightness: f32,
    /// Percent, as accepted by [`image::imageops::contrast`].
    pub contrast: f32,
    pub gamma: f32,
    /// Unsharp-mask sigma; `0.0` disables sharpening.
    pub sharpen: f32,
    /// `Some` enhances only the central region, leaving margins untouched.
    pub center_region: Option<CenterRegion>,
    pub mode: ColorMode,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            brightness: 10.0,
            contrast: 25.0,
            gamma: 1.0,
            sharpen: 0.0,
            center_region: None,
            mode: ColorMode::PreserveColor,
        }
    }
}

impl TransformConfig {
    /// Checks ranges.
    ///
    /// # Errors
    ///
    /// A message naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), String> {
        if !(36..=1200).contains(&self.dpi) {
            return Err(format!("dpi must be within 36..=1200, got {}", self.dpi));
        }
        if !(-100.0..=100.0).contains(&self.brightness) {
            return Err(format!("brightness must be within -100..=100, got {}", self.brightness));
        }
        if !(-100.0..=100.0).contains(&self.contrast) {
            return Err(format!("contrast must be within -100..=100, got {}", self.contrast));
        }
        if !(self.gamma > 0.0 && self.gamma <= 10.0) {
            return Err(format!("gamma must be within (0, 10], got {}", self.gamma));
        }
        if !(0.0..=10.0).contains(&self.sharpen) {
            return Err(format!("sharpen must be within 0..=10, got {}", self.sharpen));
        }
        if let Some(region) = self.center_region {
            let ok = |f: f32| f > 0.0 && f <= 1.0;
            if !ok(region.width_fraction) || !ok(region.height_fraction) {
                return Err("center region fractions must be within (0, 1]".to_string());
            }
        }
        Ok(())
    }
}

/// Applies `config` to one page.
#[must_use]
pub fn apply(page: &DynamicImage, config: &TransformConfig) -> RgbImage {
    let rgb = DynamicImage::ImageRgb8(page.to_rgb8());
    match config.center_region {
        Some(region) => apply_center(&rgb, region, config),
        None => apply_whole(&rgb, config),
    }
}

fn apply_whole(page: &DynamicImage, config: &TransformConfig) -> RgbImage {
    let mut out = adjust_levels(page, config);
    if (config.gamma - 1.0).abs() > f32::EPSILON {
        out = apply_gamma(&out, config.gamma);
    }
    if config.sharpen > 0.0 {
        out = out.unsharpen(config.sharpen, 1);
    }
    finish(&out, config.mode)
}

fn apply_center(page: &DynamicImage, region: CenterRegion, config: &TransformConfig) -> RgbImage {
    let (width, height) = page.dimensions();
    let (x, y, w, h) = center_rect(width, height, region);

    let center = page.crop_imm(x, y, w, h);
    let enhanced = finish(&adjust_levels(&center, config), config.mode);

    let mut composite = page.to_rgb8();
    imageops::replace(&mut composite, &enhanced, i64::from(x), i64::from(y));
    composite
}

fn adjust_levels(page: &DynamicImage, config: &TransformConfig) -> DynamicImage {
    let offset = brightness_offset(config.brightness);
    let brightened = if offset == 0 {
        page.clone()
    } else {
        page.brighten(offset)
    };
    if config.contrast.abs() < f32::EPSILON {
        brightened
    } else {
        brightened.adjust_contrast(config.contrast)
    }
}

fn finish(page: &DynamicImage, mode: ColorMode) -> RgbImage {
    match mode {
        ColorMode::PreserveColor => page.to_rgb8(),
        ColorMode::Binarize { threshold } => binarize(page, threshold),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn brightness_offset(percent: f32) -> i32 {
    (255.0 * percent / 100.0).round() as i32
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn apply_gamma(page: &DynamicImage, gamma: f32) -> DynamicImage {
    let inverse = 1.0 / f64::from(gamma);
    let lut: Vec<u8> = (0..=255u8)
        .map(|v| (255.0 * (f64::from(v) / 255.0).powf(inverse)).round().clamp(0.0, 255.0) as u8)
        .collect();

    let mut rgb = page.to_rgb8();
    for pixel in rgb.pixels_mut() {
        for channel in &mut pixel.0 {
            *channel = lut[usize::from(*channel)];
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

fn binarize(page: &DynamicImage, threshold: u8) -> RgbImage {
    let luma = page.to_luma8();
    let bw: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_fn(luma.width(), luma.height(), |x, y| {
        if luma.get_pixel(x, y).0[0] >= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    DynamicImage::ImageLuma8(bw).to_rgb8()
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn center_rect(width: u32, height: u32, region: CenterRegion) -> (u32, u32, u32, u32) {
    let w = ((width as f32 * region.width_fraction).round() as u32).clamp(1, width.max(1));
    let h = ((height as f32 * region.height_fraction).round() as u32).clamp(1, height.max(1));
    ((width - w) / 2, (height - h) / 2, w, h)
}
