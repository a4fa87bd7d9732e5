//! Page image → model input tensor.
//!
//! Mirrors Nougat's inference-time image preparation:
//!
//! 1. crop the white margin around the content
//! 2. optionally rotate to match the input's orientation
//! 3. resize the shorter edge to `min(height, width)`
//! 4. shrink to fit inside `width × height` (thumbnail, never enlarges)
//! 5. pad to exactly `width × height`, centred, black fill
//! 6. rescale to `[0, 1]` and normalise per channel
//!
//! Padding is always centred. Random padding is a training-time
//! augmentation and has no place here; it would make two runs over the
//! same page produce different text.

use crate::error::InferenceError;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use ndarray::Array3;
use serde::Deserialize;

/// Target input size (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "SizeRepr")]
pub struct InputSize {
    pub height: u32,
    pub width: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Map { height: u32, width: u32 },
    Pair([u32; 2]),
}

impl From<SizeRepr> for InputSize {
    fn from(r: SizeRepr) -> Self {
        match r {
            SizeRepr::Map { height, width } => InputSize { height, width },
            SizeRepr::Pair([height, width]) => InputSize { height, width },
        }
    }
}

/// Contents of `preprocessor_config.json`. Missing keys take Nougat's defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub do_crop_margin: bool,
    pub do_resize: bool,
    pub size: InputSize,
    pub do_thumbnail: bool,
    pub do_align_long_axis: bool,
    pub do_pad: bool,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_crop_margin: true,
            do_resize: true,
            size: InputSize {
                height: 896,
                width: 672,
            },
            do_thumbnail: true,
            do_align_long_axis: false,
            do_pad: true,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.485, 0.456, 0.406],
            image_std: [0.229, 0.224, 0.225],
        }
    }
}

/// Deterministic page preprocessor.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    config: PreprocessorConfig,
}

impl ImageProcessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        Self { config }
    }

    pub fn input_size(&self) -> InputSize {
        self.config.size
    }

    /// Prepare one page as a `[3, height, width]` tensor.
    pub fn prepare(&self, image: &DynamicImage) -> Result<Array3<f32>, InferenceError> {
        let c = &self.config;
        let InputSize { height, width } = c.size;
        let mut img = image.to_rgb8();

        if img.width() == 0 || img.height() == 0 {
            return Err(InferenceError::PrepareInput {
                page: 0,
                detail: "page image has zero size".into(),
            });
        }

        if c.do_crop_margin {
            img = crop_margin(&img);
        }
        if c.do_align_long_axis {
            img = align_long_axis(img, c.size);
        }
        if c.do_resize {
            let (w, h) = shorter_edge_size(img.width(), img.height(), height.min(width));
            img = imageops::resize(&img, w, h, FilterType::Triangle);
        }
        if c.do_thumbnail {
            if let Some((w, h)) = thumbnail_size(img.width(), img.height(), width, height) {
                img = imageops::resize(&img, w, h, FilterType::Triangle);
            }
        }
        if c.do_pad {
            img = pad_centered(&img, width, height);
        } else if img.width() != width || img.height() != height {
            img = imageops::resize(&img, width, height, FilterType::Triangle);
        }

        Ok(self.to_tensor(&img))
    }

    fn to_tensor(&self, img: &RgbImage) -> Array3<f32> {
        let c = &self.config;
        let (w, h) = (img.width() as usize, img.height() as usize);
        let scale = if c.do_rescale { c.rescale_factor } else { 1.0 };

        Array3::from_shape_fn((3, h, w), |(ch, y, x)| {
            let v = f32::from(img.get_pixel(x as u32, y as u32)[ch]) * scale;
            if c.do_normalize {
                (v - c.image_mean[ch]) / c.image_std[ch]
            } else {
                v
            }
        })
    }
}

/// Crop to the bounding box of "ink": pixels darker than 200 after
/// stretching the grey range to 0–255. Blank pages come back unchanged.
pub fn crop_margin(img: &RgbImage) -> RgbImage {
    let gray: GrayImage = DynamicImage::ImageRgb8(img.clone()).to_luma8();
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if max == min {
        return img.clone();
    }

    let range = f32::from(max - min);
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in gray.enumerate_pixels() {
        let stretched = f32::from(p[0] - min) / range * 255.0;
        if stretched < 200.0 {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }

    match bounds {
        Some((x0, y0, x1, y1)) => {
            imageops::crop_imm(img, x0, y0, x1 - x0 + 1, y1 - y0 + 1).to_image()
        }
        None => img.clone(),
    }
}

fn align_long_axis(img: RgbImage, size: InputSize) -> RgbImage {
    let portrait_target = size.height > size.width;
    let landscape_target = size.height < size.width;
    if (portrait_target && img.width() > img.height())
        || (landscape_target && img.width() < img.height())
    {
        imageops::rotate90(&img)
    } else {
        img
    }
}

/// Dimensions after scaling the shorter edge to `target`, keeping aspect ratio.
pub fn shorter_edge_size(w: u32, h: u32, target: u32) -> (u32, u32) {
    if w <= h {
        let new_h = (f64::from(h) * f64::from(target) / f64::from(w)).round() as u32;
        (target, new_h.max(1))
    } else {
        let new_w = (f64::from(w) * f64::from(target) / f64::from(h)).round() as u32;
        (new_w.max(1), target)
    }
}

/// Dimensions after shrinking to fit inside `max_w × max_h`, or `None` if
/// the image already fits.
pub fn thumbnail_size(w: u32, h: u32, max_w: u32, max_h: u32) -> Option<(u32, u32)> {
    if w <= max_w && h <= max_h {
        return None;
    }
    let scale = (f64::from(max_w) / f64::from(w)).min(f64::from(max_h) / f64::from(h));
    let new_w = ((f64::from(w) * scale).round() as u32).clamp(1, max_w);
    let new_h = ((f64::from(h) * scale).round() as u32).clamp(1, max_h);
    Some((new_w, new_h))
}

/// Place `img` in the centre of a black `width × height` canvas.
pub fn pad_centered(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    let left = width.saturating_sub(img.width()) / 2;
    let top = height.saturating_sub(img.height()) / 2;
    imageops::overlay(&mut canvas, img, i64::from(left), i64::from(top));
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_box(w: u32, h: u32, bx: (u32, u32, u32, u32)) -> RgbImage {
        let mut img = RgbImage::from_pixel(w, h, Rgb([255, 255, 255]));
        for y in bx.1..bx.3 {
            for x in bx.0..bx.2 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        img
    }

    #[test]
    fn config_parses_hf_layout() {
        let json = r#"{
            "do_crop_margin": true,
            "size": {"height": 896, "width": 672},
            "image_mean": [0.485, 0.456, 0.406],
            "image_std": [0.229, 0.224, 0.225],
            "resample": 2
        }"#;
        let c: PreprocessorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            c.size,
            InputSize {
                height: 896,
                width: 672
            }
        );
        assert!(c.do_pad);
    }

    #[test]
    fn config_parses_pair_size() {
        let c: PreprocessorConfig = serde_json::from_str(r#"{"size": [448, 336]}"#).unwrap();
        assert_eq!(c.size.height, 448);
        assert_eq!(c.size.width, 336);
    }

    #[test]
    fn crop_margin_finds_content() {
        let img = page_with_box(100, 80, (10, 20, 30, 50));
        let cropped = crop_margin(&img);
        assert_eq!(cropped.dimensions(), (20, 30));
    }

    #[test]
    fn crop_margin_leaves_blank_page() {
        let img = RgbImage::from_pixel(40, 60, Rgb([255, 255, 255]));
        assert_eq!(crop_margin(&img).dimensions(), (40, 60));
    }

    #[test]
    fn shorter_edge_resize_keeps_aspect() {
        assert_eq!(shorter_edge_size(816, 1056, 672), (672, 870));
        assert_eq!(shorter_edge_size(1056, 816, 672), (870, 672));
    }

    #[test]
    fn thumbnail_only_shrinks() {
        assert_eq!(thumbnail_size(600, 800, 672, 896), None);
        assert_eq!(thumbnail_size(672, 1344, 672, 896), Some((448, 896)));
    }

    #[test]
    fn long_axis_follows_target_orientation() {
        let portrait = InputSize { height: 896, width: 672 };
        let landscape = InputSize { height: 672, width: 896 };
        let square = InputSize { height: 768, width: 768 };
        let wide = RgbImage::new(40, 20);
        let tall = RgbImage::new(20, 40);

        assert_eq!(align_long_axis(wide.clone(), portrait).dimensions(), (20, 40));
        assert_eq!(align_long_axis(tall.clone(), portrait).dimensions(), (20, 40));
        assert_eq!(align_long_axis(tall.clone(), landscape).dimensions(), (40, 20));
        // a square target has no long axis to align to
        assert_eq!(align_long_axis(tall, square).dimensions(), (20, 40));
        assert_eq!(align_long_axis(wide, square).dimensions(), (40, 20));
    }

    #[test]
    fn padding_is_centred() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
        let padded = pad_centered(&img, 6, 4);
        assert_eq!(padded.dimensions(), (6, 4));
        assert_eq!(padded.get_pixel(2, 1), &Rgb([255, 255, 255]));
        assert_eq!(padded.get_pixel(3, 2), &Rgb([255, 255, 255]));
        assert_eq!(padded.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(padded.get_pixel(5, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn prepare_produces_fixed_shape() {
        let processor = ImageProcessor::new(PreprocessorConfig {
            size: InputSize {
                height: 64,
                width: 48,
            },
            ..Default::default()
        });
        let page = DynamicImage::ImageRgb8(page_with_box(120, 90, (5, 5, 100, 80)));
        let t = processor.prepare(&page).unwrap();
        assert_eq!(t.shape(), &[3, 64, 48]);
    }

    #[test]
    fn prepare_is_deterministic() {
        let processor = ImageProcessor::new(PreprocessorConfig {
            size: InputSize {
                height: 32,
                width: 24,
            },
            ..Default::default()
        });
        let page = DynamicImage::ImageRgb8(page_with_box(50, 70, (3, 4, 40, 60)));
        assert_eq!(
            processor.prepare(&page).unwrap(),
            processor.prepare(&page).unwrap()
        );
    }

    #[test]
    fn normalisation_maps_black_padding() {
        let processor = ImageProcessor::new(PreprocessorConfig {
            do_crop_margin: false,
            size: InputSize {
                height: 8,
                width: 8,
            },
            ..Default::default()
        });
        let page = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 8, Rgb([255, 255, 255])));
        let t = processor.prepare(&page).unwrap();
        let black_r = (0.0 - 0.485) / 0.229;
        let white_r = (1.0 - 0.485) / 0.229;
        assert!((t[[0, 0, 0]] - black_r).abs() < 1e-5);
        assert!((t[[0, 4, 4]] - white_r).abs() < 1e-5);
    }
}
