use std::borrow::Cow;

use image::imageops::{self, FilterType};
use image::RgbaImage;
use indexmap::IndexMap;
use palette_contracts::styles::normalize_hex_color;

/// A decoded reference image. Lives only for the duration of one analysis.
pub type ImageSample = RgbaImage;

/// Longest side of the working copy used for histogramming.
pub const SAMPLE_MAX_SIDE: u32 = 96;
/// Pixels below this alpha are treated as background.
pub const OPAQUE_ALPHA_MIN: u8 = 220;
/// Only every n-th pixel of the flattened buffer is counted.
pub const PIXEL_STRIDE: usize = 3;

/// Ranks coarse RGB buckets (16 levels per channel) by pixel count across all
/// images and returns up to `count` distinct bucket-center colors as
/// lowercase `#rrggbb`, most frequent first.
pub fn extract_dominant_palette(images: &[ImageSample], count: usize) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }

    // Insertion order breaks ties between equally common buckets.
    let mut histogram: IndexMap<u16, u64> = IndexMap::new();
    for image in images {
        let Some(sample) = downscale_for_sampling(image) else {
            continue;
        };
        for pixel in sample.pixels().step_by(PIXEL_STRIDE) {
            let [r, g, b, a] = pixel.0;
            if a < OPAQUE_ALPHA_MIN {
                continue;
            }
            *histogram.entry(bucket_key(r, g, b)).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(u16, u64)> = histogram.into_iter().collect();
    ranked.sort_by(|left, right| right.1.cmp(&left.1));

    let mut palette: Vec<String> = Vec::new();
    for (key, _) in ranked.into_iter().take(count.saturating_mul(3).max(count)) {
        let hex = bucket_center_hex(key);
        if !palette.contains(&hex) {
            palette.push(hex);
        }
        if palette.len() >= count {
            break;
        }
    }
    palette
}

fn downscale_for_sampling(image: &ImageSample) -> Option<Cow<'_, ImageSample>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let longest = width.max(height);
    if longest <= SAMPLE_MAX_SIDE {
        return Some(Cow::Borrowed(image));
    }
    let scale = f64::from(SAMPLE_MAX_SIDE) / f64::from(longest);
    let target_w = ((f64::from(width) * scale).round() as u32).max(1);
    let target_h = ((f64::from(height) * scale).round() as u32).max(1);
    Some(Cow::Owned(imageops::resize(
        image,
        target_w,
        target_h,
        FilterType::Triangle,
    )))
}

fn bucket_key(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r >> 4) << 8) | (u16::from(g >> 4) << 4) | u16::from(b >> 4)
}

fn bucket_center_hex(key: u16) -> String {
    let center = |level: u16| -> u8 { (level * 16 + 8) as u8 };
    rgb_hex(
        center((key >> 8) & 0xF),
        center((key >> 4) & 0xF),
        center(key & 0xF),
    )
}

pub fn rgb_hex(r: u8, g: u8, b: u8) -> String {
    format!("#{r:02x}{g:02x}{b:02x}")
}

/// Decodes `#rrggbb` (or `0x`/bare forms) into channels.
pub fn parse_hex_rgb(value: &str) -> Option<(u8, u8, u8)> {
    let normalized = normalize_hex_color(value)?;
    let body = &normalized[1..];
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&body[range], 16).ok();
    Some((channel(0..2)?, channel(2..4)?, channel(4..6)?))
}
