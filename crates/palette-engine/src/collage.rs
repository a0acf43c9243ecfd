use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};

use crate::color::ImageSample;

pub const DEFAULT_CELL_SIZE: u32 = 320;
pub const DEFAULT_MAX_IMAGES: usize = 5;

/// Reference images tiled into one square-celled grid, kept both as pixels
/// and as PNG bytes so downstream stages never re-encode.
#[derive(Debug, Clone)]
pub struct ReferenceCollage {
    pub image: RgbaImage,
    pub png_bytes: Vec<u8>,
    pub columns: u32,
    pub rows: u32,
}

/// Extra images beyond `max_images` are dropped without error.
pub fn create_reference_collage(
    images: &[ImageSample],
    cell_size: u32,
    max_images: usize,
) -> Result<ReferenceCollage> {
    let tiles = &images[..images.len().min(max_images)];
    if tiles.is_empty() {
        bail!("no reference images to composite");
    }
    if cell_size == 0 {
        bail!("collage cell size must be positive");
    }

    let (columns, rows) = grid_for(tiles.len());
    let canvas_w = columns
        .checked_mul(cell_size)
        .context("collage width overflows")?;
    let canvas_h = rows
        .checked_mul(cell_size)
        .context("collage height overflows")?;
    let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, Rgba([0, 0, 0, 255]));

    for (idx, tile) in tiles.iter().enumerate() {
        let Some(cell) = cover_fit(tile, cell_size, cell_size) else {
            continue;
        };
        let col = idx as u32 % columns;
        let row = idx as u32 / columns;
        draw_over(&mut canvas, &cell, col * cell_size, row * cell_size);
    }

    let mut png_bytes = Vec::new();
    canvas
        .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("failed encoding reference collage")?;
    if png_bytes.is_empty() {
        bail!("reference collage encoded to an empty buffer");
    }

    Ok(ReferenceCollage {
        image: canvas,
        png_bytes,
        columns,
        rows,
    })
}

/// `cols = ceil(sqrt(n))`, `rows = ceil(n / cols)`.
pub fn grid_for(count: usize) -> (u32, u32) {
    if count == 0 {
        return (0, 0);
    }
    let columns = (count as f64).sqrt().ceil() as u32;
    let rows = (count as u32).div_ceil(columns);
    (columns, rows)
}

/// Source rectangle `(x, y, w, h)` that matches the cell's aspect ratio by
/// trimming the longer source dimension evenly from both sides.
pub fn cover_crop(src_w: u32, src_h: u32, cell_w: u32, cell_h: u32) -> (u32, u32, u32, u32) {
    let src_aspect = f64::from(src_w) / f64::from(src_h);
    let cell_aspect = f64::from(cell_w) / f64::from(cell_h);
    if src_aspect > cell_aspect {
        let crop_w = ((f64::from(src_h) * cell_aspect).round() as u32).clamp(1, src_w);
        ((src_w - crop_w) / 2, 0, crop_w, src_h)
    } else {
        let crop_h = ((f64::from(src_w) / cell_aspect).round() as u32).clamp(1, src_h);
        (0, (src_h - crop_h) / 2, src_w, crop_h)
    }
}

fn cover_fit(source: &ImageSample, cell_w: u32, cell_h: u32) -> Option<RgbaImage> {
    let (src_w, src_h) = source.dimensions();
    if src_w == 0 || src_h == 0 {
        return None;
    }
    let (x, y, w, h) = cover_crop(src_w, src_h, cell_w, cell_h);
    let cropped = imageops::crop_imm(source, x, y, w, h).to_image();
    Some(imageops::resize(&cropped, cell_w, cell_h, FilterType::Triangle))
}

/// Source-over composite onto an opaque canvas.
fn draw_over(canvas: &mut RgbaImage, cell: &RgbaImage, x0: u32, y0: u32) {
    for (dx, dy, pixel) in cell.enumerate_pixels() {
        let (x, y) = (x0 + dx, y0 + dy);
        if x >= canvas.width() || y >= canvas.height() {
            continue;
        }
        let alpha = u16::from(pixel[3]);
        if alpha == 255 {
            canvas.put_pixel(x, y, Rgba([pixel[0], pixel[1], pixel[2], 255]));
            continue;
        }
        let base = *canvas.get_pixel(x, y);
        let blend = |fg: u8, bg: u8| -> u8 {
            ((u16::from(fg) * alpha + u16::from(bg) * (255 - alpha)) / 255) as u8
        };
        canvas.put_pixel(
            x,
            y,
            Rgba([
                blend(pixel[0], base[0]),
                blend(pixel[1], base[1]),
                blend(pixel[2], base[2]),
                255,
            ]),
        );
    }
}
