//! Snapshot annotation: box overlays and optional JPEG encoding.

use crate::detect::result::BoundingBox;
use crate::frame::Frame;

const BOX_COLOR: [u8; 3] = [255, 40, 40];
const BOX_THICKNESS: u32 = 2;

/// Copy a frame's pixels with detection rectangles drawn on top. The frame
/// itself stays untouched.
pub fn annotated_pixels(frame: &Frame, boxes: &[BoundingBox]) -> Vec<u8> {
    let mut pixels = frame.pixels().to_vec();
    for bbox in boxes {
        draw_box(&mut pixels, frame.width, frame.height, bbox);
    }
    pixels
}

fn draw_box(pixels: &mut [u8], width: u32, height: u32, bbox: &BoundingBox) {
    let x0 = bbox.x.max(0) as u32;
    let y0 = bbox.y.max(0) as u32;
    let x1 = ((bbox.x + bbox.width as i32).max(0) as u32).min(width.saturating_sub(1));
    let y1 = ((bbox.y + bbox.height as i32).max(0) as u32).min(height.saturating_sub(1));
    if x0 >= width || y0 >= height || x1 <= x0 || y1 <= y0 {
        return;
    }

    for t in 0..BOX_THICKNESS {
        let top = (y0 + t).min(y1);
        let bottom = y1.saturating_sub(t).max(y0);
        for x in x0..=x1 {
            put(pixels, width, x, top);
            put(pixels, width, x, bottom);
        }
        let left = (x0 + t).min(x1);
        let right = x1.saturating_sub(t).max(x0);
        for y in y0..=y1 {
            put(pixels, width, left, y);
            put(pixels, width, right, y);
        }
    }
}

fn put(pixels: &mut [u8], width: u32, x: u32, y: u32) {
    let idx = (y as usize * width as usize + x as usize) * 3;
    if idx + 2 < pixels.len() {
        pixels[idx..idx + 3].copy_from_slice(&BOX_COLOR);
    }
}

#[cfg(feature = "snapshot-jpeg")]
pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    use anyhow::Context;
    use image::codecs::jpeg::JpegEncoder;
    use image::ImageEncoder;

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, 85);
    encoder
        .write_image(pixels, width, height, image::ExtendedColorType::Rgb8)
        .context("encode snapshot jpeg")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(vec![0; 64 * 48 * 3], 64, 48, 1)
    }

    #[test]
    fn draws_box_edges_without_touching_interior() {
        let f = frame();
        let bbox = BoundingBox::new(10, 10, 20, 20, 0.9);
        let out = annotated_pixels(&f, &[bbox]);

        let px = |x: usize, y: usize| &out[(y * 64 + x) * 3..(y * 64 + x) * 3 + 3];
        assert_eq!(px(10, 10), &BOX_COLOR); // corner
        assert_eq!(px(20, 10), &BOX_COLOR); // top edge
        assert_eq!(px(20, 20), &[0, 0, 0]); // interior untouched
    }

    #[test]
    fn out_of_frame_box_is_clipped_not_panicking() {
        let f = frame();
        let bbox = BoundingBox::new(-10, -10, 200, 200, 0.9);
        let out = annotated_pixels(&f, &[bbox]);
        assert_eq!(out.len(), f.byte_len());
    }

    #[test]
    fn source_frame_is_unmodified() {
        let f = frame();
        let _ = annotated_pixels(&f, &[BoundingBox::new(5, 5, 10, 10, 0.9)]);
        assert!(f.pixels().iter().all(|&b| b == 0));
    }
}
