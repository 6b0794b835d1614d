//! Watermark overlays

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::compositor::Canvas;
use crate::error::{EngineError, EngineResult};

const TEXT_COLOR: u32 = 0xFF_FFFF;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const GLYPH_WIDTH: usize = 5;
const GLYPH_HEIGHT: usize = 7;
/// Glyph plus one column of spacing
const GLYPH_ADVANCE: usize = GLYPH_WIDTH + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WatermarkKind {
    /// PNG file at `content`
    Image,
    Text,
    /// Current local time, redrawn every frame
    #[default]
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatermarkEntry {
    pub kind: WatermarkKind,
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
    pub content: String,
}

/// A watermark ready to be drawn on every frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    /// RGBA already scaled to the rectangle
    Image { x: i32, y: i32, width: u32, height: u32, rgba: Vec<u8> },
    Text { x: i32, y: i32, width: u32, height: u32, mask: Vec<u8> },
    Timestamp { x: i32, y: i32, width: u32, height: u32 },
}

impl Overlay {
    pub fn draw(&self, canvas: &mut Canvas, now: DateTime<Local>) {
        match self {
            Self::Image { x, y, width, height, rgba } => canvas.blend_rgba(*x, *y, *width, *height, rgba),
            Self::Text { x, y, width, height, mask } => {
                canvas.paint_mask(*x, *y, *width, *height, mask, TEXT_COLOR);
            }
            Self::Timestamp { x, y, width, height } => {
                let text = now.format(TIMESTAMP_FORMAT).to_string();
                let mask = render_text(&text, *width, *height);
                canvas.paint_mask(*x, *y, *width, *height, &mask, TEXT_COLOR);
            }
        }
    }
}

/// Validate a full watermark set and load its images
pub fn prepare(entries: &[WatermarkEntry], canvas_width: u32, canvas_height: u32) -> EngineResult<Vec<Overlay>> {
    entries
        .iter()
        .map(|entry| {
            check_rect(entry, canvas_width, canvas_height)?;
            let (x, y, width, height) = (entry.offset_x, entry.offset_y, entry.width, entry.height);
            Ok(match entry.kind {
                WatermarkKind::Image => {
                    let (image_width, image_height, rgba) = load_png(Path::new(&entry.content))?;
                    Overlay::Image {
                        x,
                        y,
                        width,
                        height,
                        rgba: scale_rgba(&rgba, image_width, image_height, width, height),
                    }
                }
                WatermarkKind::Text => {
                    if entry.content.is_empty() {
                        return Err(EngineError::invalid_parameter("text watermark has no content"));
                    }
                    Overlay::Text {
                        x,
                        y,
                        width,
                        height,
                        mask: render_text(&entry.content, width, height),
                    }
                }
                WatermarkKind::Timestamp => Overlay::Timestamp { x, y, width, height },
            })
        })
        .collect()
}

fn check_rect(entry: &WatermarkEntry, canvas_width: u32, canvas_height: u32) -> EngineResult<()> {
    if entry.width == 0 || entry.height == 0 {
        return Err(EngineError::invalid_parameter("watermark has no area"));
    }
    if entry.offset_x < 0 || entry.offset_y < 0 {
        return Err(EngineError::invalid_parameter("watermark offset is negative"));
    }
    let right = i64::from(entry.offset_x) + i64::from(entry.width);
    let bottom = i64::from(entry.offset_y) + i64::from(entry.height);
    if right > i64::from(canvas_width) || bottom > i64::from(canvas_height) {
        return Err(EngineError::invalid_parameter(format!(
            "watermark leaves the {canvas_width}x{canvas_height} canvas"
        )));
    }
    Ok(())
}

/// Decode a PNG into 8-bit RGBA
pub fn load_png(path: &Path) -> EngineResult<(u32, u32, Vec<u8>)> {
    let file = std::fs::File::open(path)
        .map_err(|e| EngineError::invalid_parameter(format!("cannot open {}: {e}", path.display())))?;
    let mut decoder = png::Decoder::new(file);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|e| EngineError::invalid_parameter(format!("PNG decode error: {e}")))?;

    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| EngineError::invalid_parameter(format!("PNG frame error: {e}")))?;
    let pixels = &buf[..info.buffer_size()];

    let rgba = match info.color_type {
        png::ColorType::Rgba => pixels.to_vec(),
        png::ColorType::Rgb => pixels
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        png::ColorType::GrayscaleAlpha => pixels
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0], p[1]])
            .collect(),
        png::ColorType::Grayscale => pixels.iter().flat_map(|&g| [g, g, g, 255]).collect(),
        other => {
            return Err(EngineError::invalid_parameter(format!(
                "unsupported PNG color type {other:?}"
            )))
        }
    };
    Ok((info.width, info.height, rgba))
}

fn scale_rgba(rgba: &[u8], src_width: u32, src_height: u32, width: u32, height: u32) -> Vec<u8> {
    let (sw, sh) = (src_width.max(1) as usize, src_height.max(1) as usize);
    let (w, h) = (width as usize, height as usize);
    let mut out = Vec::with_capacity(w * h * 4);
    for row in 0..h {
        let sy = row * sh / h;
        for col in 0..w {
            let sx = col * sw / w;
            let at = (sy * sw + sx) * 4;
            out.extend_from_slice(rgba.get(at..at + 4).unwrap_or(&[0, 0, 0, 0]));
        }
    }
    out
}

/// Render text with the built-in 5x7 font, stretched to `width` x `height`
///
/// Returns one byte per pixel, 1 where ink is.
#[must_use]
pub fn render_text(text: &str, width: u32, height: u32) -> Vec<u8> {
    let glyphs: Vec<[u8; GLYPH_HEIGHT]> = text.chars().map(glyph).collect();
    let (w, h) = (width as usize, height as usize);
    let mut mask = vec![0u8; w * h];
    if glyphs.is_empty() || w == 0 || h == 0 {
        return mask;
    }
    let text_width = glyphs.len() * GLYPH_ADVANCE - 1;
    for row in 0..h {
        let gy = row * GLYPH_HEIGHT / h;
        for col in 0..w {
            let tx = col * text_width / w;
            let (index, gx) = (tx / GLYPH_ADVANCE, tx % GLYPH_ADVANCE);
            if gx >= GLYPH_WIDTH {
                continue;
            }
            let bits = glyphs[index][gy];
            if bits & (0x10 >> gx) != 0 {
                mask[row * w + col] = 1;
            }
        }
    }
    mask
}

fn glyph(c: char) -> [u8; GLYPH_HEIGHT] {
    match c.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        _ => [0; GLYPH_HEIGHT],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufWriter;

    fn write_png(path: &Path, width: u32, height: u32, rgba: &[u8]) {
        let file = std::fs::File::create(path).unwrap();
        let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(rgba).unwrap();
    }

    #[test]
    fn test_render_text_at_native_size() {
        // "1" over 5 columns, 7 rows: the stem is column 2
        let mask = render_text("1", 5, 7);
        assert_eq!(mask[2], 1);
        assert_eq!(mask[0], 0);
        assert_eq!(mask[6 * 5..].iter().filter(|&&m| m == 1).count(), 3);
    }

    #[test]
    fn test_unknown_characters_render_blank() {
        assert!(render_text("@@", 11, 7).iter().all(|&m| m == 0));
    }

    #[test]
    fn test_prepare_rejects_bad_rectangles() {
        let entry = WatermarkEntry {
            kind: WatermarkKind::Timestamp,
            offset_x: 60,
            offset_y: 0,
            width: 10,
            height: 10,
            content: String::new(),
        };
        assert!(matches!(prepare(&[entry.clone()], 64, 64), Err(EngineError::InvalidParameter(_))));
        let inside = WatermarkEntry { offset_x: 0, ..entry };
        assert_eq!(prepare(&[inside], 64, 64).unwrap().len(), 1);
    }

    #[test]
    fn test_prepare_rejects_missing_image() {
        let entry = WatermarkEntry {
            kind: WatermarkKind::Image,
            width: 8,
            height: 8,
            content: "/nonexistent/logo.png".to_string(),
            ..WatermarkEntry::default()
        };
        assert!(prepare(&[entry], 64, 64).is_err());
    }

    #[test]
    fn test_image_watermark_is_scaled_and_blended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        write_png(&path, 2, 2, &[255u8, 255, 255, 255].repeat(4));

        let entry = WatermarkEntry {
            kind: WatermarkKind::Image,
            offset_x: 4,
            offset_y: 4,
            width: 8,
            height: 8,
            content: path.to_string_lossy().into_owned(),
        };
        let overlays = prepare(&[entry], 16, 16).unwrap();
        let Overlay::Image { rgba, .. } = &overlays[0] else {
            panic!("expected an image overlay");
        };
        assert_eq!(rgba.len(), 8 * 8 * 4);

        let mut canvas = Canvas::new(16, 16, 0);
        overlays[0].draw(&mut canvas, Local::now());
        let frame = canvas.into_frame(0);
        assert_eq!(frame.data[4 * 16 + 4], 235);
        assert_eq!(frame.data[0], 16);
    }
}
