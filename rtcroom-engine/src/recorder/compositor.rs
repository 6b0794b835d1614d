//! I420 canvas compositing
//!
//! Sources are painted in ascending z order onto a canvas cleared to the
//! background color, scaled nearest-neighbor into their rectangles, and
//! watermarks go on last. Output depends only on the inputs, so the same
//! layout and sources always produce the same bytes.

use bytes::Bytes;
use std::collections::HashMap;

use super::layout::{paint_order, FillMode, LayoutEntry};
use crate::frame::PixelFrame;
use crate::types::{StreamType, UserId};

/// BT.601 limited-range conversion of 0xRRGGBB
#[must_use]
pub fn rgb_to_yuv(color: u32) -> (u8, u8, u8) {
    let r = ((color >> 16) & 0xFF) as i32;
    let g = ((color >> 8) & 0xFF) as i32;
    let b = (color & 0xFF) as i32;
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    fn chroma(self) -> Self {
        Self {
            x: self.x / 2,
            y: self.y / 2,
            width: self.width.div_ceil(2),
            height: self.height.div_ceil(2),
        }
    }
}

struct Plane<'a> {
    data: &'a [u8],
    stride: usize,
}

/// An I420 picture being composed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Canvas {
    #[must_use]
    pub fn new(width: u32, height: u32, background: u32) -> Self {
        let (y, u, v) = rgb_to_yuv(background);
        let frame = PixelFrame::filled(width, height, y, u, v, 0);
        Self {
            width,
            height,
            data: frame.data.to_vec(),
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    fn chroma_size(&self) -> (usize, usize) {
        (self.width.div_ceil(2) as usize, self.height.div_ceil(2) as usize)
    }

    fn plane_offsets(&self) -> [(usize, usize); 3] {
        let luma = self.width as usize * self.height as usize;
        let (cw, ch) = self.chroma_size();
        [(0, self.width as usize), (luma, cw), (luma + cw * ch, cw)]
    }

    /// Clip a rectangle to the canvas
    fn clip(&self, x: i64, y: i64, width: u32, height: u32) -> Option<(Rect, u32, u32)> {
        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = (x + i64::from(width)).min(i64::from(self.width));
        let y1 = (y + i64::from(height)).min(i64::from(self.height));
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let rect = Rect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        };
        Some((rect, (x0 - x) as u32, (y0 - y) as u32))
    }

    pub fn fill_rect(&mut self, rect: Rect, color: u32) {
        let (y, u, v) = rgb_to_yuv(color);
        let Some((rect, _, _)) = self.clip(i64::from(rect.x), i64::from(rect.y), rect.width, rect.height) else {
            return;
        };
        let [(luma, stride), (cb, cstride), (cr, _)] = self.plane_offsets();
        fill_plane(&mut self.data, luma, stride, rect, y);
        let chroma = rect.chroma();
        fill_plane(&mut self.data, cb, cstride, chroma, u);
        fill_plane(&mut self.data, cr, cstride, chroma, v);
    }

    /// Scale the `src` region of a picture into `dst` on the canvas
    fn blit(&mut self, picture: &PixelFrame, src: Rect, dst: Rect) {
        if src.width == 0 || src.height == 0 || dst.width == 0 || dst.height == 0 {
            return;
        }
        let sw = picture.width as usize;
        let luma_len = sw * picture.height as usize;
        let (scw, sch) = (picture.width.div_ceil(2) as usize, picture.height.div_ceil(2) as usize);
        let data = picture.data.as_ref();
        let planes = [
            Plane {
                data: &data[..luma_len],
                stride: sw,
            },
            Plane {
                data: &data[luma_len..luma_len + scw * sch],
                stride: scw,
            },
            Plane {
                data: &data[luma_len + scw * sch..],
                stride: scw,
            },
        ];
        let offsets = self.plane_offsets();
        for (index, (plane, (offset, stride))) in planes.iter().zip(offsets).enumerate() {
            let (s, d) = if index == 0 {
                (src, dst)
            } else {
                (src.chroma(), dst.chroma())
            };
            scale_plane(plane, s, &mut self.data, offset, stride, d);
        }
    }

    /// Draw one source into its layout rectangle
    pub fn draw_source(&mut self, picture: &PixelFrame, entry: &LayoutEntry, background: u32) {
        if picture.validate().is_err() {
            return;
        }
        let dst = Rect {
            x: entry.x,
            y: entry.y,
            width: entry.width,
            height: entry.height,
        };
        let (sw, sh) = (u64::from(picture.width), u64::from(picture.height));
        let (dw, dh) = (u64::from(dst.width), u64::from(dst.height));
        match entry.fill_mode {
            FillMode::Fill => {
                let src = if sw * dh > sh * dw {
                    let cw = (sh * dw / dh).max(1);
                    Rect {
                        x: ((sw - cw) / 2) as u32,
                        y: 0,
                        width: cw as u32,
                        height: picture.height,
                    }
                } else {
                    let ch = (sw * dh / dw).max(1);
                    Rect {
                        x: 0,
                        y: ((sh - ch) / 2) as u32,
                        width: picture.width,
                        height: ch as u32,
                    }
                };
                self.blit(picture, src, dst);
            }
            FillMode::Fit => {
                self.fill_rect(dst, entry.color.unwrap_or(background));
                let placed = if sw * dh > sh * dw {
                    let ph = (sh * dw / sw).max(1);
                    Rect {
                        x: dst.x,
                        y: dst.y + ((dh - ph) / 2) as u32,
                        width: dst.width,
                        height: ph as u32,
                    }
                } else {
                    let pw = (sw * dh / sh).max(1);
                    Rect {
                        x: dst.x + ((dw - pw) / 2) as u32,
                        y: dst.y,
                        width: pw as u32,
                        height: dst.height,
                    }
                };
                let full = Rect {
                    x: 0,
                    y: 0,
                    width: picture.width,
                    height: picture.height,
                };
                self.blit(picture, full, placed);
            }
        }
    }

    /// Alpha-blend an RGBA image (`width * height * 4` bytes) at an offset
    pub fn blend_rgba(&mut self, x: i32, y: i32, width: u32, height: u32, rgba: &[u8]) {
        if rgba.len() < width as usize * height as usize * 4 {
            return;
        }
        let Some((rect, skip_x, skip_y)) = self.clip(i64::from(x), i64::from(y), width, height) else {
            return;
        };
        let [(luma, stride), (cb, cstride), (cr, _)] = self.plane_offsets();
        for row in 0..rect.height {
            for col in 0..rect.width {
                let src = (((row + skip_y) * width + col + skip_x) * 4) as usize;
                let alpha = u32::from(rgba[src + 3]);
                if alpha == 0 {
                    continue;
                }
                let color = u32::from(rgba[src]) << 16 | u32::from(rgba[src + 1]) << 8 | u32::from(rgba[src + 2]);
                let (py, pu, pv) = rgb_to_yuv(color);
                let (cx, cy) = ((rect.x + col) as usize, (rect.y + row) as usize);
                blend(&mut self.data[luma + cy * stride + cx], py, alpha);
                // chroma is sampled from the top-left pixel of each 2x2 block
                if cx % 2 == 0 && cy % 2 == 0 {
                    let c = (cy / 2) * cstride + cx / 2;
                    blend(&mut self.data[cb + c], pu, alpha);
                    blend(&mut self.data[cr + c], pv, alpha);
                }
            }
        }
    }

    /// Paint `color` where `mask` (one byte per pixel, non-zero = set) is set
    pub fn paint_mask(&mut self, x: i32, y: i32, width: u32, height: u32, mask: &[u8], color: u32) {
        if mask.len() < width as usize * height as usize {
            return;
        }
        let (r, g, b) = (((color >> 16) & 0xFF) as u8, ((color >> 8) & 0xFF) as u8, (color & 0xFF) as u8);
        let rgba: Vec<u8> = mask
            .iter()
            .flat_map(|&m| [r, g, b, if m == 0 { 0 } else { 255 }])
            .collect();
        self.blend_rgba(x, y, width, height, &rgba);
    }

    #[must_use]
    pub fn into_frame(self, pts: u32) -> PixelFrame {
        PixelFrame::new(Bytes::from(self.data), self.width, self.height, pts)
    }
}

fn blend(dst: &mut u8, src: u8, alpha: u32) {
    let mixed = (u32::from(src) * alpha + u32::from(*dst) * (255 - alpha) + 127) / 255;
    *dst = mixed.min(255) as u8;
}

fn fill_plane(data: &mut [u8], offset: usize, stride: usize, rect: Rect, value: u8) {
    for row in rect.y as usize..(rect.y + rect.height) as usize {
        let start = offset + row * stride + rect.x as usize;
        let end = (start + rect.width as usize).min(offset + (row + 1) * stride);
        if let Some(line) = data.get_mut(start..end) {
            line.fill(value);
        }
    }
}

fn scale_plane(src: &Plane<'_>, s: Rect, dst: &mut [u8], offset: usize, stride: usize, d: Rect) {
    if s.width == 0 || s.height == 0 {
        return;
    }
    let src_rows = src.data.len() / src.stride.max(1);
    for row in 0..d.height as usize {
        let sy = s.y as usize + row * s.height as usize / d.height as usize;
        if sy >= src_rows {
            break;
        }
        let dst_start = offset + (d.y as usize + row) * stride + d.x as usize;
        for col in 0..(d.width as usize).min(stride.saturating_sub(d.x as usize)) {
            let sx = (s.x as usize + col * s.width as usize / d.width as usize).min(src.stride - 1);
            if let (Some(out), Some(value)) = (dst.get_mut(dst_start + col), src.data.get(sy * src.stride + sx)) {
                *out = *value;
            }
        }
    }
}

/// Paints layouts onto a fixed-size canvas
#[derive(Debug, Clone, Copy)]
pub struct Compositor {
    pub width: u32,
    pub height: u32,
    pub background: u32,
}

impl Compositor {
    /// Compose one canvas from the latest picture of each source
    #[must_use]
    pub fn compose(&self, layout: &[LayoutEntry], sources: &HashMap<(UserId, StreamType), PixelFrame>) -> Canvas {
        let mut canvas = Canvas::new(self.width, self.height, self.background);
        for entry in paint_order(layout) {
            if let Some(picture) = sources.get(&(entry.user_id.clone(), entry.stream_type)) {
                canvas.draw_source(picture, &entry, self.background);
            }
        }
        canvas
    }
}
