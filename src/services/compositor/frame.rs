use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};

/// Stretches the scene image over the whole canvas.
pub fn fit_to_canvas(img: &DynamicImage, width: u32, height: u32) -> RgbaImage {
    img.resize_exact(width, height, FilterType::Triangle).to_rgba8()
}

/// Zoom for frame `index` of a scene spanning `frames` frames.
pub fn zoom_at(index: u64, frames: u64, max_zoom: f32) -> f32 {
    if frames <= 1 {
        return 1.0;
    }
    1.0 + max_zoom * (index as f32 / (frames - 1) as f32)
}

/// Centred zoom of `src` into `dst` (same size), sampled bilinearly.
pub fn ken_burns(src: &RgbaImage, zoom: f32, dst: &mut [u8]) {
    let (width, height) = src.dimensions();
    let raw = src.as_raw();
    let cx = width as f32 * 0.5;
    let cy = height as f32 * 0.5;
    let inv = 1.0 / zoom.max(0.01);
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;

    for y in 0..height {
        let sy = ((y as f32 + 0.5 - cy) * inv + cy - 0.5).clamp(0.0, max_y);
        let y0 = sy.floor() as u32;
        let y1 = (y0 + 1).min(height - 1);
        let fy = sy - y0 as f32;

        for x in 0..width {
            let sx = ((x as f32 + 0.5 - cx) * inv + cx - 0.5).clamp(0.0, max_x);
            let x0 = sx.floor() as u32;
            let x1 = (x0 + 1).min(width - 1);
            let fx = sx - x0 as f32;

            let p00 = ((y0 * width + x0) * 4) as usize;
            let p10 = ((y0 * width + x1) * 4) as usize;
            let p01 = ((y1 * width + x0) * 4) as usize;
            let p11 = ((y1 * width + x1) * 4) as usize;
            let out = ((y * width + x) * 4) as usize;

            for c in 0..3 {
                let top = raw[p00 + c] as f32 * (1.0 - fx) + raw[p10 + c] as f32 * fx;
                let bottom = raw[p01 + c] as f32 * (1.0 - fx) + raw[p11 + c] as f32 * fx;
                dst[out + c] = (top * (1.0 - fy) + bottom * fy).round() as u8;
            }
            dst[out + 3] = 255;
        }
    }
}

/// Source-over blend of one straight-alpha pixel onto an opaque frame.
pub fn blend_pixel(frame: &mut [u8], idx: usize, src: [u8; 4]) {
    let alpha = u16::from(src[3]);
    if alpha == 0 {
        return;
    }
    let inv_alpha = 255 - alpha;
    for channel in 0..3 {
        let dst = u16::from(frame[idx + channel]);
        let src_c = u16::from(src[channel]);
        frame[idx + channel] = ((src_c * alpha + dst * inv_alpha + 127) / 255) as u8;
    }
    frame[idx + 3] = 255;
}

/// Straight-alpha RGBA layer drawn on top of every frame of a scene.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Overlay {
    pub fn transparent(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize * 4],
        }
    }

    /// Source-over composition of `color` onto the layer itself.
    pub fn paint(&mut self, x: i32, y: i32, color: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let idx = ((y as u32 * self.width + x as u32) * 4) as usize;
        let dst = &mut self.pixels[idx..idx + 4];
        let sa = color[3] as f32 / 255.0;
        let da = dst[3] as f32 / 255.0;
        let out_a = sa + da * (1.0 - sa);
        if out_a <= 0.0 {
            return;
        }
        for c in 0..3 {
            let v = (color[c] as f32 * sa + dst[c] as f32 * da * (1.0 - sa)) / out_a;
            dst[c] = v.round() as u8;
        }
        dst[3] = (out_a * 255.0).round() as u8;
    }

    pub fn fill_rows(&mut self, top: u32, rows: u32, color: [u8; 4]) {
        let bottom = top.saturating_add(rows).min(self.height);
        for y in top.min(self.height)..bottom {
            for x in 0..self.width {
                self.paint(x as i32, y as i32, color);
            }
        }
    }

    pub fn composite_onto(&self, frame: &mut [u8]) {
        for (idx, px) in self.pixels.chunks_exact(4).enumerate() {
            if px[3] != 0 {
                blend_pixel(frame, idx * 4, [px[0], px[1], px[2], px[3]]);
            }
        }
    }
}
