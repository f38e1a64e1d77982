use crate::services::compositor::frame::Overlay;
use anyhow::{anyhow, Context, Result};
use fontdue::{Font, FontSettings, Metrics};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

/// Bold sans-serif fonts tried, in order, when no font is configured.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/noto/NotoSans-Bold.ttf",
    "/usr/share/fonts/noto/NotoSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "/Library/Fonts/Arial Unicode.ttf",
    "C:\\Windows\\Fonts\\arialbd.ttf",
];

/// Greedy word wrap: a word moves to the next line once the current line plus
/// that word would exceed `max_width`.
pub fn wrap_words(text: &str, max_width: f32, measure: impl Fn(&str) -> f32) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();

    for word in text.split_whitespace() {
        if line.is_empty() {
            line.push_str(word);
            continue;
        }
        let candidate = format!("{} {}", line, word);
        if measure(&candidate) > max_width {
            lines.push(std::mem::take(&mut line));
            line.push_str(word);
        } else {
            line = candidate;
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

/// Subtitle geometry for one canvas, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtitleLayout {
    pub band_height: u32,
    pub font_size: f32,
    pub line_pitch: f32,
    /// Baseline shift per wrapped line, so the block stays centred in the band.
    pub line_lift: f32,
    pub max_text_width: f32,
}

impl SubtitleLayout {
    /// Reference values are given for a 720x1280 (vertical) or 1280x720
    /// canvas and scaled with the canvas height.
    pub fn for_canvas(width: u32, height: u32, vertical: bool) -> Self {
        let (reference_height, band, font, pitch) = if vertical {
            (1280.0, 350.0, 42.0, 60.0)
        } else {
            (720.0, 200.0, 36.0, 50.0)
        };
        let scale = height as f32 / reference_height;
        Self {
            band_height: (band * scale).round() as u32,
            font_size: font * scale,
            line_pitch: pitch * scale,
            line_lift: 20.0 * scale,
            max_text_width: width as f32 * 0.9,
        }
    }

    /// Baseline y of the first line when `lines` lines are shown.
    pub fn first_baseline(&self, canvas_height: u32, lines: usize) -> f32 {
        canvas_height as f32 - self.band_height as f32 / 2.0 - lines as f32 * self.line_lift
    }
}

struct Glyph {
    metrics: Metrics,
    bitmap: Vec<u8>,
}

/// Rasterises subtitle text with a single TrueType/OpenType font.
pub struct SubtitlePainter {
    font: Font,
    glyph_cache: HashMap<(char, u32), Glyph>,
}

impl SubtitlePainter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = Font::from_bytes(bytes, FontSettings::default())
            .map_err(|e| anyhow!("failed to parse font {}: {}", path.display(), e))?;
        Ok(Self {
            font,
            glyph_cache: HashMap::new(),
        })
    }

    /// Loads the configured font, or the first system font that exists.
    /// Returns `None` (band only, no text) when nothing usable is found.
    pub fn discover(configured: Option<&str>) -> Option<Self> {
        if let Some(path) = configured {
            match Self::from_file(Path::new(path)) {
                Ok(painter) => return Some(painter),
                Err(e) => warn!("{:#}", e),
            }
        }
        for candidate in FONT_CANDIDATES {
            let path = Path::new(candidate);
            if !path.exists() {
                continue;
            }
            if let Ok(painter) = Self::from_file(path) {
                info!("Subtitle font: {}", candidate);
                return Some(painter);
            }
        }
        warn!("No subtitle font found; set export.font_path in config.yml. Subtitles will be omitted.");
        None
    }

    pub fn measure(&self, text: &str, px: f32) -> f32 {
        text.chars()
            .map(|c| self.font.metrics(c, px).advance_width)
            .sum()
    }

    fn glyph(&mut self, c: char, px: f32) -> &Glyph {
        let font = &self.font;
        self.glyph_cache.entry((c, px.to_bits())).or_insert_with(|| {
            let (metrics, bitmap) = font.rasterize(c, px);
            Glyph { metrics, bitmap }
        })
    }

    /// Draws `text` centred on `center_x` with its baseline at `baseline`.
    pub fn draw_centered(
        &mut self,
        overlay: &mut Overlay,
        text: &str,
        px: f32,
        center_x: f32,
        baseline: f32,
        color: [u8; 3],
    ) {
        let mut pen = center_x - self.measure(text, px) / 2.0;
        for c in text.chars() {
            let glyph = self.glyph(c, px);
            let left = (pen + glyph.metrics.xmin as f32).round() as i32;
            let top = (baseline - (glyph.metrics.height as i32 + glyph.metrics.ymin) as f32).round() as i32;
            let advance = glyph.metrics.advance_width;
            let (w, h) = (glyph.metrics.width, glyph.metrics.height);

            for row in 0..h {
                for col in 0..w {
                    let coverage = glyph.bitmap[row * w + col];
                    if coverage != 0 {
                        overlay.paint(
                            left + col as i32,
                            top + row as i32,
                            [color[0], color[1], color[2], coverage],
                        );
                    }
                }
            }
            pen += advance;
        }
    }
}

/// Builds the static subtitle layer for a scene: the translucent band plus,
/// when a font is available, the wrapped white text.
pub fn build_overlay(
    painter: Option<&mut SubtitlePainter>,
    width: u32,
    height: u32,
    vertical: bool,
    text: &str,
) -> Option<Overlay> {
    if text.trim().is_empty() {
        return None;
    }
    let layout = SubtitleLayout::for_canvas(width, height, vertical);
    let mut overlay = Overlay::transparent(width, height);
    overlay.fill_rows(
        height.saturating_sub(layout.band_height),
        layout.band_height,
        [0, 0, 0, 204],
    );

    if let Some(painter) = painter {
        let lines = wrap_words(text, layout.max_text_width, |s| {
            painter.measure(s, layout.font_size)
        });
        let first = layout.first_baseline(height, lines.len());
        for (i, line) in lines.iter().enumerate() {
            painter.draw_centered(
                &mut overlay,
                line,
                layout.font_size,
                width as f32 / 2.0,
                first + i as f32 * layout.line_pitch,
                [255, 255, 255],
            );
        }
    }
    Some(overlay)
}
