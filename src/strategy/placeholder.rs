use super::{FailureHint, Strategy, StrategyKind};
use crate::models::{ImageReference, ReasonCode, StrategyResult};
use async_trait::async_trait;
use image::{ImageResult, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use std::hash::{DefaultHasher, Hash, Hasher};
use tracing::{debug, error};

const WIDTH: u32 = 800;
const HEIGHT: u32 = 600;
const BAND_HEIGHT: u32 = 72;
const BORDER: u32 = 6;
const MARGIN: u32 = 40;
const SCALE: u32 = 4;
const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const ADVANCE: u32 = (GLYPH_W + 1) * SCALE;
const LINE_HEIGHT: u32 = (GLYPH_H + 3) * SCALE;

const BACKGROUND: Rgb<u8> = Rgb([245, 245, 245]);
const FRAME: Rgb<u8> = Rgb([200, 200, 200]);
const INK: Rgb<u8> = Rgb([70, 70, 70]);
const MUTED: Rgb<u8> = Rgb([140, 140, 140]);

/// Terminal strategy: draws a labelled stand-in image from the reference
/// alone. Needs no network or disk, so it cannot fail for a valid reference.
pub struct PlaceholderSynthesis {
    quality: u8,
}

impl PlaceholderSynthesis {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

#[async_trait]
impl Strategy for PlaceholderSynthesis {
    fn name(&self) -> &str {
        StrategyKind::Placeholder.as_str()
    }

    fn is_placeholder(&self) -> bool {
        true
    }

    async fn attempt(&self, reference: &ImageReference, hint: &FailureHint) -> StrategyResult {
        let name = self.name();
        debug!(
            target = "valuer.strategy",
            lot_ref = %reference.logical_id,
            after = hint.previous.as_ref().map(|p| p.strategy.as_str()).unwrap_or("none"),
            "placeholder_synthesis"
        );
        let owned = reference.clone();
        let quality = self.quality;
        match tokio::task::spawn_blocking(move || render_placeholder(&owned, quality)).await {
            Ok(Ok(bytes)) => StrategyResult::success(name, bytes, "image/jpeg"),
            Ok(Err(err)) => {
                error!(
                    target = "valuer.strategy",
                    lot_ref = %reference.logical_id,
                    error = %err,
                    "placeholder_encode_failed"
                );
                StrategyResult::failure(name, ReasonCode::Synthesis)
            }
            Err(err) => {
                error!(
                    target = "valuer.strategy",
                    lot_ref = %reference.logical_id,
                    error = %err,
                    "placeholder_task_failed"
                );
                StrategyResult::failure(name, ReasonCode::Synthesis)
            }
        }
    }
}

/// Renders the placeholder JPEG for `reference`. Output depends only on the
/// reference and `quality`.
pub fn render_placeholder(reference: &ImageReference, quality: u8) -> ImageResult<Vec<u8>> {
    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);
    draw_frame(&mut img);
    fill_rect(
        &mut img,
        BORDER,
        BORDER,
        WIDTH - 2 * BORDER,
        BAND_HEIGHT,
        accent_color(&reference.logical_id),
    );

    let mut lines: Vec<(String, Rgb<u8>)> = vec![
        (format!("LOT {}", reference.logical_id), INK),
        (reference.house_name.clone(), INK),
    ];
    if let Some(title) = reference.title.as_deref().filter(|t| !t.trim().is_empty()) {
        lines.push((title.to_string(), MUTED));
    }
    lines.push((String::new(), INK));
    lines.push(("IMAGE UNAVAILABLE".to_string(), MUTED));

    let max_chars = ((WIDTH - 2 * MARGIN) / ADVANCE) as usize;
    let block_height = LINE_HEIGHT * lines.len() as u32;
    let mut y = BAND_HEIGHT + (HEIGHT - BAND_HEIGHT).saturating_sub(block_height) / 2;
    for (text, color) in &lines {
        let text = fit(text, max_chars);
        let width = ADVANCE * text.chars().count() as u32;
        let x = (WIDTH.saturating_sub(width)) / 2;
        draw_text(&mut img, &text, x, y, color);
        y += LINE_HEIGHT;
    }

    let mut out = Vec::with_capacity(32 * 1024);
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&img)?;
    Ok(out)
}

fn accent_color(logical_id: &str) -> Rgb<u8> {
    let mut hasher = DefaultHasher::new();
    logical_id.hash(&mut hasher);
    let h = hasher.finish();
    // keep the band mid-toned so it never washes out
    let channel = |shift: u32| 64 + ((h >> shift) & 0x7F) as u8;
    Rgb([channel(0), channel(8), channel(16)])
}

fn fit(text: &str, max_chars: usize) -> String {
    let text = text.trim().to_uppercase();
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut clipped: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    clipped.push_str("...");
    clipped
}

fn draw_frame(img: &mut RgbImage) {
    fill_rect(img, 0, 0, WIDTH, BORDER, FRAME);
    fill_rect(img, 0, HEIGHT - BORDER, WIDTH, BORDER, FRAME);
    fill_rect(img, 0, 0, BORDER, HEIGHT, FRAME);
    fill_rect(img, WIDTH - BORDER, 0, BORDER, HEIGHT, FRAME);
}

fn fill_rect(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let x_end = (x + w).min(img.width());
    let y_end = (y + h).min(img.height());
    for py in y..y_end {
        for px in x..x_end {
            img.put_pixel(px, py, color);
        }
    }
}

fn draw_text(img: &mut RgbImage, text: &str, x: u32, y: u32, color: &Rgb<u8>) {
    for (i, ch) in text.chars().enumerate() {
        let origin_x = x + i as u32 * ADVANCE;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (0x10 >> col) != 0 {
                    fill_rect(
                        img,
                        origin_x + col * SCALE,
                        y + row as u32 * SCALE,
                        SCALE,
                        SCALE,
                        *color,
                    );
                }
            }
        }
    }
}

/// 5x7 bitmap glyphs, one byte per row, high bit on the left.
fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        ' ' => [0; 7],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
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
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '&' => [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D],
        '\'' => [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}
