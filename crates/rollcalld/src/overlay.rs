//! Frame annotation: detection throttling, face boxes with labels, the status
//! panel and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, Rgb, RgbImage};
use rollcall_core::{BoundingBox, MatchResult, ThresholdPolicy};

const COLOR_COMMITTED: Rgb<u8> = Rgb([0, 200, 0]);
const COLOR_TENTATIVE: Rgb<u8> = Rgb([255, 176, 0]);
const COLOR_UNKNOWN: Rgb<u8> = Rgb([220, 0, 0]);
const COLOR_TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const COLOR_PANEL: Rgb<u8> = Rgb([24, 24, 24]);

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const TEXT_SCALE: i32 = 2;
const BOX_THICKNESS: i32 = 2;

/// Decides which frames run detection: the first, then every `every`th.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    every: u32,
    counter: u64,
}

impl FrameThrottle {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            counter: 0,
        }
    }

    /// Advance one frame; `true` if this frame should be processed.
    pub fn tick(&mut self) -> bool {
        let process = self.counter % u64::from(self.every) == 0;
        self.counter += 1;
        process
    }

    /// Frames seen so far.
    pub fn frames(&self) -> u64 {
        self.counter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Within the commit threshold; attendance recorded.
    Committed,
    /// Within the draw threshold only.
    Tentative,
    Unknown,
}

impl MatchState {
    fn color(self) -> Rgb<u8> {
        match self {
            Self::Committed => COLOR_COMMITTED,
            Self::Tentative => COLOR_TENTATIVE,
            Self::Unknown => COLOR_UNKNOWN,
        }
    }
}

/// One face to draw: full-resolution box, label and match state.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
    pub state: MatchState,
}

impl Annotation {
    pub fn from_match(bbox: BoundingBox, result: &MatchResult, policy: &ThresholdPolicy) -> Self {
        match result {
            MatchResult::Unmatched => Self {
                bbox,
                label: "Unknown".to_string(),
                state: MatchState::Unknown,
            },
            MatchResult::Matched { name, distance, .. } => Self {
                bbox,
                label: format!("{name} ({:.2})", result.confidence().unwrap_or(0.0)),
                state: if policy.is_committable(*distance) {
                    MatchState::Committed
                } else {
                    MatchState::Tentative
                },
            },
        }
    }
}

/// Counters shown in the top-left corner of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusPanel {
    pub enrolled: usize,
    pub present: usize,
    pub frame: u64,
}

pub fn draw_annotations(image: &mut RgbImage, annotations: &[Annotation]) {
    for a in annotations {
        let color = a.state.color();
        let left = a.bbox.x.round() as i32;
        let top = a.bbox.y.round() as i32;
        let right = a.bbox.right().round() as i32;
        let bottom = a.bbox.bottom().round() as i32;

        for inset in 0..BOX_THICKNESS {
            draw_rectangle(image, left + inset, top + inset, right - inset, bottom - inset, color);
        }

        // Label bar sits under the box, or inside it at the frame's bottom edge.
        let bar_h = GLYPH_H * TEXT_SCALE + 4;
        let bar_top = if bottom + bar_h < image.height() as i32 {
            bottom
        } else {
            bottom - bar_h
        };
        let bar_right = right.max(left + text_width(&a.label) + 4);
        fill_rect(image, left, bar_top, bar_right, bar_top + bar_h, color);
        draw_text(image, left + 3, bar_top + 2, &a.label, COLOR_TEXT);
    }
}

pub fn draw_status_panel(image: &mut RgbImage, panel: &StatusPanel) {
    let lines = [
        format!("ENROLLED: {}", panel.enrolled),
        format!("PRESENT: {}", panel.present),
        format!("FRAME: {}", panel.frame),
    ];
    let line_h = GLYPH_H * TEXT_SCALE + 4;
    let width = lines.iter().map(|l| text_width(l)).max().unwrap_or(0) + 12;
    fill_rect(image, 0, 0, width, line_h * lines.len() as i32 + 8, COLOR_PANEL);
    for (i, line) in lines.iter().enumerate() {
        draw_text(image, 6, 6 + i as i32 * line_h, line, COLOR_TEXT);
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if right < left || bottom < top {
        return;
    }
    for x in left..=right {
        put(image, x, top, color);
        put(image, x, bottom, color);
    }
    for y in top..=bottom {
        put(image, left, y, color);
        put(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    for y in top.max(0)..bottom.min(h) {
        for x in left.max(0)..right.min(w) {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * (GLYPH_W + 1) * TEXT_SCALE
}

fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let advance = (GLYPH_W + 1) * TEXT_SCALE;
    for (i, ch) in text.chars().flat_map(char::to_uppercase).enumerate() {
        let Some(rows) = glyph(ch) else { continue };
        let origin_x = x + i as i32 * advance;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if (bits >> (GLYPH_W - 1 - col)) & 1 == 0 {
                    continue;
                }
                for dy in 0..TEXT_SCALE {
                    for dx in 0..TEXT_SCALE {
                        put(
                            image,
                            origin_x + col * TEXT_SCALE + dx,
                            y + row as i32 * TEXT_SCALE + dy,
                            color,
                        );
                    }
                }
            }
        }
    }
}

/// 5×7 bitmap rows, most significant of the low five bits leftmost.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
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
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '\'' => [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        _ => return None,
    };
    Some(rows)
}
