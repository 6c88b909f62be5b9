//! Drawing primitives for annotated frames, working directly on packed BGR.

use ml_core::{BoundingBox, Detection};

use crate::inspection::head_shape::HeadMeasurement;

/// BGR colours picked by class id.
const PALETTE: [[u8; 3]; 8] = [
    [255, 255, 255],
    [0, 255, 255],
    [0, 255, 0],
    [255, 255, 0],
    [255, 0, 255],
    [255, 128, 0],
    [128, 255, 255],
    [255, 204, 229],
];
const BLACK: [u8; 3] = [0, 0, 0];
const WHITE: [u8; 3] = [255, 255, 255];

const GLYPH_SCALE: i32 = 2;
const GLYPH_ADVANCE: i32 = 6 * GLYPH_SCALE;
const GLYPH_HEIGHT: i32 = 7 * GLYPH_SCALE;
const BOX_THICKNESS: i32 = 2;

pub fn class_color(class_id: i64) -> [u8; 3] {
    PALETTE[class_id.rem_euclid(PALETTE.len() as i64) as usize]
}

/// Mutable view of a BGR frame.
pub struct Canvas<'a> {
    data: &'a mut [u8],
    width: i32,
    height: i32,
}

impl<'a> Canvas<'a> {
    pub fn new(data: &'a mut [u8], width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            data,
            width: width as i32,
            height: height as i32,
        }
    }

    fn put(&mut self, x: i32, y: i32, color: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        self.data[idx..idx + 3].copy_from_slice(&color);
    }

    pub fn fill_rect(&mut self, left: i32, top: i32, right: i32, bottom: i32, color: [u8; 3]) {
        let left = left.max(0);
        let top = top.max(0);
        let right = right.min(self.width - 1);
        let bottom = bottom.min(self.height - 1);
        for y in top..=bottom {
            for x in left..=right {
                self.put(x, y, color);
            }
        }
    }

    pub fn draw_rectangle(&mut self, bbox: &BoundingBox, color: [u8; 3]) {
        let [(left, top), (right, bottom)] = bbox.corners_px();
        let (x_from, x_to) = (left.max(0), right.min(self.width - 1));
        let (y_from, y_to) = (top.max(0), bottom.min(self.height - 1));
        for t in 0..BOX_THICKNESS {
            for x in x_from..=x_to {
                self.put(x, top.saturating_add(t), color);
                self.put(x, bottom.saturating_sub(t), color);
            }
            for y in y_from..=y_to {
                self.put(left.saturating_add(t), y, color);
                self.put(right.saturating_sub(t), y, color);
            }
        }
    }

    pub fn draw_text(&mut self, x: i32, y: i32, text: &str, color: [u8; 3]) {
        let mut cursor = x;
        for ch in text.chars().flat_map(|c| c.to_uppercase()) {
            if let Some(glyph) = glyph_bits(ch) {
                for (row, pattern) in glyph.iter().enumerate() {
                    for col in 0..5 {
                        if (pattern >> (4 - col)) & 1 == 1 {
                            let px = cursor.saturating_add(col * GLYPH_SCALE);
                            let py = y.saturating_add(row as i32 * GLYPH_SCALE);
                            self.fill_rect(
                                px,
                                py,
                                px.saturating_add(GLYPH_SCALE - 1),
                                py.saturating_add(GLYPH_SCALE - 1),
                                color,
                            );
                        }
                    }
                }
            }
            cursor = cursor.saturating_add(GLYPH_ADVANCE);
        }
    }

    /// Text on a filled background, placed above `(x, y)` when there is room.
    /// Coordinates may come from saturated box corners.
    pub fn draw_label(&mut self, x: i32, y: i32, text: &str, background: [u8; 3], fg: [u8; 3]) {
        let chars = i32::try_from(text.chars().count()).unwrap_or(i32::MAX);
        let text_width = chars.saturating_mul(GLYPH_ADVANCE);
        let above = y.saturating_sub(GLYPH_HEIGHT + 6);
        let top = if above >= 0 { above } else { y };
        self.fill_rect(
            x,
            top,
            x.saturating_add(text_width).saturating_add(2),
            top.saturating_add(GLYPH_HEIGHT + 5),
            background,
        );
        self.draw_text(x.saturating_add(2), top.saturating_add(3), text, fg);
    }
}

/// Boxes plus `label confidence` tags for every surviving detection.
pub fn annotate_detections(canvas: &mut Canvas<'_>, detections: &[Detection]) {
    for det in detections {
        canvas.draw_rectangle(&det.bbox, class_color(det.class_id));
    }
    for det in detections {
        let [(x, y), _] = det.bbox.corners_px();
        let text = format!("{} {:.2}", det.label, det.confidence);
        canvas.draw_label(x, y, &text, class_color(det.class_id), BLACK);
    }
}

/// Reference boxes and a three-line summary for a head-shape evidence frame.
pub fn annotate_head(canvas: &mut Canvas<'_>, measurement: &HeadMeasurement, roller_id: u64) {
    canvas.draw_rectangle(&measurement.inner, class_color(0));
    canvas.draw_rectangle(&measurement.outer, class_color(1));
    let lines = [
        format!("Roller Id : {roller_id}"),
        format!("Head Type : {}", measurement.head),
        format!("Distance : {:.2}", measurement.offset),
    ];
    for (i, line) in lines.iter().enumerate() {
        canvas.draw_text(10, 10 + i as i32 * (GLYPH_HEIGHT + 10), line, WHITE);
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '#' => [0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
