use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use super::glyphs::{glyph_bits, GLYPH_ADVANCE, GLYPH_WIDTH};
use super::DrawOp;

/// Paint a draw plan onto `canvas`, in order.
pub(crate) fn rasterize(canvas: &mut RgbaImage, ops: &[DrawOp]) {
    for op in ops {
        match op {
            DrawOp::StrokeRect {
                x,
                y,
                width,
                height,
                color,
                thickness,
            } => stroke_rect(canvas, *x, *y, *width, *height, *color, *thickness),
            DrawOp::FillRect {
                x,
                y,
                width,
                height,
                color,
            } => {
                if let Some(rect) = to_rect(*x, *y, *width, *height) {
                    draw_filled_rect_mut(canvas, rect, *color);
                }
            }
            DrawOp::Text {
                x,
                y,
                text,
                color,
                scale,
            } => draw_text(canvas, *x as i32, *y as i32, text, *color, *scale),
            DrawOp::DashedLine {
                y,
                color,
                dash,
                gap,
                thickness,
            } => dashed_line(canvas, *y, *color, *dash, *gap, *thickness),
        }
    }
}

/// imageproc panics on zero-sized rects; degenerate boxes draw nothing.
fn to_rect(x: f32, y: f32, width: f32, height: f32) -> Option<Rect> {
    if !(x.is_finite() && y.is_finite()) {
        return None;
    }
    let w = width.round();
    let h = height.round();
    if !(w >= 1.0 && h >= 1.0) {
        return None;
    }
    Some(Rect::at(x.round() as i32, y.round() as i32).of_size(w as u32, h as u32))
}

fn stroke_rect(
    canvas: &mut RgbaImage,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    color: Rgba<u8>,
    thickness: u32,
) {
    for inset in 0..thickness.max(1) {
        let inset = inset as f32;
        match to_rect(x + inset, y + inset, width - 2.0 * inset, height - 2.0 * inset) {
            Some(rect) => draw_hollow_rect_mut(canvas, rect, color),
            None => break,
        }
    }
}

fn dashed_line(canvas: &mut RgbaImage, y: f32, color: Rgba<u8>, dash: u32, gap: u32, thickness: u32) {
    let width = canvas.width() as f32;
    let step = (dash + gap).max(1) as f32;
    for row in 0..thickness.max(1) {
        let line_y = y + row as f32;
        let mut start = 0.0;
        while start < width {
            let end = (start + dash.max(1) as f32 - 1.0).min(width - 1.0);
            draw_line_segment_mut(canvas, (start, line_y), (end, line_y), color);
            start += step;
        }
    }
}

/// Draw `text` with its top-left corner at (x, y). Pixels off the canvas are
/// clipped.
fn draw_text(canvas: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale = scale.max(1) as i32;
    let (canvas_w, canvas_h) = (canvas.width() as i32, canvas.height() as i32);
    let mut cursor = x;
    for ch in text.chars() {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH as i32 {
                    if (pattern >> (GLYPH_WIDTH as i32 - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = cursor + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if px >= 0 && px < canvas_w && py >= 0 && py < canvas_h {
                                canvas.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE as i32 * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    #[test]
    fn stroke_rect_draws_border_only() {
        let mut canvas = RgbaImage::new(20, 20);
        rasterize(
            &mut canvas,
            &[DrawOp::StrokeRect {
                x: 2.0,
                y: 2.0,
                width: 10.0,
                height: 10.0,
                color: RED,
                thickness: 2,
            }],
        );
        assert_eq!(*canvas.get_pixel(2, 2), RED);
        assert_eq!(*canvas.get_pixel(3, 3), RED);
        assert_eq!(canvas.get_pixel(7, 7)[3], 0);
    }

    #[test]
    fn degenerate_and_offscreen_ops_are_ignored() {
        let mut canvas = RgbaImage::new(10, 10);
        rasterize(
            &mut canvas,
            &[
                DrawOp::FillRect {
                    x: 1.0,
                    y: 1.0,
                    width: 0.0,
                    height: 5.0,
                    color: RED,
                },
                DrawOp::StrokeRect {
                    x: f32::NAN,
                    y: 0.0,
                    width: 5.0,
                    height: 5.0,
                    color: RED,
                    thickness: 1,
                },
                DrawOp::Text {
                    x: -50.0,
                    y: -50.0,
                    text: "CAR 90%".to_string(),
                    color: RED,
                    scale: 2,
                },
            ],
        );
        assert!(canvas.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn text_sets_glyph_pixels() {
        let mut canvas = RgbaImage::new(12, 8);
        draw_text(&mut canvas, 0, 0, "T", RED, 1);
        // Top bar of 'T'.
        for x in 0..5 {
            assert_eq!(*canvas.get_pixel(x, 0), RED);
        }
        assert_eq!(canvas.get_pixel(0, 1)[3], 0);
    }

    #[test]
    fn dashed_line_has_gaps() {
        let mut canvas = RgbaImage::new(30, 5);
        dashed_line(&mut canvas, 2.0, RED, 10, 5, 1);
        assert_eq!(*canvas.get_pixel(0, 2), RED);
        assert_eq!(canvas.get_pixel(12, 2)[3], 0);
        assert_eq!(*canvas.get_pixel(16, 2), RED);
    }
}
