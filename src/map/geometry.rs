use crate::braille::BrailleCanvas;
use crate::map::projection::Viewport;

/// A geographic line (sequence of lon/lat coordinates)
pub type LineString = Vec<(f64, f64)>;

/// Visit every pixel on the segment (x0, y0)-(x1, y1), endpoints included
fn bresenham(from: (i32, i32), to: (i32, i32), mut plot: impl FnMut(i32, i32)) {
    let (dx, dy) = ((to.0 - from.0).abs(), -(to.1 - from.1).abs());
    let step = ((to.0 - from.0).signum(), (to.1 - from.1).signum());
    let mut err = dx + dy;
    let (mut x, mut y) = from;

    plot(x, y);
    while (x, y) != to {
        let doubled = 2 * err;
        if doubled >= dy {
            err += dy;
            x += step.0;
        }
        if doubled <= dx {
            err += dx;
            y += step.1;
        }
        plot(x, y);
    }
}

pub fn draw_line(canvas: &mut BrailleCanvas, x0: i32, y0: i32, x1: i32, y1: i32) {
    bresenham((x0, y0), (x1, y1), |x, y| canvas.set_pixel_signed(x, y));
}

/// Line with a one-pixel shadow right and below
pub fn draw_thick_line(canvas: &mut BrailleCanvas, x0: i32, y0: i32, x1: i32, y1: i32) {
    bresenham((x0, y0), (x1, y1), |x, y| {
        canvas.set_pixel_signed(x, y);
        canvas.set_pixel_signed(x + 1, y);
        canvas.set_pixel_signed(x, y + 1);
    });
}

/// Filled disc
pub fn draw_circle(canvas: &mut BrailleCanvas, cx: i32, cy: i32, radius: i32) {
    let span = -radius..=radius;
    for dy in span.clone() {
        for dx in span.clone().filter(|dx| dx * dx + dy * dy <= radius * radius) {
            canvas.set_pixel_signed(cx + dx, cy + dy);
        }
    }
}

/// Project and stroke a line string, skipping off-screen segments and
/// segments that wrap around the antimeridian. Single positions are drawn
/// as dots.
pub fn draw_linestring(canvas: &mut BrailleCanvas, line: &[(f64, f64)], viewport: &Viewport, thick: bool) {
    if let [(lon, lat)] = line {
        let (px, py) = viewport.project(*lon, *lat);
        if viewport.is_visible(px, py) {
            draw_circle(canvas, px, py, if thick { 2 } else { 1 });
        }
        return;
    }

    let mut prev: Option<(i32, i32)> = None;
    for &(lon, lat) in line {
        let (px, py) = viewport.project(lon, lat);
        if let Some((prev_x, prev_y)) = prev {
            let dist = ((px - prev_x).abs() + (py - prev_y).abs()) as usize;
            if dist < viewport.width && viewport.line_might_be_visible((prev_x, prev_y), (px, py)) {
                if thick {
                    draw_thick_line(canvas, prev_x, prev_y, px, py);
                } else {
                    draw_line(canvas, prev_x, prev_y, px, py);
                }
            }
        }
        prev = Some((px, py));
    }
}
