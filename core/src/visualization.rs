use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine;
use image::{codecs::png::PngEncoder, ColorType, ImageEncoder, Rgb, RgbImage};

use crate::metrics::TrainingHistory;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
const TRAIN_COLOR: Rgb<u8> = Rgb([31, 64, 220]);
const VAL_COLOR: Rgb<u8> = Rgb([220, 38, 38]);
const Y_GRID_LINES: u32 = 5;

/// Encode a planar (CHW) RGB image as a PNG data URL.
pub fn encode_planar_rgb_png_data_url(width: u32, height: u32, planes: &[u8]) -> Result<String> {
    let plane_len = (width * height) as usize;
    if planes.len() != plane_len * 3 {
        bail!(
            "pixel buffer length {} does not match RGB image size {}x{}",
            planes.len(),
            width,
            height
        );
    }

    let (red, rest) = planes.split_at(plane_len);
    let (green, blue) = rest.split_at(plane_len);
    let mut interleaved = Vec::with_capacity(planes.len());
    for i in 0..plane_len {
        interleaved.extend_from_slice(&[red[i], green[i], blue[i]]);
    }

    let mut buffer = Vec::new();
    let encoder = PngEncoder::new(&mut buffer);
    encoder
        .write_image(&interleaved, width, height, ColorType::Rgb8)
        .context("failed to encode RGB PNG data")?;

    let base64 = base64::engine::general_purpose::STANDARD.encode(&buffer);
    Ok(format!("data:image/png;base64,{base64}"))
}

/// Draw training (blue) and validation (red) loss per epoch.
///
/// The legend sits to the right of the plot area: a blue swatch above a red one.
pub fn plot_loss_curve(history: &TrainingHistory, width: u32, height: u32) -> Result<RgbImage> {
    if history.is_empty() {
        bail!("cannot plot an empty training history");
    }
    if width < 64 || height < 64 {
        bail!("plot size {}x{} is too small", width, height);
    }

    let train = history.train_loss();
    let val = history.val_loss();
    let (low, high) = loss_range(train.iter().chain(&val).copied());

    let area = PlotArea {
        left: width / 10,
        right: width - width / 5,
        top: height / 12,
        bottom: height - height / 8,
        low,
        high,
        epochs: history.len(),
    };
    let stroke = (height / 400).max(1);

    let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);

    for i in 0..=Y_GRID_LINES {
        let y = area.top + (area.bottom - area.top) * i / Y_GRID_LINES;
        draw_line(&mut canvas, (area.left, y), (area.right, y), GRID, 0);
    }
    for epoch in 1..=area.epochs {
        let x = area.x(epoch);
        draw_line(&mut canvas, (x, area.bottom), (x, area.bottom + stroke * 4), AXIS, 0);
    }
    draw_line(&mut canvas, (area.left, area.top), (area.left, area.bottom), AXIS, stroke);
    draw_line(&mut canvas, (area.left, area.bottom), (area.right, area.bottom), AXIS, stroke);

    draw_series(&mut canvas, &area, &train, TRAIN_COLOR, stroke);
    draw_series(&mut canvas, &area, &val, VAL_COLOR, stroke);

    let legend_x = area.right + width / 40;
    let legend_len = width / 20;
    for (row, color) in [TRAIN_COLOR, VAL_COLOR].into_iter().enumerate() {
        let y = area.top + stroke * 8 + row as u32 * stroke * 12;
        draw_line(&mut canvas, (legend_x, y), (legend_x + legend_len, y), color, stroke * 2);
    }

    Ok(canvas)
}

/// Render the loss curve and save it as a PNG. The parent directory must exist.
pub fn render_loss_curve(path: &Path, history: &TrainingHistory, width: u32, height: u32) -> Result<()> {
    let canvas = plot_loss_curve(history, width, height)?;
    canvas
        .save(path)
        .with_context(|| format!("failed to save loss plot to {}", path.display()))?;
    log::debug!("saved loss plot to {}", path.display());
    Ok(())
}

struct PlotArea {
    left: u32,
    right: u32,
    top: u32,
    bottom: u32,
    low: f32,
    high: f32,
    epochs: usize,
}

impl PlotArea {
    fn x(&self, epoch: usize) -> u32 {
        if self.epochs <= 1 {
            return (self.left + self.right) / 2;
        }
        let fraction = (epoch - 1) as f32 / (self.epochs - 1) as f32;
        self.left + (fraction * (self.right - self.left) as f32).round() as u32
    }

    fn y(&self, loss: f32) -> u32 {
        let fraction = (loss - self.low) / (self.high - self.low);
        let span = (self.bottom - self.top) as f32;
        self.bottom - (fraction.clamp(0.0, 1.0) * span).round() as u32
    }
}

fn loss_range(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let (low, high) = values
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });

    if !low.is_finite() {
        return (0.0, 1.0);
    }
    if high - low < f32::EPSILON {
        return (low - 0.5, high + 0.5);
    }
    let pad = (high - low) * 0.05;
    (low - pad, high + pad)
}

/// Non-finite losses leave a gap in the line.
fn draw_series(canvas: &mut RgbImage, area: &PlotArea, series: &[f32], color: Rgb<u8>, stroke: u32) {
    let mut previous: Option<(u32, u32)> = None;
    for (index, &loss) in series.iter().enumerate() {
        if !loss.is_finite() {
            previous = None;
            continue;
        }
        let point = (area.x(index + 1), area.y(loss));
        if let Some(start) = previous {
            draw_line(canvas, start, point, color, stroke);
        }
        fill_square(canvas, point, stroke * 2, color);
        previous = Some(point);
    }
}

/// Bresenham line with a square brush of half-width `radius`.
fn draw_line(canvas: &mut RgbImage, from: (u32, u32), to: (u32, u32), color: Rgb<u8>, radius: u32) {
    let (mut x, mut y) = (from.0 as i64, from.1 as i64);
    let (x1, y1) = (to.0 as i64, to.1 as i64);
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        fill_square(canvas, (x as u32, y as u32), radius, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn fill_square(canvas: &mut RgbImage, center: (u32, u32), radius: u32, color: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    let x0 = center.0.saturating_sub(radius);
    let y0 = center.1.saturating_sub(radius);
    let x1 = (center.0 + radius).min(width - 1);
    let y1 = (center.1 + radius).min(height - 1);
    for y in y0..=y1 {
        for x in x0..=x1 {
            canvas.put_pixel(x, y, color);
        }
    }
}
