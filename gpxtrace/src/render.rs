//! Track pictures and icons.
//!
//! Points are projected with spherical Mercator into a square canvas fitted to
//! the track's bounding box. The picture is an animated GIF that walks a thick
//! highlight along the track; the icon is a single-frame GIF.

use crate::config::RenderConfig;
use crate::error::Result;
use crate::gpx::DecodedPoint;
use crate::points::Bounds;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, ImageBuffer, ImageFormat, Rgba, RgbaImage};
use log::debug;
use rayon::prelude::*;
use std::f64::consts::PI;
use std::io::Cursor;

pub const GIF_CONTENT_TYPE: &str = "image/gif";

/// Widening applied to zero-span bounding boxes, in projected degrees.
const DEGENERATE_SPAN: f64 = 1e-6;

/// Mercator breaks down at the poles.
const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// Encoded image ready to attach.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: &'static str,
}

// ============================================================================
// Projection
// ============================================================================

fn mercator_y(lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    (PI / 4.0 + lat.to_radians() / 2.0).tan().ln().to_degrees()
}

/// Maps coordinates inside `bounds` onto a `size`x`size` canvas, preserving
/// aspect ratio and centering the shorter axis.
#[derive(Debug, Clone, Copy)]
struct Projection {
    min_x: f64,
    max_y: f64,
    scale: f64,
    offset_x: f64,
    offset_y: f64,
}

impl Projection {
    fn new(bounds: &Bounds, size: u32, padding: u32) -> Self {
        let (mut min_x, mut max_x) = (bounds.min_lon, bounds.max_lon);
        let (mut min_y, mut max_y) = (mercator_y(bounds.min_lat), mercator_y(bounds.max_lat));
        if max_x - min_x < DEGENERATE_SPAN {
            min_x -= DEGENERATE_SPAN;
            max_x += DEGENERATE_SPAN;
        }
        if max_y - min_y < DEGENERATE_SPAN {
            min_y -= DEGENERATE_SPAN;
            max_y += DEGENERATE_SPAN;
        }

        let usable = size.saturating_sub(2 * padding).max(1) as f64;
        let (span_x, span_y) = (max_x - min_x, max_y - min_y);
        let scale = usable / span_x.max(span_y);

        Self {
            min_x,
            max_y,
            scale,
            offset_x: padding as f64 + (usable - span_x * scale) / 2.0,
            offset_y: padding as f64 + (usable - span_y * scale) / 2.0,
        }
    }

    /// Pixel coordinates, y growing downwards.
    fn project(&self, lat: f64, lon: f64) -> (f32, f32) {
        let x = self.offset_x + (lon - self.min_x) * self.scale;
        let y = self.offset_y + (self.max_y - mercator_y(lat)) * self.scale;
        (x as f32, y as f32)
    }
}

// ============================================================================
// Line Rasterization
// ============================================================================

/// Draw a line with antialiasing using Wu's algorithm
fn draw_line_aa(
    img: &mut RgbaImage,
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    color: [u8; 4],
    width: f32,
) {
    // For thick lines, draw multiple parallel lines
    if width > 1.5 {
        let dx = x1 - x0;
        let dy = y1 - y0;
        let len = (dx * dx + dy * dy).sqrt();
        if len < 0.001 {
            plot_dot(img, x0, y0, color, width);
            return;
        }

        let px = -dy / len;
        let py = dx / len;

        let half_width = width / 2.0;
        let steps = (width.ceil() as i32).max(3);
        for i in 0..steps {
            let offset = -half_width + (i as f32 / (steps - 1) as f32) * width;
            draw_line_wu(
                img,
                x0 + px * offset,
                y0 + py * offset,
                x1 + px * offset,
                y1 + py * offset,
                color,
            );
        }
    } else {
        draw_line_wu(img, x0, y0, x1, y1, color);
    }
}

/// Wu's antialiased line algorithm
fn draw_line_wu(
    img: &mut RgbaImage,
    mut x0: f32,
    mut y0: f32,
    mut x1: f32,
    mut y1: f32,
    color: [u8; 4],
) {
    let steep = (y1 - y0).abs() > (x1 - x0).abs();

    if steep {
        std::mem::swap(&mut x0, &mut y0);
        std::mem::swap(&mut x1, &mut y1);
    }

    if x0 > x1 {
        std::mem::swap(&mut x0, &mut x1);
        std::mem::swap(&mut y0, &mut y1);
    }

    let dx = x1 - x0;
    let dy = y1 - y0;
    let gradient = if dx.abs() < 0.001 { 1.0 } else { dy / dx };

    let plot = |img: &mut RgbaImage, x: i32, y: i32, brightness: f32| {
        if steep {
            plot_aa(img, y, x, brightness, color);
        } else {
            plot_aa(img, x, y, brightness, color);
        }
    };

    // First endpoint
    let xend = x0.round();
    let yend = y0 + gradient * (xend - x0);
    let xgap = 1.0 - (x0 + 0.5).fract();
    let xpxl1 = xend as i32;
    let ypxl1 = yend.floor() as i32;
    plot(img, xpxl1, ypxl1, (1.0 - yend.fract()) * xgap);
    plot(img, xpxl1, ypxl1 + 1, yend.fract() * xgap);

    let mut intery = yend + gradient;

    // Second endpoint
    let xend = x1.round();
    let yend = y1 + gradient * (xend - x1);
    let xgap = (x1 + 0.5).fract();
    let xpxl2 = xend as i32;
    let ypxl2 = yend.floor() as i32;
    plot(img, xpxl2, ypxl2, (1.0 - yend.fract()) * xgap);
    plot(img, xpxl2, ypxl2 + 1, yend.fract() * xgap);

    for x in (xpxl1 + 1)..xpxl2 {
        let y = intery.floor() as i32;
        plot(img, x, y, 1.0 - intery.fract());
        plot(img, x, y + 1, intery.fract());
        intery += gradient;
    }
}

/// Square mark for single-point segments.
fn plot_dot(img: &mut RgbaImage, x: f32, y: f32, color: [u8; 4], width: f32) {
    let r = (width / 2.0).floor() as i32;
    let (cx, cy) = (x.round() as i32, y.round() as i32);
    for dy in -r..=r {
        for dx in -r..=r {
            plot_aa(img, cx + dx, cy + dy, 1.0, color);
        }
    }
}

/// Plot a pixel with alpha blending
#[inline]
fn plot_aa(img: &mut RgbaImage, x: i32, y: i32, brightness: f32, color: [u8; 4]) {
    if x < 0 || y < 0 || x >= img.width() as i32 || y >= img.height() as i32 {
        return;
    }

    let alpha = (color[3] as f32 * brightness.clamp(0.0, 1.0)) as u8;
    if alpha == 0 {
        return;
    }

    let pixel = img.get_pixel_mut(x as u32, y as u32);

    // Porter-Duff over
    let src_a = alpha as f32 / 255.0;
    let dst_a = pixel[3] as f32 / 255.0;
    let out_a = src_a + dst_a * (1.0 - src_a);

    if out_a > 0.0 {
        for i in 0..3 {
            let src = color[i] as f32;
            let dst = pixel[i] as f32;
            pixel[i] = ((src * src_a + dst * dst_a * (1.0 - src_a)) / out_a) as u8;
        }
        pixel[3] = (out_a * 255.0) as u8;
    }
}

/// Draw `points[range]` plus the link into the range from the point before
/// it. Consecutive points are only joined within a segment.
fn draw_track(
    img: &mut RgbaImage,
    pixels: &[(f32, f32)],
    points: &[DecodedPoint],
    range: std::ops::Range<usize>,
    color: [u8; 4],
    width: f32,
) {
    let start = range.start.saturating_sub(1);
    for i in range {
        let (x, y) = pixels[i];
        let joined = i > start && points[i - 1].segment == points[i].segment;
        if joined {
            let (px, py) = pixels[i - 1];
            draw_line_aa(img, px, py, x, y, color, width);
        } else {
            let next_joined = i + 1 < points.len() && points[i + 1].segment == points[i].segment;
            if !next_joined {
                plot_dot(img, x, y, color, width);
            }
        }
    }
}

// ============================================================================
// Picture and Icon
// ============================================================================

/// Animated picture: the whole track in the track color, with each frame
/// highlighting the next `ceil(n / frames)` points.
pub fn render_picture(
    trace_id: i64,
    points: &[DecodedPoint],
    bounds: &Bounds,
    config: &RenderConfig,
) -> Result<RenderedImage> {
    let size = config.picture_size;
    let projection = Projection::new(bounds, size, config.padding);
    let pixels: Vec<(f32, f32)> = points
        .iter()
        .map(|p| projection.project(p.latitude, p.longitude))
        .collect();

    let mut base: RgbaImage = ImageBuffer::from_pixel(size, size, Rgba(config.background_color));
    draw_track(&mut base, &pixels, points, 0..points.len(), config.track_color, 1.0);

    let frame_count = config.frames.max(1) as usize;
    let per_frame = points.len().div_ceil(frame_count).max(1);

    let images: Vec<RgbaImage> = (0..frame_count)
        .into_par_iter()
        .map(|f| {
            let mut img = base.clone();
            let start = (f * per_frame).min(points.len());
            let end = ((f + 1) * per_frame).min(points.len());
            draw_track(
                &mut img,
                &pixels,
                points,
                start..end,
                config.highlight_color,
                config.highlight_width,
            );
            img
        })
        .collect();

    let delay = Delay::from_numer_denom_ms(config.frame_delay_ms, 1);
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut bytes);
        encoder.set_repeat(Repeat::Infinite)?;
        encoder.encode_frames(
            images
                .into_iter()
                .map(|img| Frame::from_parts(img, 0, 0, delay)),
        )?;
    }

    debug!(
        "[Render] Trace {}: {} frames, {} points, {} bytes",
        trace_id,
        frame_count,
        points.len(),
        bytes.len()
    );

    Ok(RenderedImage {
        bytes,
        filename: format!("{}.gif", trace_id),
        content_type: GIF_CONTENT_TYPE,
    })
}

/// Single-frame icon: a 1px track on the background.
pub fn render_icon(
    trace_id: i64,
    points: &[DecodedPoint],
    bounds: &Bounds,
    config: &RenderConfig,
) -> Result<RenderedImage> {
    let size = config.icon_size;
    let projection = Projection::new(bounds, size, config.padding);
    let pixels: Vec<(f32, f32)> = points
        .iter()
        .map(|p| projection.project(p.latitude, p.longitude))
        .collect();

    let mut img: RgbaImage = ImageBuffer::from_pixel(size, size, Rgba(config.background_color));
    draw_track(&mut img, &pixels, points, 0..points.len(), config.icon_color, 1.0);

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Gif)?;

    Ok(RenderedImage {
        bytes,
        filename: format!("{}_icon.gif", trace_id),
        content_type: GIF_CONTENT_TYPE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use image::AnimationDecoder;
    use image::codecs::gif::GifDecoder;

    fn point(lat: f64, lon: f64, segment: u32) -> DecodedPoint {
        DecodedPoint {
            latitude: lat,
            longitude: lon,
            altitude: None,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            segment,
        }
    }

    fn zigzag(n: usize) -> Vec<DecodedPoint> {
        (0..n)
            .map(|i| point(46.0 + (i % 7) as f64 * 0.001, 7.0 + i as f64 * 0.0005, 0))
            .collect()
    }

    fn bounds(points: &[DecodedPoint]) -> Bounds {
        Bounds::from_points(points).unwrap()
    }

    #[test]
    fn test_picture_is_animated_gif() {
        let points = zigzag(95);
        let config = RenderConfig::default();
        let picture = render_picture(12, &points, &bounds(&points), &config).unwrap();
        assert_eq!(picture.filename, "12.gif");
        assert_eq!(picture.content_type, "image/gif");

        let frames = GifDecoder::new(Cursor::new(&picture.bytes))
            .unwrap()
            .into_frames()
            .collect_frames()
            .unwrap();
        assert_eq!(frames.len(), 10);
        for frame in &frames {
            assert_eq!(frame.buffer().dimensions(), (250, 250));
        }
        // Each frame highlights a different stretch of the track.
        assert_ne!(frames[0].buffer(), frames[9].buffer());
    }

    #[test]
    fn test_icon_dimensions() {
        let points = zigzag(30);
        let icon = render_icon(3, &points, &bounds(&points), &RenderConfig::default()).unwrap();
        assert_eq!(icon.filename, "3_icon.gif");
        let img = image::load_from_memory_with_format(&icon.bytes, ImageFormat::Gif).unwrap();
        assert_eq!((img.width(), img.height()), (50, 50));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let points = zigzag(40);
        let config = RenderConfig::default();
        let a = render_picture(1, &points, &bounds(&points), &config).unwrap();
        let b = render_picture(1, &points, &bounds(&points), &config).unwrap();
        assert_eq!(a.bytes, b.bytes);

        let mut other = zigzag(40);
        other.reverse();
        for p in other.iter_mut() {
            p.latitude = 46.0 + (p.longitude - 7.0) * 0.3;
        }
        let c = render_icon(1, &other, &bounds(&other), &config).unwrap();
        let d = render_icon(1, &points, &bounds(&points), &config).unwrap();
        assert_ne!(c.bytes, d.bytes);
    }

    #[test]
    fn test_no_line_across_segments() {
        let points = vec![
            point(0.0, 0.0, 0),
            point(0.0, 0.1, 0),
            point(0.0, 0.9, 1),
            point(0.0, 1.0, 1),
        ];
        let icon = render_icon(1, &points, &bounds(&points), &RenderConfig::default()).unwrap();
        let img = image::load_from_memory(&icon.bytes).unwrap().to_rgba8();

        let darkest = |x: u32| (0..50).map(|y| img.get_pixel(x, y)[0]).min().unwrap();
        // Inside the first segment
        assert!(darkest(4) < 200);
        // Gap between the segments stays blank
        assert!(darkest(25) > 200);
        // Inside the second segment
        assert!(darkest(46) < 200);
    }

    #[test]
    fn test_single_point_track() {
        let points = vec![point(51.5, -0.12, 0)];
        let config = RenderConfig::default();
        let b = bounds(&points);
        assert!(render_picture(1, &points, &b, &config).is_ok());
        let icon = render_icon(1, &points, &b, &config).unwrap();
        let img = image::load_from_memory(&icon.bytes).unwrap().to_rgba8();
        assert!(img.pixels().any(|p| p[0] < 128));
    }

    #[test]
    fn test_projection_fits_canvas() {
        let b = Bounds {
            min_lat: -10.0,
            min_lon: -20.0,
            max_lat: 10.0,
            max_lon: 20.0,
        };
        let projection = Projection::new(&b, 100, 2);
        let (x0, y0) = projection.project(-10.0, -20.0);
        let (x1, y1) = projection.project(10.0, 20.0);
        assert!((x0 - 2.0).abs() < 1e-3);
        assert!((x1 - 98.0).abs() < 1e-3);
        // North is up and the shorter axis is centered.
        assert!(y1 < y0);
        assert!(((y0 + y1) / 2.0 - 50.0).abs() < 1e-3);
    }
}
