use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Pixel, Rgba, RgbaImage};

/// Fixed working canvas every photo is normalized to before compositing.
pub const CANVAS_WIDTH: u32 = 800;
pub const CANVAS_HEIGHT: u32 = 600;

// All placement constants are fractions of the working resolution.
const FRAME_FRACTION: f32 = 1.0 / 16.0;
const LOGO_HEIGHT_FRACTION: f32 = 0.30;
const LOGO_MARGIN_FRACTION: f32 = 0.025;
const PLATE_PAD_FRACTION: f32 = 0.05;

const FRAME_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const ACCENT_COLOR: Rgba<u8> = Rgba([196, 30, 58, 255]);
const PLATE_COLOR: Rgba<u8> = Rgba([255, 255, 255, 230]);

// Squared RGB distance below which a logo pixel counts as background.
const CHROMA_DISTANCE_SQ: u32 = 3 * 60 * 60;

pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("could not decode image buffer")
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image.clone())
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .context("failed encoding PNG")?;
    Ok(bytes)
}

/// Resize-with-crop to the working canvas. The crop window along the
/// overflowing axis is anchored where gradient energy is highest; flat
/// images fall back to a center crop.
pub fn normalize_canvas(photo: &DynamicImage) -> Result<RgbaImage> {
    let (width, height) = photo.dimensions();
    if width == 0 || height == 0 {
        bail!("image has empty dimensions");
    }
    let scale = (CANVAS_WIDTH as f32 / width as f32).max(CANVAS_HEIGHT as f32 / height as f32);
    let scaled_w = ((width as f32 * scale).round() as u32).max(CANVAS_WIDTH);
    let scaled_h = ((height as f32 * scale).round() as u32).max(CANVAS_HEIGHT);
    let scaled = photo
        .resize_exact(scaled_w, scaled_h, FilterType::Triangle)
        .to_rgba8();
    let x = crop_offset(&scaled, Axis::Horizontal);
    let y = crop_offset(&scaled, Axis::Vertical);
    Ok(imageops::crop_imm(&scaled, x, y, CANVAS_WIDTH, CANVAS_HEIGHT).to_image())
}

/// White frame around the canvas plus an inner accent rule. Thickness is a
/// fraction of the canvas width, so the output is always
/// `CANVAS + 2 * border` in each dimension.
pub fn draw_frame(base: RgbaImage) -> RgbaImage {
    let border = frame_border();
    let mut canvas = RgbaImage::from_pixel(
        base.width() + border * 2,
        base.height() + border * 2,
        FRAME_COLOR,
    );
    imageops::overlay(&mut canvas, &base, i64::from(border), i64::from(border));

    let accent = (border / 8).max(1);
    let inset = border.saturating_sub(accent * 2);
    draw_ring(
        &mut canvas,
        inset,
        inset,
        base.width() + (border - inset) * 2,
        base.height() + (border - inset) * 2,
        accent,
        ACCENT_COLOR,
    );
    canvas
}

pub fn frame_border() -> u32 {
    (CANVAS_WIDTH as f32 * FRAME_FRACTION).round() as u32
}

/// Center-square crop, scale to `side`, remove the dominant border color via
/// a chroma-key threshold, then apply a circular mask.
pub fn prepare_logo(logo: &DynamicImage, side: u32) -> RgbaImage {
    let (width, height) = logo.dimensions();
    let square = width.min(height).max(1);
    let cropped = logo.crop_imm((width - square) / 2, (height - square) / 2, square, square);
    let mut scaled = cropped
        .resize_exact(side.max(1), side.max(1), FilterType::Triangle)
        .to_rgba8();

    let key = border_color(&scaled);
    let center = side as f32 / 2.0;
    let radius = center;
    for (x, y, pixel) in scaled.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - center;
        let dy = y as f32 + 0.5 - center;
        if dx * dx + dy * dy > radius * radius {
            pixel.0[3] = 0;
            continue;
        }
        if color_distance_sq(pixel.0, key) < CHROMA_DISTANCE_SQ {
            pixel.0[3] = 0;
        }
    }
    scaled
}

/// Full card: background photo, frame, logo background plate, logo, in that
/// draw order. Logo sits bottom-right with a fixed fractional margin.
pub fn compose_card(photo: &DynamicImage, logo: &DynamicImage) -> Result<RgbaImage> {
    let base = normalize_canvas(photo)?;
    let mut canvas = draw_frame(base);

    let side = (CANVAS_HEIGHT as f32 * LOGO_HEIGHT_FRACTION).round() as u32;
    let margin = (CANVAS_WIDTH as f32 * LOGO_MARGIN_FRACTION).round() as u32;
    let logo = prepare_logo(logo, side);
    let x = canvas.width() - margin - side;
    let y = canvas.height() - margin - side;

    draw_plate(&mut canvas, x, y, side);
    imageops::overlay(&mut canvas, &logo, i64::from(x), i64::from(y));
    Ok(canvas)
}

#[derive(Clone, Copy)]
enum Axis {
    Horizontal,
    Vertical,
}

fn crop_offset(image: &RgbaImage, axis: Axis) -> u32 {
    let (width, height) = image.dimensions();
    let (lanes, span) = match axis {
        Axis::Horizontal => (width, CANVAS_WIDTH),
        Axis::Vertical => (height, CANVAS_HEIGHT),
    };
    if lanes <= span {
        return 0;
    }
    let overflow = lanes - span;

    let mut energy = vec![0u64; lanes as usize];
    match axis {
        Axis::Horizontal => {
            for y in 0..height {
                for x in 0..width - 1 {
                    let a = luma(image.get_pixel(x, y));
                    let b = luma(image.get_pixel(x + 1, y));
                    energy[x as usize] += u64::from(a.abs_diff(b));
                }
            }
        }
        Axis::Vertical => {
            for y in 0..height - 1 {
                for x in 0..width {
                    let a = luma(image.get_pixel(x, y));
                    let b = luma(image.get_pixel(x, y + 1));
                    energy[y as usize] += u64::from(a.abs_diff(b));
                }
            }
        }
    }

    let mut prefix = vec![0u64; lanes as usize + 1];
    for (idx, value) in energy.iter().enumerate() {
        prefix[idx + 1] = prefix[idx] + value;
    }
    if prefix[lanes as usize] == 0 {
        return overflow / 2;
    }

    let mut best_start = overflow / 2;
    let mut best_energy = 0u64;
    for start in 0..=overflow {
        let window = prefix[(start + span) as usize] - prefix[start as usize];
        if window > best_energy {
            best_energy = window;
            best_start = start;
        }
    }
    best_start
}

fn luma(pixel: &Rgba<u8>) -> u16 {
    let [r, g, b, _] = pixel.0;
    ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u16
}

fn border_color(image: &RgbaImage) -> [u8; 3] {
    let (width, height) = image.dimensions();
    let mut sums = [0u64; 3];
    let mut count = 0u64;
    for x in 0..width {
        for y in [0, height - 1] {
            let pixel = image.get_pixel(x, y);
            for channel in 0..3 {
                sums[channel] += u64::from(pixel.0[channel]);
            }
            count += 1;
        }
    }
    for y in 0..height {
        for x in [0, width - 1] {
            let pixel = image.get_pixel(x, y);
            for channel in 0..3 {
                sums[channel] += u64::from(pixel.0[channel]);
            }
            count += 1;
        }
    }
    if count == 0 {
        return [255, 255, 255];
    }
    [
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
    ]
}

fn color_distance_sq(pixel: [u8; 4], key: [u8; 3]) -> u32 {
    let mut total = 0u32;
    for channel in 0..3 {
        let delta = i32::from(pixel[channel]) - i32::from(key[channel]);
        total += (delta * delta) as u32;
    }
    total
}

fn draw_ring(canvas: &mut RgbaImage, x0: u32, y0: u32, w: u32, h: u32, thickness: u32, color: Rgba<u8>) {
    for y in y0..(y0 + h).min(canvas.height()) {
        for x in x0..(x0 + w).min(canvas.width()) {
            let on_edge = x < x0 + thickness
                || x >= x0 + w - thickness
                || y < y0 + thickness
                || y >= y0 + h - thickness;
            if on_edge {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}

fn draw_plate(canvas: &mut RgbaImage, x0: u32, y0: u32, side: u32) {
    let pad = (side as f32 * PLATE_PAD_FRACTION).round();
    let center_x = x0 as f32 + side as f32 / 2.0;
    let center_y = y0 as f32 + side as f32 / 2.0;
    let radius = side as f32 / 2.0 + pad;

    let min_x = (center_x - radius).floor().max(0.0) as u32;
    let max_x = ((center_x + radius).ceil() as u32).min(canvas.width() - 1);
    let min_y = (center_y - radius).floor().max(0.0) as u32;
    let max_y = ((center_y + radius).ceil() as u32).min(canvas.height() - 1);

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dx = x as f32 + 0.5 - center_x;
            let dy = y as f32 + 0.5 - center_y;
            if dx * dx + dy * dy <= radius * radius {
                canvas.get_pixel_mut(x, y).blend(&PLATE_COLOR);
            }
        }
    }
}
