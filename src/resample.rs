//! Progressive image resampler.
//!
//! Shrinking by a large factor in one bicubic step aliases badly, so the
//! image is halved repeatedly (each halving preceded by an alpha bleed and a
//! separable blur) until it is within 2x of the target, then brought to the
//! exact target size by one final bleed/blur/bicubic pass.
//!
//! Pixels are 8-bit straight-alpha RGBA and are always filtered as stored
//! (display-referred), with no linearization.

use std::borrow::Cow;
use std::collections::VecDeque;

use image::{Rgba, RgbaImage};

use crate::ResizeError;

/// Largest blur radius accepted by [`FilterConfig::validate`]
pub const MAX_BLUR_RADIUS: usize = 16;

/// Largest output image, in pixels, that [`resample`] will allocate (1 GiB of RGBA)
pub const MAX_TARGET_PIXELS: u64 = 1 << 28;

/// Parameters shared by the filter passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterConfig {
    /// Radius of the binomial blur kernel (kernel width is `2 * radius + 1`)
    pub blur_radius: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { blur_radius: 2 }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), ResizeError> {
        if self.blur_radius > MAX_BLUR_RADIUS {
            return Err(ResizeError::FilterUnavailable(format!(
                "blur radius {} exceeds the maximum of {}",
                self.blur_radius, MAX_BLUR_RADIUS
            )));
        }
        Ok(())
    }
}

/// A pure buffer-to-buffer filter pass.
pub trait FilterPass {
    fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, ResizeError>;
}

/// Fills the color of fully transparent pixels from their nearest visible
/// neighbors so that later blurring does not drag garbage color (often
/// black) into the edges of visible regions. Alpha is left untouched, as is
/// the color of every pixel with non-zero alpha.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlphaBleed;

impl FilterPass for AlphaBleed {
    fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, ResizeError> {
        Ok(bleed_alpha(input))
    }
}

/// Blur axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Horizontal,
    Vertical,
}

/// One axis of the separable low-pass blur.
#[derive(Debug, Clone)]
pub struct Blur {
    direction: Direction,
    kernel: Vec<f32>,
}

impl Blur {
    pub fn new(direction: Direction, radius: usize) -> Self {
        Self {
            direction,
            kernel: binomial_kernel(radius),
        }
    }
}

impl FilterPass for Blur {
    fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, ResizeError> {
        Ok(blur(input, self.direction, &self.kernel))
    }
}

/// Catmull-Rom bicubic (4x4 tap) resample to an exact size.
#[derive(Debug, Clone, Copy)]
pub struct Bicubic {
    pub width: u32,
    pub height: u32,
}

impl FilterPass for Bicubic {
    fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, ResizeError> {
        bicubic(input, self.width, self.height)
    }
}

/// Resample `source` to exactly `target_width` x `target_height`.
///
/// The source is never modified. Output is deterministic for a given source,
/// target size and filter configuration.
pub fn resample(
    source: &RgbaImage,
    target_width: u32,
    target_height: u32,
    config: &FilterConfig,
) -> Result<RgbaImage, ResizeError> {
    config.validate()?;

    if target_width == 0 || target_height == 0 {
        return Err(ResizeError::Resample(format!(
            "invalid target size {}x{}",
            target_width, target_height
        )));
    }
    if source.width() == 0 || source.height() == 0 {
        return Err(ResizeError::Resample("source image is empty".to_string()));
    }
    if u64::from(target_width) * u64::from(target_height) > MAX_TARGET_PIXELS {
        return Err(ResizeError::Resample(format!(
            "target size {}x{} exceeds the limit of {} pixels",
            target_width, target_height, MAX_TARGET_PIXELS
        )));
    }

    let mut current: Cow<'_, RgbaImage> = Cow::Borrowed(source);

    // Halve only while the next half is still at least twice the final size
    while u64::from(current.width() / 2) >= u64::from(target_width) * 2
        || u64::from(current.height() / 2) >= u64::from(target_height) * 2
    {
        let half_width = (current.width() / 2).max(1);
        let half_height = (current.height() / 2).max(1);

        log::debug!(
            "  Halving {}x{} -> {}x{}",
            current.width(),
            current.height(),
            half_width,
            half_height
        );

        // Assigning drops the previous intermediate; the borrowed source is kept
        current = Cow::Owned(shrink_step(&current, half_width, half_height, config)?);
    }

    if current.width() != target_width || current.height() != target_height {
        log::debug!(
            "  Final pass {}x{} -> {}x{}",
            current.width(),
            current.height(),
            target_width,
            target_height
        );
        current = Cow::Owned(shrink_step(&current, target_width, target_height, config)?);
    }

    Ok(current.into_owned())
}

/// One bleed -> blur (H) -> blur (V) -> bicubic chain
fn shrink_step(
    input: &RgbaImage,
    width: u32,
    height: u32,
    config: &FilterConfig,
) -> Result<RgbaImage, ResizeError> {
    let passes: [&dyn FilterPass; 4] = [
        &AlphaBleed,
        &Blur::new(Direction::Horizontal, config.blur_radius),
        &Blur::new(Direction::Vertical, config.blur_radius),
        &Bicubic { width, height },
    ];

    let mut buffer = passes[0].apply(input)?;
    for pass in &passes[1..] {
        buffer = pass.apply(&buffer)?;
    }
    Ok(buffer)
}

/// Breadth-first flood of color outward from visible pixels.
///
/// Each transparent pixel receives the alpha-weighted average color of the
/// neighbors (8-connected) that were filled in an earlier ring, so it always
/// takes its color from the nearest visible region.
pub fn bleed_alpha(input: &RgbaImage) -> RgbaImage {
    let (width, height) = input.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut output = input.clone();

    // Donor weight per pixel; 0 means "not yet colored"
    let mut weight: Vec<f32> = input.pixels().map(|p| p[3] as f32 / 255.0).collect();

    if weight.iter().all(|&wt| wt == 0.0) || weight.iter().all(|&wt| wt > 0.0) {
        return output;
    }

    let neighbors = |index: usize| {
        let x = (index % w) as i64;
        let y = (index / w) as i64;
        (-1i64..=1)
            .flat_map(move |dy| (-1i64..=1).map(move |dx| (dx, dy)))
            .filter(|&(dx, dy)| dx != 0 || dy != 0)
            .filter_map(move |(dx, dy)| {
                let nx = x + dx;
                let ny = y + dy;
                if nx >= 0 && ny >= 0 && (nx as usize) < w && (ny as usize) < h {
                    Some(ny as usize * w + nx as usize)
                } else {
                    None
                }
            })
    };

    let mut queued = vec![false; w * h];
    let mut ring: VecDeque<usize> = VecDeque::new();
    for index in 0..w * h {
        if weight[index] == 0.0 && neighbors(index).any(|n| weight[n] > 0.0) {
            queued[index] = true;
            ring.push_back(index);
        }
    }

    while !ring.is_empty() {
        let mut filled = Vec::with_capacity(ring.len());

        for &index in &ring {
            let mut sum = [0.0f32; 3];
            let mut total = 0.0f32;
            for n in neighbors(index) {
                let wt = weight[n];
                if wt > 0.0 {
                    let p = output.as_raw();
                    for (c, acc) in sum.iter_mut().enumerate() {
                        *acc += p[n * 4 + c] as f32 * wt;
                    }
                    total += wt;
                }
            }
            if total > 0.0 {
                filled.push((index, sum.map(|s| (s / total).round().clamp(0.0, 255.0) as u8)));
            }
        }

        // Commit the whole ring at once so a ring never feeds itself
        let mut next = VecDeque::new();
        for (index, color) in filled {
            let (x, y) = ((index % w) as u32, (index / w) as u32);
            let alpha = output.get_pixel(x, y)[3];
            output.put_pixel(x, y, Rgba([color[0], color[1], color[2], alpha]));
            weight[index] = 1.0;
        }
        for &index in &ring {
            for n in neighbors(index) {
                if weight[n] == 0.0 && !queued[n] {
                    queued[n] = true;
                    next.push_back(n);
                }
            }
        }
        ring = next;
    }

    output
}

/// Normalized binomial kernel of width `2 * radius + 1`
fn binomial_kernel(radius: usize) -> Vec<f32> {
    let n = 2 * radius;
    let mut row = vec![1.0f64];
    for _ in 0..n {
        let mut next = vec![1.0f64; row.len() + 1];
        for i in 1..row.len() {
            next[i] = row[i - 1] + row[i];
        }
        row = next;
    }
    let total: f64 = row.iter().sum();
    row.iter().map(|&v| (v / total) as f32).collect()
}

/// Convolve along one axis, clamping at the edges
fn blur(input: &RgbaImage, direction: Direction, kernel: &[f32]) -> RgbaImage {
    let (width, height) = input.dimensions();
    let radius = (kernel.len() / 2) as i64;
    let mut output = RgbaImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let mut acc = [0.0f32; 4];
            for (k, &wt) in kernel.iter().enumerate() {
                let offset = k as i64 - radius;
                let (sx, sy) = match direction {
                    Direction::Horizontal => ((x as i64 + offset).clamp(0, width as i64 - 1) as u32, y),
                    Direction::Vertical => (x, (y as i64 + offset).clamp(0, height as i64 - 1) as u32),
                };
                let p = input.get_pixel(sx, sy);
                for (c, value) in acc.iter_mut().enumerate() {
                    *value += p[c] as f32 * wt;
                }
            }
            output.put_pixel(x, y, Rgba(acc.map(to_channel)));
        }
    }

    output
}

/// Source taps and weights for one output coordinate
struct Taps {
    index: [u32; 4],
    weight: [f32; 4],
}

fn catmull_rom(x: f32) -> f32 {
    const A: f32 = -0.5;
    let x = x.abs();
    if x < 1.0 {
        (A + 2.0) * x * x * x - (A + 3.0) * x * x + 1.0
    } else if x < 2.0 {
        A * x * x * x - 5.0 * A * x * x + 8.0 * A * x - 4.0 * A
    } else {
        0.0
    }
}

fn compute_taps(src_size: u32, dst_size: u32) -> Vec<Taps> {
    let ratio = src_size as f64 / dst_size as f64;
    let last = src_size as i64 - 1;

    (0..dst_size)
        .map(|d| {
            // Pixel centers map onto pixel centers
            let center = (d as f64 + 0.5) * ratio - 0.5;
            let base = center.floor();
            let t = (center - base) as f32;

            let mut index = [0u32; 4];
            let mut weight = [0.0f32; 4];
            for k in 0..4 {
                let offset = k as i64 - 1;
                index[k] = (base as i64 + offset).clamp(0, last) as u32;
                weight[k] = catmull_rom(t - offset as f32);
            }

            let total: f32 = weight.iter().sum();
            if total != 0.0 {
                for wt in &mut weight {
                    *wt /= total;
                }
            }
            Taps { index, weight }
        })
        .collect()
}

/// Bicubic resample to exactly `width` x `height`
fn bicubic(input: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage, ResizeError> {
    if width == 0 || height == 0 {
        return Err(ResizeError::Resample(format!(
            "bicubic target {}x{} has a zero dimension",
            width, height
        )));
    }
    let (src_width, src_height) = input.dimensions();
    if src_width == 0 || src_height == 0 {
        return Err(ResizeError::Resample("bicubic input is empty".to_string()));
    }

    let columns = compute_taps(src_width, width);
    let rows = compute_taps(src_height, height);
    let mut output = RgbaImage::new(width, height);

    for (y, row) in rows.iter().enumerate() {
        for (x, column) in columns.iter().enumerate() {
            let mut acc = [0.0f32; 4];
            for (&sy, &wy) in row.index.iter().zip(row.weight.iter()) {
                if wy == 0.0 {
                    continue;
                }
                for (&sx, &wx) in column.index.iter().zip(column.weight.iter()) {
                    if wx == 0.0 {
                        continue;
                    }
                    let p = input.get_pixel(sx, sy);
                    let wt = wx * wy;
                    for (c, value) in acc.iter_mut().enumerate() {
                        *value += p[c] as f32 * wt;
                    }
                }
            }
            output.put_pixel(x as u32, y as u32, Rgba(acc.map(to_channel)));
        }
    }

    Ok(output)
}

fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
