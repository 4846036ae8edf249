//! Normalized cross-correlation score maps.
//!
//! Scores follow the correlation-coefficient form: both the template and each
//! frame window are mean-centred per channel before correlating, and the sum is
//! normalised by the product of their energies. A perfect match scores 1.0,
//! flat windows score 0.0. Window statistics come from per-channel integral
//! images so only the cross term is evaluated per template pixel.

use image::GrayImage;
use rayon::prelude::*;

use super::frame::BgrFrame;

const ENERGY_EPSILON: f64 = 1e-9;

/// Correlation score for every template placement inside the frame.
#[derive(Debug, Clone)]
pub struct ScoreMap {
    /// Row-major scores
    pub data: Vec<f32>,
    /// Number of horizontal placements
    pub width: u32,
    /// Number of vertical placements
    pub height: u32,
}

impl ScoreMap {
    /// Score of the placement whose top-left corner is at (x, y).
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    /// Location and value of the global maximum; the first one in row-major
    /// order wins ties.
    pub fn max_loc(&self) -> (u32, u32, f32) {
        let mut best = (0u32, 0u32, f32::NEG_INFINITY);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = self.get(x, y);
                if v > best.2 {
                    best = (x, y, v);
                }
            }
        }
        best
    }

    /// All placements scoring at least `threshold`, in row-major order.
    pub fn at_or_above(&self, threshold: f32) -> Vec<(u32, u32, f32)> {
        let width = self.width as usize;
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v >= threshold)
            .map(|(i, &v)| ((i % width) as u32, (i / width) as u32, v))
            .collect()
    }
}

/// Correlation of a single-channel template over a single-channel frame.
///
/// Returns `None` when the template is empty or larger than the frame.
pub fn ccoeff_normed_gray(frame: &GrayImage, templ: &GrayImage) -> Option<ScoreMap> {
    ccoeff_normed(
        frame.as_raw(),
        frame.width(),
        frame.height(),
        templ.as_raw(),
        templ.width(),
        templ.height(),
        1,
    )
}

/// Correlation of a three-channel template over a three-channel frame.
pub fn ccoeff_normed_bgr(frame: &BgrFrame, templ: &BgrFrame) -> Option<ScoreMap> {
    ccoeff_normed(
        frame.as_raw(),
        frame.width(),
        frame.height(),
        templ.as_raw(),
        templ.width(),
        templ.height(),
        3,
    )
}

/// Template dimensions after scaling, truncated toward zero.
pub fn scaled_dims(width: u32, height: u32, scale: f64) -> (u32, u32) {
    (
        (width as f64 * scale) as u32,
        (height as f64 * scale) as u32,
    )
}

/// Bilinear rescale of a grayscale template.
pub fn resize_gray(templ: &GrayImage, width: u32, height: u32) -> GrayImage {
    image::imageops::resize(templ, width, height, image::imageops::FilterType::Triangle)
}

struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl Integral {
    fn build(data: &[u8], width: usize, height: usize, channels: usize, channel: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0.0f64; stride * (height + 1)];
        let mut sum_sq = vec![0.0f64; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..width {
                let v = data[(y * width + x) * channels + channel] as f64;
                row_sum += v;
                row_sq += v * v;
                let at = (y + 1) * stride + x + 1;
                sum[at] = sum[at - stride] + row_sum;
                sum_sq[at] = sum_sq[at - stride] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let a = y * s + x;
        let b = y * s + x + w;
        let c = (y + h) * s + x;
        let d = (y + h) * s + x + w;
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sum_sq[d] - self.sum_sq[b] - self.sum_sq[c] + self.sum_sq[a],
        )
    }
}

fn ccoeff_normed(
    image: &[u8],
    iw: u32,
    ih: u32,
    templ: &[u8],
    tw: u32,
    th: u32,
    channels: usize,
) -> Option<ScoreMap> {
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }
    let (iw, ih, tw, th) = (iw as usize, ih as usize, tw as usize, th as usize);
    let out_w = iw - tw + 1;
    let out_h = ih - th + 1;
    let n = (tw * th) as f64;

    // Mean-centred template, per channel
    let mut centred = vec![0.0f64; templ.len()];
    let mut t_energy = 0.0;
    for c in 0..channels {
        let mean = templ.iter().skip(c).step_by(channels).map(|&v| v as f64).sum::<f64>() / n;
        for (i, &v) in templ.iter().enumerate().skip(c).step_by(channels) {
            let d = v as f64 - mean;
            centred[i] = d;
            t_energy += d * d;
        }
    }

    let integrals: Vec<Integral> = (0..channels)
        .map(|c| Integral::build(image, iw, ih, channels, c))
        .collect();

    let row_len = tw * channels;
    let mut data = vec![0.0f32; out_w * out_h];
    data.par_chunks_mut(out_w).enumerate().for_each(|(y, row)| {
        for (x, out) in row.iter_mut().enumerate() {
            let mut w_energy = 0.0;
            for integral in &integrals {
                let (s, sq) = integral.window(x, y, tw, th);
                w_energy += sq - s * s / n;
            }

            let denom = (w_energy * t_energy).sqrt();
            if !(denom > ENERGY_EPSILON) {
                *out = 0.0;
                continue;
            }

            let mut cross = 0.0f64;
            for j in 0..th {
                let src = &image[((y + j) * iw + x) * channels..][..row_len];
                let tpl = &centred[j * row_len..][..row_len];
                cross += src
                    .iter()
                    .zip(tpl)
                    .map(|(&a, &b)| a as f64 * b)
                    .sum::<f64>();
            }
            *out = (cross / denom).clamp(-1.0, 1.0) as f32;
        }
    });

    Some(ScoreMap {
        data,
        width: out_w as u32,
        height: out_h as u32,
    })
}
