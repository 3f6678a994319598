//! PSNR and SSIM over I420 frames of identical geometry

use crate::source::PlanarFrame;

/// Reported for bit-identical frames and used as the upper bound
pub const MAX_PSNR: f64 = 128.0;

// (0.01 * 255)^2 and (0.03 * 255)^2 scaled by 64^2 for 8x8 windows
const CC1: i64 = 26_634;
const CC2: i64 = 239_708;
const WINDOW: usize = 8;
const STEP: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub psnr: f64,
    pub ssim: f64,
}

/// Score a reconstruction against its original
pub fn score(original: &PlanarFrame, reconstruction: &PlanarFrame) -> Score {
    Score {
        psnr: psnr(original, reconstruction),
        ssim: ssim(original, reconstruction),
    }
}

fn assert_comparable(a: &PlanarFrame, b: &PlanarFrame) {
    assert!(
        a.same_geometry(b),
        "quality metrics need identical geometry ({}x{} vs {}x{})",
        a.width(),
        a.height(),
        b.width(),
        b.height()
    );
}

fn sum_square_error(a: &[u8], b: &[u8]) -> u64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let diff = i64::from(x) - i64::from(y);
            (diff * diff) as u64
        })
        .sum()
}

/// Peak signal-to-noise ratio in dB, pooled over all three planes
pub fn psnr(a: &PlanarFrame, b: &PlanarFrame) -> f64 {
    assert_comparable(a, b);
    let sse = sum_square_error(a.as_bytes(), b.as_bytes());
    let samples = a.len() as f64;
    if sse == 0 {
        return MAX_PSNR;
    }
    let mse = sse as f64 / samples;
    (10.0 * (255.0 * 255.0 / mse).log10()).min(MAX_PSNR)
}

/// Structural similarity, weighted 0.8 luma and 0.1 per chroma plane
pub fn ssim(a: &PlanarFrame, b: &PlanarFrame) -> f64 {
    assert_comparable(a, b);
    let (width, height) = (a.width() as usize, a.height() as usize);
    let (chroma_width, chroma_height) = (a.chroma_width() as usize, a.chroma_height() as usize);

    let y = plane_ssim(a.y(), b.y(), width, height);
    let u = plane_ssim(a.u(), b.u(), chroma_width, chroma_height);
    let v = plane_ssim(a.v(), b.v(), chroma_width, chroma_height);
    (0.8 * y + 0.1 * (u + v)).clamp(-1.0, 1.0)
}

/// Mean SSIM of 8x8 windows placed on a 4 sample grid. A plane smaller
/// than one window is treated as a single window.
fn plane_ssim(a: &[u8], b: &[u8], width: usize, height: usize) -> f64 {
    if width < WINDOW || height < WINDOW {
        return window_ssim(a, b, width, 0, 0, width, height);
    }
    let mut total = 0.0;
    let mut windows = 0usize;
    let mut row = 0;
    while row + WINDOW < height {
        let mut col = 0;
        while col + WINDOW < width {
            total += window_ssim(a, b, width, col, row, WINDOW, WINDOW);
            windows += 1;
            col += STEP;
        }
        row += STEP;
    }
    if windows == 0 {
        // Exactly one window tall or wide
        return window_ssim(a, b, width, 0, 0, width.min(WINDOW), height.min(WINDOW));
    }
    total / windows as f64
}

fn window_ssim(
    a: &[u8],
    b: &[u8],
    stride: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) -> f64 {
    let (mut sum_a, mut sum_b, mut sum_sq_a, mut sum_sq_b, mut sum_ab) = (0i64, 0i64, 0i64, 0i64, 0i64);
    for row in y..y + height {
        for col in x..x + width {
            let pa = i64::from(a[row * stride + col]);
            let pb = i64::from(b[row * stride + col]);
            sum_a += pa;
            sum_b += pb;
            sum_sq_a += pa * pa;
            sum_sq_b += pb * pb;
            sum_ab += pa * pb;
        }
    }

    let count = (width * height) as i64;
    if count == 0 {
        return 1.0;
    }
    // Whole-plane windows can be large enough to overflow i64 products
    let (sum_a, sum_b, sum_sq_a, sum_sq_b, sum_ab, count) = (
        i128::from(sum_a),
        i128::from(sum_b),
        i128::from(sum_sq_a),
        i128::from(sum_sq_b),
        i128::from(sum_ab),
        i128::from(count),
    );
    let c1 = (i128::from(CC1) * count * count) >> 12;
    let c2 = (i128::from(CC2) * count * count) >> 12;
    let product = sum_a * sum_b;
    let numerator = (2 * product + c1) * (2 * count * sum_ab - 2 * product + c2);
    let denominator = (sum_a * sum_a + sum_b * sum_b + c1)
        * (count * sum_sq_a - sum_a * sum_a + count * sum_sq_b - sum_b * sum_b + c2);
    if denominator == 0 {
        return 1.0;
    }
    numerator as f64 / denominator as f64
}
