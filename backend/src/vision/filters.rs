//! Pure per-stage image transforms used by the preprocessor.
//!
//! Every function here is deterministic: the same input always yields a
//! bit-identical output.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3, Axis};

/// Zeroes every pixel outside the circle inscribed in the image, centered at
/// `(w/2, h/2)` with radius `min(cx, cy, w - cx, h - cy)`.
pub fn circular_mask(img: &RgbImage) -> RgbImage {
    let (w, h) = img.dimensions();
    let (cx, cy) = (i64::from(w / 2), i64::from(h / 2));
    let radius = cx.min(cy).min(i64::from(w) - cx).min(i64::from(h) - cy);
    let r2 = radius * radius;

    RgbImage::from_fn(w, h, |x, y| {
        let dx = i64::from(x) - cx;
        let dy = i64::from(y) - cy;
        if dx * dx + dy * dy <= r2 {
            *img.get_pixel(x, y)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Kernel size used for 8-bit images when only sigma is given:
/// `round(6 * sigma + 1)`, forced odd.
pub fn kernel_size(sigma: f32) -> usize {
    let size = (f64::from(sigma) * 6.0 + 1.0).round() as usize;
    size.max(1) | 1
}

/// Normalized 1-D Gaussian kernel.
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let size = kernel_size(sigma);
    let half = (size / 2) as f64;
    let sigma = f64::from(sigma);
    let weights: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - half;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| (w / sum) as f32).collect()
}

/// Mirror index without repeating the edge sample: `dcb|abcd|cba`.
fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let len = len as isize;
    let period = 2 * (len - 1);
    let mut i = index.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as usize
}

/// Horizontal pass. Each row is padded once, then every output is a dot
/// product over a contiguous window.
fn blur_rows(plane: &Array2<f32>, kernel: &[f32]) -> Array2<f32> {
    let (rows, cols) = plane.dim();
    let half = (kernel.len() / 2) as isize;
    let mut out = Array2::<f32>::zeros((rows, cols));
    let mut padded = vec![0f32; cols + kernel.len() - 1];

    for (src, mut dst) in plane.outer_iter().zip(out.outer_iter_mut()) {
        for (i, slot) in padded.iter_mut().enumerate() {
            *slot = src[reflect_101(i as isize - half, cols)];
        }
        for (value, window) in dst.iter_mut().zip(padded.windows(kernel.len())) {
            *value = window.iter().zip(kernel).map(|(s, w)| s * w).sum();
        }
    }
    out
}

/// Vertical pass, accumulated one whole source row at a time.
fn blur_columns(plane: &Array2<f32>, kernel: &[f32]) -> Array2<f32> {
    let rows = plane.nrows();
    let half = (kernel.len() / 2) as isize;
    let mut out = Array2::<f32>::zeros(plane.dim());

    for (y, mut dst) in out.outer_iter_mut().enumerate() {
        for (k, weight) in kernel.iter().enumerate() {
            let src = reflect_101(y as isize + k as isize - half, rows);
            dst.scaled_add(*weight, &plane.row(src));
        }
    }
    out
}

/// Separable Gaussian blur with a reflect-101 border, rounded back to `u8`.
pub fn gaussian_blur(img: &RgbImage, sigma: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let pixels = rgb_to_array(img);

    let mut blurred = Array3::<f32>::zeros(pixels.dim());
    for channel in 0..3 {
        let plane = pixels.index_axis(Axis(2), channel).to_owned();
        let smoothed = blur_columns(&blur_rows(&plane, &kernel), &kernel);
        blurred.index_axis_mut(Axis(2), channel).assign(&smoothed);
    }

    RgbImage::from_fn(w, h, |x, y| {
        let px = |c: usize| blurred[[y as usize, x as usize, c]].round().clamp(0.0, 255.0) as u8;
        Rgb([px(0), px(1), px(2)])
    })
}

pub fn resize(img: &RgbImage, size: u32, filter: FilterType) -> RgbImage {
    if img.dimensions() == (size, size) {
        return img.clone();
    }
    imageops::resize(img, size, size, filter)
}

/// HWC float array scaled to `[0, 1]`.
pub fn normalize(img: &RgbImage) -> Array3<f32> {
    rgb_to_array(img).mapv(|v| v / 255.0)
}

fn rgb_to_array(img: &RgbImage) -> Array3<f32> {
    let (w, h) = img.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        f32::from(img.get_pixel(x as u32, y as u32)[c])
    })
}
