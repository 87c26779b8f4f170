//! 2-D magnitude spectrum and periodic-peak counting.
//!
//! A phone or monitor photographed by a camera aliases its pixel grid into a
//! moiré pattern, which shows up as a few isolated high-energy peaks away from
//! the centre of the frequency spectrum. Natural skin and backgrounds spread
//! their energy smoothly instead.

use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array2;

/// Resample a grayscale patch onto a square `size × size` grid with its mean
/// removed. Returns `None` for an empty patch or a size that is not a power
/// of two.
pub fn centred_grid(patch: &GrayImage, size: usize) -> Option<Array2<f32>> {
    if patch.width() == 0 || patch.height() == 0 || !size.is_power_of_two() {
        return None;
    }
    let side = u32::try_from(size).ok()?;
    let resized = image::imageops::resize(patch, side, side, FilterType::Triangle);

    let mut grid = Array2::<f32>::zeros((size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        grid[[y as usize, x as usize]] = pixel.0[0] as f32;
    }
    let mean = grid.mean()?;
    grid.mapv_inplace(|v| v - mean);
    Some(grid)
}

/// Magnitude of the 2-D DFT, shifted so the zero frequency sits at the centre.
///
/// The grid must be square with a power-of-two side.
pub fn shifted_magnitude(grid: &Array2<f32>) -> Option<Array2<f32>> {
    let (rows, cols) = grid.dim();
    if rows != cols || !rows.is_power_of_two() {
        return None;
    }
    let n = rows;

    let mut re = grid.clone();
    let mut im = Array2::<f32>::zeros((n, n));
    let mut buf_re = vec![0.0f32; n];
    let mut buf_im = vec![0.0f32; n];

    // Rows, then columns.
    for axis in 0..2 {
        for k in 0..n {
            for i in 0..n {
                let idx = if axis == 0 { [k, i] } else { [i, k] };
                buf_re[i] = re[idx];
                buf_im[i] = im[idx];
            }
            fft_in_place(&mut buf_re, &mut buf_im);
            for i in 0..n {
                let idx = if axis == 0 { [k, i] } else { [i, k] };
                re[idx] = buf_re[i];
                im[idx] = buf_im[i];
            }
        }
    }

    let half = n / 2;
    let mut shifted = Array2::<f32>::zeros((n, n));
    for ((r, c), value) in re.indexed_iter() {
        let magnitude = (value * value + im[[r, c]] * im[[r, c]]).sqrt();
        shifted[[(r + half) % n, (c + half) % n]] = magnitude;
    }
    Some(shifted)
}

/// Count isolated spectral peaks.
///
/// Zeroes the `mask_radius` square around the centre (illumination and the
/// face itself live there), then counts how many of the `candidates`
/// strongest bins exceed `mean + sigma · std` of the whole spectrum.
pub fn count_peaks(
    spectrum: &Array2<f32>,
    mask_radius: usize,
    sigma: f32,
    candidates: usize,
) -> usize {
    let (rows, cols) = spectrum.dim();
    if rows == 0 || cols == 0 || candidates == 0 {
        return 0;
    }

    let mut masked = spectrum.clone();
    let (cr, cc) = (rows / 2, cols / 2);
    let r0 = cr.saturating_sub(mask_radius);
    let c0 = cc.saturating_sub(mask_radius);
    let r1 = (cr + mask_radius).min(rows);
    let c1 = (cc + mask_radius).min(cols);
    masked
        .slice_mut(ndarray::s![r0..r1, c0..c1])
        .fill(0.0);

    let Some(mean) = masked.mean() else {
        return 0;
    };
    let std = masked.std(0.0);
    if !mean.is_finite() || !std.is_finite() {
        return 0;
    }
    let cutoff = mean + sigma * std;

    let mut values: Vec<f32> = masked.iter().copied().collect();
    let k = candidates.min(values.len());
    let split = values.len() - k;
    values.select_nth_unstable_by(split, |a, b| a.total_cmp(b));
    values[split..].iter().filter(|&&v| v > cutoff).count()
}

/// Iterative radix-2 Cooley–Tukey FFT. Length must be a power of two.
fn fft_in_place(re: &mut [f32], im: &mut [f32]) {
    let n = re.len();
    if n < 2 {
        return;
    }

    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            re.swap(i, j);
            im.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * std::f32::consts::PI / len as f32;
        let (w_im, w_re) = angle.sin_cos();
        for start in (0..n).step_by(len) {
            let (mut cur_re, mut cur_im) = (1.0f32, 0.0f32);
            for k in 0..len / 2 {
                let a = start + k;
                let b = a + len / 2;
                let t_re = re[b] * cur_re - im[b] * cur_im;
                let t_im = re[b] * cur_im + im[b] * cur_re;
                re[b] = re[a] - t_re;
                im[b] = im[a] - t_im;
                re[a] += t_re;
                im[a] += t_im;
                let next_re = cur_re * w_re - cur_im * w_im;
                cur_im = cur_re * w_im + cur_im * w_re;
                cur_re = next_re;
            }
        }
        len <<= 1;
    }
}
