use ordered_float::OrderedFloat;
use rustfft::num_complex::Complex;

use crate::spectrogram::HOP_SIZE;

/// Noise floor for peak magnitudes, on the scale of [-1, 1] input samples.
pub const PEAK_THRESHOLD: f64 = 0.02;

/// Frequency bands in Hz; lower bound inclusive, upper exclusive.
pub const BANDS_HZ: [(f64, f64); 6] = [
    (40.0, 80.0),
    (80.0, 120.0),
    (120.0, 180.0),
    (180.0, 300.0),
    (300.0, 2000.0),
    (2000.0, 5000.0),
];

/// One constellation point: a strict local maximum of the magnitude grid
/// that won its frequency band for its frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    pub frame: usize,
    pub time_ms: f64,
    pub freq_bin: usize,
    pub magnitude: f64,
}

/// Extracts the peak constellation from an STFT grid, ordered by
/// (frame ascending, bin ascending). Per frame and band, the strongest bin
/// that is a strict local maximum over its in-range 3x3 neighbourhood is
/// kept, provided its magnitude exceeds `PEAK_THRESHOLD`.
pub fn pick_peaks(grid: &[Vec<Complex<f64>>], sample_rate: u32) -> Vec<Peak> {
    let Some(first) = grid.first() else {
        return Vec::new();
    };
    let bins = first.len();

    let magnitudes: Vec<Vec<f64>> = grid
        .iter()
        .map(|row| row.iter().map(|c| c.norm()).collect())
        .collect();

    let bands = band_bin_ranges(sample_rate, bins);
    let frame_ms = HOP_SIZE as f64 * 1000.0 / sample_rate as f64;

    let mut peaks = Vec::new();
    for (t, row) in magnitudes.iter().enumerate() {
        for &(lo, hi) in &bands {
            // Ties go to the lower bin: only a strictly larger magnitude
            // displaces the current best.
            let best = (lo..=hi)
                .filter(|&f| is_local_max(&magnitudes, t, f))
                .max_by_key(|&f| (OrderedFloat(row[f]), std::cmp::Reverse(f)));

            if let Some(f) = best {
                if row[f] > PEAK_THRESHOLD {
                    peaks.push(Peak {
                        frame: t,
                        time_ms: t as f64 * frame_ms,
                        freq_bin: f,
                        magnitude: row[f],
                    });
                }
            }
        }
    }
    peaks
}

/// Converts `BANDS_HZ` to inclusive bin ranges for the given rate.
/// Bands clamp at the last positive-frequency bin; bands that end up empty
/// or inverted are omitted.
pub fn band_bin_ranges(sample_rate: u32, bins: usize) -> Vec<(usize, usize)> {
    let nyquist = sample_rate as f64 / 2.0;
    let bin_size = nyquist / bins as f64;

    let mut ranges = Vec::with_capacity(BANDS_HZ.len());
    for (lo_hz, hi_hz) in BANDS_HZ {
        let lo = (lo_hz / bin_size).ceil() as i64;
        let mut hi = (hi_hz / bin_size).floor() as i64;
        // The upper bound in Hz is exclusive.
        if hi as f64 * bin_size >= hi_hz {
            hi -= 1;
        }
        let hi = hi.min(bins as i64 - 1);
        if lo > hi || hi < 0 {
            continue;
        }
        ranges.push((lo as usize, hi as usize));
    }
    ranges
}

/// Strict local maximum over the 3x3 neighbourhood; cells outside the grid
/// do not disqualify.
fn is_local_max(magnitudes: &[Vec<f64>], t: usize, f: usize) -> bool {
    let value = magnitudes[t][f];
    let frames = magnitudes.len() as i64;
    let bins = magnitudes[t].len() as i64;

    for dt in -1i64..=1 {
        for df in -1i64..=1 {
            if dt == 0 && df == 0 {
                continue;
            }
            let (nt, nf) = (t as i64 + dt, f as i64 + df);
            if nt < 0 || nt >= frames || nf < 0 || nf >= bins {
                continue;
            }
            if magnitudes[nt as usize][nf as usize] >= value {
                return false;
            }
        }
    }
    true
}
