use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use std::f64::consts::PI;

use crate::error::SpectrogramError;

/// FFT window length in samples. Must stay a power of two.
pub const WINDOW_SIZE: usize = 4096;
/// Hop between consecutive frames, a quarter window.
pub const HOP_SIZE: usize = WINDOW_SIZE / 4;

/// Frames over time, each holding the positive-frequency half of one FFT.
pub type Spectrogram = Vec<Vec<Complex<f64>>>;

/// Computes the STFT grid of `samples`: Hann-windowed frames of
/// `WINDOW_SIZE` samples advancing by `HOP_SIZE`, keeping bins
/// `[0, WINDOW_SIZE / 2)` of each transform.
pub fn spectrogram(samples: &[f64]) -> Result<Spectrogram, SpectrogramError> {
    if samples.len() < WINDOW_SIZE {
        return Err(SpectrogramError::ShortSignal {
            have: samples.len(),
            need: WINDOW_SIZE,
        });
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(WINDOW_SIZE);
    let window = hann_window(WINDOW_SIZE);

    let frames = 1 + (samples.len() - WINDOW_SIZE) / HOP_SIZE;
    let mut grid = Vec::with_capacity(frames);
    let mut buf = vec![Complex::new(0.0, 0.0); WINDOW_SIZE];

    for frame in 0..frames {
        let start = frame * HOP_SIZE;
        for (slot, (&sample, &coeff)) in buf
            .iter_mut()
            .zip(samples[start..start + WINDOW_SIZE].iter().zip(&window))
        {
            *slot = Complex::new(sample * coeff, 0.0);
        }

        fft.process(&mut buf);

        let half = &buf[..WINDOW_SIZE / 2];
        if half
            .iter()
            .any(|c| !c.re.is_finite() || !c.im.is_finite())
        {
            return Err(SpectrogramError::Fft { frame });
        }
        grid.push(half.to_vec());
    }

    Ok(grid)
}

fn hann_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / n as f64).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 44_100;

    fn sine(freq: f64, seconds: f64) -> Vec<f64> {
        let n = (SAMPLE_RATE as f64 * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / SAMPLE_RATE as f64).sin())
            .collect()
    }

    #[test]
    fn rejects_signal_shorter_than_one_window() {
        let samples = vec![0.0; WINDOW_SIZE - 1];
        match spectrogram(&samples) {
            Err(SpectrogramError::ShortSignal { have, need }) => {
                assert_eq!(have, WINDOW_SIZE - 1);
                assert_eq!(need, WINDOW_SIZE);
            }
            other => panic!("expected ShortSignal, got {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn grid_dimensions_follow_hop_and_window() {
        let samples = sine(440.0, 1.0);
        let grid = spectrogram(&samples).unwrap();
        let expected_frames = 1 + (samples.len() - WINDOW_SIZE) / HOP_SIZE;
        assert_eq!(grid.len(), expected_frames);
        assert!(grid.iter().all(|row| row.len() == WINDOW_SIZE / 2));
    }

    #[test]
    fn exactly_one_window_yields_one_frame() {
        let samples = vec![0.25; WINDOW_SIZE];
        let grid = spectrogram(&samples).unwrap();
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn sine_energy_lands_in_the_expected_bin() {
        let samples = sine(440.0, 1.0);
        let grid = spectrogram(&samples).unwrap();

        let bin_size = SAMPLE_RATE as f64 / WINDOW_SIZE as f64;
        let expected = (440.0 / bin_size).round() as usize;

        let frame = &grid[0];
        let loudest = (0..frame.len())
            .max_by(|&a, &b| frame[a].norm().partial_cmp(&frame[b].norm()).unwrap())
            .unwrap();
        assert!(
            loudest.abs_diff(expected) <= 1,
            "loudest bin {loudest}, expected near {expected}"
        );
    }
}
