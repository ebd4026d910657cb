//! Mel spectrogram computation via STFT + mel filterbank.
//!
//! Matches the SadTalker (wav2lip lineage) audio front-end:
//! - Sample rate: 16000 Hz
//! - FFT size: 800 (401 frequency bins), Hann window, hop 200
//! - Mel bins: 80, range 55–7600 Hz, Slaney scale/norm
//! - Pre-emphasis 0.97 before the STFT
//! - dB conversion: `20*log10(max(x, 1e-5)) - ref_level_db`
//! - Symmetric normalization into [-max_abs_value, max_abs_value]

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::config::AudioConfig;

/// Mel spectrogram processor.
///
/// Pre-computes the Hann window, FFT plan, and mel filterbank on
/// construction. [`MelSpectrogram::process`] converts mono audio at the
/// configured sample rate into a normalized mel spectrogram.
pub struct MelSpectrogram {
    config: AudioConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
}

impl MelSpectrogram {
    /// Create a new mel spectrogram processor with the given config.
    pub fn new(config: AudioConfig) -> Self {
        let window = hann_window(config.win_length);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            filterbank,
            fft,
        }
    }

    /// Compute a normalized mel spectrogram from raw audio samples.
    ///
    /// Input: mono audio at the configured sample rate.
    /// Output: `[n_mels, num_frames]`, values in `[-max_abs, max_abs]`.
    pub fn process(&self, samples: &[f32]) -> Vec<Vec<f64>> {
        let emphasized = preemphasis(samples, self.config.preemphasis);

        // Reflect-pad n_fft/2 on both sides (librosa center=True).
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&emphasized, pad, pad);

        let magnitudes = self.stft(&padded);

        let num_frames = magnitudes.len();
        let mut mel_spec = vec![vec![0.0; num_frames]; self.config.n_mels];

        for (frame_idx, frame_magnitudes) in magnitudes.iter().enumerate() {
            for (mel_idx, filter) in self.filterbank.iter().enumerate() {
                let mut sum = 0.0;
                for (bin_idx, &weight) in filter.iter().enumerate() {
                    if weight > 0.0 {
                        sum += weight * frame_magnitudes[bin_idx];
                    }
                }
                let db = amp_to_db(sum) - self.config.ref_level_db;
                mel_spec[mel_idx][frame_idx] = self.normalize(db);
            }
        }

        mel_spec
    }

    /// Symmetric normalization of a dB value into [-max_abs, max_abs].
    fn normalize(&self, db: f64) -> f64 {
        let max_abs = self.config.max_abs_value;
        let min_db = self.config.min_level_db;
        let scaled = 2.0 * max_abs * ((db - min_db) / -min_db) - max_abs;
        scaled.clamp(-max_abs, max_abs)
    }

    /// Short-time Fourier transform. Returns magnitude spectra per frame.
    ///
    /// Each inner vec has `n_fft/2 + 1` elements (one-sided).
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;

        let num_frames = (padded.len().saturating_sub(n_fft)) / hop + 1;
        let mut frames = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            let end = start + n_fft;
            if end > padded.len() {
                break;
            }

            let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();

            self.fft.process(&mut buffer);

            let magnitudes: Vec<f64> = buffer[..num_bins]
                .iter()
                .map(|c| (c.re * c.re + c.im * c.im).sqrt())
                .collect();

            frames.push(magnitudes);
        }

        frames
    }
}

/// First-order pre-emphasis filter: `y[n] = x[n] - k * x[n-1]`.
fn preemphasis(samples: &[f32], k: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = 0.0f64;
    for &s in samples {
        let x = s as f64;
        out.push(x - k * prev);
        prev = x;
    }
    out
}

/// Amplitude to dB with a 1e-5 floor: `20 * log10(max(x, 1e-5))`.
fn amp_to_db(x: f64) -> f64 {
    20.0 * x.max(1e-5).log10()
}

/// Generate a Hann window of the given length.
fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad a signal on both sides.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let total = pad_left + len + pad_right;
    let mut padded = Vec::with_capacity(total);

    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }

    padded.extend_from_slice(signal);

    for i in 0..pad_right {
        let idx = len.saturating_sub(2 + i);
        padded.push(signal[idx]);
    }

    padded
}

/// Build a Slaney-normalized mel filterbank.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);

    let mel_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
        .collect();

    let hz_points: Vec<f64> = mel_points.iter().map(|&m| mel_to_hz_slaney(m)).collect();

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    let mut filters = Vec::with_capacity(n_mels);

    for i in 0..n_mels {
        let f_left = hz_points[i];
        let f_center = hz_points[i + 1];
        let f_right = hz_points[i + 2];

        // Slaney normalization: 2 / (f_right - f_left)
        let norm = 2.0 / (f_right - f_left);

        let filter: Vec<f64> = bin_freqs
            .iter()
            .map(|&f| {
                if f < f_left || f > f_right {
                    0.0
                } else if f <= f_center {
                    norm * (f - f_left) / (f_center - f_left)
                } else {
                    norm * (f_right - f) / (f_right - f_center)
                }
            })
            .collect();

        filters.push(filter);
    }

    filters
}

/// Convert frequency in Hz to Slaney mel scale.
///
/// Below 1000 Hz: linear (mel = 3 * f / 200).
/// Above 1000 Hz: logarithmic (mel = 15 + 27 * ln(f / 1000) / ln(6.4)).
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

/// Convert Slaney mel scale to frequency in Hz.
fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}
