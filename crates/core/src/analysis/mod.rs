use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{Result, SoundstageError};

const BEAT_GAIN: f32 = 12.0;
const LOW_BAND_HZ: f32 = 250.0;
const HIGH_BAND_HZ: f32 = 4_000.0;

/// Feature set computed for one block pulled from the active producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFrame {
    pub rms: f32,
    /// Normalised [0, 1] spectral centroid where 1.0 is Nyquist.
    pub spectral_centroid: f32,
    /// Share of spectral magnitude below 250 Hz.
    pub low_band_energy: f32,
    /// Share of spectral magnitude above 4 kHz.
    pub high_band_energy: f32,
    pub beat_confidence: f32,
}

/// Per-frame spectrum analyser feeding the visualiser.
pub struct SpectrumAnalyzer {
    sample_rate: u32,
    last_rms: f32,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            last_rms: 0.0,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Forgets the beat history, e.g. after the input source changed.
    pub fn reset(&mut self) {
        self.last_rms = 0.0;
    }

    pub fn analyse(&mut self, samples: &[f32]) -> Result<AnalysisFrame> {
        if samples.len() < 2 {
            return Err(SoundstageError::InvalidInput(
                "analysis requires blocks with at least two samples",
            ));
        }

        let rms = compute_rms(samples);
        let beat_confidence = ((rms - self.last_rms).max(0.0) * BEAT_GAIN).clamp(0.0, 1.0);
        self.last_rms = rms;

        let sample_rate = self.sample_rate as f32;
        let len = samples.len();
        let fft = self.prepare_fft(len);
        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let bin_hz = sample_rate / len as f32;
        let mut total = 0.0;
        let mut weighted = 0.0;
        let mut low = 0.0;
        let mut high = 0.0;
        for (i, bin) in fft.spectrum.iter().enumerate() {
            let magnitude = bin.norm();
            let freq = i as f32 * bin_hz;
            total += magnitude;
            weighted += magnitude * freq;
            if freq < LOW_BAND_HZ {
                low += magnitude;
            } else if freq > HIGH_BAND_HZ {
                high += magnitude;
            }
        }

        if total <= f32::EPSILON {
            return Ok(AnalysisFrame {
                rms,
                beat_confidence,
                ..Default::default()
            });
        }

        let nyquist = sample_rate * 0.5;
        Ok(AnalysisFrame {
            rms,
            spectral_centroid: (weighted / total / nyquist).clamp(0.0, 1.0),
            low_band_energy: low / total,
            high_band_energy: high / total,
            beat_confidence,
        })
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if let Some(fft) = self.fft.take().filter(|fft| fft.size == size) {
            return self.fft.insert(fft);
        }

        let plan = self.fft_planner.plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        self.fft.insert(FftResources {
            size,
            plan,
            scratch,
            spectrum,
            input,
        })
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("last_rms", &self.last_rms)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn silence_has_no_features() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        let frame = analyzer.analyse(&vec![0.0; 1024]).unwrap();
        assert_eq!(frame, AnalysisFrame::default());
    }

    #[test]
    fn low_tone_lands_in_low_band() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        let frame = analyzer.analyse(&sine(100.0, 48_000, 2048)).unwrap();

        assert!(frame.rms > 0.5);
        assert!(frame.low_band_energy > 0.5, "{frame:?}");
        assert!(frame.high_band_energy < 0.1, "{frame:?}");
    }

    #[test]
    fn loud_onset_reports_beat() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        analyzer.analyse(&vec![0.0; 512]).unwrap();
        let frame = analyzer.analyse(&vec![0.8; 512]).unwrap();
        assert_eq!(frame.beat_confidence, 1.0);
    }

    #[test]
    fn rejects_tiny_blocks() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        assert!(analyzer.analyse(&[0.5]).is_err());
    }
}
