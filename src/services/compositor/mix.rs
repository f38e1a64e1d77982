use crate::utils::audio::WavClip;
use std::time::Duration;

/// Mono float timeline that narration clips are scheduled onto.
#[derive(Debug, Clone)]
pub struct AudioMix {
    sample_rate: u32,
    samples: Vec<f32>,
}

/// Finished narration track handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedAudio {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

fn sample_index(at: Duration, sample_rate: u32) -> usize {
    (at.as_secs_f64() * sample_rate as f64).round() as usize
}

impl AudioMix {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: Vec::new(),
        }
    }

    /// Adds `clip` starting at `at`, converting it to the mix rate.
    pub fn schedule(&mut self, at: Duration, clip: &WavClip) {
        let start = sample_index(at, self.sample_rate);
        let pcm = clip.resampled(self.sample_rate);
        let end = start + pcm.len();
        if self.samples.len() < end {
            self.samples.resize(end, 0.0);
        }
        for (dst, src) in self.samples[start..end].iter_mut().zip(pcm) {
            *dst += src;
        }
    }

    /// Pads with silence or truncates to exactly `total`.
    pub fn finish(mut self, total: Duration) -> MixedAudio {
        self.samples.resize(sample_index(total, self.sample_rate), 0.0);
        for s in self.samples.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        MixedAudio {
            sample_rate: self.sample_rate,
            samples: self.samples,
        }
    }
}

impl MixedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Raw little-endian f32 samples, as ffmpeg's `f32le` demuxer expects.
    pub fn to_f32le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(rate: u32, samples: Vec<f32>) -> WavClip {
        WavClip {
            sample_rate: rate,
            channels: 1,
            samples,
        }
    }

    #[test]
    fn test_clips_land_at_their_start_instant() {
        let mut mix = AudioMix::new(10);
        mix.schedule(Duration::from_millis(500), &clip(10, vec![0.25; 3]));
        mix.schedule(Duration::from_secs(1), &clip(10, vec![0.5; 2]));
        let out = mix.finish(Duration::from_millis(1500));

        assert_eq!(out.samples.len(), 15);
        assert_eq!(&out.samples[..5], &[0.0; 5]);
        assert_eq!(&out.samples[5..8], &[0.25; 3]);
        assert_eq!(&out.samples[10..12], &[0.5; 2]);
        assert_eq!(&out.samples[12..], &[0.0; 3]);
        assert_eq!(out.duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_overlaps_are_summed_and_clamped() {
        let mut mix = AudioMix::new(4);
        mix.schedule(Duration::ZERO, &clip(4, vec![0.75; 4]));
        mix.schedule(Duration::ZERO, &clip(4, vec![0.5; 2]));
        let out = mix.finish(Duration::from_secs(1));
        assert_eq!(out.samples, vec![1.0, 1.0, 0.75, 0.75]);
    }

    #[test]
    fn test_resamples_to_mix_rate() {
        let mut mix = AudioMix::new(8);
        mix.schedule(Duration::ZERO, &clip(16, vec![0.1; 16]));
        let out = mix.finish(Duration::from_secs(1));
        assert_eq!(out.samples.len(), 8);
        assert!(out.samples.iter().all(|s| (*s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_f32le_encoding() {
        let audio = MixedAudio {
            sample_rate: 1,
            samples: vec![1.0, -0.5],
        };
        let bytes = audio.to_f32le_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-0.5f32).to_le_bytes());
    }
}
