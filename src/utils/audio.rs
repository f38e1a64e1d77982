use anyhow::{anyhow, Result};
use std::time::Duration;

pub const WAV_HEADER_LEN: usize = 44;

/// Wraps headerless 16-bit mono little-endian PCM into a minimal WAV container.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());

    // RIFF [4] + Size [4] + WAVE [4]
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    // fmt chunk: PCM (1), Mono (1), SampleRate, ByteRate, BlockAlign (2), Bits (16)
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

/// Decoded PCM16 WAV, downmixed to mono floats in [-1, 1].
#[derive(Debug, Clone)]
pub struct WavClip {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl WavClip {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Linear resample to `target_rate`.
    pub fn resampled(&self, target_rate: u32) -> Vec<f32> {
        if target_rate == self.sample_rate || self.samples.is_empty() {
            return self.samples.clone();
        }
        if self.sample_rate == 0 || target_rate == 0 {
            return Vec::new();
        }
        let ratio = self.sample_rate as f64 / target_rate as f64;
        let out_len = (self.samples.len() as f64 / ratio).round() as usize;
        let last = self.samples.len() - 1;
        (0..out_len)
            .map(|i| {
                let pos = i as f64 * ratio;
                let idx = (pos.floor() as usize).min(last);
                let next = (idx + 1).min(last);
                let frac = (pos - idx as f64) as f32;
                self.samples[idx] * (1.0 - frac) + self.samples[next] * frac
            })
            .collect()
    }
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| anyhow!("Unexpected end of WAV data"))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| anyhow!("Unexpected end of WAV data"))
}

/// Parses a RIFF/WAVE buffer holding 16-bit integer PCM. Unknown chunks are skipped.
pub fn decode_wav(bytes: &[u8]) -> Result<WavClip> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None;
    let mut data: Option<&[u8]> = None;
    let mut pos = 12;

    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_size = read_u32(bytes, pos + 4)? as usize;
        let body_start = pos + 8;
        // Streams written before their length was known carry a bogus data size.
        let body_end = (body_start + chunk_size).min(bytes.len());

        if chunk_id == b"fmt " {
            let format = read_u16(bytes, body_start)?;
            let channels = read_u16(bytes, body_start + 2)?;
            let sample_rate = read_u32(bytes, body_start + 4)?;
            let bits = read_u16(bytes, body_start + 14)?;
            fmt = Some((format, channels, sample_rate, bits));
        } else if chunk_id == b"data" {
            data = Some(&bytes[body_start..body_end]);
            break;
        }

        // Chunks are word aligned.
        pos = body_start + chunk_size + (chunk_size & 1);
    }

    let (format, channels, sample_rate, bits) = fmt.ok_or_else(|| anyhow!("Missing fmt chunk"))?;
    let data = data.ok_or_else(|| anyhow!("Missing data chunk"))?;

    if format != 1 || bits != 16 {
        return Err(anyhow!(
            "Unsupported WAV encoding (format {}, {} bits); expected 16-bit PCM",
            format,
            bits
        ));
    }
    if channels == 0 {
        return Err(anyhow!("WAV declares zero channels"));
    }
    if sample_rate == 0 {
        return Err(anyhow!("WAV declares a zero sample rate"));
    }

    let frame_bytes = 2 * channels as usize;
    let samples = data
        .chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(2)
                .map(|s| i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0)
                .sum();
            sum / channels as f32
        })
        .collect();

    Ok(WavClip {
        sample_rate,
        channels,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_layout() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let wav = pcm16_to_wav(&payload, 24000);

        assert_eq!(wav.len(), WAV_HEADER_LEN + payload.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(read_u32(&wav, 4).unwrap(), 36 + 256);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(read_u32(&wav, 16).unwrap(), 16);
        assert_eq!(read_u16(&wav, 20).unwrap(), 1);
        assert_eq!(read_u16(&wav, 22).unwrap(), 1);
        assert_eq!(read_u32(&wav, 24).unwrap(), 24000);
        assert_eq!(read_u32(&wav, 28).unwrap(), 48000);
        assert_eq!(read_u16(&wav, 32).unwrap(), 2);
        assert_eq!(read_u16(&wav, 34).unwrap(), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(read_u32(&wav, 40).unwrap(), 256);
        assert_eq!(&wav[44..], payload.as_slice());
    }

    #[test]
    fn test_empty_payload_is_header_only() {
        let wav = pcm16_to_wav(&[], 16000);
        assert_eq!(wav.len(), WAV_HEADER_LEN);
        assert_eq!(read_u32(&wav, 40).unwrap(), 0);
    }

    #[test]
    fn test_decode_reports_duration() -> Result<()> {
        // One second of silence at 24 kHz.
        let wav = pcm16_to_wav(&vec![0u8; 48000], 24000);
        let clip = decode_wav(&wav)?;
        assert_eq!(clip.sample_rate, 24000);
        assert_eq!(clip.samples.len(), 24000);
        assert_eq!(clip.duration(), Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn test_decode_downmixes_stereo_and_skips_unknown_chunks() -> Result<()> {
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&0u32.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&3u32.to_le_bytes());
        wav.extend_from_slice(&[1, 2, 3, 0]); // odd chunk + pad byte
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&8000u32.to_le_bytes());
        wav.extend_from_slice(&32000u32.to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&4u32.to_le_bytes());
        wav.extend_from_slice(&16384i16.to_le_bytes());
        wav.extend_from_slice(&(-16384i16).to_le_bytes());

        let clip = decode_wav(&wav)?;
        assert_eq!(clip.channels, 2);
        assert_eq!(clip.samples, vec![0.0]);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_non_wav() {
        assert!(decode_wav(b"ID3\x03 not a wav").is_err());
    }

    #[test]
    fn test_resample_halves_length() {
        let clip = WavClip {
            sample_rate: 48000,
            channels: 1,
            samples: vec![0.5; 480],
        };
        let out = clip.resampled(24000);
        assert_eq!(out.len(), 240);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_zero_sample_rate_is_rejected() {
        let wav = pcm16_to_wav(&[0u8; 20], 0);
        assert!(decode_wav(&wav).is_err());

        let clip = WavClip {
            sample_rate: 0,
            channels: 1,
            samples: vec![0.5; 10],
        };
        assert!(clip.resampled(24000).is_empty());
        assert_eq!(clip.duration(), Duration::ZERO);
    }
}
