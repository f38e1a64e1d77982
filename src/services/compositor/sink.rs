use crate::services::compositor::mix::MixedAudio;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SinkConfig {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Destination for rendered RGBA frames and the mixed narration track.
///
/// `begin` is called once before the first frame. After it, exactly one of
/// `end` or `abort` is called: `end` when every frame was delivered, `abort`
/// when `begin` or rendering failed.
pub trait FrameSink {
    fn begin(&mut self, config: &SinkConfig) -> Result<()>;
    fn push_frame(&mut self, rgba: &[u8]) -> Result<()>;
    fn end(&mut self, audio: &MixedAudio) -> Result<()>;
    /// Releases whatever `begin` acquired without producing output.
    fn abort(&mut self);
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn spawn_error(error: std::io::Error) -> anyhow::Error {
    if error.kind() == ErrorKind::NotFound {
        anyhow!("ffmpeg was not found on PATH. Install ffmpeg and verify `ffmpeg -version` works.")
    } else {
        anyhow!("failed to spawn ffmpeg: {}", error)
    }
}

struct RunningEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    frame_len: usize,
}

/// Encodes frames with the system `ffmpeg` into H.264, then muxes the narration
/// in as AAC once the track is known.
pub struct FfmpegSink {
    out_path: PathBuf,
    video_path: PathBuf,
    audio_path: PathBuf,
    encoder: Option<RunningEncoder>,
}

impl FfmpegSink {
    pub fn new(out_path: impl Into<PathBuf>) -> Self {
        let out_path = out_path.into();
        let video_path = out_path.with_extension("video.mp4");
        let audio_path = out_path.with_extension("narration.f32");
        Self {
            out_path,
            video_path,
            audio_path,
            encoder: None,
        }
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    fn finish_video(&mut self) -> Result<()> {
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| anyhow!("ffmpeg sink was never started"))?;
        if let Some(mut stdin) = encoder.stdin.take() {
            stdin.flush().context("failed to flush ffmpeg stdin")?;
        }

        let output = encoder
            .child
            .wait_with_output()
            .context("failed to wait for ffmpeg to finish")?;
        if !output.status.success() {
            bail!(
                "ffmpeg exited with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn mux(&self, audio: &MixedAudio) -> Result<()> {
        std::fs::write(&self.audio_path, audio.to_f32le_bytes())
            .with_context(|| format!("failed to write {}", self.audio_path.display()))?;

        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(&self.video_path)
            .args(["-f", "f32le", "-ar"])
            .arg(audio.sample_rate.to_string())
            .args(["-ac", "1", "-i"])
            .arg(&self.audio_path)
            .args([
                "-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac", "-b:a", "128k",
                "-movflags", "+faststart",
            ])
            .arg(&self.out_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(spawn_error)?;

        if !output.status.success() {
            bail!(
                "ffmpeg mux exited with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn kill_encoder(&mut self) {
        let Some(mut encoder) = self.encoder.take() else {
            return;
        };
        drop(encoder.stdin.take());
        if let Err(e) = encoder.child.kill() {
            debug!("ffmpeg already exited: {}", e);
        }
        if let Err(e) = encoder.child.wait() {
            warn!("failed to reap ffmpeg: {}", e);
        }
    }

    fn cleanup(&self) {
        for path in [&self.video_path, &self.audio_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != ErrorKind::NotFound {
                    debug!("could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl FrameSink for FfmpegSink {
    fn begin(&mut self, config: &SinkConfig) -> Result<()> {
        if self.encoder.is_some() {
            bail!("ffmpeg sink already started");
        }
        if config.width % 2 != 0 || config.height % 2 != 0 {
            bail!("canvas width/height must be even for yuv420p output");
        }
        if let Some(parent) = self.out_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create output directory '{}'", parent.display())
                })?;
            }
        }

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "-s:v"])
            .arg(format!("{}x{}", config.width, config.height))
            .arg("-r")
            .arg(config.fps.to_string())
            .args(["-i", "pipe:0", "-an", "-c:v", "libx264", "-preset", "medium", "-crf", "20"])
            .args(["-pix_fmt", "yuv420p"])
            .arg(&self.video_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("failed to capture ffmpeg stdin");
        };

        info!(
            "Encoding {}x{} @ {} fps into {}",
            config.width,
            config.height,
            config.fps,
            self.out_path.display()
        );
        self.encoder = Some(RunningEncoder {
            child,
            stdin: Some(stdin),
            frame_len: config.frame_len(),
        });
        Ok(())
    }

    fn push_frame(&mut self, rgba: &[u8]) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg sink is not running"))?;
        if rgba.len() != encoder.frame_len {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                encoder.frame_len,
                rgba.len()
            );
        }
        let stdin = encoder
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdin already closed"))?;
        stdin
            .write_all(rgba)
            .context("failed to write frame to ffmpeg stdin")
    }

    fn end(&mut self, audio: &MixedAudio) -> Result<()> {
        let result = self.finish_video().and_then(|_| self.mux(audio));
        self.cleanup();
        result
    }

    fn abort(&mut self) {
        if self.encoder.is_some() {
            warn!("Abandoning {}", self.out_path.display());
        }
        self.kill_encoder();
        self.cleanup();
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if self.encoder.is_some() {
            self.abort();
        }
    }
}

/// What an [`InMemorySink`] has seen so far.
#[derive(Debug, Default)]
pub struct SinkRecord {
    pub config: Option<SinkConfig>,
    pub begin_calls: usize,
    pub end_calls: usize,
    pub abort_calls: usize,
    pub frames: usize,
    pub last_frame: Vec<u8>,
    pub audio: Option<MixedAudio>,
    /// First frame of each distinct run of identical consecutive frames.
    pub frame_samples: Vec<(usize, Vec<u8>)>,
}

/// Keeps a summary of what was rendered instead of encoding it.
///
/// Clones share one record, so a clone kept by the caller can inspect what
/// the exporter delivered.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    record: Arc<Mutex<SinkRecord>>,
    keep_samples: bool,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keeping_samples() -> Self {
        Self {
            keep_samples: true,
            ..Self::default()
        }
    }

    pub fn record(&self) -> MutexGuard<'_, SinkRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for InMemorySink {
    fn begin(&mut self, config: &SinkConfig) -> Result<()> {
        let mut record = self.record();
        record.begin_calls += 1;
        record.config = Some(*config);
        Ok(())
    }

    fn push_frame(&mut self, rgba: &[u8]) -> Result<()> {
        let keep_samples = self.keep_samples;
        let mut record = self.record();
        let config = record
            .config
            .ok_or_else(|| anyhow!("frame pushed before begin"))?;
        if rgba.len() != config.frame_len() {
            bail!("frame size mismatch");
        }
        if keep_samples && record.last_frame.as_slice() != rgba {
            let index = record.frames;
            record.frame_samples.push((index, rgba.to_vec()));
        }
        record.frames += 1;
        record.last_frame.clear();
        record.last_frame.extend_from_slice(rgba);
        Ok(())
    }

    fn end(&mut self, audio: &MixedAudio) -> Result<()> {
        let mut record = self.record();
        record.end_calls += 1;
        record.audio = Some(audio.clone());
        Ok(())
    }

    fn abort(&mut self) {
        self.record().abort_calls += 1;
    }
}
