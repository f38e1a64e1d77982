pub mod frame;
pub mod mix;
pub mod sink;
pub mod subtitle;

use crate::core::error::PipelineError;
use crate::core::progress::{ProgressEvent, ProgressObserver};
use crate::core::state::{AspectRatio, ImageAsset, Phase, ProductionState, Scene};
use crate::services::script::find_language;
use crate::utils::audio::{decode_wav, WavClip};
use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use log::{info, warn};
use mix::{AudioMix, MixedAudio};
use serde::{Deserialize, Serialize};
use sink::{FfmpegSink, FrameSink, SinkConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use subtitle::SubtitlePainter;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_landscape")]
    pub landscape: CanvasSize,

    #[serde(default = "default_vertical")]
    pub vertical: CanvasSize,

    /// Length of a scene that has no narration in the exported language.
    #[serde(default = "default_scene_ms")]
    pub default_scene_ms: u64,

    /// Silence appended after each narration clip.
    #[serde(default = "default_padding_ms")]
    pub padding_ms: u64,

    #[serde(default = "default_max_zoom")]
    pub max_zoom: f32,

    #[serde(default)]
    pub font_path: Option<String>,

    #[serde(default = "default_mix_sample_rate")]
    pub mix_sample_rate: u32,
}

fn default_fps() -> u32 {
    30
}
fn default_landscape() -> CanvasSize {
    CanvasSize {
        width: 1280,
        height: 720,
    }
}
fn default_vertical() -> CanvasSize {
    CanvasSize {
        width: 720,
        height: 1280,
    }
}
fn default_scene_ms() -> u64 {
    4000
}
fn default_padding_ms() -> u64 {
    500
}
fn default_max_zoom() -> f32 {
    0.12
}
fn default_mix_sample_rate() -> u32 {
    24000
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            landscape: default_landscape(),
            vertical: default_vertical(),
            default_scene_ms: default_scene_ms(),
            padding_ms: default_padding_ms(),
            max_zoom: default_max_zoom(),
            font_path: None,
            mix_sample_rate: default_mix_sample_rate(),
        }
    }
}

impl ExportConfig {
    pub fn canvas_for(&self, aspect_ratio: AspectRatio) -> CanvasSize {
        match aspect_ratio {
            AspectRatio::Vertical => self.vertical,
            AspectRatio::Landscape => self.landscape,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub language: String,
    pub frames: u64,
    pub duration: Duration,
    pub width: u32,
    pub height: u32,
    pub scenes_rendered: usize,
}

/// `story_English.mp4` for known codes, `story_xx-YY.mp4` otherwise.
pub fn output_file_name(language: &str) -> String {
    let name = find_language(language).map(|l| l.name).unwrap_or(language);
    format!("story_{}.mp4", name)
}

fn has_audio_for(scenes: &[Scene], language: &str) -> bool {
    scenes.iter().any(|s| s.audio.contains_key(language))
}

fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let (header, payload) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .ok_or_else(|| anyhow!("malformed data URL"))?;
    if !header.ends_with(";base64") {
        bail!("only base64 data URLs are supported");
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("invalid base64 in data URL")
}

/// Everything the render thread needs about one scene.
struct ScenePlan {
    number: usize,
    image: Option<Vec<u8>>,
    narration: Option<Vec<u8>>,
    text: String,
}

/// The synchronous part of an export: decoding, drawing, and feeding the sink.
struct RenderJob {
    config: ExportConfig,
    language: String,
    canvas: CanvasSize,
    vertical: bool,
    observer: Arc<dyn ProgressObserver>,
}

impl RenderJob {
    fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            width: self.canvas.width,
            height: self.canvas.height,
            fps: self.config.fps.max(1),
        }
    }

    fn narration_clip(&self, plan: &ScenePlan) -> Option<WavClip> {
        let bytes = plan.narration.as_ref()?;
        match decode_wav(bytes) {
            Ok(clip) => Some(clip),
            Err(e) => {
                warn!(
                    "Scene {} {} narration could not be decoded ({:#}); using default length",
                    plan.number, self.language, e
                );
                None
            }
        }
    }

    /// Drives the sink from `begin` to either `end` or `abort`.
    fn run(
        &self,
        plans: &[ScenePlan],
        painter: Option<&mut SubtitlePainter>,
        sink: &mut dyn FrameSink,
    ) -> Result<ExportReport> {
        let sink_config = self.sink_config();
        let rendered = match sink.begin(&sink_config) {
            Ok(()) => self.render(plans, painter, &mut *sink, &sink_config),
            Err(e) => Err(e),
        };
        match rendered {
            Ok((report, audio)) => {
                sink.end(&audio)?;
                Ok(report)
            }
            Err(e) => {
                sink.abort();
                Err(e)
            }
        }
    }

    fn render(
        &self,
        plans: &[ScenePlan],
        mut painter: Option<&mut SubtitlePainter>,
        sink: &mut dyn FrameSink,
        sink_config: &SinkConfig,
    ) -> Result<(ExportReport, MixedAudio)> {
        let fps = f64::from(sink_config.fps);
        let padding = Duration::from_millis(self.config.padding_ms);
        let default_length = Duration::from_millis(self.config.default_scene_ms);

        let mut mix = AudioMix::new(self.config.mix_sample_rate);
        let mut pixels = vec![0u8; sink_config.frame_len()];
        let mut elapsed = Duration::ZERO;
        let mut frames_written: u64 = 0;
        let mut scenes_rendered = 0;
        let total = plans.len();

        for (i, plan) in plans.iter().enumerate() {
            let percent = (((i + 1) * 100 + total / 2) / total) as u8;

            let image = plan.image.as_ref().and_then(|bytes| {
                image::load_from_memory(bytes)
                    .map_err(|e| warn!("Scene {} image could not be decoded: {}", plan.number, e))
                    .ok()
            });
            let Some(image) = image else {
                self.observer.notify(ProgressEvent::ExportProgress {
                    language: self.language.clone(),
                    percent,
                });
                continue;
            };

            let base = frame::fit_to_canvas(&image, self.canvas.width, self.canvas.height);
            let length = match self.narration_clip(plan) {
                Some(clip) => {
                    mix.schedule(elapsed, &clip);
                    clip.duration() + padding
                }
                None => default_length,
            };

            let end = elapsed + length;
            let end_frame = (end.as_secs_f64() * fps).round() as u64;
            let scene_frames = end_frame.saturating_sub(frames_written);

            let overlay = subtitle::build_overlay(
                painter.as_deref_mut(),
                self.canvas.width,
                self.canvas.height,
                self.vertical,
                &plan.text,
            );

            for f in 0..scene_frames {
                let zoom = frame::zoom_at(f, scene_frames, self.config.max_zoom);
                frame::ken_burns(&base, zoom, &mut pixels);
                if let Some(overlay) = &overlay {
                    overlay.composite_onto(&mut pixels);
                }
                sink.push_frame(&pixels)?;
            }

            frames_written += scene_frames;
            elapsed = end;
            scenes_rendered += 1;
            self.observer.notify(ProgressEvent::ExportProgress {
                language: self.language.clone(),
                percent,
            });
        }

        let audio = mix.finish(elapsed);
        info!(
            "Rendered {} ({} scenes, {} frames, {:.1}s track)",
            self.language,
            scenes_rendered,
            frames_written,
            audio.duration().as_secs_f64()
        );
        let report = ExportReport {
            language: self.language.clone(),
            frames: frames_written,
            duration: elapsed,
            width: self.canvas.width,
            height: self.canvas.height,
            scenes_rendered,
        };
        Ok((report, audio))
    }
}

/// Renders a produced story into one video per language.
pub struct SceneCompositor {
    config: ExportConfig,
    painter: Option<SubtitlePainter>,
    observer: Arc<dyn ProgressObserver>,
    http: reqwest::Client,
}

impl SceneCompositor {
    pub fn new(config: ExportConfig, observer: Arc<dyn ProgressObserver>) -> Self {
        let painter = SubtitlePainter::discover(config.font_path.as_deref());
        Self::with_painter(config, painter, observer)
    }

    pub fn with_painter(
        config: ExportConfig,
        painter: Option<SubtitlePainter>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            config,
            painter,
            observer,
            http: reqwest::Client::new(),
        }
    }

    async fn image_bytes(&self, asset: &ImageAsset) -> Result<Vec<u8>> {
        match asset {
            ImageAsset::Bytes { data, .. } => Ok(data.clone()),
            ImageAsset::Url(url) if url.starts_with("data:") => decode_data_url(url),
            ImageAsset::Url(url) => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("failed to fetch {}", url))?
                    .error_for_status()?;
                Ok(response.bytes().await?.to_vec())
            }
        }
    }

    async fn plan_scenes(&self, scenes: &[Scene], language: &str) -> Vec<ScenePlan> {
        let mut plans = Vec::with_capacity(scenes.len());
        for scene in scenes {
            let number = scene.id + 1;
            let image = match &scene.image {
                Some(asset) => match self.image_bytes(asset).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!("Scene {} image unavailable: {:#}", number, e);
                        None
                    }
                },
                None => {
                    warn!("Scene {} has no image, skipping", number);
                    None
                }
            };
            plans.push(ScenePlan {
                number,
                image,
                narration: scene.audio.get(language).cloned(),
                text: scene.translations.get(language).cloned().unwrap_or_default(),
            });
        }
        plans
    }

    /// Renders `scenes` for `language` into `sink`.
    ///
    /// Returns `Ok(None)` without touching the sink when no scene carries
    /// narration for the language. Frames are drawn and encoded on the
    /// blocking pool. Once `begin` has been called the sink always sees
    /// either `end` or `abort`.
    pub async fn export_language<S>(
        &mut self,
        scenes: &[Scene],
        language: &str,
        mut sink: S,
    ) -> Result<Option<ExportReport>>
    where
        S: FrameSink + Send + 'static,
    {
        if !has_audio_for(scenes, language) {
            info!("No narration for {}, nothing to export", language);
            return Ok(None);
        }
        if !scenes.iter().any(|s| s.image.is_some()) {
            warn!("No scene has an image, skipping {}", language);
            return Ok(None);
        }

        let aspect_ratio = scenes
            .first()
            .map(Scene::aspect_ratio)
            .unwrap_or(AspectRatio::Landscape);
        let job = RenderJob {
            config: self.config.clone(),
            language: language.to_string(),
            canvas: self.config.canvas_for(aspect_ratio),
            vertical: aspect_ratio.is_vertical(),
            observer: self.observer.clone(),
        };
        let plans = self.plan_scenes(scenes, language).await;

        let mut painter = self.painter.take();
        let (painter, rendered) = tokio::task::spawn_blocking(move || {
            let rendered = job.run(&plans, painter.as_mut(), &mut sink);
            (painter, rendered)
        })
        .await
        .context("render task panicked")?;
        self.painter = painter;

        rendered.map(Some)
    }

    /// Writes `story_{Language}.mp4` into `out_dir` for every target language
    /// that has narration. The production must be ready and returns to ready.
    pub async fn export_all(
        &mut self,
        state: &mut ProductionState,
        out_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>> {
        if state.phase() != Phase::Ready {
            return Err(PipelineError::InvalidPhase {
                from: state.phase().to_string(),
                to: Phase::Exporting.to_string(),
            }
            .into());
        }
        state.advance(Phase::Exporting)?;
        self.observer.notify(ProgressEvent::Phase(Phase::Exporting));

        match self.export_languages(state, out_dir).await {
            Ok(outputs) => {
                state.advance(Phase::Ready)?;
                self.observer.notify(ProgressEvent::Phase(Phase::Ready));
                Ok(outputs)
            }
            Err(e) => {
                state.fail(format!("{:#}", e));
                self.observer.notify(ProgressEvent::Phase(Phase::Failed));
                Err(e)
            }
        }
    }

    async fn export_languages(
        &mut self,
        state: &ProductionState,
        out_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>> {
        let mut outputs = BTreeMap::new();
        for language in &state.target_languages {
            if !has_audio_for(&state.scenes, language) {
                info!("Skipping {}: no narration was produced", language);
                continue;
            }
            let path = out_dir.join(output_file_name(language));
            let report = self
                .export_language(&state.scenes, language, FfmpegSink::new(&path))
                .await
                .with_context(|| format!("Export failed for {}", language))?;

            if report.is_some() {
                self.observer.notify(ProgressEvent::Exported {
                    language: language.clone(),
                    path: path.display().to_string(),
                });
                outputs.insert(language.clone(), path);
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::testing::RecordingObserver;
    use crate::utils::audio::pcm16_to_wav;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use sink::InMemorySink;
    use std::io::Cursor;

    fn png(color: [u8; 4]) -> ImageAsset {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba(color)));
        let mut data = Vec::new();
        img.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        ImageAsset::Bytes {
            data,
            mime: "image/png".to_string(),
        }
    }

    /// Half a second of constant 0.5 amplitude at 1 kHz.
    fn half_second_wav() -> Vec<u8> {
        let pcm: Vec<u8> = (0..500).flat_map(|_| 16384i16.to_le_bytes()).collect();
        pcm16_to_wav(&pcm, 1000)
    }

    fn scene(id: usize, prompt: &str, image: Option<ImageAsset>) -> Scene {
        let mut scene = Scene::new(id);
        scene.image_prompt = prompt.to_string();
        scene.image = image;
        scene
            .translations
            .insert("en-US".to_string(), "Hello there".to_string());
        scene
    }

    fn test_config() -> ExportConfig {
        ExportConfig {
            fps: 10,
            landscape: CanvasSize {
                width: 8,
                height: 4,
            },
            vertical: CanvasSize {
                width: 4,
                height: 8,
            },
            mix_sample_rate: 1000,
            ..ExportConfig::default()
        }
    }

    fn compositor() -> (SceneCompositor, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        (
            SceneCompositor::with_painter(test_config(), None, observer.clone()),
            observer,
        )
    }

    #[test]
    fn test_export_config_defaults() {
        let config = ExportConfig::default();
        assert_eq!(config.fps, 30);
        assert_eq!(config.canvas_for(AspectRatio::Vertical), CanvasSize { width: 720, height: 1280 });
        assert_eq!(config.canvas_for(AspectRatio::Landscape), CanvasSize { width: 1280, height: 720 });
        assert_eq!(config.default_scene_ms, 4000);
        assert_eq!(config.padding_ms, 500);
    }

    #[test]
    fn test_output_file_names() {
        assert_eq!(output_file_name("en-US"), "story_English.mp4");
        assert_eq!(output_file_name("bn-BD"), "story_Bangla.mp4");
        assert_eq!(output_file_name("fr-FR"), "story_fr-FR.mp4");
    }

    #[test]
    fn test_data_url_decoding() {
        assert_eq!(decode_data_url("data:image/png;base64,AAEC").unwrap(), vec![0, 1, 2]);
        assert!(decode_data_url("data:text/plain,hello").is_err());
        assert!(decode_data_url("https://example.com/a.png").is_err());
    }

    #[tokio::test]
    async fn test_language_without_audio_produces_nothing() {
        let (mut compositor, _) = compositor();
        let scenes = vec![scene(0, "a hill", Some(png([255, 0, 0, 255])))];
        let sink = InMemorySink::new();

        let report = compositor
            .export_language(&scenes, "bn-BD", sink.clone())
            .await
            .unwrap();
        assert!(report.is_none());
        let record = sink.record();
        assert_eq!(record.begin_calls, 0);
        assert_eq!(record.end_calls, 0);
    }

    #[tokio::test]
    async fn test_timeline_follows_narration_and_defaults() {
        let (mut compositor, observer) = compositor();
        let mut narrated = scene(0, "a hill", Some(png([255, 255, 255, 255])));
        narrated
            .audio
            .insert("en-US".to_string(), half_second_wav());
        let silent = scene(1, "a river", Some(png([0, 0, 255, 255])));
        let mut imageless = scene(2, "a cave", None);
        imageless
            .audio
            .insert("en-US".to_string(), half_second_wav());

        let scenes = vec![narrated, silent, imageless];
        let sink = InMemorySink::keeping_samples();
        let report = compositor
            .export_language(&scenes, "en-US", sink.clone())
            .await
            .unwrap()
            .unwrap();

        // 0.5 s + 0.5 s padding, then the 4 s default; the imageless scene is skipped.
        assert_eq!(report.duration, Duration::from_secs(5));
        assert_eq!(report.frames, 50);
        assert_eq!(report.scenes_rendered, 2);
        assert_eq!((report.width, report.height), (8, 4));
        let record = sink.record();
        assert_eq!(record.frames, 50);
        assert_eq!(record.begin_calls, 1);
        assert_eq!(record.end_calls, 1);
        assert_eq!(record.abort_calls, 0);

        let audio = record.audio.as_ref().unwrap();
        assert_eq!(audio.duration(), Duration::from_secs(5));
        assert_eq!(audio.sample_rate, 1000);
        assert_eq!(audio.samples.len(), 5000);
        assert!(audio.samples[..500].iter().all(|s| (*s - 0.5).abs() < 1e-4));
        assert!(audio.samples[500..].iter().all(|s| *s == 0.0));

        let percents: Vec<u8> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::ExportProgress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![33, 67, 100]);
    }

    #[tokio::test]
    async fn test_subtitle_band_darkens_bottom_rows() {
        let (mut compositor, _) = compositor();
        let mut narrated = scene(0, "a hill", Some(png([255, 255, 255, 255])));
        narrated
            .audio
            .insert("en-US".to_string(), half_second_wav());
        let sink = InMemorySink::keeping_samples();

        compositor
            .export_language(&[narrated], "en-US", sink.clone())
            .await
            .unwrap();

        let record = sink.record();
        let (index, first) = &record.frame_samples[0];
        assert_eq!(*index, 0);
        // Top row untouched, bottom row under the 80 % black band (1 row at 8x4).
        assert_eq!(first[0], 255);
        let bottom = (3 * 8 * 4) as usize;
        assert_eq!(first[bottom], 51);
        assert_eq!(first[bottom + 3], 255);
    }

    #[tokio::test]
    async fn test_canvas_follows_first_scene_orientation() {
        let (mut compositor, _) = compositor();
        let mut first = scene(0, "tall tower, vertical 9:16", Some(png([9, 9, 9, 255])));
        first.audio.insert("en-US".to_string(), half_second_wav());
        let second = scene(1, "wide field", Some(png([9, 9, 9, 255])));
        let sink = InMemorySink::new();

        let report = compositor
            .export_language(&[first, second], "en-US", sink.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((report.width, report.height), (4, 8));
        assert_eq!(
            sink.record().config,
            Some(SinkConfig {
                width: 4,
                height: 8,
                fps: 10
            })
        );
    }

    #[tokio::test]
    async fn test_export_all_requires_ready_and_skips_silent_languages() {
        let (mut compositor, observer) = compositor();
        let dir = tempfile::tempdir().unwrap();

        let mut state = ProductionState::new("", vec!["en-US".to_string()]);
        assert!(compositor.export_all(&mut state, dir.path()).await.is_err());
        assert_eq!(state.phase(), Phase::Idle);

        for phase in [Phase::Parsing, Phase::Imaging, Phase::Synthesizing, Phase::Ready] {
            state.advance(phase).unwrap();
        }
        state.scenes = vec![scene(0, "a hill", Some(png([1, 2, 3, 255])))];

        let outputs = compositor.export_all(&mut state, dir.path()).await.unwrap();
        assert!(outputs.is_empty());
        assert_eq!(state.phase(), Phase::Ready);
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, ProgressEvent::Phase(Phase::Exporting))));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    /// Delegates to an [`InMemorySink`] but fails on the nth frame.
    struct FailingSink {
        inner: InMemorySink,
        fail_at: usize,
    }

    impl FrameSink for FailingSink {
        fn begin(&mut self, config: &SinkConfig) -> Result<()> {
            self.inner.begin(config)
        }

        fn push_frame(&mut self, rgba: &[u8]) -> Result<()> {
            if self.inner.record().frames + 1 == self.fail_at {
                bail!("encoder died");
            }
            self.inner.push_frame(rgba)
        }

        fn end(&mut self, audio: &MixedAudio) -> Result<()> {
            self.inner.end(audio)
        }

        fn abort(&mut self) {
            self.inner.abort()
        }
    }

    #[tokio::test]
    async fn test_failed_frame_aborts_the_sink() {
        let (mut compositor, _) = compositor();
        let mut narrated = scene(0, "a hill", Some(png([255, 255, 255, 255])));
        narrated
            .audio
            .insert("en-US".to_string(), half_second_wav());
        let inner = InMemorySink::new();
        let failing = FailingSink {
            inner: inner.clone(),
            fail_at: 3,
        };

        let err = compositor
            .export_language(&[narrated], "en-US", failing)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("encoder died"));

        let record = inner.record();
        assert_eq!(record.begin_calls, 1);
        assert_eq!(record.frames, 2);
        assert_eq!(record.abort_calls, 1);
        assert_eq!(record.end_calls, 0);
    }

    #[tokio::test]
    async fn test_painter_survives_a_render() {
        let observer = Arc::new(RecordingObserver::default());
        let painter = SubtitlePainter::discover(None);
        let had_painter = painter.is_some();
        let mut compositor = SceneCompositor::with_painter(test_config(), painter, observer);
        let mut narrated = scene(0, "a hill", Some(png([255, 255, 255, 255])));
        narrated
            .audio
            .insert("en-US".to_string(), half_second_wav());

        compositor
            .export_language(&[narrated], "en-US", InMemorySink::new())
            .await
            .unwrap();
        assert_eq!(compositor.painter.is_some(), had_painter);
    }

    #[tokio::test]
    async fn test_zero_rate_narration_falls_back_to_default_length() {
        let (mut compositor, _) = compositor();
        let mut broken = scene(0, "a hill", Some(png([255, 255, 255, 255])));
        broken
            .audio
            .insert("en-US".to_string(), pcm16_to_wav(&[0u8; 20], 0));
        let sink = InMemorySink::new();

        let report = compositor
            .export_language(&[broken], "en-US", sink.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.duration, Duration::from_secs(4));
        assert_eq!(report.frames, 40);
        assert_eq!(sink.record().end_calls, 1);
    }
}
