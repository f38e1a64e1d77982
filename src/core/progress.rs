use crate::core::state::Phase;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Phase(Phase),
    /// Free-form status line, e.g. "edge Synthesis: Processing en-US...".
    Status(String),
    /// Emitted right before a backoff sleep.
    Waiting { context: String, delay: Duration },
    SceneImaged { index: usize, total: usize },
    SceneSynthesized { index: usize, total: usize },
    ExportProgress { language: String, percent: u8 },
    Exported { language: String, path: String },
}

impl ProgressEvent {
    pub fn describe(&self) -> String {
        match self {
            ProgressEvent::Phase(p) => format!("Working: {}", p.to_string().to_uppercase()),
            ProgressEvent::Status(s) => s.clone(),
            ProgressEvent::Waiting { context, delay } => {
                format!("Rate limited {}. Waiting {}s...", context, delay.as_secs_f64().round())
            }
            ProgressEvent::SceneImaged { index, total } => {
                format!("Imaged scene {}/{}", index + 1, total)
            }
            ProgressEvent::SceneSynthesized { index, total } => {
                format!("Synthesized scene {}/{}", index + 1, total)
            }
            ProgressEvent::ExportProgress { language, percent } => {
                format!("Rendering {}: {}%", language, percent)
            }
            ProgressEvent::Exported { language, path } => {
                format!("Exported {} -> {}", language, path)
            }
        }
    }
}

/// Receives pipeline progress. Implementations must be cheap; they are called inline.
pub trait ProgressObserver: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn notify(&self, event: ProgressEvent) {
        info!("{}", event.describe());
    }
}

/// Terminal spinner used by the CLI.
pub struct SpinnerObserver {
    bar: ProgressBar,
}

impl SpinnerObserver {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for SpinnerObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for SpinnerObserver {
    fn notify(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Exported { .. } | ProgressEvent::Phase(_) => {
                self.bar.println(event.describe())
            }
            _ => self.bar.set_message(event.describe()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_is_described_in_seconds() {
        let event = ProgressEvent::Waiting {
            context: "Image Generation 2".to_string(),
            delay: Duration::from_millis(18_000),
        };
        assert_eq!(
            event.describe(),
            "Rate limited Image Generation 2. Waiting 18s..."
        );
    }
}
