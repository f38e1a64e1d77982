use anyhow::{Context, Result};
use log::{error, warn};
use reelsmith::core::config::Config;
use reelsmith::core::io::{NativeStorage, Storage};
use reelsmith::core::progress::{LogObserver, ProgressObserver, SpinnerObserver};
use reelsmith::core::state::ProductionState;
use reelsmith::services::compositor::sink::is_ffmpeg_on_path;
use reelsmith::services::compositor::SceneCompositor;
use reelsmith::services::image::create_image_provider;
use reelsmith::services::setup;
use reelsmith::services::speech::create_speech_provider;
use reelsmith::services::vault::CredentialVault;
use reelsmith::services::workflow::ProductionManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists (an empty file uses every default).");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    // 2. Vault
    let storage = NativeStorage::new();
    let vault = Arc::new(CredentialVault::load(&storage, &config.vault_file).await?);

    // 3. Interactive Setup
    if !config.unattended && !setup::run_setup(&mut config, &vault, &storage).await? {
        vault.save(&storage, &config.vault_file).await?;
        return Ok(());
    }

    if !is_ffmpeg_on_path() {
        warn!("ffmpeg was not found on PATH; videos cannot be exported until it is installed.");
    }

    let script = storage
        .read_to_string(&config.script_file)
        .await
        .with_context(|| format!("Failed to read script {}", config.script_file))?;

    // 4. Providers
    let image = create_image_provider(&config.image, vault.clone());
    let speech = create_speech_provider(&config.speech, vault.clone());
    let spinner = (!config.unattended).then(|| Arc::new(SpinnerObserver::new()));
    let observer: Arc<dyn ProgressObserver> = match &spinner {
        Some(spinner) => spinner.clone(),
        None => Arc::new(LogObserver),
    };

    // 5. Produce
    let mut state = ProductionState::new(script, config.target_languages.clone());
    let mut manager = ProductionManager::new(&config, image, speech, observer.clone());
    let produced = manager.run(&mut state).await;

    // Usage counts are persisted even when the run failed.
    if let Err(e) = vault.save(&storage, &config.vault_file).await {
        error!("Failed to save vault: {:#}", e);
    }
    if let Err(e) = produced {
        if let Some(spinner) = &spinner {
            spinner.finish("Production failed");
        }
        return Err(e.into());
    }

    // 6. Export
    let mut compositor = SceneCompositor::new(config.export.clone(), observer);
    let outputs = compositor
        .export_all(&mut state, &config.output_path())
        .await?;
    if let Some(spinner) = &spinner {
        spinner.finish("Done");
    }

    if outputs.is_empty() {
        println!("No narration was produced, so no videos were exported.");
    }
    for (language, path) in &outputs {
        println!("{}: {}", language, path.display());
    }

    Ok(())
}
