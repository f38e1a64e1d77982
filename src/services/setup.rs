use crate::core::config::Config;
use crate::core::error::Provider;
use crate::core::io::Storage;
use crate::services::image::ImageEngine;
use crate::services::script::LANGUAGES;
use crate::services::speech::{SpeechEngine, VoiceName};
use crate::services::vault::{Credential, CredentialSpec, CredentialVault};
use anyhow::Result;
use inquire::{Confirm, MultiSelect, Password, PasswordDisplayMode, Select, Text};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainAction {
    Start,
    ImageEngine,
    SpeechEngine,
    Voice,
    Languages,
    Keys,
    Quit,
}

impl MainAction {
    const ALL: [MainAction; 7] = [
        MainAction::Start,
        MainAction::ImageEngine,
        MainAction::SpeechEngine,
        MainAction::Voice,
        MainAction::Languages,
        MainAction::Keys,
        MainAction::Quit,
    ];
}

impl fmt::Display for MainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MainAction::Start => "Start production",
            MainAction::ImageEngine => "Image engine",
            MainAction::SpeechEngine => "Speech engine",
            MainAction::Voice => "Narrator voice",
            MainAction::Languages => "Target languages",
            MainAction::Keys => "API keys",
            MainAction::Quit => "Quit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VaultAction {
    List,
    Add,
    Bulk,
    Remove,
    Import,
    Export,
    Back,
}

impl VaultAction {
    const ALL: [VaultAction; 7] = [
        VaultAction::List,
        VaultAction::Add,
        VaultAction::Bulk,
        VaultAction::Remove,
        VaultAction::Import,
        VaultAction::Export,
        VaultAction::Back,
    ];
}

impl fmt::Display for VaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VaultAction::List => "List keys",
            VaultAction::Add => "Add a key",
            VaultAction::Bulk => "Bulk add keys",
            VaultAction::Remove => "Remove a key",
            VaultAction::Import => "Import vault file",
            VaultAction::Export => "Export vault file",
            VaultAction::Back => "Back",
        };
        f.write_str(s)
    }
}

/// One line per credential, as shown in the key list.
pub fn describe_credential(cred: &Credential) -> String {
    let status = if cred.is_available() { "ready" } else { "exhausted" };
    format!(
        "{} [{}] {} {}/{} ({})",
        cred.label,
        cred.provider,
        cred.masked_key(),
        cred.usage_count,
        cred.max_usage,
        status
    )
}

/// Menu labels for every known language plus the indices already selected.
pub fn language_choices(selected: &[String]) -> (Vec<String>, Vec<usize>) {
    let labels = LANGUAGES
        .iter()
        .map(|l| format!("{} ({}) {}", l.name, l.code, l.native_name))
        .collect();
    let defaults = LANGUAGES
        .iter()
        .enumerate()
        .filter(|(_, l)| selected.iter().any(|s| s == l.code))
        .map(|(i, _)| i)
        .collect();
    (labels, defaults)
}

/// Interactive menu shown before a run. Returns `false` if the user quit.
///
/// Config changes are written back to `config.yml`, vault changes to the
/// vault file.
pub async fn run_setup(
    config: &mut Config,
    vault: &CredentialVault,
    storage: &dyn Storage,
) -> Result<bool> {
    let mut needs_save = false;

    loop {
        println!(
            "Image: {} | Speech: {} | Voice: {} | Languages: {} | Ready keys: {}",
            config.image.engine,
            config.speech.engine,
            config.speech.voice.as_str(),
            config.target_languages.join(", "),
            vault.ready_count()
        );

        let action = Select::new("What next?", MainAction::ALL.to_vec()).prompt()?;
        match action {
            MainAction::Start => break,
            MainAction::Quit => return Ok(false),
            MainAction::ImageEngine => {
                config.image.engine =
                    Select::new("Select image engine:", ImageEngine::ALL.to_vec()).prompt()?;
                needs_save = true;
            }
            MainAction::SpeechEngine => {
                config.speech.engine =
                    Select::new("Select speech engine:", SpeechEngine::ALL.to_vec()).prompt()?;
                needs_save = true;
            }
            MainAction::Voice => {
                config.speech.voice =
                    Select::new("Select narrator voice:", VoiceName::ALL.to_vec()).prompt()?;
                needs_save = true;
            }
            MainAction::Languages => {
                let (labels, defaults) = language_choices(&config.target_languages);
                let picked = MultiSelect::new("Select target languages:", labels)
                    .with_default(&defaults)
                    .raw_prompt()?;
                if picked.is_empty() {
                    println!("At least one language is required; keeping the previous selection.");
                } else {
                    config.target_languages = picked
                        .iter()
                        .map(|o| LANGUAGES[o.index].code.to_string())
                        .collect();
                    needs_save = true;
                }
            }
            MainAction::Keys => manage_vault(config, vault, storage).await?,
        }
    }

    if needs_save {
        config.save()?;
        println!("Configuration saved.");
    }

    if vault.ready_count() == 0 {
        let proceed = Confirm::new("No API keys are ready. Continue with environment defaults?")
            .with_default(true)
            .prompt()?;
        if !proceed {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn manage_vault(config: &Config, vault: &CredentialVault, storage: &dyn Storage) -> Result<()> {
    loop {
        let action = Select::new("API keys:", VaultAction::ALL.to_vec()).prompt()?;
        let changed = match action {
            VaultAction::Back => return Ok(()),
            VaultAction::List => {
                let creds = vault.snapshot();
                if creds.is_empty() {
                    println!("The vault is empty.");
                }
                for cred in &creds {
                    println!("  {}", describe_credential(cred));
                }
                false
            }
            VaultAction::Add => {
                let provider = select_provider()?;
                let key = Password::new("API key:")
                    .with_display_mode(PasswordDisplayMode::Masked)
                    .without_confirmation()
                    .prompt()?;
                if key.trim().is_empty() {
                    println!("Empty key ignored.");
                    false
                } else {
                    let label = Text::new("Label (optional):").prompt()?;
                    vault.register(CredentialSpec {
                        key,
                        provider,
                        label: Some(label),
                        max_usage: config.vault.default_cap,
                    });
                    true
                }
            }
            VaultAction::Bulk => {
                let provider = select_provider()?;
                let batch = Text::new("Keys (comma separated):").prompt()?;
                let ids = vault.register_bulk(&batch, provider, config.vault.default_cap);
                println!("Added {} keys.", ids.len());
                !ids.is_empty()
            }
            VaultAction::Remove => {
                let creds = vault.snapshot();
                if creds.is_empty() {
                    println!("The vault is empty.");
                    false
                } else {
                    let labels: Vec<String> = creds.iter().map(describe_credential).collect();
                    let picked = Select::new("Remove which key?", labels).raw_prompt()?;
                    vault.remove(&creds[picked.index].id)
                }
            }
            VaultAction::Import => {
                let path = Text::new("Import from:").prompt()?;
                let content = storage.read_to_string(path.trim()).await?;
                let confirmed = Confirm::new("This replaces every stored key. Continue?")
                    .with_default(false)
                    .prompt()?;
                if confirmed {
                    let count = vault.import_json(&content)?;
                    println!("Imported {} keys.", count);
                }
                confirmed
            }
            VaultAction::Export => {
                let path = Text::new("Export to:")
                    .with_default("vault_export.json")
                    .prompt()?;
                let content = vault.export_json()?;
                storage.write(path.trim(), content.as_bytes()).await?;
                println!("Vault exported to {}.", path.trim());
                false
            }
        };

        if changed {
            vault.save(storage, &config.vault_file).await?;
        }
    }
}

fn select_provider() -> Result<Provider> {
    Ok(Select::new("Provider:", Provider::ALL.to_vec()).prompt()?)
}
