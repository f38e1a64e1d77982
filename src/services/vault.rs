use crate::core::error::{PipelineError, Provider};
use crate::core::io::Storage;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use log::{debug, info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const ID_LEN: usize = 9;

/// A stored API secret with its monthly usage accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub key: String,
    pub provider: Provider,
    pub label: String,
    pub usage_count: u32,
    pub max_usage: u32,
    pub reset_date: DateTime<Utc>,
}

impl Credential {
    pub fn is_available(&self) -> bool {
        self.usage_count < self.max_usage
    }

    /// Last few characters of the secret, for display.
    pub fn masked_key(&self) -> String {
        let tail: String = self
            .key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("****{}", tail)
    }
}

/// Input for registering a single credential.
#[derive(Debug, Clone)]
pub struct CredentialSpec {
    pub key: String,
    pub provider: Provider,
    pub label: Option<String>,
    pub max_usage: u32,
}

#[derive(Debug, Default)]
struct VaultInner {
    credentials: Vec<Credential>,
    cursors: HashMap<Provider, u64>,
}

impl VaultInner {
    fn provider_count(&self, provider: Provider) -> usize {
        self.credentials
            .iter()
            .filter(|c| c.provider == provider)
            .count()
    }
}

fn generate_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Holds every credential and hands them out round-robin per provider.
#[derive(Debug, Default)]
pub struct CredentialVault {
    inner: Mutex<VaultInner>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a vault from persisted credentials, zeroing usage for every
    /// credential whose reset date falls outside the calendar month of `now`.
    pub fn from_credentials(mut credentials: Vec<Credential>, now: DateTime<Utc>) -> Self {
        for cred in credentials.iter_mut() {
            let same_month = cred.reset_date.year() == now.year()
                && cred.reset_date.month() == now.month();
            if !same_month {
                debug!("Monthly reset for credential {}", cred.label);
                cred.usage_count = 0;
                cred.reset_date = now;
            }
        }
        Self {
            inner: Mutex::new(VaultInner {
                credentials,
                cursors: HashMap::new(),
            }),
        }
    }

    /// Loads the vault file, or starts empty if it does not exist yet.
    pub async fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        if !storage.exists(path).await? {
            info!("No vault at {}, starting empty", path);
            return Ok(Self::new());
        }
        let content = storage.read_to_string(path).await?;
        let credentials: Vec<Credential> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse vault file {}", path))?;
        info!("Loaded {} credentials from {}", credentials.len(), path);
        Ok(Self::from_credentials(credentials, Utc::now()))
    }

    pub async fn save(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let content = self.export_json()?;
        storage
            .write(path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write vault file {}", path))
    }

    fn lock(&self) -> MutexGuard<'_, VaultInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the next eligible secret for `provider` and charges one use to it.
    pub fn next_credential(&self, provider: Provider) -> Result<String, PipelineError> {
        let mut inner = self.lock();

        let eligible: Vec<usize> = inner
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.provider == provider && c.is_available())
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            return Err(PipelineError::NoCredentialAvailable(provider));
        }

        let cursor = inner.cursors.entry(provider).or_insert(0);
        let pick = eligible[(*cursor % eligible.len() as u64) as usize];
        *cursor += 1;

        let cred = &mut inner.credentials[pick];
        cred.usage_count += 1;
        debug!(
            "[Vault] Rotating to {} key: {} ({}/{})",
            provider, cred.label, cred.usage_count, cred.max_usage
        );
        Ok(cred.key.clone())
    }

    pub fn register(&self, spec: CredentialSpec) -> String {
        let mut inner = self.lock();
        let label = match spec.label.map(|l| l.trim().to_string()) {
            Some(l) if !l.is_empty() => l,
            _ => format!(
                "{} Key {}",
                spec.provider.as_str().to_uppercase(),
                inner.provider_count(spec.provider) + 1
            ),
        };
        let id = generate_id();
        inner.credentials.push(Credential {
            id: id.clone(),
            key: spec.key.trim().to_string(),
            provider: spec.provider,
            label,
            usage_count: 0,
            max_usage: spec.max_usage,
            reset_date: Utc::now(),
        });
        id
    }

    /// Registers every key in a newline or comma separated batch.
    pub fn register_bulk(&self, batch: &str, provider: Provider, max_usage: u32) -> Vec<String> {
        let keys: Vec<&str> = batch
            .split(['\n', ','])
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect();

        let mut inner = self.lock();
        let existing = inner.provider_count(provider);
        let now = Utc::now();
        keys.into_iter()
            .enumerate()
            .map(|(index, key)| {
                let id = generate_id();
                inner.credentials.push(Credential {
                    id: id.clone(),
                    key: key.to_string(),
                    provider,
                    label: format!(
                        "{} Bulk {}",
                        provider.as_str().to_uppercase(),
                        existing + index + 1
                    ),
                    usage_count: 0,
                    max_usage,
                    reset_date: now,
                });
                id
            })
            .collect()
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.lock();
        let before = inner.credentials.len();
        inner.credentials.retain(|c| c.id != id);
        inner.credentials.len() != before
    }

    /// Charges one use to the credential with `id`.
    pub fn record_usage(&self, id: &str) -> bool {
        let mut inner = self.lock();
        match inner.credentials.iter_mut().find(|c| c.id == id) {
            Some(cred) => {
                cred.usage_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn export_json(&self) -> Result<String> {
        let inner = self.lock();
        Ok(serde_json::to_string_pretty(&inner.credentials)?)
    }

    /// Replaces every credential with the contents of `text`. Nothing changes
    /// unless the whole document parses.
    pub fn import_json(&self, text: &str) -> Result<usize> {
        let credentials: Vec<Credential> =
            serde_json::from_str(text).context("Failed to parse the vault JSON")?;
        let count = credentials.len();
        self.lock().credentials = credentials;
        Ok(count)
    }

    pub fn ready_count(&self) -> usize {
        self.lock()
            .credentials
            .iter()
            .filter(|c| c.is_available())
            .count()
    }

    pub fn snapshot(&self) -> Vec<Credential> {
        self.lock().credentials.clone()
    }
}

/// Secret source for one provider: the vault first, then the ambient default.
#[derive(Debug, Clone)]
pub struct KeyRing {
    vault: Arc<CredentialVault>,
    provider: Provider,
    fallback: Option<String>,
}

impl KeyRing {
    /// Uses the provider's environment variable, then `API_KEY`, as fallback.
    pub fn new(vault: Arc<CredentialVault>, provider: Provider) -> Self {
        let fallback = std::env::var(provider.fallback_env_var())
            .or_else(|_| std::env::var("API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::with_fallback(vault, provider, fallback)
    }

    pub fn with_fallback(
        vault: Arc<CredentialVault>,
        provider: Provider,
        fallback: Option<String>,
    ) -> Self {
        Self {
            vault,
            provider,
            fallback,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn acquire(&self) -> Result<String, PipelineError> {
        match self.vault.next_credential(self.provider) {
            Ok(key) => Ok(key),
            Err(PipelineError::NoCredentialAvailable(provider)) => match &self.fallback {
                Some(key) => {
                    warn!(
                        "No active {} keys found in vault. Using environment default.",
                        provider
                    );
                    Ok(key.clone())
                }
                None => Err(PipelineError::NoCredentialAvailable(provider)),
            },
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use chrono::TimeZone;

    fn spec(key: &str, provider: Provider, max_usage: u32) -> CredentialSpec {
        CredentialSpec {
            key: key.to_string(),
            provider,
            label: None,
            max_usage,
        }
    }

    #[test]
    fn test_capped_key_leaves_rotation() {
        let vault = CredentialVault::new();
        vault.register(spec("A", Provider::Gemini, 1));
        vault.register(spec("B", Provider::Gemini, 10));

        let drawn: Vec<String> = (0..5)
            .map(|_| vault.next_credential(Provider::Gemini).unwrap())
            .collect();
        assert_eq!(drawn, vec!["A", "B", "B", "B", "B"]);

        let snap = vault.snapshot();
        assert_eq!(snap[0].usage_count, 1);
        assert_eq!(snap[1].usage_count, 4);
    }

    #[test]
    fn test_rotation_is_fair() {
        let vault = CredentialVault::new();
        for key in ["k1", "k2", "k3"] {
            vault.register(spec(key, Provider::Together, 100));
        }
        vault.register(spec("other", Provider::Gemini, 100));

        for _ in 0..7 {
            vault.next_credential(Provider::Together).unwrap();
        }
        let mut usage: Vec<u32> = vault
            .snapshot()
            .iter()
            .filter(|c| c.provider == Provider::Together)
            .map(|c| c.usage_count)
            .collect();
        usage.sort();
        assert_eq!(usage, vec![2, 2, 3]);
        assert_eq!(vault.snapshot()[3].usage_count, 0);
    }

    #[test]
    fn test_no_eligible_credential() {
        let vault = CredentialVault::new();
        vault.register(spec("A", Provider::Gemini, 0));
        assert!(matches!(
            vault.next_credential(Provider::Gemini),
            Err(PipelineError::NoCredentialAvailable(Provider::Gemini))
        ));
        assert!(vault.next_credential(Provider::Replicate).is_err());
    }

    #[test]
    fn test_key_ring_falls_back_to_ambient_secret() {
        let vault = Arc::new(CredentialVault::new());
        let ring = KeyRing::with_fallback(vault.clone(), Provider::Gemini, Some("env".to_string()));
        assert_eq!(ring.acquire().unwrap(), "env");

        vault.register(spec("stored", Provider::Gemini, 5));
        assert_eq!(ring.acquire().unwrap(), "stored");

        let bare = KeyRing::with_fallback(vault, Provider::Replicate, None);
        assert!(bare.acquire().is_err());
    }

    #[test]
    fn test_monthly_reset_on_load() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let stale = Credential {
            id: "a".to_string(),
            key: "A".to_string(),
            provider: Provider::Gemini,
            label: "old".to_string(),
            usage_count: 1500,
            max_usage: 1500,
            reset_date: Utc.with_ymd_and_hms(2025, 2, 28, 23, 0, 0).unwrap(),
        };
        let fresh = Credential {
            id: "b".to_string(),
            label: "current".to_string(),
            usage_count: 7,
            reset_date: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            ..stale.clone()
        };
        let last_year = Credential {
            id: "c".to_string(),
            usage_count: 9,
            reset_date: Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap(),
            ..stale.clone()
        };

        let vault = CredentialVault::from_credentials(vec![stale, fresh, last_year], now);
        let snap = vault.snapshot();
        assert_eq!(snap[0].usage_count, 0);
        assert_eq!(snap[0].reset_date, now);
        assert_eq!(snap[1].usage_count, 7);
        assert_eq!(snap[2].usage_count, 0);
        assert_eq!(vault.ready_count(), 3);
    }

    #[test]
    fn test_labels() {
        let vault = CredentialVault::new();
        vault.register(spec("x", Provider::Gemini, 10));
        vault.register(CredentialSpec {
            label: Some("Personal".to_string()),
            ..spec("y", Provider::Gemini, 10)
        });
        let ids = vault.register_bulk("a1\n a2 ,, a3,\n\n", Provider::Gemini, 50);
        assert_eq!(ids.len(), 3);

        let labels: Vec<String> = vault.snapshot().into_iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec!["GEMINI Key 1", "Personal", "GEMINI Bulk 3", "GEMINI Bulk 4", "GEMINI Bulk 5"]
        );
        assert_eq!(vault.snapshot()[3].key, "a2");
        assert_eq!(vault.snapshot()[4].max_usage, 50);
    }

    #[test]
    fn test_remove_and_record_usage() {
        let vault = CredentialVault::new();
        let id = vault.register(spec("x", Provider::Together, 2));
        assert_eq!(id.len(), ID_LEN);
        assert!(vault.record_usage(&id));
        assert!(vault.record_usage(&id));
        assert_eq!(vault.ready_count(), 0);
        assert!(!vault.record_usage("missing"));
        assert!(vault.remove(&id));
        assert!(!vault.remove(&id));
        assert!(vault.snapshot().is_empty());
    }

    #[test]
    fn test_import_is_all_or_nothing() {
        let vault = CredentialVault::new();
        vault.register(spec("keep", Provider::Gemini, 10));

        assert!(vault.import_json("[{\"id\": \"broken\"}]").is_err());
        assert!(vault.import_json("{}").is_err());
        assert_eq!(vault.snapshot()[0].key, "keep");

        let exported = r#"[
  {
    "id": "k3j2h1g0f",
    "key": "AIza-imported",
    "provider": "gemini",
    "label": "GEMINI Key 1",
    "usageCount": 12,
    "maxUsage": 1500,
    "resetDate": "2025-03-02T08:15:30.000Z"
  }
]"#;
        assert_eq!(vault.import_json(exported).unwrap(), 1);
        let snap = vault.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key, "AIza-imported");
        assert_eq!(snap[0].usage_count, 12);
        assert!(vault.export_json().unwrap().contains("\"usageCount\": 12"));
    }

    #[test]
    fn test_masked_key() {
        let vault = CredentialVault::new();
        vault.register(spec("sk-123456789", Provider::Replicate, 1));
        assert_eq!(vault.snapshot()[0].masked_key(), "****6789");
    }

    #[tokio::test]
    async fn test_vault_persists_through_storage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vault.json");
        let path = path.to_str().unwrap();
        let storage = NativeStorage::new();

        let empty = CredentialVault::load(&storage, path).await?;
        assert!(empty.snapshot().is_empty());

        empty.register(spec("persisted", Provider::Gemini, 3));
        empty.next_credential(Provider::Gemini)?;
        empty.save(&storage, path).await?;

        let reloaded = CredentialVault::load(&storage, path).await?;
        let snap = reloaded.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key, "persisted");
        assert_eq!(snap[0].usage_count, 1);
        Ok(())
    }
}
