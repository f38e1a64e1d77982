use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Credential providers known to the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    Together,
    Replicate,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Gemini, Provider::Together, Provider::Replicate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::Together => "together",
            Provider::Replicate => "replicate",
        }
    }

    /// Environment variable holding the ambient default secret for this provider.
    pub fn fallback_env_var(&self) -> &'static str {
        match self {
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Together => "TOGETHER_API_KEY",
            Provider::Replicate => "REPLICATE_API_TOKEN",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "together" => Ok(Provider::Together),
            "replicate" => Ok(Provider::Replicate),
            other => Err(anyhow::anyhow!("Unknown credential provider: {}", other)),
        }
    }
}

/// Failures that cross the retry and orchestration seams and therefore need to be
/// classified. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Could not find any scenes. Ensure SCENE 1 headers are present.")]
    NoScenesFound,

    #[error("No usable {0} credential in the vault")]
    NoCredentialAvailable(Provider),

    #[error("{message}")]
    RateLimited { status: Option<u16>, message: String },

    #[error("{message}")]
    RetriesExhausted {
        context: String,
        attempts: u32,
        message: String,
    },

    #[error("{message}")]
    Provider { status: Option<u16>, message: String },

    #[error("Cannot move production from {from} to {to}")]
    InvalidPhase { from: String, to: String },
}

const RATE_LIMIT_MARKERS: [&str; 4] = ["429", "quota", "too many requests", "resource_exhausted"];

impl PipelineError {
    pub fn provider(message: impl Into<String>) -> Self {
        PipelineError::Provider {
            status: None,
            message: message.into(),
        }
    }

    /// Builds the error for a non-success HTTP response, promoting 429 to `RateLimited`.
    pub fn from_response(status: u16, body: String) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            body
        };
        if status == 429 {
            PipelineError::RateLimited {
                status: Some(status),
                message,
            }
        } else {
            PipelineError::Provider {
                status: Some(status),
                message,
            }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            PipelineError::RateLimited { status, .. } | PipelineError::Provider { status, .. } => {
                *status
            }
            _ => None,
        }
    }

    /// True when the failure carries a "too many requests" signal.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            PipelineError::RateLimited { .. } => true,
            PipelineError::Provider { status, message } => {
                if *status == Some(429) {
                    return true;
                }
                let lower = message.to_lowercase();
                RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Provider {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_classification() {
        assert!(PipelineError::from_response(429, String::new()).is_rate_limited());
        assert!(PipelineError::provider("got status 429 from upstream").is_rate_limited());
        assert!(PipelineError::provider("You exceeded your current QUOTA").is_rate_limited());
        assert!(PipelineError::provider("{\"status\": \"RESOURCE_EXHAUSTED\"}").is_rate_limited());
        assert!(!PipelineError::from_response(500, "boom".to_string()).is_rate_limited());
        assert!(!PipelineError::NoScenesFound.is_rate_limited());
    }

    #[test]
    fn test_retries_exhausted_displays_last_message() {
        let err = PipelineError::RetriesExhausted {
            context: "Image Generation 1".to_string(),
            attempts: 3,
            message: "quota exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn test_provider_round_trips_through_str() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
        assert!("openai".parse::<Provider>().is_err());
    }
}
