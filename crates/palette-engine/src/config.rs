use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use palette_contracts::models::{ModelRole, ModelSelector};

pub const DEFAULT_API_BASE: &str = "https://api-inference.huggingface.co";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Endpoint, credential and model choice per role. Resolved once and handed
/// to whatever talks to the hosted services.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub text_model: String,
    pub vision_model: String,
    pub embedding_model: String,
    pub image_model: String,
    pub timeout: Duration,
    /// One note per role that fell back to its default.
    pub fallback_notes: Vec<String>,
}

impl InferenceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let first_non_empty = |keys: &[&str]| -> Option<String> {
            keys.iter().find_map(|key| {
                lookup(key)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
        };

        let api_base = first_non_empty(&["PALETTE_API_BASE"])
            .map(|value| value.trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_key = first_non_empty(&["HF_TOKEN", "HUGGINGFACE_API_KEY"]);
        let timeout_secs = first_non_empty(&["PALETTE_HTTP_TIMEOUT_SECS"])
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let selector = ModelSelector::new(None);
        let mut fallback_notes = Vec::new();
        let mut pick = |role: ModelRole| -> Result<String> {
            let requested = first_non_empty(&[role.env_key()]);
            let selection = selector
                .select(requested.as_deref(), role)
                .map_err(|err| anyhow!(err))?;
            if requested.is_some() {
                if let Some(reason) = selection.fallback_reason {
                    fallback_notes.push(format!("{}: {reason}", role.capability()));
                }
            }
            Ok(selection.model.name)
        };

        Ok(Self {
            text_model: pick(ModelRole::Text)?,
            vision_model: pick(ModelRole::Vision)?,
            embedding_model: pick(ModelRole::Embedding)?,
            image_model: pick(ModelRole::Image)?,
            api_base,
            api_key,
            timeout: Duration::from_secs(timeout_secs),
            fallback_notes,
        })
    }

    pub fn model(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Text => &self.text_model,
            ModelRole::Vision => &self.vision_model,
            ModelRole::Embedding => &self.embedding_model,
            ModelRole::Image => &self.image_model,
        }
    }
}
