use anyhow::bail;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Merged output of one style analysis, before it becomes a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleAnalysis {
    pub artistic_style: String,
    pub visual_technique: String,
    pub palette: Vec<String>,
    pub mood_keywords: Vec<String>,
    pub suggested_name: String,
    pub reasoning: String,
    pub embedding: Option<Vec<f32>>,
    pub reference_digest: Option<String>,
}

/// Frozen copy of a profile's editable fields, taken right before a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleSnapshot {
    pub version: u64,
    pub name: String,
    pub description: String,
    pub visual_technique: String,
    pub palette: Vec<String>,
    pub moods: Vec<String>,
    pub reasoning: Option<String>,
    pub saved_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub visual_technique: String,
    pub palette: Vec<String>,
    pub moods: Vec<String>,
    #[serde(default)]
    pub reference_images: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub reference_digest: Option<String>,
    pub version: u64,
    /// Most recent first.
    #[serde(default)]
    pub history: Vec<StyleSnapshot>,
    pub created_at: String,
    pub updated_at: String,
}

/// Field-wise edit; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleEdit {
    pub name: Option<String>,
    pub description: Option<String>,
    pub visual_technique: Option<String>,
    pub palette: Option<Vec<String>>,
    pub moods: Option<Vec<String>>,
    pub reasoning: Option<String>,
}

impl StyleEdit {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.visual_technique.is_none()
            && self.palette.is_none()
            && self.moods.is_none()
            && self.reasoning.is_none()
    }
}

impl StyleProfile {
    pub fn from_analysis(analysis: StyleAnalysis, reference_images: Vec<String>) -> Self {
        let now = now_utc_iso();
        let reasoning = Some(analysis.reasoning).filter(|value| !value.trim().is_empty());
        Self {
            id: Uuid::new_v4().to_string(),
            name: analysis.suggested_name,
            description: analysis.artistic_style,
            visual_technique: analysis.visual_technique,
            palette: analysis.palette,
            moods: analysis.mood_keywords,
            reference_images,
            embedding: analysis.embedding,
            reasoning,
            reference_digest: analysis.reference_digest,
            version: 1,
            history: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> StyleSnapshot {
        StyleSnapshot {
            version: self.version,
            name: self.name.clone(),
            description: self.description.clone(),
            visual_technique: self.visual_technique.clone(),
            palette: self.palette.clone(),
            moods: self.moods.clone(),
            reasoning: self.reasoning.clone(),
            saved_at: now_utc_iso(),
        }
    }

    /// Builds the next version with `edit` applied. `self` is left untouched
    /// so a rejected edit cannot corrupt stored history.
    pub fn edited(&self, edit: &StyleEdit) -> anyhow::Result<StyleProfile> {
        if edit.is_empty() {
            bail!("edit for style '{}' changes nothing", self.id);
        }
        let mut next = self.clone();
        if let Some(name) = &edit.name {
            let name = name.trim();
            if name.is_empty() {
                bail!("style name cannot be empty");
            }
            next.name = name.to_string();
        }
        if let Some(description) = &edit.description {
            next.description = description.trim().to_string();
        }
        if let Some(technique) = &edit.visual_technique {
            next.visual_technique = technique.trim().to_string();
        }
        if let Some(palette) = &edit.palette {
            let mut normalized: Vec<String> = Vec::new();
            for raw in palette {
                let Some(hex) = normalize_hex_color(raw) else {
                    bail!("'{raw}' is not a 6-digit hex color");
                };
                if !normalized.contains(&hex) {
                    normalized.push(hex);
                }
            }
            next.palette = normalized;
        }
        if let Some(moods) = &edit.moods {
            next.moods = moods
                .iter()
                .map(|mood| mood.trim().to_string())
                .filter(|mood| !mood.is_empty())
                .collect();
        }
        if let Some(reasoning) = &edit.reasoning {
            next.reasoning = Some(reasoning.trim().to_string()).filter(|value| !value.is_empty());
        }
        if same_editable_fields(self, &next) {
            bail!("edit for style '{}' changes nothing", self.id);
        }
        Ok(self.commit(next))
    }

    /// Builds the next version with the fields of history entry `version`
    /// restored. The state being replaced is itself pushed onto history.
    pub fn reverted(&self, version: u64) -> anyhow::Result<StyleProfile> {
        if version == self.version {
            bail!("style '{}' is already at version {version}", self.id);
        }
        let Some(snapshot) = self.history.iter().find(|entry| entry.version == version) else {
            bail!("style '{}' has no version {version} in its history", self.id);
        };
        let mut next = self.clone();
        next.name = snapshot.name.clone();
        next.description = snapshot.description.clone();
        next.visual_technique = snapshot.visual_technique.clone();
        next.palette = snapshot.palette.clone();
        next.moods = snapshot.moods.clone();
        next.reasoning = snapshot.reasoning.clone();
        Ok(self.commit(next))
    }

    fn commit(&self, mut next: StyleProfile) -> StyleProfile {
        let mut history = Vec::with_capacity(self.history.len() + 1);
        history.push(self.snapshot());
        history.extend(self.history.iter().cloned());
        next.history = history;
        next.version = self.version + 1;
        next.updated_at = now_utc_iso();
        next
    }
}

fn same_editable_fields(left: &StyleProfile, right: &StyleProfile) -> bool {
    left.name == right.name
        && left.description == right.description
        && left.visual_technique == right.visual_technique
        && left.palette == right.palette
        && left.moods == right.moods
        && left.reasoning == right.reasoning
}

/// Accepts `rrggbb` with an optional `#` or `0x` prefix; returns lowercase
/// `#rrggbb`.
pub fn normalize_hex_color(value: &str) -> Option<String> {
    let raw = value.trim();
    let body = raw
        .strip_prefix('#')
        .or_else(|| raw.strip_prefix("0x"))
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if body.len() != 6 || !body.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("#{}", body.to_ascii_lowercase()))
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
