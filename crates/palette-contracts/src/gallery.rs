use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One generated output and the request that produced it. Never mutated once
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub prompt: String,
    pub fused_prompt: String,
    pub style_id: Option<String>,
    pub created_at: String,
    pub aspect_ratio: String,
    pub resolution: String,
    pub image_path: String,
    pub width: u32,
    pub height: u32,
}

impl GeneratedImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prompt: &str,
        fused_prompt: &str,
        style_id: Option<&str>,
        aspect_ratio: &str,
        resolution: &str,
        image_path: &Path,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            fused_prompt: fused_prompt.to_string(),
            style_id: style_id.map(str::to_string),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            aspect_ratio: aspect_ratio.to_string(),
            resolution: resolution.to_string(),
            image_path: image_path.to_string_lossy().to_string(),
            width,
            height,
        }
    }
}

/// Appends generated-image records to a JSONL file.
#[derive(Debug, Clone)]
pub struct GalleryWriter {
    path: PathBuf,
}

impl GalleryWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, image: &GeneratedImage) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        use std::io::Write;
        file.write_all(serde_json::to_string(image)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Oldest first; unreadable lines are skipped.
    pub fn load(&self) -> Vec<GeneratedImage> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<GeneratedImage>(line).ok())
            .collect()
    }
}
