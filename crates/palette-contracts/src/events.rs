use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Fallback,
}

/// Everything a session records. Serialized with its snake_case name under
/// `type`; `None` fields are left out of the line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        out_dir: String,
        api_base: String,
        text_model: String,
        vision_model: String,
        embedding_model: String,
        image_model: String,
        fallback_notes: Vec<String>,
    },
    AnalysisStage {
        stage: String,
        status: StageStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parse_phase: Option<String>,
    },
    AnalysisCompleted {
        image_count: usize,
        palette: Vec<String>,
        mood_keywords: Vec<String>,
        suggested_name: String,
        vision_used: bool,
        has_embedding: bool,
    },
    GenerationStarted {
        model: String,
        prompt: String,
        fused_prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        style_id: Option<String>,
        intensity: f64,
        aspect_ratio: String,
        resolution: String,
        width: u32,
        height: u32,
        reference_image_count: usize,
        input_image_count: usize,
    },
    GenerationCreated {
        image_id: String,
        image_path: String,
        width: u32,
        height: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    GenerationFailed {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        error: String,
    },
    ProfileCommitted {
        style_id: String,
        name: String,
        version: u64,
        action: String,
        persisted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        persist_error: Option<String>,
    },
    AssistantReply {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        style_id: Option<String>,
        history_turns: usize,
        reply_chars: usize,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::AnalysisStage { .. } => "analysis_stage",
            Self::AnalysisCompleted { .. } => "analysis_completed",
            Self::GenerationStarted { .. } => "generation_started",
            Self::GenerationCreated { .. } => "generation_created",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::ProfileCommitted { .. } => "profile_committed",
            Self::AssistantReply { .. } => "assistant_reply",
        }
    }
}

/// Session log at `events.jsonl`. Clones share one file and one lock, so
/// lines from different stages never interleave.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<SessionLog>,
}

#[derive(Debug)]
struct SessionLog {
    path: PathBuf,
    session_id: String,
    append: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(SessionLog {
                path: path.into(),
                session_id: session_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Stamps `session_id` and `ts` onto the event and appends it as one line.
    /// Returns the object as written.
    pub fn record(&self, event: &SessionEvent) -> Result<Map<String, Value>> {
        let Value::Object(mut line) = serde_json::to_value(event)? else {
            anyhow::bail!("{} did not serialize to an object", event.kind());
        };
        line.insert(
            "session_id".to_string(),
            Value::String(self.shared.session_id.clone()),
        );
        line.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        let mut text = serde_json::to_string(&line)?;
        text.push('\n');

        if let Some(dir) = self.shared.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("failed creating {}", dir.display()))?;
        }
        let _held = self
            .shared
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)
            .and_then(|mut file| file.write_all(text.as_bytes()))
            .with_context(|| format!("failed appending to {}", self.shared.path.display()))?;
        Ok(line)
    }

    /// For stages that must not fail their caller: a write failure is only
    /// logged.
    pub fn record_quiet(&self, event: &SessionEvent) {
        if let Err(err) = self.record(event) {
            log::warn!("dropped {} event: {err:#}", event.kind());
        }
    }
}
