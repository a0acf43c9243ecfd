use anyhow::{bail, Result};
use palette_contracts::events::{EventWriter, SessionEvent};
use palette_contracts::styles::StyleProfile;
use serde::{Deserialize, Serialize};

use crate::hosted::{GenerationParams, InferenceService};

const ASSISTANT_PARAMS: GenerationParams = GenerationParams {
    max_tokens: 400,
    temperature: 0.7,
};
const MAX_HISTORY_TURNS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub role: Role,
    pub content: String,
}

impl DialogueTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One `Role: text` line per turn, blank turns skipped, closed by an
/// `Assistant:` cue.
pub fn format_dialogue_prompt(system: Option<&str>, turns: &[DialogueTurn]) -> String {
    let mut lines = Vec::with_capacity(turns.len() + 2);
    if let Some(system) = system.map(str::trim).filter(|value| !value.is_empty()) {
        lines.push(format!("{}: {system}", Role::System.label()));
    }
    for turn in turns {
        let content = turn.content.trim();
        if content.is_empty() {
            continue;
        }
        lines.push(format!("{}: {content}", turn.role.label()));
    }
    lines.push(format!("{}:", Role::Assistant.label()));
    lines.join("\n")
}

pub fn style_context(profile: Option<&StyleProfile>) -> String {
    let mut context = String::from(
        "You are a concise creative assistant helping refine image prompts and visual styles.",
    );
    if let Some(profile) = profile {
        context.push_str(&format!(
            " The active style is \"{}\": {}. Technique: {}.",
            profile.name, profile.description, profile.visual_technique
        ));
        if !profile.moods.is_empty() {
            context.push_str(&format!(" Mood: {}.", profile.moods.join(", ")));
        }
        if !profile.palette.is_empty() {
            context.push_str(&format!(" Palette: {}.", profile.palette.join(", ")));
        }
    }
    context
}

/// Answers style questions with the text model.
pub struct StyleAssistant<'a> {
    service: &'a dyn InferenceService,
    model: &'a str,
    events: Option<&'a EventWriter>,
}

impl<'a> StyleAssistant<'a> {
    pub fn new(service: &'a dyn InferenceService, model: &'a str) -> Self {
        Self {
            service,
            model,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ask(
        &self,
        profile: Option<&StyleProfile>,
        history: &[DialogueTurn],
        question: &str,
    ) -> Result<String> {
        let question = question.trim();
        if question.is_empty() {
            bail!("question is empty");
        }
        let recent = &history[history.len().saturating_sub(MAX_HISTORY_TURNS)..];
        let mut turns = recent.to_vec();
        turns.push(DialogueTurn::user(question));
        let prompt = format_dialogue_prompt(Some(&style_context(profile)), &turns);

        let reply = self
            .service
            .generate_text(self.model, &prompt, ASSISTANT_PARAMS)?;
        let reply = reply.trim();
        if reply.is_empty() {
            bail!("text model '{}' returned an empty reply", self.model);
        }
        if let Some(events) = self.events {
            events.record_quiet(&SessionEvent::AssistantReply {
                model: self.model.to_string(),
                style_id: profile.map(|profile| profile.id.clone()),
                history_turns: recent.len(),
                reply_chars: reply.chars().count(),
            });
        }
        Ok(reply.to_string())
    }
}
