use chrono::{NaiveDate, Utc};
use palette_contracts::events::{EventWriter, SessionEvent, StageStatus};
use palette_contracts::styles::{normalize_hex_color, StyleAnalysis};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::collage::{create_reference_collage, ReferenceCollage, DEFAULT_CELL_SIZE, DEFAULT_MAX_IMAGES};
use crate::color::{extract_dominant_palette, ImageSample};
use crate::hosted::{GenerationParams, InferenceService};
use crate::mood::infer_mood_keywords;
use crate::vision_json::{extract_json_object, ParsePhase};

pub const PALETTE_SIZE: usize = 5;
pub const MAX_EXTERNAL_MOODS: usize = 6;

pub const DEFAULT_ARTISTIC_STYLE: &str = "Custom";
pub const DEFAULT_VISUAL_TECHNIQUE: &str = "Reference-guided";
pub const DEFAULT_REASONING: &str =
    "Derived from the dominant colors and overall tone of the reference images.";

const VISION_PARAMS: GenerationParams = GenerationParams {
    max_tokens: 600,
    temperature: 0.2,
};

const VISION_INSTRUCTION: &str = "You are an art director. Study the reference collage and describe its shared visual style. \
Respond with a single JSON object and nothing else, using exactly these keys: \
\"artisticStyle\" (short phrase), \"visualTechnique\" (medium or rendering technique), \
\"colorPalette\" (array of exactly 5 hex colors like \"#aabbcc\"), \
\"moodKeywords\" (array of 3 to 5 single words), \"suggestedName\" (2 to 4 words), \
\"reasoning\" (one or two sentences explaining the choices).";

/// Result of a best-effort stage: either its value or the reason the
/// deterministic fallback was used instead.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Completed(T),
    Fallback { reason: String },
}

impl<T> StageOutcome<T> {
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self::Fallback {
            reason: reason.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Fallback { .. } => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Fallback { .. } => None,
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Completed(_) => None,
            Self::Fallback { reason } => Some(reason),
        }
    }
}

/// Fields a vision model supplied, already validated. Anything missing,
/// blank or of the wrong type is absent here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalStyle {
    pub artistic_style: Option<String>,
    pub visual_technique: Option<String>,
    pub palette: Vec<String>,
    pub mood_keywords: Vec<String>,
    pub suggested_name: Option<String>,
    pub reasoning: Option<String>,
}

impl ExternalStyle {
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let palette = first_array(object, &["colorPalette", "color_palette", "palette"])
            .map(|values| {
                let mut colors: Vec<String> = Vec::new();
                for color in values
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(normalize_hex_color)
                {
                    if !colors.contains(&color) {
                        colors.push(color);
                    }
                }
                colors.truncate(PALETTE_SIZE);
                colors
            })
            .unwrap_or_default();
        let mood_keywords = first_array(object, &["moodKeywords", "mood_keywords", "moods"])
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .take(MAX_EXTERNAL_MOODS)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            artistic_style: first_text(object, &["artisticStyle", "artistic_style", "style"]),
            visual_technique: first_text(object, &["visualTechnique", "visual_technique", "technique"]),
            palette,
            mood_keywords,
            suggested_name: first_text(object, &["suggestedName", "suggested_name", "name"]),
            reasoning: first_text(object, &["reasoning"]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn first_text(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        object
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn first_array<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|key| object.get(*key).and_then(Value::as_array))
}

pub fn fallback_style_name(today: NaiveDate) -> String {
    format!("Custom Style {}", today.format("%Y-%m-%d"))
}

/// External values win when present and non-empty; otherwise the
/// deterministic palette and moods, then the fixed literals.
pub fn merge_style(
    palette: Vec<String>,
    moods: Vec<String>,
    external: &ExternalStyle,
    today: NaiveDate,
) -> StyleAnalysis {
    let pick = |value: &Option<String>, default: String| value.clone().unwrap_or(default);
    StyleAnalysis {
        artistic_style: pick(&external.artistic_style, DEFAULT_ARTISTIC_STYLE.to_string()),
        visual_technique: pick(&external.visual_technique, DEFAULT_VISUAL_TECHNIQUE.to_string()),
        palette: if external.palette.is_empty() {
            palette
        } else {
            external.palette.clone()
        },
        mood_keywords: if external.mood_keywords.is_empty() {
            moods
        } else {
            external.mood_keywords.clone()
        },
        suggested_name: pick(&external.suggested_name, fallback_style_name(today)),
        reasoning: pick(&external.reasoning, DEFAULT_REASONING.to_string()),
        embedding: None,
        reference_digest: None,
    }
}

pub fn vision_instruction() -> &'static str {
    VISION_INSTRUCTION
}

pub fn collage_digest(collage: &ReferenceCollage) -> String {
    hex::encode(Sha256::digest(&collage.png_bytes))
}

/// Runs the analysis pipeline against one set of hosted models. Holds no
/// state between calls.
pub struct StyleAnalyzer<'a> {
    service: &'a dyn InferenceService,
    vision_model: &'a str,
    embedding_model: &'a str,
    events: Option<&'a EventWriter>,
}

impl<'a> StyleAnalyzer<'a> {
    pub fn new(
        service: &'a dyn InferenceService,
        vision_model: &'a str,
        embedding_model: &'a str,
    ) -> Self {
        Self {
            service,
            vision_model,
            embedding_model,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Never fails. Every hosted stage degrades to the deterministic result.
    pub fn analyze_style(
        &self,
        images: &[ImageSample],
        on_progress: Option<&dyn Fn(&str)>,
    ) -> StyleAnalysis {
        let progress = |label: &str| {
            if let Some(callback) = on_progress {
                callback(label);
            }
        };

        progress("Extracting color palette");
        let palette = extract_dominant_palette(images, PALETTE_SIZE);
        let moods = infer_mood_keywords(&palette);

        progress("Building reference collage");
        let collage = self.build_collage(images);
        self.record_stage("collage", &collage, None);

        let (external, parse_phase) = match collage.as_option() {
            Some(collage) => {
                progress("Asking vision model");
                self.describe_collage(collage)
            }
            None => (StageOutcome::fallback("no collage available"), None),
        };
        self.record_stage("vision", &external, parse_phase);

        let mut analysis = merge_style(
            palette,
            moods,
            external.as_option().unwrap_or(&ExternalStyle::default()),
            Utc::now().date_naive(),
        );

        let embedding = match collage.as_option() {
            Some(collage) => {
                progress("Computing style embedding");
                self.embed_collage(collage)
            }
            None => StageOutcome::fallback("no collage available"),
        };
        self.record_stage("embedding", &embedding, None);

        analysis.reference_digest = collage.as_option().map(collage_digest);
        analysis.embedding = embedding.into_option();

        if let Some(events) = self.events {
            events.record_quiet(&SessionEvent::AnalysisCompleted {
                image_count: images.len(),
                palette: analysis.palette.clone(),
                mood_keywords: analysis.mood_keywords.clone(),
                suggested_name: analysis.suggested_name.clone(),
                vision_used: external.is_completed(),
                has_embedding: analysis.embedding.is_some(),
            });
        }
        analysis
    }

    fn build_collage(&self, images: &[ImageSample]) -> StageOutcome<ReferenceCollage> {
        match create_reference_collage(images, DEFAULT_CELL_SIZE, DEFAULT_MAX_IMAGES) {
            Ok(collage) => StageOutcome::Completed(collage),
            Err(err) => StageOutcome::fallback(format!("{err:#}")),
        }
    }

    /// The parse phase is `None` when no reply arrived.
    fn describe_collage(
        &self,
        collage: &ReferenceCollage,
    ) -> (StageOutcome<ExternalStyle>, Option<ParsePhase>) {
        let text = match self.service.complete_vision(
            self.vision_model,
            VISION_INSTRUCTION,
            &collage.png_bytes,
            VISION_PARAMS,
        ) {
            Ok(text) => text,
            Err(err) => return (StageOutcome::fallback(format!("{err:#}")), None),
        };
        let extracted = extract_json_object(&text);
        let parsed = ExternalStyle::from_object(&extracted.object);
        let outcome = if parsed.is_empty() {
            StageOutcome::fallback("vision response carried no usable fields")
        } else {
            StageOutcome::Completed(parsed)
        };
        (outcome, Some(extracted.phase))
    }

    fn embed_collage(&self, collage: &ReferenceCollage) -> StageOutcome<Vec<f32>> {
        match self
            .service
            .embed_image(self.embedding_model, &collage.png_bytes, "image/png")
        {
            Ok(vector) if vector.is_empty() => StageOutcome::fallback("empty embedding vector"),
            Ok(vector) => StageOutcome::Completed(vector),
            Err(err) => StageOutcome::fallback(format!("{err:#}")),
        }
    }

    fn record_stage<T>(
        &self,
        stage: &str,
        outcome: &StageOutcome<T>,
        parse_phase: Option<ParsePhase>,
    ) {
        if let Some(reason) = outcome.fallback_reason() {
            log::warn!("style analysis {stage} stage fell back: {reason}");
        }
        if let Some(events) = self.events {
            events.record_quiet(&SessionEvent::AnalysisStage {
                stage: stage.to_string(),
                status: if outcome.is_completed() {
                    StageStatus::Completed
                } else {
                    StageStatus::Fallback
                },
                reason: outcome.fallback_reason().map(str::to_string),
                parse_phase: parse_phase.map(|phase| phase.as_str().to_string()),
            });
        }
    }
}
