use serde_json::{Map, Value};

/// Which phase of [`extract_json_object`] produced the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    Direct,
    BraceSpan,
    Empty,
}

impl ParsePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::BraceSpan => "brace_span",
            Self::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedJson {
    pub object: Map<String, Value>,
    pub phase: ParsePhase,
}

/// Pulls one JSON object out of free-form model text. Never fails: fences
/// are stripped, then the whole text is parsed, then the span from the first
/// `{` to the last `}`. Anything else yields an empty object.
pub fn extract_json_object(text: &str) -> ExtractedJson {
    let raw = strip_code_fences(text);
    if let Some(object) = parse_object(&raw) {
        return ExtractedJson {
            object,
            phase: ParsePhase::Direct,
        };
    }
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            if let Some(object) = parse_object(&raw[start..=end]) {
                return ExtractedJson {
                    object,
                    phase: ParsePhase::BraceSpan,
                };
            }
        }
    }
    ExtractedJson {
        object: Map::new(),
        phase: ParsePhase::Empty,
    }
}

pub fn strip_code_fences(text: &str) -> String {
    let mut body = text.trim().to_string();
    for marker in ["```json", "```JSON", "```"] {
        body = body.replace(marker, "");
    }
    body.trim().to_string()
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}
