use palette_contracts::styles::StyleProfile;

/// Below this intensity the style is not mentioned at all.
pub const MIN_STYLE_INTENSITY: f64 = 0.15;
const PALETTE_HINT_COLORS: usize = 5;

/// The parts of a style that can steer a prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct StyleHints<'a> {
    pub palette: &'a [String],
    pub moods: &'a [String],
    pub visual_technique: &'a str,
}

impl<'a> From<&'a StyleProfile> for StyleHints<'a> {
    fn from(profile: &'a StyleProfile) -> Self {
        Self {
            palette: &profile.palette,
            moods: &profile.moods,
            visual_technique: &profile.visual_technique,
        }
    }
}

pub fn strength_label(intensity: f64) -> &'static str {
    if intensity >= 0.8 {
        "strict"
    } else if intensity >= 0.4 {
        "balanced"
    } else {
        "subtle"
    }
}

/// Appends `Style guidance (<strength>, <pct>%): <hints>` to `user_prompt`.
/// Intensity is clamped to `[0, 1]`; NaN counts as zero.
pub fn fuse_prompt(user_prompt: &str, style: &StyleHints<'_>, intensity: f64) -> String {
    let intensity = if intensity.is_nan() {
        0.0
    } else {
        intensity.clamp(0.0, 1.0)
    };
    if intensity < MIN_STYLE_INTENSITY {
        return user_prompt.to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    let technique = style.visual_technique.trim();
    if !technique.is_empty() {
        parts.push(format!("Technique: {technique}."));
    }
    let moods: Vec<&str> = style
        .moods
        .iter()
        .map(|mood| mood.trim())
        .filter(|mood| !mood.is_empty())
        .collect();
    if !moods.is_empty() {
        parts.push(format!("Mood: {}.", moods.join(", ")));
    }
    let colors: Vec<&str> = style
        .palette
        .iter()
        .take(PALETTE_HINT_COLORS)
        .map(String::as_str)
        .collect();
    if !colors.is_empty() {
        parts.push(format!("Palette: {}.", colors.join(", ")));
    }
    if parts.is_empty() {
        return user_prompt.to_string();
    }

    let percent = (intensity * 100.0).round() as u32;
    format!(
        "{user_prompt}\n\nStyle guidance ({}, {percent}%): {}",
        strength_label(intensity),
        parts.join(" ")
    )
}
