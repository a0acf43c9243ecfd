use crate::color::parse_hex_rgb;

/// Returned when there is no palette to judge.
pub const DEFAULT_MOODS: [&str; 3] = ["balanced", "clean", "modern"];

const DARK_BELOW: f64 = 0.35;
const LIGHT_ABOVE: f64 = 0.7;
const VIBRANT_ABOVE: f64 = 0.35;

/// Three tags in fixed order: brightness tag, chroma tag, `"stylized"`.
pub fn infer_mood_keywords(palette: &[String]) -> Vec<String> {
    let channels: Vec<(f64, f64, f64)> = palette
        .iter()
        .filter_map(|hex| parse_hex_rgb(hex))
        .map(|(r, g, b)| (f64::from(r), f64::from(g), f64::from(b)))
        .collect();
    if channels.is_empty() {
        return DEFAULT_MOODS.iter().map(|tag| tag.to_string()).collect();
    }

    let count = channels.len() as f64;
    let (sum_r, sum_g, sum_b) = channels.iter().fold((0.0, 0.0, 0.0), |acc, rgb| {
        (acc.0 + rgb.0, acc.1 + rgb.1, acc.2 + rgb.2)
    });
    let (r, g, b) = (sum_r / count, sum_g / count, sum_b / count);

    let brightness = (0.2126 * r + 0.7152 * g + 0.0722 * b) / 255.0;
    let brightness_tag = if brightness < DARK_BELOW {
        "moody"
    } else if brightness > LIGHT_ABOVE {
        "airy"
    } else {
        "balanced"
    };

    let chroma = (r.max(g).max(b) - r.min(g).min(b)) / 255.0;
    let chroma_tag = if chroma > VIBRANT_ABOVE {
        "vibrant"
    } else {
        "muted"
    };

    vec![
        brightness_tag.to_string(),
        chroma_tag.to_string(),
        "stylized".to_string(),
    ]
}
