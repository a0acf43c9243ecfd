use similar::TextDiff;

use super::profile::{StyleProfile, StyleSnapshot};

/// What changed between two consecutive versions of a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStep {
    pub from_version: u64,
    pub to_version: u64,
    pub changes: Vec<String>,
    pub description_diff: Option<Vec<String>>,
}

/// Newest step first, walking from the live profile back through history.
pub fn describe_history(profile: &StyleProfile) -> Vec<HistoryStep> {
    let mut steps = Vec::new();
    let mut newer = profile.snapshot();
    newer.version = profile.version;
    for older in &profile.history {
        steps.push(step_between(older, &newer));
        newer = older.clone();
    }
    steps
}

fn step_between(older: &StyleSnapshot, newer: &StyleSnapshot) -> HistoryStep {
    let mut changes = Vec::new();
    if older.name != newer.name {
        changes.push(format!("name: '{}' -> '{}'", older.name, newer.name));
    }
    if older.visual_technique != newer.visual_technique {
        changes.push(format!(
            "technique: '{}' -> '{}'",
            older.visual_technique, newer.visual_technique
        ));
    }
    push_list_change(&mut changes, "palette", &older.palette, &newer.palette);
    push_list_change(&mut changes, "moods", &older.moods, &newer.moods);
    if older.reasoning != newer.reasoning {
        changes.push("reasoning updated".to_string());
    }
    let description_diff = text_diff(&older.description, &newer.description);
    if description_diff.is_some() {
        changes.push("description updated".to_string());
    }
    HistoryStep {
        from_version: older.version,
        to_version: newer.version,
        changes,
        description_diff,
    }
}

fn push_list_change(changes: &mut Vec<String>, label: &str, older: &[String], newer: &[String]) {
    if older == newer {
        return;
    }
    let added: Vec<&str> = newer
        .iter()
        .filter(|item| !older.contains(item))
        .map(String::as_str)
        .collect();
    let removed: Vec<&str> = older
        .iter()
        .filter(|item| !newer.contains(item))
        .map(String::as_str)
        .collect();
    if added.is_empty() && removed.is_empty() {
        changes.push(format!("{label}: reordered"));
        return;
    }
    let mut parts = Vec::new();
    if !added.is_empty() {
        parts.push(format!("+{}", added.join(" +")));
    }
    if !removed.is_empty() {
        parts.push(format!("-{}", removed.join(" -")));
    }
    changes.push(format!("{label}: {}", parts.join(" ")));
}

fn text_diff(prev: &str, curr: &str) -> Option<Vec<String>> {
    if prev == curr {
        return None;
    }
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    Some(rendered.lines().map(str::to_string).collect())
}
