use std::path::{Path, PathBuf};

use anyhow::bail;
use serde_json::{Map, Value};

use super::profile::{StyleEdit, StyleProfile};

/// Key under which the serialized profile list lives in the store file.
pub const STYLE_LIBRARY_KEY: &str = "paletteai.styleProfiles.v1";

/// Largest blob the store accepts before a write is refused.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Outcome of writing the library back to its store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persisted {
    Saved,
    /// The write did not happen; the in-memory library is still current.
    Skipped(String),
}

impl Persisted {
    pub fn is_saved(&self) -> bool {
        matches!(self, Persisted::Saved)
    }
}

/// Ordered, newest-first list of style profiles backed by one serialized blob
/// in a JSON key-value file. Other keys in the file are preserved.
#[derive(Debug, Clone)]
pub struct StyleLibrary {
    path: PathBuf,
    profiles: Vec<StyleProfile>,
    quota_bytes: usize,
    load_warning: Option<String>,
}

impl StyleLibrary {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (profiles, load_warning) = match read_blob(&path) {
            Ok(Some(blob)) => match serde_json::from_str::<Vec<StyleProfile>>(&blob) {
                Ok(profiles) => (profiles, None),
                Err(err) => (
                    Vec::new(),
                    Some(format!("stored style profiles are corrupt: {err}")),
                ),
            },
            Ok(None) => (Vec::new(), None),
            Err(err) => (Vec::new(), Some(err)),
        };
        if let Some(warning) = &load_warning {
            log::warn!("{}: {warning}; starting with an empty library", path.display());
        }
        Self {
            path,
            profiles,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            load_warning,
        }
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }

    pub fn list(&self) -> &[StyleProfile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&StyleProfile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    /// Exact id match, else a unique id prefix. A blank key matches nothing.
    pub fn resolve(&self, id_or_prefix: &str) -> anyhow::Result<&StyleProfile> {
        if id_or_prefix.trim().is_empty() {
            bail!("style id is empty");
        }
        if let Some(profile) = self.get(id_or_prefix) {
            return Ok(profile);
        }
        let matches: Vec<&StyleProfile> = self
            .profiles
            .iter()
            .filter(|profile| profile.id.starts_with(id_or_prefix))
            .collect();
        match matches.as_slice() {
            [single] => Ok(*single),
            [] => bail!("no style profile matches '{id_or_prefix}'"),
            _ => bail!("'{id_or_prefix}' matches {} style profiles", matches.len()),
        }
    }

    pub fn insert(&mut self, profile: StyleProfile) -> Persisted {
        self.profiles.retain(|existing| existing.id != profile.id);
        self.profiles.insert(0, profile);
        self.persist()
    }

    pub fn commit_edit(
        &mut self,
        id: &str,
        edit: &StyleEdit,
    ) -> anyhow::Result<(StyleProfile, Persisted)> {
        let next = self.resolve(id)?.edited(edit)?;
        Ok(self.replace(next))
    }

    pub fn revert(&mut self, id: &str, version: u64) -> anyhow::Result<(StyleProfile, Persisted)> {
        let next = self.resolve(id)?.reverted(version)?;
        Ok(self.replace(next))
    }

    pub fn remove(&mut self, id: &str) -> anyhow::Result<(StyleProfile, Persisted)> {
        let target = self.resolve(id)?.id.clone();
        let Some(index) = self.profiles.iter().position(|profile| profile.id == target) else {
            bail!("no style profile matches '{id}'");
        };
        let removed = self.profiles.remove(index);
        let persisted = self.persist();
        Ok((removed, persisted))
    }

    fn replace(&mut self, next: StyleProfile) -> (StyleProfile, Persisted) {
        if let Some(slot) = self.profiles.iter_mut().find(|profile| profile.id == next.id) {
            *slot = next.clone();
        }
        let persisted = self.persist();
        (next, persisted)
    }

    pub fn persist(&self) -> Persisted {
        let outcome = self.try_persist();
        if let Persisted::Skipped(reason) = &outcome {
            log::warn!(
                "style library not saved to {}: {reason}",
                self.path.display()
            );
        }
        outcome
    }

    fn try_persist(&self) -> Persisted {
        let blob = match serde_json::to_string(&self.profiles) {
            Ok(blob) => blob,
            Err(err) => return Persisted::Skipped(format!("serialization failed: {err}")),
        };
        if blob.len() > self.quota_bytes {
            return Persisted::Skipped(format!(
                "quota exceeded ({} bytes > {} bytes)",
                blob.len(),
                self.quota_bytes
            ));
        }
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        on_disk.insert(STYLE_LIBRARY_KEY.to_string(), Value::String(blob));
        match write_json_object(&self.path, &on_disk) {
            Ok(()) => Persisted::Saved,
            Err(err) => Persisted::Skipped(format!("{err:#}")),
        }
    }
}

fn read_blob(path: &Path) -> Result<Option<String>, String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("store unreadable: {err}")),
    };
    let parsed: Value =
        serde_json::from_str(&raw).map_err(|err| format!("store is not valid JSON: {err}"))?;
    match parsed.get(STYLE_LIBRARY_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(blob)) => Ok(Some(blob.clone())),
        Some(_) => Err(format!("'{STYLE_LIBRARY_KEY}' is not a serialized blob")),
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{Persisted, StyleLibrary, STYLE_LIBRARY_KEY};
    use crate::styles::{StyleAnalysis, StyleEdit, StyleProfile};

    fn profile(name: &str) -> StyleProfile {
        StyleProfile::from_analysis(
            StyleAnalysis {
                artistic_style: "Bauhaus".to_string(),
                visual_technique: "flat vector".to_string(),
                palette: vec!["#e63946".to_string(), "#1d3557".to_string()],
                mood_keywords: vec![
                    "balanced".to_string(),
                    "vibrant".to_string(),
                    "stylized".to_string(),
                ],
                suggested_name: name.to_string(),
                reasoning: "Primary shapes.".to_string(),
                embedding: None,
                reference_digest: None,
            },
            Vec::new(),
        )
    }

    #[test]
    fn insert_persists_newest_first_and_reloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        let mut library = StyleLibrary::open(&path);
        assert_eq!(library.insert(profile("first")), Persisted::Saved);
        assert_eq!(library.insert(profile("second")), Persisted::Saved);

        let reloaded = StyleLibrary::open(&path);
        let names: Vec<&str> = reloaded.list().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["second", "first"]);
        assert!(reloaded.load_warning().is_none());

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert!(raw[STYLE_LIBRARY_KEY].is_string());
        Ok(())
    }

    #[test]
    fn unrelated_keys_in_store_survive_writes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        std::fs::write(&path, json!({"theme": "dark"}).to_string())?;
        let mut library = StyleLibrary::open(&path);
        library.insert(profile("kept"));

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["theme"], json!("dark"));
        Ok(())
    }

    #[test]
    fn corrupt_blob_loads_empty_with_warning() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        std::fs::write(&path, json!({ STYLE_LIBRARY_KEY: "[{not json" }).to_string())?;
        let library = StyleLibrary::open(&path);
        assert!(library.list().is_empty());
        assert!(library.load_warning().is_some());

        std::fs::write(&path, "garbage")?;
        let library = StyleLibrary::open(&path);
        assert!(library.list().is_empty());
        assert!(library.load_warning().is_some());
        Ok(())
    }

    #[test]
    fn quota_overflow_keeps_memory_authoritative() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        let mut library = StyleLibrary::open(&path).with_quota(64);
        let outcome = library.insert(profile("too big"));
        assert!(matches!(outcome, Persisted::Skipped(ref reason) if reason.contains("quota")));
        assert_eq!(library.list().len(), 1);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn edit_revert_and_remove_go_through_history() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        let mut library = StyleLibrary::open(&path);
        let original = profile("Poster");
        let id = original.id.clone();
        library.insert(original);

        let (edited, persisted) = library.commit_edit(
            &id[..8],
            &StyleEdit {
                description: Some("Swiss poster".to_string()),
                ..StyleEdit::default()
            },
        )?;
        assert!(persisted.is_saved());
        assert_eq!(edited.version, 2);

        let (reverted, _) = library.revert(&id, 1)?;
        assert_eq!(reverted.version, 3);
        assert_eq!(reverted.description, "Bauhaus");

        let reloaded = StyleLibrary::open(&path);
        let stored = reloaded.get(&id).cloned().unwrap_or_else(|| profile("missing"));
        assert_eq!(stored.version, 3);
        assert_eq!(stored.history.len(), 2);

        let (removed, _) = library.remove(&id)?;
        assert_eq!(removed.id, id);
        assert!(library.list().is_empty());
        assert!(library.remove(&id).is_err());
        assert!(StyleLibrary::open(&path).list().is_empty());
        Ok(())
    }

    #[test]
    fn blank_id_never_resolves() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        let mut library = StyleLibrary::open(&path);
        library.insert(profile("only"));

        for blank in ["", "   "] {
            let err = library.resolve(blank).map(|p| p.id.clone()).unwrap_err();
            assert!(err.to_string().contains("empty"));
        }
        assert!(library.remove("").is_err());
        assert_eq!(StyleLibrary::open(&path).list().len(), 1);
        Ok(())
    }
}
