pub mod analysis;
pub mod assistant;
pub mod collage;
pub mod color;
pub mod config;
pub mod fusion;
pub mod gateway;
pub mod hosted;
pub mod mood;
pub mod samples;
pub mod vision_json;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use palette_contracts::events::{EventWriter, SessionEvent};
use palette_contracts::gallery::{GalleryWriter, GeneratedImage};
use palette_contracts::styles::{Persisted, StyleAnalysis, StyleLibrary, StyleProfile};

pub use analysis::{merge_style, ExternalStyle, StageOutcome, StyleAnalyzer};
pub use assistant::{format_dialogue_prompt, DialogueTurn, Role, StyleAssistant};
pub use collage::{create_reference_collage, ReferenceCollage};
pub use color::{extract_dominant_palette, ImageSample};
pub use config::InferenceConfig;
pub use fusion::{fuse_prompt, StyleHints};
pub use gateway::{
    generate_styled_image, target_size, AspectRatio, GeneratedOutput, GenerationRequest,
    Resolution,
};
pub use hosted::{HttpInferenceService, InferenceService, UpstreamError};
pub use mood::infer_mood_keywords;
pub use samples::load_image_samples;


/// Options for one styled generation.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions<'a> {
    pub prompt: &'a str,
    pub style: Option<&'a StyleProfile>,
    pub intensity: f64,
    pub aspect_ratio: AspectRatio,
    pub resolution: Resolution,
    pub reference_images: &'a [PathBuf],
    pub input_images: &'a [PathBuf],
}

/// Session-scoped wiring of config, hosted client, events and gallery.
pub struct PaletteEngine {
    out_dir: PathBuf,
    session_id: String,
    events: EventWriter,
    gallery: GalleryWriter,
    config: InferenceConfig,
    service: Box<dyn InferenceService>,
}

impl PaletteEngine {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        config: InferenceConfig,
    ) -> Result<Self> {
        let service = HttpInferenceService::new(&config)?;
        Self::with_service(out_dir, events_path, config, Box::new(service))
    }

    pub fn with_service(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        config: InferenceConfig,
        service: Box<dyn InferenceService>,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed creating {}", out_dir.display()))?;
        let session_id = out_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("palette-session")
            .to_string();
        let events = EventWriter::new(events_path.into(), session_id.clone());
        let gallery = GalleryWriter::new(out_dir.join("gallery.jsonl"));

        for note in &config.fallback_notes {
            log::warn!("model selection fell back: {note}");
        }
        events.record(&SessionEvent::SessionStarted {
            out_dir: out_dir.to_string_lossy().to_string(),
            api_base: config.api_base.clone(),
            text_model: config.text_model.clone(),
            vision_model: config.vision_model.clone(),
            embedding_model: config.embedding_model.clone(),
            image_model: config.image_model.clone(),
            fallback_notes: config.fallback_notes.clone(),
        })?;

        Ok(Self {
            out_dir,
            session_id,
            events,
            gallery,
            config,
            service,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn gallery(&self) -> &GalleryWriter {
        &self.gallery
    }

    /// Decode failures are fatal; hosted stages only degrade.
    pub fn analyze(
        &self,
        paths: &[PathBuf],
        on_progress: Option<&dyn Fn(&str)>,
    ) -> Result<StyleAnalysis> {
        let images = load_image_samples(paths)?;
        Ok(StyleAnalyzer::new(
            self.service.as_ref(),
            &self.config.vision_model,
            &self.config.embedding_model,
        )
        .with_events(&self.events)
        .analyze_style(&images, on_progress))
    }

    pub fn create_profile(
        &self,
        paths: &[PathBuf],
        on_progress: Option<&dyn Fn(&str)>,
    ) -> Result<StyleProfile> {
        let analysis = self.analyze(paths, on_progress)?;
        let references = paths
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        Ok(StyleProfile::from_analysis(analysis, references))
    }

    /// Stores `profile` at the head of `library` and records the commit.
    pub fn commit_profile(
        &self,
        library: &mut StyleLibrary,
        profile: StyleProfile,
        action: &str,
    ) -> Persisted {
        let (style_id, name, version) = (profile.id.clone(), profile.name.clone(), profile.version);
        let persisted = library.insert(profile);
        let persist_error = match &persisted {
            Persisted::Saved => None,
            Persisted::Skipped(reason) => Some(reason.clone()),
        };
        self.events.record_quiet(&SessionEvent::ProfileCommitted {
            style_id,
            name,
            version,
            action: action.to_string(),
            persisted: persisted.is_saved(),
            persist_error,
        });
        persisted
    }

    pub fn fuse(&self, prompt: &str, style: Option<&StyleProfile>, intensity: f64) -> String {
        match style {
            Some(profile) => fuse_prompt(prompt, &StyleHints::from(profile), intensity),
            None => prompt.to_string(),
        }
    }

    /// Fuse, generate, write the PNG, then append the gallery record.
    pub fn generate(&self, options: &GenerateOptions<'_>) -> Result<GeneratedImage> {
        let fused_prompt = self.fuse(options.prompt, options.style, options.intensity);
        let request = GenerationRequest {
            prompt: options.prompt.to_string(),
            fused_prompt: fused_prompt.clone(),
            reference_images: read_all(options.reference_images)?,
            input_images: read_all(options.input_images)?,
            aspect_ratio: options.aspect_ratio,
            resolution: options.resolution,
        };
        let (width, height) = target_size(request.aspect_ratio, request.resolution);
        let style_id = options.style.map(|profile| profile.id.clone());
        let model = self.config.image_model.as_str();

        self.events.record(&SessionEvent::GenerationStarted {
            model: model.to_string(),
            prompt: options.prompt.to_string(),
            fused_prompt: fused_prompt.clone(),
            style_id: style_id.clone(),
            intensity: options.intensity,
            aspect_ratio: request.aspect_ratio.to_string(),
            resolution: request.resolution.to_string(),
            width,
            height,
            reference_image_count: request.reference_images.len(),
            input_image_count: request.input_images.len(),
        })?;

        let output = match generate_styled_image(self.service.as_ref(), model, &request) {
            Ok(output) => output,
            Err(err) => {
                let status = err
                    .downcast_ref::<UpstreamError>()
                    .map(|upstream| upstream.status);
                self.events.record_quiet(&SessionEvent::GenerationFailed {
                    model: model.to_string(),
                    status,
                    error: format!("{err:#}"),
                });
                return Err(err);
            }
        };

        let file_name = format!("palette-{}.png", Utc::now().format("%Y%m%dT%H%M%S%3f"));
        let image_path = self.out_dir.join(file_name);
        output
            .image
            .save(&image_path)
            .with_context(|| format!("failed writing {}", image_path.display()))?;

        let record = GeneratedImage::new(
            options.prompt,
            &fused_prompt,
            style_id.as_deref(),
            request.aspect_ratio.as_str(),
            request.resolution.as_str(),
            &image_path,
            output.image.width(),
            output.image.height(),
        );
        self.gallery.record(&record)?;
        self.events.record(&SessionEvent::GenerationCreated {
            image_id: record.id.clone(),
            image_path: record.image_path.clone(),
            width: record.width,
            height: record.height,
            mime_type: output.mime_type,
        })?;
        Ok(record)
    }

    pub fn ask(
        &self,
        style: Option<&StyleProfile>,
        history: &[DialogueTurn],
        question: &str,
    ) -> Result<String> {
        StyleAssistant::new(self.service.as_ref(), &self.config.text_model)
            .with_events(&self.events)
            .ask(style, history, question)
    }
}

fn read_all(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths
        .iter()
        .map(|path| std::fs::read(path).with_context(|| format!("failed reading {}", path.display())))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use serde_json::Value;

    use crate::hosted::{GenerationParams, ImageBytes, InferenceService, UpstreamError};

    enum ImageReply {
        Bytes(Result<Vec<u8>, String>),
        Status(u16, String),
    }

    /// Canned replies per operation; records what it was asked.
    pub struct FakeService {
        vision: Result<String, String>,
        text: Result<String, String>,
        image: ImageReply,
        embedding: Result<Vec<f32>, String>,
        vision_models: Mutex<Vec<String>>,
        text_prompts: Mutex<Vec<String>>,
        image_payloads: Mutex<Vec<Value>>,
    }

    impl Default for FakeService {
        fn default() -> Self {
            Self {
                vision: Ok("{}".to_string()),
                text: Err("no text reply configured".to_string()),
                image: ImageReply::Bytes(Err("no image reply configured".to_string())),
                embedding: Ok(Vec::new()),
                vision_models: Mutex::new(Vec::new()),
                text_prompts: Mutex::new(Vec::new()),
                image_payloads: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeService {
        pub fn with_vision(mut self, reply: Result<String, String>) -> Self {
            self.vision = reply;
            self
        }

        pub fn with_text(mut self, reply: Result<String, String>) -> Self {
            self.text = reply;
            self
        }

        pub fn with_image(mut self, reply: Result<Vec<u8>, String>) -> Self {
            self.image = ImageReply::Bytes(reply);
            self
        }

        pub fn with_image_status(mut self, status: u16, body: &str) -> Self {
            self.image = ImageReply::Status(status, body.to_string());
            self
        }

        pub fn with_embedding(mut self, reply: Result<Vec<f32>, String>) -> Self {
            self.embedding = reply;
            self
        }

        pub fn vision_models(&self) -> Vec<String> {
            self.vision_models.lock().unwrap().clone()
        }

        pub fn text_prompts(&self) -> Vec<String> {
            self.text_prompts.lock().unwrap().clone()
        }

        pub fn image_payloads(&self) -> Vec<Value> {
            self.image_payloads.lock().unwrap().clone()
        }
    }

    impl InferenceService for FakeService {
        fn complete_vision(
            &self,
            model: &str,
            _instruction: &str,
            _image_png: &[u8],
            _params: GenerationParams,
        ) -> Result<String> {
            self.vision_models.lock().unwrap().push(model.to_string());
            self.vision.clone().map_err(|err| anyhow!(err))
        }

        fn generate_text(&self, _model: &str, prompt: &str, _params: GenerationParams) -> Result<String> {
            self.text_prompts.lock().unwrap().push(prompt.to_string());
            self.text.clone().map_err(|err| anyhow!(err))
        }

        fn generate_image(&self, _model: &str, payload: &Value) -> Result<ImageBytes> {
            self.image_payloads.lock().unwrap().push(payload.clone());
            match &self.image {
                ImageReply::Bytes(Ok(bytes)) => Ok(ImageBytes {
                    bytes: bytes.clone(),
                    mime_type: Some("image/png".to_string()),
                }),
                ImageReply::Bytes(Err(err)) => Err(anyhow!(err.clone())),
                ImageReply::Status(status, body) => Err(UpstreamError {
                    service: "image generation".to_string(),
                    status: *status,
                    body: body.clone(),
                    hint: None,
                }
                .into()),
            }
        }

        fn embed_image(&self, _model: &str, _bytes: &[u8], _content_type: &str) -> Result<Vec<f32>> {
            self.embedding.clone().map_err(|err| anyhow!(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use image::{ImageFormat, Rgba, RgbaImage};
    use palette_contracts::styles::StyleLibrary;
    use serde_json::Value;

    use super::testing::FakeService;
    use super::{AspectRatio, GenerateOptions, InferenceConfig, PaletteEngine, Resolution};

    fn png_bytes(color: [u8; 4], width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbaImage::from_pixel(width, height, Rgba(color))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn engine(dir: &std::path::Path, service: FakeService) -> anyhow::Result<PaletteEngine> {
        PaletteEngine::with_service(
            dir.join("session-a"),
            dir.join("session-a").join("events.jsonl"),
            InferenceConfig::from_lookup(|_| None)?,
            Box::new(service),
        )
    }

    fn event_types(path: &std::path::Path) -> anyhow::Result<Vec<String>> {
        Ok(std::fs::read_to_string(path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect())
    }

    #[test]
    fn profile_from_reference_files_is_committed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("ref.png");
        std::fs::write(&reference, png_bytes([200, 30, 30, 255], 24, 24))?;
        let engine = engine(
            temp.path(),
            FakeService::default().with_vision(Ok("{\"suggestedName\": \"Red Room\"}".to_string())),
        )?;
        assert_eq!(engine.session_id(), "session-a");

        let profile = engine.create_profile(&[reference.clone()], None)?;
        assert_eq!(profile.name, "Red Room");
        assert_eq!(profile.version, 1);
        assert_eq!(profile.reference_images, vec![reference.to_string_lossy().to_string()]);
        assert_eq!(profile.palette, vec!["#c81818"]);

        let mut library = StyleLibrary::open(temp.path().join("library.json"));
        assert!(engine.commit_profile(&mut library, profile.clone(), "created").is_saved());
        assert_eq!(library.list()[0].id, profile.id);

        let types = event_types(&temp.path().join("session-a").join("events.jsonl"))?;
        assert_eq!(types.first().map(String::as_str), Some("session_started"));
        assert_eq!(types.last().map(String::as_str), Some("profile_committed"));
        Ok(())
    }

    #[test]
    fn generate_writes_png_and_gallery_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = engine(
            temp.path(),
            FakeService::default().with_image(Ok(png_bytes([1, 2, 3, 255], 16, 9))),
        )?;
        let no_paths: Vec<PathBuf> = Vec::new();
        let record = engine.generate(&GenerateOptions {
            prompt: "a harbor at dusk",
            intensity: 0.9,
            aspect_ratio: AspectRatio::Widescreen,
            resolution: Resolution::OneK,
            reference_images: &no_paths,
            input_images: &no_paths,
            ..GenerateOptions::default()
        })?;

        assert!(PathBuf::from(&record.image_path).exists());
        assert_eq!((record.width, record.height), (16, 9));
        assert_eq!(record.aspect_ratio, "16:9");
        assert_eq!(record.fused_prompt, "a harbor at dusk");
        assert_eq!(engine.gallery().load(), vec![record]);

        let types = event_types(&temp.path().join("session-a").join("events.jsonl"))?;
        assert_eq!(
            types,
            vec!["session_started", "generation_started", "generation_created"]
        );
        Ok(())
    }

    #[test]
    fn failed_generation_is_recorded_and_returned() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = engine(temp.path(), FakeService::default().with_image_status(404, "missing"))?;
        let err = engine
            .generate(&GenerateOptions {
                prompt: "x",
                ..GenerateOptions::default()
            })
            .err()
            .unwrap();
        assert!(format!("{err}").contains("check model access/configuration"));
        assert!(engine.gallery().load().is_empty());

        let types = event_types(&temp.path().join("session-a").join("events.jsonl"))?;
        assert_eq!(types.last().map(String::as_str), Some("generation_failed"));
        Ok(())
    }
}
