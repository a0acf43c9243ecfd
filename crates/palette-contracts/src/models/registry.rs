use indexmap::IndexMap;

/// The four jobs a hosted model can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Text,
    Vision,
    Embedding,
    Image,
}

impl ModelRole {
    pub const ALL: [ModelRole; 4] = [
        ModelRole::Text,
        ModelRole::Vision,
        ModelRole::Embedding,
        ModelRole::Image,
    ];

    pub fn capability(self) -> &'static str {
        match self {
            ModelRole::Text => "text",
            ModelRole::Vision => "vision",
            ModelRole::Embedding => "embedding",
            ModelRole::Image => "image",
        }
    }

    pub fn env_key(self) -> &'static str {
        match self {
            ModelRole::Text => "PALETTE_TEXT_MODEL",
            ModelRole::Vision => "PALETTE_VISION_MODEL",
            ModelRole::Embedding => "PALETTE_EMBEDDING_MODEL",
            ModelRole::Image => "PALETTE_IMAGE_MODEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    /// Entry for a hub id the registry has never heard of.
    pub fn unlisted(name: &str, role: ModelRole) -> Self {
        Self {
            name: name.to_string(),
            provider: "hf-inference".to_string(),
            capabilities: vec![role.capability().to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

// Registration order matters: the first model per capability is its default.
fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: "hf-inference".to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("mistralai/Mistral-7B-Instruct-v0.3", &["text"]);
    insert("HuggingFaceH4/zephyr-7b-beta", &["text"]);
    insert("Qwen/Qwen2.5-VL-7B-Instruct", &["vision", "text"]);
    insert("meta-llama/Llama-3.2-11B-Vision-Instruct", &["vision", "text"]);
    insert("openai/clip-vit-base-patch32", &["embedding"]);
    insert("google/vit-base-patch16-224-in21k", &["embedding"]);
    insert("stabilityai/stable-diffusion-xl-base-1.0", &["image"]);
    insert("black-forest-labs/FLUX.1-schnell", &["image"]);
    insert("black-forest-labs/FLUX.1-dev", &["image"]);

    map
}

#[cfg(test)]
mod tests {
    use super::{ModelRegistry, ModelRole, ModelSpec};

    #[test]
    fn defaults_keep_registration_order_per_capability() {
        let registry = ModelRegistry::new(None);
        let first = |capability: &str| {
            registry
                .by_capability(capability)
                .first()
                .map(|model| model.name.clone())
        };
        assert_eq!(first("text").as_deref(), Some("mistralai/Mistral-7B-Instruct-v0.3"));
        assert_eq!(first("vision").as_deref(), Some("Qwen/Qwen2.5-VL-7B-Instruct"));
        assert_eq!(first("embedding").as_deref(), Some("openai/clip-vit-base-patch32"));
        assert_eq!(first("image").as_deref(), Some("stabilityai/stable-diffusion-xl-base-1.0"));
    }

    #[test]
    fn ensure_checks_capability_of_listed_models() {
        let registry = ModelRegistry::new(None);
        assert!(registry
            .ensure("Qwen/Qwen2.5-VL-7B-Instruct", "text")
            .is_some());
        assert!(registry.ensure("openai/clip-vit-base-patch32", "image").is_none());
        assert!(registry.ensure("someone/unknown", "text").is_none());
    }

    #[test]
    fn unlisted_spec_carries_only_the_role_capability() {
        let spec = ModelSpec::unlisted("someone/custom-sd", ModelRole::Image);
        assert_eq!(spec.provider, "hf-inference");
        assert!(spec.supports("image"));
        assert!(!spec.supports("text"));
    }
}
