use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbaImage;
use serde_json::{json, Value};

use crate::hosted::{InferenceService, UpstreamError};

pub const MODEL_ACCESS_HINT: &str = "check model access/configuration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[default]
    Square,
    Portrait,
    Landscape,
    Widescreen,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 4] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Landscape,
        AspectRatio::Widescreen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Portrait => "3:4",
            Self::Landscape => "4:3",
            Self::Widescreen => "16:9",
        }
    }
}

impl FromStr for AspectRatio {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        match Self::ALL.into_iter().find(|ratio| ratio.as_str() == trimmed) {
            Some(ratio) => Ok(ratio),
            None => bail!("unsupported aspect ratio '{trimmed}' (expected 1:1, 3:4, 4:3 or 16:9)"),
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    OneK,
    TwoK,
    FourK,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneK => "1K",
            Self::TwoK => "2K",
            Self::FourK => "4K",
        }
    }

    /// Long edge in pixels. 4K is capped at the 2K base.
    pub fn base_size(self) -> u32 {
        match self {
            Self::OneK => 1024,
            Self::TwoK | Self::FourK => 1536,
        }
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(Self::OneK),
            "2K" => Ok(Self::TwoK),
            "4K" => Ok(Self::FourK),
            other => bail!("unsupported resolution '{other}' (expected 1K, 2K or 4K)"),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(width, height)` for an aspect ratio at a resolution.
pub fn target_size(aspect_ratio: AspectRatio, resolution: Resolution) -> (u32, u32) {
    let base = resolution.base_size();
    let scaled = |num: u32, den: u32| ((base as f64) * num as f64 / den as f64).round() as u32;
    match aspect_ratio {
        AspectRatio::Square => (base, base),
        AspectRatio::Portrait => (scaled(3, 4), base),
        AspectRatio::Landscape => (base, scaled(3, 4)),
        AspectRatio::Widescreen => (base, scaled(9, 16)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub fused_prompt: String,
    /// Style references. Counted, never uploaded.
    pub reference_images: Vec<Vec<u8>>,
    /// Encoded images for image-to-image; only the first is sent.
    pub input_images: Vec<Vec<u8>>,
    pub aspect_ratio: AspectRatio,
    pub resolution: Resolution,
}

#[derive(Debug, Clone)]
pub struct GeneratedOutput {
    pub image: RgbaImage,
    pub mime_type: Option<String>,
    pub requested_size: (u32, u32),
}

pub fn build_generation_payload(request: &GenerationRequest) -> Value {
    let (width, height) = target_size(request.aspect_ratio, request.resolution);
    match request.input_images.first() {
        Some(input) => json!({
            "inputs": BASE64.encode(input),
            "parameters": {
                "prompt": request.fused_prompt,
                "width": width,
                "height": height,
            },
            "options": {"wait_for_model": true},
        }),
        None => json!({
            "inputs": request.fused_prompt,
            "parameters": {
                "width": width,
                "height": height,
            },
            "options": {"wait_for_model": true},
        }),
    }
}

/// Sends the fused prompt to the image model and decodes the reply.
pub fn generate_styled_image(
    service: &dyn InferenceService,
    model: &str,
    request: &GenerationRequest,
) -> Result<GeneratedOutput> {
    if request.fused_prompt.trim().is_empty() {
        bail!("generation prompt is empty");
    }
    let payload = build_generation_payload(request);
    let reply = service
        .generate_image(model, &payload)
        .map_err(|err| match err.downcast::<UpstreamError>() {
            Ok(upstream) if matches!(upstream.status, 403 | 404) => {
                anyhow::Error::new(upstream.with_hint(MODEL_ACCESS_HINT))
            }
            Ok(upstream) => anyhow::Error::new(upstream),
            Err(other) => other,
        })?;
    if reply.bytes.is_empty() {
        bail!("image model '{model}' returned an empty body");
    }
    let image = image::load_from_memory(&reply.bytes)
        .with_context(|| {
            format!(
                "failed decoding generated image ({})",
                reply.mime_type.as_deref().unwrap_or("unknown content type")
            )
        })?
        .to_rgba8();
    Ok(GeneratedOutput {
        image,
        mime_type: reply.mime_type,
        requested_size: target_size(request.aspect_ratio, request.resolution),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba, RgbaImage};
    use serde_json::json;

    use super::{
        build_generation_payload, generate_styled_image, target_size, AspectRatio,
        GenerationRequest, Resolution, MODEL_ACCESS_HINT,
    };
    use crate::hosted::UpstreamError;
    use crate::testing::FakeService;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbaImage::from_pixel(width, height, Rgba([9, 9, 9, 255]))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            fused_prompt: prompt.to_string(),
            ..GenerationRequest::default()
        }
    }

    #[test]
    fn target_sizes_follow_ratio_and_base() {
        assert_eq!(target_size(AspectRatio::Widescreen, Resolution::OneK), (1024, 576));
        assert_eq!(target_size(AspectRatio::Landscape, Resolution::TwoK), (1536, 1152));
        assert_eq!(target_size(AspectRatio::Portrait, Resolution::OneK), (768, 1024));
        assert_eq!(target_size(AspectRatio::Square, Resolution::FourK), (1536, 1536));
    }

    #[test]
    fn ratio_and_resolution_parse_from_labels() -> anyhow::Result<()> {
        assert_eq!("16:9".parse::<AspectRatio>()?, AspectRatio::Widescreen);
        assert_eq!(" 2k ".parse::<Resolution>()?, Resolution::TwoK);
        assert!("5:4".parse::<AspectRatio>().is_err());
        assert!("8K".parse::<Resolution>().is_err());
        Ok(())
    }

    #[test]
    fn payload_switches_to_image_to_image_with_inputs() {
        let mut req = request("a lighthouse");
        req.aspect_ratio = AspectRatio::Widescreen;
        let text_only = build_generation_payload(&req);
        assert_eq!(text_only["inputs"], json!("a lighthouse"));
        assert_eq!(text_only["parameters"]["height"], json!(576));
        assert_eq!(text_only["options"]["wait_for_model"], json!(true));

        req.input_images = vec![b"abc".to_vec(), b"ignored".to_vec()];
        req.reference_images = vec![b"ref".to_vec()];
        let img2img = build_generation_payload(&req);
        assert_eq!(img2img["inputs"], json!("YWJj"));
        assert_eq!(img2img["parameters"]["prompt"], json!("a lighthouse"));
    }

    #[test]
    fn decodes_generated_png() -> anyhow::Result<()> {
        let service = FakeService::default().with_image(Ok(png(8, 4)));
        let output = generate_styled_image(&service, "org/sd", &request("boats"))?;
        assert_eq!(output.image.dimensions(), (8, 4));
        assert_eq!(output.requested_size, (1024, 1024));
        assert_eq!(service.image_payloads()[0]["inputs"], json!("boats"));
        Ok(())
    }

    #[test]
    fn forbidden_model_carries_access_hint() {
        let service = FakeService::default().with_image_status(403, "gated repo");
        let err = generate_styled_image(&service, "org/sd", &request("boats"))
            .err()
            .unwrap();
        let upstream = err.downcast_ref::<UpstreamError>().unwrap();
        assert_eq!(upstream.status, 403);
        assert_eq!(upstream.hint.as_deref(), Some(MODEL_ACCESS_HINT));
        assert!(format!("{err}").contains("gated repo"));
    }

    #[test]
    fn server_error_has_no_hint_and_garbage_fails_decode() {
        let service = FakeService::default().with_image_status(500, "boom");
        let err = generate_styled_image(&service, "org/sd", &request("x")).err().unwrap();
        assert_eq!(err.downcast_ref::<UpstreamError>().unwrap().hint, None);

        let service = FakeService::default().with_image(Ok(b"not an image".to_vec()));
        assert!(generate_styled_image(&service, "org/sd", &request("x")).is_err());
    }
}
