use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::config::InferenceConfig;

const ERROR_BODY_MAX_CHARS: usize = 512;

/// Non-2xx answer from a hosted service. Travels inside `anyhow::Error`;
/// callers can `downcast_ref` it to read the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub service: String,
    pub status: u16,
    pub body: String,
    pub hint: Option<String>,
}

impl UpstreamError {
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} request failed ({})", self.service, self.status)?;
        if !self.body.is_empty() {
            write!(f, ": {}", self.body)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, ". {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for UpstreamError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// The hosted model endpoints the engine depends on.
pub trait InferenceService: Send + Sync {
    /// One user message carrying `instruction` plus one PNG image; returns the
    /// completion text.
    fn complete_vision(
        &self,
        model: &str,
        instruction: &str,
        image_png: &[u8],
        params: GenerationParams,
    ) -> Result<String>;

    fn generate_text(&self, model: &str, prompt: &str, params: GenerationParams) -> Result<String>;

    fn generate_image(&self, model: &str, payload: &Value) -> Result<ImageBytes>;

    fn embed_image(&self, model: &str, bytes: &[u8], content_type: &str) -> Result<Vec<f32>>;
}

/// Blocking HTTP client for the hosted inference API, or for the forwarding
/// proxy in front of it.
pub struct HttpInferenceService {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl HttpInferenceService {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .context("failed building inference HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        })
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.api_base)
    }

    fn model_endpoint(&self, model: &str) -> String {
        format!("{}/models/{}", self.api_base, model.trim_matches('/'))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

impl InferenceService for HttpInferenceService {
    fn complete_vision(
        &self,
        model: &str,
        instruction: &str,
        image_png: &[u8],
        params: GenerationParams,
    ) -> Result<String> {
        let endpoint = self.chat_endpoint();
        let payload = chat_vision_payload(model, instruction, image_png, params);
        let response = self
            .authorized(self.http.post(&endpoint))
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .with_context(|| format!("vision completion request failed ({endpoint})"))?;
        let parsed = response_json_or_error("vision completion", response)?;
        Ok(extract_chat_completion_text(&parsed))
    }

    fn generate_text(&self, model: &str, prompt: &str, params: GenerationParams) -> Result<String> {
        let endpoint = self.model_endpoint(model);
        let payload = json!({
            "inputs": prompt,
            "parameters": {
                "max_new_tokens": params.max_tokens,
                "temperature": params.temperature,
                "return_full_text": false,
            },
        });
        let response = self
            .authorized(self.http.post(&endpoint))
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .with_context(|| format!("text generation request failed ({endpoint})"))?;
        let parsed = response_json_or_error("text generation", response)?;
        extract_generated_text(&parsed)
            .ok_or_else(|| anyhow::anyhow!("text generation response carried no text"))
    }

    fn generate_image(&self, model: &str, payload: &Value) -> Result<ImageBytes> {
        let endpoint = self.model_endpoint(model);
        let response = self
            .authorized(self.http.post(&endpoint))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "image/*")
            .header("x-wait-for-model", "true")
            .json(payload)
            .send()
            .with_context(|| format!("image generation request failed ({endpoint})"))?;
        let response = ensure_success("image generation", response)?;
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading generated image bytes")?
            .to_vec();
        Ok(ImageBytes { bytes, mime_type })
    }

    fn embed_image(&self, model: &str, bytes: &[u8], content_type: &str) -> Result<Vec<f32>> {
        let endpoint = self.model_endpoint(model);
        let response = self
            .authorized(self.http.post(&endpoint))
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .with_context(|| format!("embedding request failed ({endpoint})"))?;
        let parsed = response_json_or_error("embedding", response)?;
        parse_embedding(&parsed)
            .ok_or_else(|| anyhow::anyhow!("embedding response was not a numeric vector"))
    }
}

pub fn chat_vision_payload(
    model: &str,
    instruction: &str,
    image_png: &[u8],
    params: GenerationParams,
) -> Value {
    let data_url = format!("data:image/png;base64,{}", BASE64.encode(image_png));
    json!({
        "model": model,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": instruction},
                {"type": "image_url", "image_url": {"url": data_url}},
            ],
        }],
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
        "stream": false,
    })
}

/// `choices[0].message.content`, as a string or as an array of text parts.
pub fn extract_chat_completion_text(response: &Value) -> String {
    let content = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"));
    match content {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect::<Vec<&str>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// `[{generated_text}]`, `{generated_text}` or a bare string.
pub fn extract_generated_text(response: &Value) -> Option<String> {
    let text = match response {
        Value::String(text) => Some(text.as_str()),
        Value::Array(rows) => rows.first().and_then(|row| match row {
            Value::String(text) => Some(text.as_str()),
            other => other.get("generated_text").and_then(Value::as_str),
        }),
        Value::Object(_) => response.get("generated_text").and_then(Value::as_str),
        _ => None,
    }?;
    Some(text.trim().to_string())
}

/// A flat numeric array, or the first element of an outer array.
pub fn parse_embedding(response: &Value) -> Option<Vec<f32>> {
    let rows = response.as_array()?;
    let flat = match rows.first() {
        Some(Value::Array(inner)) => inner,
        _ => rows,
    };
    if flat.is_empty() {
        return None;
    }
    flat.iter()
        .map(|value| value.as_f64().map(|number| number as f32))
        .collect()
}

fn ensure_success(service: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let body = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or_default().to_string()
    } else {
        truncate_text(body.trim(), ERROR_BODY_MAX_CHARS)
    };
    Err(UpstreamError {
        service: service.to_string(),
        status: status.as_u16(),
        body,
        hint: None,
    }
    .into())
}

fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let response = ensure_success(service, response)?;
    let body = response
        .text()
        .with_context(|| format!("{service} response body read failed"))?;
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{service} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// What a canned responder saw.
    #[derive(Debug, Clone)]
    pub struct CapturedRequest {
        pub request_line: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl CapturedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    /// Serves exactly one HTTP request with the given status, content type and
    /// body. Returns the base URL and a receiver for the captured request.
    pub fn serve_once(
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> std::io::Result<(String, mpsc::Receiver<CapturedRequest>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                return;
            }
            let mut headers = Vec::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).is_err() {
                    return;
                }
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                if let Some((key, value)) = line.split_once(':') {
                    let (key, value) = (key.trim().to_string(), value.trim().to_string());
                    if key.eq_ignore_ascii_case("content-length") {
                        content_length = value.parse().unwrap_or(0);
                    }
                    headers.push((key, value));
                }
            }
            let mut request_body = vec![0u8; content_length];
            if reader.read_exact(&mut request_body).is_err() {
                return;
            }
            let _ = tx.send(CapturedRequest {
                request_line: request_line.trim_end().to_string(),
                headers,
                body: request_body,
            });
            let mut stream = reader.into_inner();
            let head = format!(
                "HTTP/1.1 {status} Status\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        });
        Ok((format!("http://{addr}"), rx))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::testing::serve_once;
    use super::{
        extract_chat_completion_text, extract_generated_text, parse_embedding,
        GenerationParams, HttpInferenceService, InferenceService, UpstreamError,
    };
    use crate::config::InferenceConfig;

    fn config_for(base: &str, api_key: Option<&str>) -> anyhow::Result<InferenceConfig> {
        let mut config = InferenceConfig::from_lookup(|_| None)?;
        config.api_base = base.to_string();
        config.api_key = api_key.map(str::to_string);
        config.timeout = Duration::from_secs(5);
        Ok(config)
    }

    const PARAMS: GenerationParams = GenerationParams {
        max_tokens: 64,
        temperature: 0.2,
    };

    #[test]
    fn chat_text_accepts_string_and_part_arrays() {
        let plain = json!({"choices": [{"message": {"content": "  {\"a\": 1} "}}]});
        assert_eq!(extract_chat_completion_text(&plain), "{\"a\": 1}");
        let parts = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"}
        ]}}]});
        assert_eq!(extract_chat_completion_text(&parts), "first\nsecond");
        assert_eq!(extract_chat_completion_text(&json!({"choices": []})), "");
    }

    #[test]
    fn generated_text_shapes() {
        assert_eq!(
            extract_generated_text(&json!([{"generated_text": " hi "}])).as_deref(),
            Some("hi")
        );
        assert_eq!(
            extract_generated_text(&json!("bare")).as_deref(),
            Some("bare")
        );
        assert_eq!(
            extract_generated_text(&json!({"generated_text": "obj"})).as_deref(),
            Some("obj")
        );
        assert_eq!(extract_generated_text(&json!([{"score": 1}])), None);
    }

    #[test]
    fn embedding_may_be_nested_once() {
        assert_eq!(parse_embedding(&json!([0.5, 1.0])), Some(vec![0.5, 1.0]));
        assert_eq!(parse_embedding(&json!([[0.25, -1]])), Some(vec![0.25, -1.0]));
        assert_eq!(parse_embedding(&json!([])), None);
        assert_eq!(parse_embedding(&json!(["x"])), None);
        assert_eq!(parse_embedding(&json!({"embedding": [1]})), None);
    }

    #[test]
    fn vision_request_carries_model_image_and_bearer() -> anyhow::Result<()> {
        let reply = json!({"choices": [{"message": {"content": "```json\n{}\n```"}}]});
        let (base, seen) = serve_once(200, "application/json", serde_json::to_vec(&reply)?)?;
        let service = HttpInferenceService::new(&config_for(&base, Some("hf_test"))?)?;

        let text = service.complete_vision("org/vlm", "describe", b"\x89PNG", PARAMS)?;
        assert_eq!(text, "```json\n{}\n```");

        let request = seen.recv_timeout(Duration::from_secs(5))?;
        assert!(request.request_line.starts_with("POST /v1/chat/completions "));
        assert_eq!(request.header("authorization"), Some("Bearer hf_test"));
        let body: Value = serde_json::from_slice(&request.body)?;
        assert_eq!(body["model"], json!("org/vlm"));
        assert_eq!(body["stream"], json!(false));
        assert_eq!(body["messages"][0]["content"][0]["text"], json!("describe"));
        assert!(body["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap_or_default()
            .starts_with("data:image/png;base64,"));
        Ok(())
    }

    #[test]
    fn image_request_waits_for_model_and_reports_status() -> anyhow::Result<()> {
        let (base, seen) = serve_once(503, "application/json", b"{\"error\":\"loading\"}".to_vec())?;
        let service = HttpInferenceService::new(&config_for(&base, None)?)?;

        let err = service
            .generate_image("org/diffusion", &json!({"inputs": "a cat"}))
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        let upstream = err
            .downcast_ref::<UpstreamError>()
            .ok_or_else(|| anyhow::anyhow!("not an upstream error: {err:#}"))?;
        assert_eq!(upstream.status, 503);
        assert!(upstream.body.contains("loading"));

        let request = seen.recv_timeout(Duration::from_secs(5))?;
        assert!(request.request_line.starts_with("POST /models/org/diffusion "));
        assert_eq!(request.header("x-wait-for-model"), Some("true"));
        assert_eq!(request.header("authorization"), None);
        Ok(())
    }

    #[test]
    fn embedding_request_sends_raw_bytes() -> anyhow::Result<()> {
        let (base, seen) = serve_once(200, "application/json", b"[[0.1, 0.2, 0.3]]".to_vec())?;
        let service = HttpInferenceService::new(&config_for(&base, None)?)?;
        let vector = service.embed_image("org/clip", b"PNGDATA", "image/png")?;
        assert_eq!(vector.len(), 3);

        let request = seen.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(request.header("content-type"), Some("image/png"));
        assert_eq!(request.body, b"PNGDATA".to_vec());
        Ok(())
    }

    #[test]
    fn text_generation_reads_first_result() -> anyhow::Result<()> {
        let (base, seen) = serve_once(
            200,
            "application/json",
            b"[{\"generated_text\": \" Try warmer ochres. \"}]".to_vec(),
        )?;
        let service = HttpInferenceService::new(&config_for(&base, None)?)?;
        let text = service.generate_text("org/llm", "User: hi\nAssistant:", PARAMS)?;
        assert_eq!(text, "Try warmer ochres.");

        let request = seen.recv_timeout(Duration::from_secs(5))?;
        let body: Value = serde_json::from_slice(&request.body)?;
        assert_eq!(body["inputs"], json!("User: hi\nAssistant:"));
        assert_eq!(body["parameters"]["return_full_text"], json!(false));
        Ok(())
    }
}
