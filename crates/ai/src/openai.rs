//! OpenAI-compatible HTTP adapter (chat completions + images).

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{ImageGenerator, LlmClient};
use crate::error::{AiError, AiResult};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TEXT_MODEL: &str = "gpt-4o";
pub const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1";

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    api_key: String,
    base_url: String,
    text_model: String,
    image_model: String,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("text_model", &self.text_model)
            .field("image_model", &self.image_model)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
        }
    }

    /// Reads `OPENAI_API_KEY` and, when set, `OPENAI_BASE_URL`.
    pub fn from_env() -> AiResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AiError::Config("OPENAI_API_KEY not set".into()))?;
        let mut client = Self::new(api_key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            client = client.with_base_url(url);
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_text_model(mut self, model: impl Into<String>) -> Self {
        self.text_model = model.into();
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> AiResult<R> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, path, "openai request failed");
                AiError::Request(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, path, "openai api error");
            return Err(AiError::Api(format!("{status}: {text}")));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| AiError::Parse(format!("unexpected {path} response: {e}")))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

fn chat_request<'a>(model: &'a str, system: &'a str, user: &'a str) -> ChatRequest<'a> {
    ChatRequest {
        model,
        messages: [
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ],
        temperature: 0.7,
    }
}

fn image_request<'a>(model: &'a str, prompt: &'a str) -> ImageRequest<'a> {
    // gpt-image models always answer in base64 and reject the parameter.
    let response_format = model.starts_with("dall-e").then_some("b64_json");
    ImageRequest {
        model,
        prompt,
        n: 1,
        size: "1024x1536",
        response_format,
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> AiResult<String> {
        let request = chat_request(&self.text_model, system, user);
        let response: ChatResponse = self.post("chat/completions", &request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AiError::Parse("chat response has no content".into()))?;
        debug!(model = %self.text_model, chars = content.len(), "chat completion received");
        Ok(content)
    }
}

#[async_trait]
impl ImageGenerator for OpenAiClient {
    async fn generate_image(&self, prompt: &str) -> AiResult<Vec<u8>> {
        if prompt.trim().is_empty() {
            return Err(AiError::InvalidInput("image prompt is empty".into()));
        }
        let request = image_request(&self.image_model, prompt);
        let response: ImageResponse = self.post("images/generations", &request).await?;
        let encoded = response
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| AiError::Parse("image response has no b64_json payload".into()))?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| AiError::Parse(format!("image payload is not base64: {e}")))
    }
}
