use reqwest::{
    blocking::Client,
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::backends::{CaptionBackend, CaptionRequest};
use crate::error::CaptionError;
use crate::image_encoding;
use crate::trigger_phrase::instruction_with_trigger;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
const MAX_ERROR_BODY_CHARS: usize = 500;
const TEMPERATURE: f32 = 1.0;
const TOP_P: f32 = 1.0;
const MAX_TOKENS: u32 = 4096;

/// Connection details for one OpenAI-compatible chat-completions provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedDescriptor {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_rate_limited")]
    pub rate_limited: bool,
}

fn default_rate_limited() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Debug, Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Value,
}

/// Caption backend that sends the image as a data URL to a hosted model.
pub struct HostedBackend {
    descriptor: HostedDescriptor,
    timeout: Duration,
}

impl HostedBackend {
    pub fn new(descriptor: HostedDescriptor, timeout: Duration) -> Self {
        Self {
            descriptor,
            timeout,
        }
    }

    fn api_key(&self) -> Result<String, CaptionError> {
        std::env::var(&self.descriptor.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| CaptionError::MissingCredential {
                backend: self.descriptor.name.clone(),
                env_var: self.descriptor.api_key_env.clone(),
            })
    }
}

impl CaptionBackend for HostedBackend {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn is_rate_limited(&self) -> bool {
        self.descriptor.rate_limited
    }

    fn describe(&self, request: &CaptionRequest) -> Result<String, CaptionError> {
        let api_key = self.api_key()?;
        let data_url = image_encoding::image_to_data_url(&request.image.path)?;
        let text = instruction_with_trigger(&request.prompt, request.trigger_phrase.as_deref());
        let payload = build_payload(&self.descriptor.model, &text, &data_url);

        let client = build_client(Some(&api_key), self.timeout)?;
        let endpoint = build_chat_endpoint(&self.descriptor.base_url);
        log::debug!(
            "Requesting caption for {} from {} ({})",
            request.image.path.display(),
            endpoint,
            self.descriptor.model
        );

        let response = client
            .post(&endpoint)
            .json(&payload)
            .send()
            .map_err(|error| CaptionError::Backend {
                backend: self.descriptor.name.clone(),
                message: format_transport_error(&endpoint, &error, self.timeout),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CaptionError::Backend {
                backend: self.descriptor.name.clone(),
                message: format_status_error(&endpoint, status, &body),
            });
        }

        let body: ChatCompletionResponse = response.json()?;
        let caption = body
            .choices
            .first()
            .map(|choice| content_text(&choice.message.content))
            .unwrap_or_default();
        let caption = caption.trim();
        if caption.is_empty() {
            return Err(CaptionError::EmptyCaption {
                backend: self.descriptor.name.clone(),
            });
        }
        Ok(caption.to_string())
    }
}

fn build_payload<'a>(model: &'a str, text: &'a str, data_url: &'a str) -> ChatCompletionRequest<'a> {
    ChatCompletionRequest {
        model,
        messages: vec![ChatMessage {
            role: "user",
            content: vec![
                ContentPart::Text { text },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_url },
                },
            ],
        }],
        temperature: TEMPERATURE,
        max_tokens: MAX_TOKENS,
        top_p: TOP_P,
    }
}

/// Message content is a plain string for most providers; some return an
/// array of typed parts instead.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn build_chat_endpoint(base_url: &str) -> String {
    format!("{}{CHAT_COMPLETIONS_PATH}", normalize_base_url(base_url))
}

fn normalize_base_url(base_url: &str) -> String {
    let normalized = base_url.trim().trim_end_matches('/');
    normalized
        .strip_suffix(CHAT_COMPLETIONS_PATH)
        .unwrap_or(normalized)
        .trim_end_matches('/')
        .to_string()
}

fn format_status_error(endpoint: &str, status: StatusCode, body: &str) -> String {
    let snippet: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    let hint = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => " (check the API key)",
        StatusCode::TOO_MANY_REQUESTS => " (provider quota exceeded)",
        StatusCode::PAYLOAD_TOO_LARGE => " (image too large for this provider)",
        _ => "",
    };
    if snippet.is_empty() {
        format!("Request failed with status {} at {}{}", status, endpoint, hint)
    } else {
        format!(
            "Request failed with status {} at {}{}: {}",
            status, endpoint, hint, snippet
        )
    }
}

fn format_transport_error(endpoint: &str, error: &reqwest::Error, timeout: Duration) -> String {
    if error.is_timeout() {
        return format!(
            "Request timed out at {} after {} seconds",
            endpoint,
            timeout.as_secs()
        );
    }

    if error.is_connect() {
        return format!(
            "Connection failed at {}. Check the network and the provider URL.",
            endpoint
        );
    }

    format!("Transport error at {}: {}", endpoint, error)
}

fn build_client(api_key: Option<&str>, timeout: Duration) -> Result<Client, CaptionError> {
    let mut headers = HeaderMap::new();

    if let Some(key) = api_key {
        let token = key.trim();
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                CaptionError::Model("API key contains characters not allowed in a header".into())
            })?;
            headers.insert(AUTHORIZATION, value);
        }
    }

    Ok(Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()?)
}
