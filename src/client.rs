//! HTTP client for OpenAI-compatible Chat Completions streaming.
//!
//! Builds the request body from the conversation and the enabled tools, then
//! exposes the SSE response body as a stream of lines for the decoder.

use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::config::{Config, RetryPolicy};
use crate::core::events::StreamError;
use crate::models::{ChatMessage, Role};
use crate::tools::FunctionDefinition;

/// Lines of an SSE response body, without line terminators.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

/// Reasoning models reject `temperature`.
fn fixed_temperature_model() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^o\d(-.*)?$").expect("model regex should compile"))
}

/// Opens one streamed model response.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn open_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[FunctionDefinition],
    ) -> Result<LineStream, StreamError>;
}

// === Request Body ===

/// Model-facing request settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub model: String,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub function_calling: bool,
    pub tool_calling: bool,
    /// Send content as `text` and `image_url` parts.
    pub vision: bool,
}

impl RequestOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model().to_string(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            function_calling: config.function_calling(),
            tool_calling: config.tool_calling(),
            vision: config.vision(),
        }
    }
}

#[must_use]
pub fn supports_temperature(model: &str) -> bool {
    !fixed_temperature_model().is_match(model)
}

/// Build the streaming Chat Completions request body.
#[must_use]
pub fn build_request_body(
    options: &RequestOptions,
    messages: &[ChatMessage],
    tools: &[FunctionDefinition],
) -> Value {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = options.system_prompt.as_deref()
        && !prompt.trim().is_empty()
    {
        out.push(json!({"role": "system", "content": prompt}));
    }
    out.extend(
        messages
            .iter()
            .map(|message| message_to_json(message, options)),
    );

    let mut body = json!({
        "model": options.model,
        "messages": out,
        "stream": true,
    });

    if !tools.is_empty() {
        if options.function_calling {
            body["functions"] = json!(
                tools
                    .iter()
                    .map(FunctionDefinition::to_function_json)
                    .collect::<Vec<_>>()
            );
        }
        if options.tool_calling {
            body["tools"] = json!(
                tools
                    .iter()
                    .map(FunctionDefinition::to_tool_json)
                    .collect::<Vec<_>>()
            );
        }
    }

    if let Some(temperature) = options.temperature
        && supports_temperature(&options.model)
    {
        body["temperature"] = json!(temperature);
    }
    body
}

fn message_to_json(message: &ChatMessage, options: &RequestOptions) -> Value {
    let function_calling = options.function_calling;
    // Results go back as user turns; not every endpoint accepts the function role.
    let role = match message.role {
        Role::Function => Role::User,
        other => other,
    };

    let mut content = message
        .attachments
        .iter()
        .map(|attachment| format!("{}:\n{}", attachment.name, attachment.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    if !content.is_empty() && !message.content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(&message.content);

    let mut value = json!({"role": role.as_str()});

    if message.role == Role::Assistant
        && let Some(call) = message.function_call.as_ref()
    {
        if function_calling {
            value["function_call"] = json!({
                "name": call.name,
                "arguments": Value::Object(call.arguments.clone()).to_string(),
            });
        } else if content.is_empty() {
            let payload = serde_json::to_string(call).unwrap_or_else(|_| call.name.clone());
            content = format!("function_call {payload}");
        }
    }

    if function_calling && let Some(name) = message.name.as_deref() {
        value["name"] = json!(name);
    }

    value["content"] = if content.is_empty() && value.get("function_call").is_some() {
        Value::Null
    } else if options.vision {
        let mut parts = vec![json!({"type": "text", "text": content})];
        parts.extend(message.images.iter().map(|image| {
            json!({"type": "image_url", "image_url": {"url": image.data_url()}})
        }));
        Value::Array(parts)
    } else {
        if !message.images.is_empty() {
            tracing::debug!(images = message.images.len(), "Vision is off; dropping image attachments");
        }
        json!(content)
    };
    value
}

// === SSE Lines ===

/// Split a byte stream into lines. A trailing `\r` is dropped and an
/// unterminated final line is still yielded.
pub fn sse_lines<S, B, E>(bytes: S) -> LineStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut bytes = std::pin::pin!(bytes);
        let mut buffer = BytesMut::new();
        let mut failed = false;

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(chunk.as_ref()),
                Err(err) => {
                    yield Err(StreamError::Transport(format!("Stream read error: {err}")));
                    failed = true;
                    break;
                }
            }
            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line = buffer.split_to(newline + 1);
                yield Ok(decode_line(&line[..newline]));
            }
        }

        if !failed && !buffer.is_empty() {
            yield Ok(decode_line(&buffer));
        }
    };
    Box::pin(stream)
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

// === ChatCompletionsClient ===

/// Streams Chat Completions responses over HTTP.
#[must_use]
pub struct ChatCompletionsClient {
    http_client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    /// Bounds the wait for response headers, not the streamed body.
    response_timeout: Duration,
    options: RequestOptions,
}

impl ChatCompletionsClient {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.api_key()?;
        let base_url = config.base_url();
        let retry = config.retry_policy();

        tracing::info!(%base_url, model = config.model(), "Model endpoint");
        tracing::debug!(
            enabled = retry.enabled,
            max_retries = retry.max_retries,
            initial_delay = retry.initial_delay,
            max_delay = retry.max_delay,
            "Retry policy"
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            retry,
            response_timeout: config.request_timeout(),
            options: RequestOptions::from_config(config),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelClient for ChatCompletionsClient {
    async fn open_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[FunctionDefinition],
    ) -> Result<LineStream, StreamError> {
        let body = build_request_body(&self.options, messages, tools);
        let url = self.endpoint();
        let send = send_with_retry(&self.retry, || self.http_client.post(&url).json(&body));
        let response = tokio::time::timeout(self.response_timeout, send)
            .await
            .map_err(|_| {
                StreamError::Transport(format!(
                    "No response within {} s",
                    self.response_timeout.as_secs()
                ))
            })?
            .map_err(|err| StreamError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(sse_lines(response.bytes_stream()))
    }
}

async fn send_with_retry<F>(
    policy: &RetryPolicy,
    mut build: F,
) -> std::result::Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if status.is_success()
                    || !retryable
                    || !policy.enabled
                    || attempt >= policy.max_retries
                {
                    return Ok(response);
                }
                tracing::warn!(
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    max = policy.max_retries + 1,
                    "Retryable HTTP status"
                );
            }
            Err(err) => {
                if !policy.enabled || attempt >= policy.max_retries {
                    return Err(err);
                }
                tracing::warn!(
                    error = %err,
                    attempt = attempt + 1,
                    max = policy.max_retries + 1,
                    "Request error"
                );
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        tracing::info!(delay_secs = delay.as_secs_f64(), "Retrying model request");
        tokio::time::sleep(delay).await;
    }
}
