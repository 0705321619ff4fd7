//! Ollama vision classifier.
//!
//! Talks to an Ollama instance via `/api/chat`. Older servers reject a JSON
//! schema `format` or the `think` field; both are retried with a simpler body.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::parse::{parse_output, truncate};
use super::provider::{RemoteClassifier, RemoteRequest, RemoteVerdict, StreamSink};
use crate::config::RemoteConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::CategoryKey;

const SYSTEM_PROMPT: &str = "You are a strict JSON generator. \
    Reply with a single JSON object and nothing else.";

/// Output constraint sent as `format`, from strictest to none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatMode {
    Schema,
    Json,
    Unconstrained,
}

impl FormatMode {
    fn relaxed(self) -> Option<Self> {
        match self {
            FormatMode::Schema => Some(FormatMode::Json),
            FormatMode::Json => Some(FormatMode::Unconstrained),
            FormatMode::Unconstrained => None,
        }
    }
}

/// Ollama classifier for local or LAN vision models.
pub struct OllamaClassifier {
    endpoint: String,
    model: String,
    think: bool,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaClassifier {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            think: config.think,
            timeout: Duration::from_millis(config.timeout_ms),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(
        &self,
        request: &RemoteRequest,
        format: FormatMode,
        send_think: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "stream": request.stream.is_some(),
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": request.prompt,
                    "images": [request.image.data],
                }
            ],
            "options": { "temperature": 0 },
        });
        match format {
            FormatMode::Schema => body["format"] = response_schema(),
            FormatMode::Json => body["format"] = json!("json"),
            FormatMode::Unconstrained => {}
        }
        if send_think {
            body["think"] = json!(self.think);
        }
        body
    }

    async fn post(&self, request: &RemoteRequest, body: &Value) -> PipelineResult<reqwest::Response> {
        let url = format!("{}/api/chat", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(request, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::RemoteEngine {
                message: format!("Ollama HTTP {status}: {}", truncate(&text, 300)),
                status_code: Some(status.as_u16()),
            });
        }
        Ok(resp)
    }

    /// Send the request, relaxing `format` and dropping `think` as the server demands.
    async fn send_with_fallbacks(&self, request: &RemoteRequest) -> PipelineResult<reqwest::Response> {
        let mut format = FormatMode::Schema;
        let mut send_think = true;
        loop {
            let body = self.build_body(request, format, send_think);
            match self.post(request, &body).await {
                Ok(resp) => return Ok(resp),
                Err(err) if send_think && rejects_think(&err) => {
                    tracing::debug!(model = %self.model, "Server rejected `think`, retrying without it");
                    send_think = false;
                }
                Err(err) if rejects_format(&err) => match format.relaxed() {
                    Some(next) => {
                        tracing::debug!(from = ?format, to = ?next, "Server rejected format, relaxing");
                        format = next;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    fn transport_error(&self, request: &RemoteRequest, e: reqwest::Error) -> PipelineError {
        if e.is_timeout() {
            PipelineError::Timeout {
                path: request.path.clone(),
                stage: "remote".to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            PipelineError::RemoteEngine {
                message: format!("Ollama request failed: {e}"),
                status_code: None,
            }
        }
    }

    async fn read_streamed(
        &self,
        request: &RemoteRequest,
        resp: reqwest::Response,
        sink: &StreamSink,
    ) -> PipelineResult<String> {
        let mut content = String::new();
        let mut lines = LineBuffer::default();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(request, e))?;
            for line in lines.push(&chunk) {
                if apply_chunk_line(&line, &mut content, sink)? {
                    return Ok(content);
                }
            }
        }
        if let Some(line) = lines.finish() {
            apply_chunk_line(&line, &mut content, sink)?;
        }
        Ok(content)
    }
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Non-streaming `/api/chat` response.
#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// One NDJSON line of a streaming response.
#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Append one NDJSON line to `content`. Returns true on the final chunk.
fn apply_chunk_line(line: &str, content: &mut String, sink: &StreamSink) -> PipelineResult<bool> {
    let chunk: ChatChunk = serde_json::from_str(line).map_err(|e| PipelineError::RemoteEngine {
        message: format!("Bad stream chunk from Ollama: {e}"),
        status_code: None,
    })?;
    if let Some(error) = chunk.error {
        return Err(PipelineError::RemoteEngine {
            message: format!("Ollama stream error: {error}"),
            status_code: None,
        });
    }
    if let Some(message) = chunk.message {
        sink.delta(&message.content);
        content.push_str(&message.content);
    }
    Ok(chunk.done)
}

/// Splits a byte stream into complete, non-empty lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!text.is_empty()).then_some(text)
    }
}

fn rejection_text(err: &PipelineError) -> Option<String> {
    match err {
        PipelineError::RemoteEngine {
            message,
            status_code: Some(code),
        } if (400..500).contains(code) => Some(message.to_lowercase()),
        _ => None,
    }
}

fn rejects_format(err: &PipelineError) -> bool {
    rejection_text(err).is_some_and(|m| m.contains("format") || m.contains("schema"))
}

fn rejects_think(err: &PipelineError) -> bool {
    rejection_text(err).is_some_and(|m| m.contains("unknown field") && m.contains("think"))
}

/// JSON schema passed as `format`.
fn response_schema() -> Value {
    let keys: Vec<&str> = CategoryKey::ALL.iter().map(|k| k.as_str()).collect();
    let score_props: serde_json::Map<String, Value> = keys
        .iter()
        .map(|k| {
            (
                k.to_string(),
                json!({ "type": "number", "minimum": 0, "maximum": 1 }),
            )
        })
        .collect();
    json!({
        "type": "object",
        "properties": {
            "category": { "type": "string", "enum": keys },
            "scores": {
                "type": "object",
                "properties": score_props,
                "required": keys,
            },
            "caption": { "type": "string" },
        },
        "required": ["category", "scores"],
    })
}

#[async_trait]
impl RemoteClassifier for OllamaClassifier {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn classify(&self, request: &RemoteRequest) -> PipelineResult<RemoteVerdict> {
        let start = Instant::now();
        let resp = self.send_with_fallbacks(request).await?;

        let raw = match &request.stream {
            Some(sink) => {
                sink.reset();
                let result = self.read_streamed(request, resp, sink).await;
                sink.done();
                result?
            }
            None => {
                let chat: ChatResponse = resp.json().await.map_err(|e| PipelineError::RemoteEngine {
                    message: format!("Failed to parse Ollama response: {e}"),
                    status_code: None,
                })?;
                chat.message.content
            }
        };

        if raw.trim().is_empty() {
            return Err(PipelineError::RemoteEngine {
                message: "Ollama returned an empty response".to_string(),
                status_code: None,
            });
        }

        let parsed = parse_output(&raw)?;
        let latency_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            file = %request.file_name,
            model = %self.model,
            category = %parsed.category,
            latency_ms,
            "Remote classification"
        );

        Ok(RemoteVerdict {
            scores: parsed.scores,
            category: parsed.category,
            caption: parsed.caption,
            model: self.model.clone(),
            raw,
            latency_ms,
        })
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
