//! Text-generation gateway.
//!
//! [`ChatModel`] is the seam to the external chat-completion service. The
//! query pipeline uses [`ChatModel::complete`] to condense a conversation
//! into a search query and [`ChatModel::stream`] to generate the answer.
//!
//! [`OpenAiChatModel`] speaks the OpenAI chat-completions protocol. Streaming
//! responses arrive as server-sent events; [`SseDecoder`] turns the raw
//! byte chunks into text deltas, tolerating events split across network
//! reads.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use aiha_core::models::ChatMessage;

use crate::config::GenerationConfig;

/// A stream of answer text deltas.
pub type TextStream = BoxStream<'static, Result<String>>;

/// One call to the chat model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Sent as the leading `system` message when present.
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Ask the provider to ground the answer in a web search. Only set when
    /// [`ChatModel::supports_web_search`] is true.
    pub web_search: bool,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Whether requests with `web_search` set reach a search-capable model.
    fn supports_web_search(&self) -> bool {
        false
    }

    /// Run a completion and return the whole response text.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Run a completion and stream the response text as it is produced.
    ///
    /// Dropping the returned stream abandons the upstream request.
    async fn stream(&self, request: CompletionRequest) -> Result<TextStream>;
}

// ============ Disabled ============

pub struct DisabledChatModel;

#[async_trait]
impl ChatModel for DisabledChatModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<String> {
        bail!("Generation provider is disabled")
    }

    async fn stream(&self, _request: CompletionRequest) -> Result<TextStream> {
        bail!("Generation provider is disabled")
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    web_search: Option<serde_json::Map<String, serde_json::Value>>,
}

impl OpenAiChatModel {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model,
            web_search: config.web_search.clone(),
        })
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let mut body = request_body(&self.model, request, stream);
        if request.web_search {
            if let Some(extra) = &self.web_search {
                merge_body(&mut body, extra);
            }
        }
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, text);
        }
        Ok(response)
    }
}

/// Build the chat-completions request body.
pub fn request_body(model: &str, request: &CompletionRequest, stream: bool) -> serde_json::Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    for m in &request.messages {
        messages.push(serde_json::json!({"role": m.role.as_str(), "content": m.content}));
    }
    serde_json::json!({
        "model": model,
        "messages": messages,
        "temperature": request.temperature,
        "stream": stream,
    })
}

/// Overlay `extra` onto the top level of a request body.
pub fn merge_body(body: &mut serde_json::Value, extra: &serde_json::Map<String, serde_json::Value>) {
    if let Some(fields) = body.as_object_mut() {
        for (key, value) in extra {
            fields.insert(key.clone(), value.clone());
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn supports_web_search(&self) -> bool {
        self.web_search.is_some()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let response = self.send(&request, false).await?;
        let json: serde_json::Value = response.json().await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream> {
        let response = self.send(&request, true).await?;
        Ok(sse_text_stream(response.bytes_stream()))
    }
}

/// Adapt a byte stream of chat-completion SSE into a stream of text deltas.
pub fn sse_text_stream<S, B, E>(bytes: S) -> TextStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<SseEvent>,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                match event {
                    SseEvent::Delta(text) => return Some((Ok(text), st)),
                    SseEvent::Error(message) => {
                        st.pending.clear();
                        st.finished = true;
                        return Some((Err(anyhow!("Chat stream error: {}", message)), st));
                    }
                    SseEvent::Done => return None,
                }
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((
                        Err(anyhow::Error::new(e).context("chat stream interrupted")),
                        st,
                    ));
                }
                None => {
                    let events = st.decoder.finish();
                    st.pending.extend(events);
                    st.pending.push_back(SseEvent::Done);
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Error(String),
    Done,
}

/// Incremental decoder for chat-completion `data:` lines.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences and JSON payloads split across reads decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(idx) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=idx).collect();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left after the byte stream ends.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest).into_iter().collect()
    }
}

fn decode_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let trimmed = line.trim();
    let data = trimmed.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(e) => {
            tracing::debug!(error = %e, "skipping undecodable stream line");
            return None;
        }
    };
    if let Some(err) = json.get("error") {
        let message = err["message"].as_str().unwrap_or("unknown error").to_string();
        return Some(SseEvent::Error(message));
    }
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => Some(SseEvent::Delta(content.to_string())),
        _ => None,
    }
}

/// Create the chat model selected by `generation.provider`.
pub fn create_chat_model(config: &GenerationConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChatModel)),
        "openai" => Ok(Arc::new(OpenAiChatModel::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
