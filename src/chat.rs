//! Query pipeline.
//!
//! A chat turn runs in two phases. [`prepare_chat`] validates the request
//! and checks access; it touches only the store, so its failures can still
//! be reported as plain HTTP errors. [`start_chat`] then spawns the
//! streaming part:
//!
//! ```text
//! condense history → embed query → project-scoped search → sources
//!   → assemble context → render system prompt → stream answer
//! ```
//!
//! Events flow through a bounded channel to a [`ChatStream`]. Dropping the
//! stream cancels its token, which stops the task and drops the upstream
//! generation request. A cancelled turn ends silently.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use aiha_core::models::{ChatMessage, Project, Role, SearchHit};
use aiha_core::prompt::{assemble_context, render_system_prompt, FALLBACK_ANSWER};
use aiha_core::search::search_chunks;

use crate::condense::generate_search_query;
use crate::context::AppContext;
use crate::error::{PipelineError, PipelineResult, Stage, StageExt};
use crate::generation::CompletionRequest;
use crate::projects::{authorize_read, load_project, Identity};

const EVENT_BUFFER: usize = 32;

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub web_search: bool,
}

impl ChatRequest {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(PipelineError::validation("Missing projectId"));
        }
        let last = match self.messages.last() {
            Some(m) if !m.content.trim().is_empty() => m,
            _ => return Err(PipelineError::validation("No message provided")),
        };
        if last.role != Role::User {
            return Err(PipelineError::validation("Invalid message role"));
        }
        Ok(())
    }
}

/// A retrieved document cited by the answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub source_type: &'static str,
    pub id: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model finished its answer.
    Stop,
    /// Nothing relevant was retrieved; the fixed fallback answer was sent.
    NoContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    SearchQuery { query: String },
    Source { source: SourceRef },
    Text { delta: String },
    Error { message: String },
    Finish { reason: FinishReason },
}

impl ChatEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::SearchQuery { .. } => "search_query",
            ChatEvent::Source { .. } => "source",
            ChatEvent::Text { .. } => "text",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Finish { .. } => "finish",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Error { .. } | ChatEvent::Finish { .. })
    }
}

/// A validated, authorized chat turn.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub project: Project,
    pub messages: Vec<ChatMessage>,
    pub web_search: bool,
}

pub async fn prepare_chat(
    ctx: &AppContext,
    caller: &Identity,
    request: ChatRequest,
) -> PipelineResult<PreparedChat> {
    request.validate()?;
    let project = load_project(ctx.store.as_ref(), &request.project_id).await?;
    authorize_read(&project, caller)?;
    Ok(PreparedChat {
        project,
        messages: request.messages,
        web_search: request.web_search,
    })
}

/// Events of one chat turn. Dropping it cancels the turn.
pub struct ChatStream {
    rx: mpsc::Receiver<ChatEvent>,
    _guard: DropGuard,
}

impl ChatStream {
    /// Collect the whole turn. Used by the CLI and tests.
    pub async fn collect_events(self) -> Vec<ChatEvent> {
        self.collect().await
    }
}

impl futures::Stream for ChatStream {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChatEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Spawn the streaming phase of a prepared turn.
pub fn start_chat(ctx: AppContext, prepared: PreparedChat) -> ChatStream {
    start_chat_with_token(ctx, prepared, CancellationToken::new())
}

/// Like [`start_chat`], with a caller-supplied token (for example a child of
/// a server-wide shutdown token).
pub fn start_chat_with_token(
    ctx: AppContext,
    prepared: PreparedChat,
    token: CancellationToken,
) -> ChatStream {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let task_token = token.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = task_token.cancelled() => {
                tracing::debug!(project = %prepared.project.id, "chat cancelled");
                return;
            }
            outcome = answer(&ctx, &prepared, &tx) => outcome,
        };
        let terminal = match outcome {
            Ok(reason) => ChatEvent::Finish { reason },
            Err(Halt::Closed) => return,
            Err(Halt::Failed(e)) => {
                tracing::warn!(project = %prepared.project.id, error = %e, "chat failed");
                ChatEvent::Error {
                    message: e.to_string(),
                }
            }
        };
        let _ = tx.send(terminal).await;
    });
    ChatStream {
        rx,
        _guard: token.drop_guard(),
    }
}

/// Validate, authorize, and start a turn.
pub async fn run_chat(
    ctx: &AppContext,
    caller: &Identity,
    request: ChatRequest,
) -> PipelineResult<ChatStream> {
    let prepared = prepare_chat(ctx, caller, request).await?;
    Ok(start_chat(ctx.clone(), prepared))
}

enum Halt {
    /// The consumer went away.
    Closed,
    Failed(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(e: PipelineError) -> Self {
        Halt::Failed(e)
    }
}

async fn emit(tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> Result<(), Halt> {
    tx.send(event).await.map_err(|_| Halt::Closed)
}

async fn answer(
    ctx: &AppContext,
    prepared: &PreparedChat,
    tx: &mpsc::Sender<ChatEvent>,
) -> Result<FinishReason, Halt> {
    let project = &prepared.project;

    let query = generate_search_query(ctx.chat.as_ref(), &prepared.messages)
        .await
        .stage(Stage::Condense)?;
    emit(
        tx,
        ChatEvent::SearchQuery {
            query: query.clone(),
        },
    )
    .await?;

    let hits = if query.is_empty() {
        Vec::new()
    } else {
        let query_vec = ctx.embedder.embed_one(&query).await.stage(Stage::Embedding)?;
        search_chunks(
            ctx.store.as_ref(),
            &project.id,
            &query_vec,
            ctx.config.retrieval.top_k,
        )
        .await
        .stage(Stage::Search)?
    };
    tracing::debug!(project = %project.id, hits = hits.len(), "retrieval finished");

    for source in cited_sources(ctx, &project.id, &hits).await? {
        emit(tx, ChatEvent::Source { source }).await?;
    }

    if hits.is_empty() {
        emit(
            tx,
            ChatEvent::Text {
                delta: FALLBACK_ANSWER.to_string(),
            },
        )
        .await?;
        return Ok(FinishReason::NoContext);
    }

    let web_search = prepared.web_search && ctx.chat.supports_web_search();
    if prepared.web_search && !web_search {
        tracing::warn!(
            project = %project.id,
            "web search requested but [generation.web_search] is not configured, answering from documents only"
        );
    }

    let context = assemble_context(&hits, &ctx.config.assets.base_url);
    let system = render_system_prompt(&project.name, &context, web_search)
        .map_err(|e| PipelineError::Config(e.to_string()))?;

    let mut deltas = ctx
        .chat
        .stream(CompletionRequest {
            system: Some(system),
            messages: prepared.messages.clone(),
            temperature: ctx.config.generation.temperature,
            web_search,
        })
        .await
        .stage(Stage::Generation)?;

    while let Some(delta) = deltas.next().await {
        let delta = delta.stage(Stage::Generation)?;
        emit(tx, ChatEvent::Text { delta }).await?;
    }
    Ok(FinishReason::Stop)
}

/// One source per distinct document among the hits, in rank order.
async fn cited_sources(
    ctx: &AppContext,
    project_id: &str,
    hits: &[SearchHit],
) -> Result<Vec<SourceRef>, Halt> {
    if hits.is_empty() {
        return Ok(Vec::new());
    }
    let documents = ctx
        .store
        .list_documents(project_id)
        .await
        .stage(Stage::Storage)?;
    let by_id: HashMap<&str, _> = documents.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut seen = std::collections::HashSet::new();
    let mut sources = Vec::new();
    for hit in hits {
        if !seen.insert(hit.document_id.as_str()) {
            continue;
        }
        if let Some(doc) = by_id.get(hit.document_id.as_str()) {
            sources.push(SourceRef {
                source_type: "document",
                id: doc.id.clone(),
                title: doc.title.clone(),
                url: doc
                    .source_url
                    .clone()
                    .unwrap_or_else(|| doc.markdown_url.clone()),
            });
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            project_id: "p1".into(),
            web_search: false,
        }
    }

    #[test]
    fn test_validate_last_message() {
        assert!(request(vec![ChatMessage::user("hi")]).validate().is_ok());

        match request(vec![]).validate() {
            Err(PipelineError::Validation(m)) => assert_eq!(m, "No message provided"),
            other => panic!("unexpected: {:?}", other),
        }
        match request(vec![ChatMessage::user("  ")]).validate() {
            Err(PipelineError::Validation(m)) => assert_eq!(m, "No message provided"),
            other => panic!("unexpected: {:?}", other),
        }
        match request(vec![ChatMessage::user("q"), ChatMessage::assistant("a")]).validate() {
            Err(PipelineError::Validation(m)) => assert_eq!(m, "Invalid message role"),
            other => panic!("unexpected: {:?}", other),
        }

        let mut r = request(vec![ChatMessage::user("hi")]);
        r.project_id = String::new();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let e = ChatEvent::Source {
            source: SourceRef {
                source_type: "document",
                id: "d1".into(),
                title: "Manual".into(),
                url: "https://x.test/m.pdf".into(),
            },
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "source");
        assert_eq!(json["source"]["sourceType"], "document");
        assert_eq!(e.name(), "source");

        let f = ChatEvent::Finish {
            reason: FinishReason::NoContext,
        };
        assert_eq!(serde_json::to_value(&f).unwrap()["reason"], "no_context");
        assert!(f.is_terminal());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let r: ChatRequest = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"hi"}],"projectId":"p9","webSearch":true}"#,
        )
        .unwrap();
        assert_eq!(r.project_id, "p9");
        assert!(r.web_search);
    }
}
