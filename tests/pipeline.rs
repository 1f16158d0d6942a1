//! End-to-end tests of the ingestion and query pipelines against in-memory
//! storage, a filesystem blob store, and scripted providers.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;

use aiha::blobs::BlobStore;
use aiha::chat::{run_chat, ChatEvent, ChatRequest, FinishReason};
use aiha::condense::generate_search_query;
use aiha::error::{PipelineError, Stage};
use aiha::ingest::{run_ingest, IngestRequest};
use aiha::projects::{create_project, Identity, NewProject};
use aiha_core::models::{ChatMessage, Project};
use aiha_core::prompt::FALLBACK_ANSWER;
use aiha_core::store::Store;

use common::*;

const MANUAL_URL: &str = "https://aiha.blob.core.windows.net/aiha/uploads/manual.md";

async fn project(h: &Harness, owner: &str, public: bool) -> Project {
    create_project(
        h.store.as_ref(),
        &Identity::user(owner),
        NewProject {
            name: "Pumps".into(),
            description: "Pump documentation".into(),
            is_public: public,
            collaborators: vec!["carol".into()],
        },
    )
    .await
    .unwrap()
}

fn ingest_request(project_id: &str) -> IngestRequest {
    IngestRequest {
        container_name: "aiha".into(),
        images_dir: "/tmp/images".into(),
        md_doc_url: MANUAL_URL.into(),
        project_id: project_id.into(),
        doc_name: "Pump Manual".into(),
        doc_type: "pdf".into(),
        source_url: Some("https://aiha.blob.core.windows.net/aiha/uploads/manual.pdf".into()),
    }
}

fn ask(project_id: &str, question: &str) -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::user(question)],
        project_id: project_id.into(),
        web_search: false,
    }
}

// ─── Ingestion ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_ingest_document_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("", &[]),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    stage(&h.blobs, "aiha", "tmp/images/pump.png", b"png-bytes").await;
    let p = project(&h, "alice", false).await;

    let outcome = run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
        .await
        .unwrap();

    // The document was split into several overlapping chunks.
    assert!(outcome.chunks.len() > 1);
    assert_eq!(h.store.chunk_count(), outcome.chunks.len());
    for chunk in h.store.chunks_for_document(&outcome.document_id) {
        assert_eq!(chunk.metadata.document_id, outcome.document_id);
        assert_eq!(chunk.metadata.project_id, p.id);
        assert_eq!(chunk.embedding.len(), BagOfWordsEmbedder::DIMS);
        assert!(chunk.metadata.loc.is_some());
    }

    // Image links are rewritten and the first becomes the thumbnail.
    assert_eq!(
        outcome.document.thumbnail.as_deref(),
        Some("${BASE_URL}/pump.png")
    );
    assert!(outcome.chunks[0].text.contains("](${BASE_URL}/pump.png)"));
    assert!(outcome
        .chunks
        .iter()
        .all(|c| !c.text.contains("/tmp/images")));

    // The staged image was relocated and tagged with its origin.
    assert_eq!(outcome.relocation.copied, 1);
    assert!(h.blobs.exists("images", "pump.png").await.unwrap());
    let tags = h.blobs.get_tags("images", "pump.png").await.unwrap();
    assert_eq!(tags.get("sourceBlob").map(String::as_str), Some("tmp/images/pump.png"));

    let docs = h.store.list_documents(&p.id).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].title, "Pump Manual");
}

#[tokio::test]
async fn test_ingest_twice_skips_relocated_images() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("", &[]),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    stage(&h.blobs, "aiha", "tmp/images/pump.png", b"png-bytes").await;
    let p = project(&h, "alice", false).await;
    let alice = Identity::user("alice");

    let first = run_ingest(&h.ctx, &alice, &ingest_request(&p.id)).await.unwrap();
    let second = run_ingest(&h.ctx, &alice, &ingest_request(&p.id)).await.unwrap();

    assert_eq!(first.relocation.copied, 1);
    assert_eq!(second.relocation.copied, 0);
    assert_eq!(second.relocation.skipped, 1);
    assert_ne!(first.document_id, second.document_id);
}

#[tokio::test]
async fn test_ingest_refuses_outsider_before_any_work() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("", &[]),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    let p = project(&h, "alice", true).await;

    // Public projects are readable, but only members add documents.
    let err = run_ingest(&h.ctx, &Identity::user("mallory"), &ingest_request(&p.id))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Forbidden(_)));

    let err = run_ingest(&h.ctx, &Identity::anonymous(), &ingest_request(&p.id))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Unauthorized));

    assert_eq!(h.fetcher.calls(), 0);
    assert_eq!(h.embedder.calls(), 0);
    assert_eq!(h.store.chunk_count(), 0);

    // Collaborators may add documents.
    run_ingest(&h.ctx, &Identity::user("carol"), &ingest_request(&p.id))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ingest_fetch_failure_stores_nothing() {
    let tmp = TempDir::new().unwrap();
    let h = harness(&tmp, ScriptedChat::new("", &[]), StaticFetcher::default());
    let p = project(&h, "alice", false).await;

    let err = run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Upstream { .. }));
    assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    assert_eq!(h.embedder.calls(), 0);
    assert!(h.store.list_documents(&p.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ingest_embedding_failure_stores_nothing() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("", &[]),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    stage(&h.blobs, "aiha", "tmp/images/pump.png", b"png").await;
    let p = project(&h, "alice", false).await;
    h.embedder.fail.store(true, Ordering::SeqCst);

    let err = run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
        .await
        .unwrap_err();
    match &err {
        PipelineError::Upstream { stage, .. } => assert_eq!(*stage, Stage::Embedding),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);

    // Neither the document row nor any chunk was written.
    assert!(h.store.list_documents(&p.id).await.unwrap().is_empty());
    assert_eq!(h.store.chunk_count(), 0);
    // Image relocation runs before embedding and is kept.
    assert!(h.blobs.exists("images", "pump.png").await.unwrap());
}

#[tokio::test]
async fn test_ingest_unknown_project() {
    let tmp = TempDir::new().unwrap();
    let h = harness(&tmp, ScriptedChat::new("", &[]), StaticFetcher::default());

    let err = run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request("missing"))
        .await
        .unwrap_err();
    match err {
        PipelineError::NotFound(msg) => assert_eq!(msg, "Project not found"),
        other => panic!("unexpected: {:?}", other),
    }
}

// ─── Query ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_streams_grounded_answer() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("how to reset the pump", &["Switch off ", "the breaker."]),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    stage(&h.blobs, "aiha", "tmp/images/pump.png", b"png").await;
    let p = project(&h, "alice", false).await;
    let doc = run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
        .await
        .unwrap();

    let events = run_chat(&h.ctx, &Identity::user("carol"), ask(&p.id, "pump reset?"))
        .await
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(
        events[0],
        ChatEvent::SearchQuery {
            query: "how to reset the pump".into()
        }
    );
    match &events[1] {
        ChatEvent::Source { source } => {
            assert_eq!(source.id, doc.document_id);
            assert_eq!(source.title, "Pump Manual");
            assert!(source.url.ends_with("manual.pdf"));
        }
        other => panic!("expected a source, got {:?}", other),
    }
    let sources = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::Source { .. }))
        .count();
    assert_eq!(sources, 1, "one source per distinct document");

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Text { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Switch off the breaker.");
    assert_eq!(
        events.last(),
        Some(&ChatEvent::Finish {
            reason: FinishReason::Stop
        })
    );

    // The model saw a system prompt naming the project, with image links
    // resolved against the asset base URL.
    let request = h.chat.last_stream.lock().unwrap().clone().unwrap();
    let system = request.system.unwrap();
    assert!(system.contains("for the Pumps project"));
    assert!(!system.contains("${BASE_URL}"));
    assert_eq!(request.messages, vec![ChatMessage::user("pump reset?")]);
}

fn terminals(events: &[ChatEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test]
async fn test_generation_failure_ends_with_one_error() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("reset", &["partial "]).failing_after_deltas("upstream reset"),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    let p = project(&h, "alice", false).await;
    run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
        .await
        .unwrap();

    let events = run_chat(&h.ctx, &Identity::user("alice"), ask(&p.id, "reset?"))
        .await
        .unwrap()
        .collect_events()
        .await;

    let names: Vec<&str> = events.iter().map(ChatEvent::name).collect();
    assert_eq!(names, vec!["search_query", "source", "text", "error"]);
    assert_eq!(terminals(&events), 1);
    assert_eq!(
        events.last(),
        Some(&ChatEvent::Error {
            message: "generation failed: upstream reset".into()
        })
    );
}

#[tokio::test]
async fn test_embedding_failure_ends_with_one_error() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("reset", &["never sent"]),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    let p = project(&h, "alice", false).await;
    run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
        .await
        .unwrap();
    h.embedder.fail.store(true, Ordering::SeqCst);

    let events = run_chat(&h.ctx, &Identity::user("alice"), ask(&p.id, "reset?"))
        .await
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(events.len(), 2, "events: {:?}", events);
    assert_eq!(events[0].name(), "search_query");
    match &events[1] {
        ChatEvent::Error { message } => assert!(message.starts_with("embedding failed")),
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(terminals(&events), 1);
    assert_eq!(h.chat.streams.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_web_search_reaches_model_only_when_supported() {
    for supported in [false, true] {
        let tmp = TempDir::new().unwrap();
        let chat = ScriptedChat::new("firmware", &["ok"]);
        let chat = if supported { chat.with_web_search() } else { chat };
        let h = harness(
            &tmp,
            chat,
            StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
        );
        let p = project(&h, "alice", false).await;
        run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
            .await
            .unwrap();

        let mut request = ask(&p.id, "latest firmware?");
        request.web_search = true;
        let events = run_chat(&h.ctx, &Identity::user("alice"), request)
            .await
            .unwrap()
            .collect_events()
            .await;
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Finish {
                reason: FinishReason::Stop
            })
        );

        let sent = h.chat.last_stream.lock().unwrap().clone().unwrap();
        assert_eq!(sent.web_search, supported);
        let system = sent.system.unwrap();
        assert_eq!(system.contains("search the web"), supported);
    }
}

#[tokio::test]
async fn test_chat_on_empty_project_gives_fallback() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("anything", &["should not be streamed"]),
        StaticFetcher::default(),
    );
    let p = project(&h, "alice", true).await;

    let events = run_chat(&h.ctx, &Identity::anonymous(), ask(&p.id, "hello?"))
        .await
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(
        events,
        vec![
            ChatEvent::SearchQuery {
                query: "anything".into()
            },
            ChatEvent::Text {
                delta: FALLBACK_ANSWER.into()
            },
            ChatEvent::Finish {
                reason: FinishReason::NoContext
            },
        ]
    );
    assert_eq!(h.chat.streams.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_chat_access_checked_before_providers() {
    let tmp = TempDir::new().unwrap();
    let h = harness(&tmp, ScriptedChat::new("q", &["a"]), StaticFetcher::default());
    let p = project(&h, "alice", false).await;

    let result = run_chat(&h.ctx, &Identity::user("mallory"), ask(&p.id, "secret?")).await;
    assert!(matches!(result, Err(PipelineError::Forbidden(_))));

    let result = run_chat(&h.ctx, &Identity::anonymous(), ask(&p.id, "secret?")).await;
    assert!(matches!(result, Err(PipelineError::Unauthorized)));

    let result = run_chat(&h.ctx, &Identity::user("alice"), ask("nope", "q")).await;
    assert!(matches!(result, Err(PipelineError::NotFound(_))));

    assert_eq!(h.chat.calls(), 0);
    assert_eq!(h.embedder.calls(), 0);
}

#[tokio::test]
async fn test_dropping_stream_cancels_generation() {
    let tmp = TempDir::new().unwrap();
    let h = harness(
        &tmp,
        ScriptedChat::new("reset", &["first delta"]).stalling(),
        StaticFetcher::default().with_page(MANUAL_URL, &manual_markdown()),
    );
    let p = project(&h, "alice", false).await;
    run_ingest(&h.ctx, &Identity::user("alice"), &ingest_request(&p.id))
        .await
        .unwrap();

    let mut stream = run_chat(&h.ctx, &Identity::user("alice"), ask(&p.id, "reset?"))
        .await
        .unwrap();
    loop {
        match stream.next().await {
            Some(ChatEvent::Text { delta }) => {
                assert_eq!(delta, "first delta");
                break;
            }
            Some(e) => assert!(!e.is_terminal(), "unexpected terminal event {:?}", e),
            None => panic!("stream ended before any text"),
        }
    }
    assert!(!h.chat.stream_dropped.load(Ordering::SeqCst));

    drop(stream);

    let dropped = h.chat.stream_dropped.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream stream was not dropped after cancellation");
}

// ─── Query rewriting ────────────────────────────────────────────────

#[tokio::test]
async fn test_search_query_is_never_empty_for_a_conversation() {
    let silent = ScriptedChat::new("", &[]);
    let conversations = vec![
        vec![ChatMessage::user("valve")],
        vec![
            ChatMessage::assistant("Hi, how can I help?"),
            ChatMessage::user("error code E2"),
        ],
        vec![
            ChatMessage::user("pump"),
            ChatMessage::assistant("Which one?"),
            ChatMessage::user("the main pump"),
        ],
    ];
    for messages in conversations {
        let query = generate_search_query(&silent, &messages).await.unwrap();
        assert!(!query.is_empty(), "empty query for {:?}", messages);
    }
    assert!(generate_search_query(&silent, &[]).await.unwrap().is_empty());
}
