//! # AIHA
//!
//! Retrieval core of a document-grounded chat assistant. Users group
//! documents into projects, upload them, and chat with an assistant that
//! answers only from those documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────┐
//! │ PUT document │──▶│ Split + Embed │──▶│  SQLite  │
//! │ (md + imgs)  │   │  + relocate   │   │ chunks   │
//! └──────────────┘   └───────────────┘   └────┬─────┘
//!                                             │
//!                    ┌────────────────────────┤
//!                    ▼                        ▼
//!              ┌───────────┐          ┌──────────────┐
//!              │ CLI (aiha)│          │ HTTP + SSE   │
//!              └───────────┘          │ /api/chat    │
//!                                     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! aiha init
//! aiha project create --owner alice --name Manuals
//! aiha ingest --project <id> --file manual.md --doc-type md --user alice
//! aiha ask --project <id> "How do I reset the pump?"
//! aiha serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Pipeline error kinds and their HTTP mapping |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite implementation of the store |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Chat-completion providers and SSE decoding |
//! | [`blobs`] | Blob storage, image relocation, source fetching |
//! | [`context`] | Shared application context |
//! | [`projects`] | Projects and access control |
//! | [`ingest`] | Ingestion pipeline |
//! | [`condense`] | Search-query rewriting |
//! | [`chat`] | Streaming query pipeline |
//! | [`server`] | HTTP API |
//!
//! Splitting, search ranking, prompts, and image-link rewriting live in the
//! I/O-free `aiha-core` crate.

pub mod blobs;
pub mod chat;
pub mod condense;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod projects;
pub mod server;
pub mod sqlite_store;
