//! # AIHA Core
//!
//! Shared, I/O-free logic for the AIHA retrieval core: data models, the
//! recursive chunk splitter, the store abstraction, project-scoped vector
//! search, prompt templates, markdown image rewriting, and the embedding
//! trait.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Everything that talks to the outside world lives in the `aiha` app crate
//! and reaches this crate through the [`store::Store`] and
//! [`embedding::Embedder`] traits.

pub mod chunk;
pub mod embedding;
pub mod images;
pub mod models;
pub mod prompt;
pub mod search;
pub mod store;
