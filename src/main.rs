//! # AIHA CLI (`aiha`)
//!
//! Operator interface for the AIHA retrieval core: database setup, project
//! management, local ingestion, search, one-shot questions, and the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! aiha --config ./config/aiha.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `aiha init` | Create the SQLite database and schema |
//! | `aiha project create` | Create a project |
//! | `aiha project list` | List projects readable by a user |
//! | `aiha ingest` | Stage a local markdown file and ingest it |
//! | `aiha search` | Print the top chunks for a query |
//! | `aiha ask` | Answer a question, streaming to stdout |
//! | `aiha serve` | Start the HTTP server |
//!
//! Logs go to stderr; answers and listings go to stdout.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use aiha::chat::{run_chat, ChatEvent, ChatRequest};
use aiha::config;
use aiha::context::AppContext;
use aiha::ingest::{run_ingest, IngestRequest};
use aiha::logging;
use aiha::migrate;
use aiha::projects::{self, Identity, NewProject};
use aiha::server;
use aiha_core::models::ChatMessage;
use aiha_core::search::search_chunks;

/// AIHA: chat with your documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/aiha.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "aiha",
    about = "AIHA: document-grounded chat over project knowledge bases",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/aiha.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Ingest a local markdown rendering of a document.
    ///
    /// The file (and any images under `--images-from`) is copied into the
    /// staging container, then runs through the same pipeline as
    /// `PUT /api/document`.
    Ingest {
        /// Target project id.
        #[arg(long)]
        project: String,

        /// Markdown file to ingest.
        #[arg(long)]
        file: PathBuf,

        /// Document title. Defaults to the file name.
        #[arg(long)]
        title: Option<String>,

        /// Type of the original document: `pdf`, `txt`, or `md`.
        #[arg(long, default_value = "md")]
        doc_type: String,

        /// Directory the markdown's image links point into.
        #[arg(long, default_value = "/tmp/images")]
        images_dir: String,

        /// Local directory whose files are staged under `--images-dir`.
        #[arg(long)]
        images_from: Option<PathBuf>,

        /// Link to the original document, shown on citations.
        #[arg(long)]
        source_url: Option<String>,

        /// Acting user id.
        #[arg(long)]
        user: String,
    },

    /// Print the top chunks of a project for a query.
    Search {
        #[arg(long)]
        project: String,

        /// The search query string.
        query: String,

        /// Number of chunks to return. Defaults to `[retrieval].top_k`.
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        user: Option<String>,
    },

    /// Ask a single question and stream the answer.
    Ask {
        #[arg(long)]
        project: String,

        question: String,

        #[arg(long)]
        user: Option<String>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project owned by `--owner`.
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        public: bool,
        /// Collaborator user id. Repeatable.
        #[arg(long = "collaborator")]
        collaborators: Vec<String>,
    },
    /// List projects readable by `--user` (public ones when omitted).
    List {
        #[arg(long)]
        user: Option<String>,
    },
}

fn identity(user: Option<String>) -> Identity {
    match user {
        Some(id) => Identity::user(id),
        None => Identity::anonymous(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_with_config(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => {
            let ctx = AppContext::from_config(cfg).await?;
            run_project(&ctx, action).await?;
        }
        Commands::Ingest {
            project,
            file,
            title,
            doc_type,
            images_dir,
            images_from,
            source_url,
            user,
        } => {
            let ctx = AppContext::from_config(cfg).await?.with_blob_sources();
            let md_doc_url = stage_markdown(&ctx, &file).await?;
            if let Some(dir) = images_from {
                let staged = stage_images(&ctx, &dir, &images_dir).await?;
                println!("Staged {} image(s).", staged);
            }
            let title = match title {
                Some(t) => t,
                None => file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            let request = IngestRequest {
                container_name: ctx.config.ingest.staging_container.clone(),
                images_dir,
                md_doc_url,
                project_id: project,
                doc_name: title,
                doc_type,
                source_url,
            };
            let outcome = run_ingest(&ctx, &Identity::user(user), &request).await?;
            println!(
                "Ingested document {} ({} chunks, {} image(s) relocated).",
                outcome.document_id,
                outcome.chunks.len(),
                outcome.relocation.copied
            );
        }
        Commands::Search {
            project,
            query,
            limit,
            user,
        } => {
            let ctx = AppContext::from_config(cfg).await?;
            run_search(&ctx, &identity(user), &project, &query, limit).await?;
        }
        Commands::Ask {
            project,
            question,
            user,
        } => {
            let ctx = AppContext::from_config(cfg).await?;
            run_ask(&ctx, &identity(user), project, question).await?;
        }
        Commands::Serve => {
            let ctx = AppContext::from_config(cfg).await?;
            server::run_server(ctx).await?;
        }
    }

    Ok(())
}

async fn run_project(ctx: &AppContext, action: ProjectAction) -> Result<()> {
    match action {
        ProjectAction::Create {
            owner,
            name,
            description,
            public,
            collaborators,
        } => {
            let project = projects::create_project(
                ctx.store.as_ref(),
                &Identity::user(owner),
                NewProject {
                    name,
                    description,
                    is_public: public,
                    collaborators,
                },
            )
            .await?;
            println!("{}", project.id);
        }
        ProjectAction::List { user } => {
            let list = projects::list_projects(ctx.store.as_ref(), &identity(user)).await?;
            if list.is_empty() {
                println!("No projects.");
            }
            for p in list {
                let visibility = if p.is_public { "public" } else { "private" };
                println!("{}  {:<8} {}  (owner: {})", p.id, visibility, p.name, p.owner_id);
            }
        }
    }
    Ok(())
}

/// Copy a local markdown file into the staging container and return the
/// URL the ingestion pipeline will fetch it from.
async fn stage_markdown(ctx: &AppContext, file: &Path) -> Result<String> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = format!("uploads/{}.md", uuid::Uuid::new_v4());
    ctx.blobs
        .write(&ctx.config.ingest.staging_container, &name, &data)
        .await?;
    Ok(ctx.staging_fetcher().url_for(&name))
}

async fn stage_images(ctx: &AppContext, dir: &Path, images_dir: &str) -> Result<usize> {
    let prefix = images_dir.trim_matches('/');
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    let mut staged = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let data = tokio::fs::read(entry.path()).await?;
        ctx.blobs
            .write(
                &ctx.config.ingest.staging_container,
                &format!("{}/{}", prefix, file_name),
                &data,
            )
            .await?;
        staged += 1;
    }
    Ok(staged)
}

async fn run_search(
    ctx: &AppContext,
    caller: &Identity,
    project_id: &str,
    query: &str,
    limit: Option<usize>,
) -> Result<()> {
    let project = projects::get_project(ctx.store.as_ref(), caller, project_id).await?;
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let top_k = limit.unwrap_or(ctx.config.retrieval.top_k);
    let query_vec = ctx.embedder.embed_one(query).await?;
    let hits = search_chunks(ctx.store.as_ref(), &project.id, &query_vec, top_k).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        let lines = hit
            .metadata
            .loc
            .as_ref()
            .map(|loc| format!("lines {}-{}", loc.lines.from, loc.lines.to))
            .unwrap_or_default();
        println!(
            "{}. [{:.4}] {} {}",
            i + 1,
            hit.score,
            hit.document_id,
            lines
        );
        let preview: String = hit.content.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    Ok(())
}

async fn run_ask(ctx: &AppContext, caller: &Identity, project_id: String, question: String) -> Result<()> {
    let request = ChatRequest {
        messages: vec![ChatMessage::user(question)],
        project_id,
        web_search: false,
    };
    let mut events = run_chat(ctx, caller, request).await?;
    let mut sources = Vec::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            ChatEvent::SearchQuery { query } => {
                tracing::info!(query = %query, "search query");
            }
            ChatEvent::Source { source } => sources.push(source),
            ChatEvent::Text { delta } => {
                write!(stdout, "{}", delta)?;
                stdout.flush()?;
            }
            ChatEvent::Error { message } => {
                writeln!(stdout)?;
                bail!(message);
            }
            ChatEvent::Finish { .. } => {
                writeln!(stdout)?;
            }
        }
    }

    if !sources.is_empty() {
        println!("\nSources:");
        for s in sources {
            println!("  - {} ({})", s.title, s.url);
        }
    }
    Ok(())
}
