//! Blob storage, source fetching, and image relocation.
//!
//! Uploaded documents are rendered to markdown by an upstream converter
//! which writes the markdown and its extracted images into a staging
//! container. Ingestion reads the markdown back through a [`SourceFetcher`]
//! and copies the images to the public images container with
//! [`relocate_images`].
//!
//! [`FsBlobStore`] keeps each container as a directory under one root.
//! Blob tags are stored beside the data under `<root>/.tags/`, which can
//! never collide with a container since container names may not start
//! with a dot.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use walkdir::WalkDir;

use aiha_core::images::relocated_name;

/// Tags attached to a blob.
pub type BlobTags = BTreeMap<String, String>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Names of every blob in `container` whose name starts with `prefix`,
    /// sorted.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, container: &str, name: &str) -> Result<bool>;

    async fn copy(&self, from: (&str, &str), to: (&str, &str)) -> Result<()>;

    async fn set_tags(&self, container: &str, name: &str, tags: &BlobTags) -> Result<()>;

    async fn get_tags(&self, container: &str, name: &str) -> Result<BlobTags>;

    async fn read(&self, container: &str, name: &str) -> Result<Vec<u8>>;

    async fn write(&self, container: &str, name: &str, data: &[u8]) -> Result<()>;
}

// ============ Filesystem ============

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_container(container)?;
        Ok(self.root.join(container).join(safe_relative(name)?))
    }

    fn tags_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_container(container)?;
        let mut path = self.root.join(".tags").join(container).join(safe_relative(name)?);
        let file_name = path
            .file_name()
            .map(|f| format!("{}.json", f.to_string_lossy()))
            .ok_or_else(|| anyhow!("invalid blob name '{}'", name))?;
        path.set_file_name(file_name);
        Ok(path)
    }
}

/// Container names follow the cloud rules: 3-63 characters of lowercase
/// letters, digits, and hyphens, starting with a letter or digit.
pub fn validate_container(name: &str) -> Result<()> {
    let valid = (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-');
    if !valid {
        bail!("invalid container name '{}'", name);
    }
    Ok(())
}

/// Blob names are `/`-separated relative paths without `.` or `..` parts.
fn safe_relative(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        bail!("blob name must not be empty");
    }
    let path = Path::new(trimmed);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => bail!("invalid blob name '{}'", name),
        }
    }
    Ok(path.to_path_buf())
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Blob names under `base` starting with `prefix`, sorted.
fn list_files(base: &Path, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to list {}", base.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(base).unwrap_or(path);
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if name.starts_with(prefix) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        validate_container(container)?;
        let base = self.root.join(container);
        if !tokio::fs::try_exists(&base).await? {
            bail!("container '{}' does not exist", container);
        }

        let prefix = prefix.trim_start_matches('/').to_string();
        tokio::task::spawn_blocking(move || list_files(&base, &prefix))
            .await
            .context("blob listing task failed")?
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool> {
        let path = self.blob_path(container, name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn copy(&self, from: (&str, &str), to: (&str, &str)) -> Result<()> {
        let src = self.blob_path(from.0, from.1)?;
        let dst = self.blob_path(to.0, to.1)?;
        ensure_parent(&dst).await?;
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("failed to copy {}/{} to {}/{}", from.0, from.1, to.0, to.1))?;
        Ok(())
    }

    async fn set_tags(&self, container: &str, name: &str, tags: &BlobTags) -> Result<()> {
        if !self.exists(container, name).await? {
            bail!("blob {}/{} not found", container, name);
        }
        let path = self.tags_path(container, name)?;
        ensure_parent(&path).await?;
        tokio::fs::write(&path, serde_json::to_vec(tags)?).await?;
        Ok(())
    }

    async fn get_tags(&self, container: &str, name: &str) -> Result<BlobTags> {
        let path = self.tags_path(container, name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlobTags::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(container, name)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("blob {}/{} not readable", container, name))
    }

    async fn write(&self, container: &str, name: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(container, name)?;
        ensure_parent(&path).await?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }
}

// ============ Image relocation ============

/// Outcome counts of [`relocate_images`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RelocationReport {
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Copy every blob under `images_dir` in `staging` into `images`.
///
/// Destination names have the `images_dir` prefix stripped. Blobs already
/// present at the destination are left alone. Each copy is tagged with
/// `sourceBlob = <original name>`. Errors are logged and counted, never
/// returned: a missing image must not fail the document.
pub async fn relocate_images(
    blobs: &dyn BlobStore,
    staging: &str,
    images: &str,
    images_dir: &str,
) -> RelocationReport {
    let mut report = RelocationReport::default();
    let prefix = images_dir.trim_start_matches('/');

    let names = match blobs.list(staging, prefix).await {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(container = staging, prefix, error = %e, "cannot list staged images");
            return report;
        }
    };

    for name in names {
        let dest = relocated_name(&name, images_dir);
        match relocate_one(blobs, staging, images, &name, &dest).await {
            Ok(true) => {
                tracing::debug!(blob = %name, dest = %dest, "copied image");
                report.copied += 1;
            }
            Ok(false) => {
                tracing::debug!(blob = %name, "image already relocated, skipping");
                report.skipped += 1;
            }
            Err(e) => {
                tracing::warn!(blob = %name, error = %e, "failed to relocate image");
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        copied = report.copied,
        skipped = report.skipped,
        failed = report.failed,
        "image relocation finished"
    );
    report
}

async fn relocate_one(
    blobs: &dyn BlobStore,
    staging: &str,
    images: &str,
    name: &str,
    dest: &str,
) -> Result<bool> {
    if blobs.exists(images, dest).await? {
        return Ok(false);
    }
    blobs.copy((staging, name), (images, dest)).await?;
    let mut tags = BlobTags::new();
    tags.insert("sourceBlob".to_string(), name.to_string());
    blobs.set_tags(images, dest, &tags).await?;
    Ok(true)
}

// ============ Source fetching ============

/// Retrieves the markdown rendering of an uploaded document.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

/// Fetches sources over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Failed to fetch markdown: {}", status);
        }
        Ok(response.text().await?)
    }
}

/// Resolves source URLs under `url_prefix` to blobs of one container.
///
/// `https://host/aiha/docs/a.md` with prefix `https://host/aiha` reads blob
/// `docs/a.md`.
pub struct BlobFetcher {
    blobs: Arc<dyn BlobStore>,
    url_prefix: String,
    container: String,
}

impl BlobFetcher {
    pub fn new(blobs: Arc<dyn BlobStore>, url_prefix: &str, container: &str) -> Self {
        Self {
            blobs,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
            container: container.to_string(),
        }
    }

    /// The URL a blob of the container is addressed by.
    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.url_prefix, name.trim_start_matches('/'))
    }
}

#[async_trait]
impl SourceFetcher for BlobFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let name = url
            .strip_prefix(&self.url_prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| anyhow!("{} is not under {}", url, self.url_prefix))?;
        let bytes = self.blobs.read(&self.container, name).await?;
        String::from_utf8(bytes).map_err(|_| anyhow!("{} is not valid UTF-8", url))
    }
}
