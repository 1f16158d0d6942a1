//! Markdown image link rewriting.
//!
//! Documents arrive with images stored under a temporary directory. During
//! ingestion the images are relocated and every `![alt](url)` that points
//! into that directory is rewritten to `${BASE_URL}/<relative-path>`. The
//! placeholder is resolved against the deployment's asset base URL when
//! context is assembled at query time.

use std::sync::OnceLock;

use regex::Regex;

/// Placeholder substituted for the images directory in rewritten links.
pub const BASE_URL_PLACEHOLDER: &str = "${BASE_URL}";

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[(.*?)\]\((.*?)\)").expect("image regex is valid"))
}

/// Result of [`rewrite_image_links`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenMarkdown {
    pub markdown: String,
    /// Rewritten image links, in document order.
    pub images: Vec<String>,
}

impl RewrittenMarkdown {
    /// The first rewritten image, used as the document thumbnail.
    pub fn thumbnail(&self) -> Option<&str> {
        self.images.first().map(String::as_str)
    }
}

/// Rewrite every image link under `images_dir` to the `${BASE_URL}` form.
///
/// Everything up to and including `images_dir` is replaced, so both
/// relative links (`/tmp/images/a.png`) and absolute blob URLs ending in the
/// same directory are handled. Links outside `images_dir` are untouched.
pub fn rewrite_image_links(markdown: &str, images_dir: &str) -> RewrittenMarkdown {
    let dir = images_dir.trim_end_matches('/');
    if dir.is_empty() {
        return RewrittenMarkdown {
            markdown: markdown.to_string(),
            images: Vec::new(),
        };
    }

    let mut images = Vec::new();
    let rewritten = image_re().replace_all(markdown, |cap: &regex::Captures<'_>| {
        let alt = &cap[1];
        let url = &cap[2];
        match url.find(dir) {
            Some(pos) => {
                let rest = &url[pos + dir.len()..];
                let new_url = format!("{}{}", BASE_URL_PLACEHOLDER, rest);
                images.push(new_url.clone());
                format!("![{}]({})", alt, new_url)
            }
            None => cap[0].to_string(),
        }
    });

    RewrittenMarkdown {
        markdown: rewritten.into_owned(),
        images,
    }
}

/// Name a relocated blob gets at its destination: the source name with the
/// images directory prefix removed.
pub fn relocated_name(blob_name: &str, images_dir: &str) -> String {
    let dir = images_dir.trim_matches('/');
    let name = blob_name.trim_start_matches('/');
    name.strip_prefix(dir)
        .map(|rest| rest.trim_start_matches('/').to_string())
        .unwrap_or_else(|| name.to_string())
}
