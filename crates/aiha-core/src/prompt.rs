//! Prompt templates and context assembly.
//!
//! Templates use `{{name}}` placeholders. Rendering is checked in both
//! directions: a placeholder the field record does not know is an error,
//! and so is a field the template never references. Values are substituted
//! in a single pass, so placeholder-like text inside a value (for example a
//! retrieved chunk containing `{{context}}`) is left alone.

use std::sync::OnceLock;

use anyhow::{bail, Result};
use regex::Regex;

use crate::images::BASE_URL_PLACEHOLDER;
use crate::models::SearchHit;

/// Answer given when retrieval finds nothing relevant.
pub const FALLBACK_ANSWER: &str = "Sorry, I couldn't find the answer in the provided documents.";

pub const SYSTEM_PROMPT: &str = "You are an AI assistant for the {{projectName}} project. Your goal is to answer questions about the project, based on the provided context, the context will be in markdown format with images.

### Context
{{context}}

### Instructions
- Only use the provided context to answer questions.
- If the answer is not contained within the context, say \"Sorry, I couldn't find the answer in the provided documents.\"
- If the question is not related to the project, say \"Sorry, I can only answer questions related to the project.\"
- Always answer in markdown format, improve readability by using headings, lists, and bold text. Include images whenever possible in markdown format (do not use the HTML img tag).";

pub const WEB_SEARCH_SYSTEM_PROMPT: &str = "You are an AI assistant for the {{projectName}} project. Your goal is to answer questions about the project, based on the provided context, the context will be in markdown format with images.

### Context
{{context}}

### Instructions
- Only use the provided context to answer questions.
- If the answer is not contained within the context, say \"Sorry, I couldn't find the answer in the provided documents.\"
- You can also search the web for information.
- Always answer in markdown format, improve readability by using headings, lists, and bold text. Include images whenever possible in markdown format (do not use the HTML img tag).";

pub const QUERY_REWRITE_PROMPT: &str = "You are a search query rewriter. Your goal is to analyze the conversation history and produce a search query that is relevant to the conversation. Must be a single comprehensive sentence. Output only the search query. If the user query is a few keywords, output the keywords.";

/// A record of named values a template can reference.
pub trait TemplateFields {
    /// Every field name this record provides.
    fn names(&self) -> &'static [&'static str];

    fn get(&self, name: &str) -> Option<&str>;
}

/// Fields of the answer-generation system prompt.
#[derive(Debug, Clone)]
pub struct SystemPromptFields<'a> {
    pub project_name: &'a str,
    pub context: &'a str,
}

impl TemplateFields for SystemPromptFields<'_> {
    fn names(&self) -> &'static [&'static str] {
        &["projectName", "context"]
    }

    fn get(&self, name: &str) -> Option<&str> {
        match name {
            "projectName" => Some(self.project_name),
            "context" => Some(self.context),
            _ => None,
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// A parsed prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    source: String,
    placeholders: Vec<String>,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut placeholders: Vec<String> = Vec::new();
        for cap in placeholder_re().captures_iter(&source) {
            let name = cap[1].to_string();
            if !placeholders.contains(&name) {
                placeholders.push(name);
            }
        }
        Self {
            source,
            placeholders,
        }
    }

    /// Distinct placeholder names, in order of first appearance.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    pub fn render(&self, fields: &dyn TemplateFields) -> Result<String> {
        for name in &self.placeholders {
            if !fields.names().contains(&name.as_str()) {
                bail!("unknown template placeholder '{{{{{}}}}}'", name);
            }
        }
        for name in fields.names() {
            if !self.placeholders.iter().any(|p| p == name) {
                bail!("template does not reference field '{}'", name);
            }
        }

        let mut out = String::with_capacity(self.source.len());
        let mut last = 0;
        for cap in placeholder_re().captures_iter(&self.source) {
            let whole = cap.get(0).map(|m| m.range()).unwrap_or(0..0);
            let value = match fields.get(&cap[1]) {
                Some(v) => v,
                None => bail!("missing value for template field '{}'", &cap[1]),
            };
            out.push_str(&self.source[last..whole.start]);
            out.push_str(value);
            last = whole.end;
        }
        out.push_str(&self.source[last..]);
        Ok(out)
    }
}

/// Render the answer-generation system prompt.
pub fn render_system_prompt(project_name: &str, context: &str, web_search: bool) -> Result<String> {
    let template = if web_search {
        PromptTemplate::new(WEB_SEARCH_SYSTEM_PROMPT)
    } else {
        PromptTemplate::new(SYSTEM_PROMPT)
    };
    template.render(&SystemPromptFields {
        project_name,
        context,
    })
}

/// Join retrieved chunk contents in rank order, separated by blank lines,
/// and resolve `${BASE_URL}` image links against `base_url`.
pub fn assemble_context(hits: &[SearchHit], base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    hits.iter()
        .map(|h| h.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
        .replace(BASE_URL_PLACEHOLDER, base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn hit(content: &str) -> SearchHit {
        SearchHit {
            chunk_id: "c".into(),
            document_id: "d".into(),
            content: content.into(),
            metadata: ChunkMetadata {
                document_id: "d".into(),
                project_id: "p".into(),
                loc: None,
                extra: Default::default(),
            },
            score: 1.0,
        }
    }

    #[test]
    fn test_render_system_prompt() {
        let out = render_system_prompt("Apollo", "Some context.", false).unwrap();
        assert!(out.contains("the Apollo project"));
        assert!(out.contains("### Context\nSome context."));
        assert!(out.contains(FALLBACK_ANSWER));
        assert!(!out.contains("{{"));
        assert!(!out.contains("search the web"));
    }

    #[test]
    fn test_web_search_variant() {
        let out = render_system_prompt("Apollo", "ctx", true).unwrap();
        assert!(out.contains("You can also search the web for information."));
        assert!(out.contains(FALLBACK_ANSWER));
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let t = PromptTemplate::new("{{projectName}} {{context}} {{audience}}");
        let err = t
            .render(&SystemPromptFields {
                project_name: "a",
                context: "b",
            })
            .unwrap_err();
        assert!(err.to_string().contains("audience"));
    }

    #[test]
    fn test_unreferenced_field_rejected() {
        let t = PromptTemplate::new("Project {{projectName}} only");
        assert!(t
            .render(&SystemPromptFields {
                project_name: "a",
                context: "b",
            })
            .is_err());
    }

    #[test]
    fn test_values_are_not_reexpanded() {
        let t = PromptTemplate::new("{{context}} / {{projectName}}");
        let out = t
            .render(&SystemPromptFields {
                project_name: "P",
                context: "literal {{projectName}}",
            })
            .unwrap();
        assert_eq!(out, "literal {{projectName}} / P");
    }

    #[test]
    fn test_assemble_context() {
        let hits = vec![hit("first ![x](${BASE_URL}/a.png)"), hit("second ${BASE_URL}/b.png")];
        let ctx = assemble_context(&hits, "https://cdn.test/images/");
        assert_eq!(
            ctx,
            "first ![x](https://cdn.test/images/a.png)\n\nsecond https://cdn.test/images/b.png"
        );
        assert_eq!(assemble_context(&[], "x"), "");
    }
}
