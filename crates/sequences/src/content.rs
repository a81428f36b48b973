//! Template compiler contract and the block compiler used by default.
//!
//! Merge fields use `{{name}}` syntax. Values come from the enrollment's
//! recipient data; strings are inserted verbatim, other JSON values in their
//! JSON form, and `null` as an empty string.

use drip_core::{DripError, DripResult};

use crate::types::{ContentBlock, RecipientData};

pub trait TemplateCompiler: Send + Sync {
    /// Renders editor blocks into an HTML document for one recipient.
    fn compile(
        &self,
        blocks: &[ContentBlock],
        recipient_data: &RecipientData,
        base_url: &str,
    ) -> DripResult<String>;

    fn replace_variables(&self, text: &str, data: &RecipientData) -> String;
}

/// Renders the basic editor block kinds: `heading`, `text`, `button`,
/// `image`, `divider`, `spacer` and raw `html`.
#[derive(Debug, Clone, Default)]
pub struct BlockCompiler;

impl BlockCompiler {
    pub fn new() -> Self {
        Self
    }

    fn render_block(&self, block: &ContentBlock, base_url: &str) -> DripResult<String> {
        let prop = |key: &str| {
            block
                .props
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
        };

        let html = match block.kind.as_str() {
            "heading" => format!("<h1>{}</h1>", escape_html(prop("text"))),
            "text" => format!("<p>{}</p>", escape_html(prop("text"))),
            "button" => {
                let href = absolute_url(base_url, prop("url"));
                format!(
                    "<a class=\"button\" href=\"{}\">{}</a>",
                    escape_html(&href),
                    escape_html(prop("label"))
                )
            }
            "image" => format!(
                "<img src=\"{}\" alt=\"{}\" />",
                escape_html(&absolute_url(base_url, prop("src"))),
                escape_html(prop("alt"))
            ),
            "divider" => "<hr />".to_string(),
            "spacer" => "<div style=\"height:24px\"></div>".to_string(),
            "html" => prop("html").to_string(),
            other => {
                return Err(DripError::Template(format!(
                    "unsupported block kind '{other}'"
                )))
            }
        };
        Ok(html)
    }
}

impl TemplateCompiler for BlockCompiler {
    fn compile(
        &self,
        blocks: &[ContentBlock],
        recipient_data: &RecipientData,
        base_url: &str,
    ) -> DripResult<String> {
        let mut body = String::new();
        for block in blocks {
            body.push_str(&self.render_block(block, base_url)?);
            body.push('\n');
        }
        let html = format!("<!DOCTYPE html>\n<html><body>\n{body}</body></html>");
        Ok(self.replace_variables(&html, recipient_data))
    }

    fn replace_variables(&self, text: &str, data: &RecipientData) -> String {
        let mut result = text.to_string();
        for (name, value) in data {
            let placeholder = format!("{{{{{}}}}}", name);
            if !result.contains(&placeholder) {
                continue;
            }
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            result = result.replace(&placeholder, &value);
        }
        result
    }
}

fn absolute_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("mailto:") {
        url.to_string()
    } else if url.is_empty() {
        base_url.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
