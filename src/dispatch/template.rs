//! Sibling templates rendered by `response.render(data)` and template-only routes

use crate::fs::{VirtualFs, vpath};
use pulldown_cmark::{Options, Parser, html};
use serde_json::Value;
use std::fmt::Debug;
use thiserror::Error;

/// Lookup order for a script's sibling template
pub const TEMPLATE_EXTENSIONS: [&str; 4] = [".html", ".md", ".txt", ".json"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no template found for {0}")]
    NotFound(String),

    #[error("failed to read template {path}: {message}")]
    Read { path: String, message: String },

    #[error("unsupported template type: {0}")]
    Unsupported(String),
}

/// A rendered body ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Renders a template file with handler-supplied data
pub trait TemplateRenderer: Send + Sync + Debug {
    fn render(
        &self,
        fs: &dyn VirtualFs,
        template_path: &str,
        data: &Value,
    ) -> Result<Rendered, TemplateError>;
}

/// `script_path` without its extension
pub fn template_stem(script_path: &str) -> &str {
    let ext = vpath::extname(script_path);
    &script_path[..script_path.len() - ext.len()]
}

/// First existing sibling template of `script_path`, in [`TEMPLATE_EXTENSIONS`] order
pub fn find_template(fs: &dyn VirtualFs, script_path: &str) -> Option<String> {
    let stem = template_stem(script_path);
    TEMPLATE_EXTENSIONS
        .iter()
        .map(|ext| format!("{stem}{ext}"))
        .find(|candidate| fs.is_file(candidate))
}

/// Placeholder substitution plus Markdown conversion.
///
/// `{{ .Title }}`, `{{ .author.name }}` and `{{title}}` look the key path up in
/// the data. Strings are inserted as-is, other values as JSON and missing keys as
/// nothing. Values are HTML-escaped in `.html` templates. In `.json` templates
/// string values are JSON-escaped, so `"{{ .name }}"` stays a valid string literal.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicRenderer;

impl TemplateRenderer for BasicRenderer {
    fn render(
        &self,
        fs: &dyn VirtualFs,
        template_path: &str,
        data: &Value,
    ) -> Result<Rendered, TemplateError> {
        let source = fs.read_to_string(template_path).map_err(|e| TemplateError::Read {
            path: template_path.to_string(),
            message: e.to_string(),
        })?;

        let rendered = match vpath::extname(template_path) {
            ".html" => Rendered {
                content_type: "text/html; charset=utf-8",
                body: substitute(&source, data, Escape::Html).into_bytes(),
            },
            ".md" => {
                let markdown = substitute(&source, data, Escape::None);
                let mut out = String::with_capacity(markdown.len() * 3 / 2);
                let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
                html::push_html(&mut out, Parser::new_ext(&markdown, options));
                Rendered {
                    content_type: "text/html; charset=utf-8",
                    body: out.into_bytes(),
                }
            }
            ".txt" => Rendered {
                content_type: "text/plain; charset=utf-8",
                body: substitute(&source, data, Escape::None).into_bytes(),
            },
            ".json" => Rendered {
                content_type: "application/json",
                body: substitute(&source, data, Escape::Json).into_bytes(),
            },
            other => return Err(TemplateError::Unsupported(other.to_string())),
        };
        Ok(rendered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Html,
    Json,
}

fn lookup<'a>(data: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .filter(|part| !part.is_empty())
        .try_fold(data, |value, part| value.get(part))
}

fn escape_html(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

fn escape_json(text: &str, out: &mut String) {
    let quoted = Value::String(text.to_string()).to_string();
    out.push_str(&quoted[1..quoted.len() - 1]);
}

fn substitute(source: &str, data: &Value, escape: Escape) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim().trim_start_matches('.');
        let text = match lookup(data, key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        match escape {
            Escape::Html => escape_html(&text, &mut out),
            Escape::Json => escape_json(&text, &mut out),
            Escape::None => out.push_str(&text),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use serde_json::json;

    #[test]
    fn test_fallback_order() {
        let fs = MemoryFs::with_files([
            ("/routes/blog.js", ""),
            ("/routes/blog.md", "# Blog"),
            ("/routes/blog.txt", "blog"),
            ("/routes/about.js", ""),
        ]);
        assert_eq!(find_template(&fs, "/routes/blog.js").as_deref(), Some("/routes/blog.md"));
        assert_eq!(find_template(&fs, "/routes/about.js"), None);

        fs.write_file("/routes/blog.html", b"<p></p>").unwrap();
        assert_eq!(find_template(&fs, "/routes/blog.js").as_deref(), Some("/routes/blog.html"));
    }

    #[test]
    fn test_html_placeholders_are_escaped() {
        let fs = MemoryFs::with_files([(
            "/page.html",
            "<h1>{{ .Title }}</h1><p>{{ .author.name }} ({{count}}){{ .missing }}</p>",
        )]);
        let data = json!({ "Title": "A <b> & C", "author": { "name": "Ada" }, "count": 3 });
        let rendered = BasicRenderer.render(&fs, "/page.html", &data).unwrap();
        assert_eq!(rendered.content_type, "text/html; charset=utf-8");
        assert_eq!(
            String::from_utf8(rendered.body).unwrap(),
            "<h1>A &lt;b&gt; &amp; C</h1><p>Ada (3)</p>"
        );
    }

    #[test]
    fn test_markdown_is_converted() {
        let fs = MemoryFs::with_files([("/blog.md", "# {{ .Title }}\n\nHello *world*")]);
        let rendered = BasicRenderer
            .render(&fs, "/blog.md", &json!({ "Title": "News" }))
            .unwrap();
        let body = String::from_utf8(rendered.body).unwrap();
        assert!(body.contains("<h1>News</h1>"));
        assert!(body.contains("<em>world</em>"));
    }

    #[test]
    fn test_unterminated_placeholder_is_kept() {
        assert_eq!(substitute("a {{ b", &json!({}), Escape::None), "a {{ b");
    }

    #[test]
    fn test_json_template_stays_valid() {
        let fs = MemoryFs::with_files([(
            "/feed.json",
            r#"{"title": "{{ .title }}", "tags": {{ .tags }}, "count": {{ .count }}}"#,
        )]);
        let data = json!({ "title": "a\"b\\c\nd", "tags": ["x", "y"], "count": 2 });
        let rendered = BasicRenderer.render(&fs, "/feed.json", &data).unwrap();
        assert_eq!(rendered.content_type, "application/json");

        let parsed: Value = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(parsed, json!({ "title": "a\"b\\c\nd", "tags": ["x", "y"], "count": 2 }));
    }

    #[test]
    fn test_missing_template_is_an_error() {
        let fs = MemoryFs::new();
        assert!(matches!(
            BasicRenderer.render(&fs, "/nope.html", &Value::Null),
            Err(TemplateError::Read { .. })
        ));
    }
}
