//! Server-side built-in tools (web search, web fetch, text editor).
//!
//! These execute on the endpoint, not in this process: enabling one means
//! adding a typed catalog entry to the request and, for web fetch, a beta
//! feature header. Which tools are enabled is operator configuration.

use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    WebSearch,
    WebFetch,
    TextEditor,
}

impl BuiltinTool {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "web_search" => Some(Self::WebSearch),
            "web_fetch" => Some(Self::WebFetch),
            "text_editor" => Some(Self::TextEditor),
            _ => None,
        }
    }

    /// Catalog entry in the endpoint's schema. The text editor tool type is
    /// versioned per model family.
    pub fn catalog_entry(&self, model: &str) -> Value {
        match self {
            Self::WebSearch => json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": 5,
            }),
            Self::WebFetch => json!({
                "type": "web_fetch_20250910",
                "name": "web_fetch",
                "max_uses": 5,
            }),
            Self::TextEditor => {
                let tool_type = if model.contains("claude-3-5") {
                    "text_editor_20241022"
                } else if model.contains("claude-3-7") {
                    "text_editor_20250124"
                } else {
                    "text_editor_20250728"
                };
                json!({
                    "type": tool_type,
                    "name": "str_replace_based_edit_tool",
                })
            }
        }
    }

    /// Beta header required to use the tool, if any.
    pub fn beta_header(&self) -> Option<&'static str> {
        match self {
            Self::WebFetch => Some("web-fetch-2025-09-10"),
            Self::WebSearch | Self::TextEditor => None,
        }
    }
}

/// Resolve configured tool names into catalog entries plus the headers the
/// request must carry. Unknown names are skipped.
pub fn configure(names: &[String], model: &str) -> (Vec<Value>, Vec<(String, String)>) {
    let tools: Vec<BuiltinTool> = names.iter().filter_map(|n| BuiltinTool::parse(n)).collect();

    let entries = tools.iter().map(|t| t.catalog_entry(model)).collect();

    let betas: Vec<&str> = tools.iter().filter_map(|t| t.beta_header()).collect();
    let headers = if betas.is_empty() {
        vec![]
    } else {
        vec![("anthropic-beta".to_string(), betas.join(","))]
    };

    (entries, headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_names() {
        assert_eq!(BuiltinTool::parse("web_search"), Some(BuiltinTool::WebSearch));
        assert_eq!(BuiltinTool::parse("web_fetch"), Some(BuiltinTool::WebFetch));
        assert_eq!(BuiltinTool::parse("text_editor"), Some(BuiltinTool::TextEditor));
        assert_eq!(BuiltinTool::parse("telepathy"), None);
    }

    #[test]
    fn web_fetch_requires_beta_header() {
        let (entries, headers) =
            configure(&["web_fetch".to_string()], "claude-opus-4-1-20250805");
        assert_eq!(entries[0]["type"], "web_fetch_20250910");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "anthropic-beta");
        assert_eq!(headers[0].1, "web-fetch-2025-09-10");
    }

    #[test]
    fn web_search_needs_no_header() {
        let (entries, headers) =
            configure(&["web_search".to_string()], "claude-opus-4-1-20250805");
        assert_eq!(entries[0]["name"], "web_search");
        assert!(headers.is_empty());
    }

    #[test]
    fn text_editor_type_tracks_model_family() {
        let editor = BuiltinTool::TextEditor;
        assert_eq!(
            editor.catalog_entry("claude-3-5-sonnet-20241022")["type"],
            "text_editor_20241022"
        );
        assert_eq!(
            editor.catalog_entry("claude-3-7-sonnet-20250219")["type"],
            "text_editor_20250124"
        );
        assert_eq!(
            editor.catalog_entry("claude-opus-4-1-20250805")["type"],
            "text_editor_20250728"
        );
    }

    #[test]
    fn unknown_names_are_skipped() {
        let (entries, headers) = configure(
            &["telepathy".to_string(), "web_search".to_string()],
            "claude-opus-4-1-20250805",
        );
        assert_eq!(entries.len(), 1);
        assert!(headers.is_empty());
    }
}
