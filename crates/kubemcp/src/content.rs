//! Text extraction from tool results.

use rmcp::model::Content;

/// All non-empty text blocks, in order. Images and resources are skipped.
#[must_use]
pub fn collect_text(content: &[Content]) -> Vec<&str> {
    content
        .iter()
        .filter_map(|block| block.as_text())
        .map(|text| text.text.as_str())
        .filter(|text| !text.is_empty())
        .collect()
}

/// Text blocks joined with newlines, for logs and error messages.
#[must_use]
pub fn text_content(content: &[Content]) -> String {
    collect_text(content).join("\n")
}
