//! Reply metadata encoded into the message body itself.
//!
//! The store has no reply foreign key; a reply instead carries a bounded
//! excerpt of the quoted message in its own `content`, as a quote-prefix
//! line followed by one blank line and the reply body.

const QUOTE_PREFIX: &str = "> ";
const QUOTE_SEPARATOR: &str = "\n\n";
const PREVIEW_BUDGET: usize = 50;
const ELLIPSIS: char = '…';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedContent {
    pub is_quote: bool,
    pub quoted_preview: Option<String>,
    pub display_body: String,
}

/// Encodes `body` as a reply quoting `quoted`. The excerpt is truncated to
/// a fixed character budget (not bytes) and flattened to a single line so
/// the separator stays unambiguous.
pub fn encode(quoted: &str, body: &str) -> String {
    let mut preview: String = quoted
        .chars()
        .take(PREVIEW_BUDGET)
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if quoted.chars().count() > PREVIEW_BUDGET {
        preview.push(ELLIPSIS);
    }
    format!("{QUOTE_PREFIX}{preview}{QUOTE_SEPARATOR}{body}")
}

/// Total inverse of `encode`: recognizes a quote iff the content starts
/// with the quote prefix and contains the blank-line separator. Anything
/// else passes through unchanged.
pub fn decode(content: &str) -> DecodedContent {
    if let Some(rest) = content.strip_prefix(QUOTE_PREFIX) {
        if let Some((preview, body)) = rest.split_once(QUOTE_SEPARATOR) {
            return DecodedContent {
                is_quote: true,
                quoted_preview: Some(preview.to_string()),
                display_body: body.to_string(),
            };
        }
    }
    DecodedContent {
        is_quote: false,
        quoted_preview: None,
        display_body: content.to_string(),
    }
}
