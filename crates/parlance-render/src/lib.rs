//! Parlance Render - Message Display Transformation
//!
//! Pure functions from a [`ChatMessage`] to its display form: sender-specific
//! layout (avatar, alignment), code markup in assistant content, and
//! timestamp formatting. Nothing here touches the network or mutates the
//! message.
//!
//! Assistant text may carry inline code spans and fenced code blocks; both
//! are rendered literally. The HTML renderer escapes every piece of message
//! content, so embedded markup displays as text instead of becoming active
//! content.
//!
//! # Example
//!
//! ```
//! use parlance_render::{render_message, Segment};
//! use parlance_types::ChatMessage;
//!
//! let rendered = render_message(&ChatMessage::assistant("Run `cargo build` first"));
//! assert_eq!(rendered.segments.len(), 3);
//! assert!(matches!(&rendered.segments[1], Segment::InlineCode(c) if c == "cargo build"));
//! ```

use chrono::{DateTime, Duration, Utc};
use parlance_types::{ChatMessage, Sender};

/// Which side of the conversation a message sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Assistant messages, rendered on the leading edge
    Leading,
    /// User messages, rendered on the trailing edge
    Trailing,
}

/// One run of message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    InlineCode(String),
    CodeBlock {
        language: Option<String>,
        code: String,
    },
}

/// Display form of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub alignment: Alignment,
    pub avatar: &'static str,
    pub segments: Vec<Segment>,
    /// Fixed-width 24-hour clock time, e.g. `09:05`
    pub clock_time: String,
}

/// Transform a message into its display form
///
/// Only assistant content goes through the markup parser; user text is
/// always a single literal segment.
pub fn render_message(message: &ChatMessage) -> RenderedMessage {
    let (alignment, avatar) = match message.sender {
        Sender::User => (Alignment::Trailing, "You"),
        Sender::Assistant => (Alignment::Leading, "AI"),
    };
    let segments = match message.sender {
        Sender::Assistant => parse_segments(&message.content),
        Sender::User => vec![Segment::Text(message.content.clone())],
    };
    RenderedMessage {
        alignment,
        avatar,
        segments,
        clock_time: clock_time(message.timestamp),
    }
}

// ============================================================================
// Markup
// ============================================================================

/// Split content into text, inline code and fenced code segments
///
/// A fence opener is three backticks, optionally followed by a language tag
/// on the same line. An unterminated fence or backtick is not markup; the
/// remaining text stays literal.
pub fn parse_segments(content: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find("```") {
        let (before, fenced) = rest.split_at(start);
        if !before.is_empty() {
            parse_inline(before, &mut segments);
        }
        let after_open = &fenced[3..];
        match after_open.find("```") {
            Some(end) => {
                let body = &after_open[..end];
                let (language, code) = match body.split_once('\n') {
                    Some((tag, code)) => {
                        let tag = tag.trim();
                        if tag.is_empty() {
                            (None, code)
                        } else {
                            (Some(tag.to_string()), code)
                        }
                    }
                    None => (None, body),
                };
                segments.push(Segment::CodeBlock {
                    language,
                    code: code.trim_end_matches('\n').to_string(),
                });
                rest = &after_open[end + 3..];
            }
            None => {
                // No closing fence anywhere; show the marker itself
                segments.push(Segment::Text(fenced.to_string()));
                return segments;
            }
        }
    }
    if !rest.is_empty() {
        parse_inline(rest, &mut segments);
    }
    segments
}

fn parse_inline(text: &str, segments: &mut Vec<Segment>) {
    let mut rest = text;
    while let Some(start) = rest.find('`') {
        match rest[start + 1..].find('`') {
            Some(len) => {
                if start > 0 {
                    segments.push(Segment::Text(rest[..start].to_string()));
                }
                segments.push(Segment::InlineCode(rest[start + 1..start + 1 + len].to_string()));
                rest = &rest[start + 1 + len + 1..];
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// In-session display time, fixed-width 24-hour clock
pub fn clock_time(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%H:%M").to_string()
}

/// Coarse age for conversation lists
///
/// Future timestamps read as "Just now"; small clock skew between client
/// and server must not surface as nonsense.
pub fn relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(timestamp);
    if elapsed < Duration::minutes(1) {
        "Just now".to_string()
    } else if elapsed < Duration::hours(1) {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed < Duration::days(1) {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed < Duration::days(7) {
        format!("{}d ago", elapsed.num_days())
    } else {
        timestamp.format("%Y-%m-%d").to_string()
    }
}

// ============================================================================
// Previews & HTML
// ============================================================================

/// Shorten text for a one-line preview
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}

/// Render a message as an embeddable HTML fragment
///
/// All message content is escaped; code arrives as text nodes, never as
/// markup the embedding page would execute.
pub fn render_html(rendered: &RenderedMessage) -> String {
    let side = match rendered.alignment {
        Alignment::Leading => "assistant",
        Alignment::Trailing => "user",
    };
    let mut html = String::new();
    html.push_str(&format!("<div class=\"message {side}\">\n"));
    html.push_str(&format!(
        "  <span class=\"avatar\">{}</span>\n",
        rendered.avatar
    ));
    html.push_str("  <div class=\"bubble\">");
    for segment in &rendered.segments {
        match segment {
            Segment::Text(text) => html.push_str(&escape_html(text)),
            Segment::InlineCode(code) => {
                html.push_str(&format!("<code>{}</code>", escape_html(code)));
            }
            Segment::CodeBlock { language, code } => match language {
                Some(language) => html.push_str(&format!(
                    "<pre><code class=\"language-{}\">{}</code></pre>",
                    escape_html(language),
                    escape_html(code)
                )),
                None => {
                    html.push_str(&format!("<pre><code>{}</code></pre>", escape_html(code)));
                }
            },
        }
    }
    html.push_str("</div>\n");
    html.push_str(&format!("  <time>{}</time>\n", rendered.clock_time));
    html.push_str("</div>");
    html
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

// ============================================================================
// Tests
// ============================================================================
