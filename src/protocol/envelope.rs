//! Dispatch envelope linking a mailbox entry to a worker invocation.
//!
//! The envelope travels as plain text: `KEY=VALUE` lines followed by an
//! optional free-text context block. Only lines matching `^[A-Z0-9_]+=` are
//! treated as fields; everything else is ignored by the parser, which lets
//! the context block ride along in the same blob.

use std::sync::LazyLock;

use regex::Regex;

use super::types::stream_name;
use crate::relay::context::ContextWindow;

/// Transport name this relay is locked to. An envelope carrying a different
/// `EGRESS_LOCK` is refused so a misrouted reply never lands in the wrong
/// transport.
pub const EGRESS_LOCK: &str = "redis";

/// Parsed envelope fields. All optional at parse time; the reply protocol
/// decides which are required.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub egress_lock: Option<String>,
    pub reply_stream: Option<String>,
    pub reply_to: Option<String>,
    pub req_id: Option<String>,
    pub orig_from: Option<String>,
    pub orig_content: Option<String>,
}

impl Envelope {
    /// Parse `KEY=VALUE` lines from a wake text blob.
    pub fn parse(text: &str) -> Self {
        static LINE_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^([A-Z0-9_]+)=(.*)$").unwrap());
        let mut env = Envelope::default();

        for line in text.lines() {
            let Some(caps) = LINE_RE.captures(line.trim_end_matches('\r')) else {
                continue;
            };
            let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
            match key {
                "EGRESS_LOCK" => env.egress_lock = Some(value.to_string()),
                "REPLY_STREAM" => env.reply_stream = Some(value.to_string()),
                "REPLY_TO" => env.reply_to = Some(value.to_string()),
                "REQ_ID" => env.req_id = Some(value.to_string()),
                "ORIG_FROM" => env.orig_from = Some(value.to_string()),
                "ORIG_CONTENT" => env.orig_content = Some(value.to_string()),
                _ => {}
            }
        }

        env
    }

    /// True when an `EGRESS_LOCK` is present and does not match ours.
    pub fn lock_mismatch(&self) -> bool {
        matches!(self.egress_lock.as_deref(), Some(lock) if lock != EGRESS_LOCK)
    }
}

/// Render a dispatch envelope for a triggering mailbox entry.
///
/// `req_id` is the entry's store-assigned id and doubles as the idempotency
/// key for the eventual final reply. Newlines in the original content are
/// flattened so the field stays a single parseable line.
pub fn render_dispatch(
    req_id: &str,
    from: &str,
    content: &str,
    context: &ContextWindow,
) -> String {
    let flat_content = content.replace(['\n', '\r'], " ");

    let mut out = String::new();
    out.push_str(&format!("EGRESS_LOCK={}\n", EGRESS_LOCK));
    out.push_str(&format!("REPLY_STREAM={}\n", stream_name(from)));
    out.push_str(&format!("REPLY_TO={}\n", from));
    out.push_str(&format!("REQ_ID={}\n", req_id));
    out.push_str(&format!("ORIG_FROM={}\n", from));
    out.push_str(&format!("ORIG_CONTENT={}\n", flat_content));

    if !context.lines.is_empty() {
        out.push('\n');
        out.push_str(&format!(
            "RECENT_CONTEXT (truncated={}):\n",
            context.truncated
        ));
        out.push_str(&context.render());
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_envelope() {
        let text = "EGRESS_LOCK=redis\nREPLY_STREAM=boss:messages\nREPLY_TO=boss\nREQ_ID=1700000000000-0\nORIG_FROM=boss\nORIG_CONTENT=hello there\n";
        let env = Envelope::parse(text);
        assert_eq!(env.egress_lock.as_deref(), Some("redis"));
        assert_eq!(env.reply_stream.as_deref(), Some("boss:messages"));
        assert_eq!(env.reply_to.as_deref(), Some("boss"));
        assert_eq!(env.req_id.as_deref(), Some("1700000000000-0"));
        assert!(!env.lock_mismatch());
    }

    #[test]
    fn test_parse_skips_non_field_lines() {
        let text = "some preamble\nREQ_ID=5-0\n\nRECENT_CONTEXT (truncated=false):\n[1-0] boss: hi\n";
        let env = Envelope::parse(text);
        assert_eq!(env.req_id.as_deref(), Some("5-0"));
        assert!(env.reply_to.is_none());
    }

    #[test]
    fn test_lock_mismatch() {
        let env = Envelope::parse("EGRESS_LOCK=matrix\nREQ_ID=1-0\n");
        assert!(env.lock_mismatch());

        // Absent lock is tolerated for older dispatchers.
        let env = Envelope::parse("REQ_ID=1-0\n");
        assert!(!env.lock_mismatch());
    }

    #[test]
    fn test_render_round_trip() {
        let ctx = ContextWindow::default();
        let text = render_dispatch("42-0", "boss", "line one\nline two", &ctx);
        let env = Envelope::parse(&text);
        assert_eq!(env.req_id.as_deref(), Some("42-0"));
        assert_eq!(env.reply_to.as_deref(), Some("boss"));
        assert_eq!(env.reply_stream.as_deref(), Some("boss:messages"));
        assert_eq!(env.orig_content.as_deref(), Some("line one line two"));
    }
}
