//! Bounded context window for dispatch envelopes.
//!
//! The window holds the most recent preceding mailbox entries, each
//! individually clamped to a head+tail summary, and the whole window capped
//! by a total character budget. When the budget runs out mid-window, older
//! entries are dropped and the window is marked truncated.

use crate::protocol::types::MessageEntry;

#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    /// Formatted entry lines, oldest first.
    pub lines: Vec<String>,
    pub truncated: bool,
}

impl ContextWindow {
    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// Build a window from `preceding` (oldest first, as read from the log).
pub fn build_window(
    preceding: &[MessageEntry],
    max_entries: usize,
    entry_cap: usize,
    total_budget: usize,
) -> ContextWindow {
    let mut window = ContextWindow::default();
    if preceding.len() > max_entries {
        window.truncated = true;
    }

    let mut used = 0usize;
    let mut collected: Vec<String> = Vec::new();

    // Walk newest-first so the budget spends on recent entries.
    for entry in preceding.iter().rev().take(max_entries) {
        let content = truncate_middle(&entry.content, entry_cap);
        if content.len() != entry.content.len() {
            window.truncated = true;
        }
        let line = format!("[{}] {}: {}", entry.id, entry.from, content);

        let cost = line.chars().count() + 1;
        if used + cost > total_budget {
            window.truncated = true;
            break;
        }
        used += cost;
        collected.push(line);
    }

    collected.reverse();
    window.lines = collected;
    window
}

/// Clamp oversized text to a head+tail summary with an omission marker.
/// Operates on characters so multi-byte content never splits mid-scalar.
pub fn truncate_middle(text: &str, cap: usize) -> String {
    let total = text.chars().count();
    if total <= cap || cap < 16 {
        return text.to_string();
    }

    let head_len = cap * 2 / 3;
    let tail_len = cap / 3;
    let head: String = text.chars().take(head_len).collect();
    let tail: String = text
        .chars()
        .skip(total.saturating_sub(tail_len))
        .collect();
    format!("{} …[{} chars omitted]… {}", head, total - head_len - tail_len, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::MessageKind;

    fn entry(id: u64, content: &str) -> MessageEntry {
        MessageEntry {
            id: format!("{}-0", id),
            from: "boss".to_string(),
            to: "serina".to_string(),
            content: content.to_string(),
            timestamp: id as i64,
            kind: MessageKind::Text,
        }
    }

    #[test]
    fn test_small_window_untouched() {
        let entries = vec![entry(1, "hi"), entry(2, "status?")];
        let window = build_window(&entries, 10, 400, 2000);
        assert!(!window.truncated);
        assert_eq!(window.lines.len(), 2);
        assert!(window.lines[0].starts_with("[1-0]"));
        assert!(window.lines[1].starts_with("[2-0]"));
    }

    #[test]
    fn test_budget_drops_older_entries_and_marks_truncated() {
        let long = "x".repeat(300);
        let entries: Vec<_> = (1..=10).map(|i| entry(i, &long)).collect();
        let window = build_window(&entries, 10, 400, 700);

        assert!(window.truncated);
        let total: usize = window.lines.iter().map(|l| l.chars().count() + 1).sum();
        assert!(total <= 700);
        // The newest entries survive; the oldest are the ones dropped.
        assert!(window.lines.last().unwrap().starts_with("[10-0]"));
    }

    #[test]
    fn test_oversized_entry_is_middle_truncated() {
        let huge = "a".repeat(1000);
        let entries = vec![entry(1, &huge)];
        let window = build_window(&entries, 10, 100, 5000);

        assert!(window.truncated);
        assert!(window.lines[0].contains("chars omitted"));
        assert!(window.lines[0].chars().count() < 200);
    }

    #[test]
    fn test_truncate_middle_keeps_head_and_tail() {
        let text: String = ('a'..='z').cycle().take(200).collect();
        let clamped = truncate_middle(&text, 60);
        assert!(clamped.starts_with(&text[..10]));
        assert!(clamped.ends_with(&text[text.len() - 10..]));
        assert!(clamped.contains("chars omitted"));
    }

    #[test]
    fn test_truncate_middle_is_char_safe() {
        let text = "日本語のとても長いテキスト".repeat(20);
        let clamped = truncate_middle(&text, 40);
        assert!(clamped.contains("chars omitted"));
    }

    #[test]
    fn test_entry_count_cap_marks_truncated() {
        let entries: Vec<_> = (1..=6).map(|i| entry(i, "short")).collect();
        let window = build_window(&entries, 3, 400, 2000);
        assert!(window.truncated);
        assert_eq!(window.lines.len(), 3);
        assert!(window.lines[0].starts_with("[4-0]"));
    }
}
