//! Item preprocessing: title/body cross-fill and short summaries.
//!
//! [`preprocess`] guarantees that an item carries both a title and a body
//! whenever it carries either. It is total and idempotent, so it never
//! fails and running it twice changes nothing.
//!
//! | Title | Body | Result |
//! |-------|------|--------|
//! | empty | text | title := body |
//! | text | empty | body := title |
//! | text | text | unchanged |
//! | empty | empty | unchanged, unclassifiable |
//!
//! "Empty" means empty after trimming. Placeholder titles that notebook
//! apps insert for untitled pages (see [`PLACEHOLDER_TITLES`]) count as
//! empty.
//!
//! [`summarize`] derives the display title of the classified record from
//! the body, targeting [`SUMMARY_TARGET_CHARS`] characters and cutting only
//! on sentence or word boundaries.

use crate::models::Item;

/// Titles treated as empty.
pub const PLACEHOLDER_TITLES: &[&str] = &["(タイトルなし)", "（タイトルなし）", "タイトルなし", "Untitled"];

/// Target summary length, in Unicode scalar values.
pub const SUMMARY_TARGET_CHARS: usize = 20;

const ELLIPSIS: char = '…';

/// Sentence terminators, kept with the sentence they end.
const TERMINATORS: &[char] = &['。', '．', '.', '！', '!', '？', '?'];

/// True for blank and placeholder titles.
pub fn title_is_empty(title: &str) -> bool {
    let t = title.trim();
    t.is_empty() || PLACEHOLDER_TITLES.contains(&t)
}

/// True when neither title nor body has content.
pub fn is_unclassifiable(item: &Item) -> bool {
    title_is_empty(&item.title) && item.body.trim().is_empty()
}

/// True when [`preprocess`] would change the item.
pub fn needs_cross_fill(item: &Item) -> bool {
    title_is_empty(&item.title) != item.body.trim().is_empty()
}

/// Cross-fill title and body.
///
/// The copied field is taken verbatim (no truncation). An item whose title
/// is only a placeholder and whose body is empty is returned unchanged.
pub fn preprocess(item: &Item) -> Item {
    let mut out = item.clone();
    let title_empty = title_is_empty(&item.title);
    let body_empty = item.body.trim().is_empty();
    match (title_empty, body_empty) {
        (true, false) => out.title = item.body.clone(),
        (false, true) => out.body = item.title.clone(),
        _ => {}
    }
    out
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split on terminators (kept) and newlines (dropped), collapsing each piece.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' || c == '\r' {
            push_sentence(&mut out, &mut current);
        } else {
            current.push(c);
            if TERMINATORS.contains(&c) {
                push_sentence(&mut out, &mut current);
            }
        }
    }
    push_sentence(&mut out, &mut current);
    out
}

fn push_sentence(out: &mut Vec<String>, current: &mut String) {
    let s = collapse(current);
    if !s.is_empty() {
        out.push(s);
    }
    current.clear();
}

/// Joiner between two sentences: none after a full-width terminator.
fn joiner(previous: &str) -> &'static str {
    match previous.chars().last() {
        Some('。' | '．' | '！' | '？') => "",
        _ => " ",
    }
}

/// Derive a short summary from the body, or from the title when the body
/// is empty.
///
/// 1. Collapse whitespace; if the text fits the target, return it.
/// 2. Otherwise keep whole leading sentences while they fit.
/// 3. Otherwise cut at the last space inside the target if it lies past
///    half of it, and append `…`.
/// 4. Otherwise hard-cut one character short of the target and append `…`.
///
/// The result never exceeds [`SUMMARY_TARGET_CHARS`] characters.
pub fn summarize(title: &str, body: &str) -> String {
    let source = if body.trim().is_empty() { title } else { body };
    let collapsed = collapse(source);
    if char_len(&collapsed) <= SUMMARY_TARGET_CHARS {
        return collapsed;
    }

    let mut kept = String::new();
    for sentence in sentences(source) {
        let sep = if kept.is_empty() { "" } else { joiner(&kept) };
        if char_len(&kept) + char_len(sep) + char_len(&sentence) > SUMMARY_TARGET_CHARS {
            break;
        }
        kept.push_str(sep);
        kept.push_str(&sentence);
    }
    if !kept.is_empty() {
        return kept;
    }

    let head: Vec<char> = collapsed.chars().take(SUMMARY_TARGET_CHARS).collect();
    if let Some(space) = head.iter().rposition(|c| *c == ' ') {
        if space > SUMMARY_TARGET_CHARS / 2 {
            let mut cut: String = head[..space].iter().collect();
            cut.push(ELLIPSIS);
            return cut;
        }
    }
    let mut cut: String = head[..SUMMARY_TARGET_CHARS - 1].iter().collect();
    cut.push(ELLIPSIS);
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, body: &str) -> Item {
        Item::inbox("p1", title, body)
    }

    #[test]
    fn empty_title_takes_body() {
        let out = preprocess(&item("", "Call the dentist about the appointment next week"));
        assert_eq!(out.title, "Call the dentist about the appointment next week");
        assert_eq!(out.body, out.title);
    }

    #[test]
    fn empty_body_takes_title() {
        let out = preprocess(&item("Buy milk", "  "));
        assert_eq!(out.body, "Buy milk");
    }

    #[test]
    fn placeholder_title_counts_as_empty() {
        let out = preprocess(&item("(タイトルなし)", "議事録を共有する"));
        assert_eq!(out.title, "議事録を共有する");
        assert!(is_unclassifiable(&item("Untitled", " ")));
    }

    #[test]
    fn both_present_or_both_empty_unchanged() {
        let full = item("a", "b");
        assert_eq!(preprocess(&full), full);
        let empty = item(" ", "");
        assert_eq!(preprocess(&empty), empty);
        assert!(is_unclassifiable(&empty));
        assert!(!needs_cross_fill(&empty));
    }

    #[test]
    fn preprocess_is_idempotent() {
        for (t, b) in [("", "body"), ("title", ""), ("t", "b"), ("", ""), ("Untitled", "x")] {
            let once = preprocess(&item(t, b));
            assert_eq!(preprocess(&once), once);
        }
    }

    #[test]
    fn short_text_returned_collapsed() {
        assert_eq!(summarize("", "  buy   milk \n"), "buy milk");
        assert_eq!(summarize("title only", ""), "title only");
        assert_eq!(summarize("", ""), "");
    }

    #[test]
    fn keeps_whole_leading_sentences() {
        let s = summarize("", "会議の準備をする。資料を印刷して、関係者全員に事前に配布しておくこと。");
        assert_eq!(s, "会議の準備をする。");
    }

    #[test]
    fn cuts_at_word_boundary() {
        let s = summarize("", "Prepare slides for the quarterly planning review meeting");
        assert_eq!(s, "Prepare slides for…");
        assert!(s.chars().count() <= SUMMARY_TARGET_CHARS);
    }

    #[test]
    fn long_body_of_120_chars_is_cut_on_char_boundary() {
        let body: String = "あいうえおかきくけこ".repeat(12);
        assert_eq!(body.chars().count(), 120);
        let s = summarize("", &body);
        assert_eq!(s.chars().count(), SUMMARY_TARGET_CHARS);
        assert!(s.ends_with('…'));
        assert!(body.starts_with(s.trim_end_matches('…')));
    }

    #[test]
    fn mixed_ascii_120_chars() {
        let body = "x".repeat(60) + " " + &"y".repeat(59);
        let s = summarize("ignored", &body);
        assert!(s.chars().count() <= SUMMARY_TARGET_CHARS);
        assert_eq!(s, format!("{}…", "x".repeat(19)));
    }
}
