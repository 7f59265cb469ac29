//! Post-processing of assistant replies before they reach Telegram.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// Telegram's message length limit, in characters.
pub const MESSAGE_LIMIT: usize = 4096;

/// Longest block the assistant may request; larger values are ignored.
pub const MAX_BLOCK_DAYS: u32 = 3650;

const SENTINEL: &str = "BLOCK_USER_TG_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub messages: Vec<String>,
    /// `Some(0)` blocks forever.
    pub block_days: Option<u32>,
}

fn sentinel_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"BLOCK_USER_TG_(\S*)").ok()).as_ref()
}

fn citation_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"【[^】]*】").ok()).as_ref()
}

/// Removes every sentinel and returns the first well-formed day count.
/// The reply is untrusted: anything but a small non-negative integer is
/// dropped without acting on it.
pub fn extract_block(text: &str) -> (String, Option<u32>) {
    let Some(re) = sentinel_re() else { return (text.replace(SENTINEL, ""), None) };
    let mut days = None;
    for caps in re.captures_iter(text) {
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse::<u32>() {
            Ok(n) if n <= MAX_BLOCK_DAYS && days.is_none() => days = Some(n),
            Ok(_) if days.is_some() => {}
            _ => warn!(raw = %raw, "ignoring malformed block sentinel"),
        }
    }
    (re.replace_all(text, "").into_owned(), days)
}

pub fn strip_citations(text: &str) -> String {
    match citation_re() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Byte offset of the last `boundary` that keeps the head within `limit`
/// characters, if any.
fn last_boundary(text: &str, limit_bytes: usize, boundaries: &[&str]) -> Option<usize> {
    let head = &text[..limit_bytes];
    boundaries
        .iter()
        .filter_map(|b| head.rfind(b).map(|i| i + b.len()))
        .filter(|&i| i > 0)
        .max()
}

/// Splits at paragraph breaks, then sentence ends, then hard at the limit.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text.trim();
    while rest.chars().count() > limit {
        let limit_bytes = rest.char_indices().nth(limit).map(|(i, _)| i).unwrap_or(rest.len());
        let cut = last_boundary(rest, limit_bytes, &["\n\n"])
            .or_else(|| last_boundary(rest, limit_bytes, &[". ", "! ", "? ", ".\n", "!\n", "?\n", "\n"]))
            .unwrap_or(limit_bytes);
        let (head, tail) = rest.split_at(cut);
        let head = head.trim();
        if !head.is_empty() {
            out.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

pub fn parse_reply(text: &str) -> ParsedReply {
    let (text, block_days) = extract_block(text);
    let text = strip_citations(&text);
    ParsedReply { messages: split_message(&text, MESSAGE_LIMIT), block_days }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_validated() {
        assert_eq!(extract_block("bye BLOCK_USER_TG_7"), ("bye ".to_string(), Some(7)));
        assert_eq!(extract_block("BLOCK_USER_TG_0 forever").1, Some(0));
        assert_eq!(extract_block("BLOCK_USER_TG_-3").1, None);
        assert_eq!(extract_block("BLOCK_USER_TG_99999999999").1, None);
        assert_eq!(extract_block("BLOCK_USER_TG_x").0, "");
        assert_eq!(extract_block("plain text"), ("plain text".to_string(), None));
    }

    #[test]
    fn test_citations_stripped() {
        assert_eq!(strip_citations("Дозировка 2 мг【4:0†source】."), "Дозировка 2 мг.");
    }

    #[test]
    fn test_split_prefers_paragraphs() {
        let para = "а".repeat(3000);
        let text = format!("{}\n\n{}", para, para);
        let parts = split_message(&text, MESSAGE_LIMIT);
        assert_eq!(parts, vec![para.clone(), para]);
    }

    #[test]
    fn test_split_falls_back_to_sentences_then_hard() {
        let sentence = format!("{}. ", "б".repeat(99));
        let text = sentence.repeat(50);
        let parts = split_message(&text, 1000);
        assert!(parts.iter().all(|p| p.chars().count() <= 1000 && p.ends_with('.')));
        assert_eq!(parts.concat().chars().filter(|c| *c == '.').count(), 50);

        let solid = "в".repeat(9000);
        let parts = split_message(&solid, MESSAGE_LIMIT);
        assert_eq!(parts.iter().map(|p| p.chars().count()).collect::<Vec<_>>(), vec![4096, 4096, 808]);
    }
}
