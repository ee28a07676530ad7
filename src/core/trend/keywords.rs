use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

const MAX_QUERY_WORDS: usize = 10;
const MIN_WORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "can", "this", "that", "these",
    "those",
];

fn stop_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

fn strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // HTML tags, entities, and URLs all become word separators.
    RE.get_or_init(|| {
        Regex::new(r"<[^>]*>|&[a-zA-Z#0-9]+;|https?://\S+").unwrap_or_else(|_| unreachable!())
    })
}

/// Build a provider search query from a candidate's title and description:
/// markup stripped, lowercased, stop-words and short words dropped, capped
/// at ten words.
pub fn extract_keywords(title: &str, description: &str) -> String {
    let text = format!("{title} {description}");
    let text = strip_re().replace_all(&text, " ").to_lowercase();

    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\''))
        .filter(|w| w.len() >= MIN_WORD_LEN && !stop_words().contains(w))
        .take(MAX_QUERY_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}
