//! Text preparation and paragraph/sentence chunking for the corpus.
//!
//! Chunks respect a `max_chars` limit. Splitting prefers paragraph
//! boundaries (blank lines), falls back to sentence boundaries for long
//! paragraphs, and hard-splits at whitespace for sentences that are still
//! too long. Every returned chunk is non-empty and at most `max_chars`
//! characters.

use sha2::{Digest, Sha256};

/// Collapse whitespace and cap the length of text sent to an embedding model.
pub fn prepare_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars).to_string()
}

/// Normalize line endings and squeeze runs of blank lines to a single one.
pub fn normalize_document(text: &str) -> String {
    let unix = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unix.len());
    let mut newlines = 0usize;
    for c in unix.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out.trim().to_string()
}

/// Returns the longest prefix of `s` holding at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// SHA-256 hex digest of a chunk, used to detect unchanged content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split text into chunks of at most `max_chars` characters.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let para_len = char_len(para);
        if para_len > max_chars {
            flush(&mut chunks, &mut current);
            split_paragraph(para, max_chars, &mut chunks);
            continue;
        }

        let would_be = if current.is_empty() {
            para_len
        } else {
            char_len(&current) + 2 + para_len
        };
        if would_be > max_chars {
            flush(&mut chunks, &mut current);
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    flush(&mut chunks, &mut current);
    chunks
}

fn split_paragraph(para: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut current = String::new();
    for sentence in sentences(para) {
        let len = char_len(sentence);
        if len > max_chars {
            flush(chunks, &mut current);
            hard_split(sentence, max_chars, chunks);
            continue;
        }
        let would_be = if current.is_empty() {
            len
        } else {
            char_len(&current) + 1 + len
        };
        if would_be > max_chars {
            flush(chunks, &mut current);
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    flush(chunks, &mut current);
}

/// Sentences keep their terminal punctuation (`.`, `!`, `?`).
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        while let Some(&(_, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?') {
                chars.next();
            } else {
                break;
            }
        }
        let (end, at_boundary) = match chars.peek() {
            Some(&(j, next)) => (j, next.is_whitespace()),
            None => (text.len(), true),
        };
        if at_boundary {
            let s = text[start..end].trim();
            if !s.is_empty() {
                out.push(s);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn hard_split(text: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut remaining = text.trim();
    while !remaining.is_empty() {
        let prefix = truncate_chars(remaining, max_chars);
        let cut = if prefix.len() < remaining.len() {
            match prefix.rfind(char::is_whitespace) {
                Some(pos) if pos > 0 => pos,
                _ => prefix.len(),
            }
        } else {
            prefix.len()
        };
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        remaining = remaining[cut..].trim_start();
    }
}

fn flush(chunks: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_into_chunks("Um parágrafo curto.", 800);
        assert_eq!(chunks, vec!["Um parágrafo curto.".to_string()]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_into_chunks("", 800).is_empty());
        assert!(split_into_chunks("\n\n  \n\n", 800).is_empty());
    }

    #[test]
    fn test_paragraphs_grouped_under_limit() {
        let text = "Primeiro.\n\nSegundo.\n\nTerceiro.";
        let chunks = split_into_chunks(text, 800);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("Segundo."));
    }

    #[test]
    fn test_paragraphs_split_when_over_limit() {
        let a = "a".repeat(50);
        let b = "b".repeat(50);
        let chunks = split_into_chunks(&format!("{}\n\n{}", a, b), 60);
        assert_eq!(chunks, vec![a, b]);
    }

    #[test]
    fn test_long_paragraph_splits_on_sentences() {
        let text = "O fogo começou cedo. A equipa chegou depressa! Houve danos? Sim, muitos.";
        let chunks = split_into_chunks(text, 45);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 45, "chunk too long: {:?}", c);
        }
        assert!(chunks[0].starts_with("O fogo começou cedo."));
    }

    #[test]
    fn test_decimal_points_do_not_split_sentences() {
        assert_eq!(sentences("O valor foi 0.27 hoje. Fim."), vec!["O valor foi 0.27 hoje.", "Fim."]);
    }

    #[test]
    fn test_hard_split_respects_limit_and_chars() {
        let word = "ã".repeat(30);
        let text = format!("{} {} {}", word, word, word);
        let chunks = split_into_chunks(&text, 40);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
    }

    #[test]
    fn test_prepare_text_collapses_and_truncates() {
        assert_eq!(prepare_text("  a \n\n b\tc  ", 512), "a b c");
        assert_eq!(prepare_text("abcdef", 3), "abc");
        assert_eq!(prepare_text("çãé", 2), "çã");
    }

    #[test]
    fn test_normalize_document() {
        assert_eq!(normalize_document("a\r\n\r\n\r\n\r\nb\rc"), "a\n\nb\nc");
    }

    #[test]
    fn test_content_hash_deterministic() {
        assert_eq!(content_hash("x"), content_hash("x"));
        assert_ne!(content_hash("x"), content_hash("y"));
        assert_eq!(content_hash("x").len(), 64);
    }
}
