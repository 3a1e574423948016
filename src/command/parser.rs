//! Extraction of `:::name args:::` tokens from model output.
//!
//! Matching is lazy: an opening sentinel is closed by the nearest following
//! `:::`. Only `memory`, `memory_delete`, `cron` and `luz` may span lines; for
//! any other name a token whose closing sentinel lies past a newline is
//! rejected and its opening sentinel is left in the text. An opening sentinel
//! with no closing one is plain text.

use super::{Invocation, Span};
use crate::error::ParseError;

pub const SENTINEL: &str = ":::";

const MULTILINE_COMMANDS: &[&str] = &["memory", "memory_delete", "cron", "luz"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Source text with every token removed and whitespace collapsed.
    pub display_text: String,
    /// Tokens in first-occurrence order.
    pub invocations: Vec<Invocation>,
}

impl ParsedResponse {
    pub fn spans(&self) -> Vec<Span> {
        self.invocations.iter().map(|i| i.span).collect()
    }
}

fn allows_multiline(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    MULTILINE_COMMANDS.contains(&lower.as_str())
}

/// Parse one model turn. Never fails; malformed tokens are logged and kept as text.
pub fn parse(source: &str) -> ParsedResponse {
    let invocations = scan(source);
    let spans: Vec<Span> = invocations.iter().map(|i| i.span).collect();
    ParsedResponse {
        display_text: collapse_whitespace(&strip_spans(source, &spans)),
        invocations,
    }
}

fn scan(source: &str) -> Vec<Invocation> {
    let bytes = source.as_bytes();
    let mut invocations = Vec::new();
    let mut pos = 0;

    while let Some(found) = source[pos..].find(SENTINEL) {
        let open = pos + found;
        let name_start = open + SENTINEL.len();
        let name_end = name_start
            + bytes[name_start..]
                .iter()
                .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                .count();

        if name_end == name_start {
            pos = open + 1;
            continue;
        }
        let name = &source[name_start..name_end];

        let mut args_start = name_end;
        if !source[args_start..].starts_with(SENTINEL) && bytes.get(args_start) == Some(&b':') {
            args_start += 1;
        }

        let Some(close_rel) = source[args_start..].find(SENTINEL) else {
            log_malformed(open, "unterminated command token");
            break;
        };
        let close = args_start + close_rel;
        let raw_args = &source[args_start..close];

        if raw_args.contains('\n') && !allows_multiline(name) {
            log_malformed(open, "command spans multiple lines");
            pos = name_start;
            continue;
        }

        let end = close + SENTINEL.len();
        invocations.push(Invocation {
            name: name.to_string(),
            raw_args: raw_args.trim().to_string(),
            span: Span { start: open, end },
        });
        pos = end;
    }

    invocations
}

fn log_malformed(offset: usize, reason: &'static str) {
    let err = ParseError::Malformed { offset, reason };
    tracing::warn!(error = %err, "MalformedCommand");
}

/// Remove `spans` (ascending, non-overlapping) from `source` without any
/// whitespace cleanup.
pub fn strip_spans(source: &str, spans: &[Span]) -> String {
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for span in spans {
        out.push_str(&source[cursor..span.start]);
        cursor = span.end;
    }
    out.push_str(&source[cursor..]);
    out
}

/// Inverse of [`strip_spans`]: reinsert each removed token at its original
/// offset. `removed` must be in ascending span order.
pub fn restore_spans(stripped: &str, removed: &[(Span, &str)]) -> String {
    let mut out = String::with_capacity(stripped.len() + removed.iter().map(|(s, _)| s.len()).sum::<usize>());
    let mut cursor = 0;
    for (span, text) in removed {
        let gap = span.start - out.len();
        out.push_str(&stripped[cursor..cursor + gap]);
        cursor += gap;
        out.push_str(text);
    }
    out.push_str(&stripped[cursor..]);
    out
}

/// Runs of spaces/tabs become one space, lines are right-trimmed, three or
/// more newlines become two, and the whole text is trimmed.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.split('\n') {
        let mut collapsed = String::with_capacity(line.len());
        let mut in_space = false;
        for c in line.chars() {
            if c == ' ' || c == '\t' {
                if !in_space {
                    collapsed.push(' ');
                }
                in_space = true;
            } else {
                collapsed.push(c);
                in_space = false;
            }
        }
        let collapsed = collapsed.trim_end();

        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(collapsed);
        out.push('\n');
    }

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(parsed: &ParsedResponse) -> Vec<&str> {
        parsed.invocations.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn memory_token_is_extracted_and_removed() {
        let parsed = parse("Hola! :::memory El usuario ama las manzanas:::");
        assert_eq!(parsed.display_text, "Hola!");
        assert_eq!(parsed.invocations.len(), 1);
        assert_eq!(parsed.invocations[0].name, "memory");
        assert_eq!(parsed.invocations[0].raw_args, "El usuario ama las manzanas");
    }

    #[test]
    fn matching_is_lazy_across_multiple_tokens() {
        let parsed = parse(":::search rust async::: middle :::foto gatos:::");
        assert_eq!(names(&parsed), vec!["search", "foto"]);
        assert_eq!(parsed.invocations[0].raw_args, "rust async");
        assert_eq!(parsed.invocations[1].raw_args, "gatos");
        assert_eq!(parsed.display_text, "middle");
    }

    #[test]
    fn delete_then_create_keeps_source_order() {
        let parsed = parse(
            ":::cron_delete \"Regar plantas\"::: :::cron recurrente 0 18 * * Regar plantas tarde:::",
        );
        assert_eq!(names(&parsed), vec!["cron_delete", "cron"]);
        assert_eq!(parsed.invocations[0].raw_args, "\"Regar plantas\"");
        assert_eq!(parsed.invocations[1].raw_args, "recurrente 0 18 * * Regar plantas tarde");
        assert_eq!(parsed.display_text, "");
    }

    #[test]
    fn unterminated_token_is_plain_text() {
        let parsed = parse("Sure :::memory forgot to close");
        assert!(parsed.invocations.is_empty());
        assert_eq!(parsed.display_text, "Sure :::memory forgot to close");
    }

    #[test]
    fn unterminated_after_valid_token_keeps_the_valid_one() {
        let parsed = parse(":::memory a::: then :::search oops");
        assert_eq!(names(&parsed), vec!["memory"]);
        assert_eq!(parsed.display_text, "then :::search oops");
    }

    #[test]
    fn unknown_names_are_still_extracted() {
        let parsed = parse("ok :::foobar xyz::: done");
        assert_eq!(names(&parsed), vec!["foobar"]);
        assert_eq!(parsed.invocations[0].raw_args, "xyz");
        assert_eq!(parsed.display_text, "ok done");
    }

    #[test]
    fn colon_after_name_is_tolerated() {
        let parsed = parse(":::memory: likes jazz:::");
        assert_eq!(parsed.invocations[0].name, "memory");
        assert_eq!(parsed.invocations[0].raw_args, "likes jazz");
    }

    #[test]
    fn token_without_arguments() {
        let parsed = parse("a :::camara::: b");
        assert_eq!(parsed.invocations[0].name, "camara");
        assert_eq!(parsed.invocations[0].raw_args, "");
        assert_eq!(parsed.display_text, "a b");
    }

    #[test]
    fn multiline_allowed_only_for_designated_commands() {
        let parsed = parse(":::memory line one\nline two:::");
        assert_eq!(parsed.invocations.len(), 1);
        assert_eq!(parsed.invocations[0].raw_args, "line one\nline two");

        let parsed = parse(":::search first\nsecond::: tail");
        assert!(parsed.invocations.is_empty());
    }

    #[test]
    fn rejected_multiline_token_does_not_swallow_a_later_one() {
        let parsed = parse(":::search a\nb:::search real:::");
        // the stray closing sentinel of the rejected token opens the next one
        assert_eq!(names(&parsed), vec!["search"]);
        assert_eq!(parsed.invocations[0].raw_args, "real");
    }

    #[test]
    fn empty_name_is_not_a_token() {
        let parsed = parse("ratio ::: 3");
        assert!(parsed.invocations.is_empty());
        assert_eq!(parsed.display_text, "ratio ::: 3");
    }

    #[test]
    fn whitespace_is_collapsed_around_removed_tokens() {
        let parsed = parse("Line one   :::memory x:::\n\n\n\nLine two\t\t:::luz salon encender:::  ");
        assert_eq!(parsed.display_text, "Line one\n\nLine two");
    }

    #[test]
    fn spans_point_at_the_tokens() {
        let source = "pre :::memory a::: mid :::search b::: post";
        let parsed = parse(source);
        let texts: Vec<&str> = parsed.invocations.iter().map(|i| i.source_text(source)).collect();
        assert_eq!(texts, vec![":::memory a:::", ":::search b:::"]);
    }

    #[test]
    fn strip_then_restore_reconstructs_source() {
        let sources = [
            "Hola! :::memory El usuario ama las manzanas:::",
            ":::cron_delete \"Regar plantas\"::: :::cron recurrente 0 18 * * Regar plantas tarde:::",
            "no tokens at all",
            "ñandú :::luz salón color rojo::: café :::foto ñu::: fin",
            ":::a::::::b:::",
            "x :::memory multi\nline::: y\n\n:::search z::: end",
            "",
        ];
        for source in sources {
            let parsed = parse(source);
            let spans = parsed.spans();
            let stripped = strip_spans(source, &spans);
            let removed: Vec<(Span, &str)> =
                spans.iter().map(|s| (*s, &source[s.start..s.end])).collect();
            assert_eq!(restore_spans(&stripped, &removed), source, "source: {source:?}");
        }
    }

    #[test]
    fn n_tokens_yield_n_invocations_in_order() {
        let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];
        for n in 0..words.len() {
            let mut source = String::from("intro");
            for word in &words[..n] {
                source.push_str(&format!(" text :::search {word}:::"));
            }
            let parsed = parse(&source);
            assert_eq!(parsed.invocations.len(), n);
            for (inv, word) in parsed.invocations.iter().zip(words) {
                assert_eq!(inv.raw_args, word);
            }
            assert!(!parsed.display_text.contains(":::"));
        }
    }

    #[test]
    fn collapse_rules() {
        assert_eq!(collapse_whitespace("  a  \t b  "), "a b");
        assert_eq!(collapse_whitespace("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_whitespace("a   \nb"), "a\nb");
    }
}
