//! SHDR line tokenizer
//!
//! Splits a pipe-delimited frame into trimmed tokens. A token that opens
//! with `"` may span delimiters by escaping them as `\|`; the span must
//! close with a `"` or the line falls back to literal splitting with the
//! quote and backslash characters left in place. A `--multiline--<tag>`
//! token switches the tokenizer into capture mode until a line carrying
//! the bare tag arrives.

/// Tokens of one logical SHDR frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokens {
    pub values: Vec<String>,
}

impl Tokens {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
}

const MULTILINE_MARKER: &str = "--multiline--";

#[derive(Debug)]
struct MultilineCapture {
    terminator: String,
    prefix: Vec<String>,
    body: Vec<String>,
}

/// Stateful tokenizer; one instance per adapter connection
#[derive(Debug, Default)]
pub struct ShdrTokenizer {
    capture: Option<MultilineCapture>,
}

impl ShdrTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. Returns the completed frame, or `None` while a
    /// multiline body is being captured.
    pub fn feed_line(&mut self, line: &str) -> Option<Tokens> {
        if let Some(capture) = &mut self.capture {
            if line.trim() == capture.terminator {
                let mut capture = self.capture.take().unwrap();
                let mut values = std::mem::take(&mut capture.prefix);
                values.push(capture.body.join("\n"));
                return Some(Tokens::new(values));
            }
            capture.body.push(line.to_string());
            return None;
        }

        let values = tokenize(line);
        if let Some(pos) = values
            .iter()
            .position(|t| t.starts_with(MULTILINE_MARKER))
        {
            let terminator = values[pos][MULTILINE_MARKER.len()..].to_string();
            self.capture = Some(MultilineCapture {
                terminator,
                prefix: values[..pos].to_vec(),
                body: Vec::new(),
            });
            return None;
        }

        Some(Tokens::new(values))
    }

    /// True while a multiline body is being accumulated
    pub fn capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Drop any partial capture (used on reconnect)
    pub fn reset(&mut self) {
        self.capture = None;
    }
}

/// Split a single line into trimmed tokens honoring `"…\|…"` spans.
pub fn tokenize(line: &str) -> Vec<String> {
    let naive: Vec<String> = line.split('|').map(|t| t.trim().to_string()).collect();

    let mut tokens = Vec::with_capacity(naive.len());
    let mut i = 0;
    while i < naive.len() {
        let tok = &naive[i];
        if tok.starts_with('"') && tok.ends_with('\\') {
            // An escaped delimiter inside a quoted span: re-join pieces until
            // one closes the quote. If none does, the quoting was malformed
            // and the naive split stands.
            if let Some((merged, consumed)) = merge_quoted(&naive[i..]) {
                tokens.push(merged);
                i += consumed;
                continue;
            }
        } else if tok.len() >= 2 && tok.starts_with('"') && tok.ends_with('"') {
            tokens.push(unquote(tok));
            i += 1;
            continue;
        }
        tokens.push(tok.clone());
        i += 1;
    }
    tokens
}

fn merge_quoted(pieces: &[String]) -> Option<(String, usize)> {
    let mut acc = pieces[0].clone();
    for (extra, piece) in pieces[1..].iter().enumerate() {
        acc.push('|');
        acc.push_str(piece);
        if piece.ends_with('"') {
            return Some((unquote(&acc), extra + 2));
        }
    }
    None
}

fn unquote(token: &str) -> String {
    token[1..token.len() - 1].replace("\\|", "|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(line: &str, expected: &[&str]) {
        let tokens = tokenize(line);
        assert_eq!(
            expected.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            tokens,
            "given text: {line}"
        );
    }

    #[test]
    fn simple_tokens() {
        check("   |hello   |   kitty| cat | ", &["", "hello", "kitty", "cat", ""]);
        check("hello|kitty", &["hello", "kitty"]);
        check("hello|kitty|", &["hello", "kitty", ""]);
        check("|hello|kitty|", &["", "hello", "kitty", ""]);
        check(
            r#"hello|xxx={b="12345", c="xxxxx"}}|bbb"#,
            &["hello", r#"xxx={b="12345", c="xxxxx"}}"#, "bbb"],
        );
        check("x|y||z", &["x", "y", "", "z"]);
    }

    #[test]
    fn correctly_escaped() {
        check(r#""a\|b""#, &["a|b"]);
        check(r#""a\|b"|z"#, &["a|b", "z"]);
        check(r#"y|"a\|b""#, &["y", "a|b"]);
        check(r#"y|"a\|b"|z"#, &["y", "a|b", "z"]);

        check(r#""a\|b\|c""#, &["a|b|c"]);
        check(r#""a\|b\|c"|z"#, &["a|b|c", "z"]);
        check(r#"y|"a\|b\|c""#, &["y", "a|b|c"]);
        check(r#"y|"a\|b\|c"|z"#, &["y", "a|b|c", "z"]);

        check(r#""\|b\|c""#, &["|b|c"]);
        check(r#""\|b\|c"|z"#, &["|b|c", "z"]);
        check(r#"y|"\|b\|c""#, &["y", "|b|c"]);
        check(r#"y|"\|b\|c"|z"#, &["y", "|b|c", "z"]);

        check(r#""a\|b\|""#, &["a|b|"]);
        check(r#""a\|b\|"|z"#, &["a|b|", "z"]);
        check(r#"y|"a\|b\|""#, &["y", "a|b|"]);
        check(r#"y|"a\|b\|"|z"#, &["y", "a|b|", "z"]);
    }

    #[test]
    fn missing_first_quote_splits_literally() {
        check("a\\|b\"", &["a\\", "b\""]);
        check("a\\|b\"|z", &["a\\", "b\"", "z"]);
        check("y|a\\|b\"", &["y", "a\\", "b\""]);
        check("y|a\\|b\"|z", &["y", "a\\", "b\"", "z"]);

        check(r#"a\|b\|c""#, &["a\\", "b\\", "c\""]);
        check(r#"a\|b\|c"|z"#, &["a\\", "b\\", "c\"", "z"]);
        check(r#"y|a\|b\|c""#, &["y", "a\\", "b\\", "c\""]);
        check(r#"y|a\|b\|c"|z"#, &["y", "a\\", "b\\", "c\"", "z"]);
    }

    #[test]
    fn missing_last_quote_splits_literally() {
        check("\"a\\|b", &["\"a\\", "b"]);
        check("\"a\\|b|z", &["\"a\\", "b", "z"]);
        check("y|\"a\\|b", &["y", "\"a\\", "b"]);
        check("y|\"a\\|b|z", &["y", "\"a\\", "b", "z"]);

        check("\"a\\|", &["\"a\\", ""]);
        check("y|\"a\\|", &["y", "\"a\\", ""]);
        check("y|\"a\\|z", &["y", "\"a\\", "z"]);
        check(r#"y|"a\|"z"#, &["y", "\"a\\", "\"z"]);
    }

    #[test]
    fn multiline_capture_replaces_marker_slot() {
        let mut tokenizer = ShdrTokenizer::new();
        assert!(tokenizer
            .feed_line(r#""a\|b"|--multiline--X"#)
            .is_none());
        assert!(tokenizer.capturing());
        assert!(tokenizer.feed_line("body1").is_none());
        assert!(tokenizer.feed_line("body2").is_none());
        let tokens = tokenizer.feed_line("X").unwrap();
        assert_eq!(
            Tokens::new(vec!["a|b".to_string(), "body1\nbody2".to_string()]),
            tokens
        );
        assert!(!tokenizer.capturing());
    }

    #[test]
    fn plain_lines_pass_straight_through() {
        let mut tokenizer = ShdrTokenizer::new();
        let tokens = tokenizer.feed_line("2021-01-19T12:00:00Z|exec|ACTIVE").unwrap();
        assert_eq!(
            vec!["2021-01-19T12:00:00Z", "exec", "ACTIVE"],
            tokens.values
        );
    }
}
