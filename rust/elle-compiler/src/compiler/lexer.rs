//! Line-oriented tokenizer for Elle source text.

use crate::compiler::tokens::{Token, TokenKind};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// `${expr}` splice inside a string literal; no nested braces.
static INTERP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{[^}]+\}").unwrap());

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    #[error("invalid sequence on input: {sequence}\nline {line}: {line_text}")]
    InvalidSequence {
        sequence: String,
        line: usize,
        line_text: String,
    },
}

/// Tokenize a whole module. Emits an `Eol` token at every line boundary and a
/// final `Eof` token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut last_line = 1;
    for (idx, line) in source.lines().enumerate() {
        last_line = idx + 1;
        tokenize_line(line, last_line, false, &mut tokens)?;
        tokens.push(Token::new(TokenKind::Eol, "", last_line));
    }
    tokens.push(Token::new(TokenKind::Eof, "", last_line));
    Ok(tokens)
}

/// Scan one source line. `in_string` marks re-tokenized interpolation content,
/// which must not be interpolated again.
fn tokenize_line(
    line: &str,
    line_no: usize,
    in_string: bool,
    out: &mut Vec<Token>,
) -> Result<(), LexError> {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            // Comment runs to end of line
            break;
        }

        if c == '"' {
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '"' {
                j += 1;
            }
            if j == chars.len() {
                return Err(invalid_sequence("\"", line_no, line));
            }
            let value: String = chars[i..=j].iter().collect();
            i = j + 1;
            if !in_string {
                if let Some(inner) = interpolate(&value) {
                    let mut spliced = Vec::new();
                    tokenize_line(&inner, line_no, true, &mut spliced)?;
                    out.extend(spliced);
                    continue;
                }
            }
            out.push(Token::new(TokenKind::Str, value, line_no));
            continue;
        }

        if is_hash_key_char(c) {
            // A run of [0-9a-z_] directly followed by ':' is a hash key
            let mut j = i;
            while j < chars.len() && is_hash_key_char(chars[j]) {
                j += 1;
            }
            if j < chars.len() && chars[j] == ':' {
                let value: String = chars[i..=j].iter().collect();
                out.push(Token::new(TokenKind::HashKey, value, line_no));
                i = j + 1;
                continue;
            }
        }

        if c.is_ascii_digit() {
            let mut j = i;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            if j + 1 < chars.len() && chars[j] == '.' && chars[j + 1].is_ascii_digit() {
                j += 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
            }
            let value: String = chars[i..j].iter().collect();
            out.push(Token::new(TokenKind::Number, value, line_no));
            i = j;
            continue;
        }

        if is_ident_start(c) {
            let mut j = i + 1;
            while j < chars.len() && is_ident_char(chars[j]) {
                j += 1;
            }
            let value: String = chars[i..j].iter().collect();
            let kind = TokenKind::keyword(&value).unwrap_or(TokenKind::Ident);
            out.push(Token::new(kind, value, line_no));
            i = j;
            continue;
        }

        if let Some((kind, len)) = operator_at(&chars, i) {
            let value: String = chars[i..i + len].iter().collect();
            out.push(Token::new(kind, value, line_no));
            i += len;
            continue;
        }

        // Nothing matched: collect the run up to the next recognizable start
        let start = i;
        i += 1;
        while i < chars.len() && !chars[i].is_whitespace() && !token_starts_at(&chars, i) {
            i += 1;
        }
        let sequence: String = chars[start..i].iter().collect();
        return Err(invalid_sequence(&sequence, line_no, line));
    }

    Ok(())
}

fn invalid_sequence(sequence: &str, line: usize, line_text: &str) -> LexError {
    LexError::InvalidSequence {
        sequence: sequence.to_string(),
        line,
        line_text: line_text.to_string(),
    }
}

fn is_hash_key_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

fn is_ident_start(c: char) -> bool {
    c == '$' || c == '_' || c.is_ascii_alphabetic()
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

/// Match an operator or bracket at position `i`. Longest match wins, so
/// compound assignments and two-character comparisons are tried first.
fn operator_at(chars: &[char], i: usize) -> Option<(TokenKind, usize)> {
    let c = chars[i];
    let next = chars.get(i + 1).copied();

    if matches!(c, '+' | '-' | '*' | '/' | '%') && next == Some('=') {
        return Some((TokenKind::MathAssign, 2));
    }
    match c {
        '+' | '-' => Some((TokenKind::Add, 1)),
        '*' | '/' | '%' => Some((TokenKind::Mul, 1)),
        '<' | '>' => {
            if next == Some('=') {
                Some((TokenKind::Cmp, 2))
            } else {
                Some((TokenKind::Cmp, 1))
            }
        }
        '=' => {
            if next == Some('=') {
                Some((TokenKind::Cmp, 2))
            } else {
                Some((TokenKind::Assign, 1))
            }
        }
        '!' => {
            if next == Some('=') {
                Some((TokenKind::Cmp, 2))
            } else {
                None
            }
        }
        '&' => Some((TokenKind::Concat, 1)),
        '.' => Some((TokenKind::Dot, 1)),
        ',' => Some((TokenKind::Comma, 1)),
        '(' => Some((TokenKind::LParen, 1)),
        ')' => Some((TokenKind::RParen, 1)),
        '[' => Some((TokenKind::LBracket, 1)),
        ']' => Some((TokenKind::RBracket, 1)),
        '{' => Some((TokenKind::LBrace, 1)),
        '}' => Some((TokenKind::RBrace, 1)),
        _ => None,
    }
}

/// Whether any token can begin at position `i`.
fn token_starts_at(chars: &[char], i: usize) -> bool {
    let c = chars[i];
    c == '"' || c == '#' || c.is_ascii_digit() || is_ident_start(c) || operator_at(chars, i).is_some()
}

/// Rewrite a string literal containing `${expr}` splices into an equivalent
/// concatenation expression, eliding degenerate empty edges. Returns `None`
/// when the literal has no splices.
fn interpolate(literal: &str) -> Option<String> {
    if !INTERP_RE.is_match(literal) {
        return None;
    }
    let replaced = INTERP_RE.replace_all(literal, |caps: &regex::Captures<'_>| {
        let m = caps.get(0).unwrap().as_str();
        format!("\" & ({}) & \"", &m[2..m.len() - 1])
    });
    let mut inner = replaced.as_ref();
    if let Some(stripped) = inner.strip_prefix("\"\" & ") {
        inner = stripped;
    }
    if let Some(stripped) = inner.strip_suffix(" & \"\"") {
        inner = stripped;
    }
    Some(inner.to_string())
}

/// Cursor over a token vector with single-token lookback: `hold()` makes the
/// next `advance()` re-yield the current token. The final token is sticky.
pub struct TokenCursor {
    tokens: Vec<Token>,
    pos: usize,
    primed: bool,
    held: bool,
}

impl TokenCursor {
    pub fn new(tokens: Vec<Token>) -> Self {
        assert!(!tokens.is_empty(), "token stream must end with Eof");
        Self {
            tokens,
            pos: 0,
            primed: false,
            held: false,
        }
    }

    /// Advance to the next token, unless a `hold()` is pending.
    pub fn advance(&mut self) {
        if self.held {
            self.held = false;
            return;
        }
        if !self.primed {
            self.primed = true;
            return;
        }
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    /// Re-yield the current token on the next `advance()`.
    pub fn hold(&mut self) {
        self.held = true;
    }

    pub fn current(&self) -> &Token {
        &self.tokens[self.pos]
    }

    pub fn kind(&self) -> TokenKind {
        self.tokens[self.pos].kind
    }

    pub fn value(&self) -> &str {
        &self.tokens[self.pos].value
    }

    pub fn line(&self) -> usize {
        self.tokens[self.pos].line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_literals_and_operators() {
        let toks = tokenize("x = 1 + 2.5 * y").unwrap();
        let expected = [
            (TokenKind::Ident, "x"),
            (TokenKind::Assign, "="),
            (TokenKind::Number, "1"),
            (TokenKind::Add, "+"),
            (TokenKind::Number, "2.5"),
            (TokenKind::Mul, "*"),
            (TokenKind::Ident, "y"),
            (TokenKind::Eol, ""),
            (TokenKind::Eof, ""),
        ];
        assert_eq!(toks.len(), expected.len());
        for (tok, (kind, value)) in toks.iter().zip(expected) {
            assert_eq!(tok.kind, kind);
            assert_eq!(tok.value, value);
        }
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            kinds("IF x\nEnd"),
            vec![
                TokenKind::If,
                TokenKind::Ident,
                TokenKind::Eol,
                TokenKind::End,
                TokenKind::Eol,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn keywords_match_whole_identifiers_only() {
        let toks = tokenize("iffy = 1").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Ident);
        assert_eq!(toks[0].value, "iffy");
    }

    #[test]
    fn hash_keys_keep_their_colon() {
        let toks = tokenize("{ name: 1 }").unwrap();
        assert_eq!(toks[1].kind, TokenKind::HashKey);
        assert_eq!(toks[1].value, "name:");
    }

    #[test]
    fn compound_assignment_operators() {
        let toks = tokenize("a += 1").unwrap();
        assert_eq!(toks[1].kind, TokenKind::MathAssign);
        assert_eq!(toks[1].value, "+=");
    }

    #[test]
    fn comments_and_whitespace_are_dropped() {
        assert_eq!(
            kinds("x # trailing comment"),
            vec![TokenKind::Ident, TokenKind::Eol, TokenKind::Eof]
        );
    }

    #[test]
    fn bad_character_reports_invalid_sequence() {
        let err = tokenize("a = 1 ? 2").unwrap_err();
        let LexError::InvalidSequence {
            sequence,
            line,
            line_text,
        } = err;
        assert_eq!(sequence, "?");
        assert_eq!(line, 1);
        assert_eq!(line_text, "a = 1 ? 2");
    }

    #[test]
    fn lone_bang_is_invalid_but_bang_eq_matches() {
        assert!(tokenize("a ! b").is_err());
        let toks = tokenize("a != b").unwrap();
        assert_eq!(toks[1].kind, TokenKind::Cmp);
        assert_eq!(toks[1].value, "!=");
    }

    #[test]
    fn interpolation_expands_to_concatenation() {
        let toks = tokenize(r#"s = "a${x}b""#).unwrap();
        let values: Vec<&str> = toks.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["s", "=", "\"a\"", "&", "(", "x", ")", "&", "\"b\"", "", ""]);
    }

    #[test]
    fn interpolation_elides_empty_edges() {
        let toks = tokenize(r#"s = "${x}""#).unwrap();
        let values: Vec<&str> = toks.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["s", "=", "(", "x", ")", "", ""]);
    }

    #[test]
    fn interpolation_handles_multiple_splices() {
        let toks = tokenize(r#"s = "a${x}${y}""#).unwrap();
        let values: Vec<&str> = toks.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(
            values,
            vec!["s", "=", "\"a\"", "&", "(", "x", ")", "&", "\"\"", "&", "(", "y", ")", "", ""]
        );
    }

    #[test]
    fn plain_string_tokens_are_unchanged() {
        let toks = tokenize(r#"s = "no splices here""#).unwrap();
        assert_eq!(toks[2].kind, TokenKind::Str);
        assert_eq!(toks[2].value, "\"no splices here\"");
    }

    #[test]
    fn cursor_hold_re_yields_current() {
        let mut cur = TokenCursor::new(tokenize("a b").unwrap());
        cur.advance();
        assert_eq!(cur.value(), "a");
        cur.hold();
        cur.advance();
        assert_eq!(cur.value(), "a");
        cur.advance();
        assert_eq!(cur.value(), "b");
    }

    #[test]
    fn cursor_is_sticky_at_eof() {
        let mut cur = TokenCursor::new(tokenize("a").unwrap());
        for _ in 0..6 {
            cur.advance();
        }
        assert_eq!(cur.kind(), TokenKind::Eof);
    }
}
