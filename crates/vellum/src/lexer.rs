//! The template lexer.
//!
//! A cursor-driven state machine over the source characters. Text outside
//! delimiters accumulates into `Html` tokens; `{{ ... }}` and `{% ... %}`
//! regions are lexed into identifier/keyword/number/string/symbol tokens
//! with the delimiters themselves emitted as `Symbol` tokens; `{# ... #}`
//! comments are dropped entirely.
//!
//! Whitespace-trim variants (`{{-`, `-}}`, `{%-`, `-%}`) flag the adjacent
//! `Html` token; `{% verbatim %}` ... `{% endverbatim %}` is recognized
//! here, not in the parser, so its interior is plain text.

use crate::error::Error;
use crate::set::Options;
use crate::token::{Token, TokenKind, KEYWORDS};

const SYMBOLS2: &[&str] = &["==", "!=", "<=", ">=", "<>", "&&", "||"];
const SYMBOLS1: &str = "()[],.:|=+-*/%^<>!{};&";

/// Lexes `source` into tokens, converting a lex failure into an [`Error`].
pub fn tokenize(name: &str, source: &str, options: Options) -> Result<Vec<Token>, Error> {
    let tokens = lex(source, options);
    if let Some(err_tok) = tokens.iter().find(|t| t.kind == TokenKind::Error) {
        return Err(Error::new("lexer", err_tok.value.clone())
            .with_token(err_tok)
            .with_filename(name));
    }
    Ok(tokens)
}

/// Lexes `source` into a token list.
///
/// Always terminates: the result either ends in an `Eof` token or contains
/// a single `Error` token followed by `Eof`. This function never panics,
/// whatever the input contains.
pub fn lex(source: &str, options: Options) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    lexer.run();
    let mut tokens = lexer.tokens;
    post_process(&mut tokens, options);
    tokens
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    tokens: Vec<Token>,
    text_buf: String,
    text_line: usize,
    text_col: usize,
    /// Set when the previous tag closed with `-}}` / `-%}`; transferred to
    /// the next `Html` token.
    trim_next_text: bool,
    failed: bool,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
            text_buf: String::new(),
            text_line: 1,
            text_col: 1,
            trim_next_text: false,
            failed: false,
        }
    }

    fn run(&mut self) {
        while self.pos < self.chars.len() {
            if self.starts_with("{#") {
                self.flush_text(false);
                if !self.lex_comment() {
                    break;
                }
            } else if self.starts_with("{%") {
                if let Some(after) = self.match_verbatim_open() {
                    self.enter_verbatim(after);
                    if self.failed {
                        break;
                    }
                } else {
                    let trim = self.peek_at(2) == Some('-');
                    self.flush_text(trim);
                    self.emit_opener("{%", trim);
                    if !self.lex_code("%}") {
                        break;
                    }
                }
            } else if self.starts_with("{{") {
                let trim = self.peek_at(2) == Some('-');
                self.flush_text(trim);
                self.emit_opener("{{", trim);
                if !self.lex_code("}}") {
                    break;
                }
            } else {
                if self.text_buf.is_empty() {
                    self.text_line = self.line;
                    self.text_col = self.col;
                }
                let c = self.chars[self.pos];
                self.text_buf.push(c);
                self.advance();
            }
        }
        self.flush_text(false);
        self.tokens
            .push(Token::new(TokenKind::Eof, "", self.line, self.col));
    }

    // ── Cursor helpers ───────────────────────────────────────────────

    fn advance(&mut self) {
        if let Some(&c) = self.chars.get(self.pos) {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }

    fn advance_n(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.starts_with_at(0, s)
    }

    fn starts_with_at(&self, offset: usize, s: &str) -> bool {
        let mut i = self.pos + offset;
        for expected in s.chars() {
            if self.chars.get(i) != Some(&expected) {
                return false;
            }
            i += 1;
        }
        true
    }

    // ── Emission ─────────────────────────────────────────────────────

    fn flush_text(&mut self, trim_right: bool) {
        if !self.text_buf.is_empty() {
            let mut tok = Token::new(
                TokenKind::Html,
                std::mem::take(&mut self.text_buf),
                self.text_line,
                self.text_col,
            );
            tok.trim_left = std::mem::take(&mut self.trim_next_text);
            tok.trim_right = trim_right;
            self.tokens.push(tok);
        } else {
            self.trim_next_text = false;
        }
    }

    fn emit(&mut self, kind: TokenKind, value: impl Into<String>, line: usize, col: usize) {
        self.tokens.push(Token::new(kind, value, line, col));
    }

    fn fail(&mut self, message: impl Into<String>, line: usize, col: usize) {
        self.emit(TokenKind::Error, message, line, col);
        self.failed = true;
    }

    /// Emits the opening delimiter symbol, consuming an attached `-`.
    fn emit_opener(&mut self, opener: &str, trim: bool) {
        let (line, col) = (self.line, self.col);
        self.advance_n(2);
        if trim {
            self.advance();
        }
        self.emit(TokenKind::Symbol, opener, line, col);
    }

    // ── Comments ─────────────────────────────────────────────────────

    fn lex_comment(&mut self) -> bool {
        let (line, col) = (self.line, self.col);
        self.advance_n(2);
        while self.pos < self.chars.len() {
            if self.starts_with("#}") {
                self.advance_n(2);
                return true;
            }
            self.advance();
        }
        self.fail("unterminated comment, expected '#}'", line, col);
        false
    }

    // ── Verbatim ─────────────────────────────────────────────────────

    /// If the cursor sits on `{% verbatim %}`, returns the offset just past
    /// its closing `%}`.
    fn match_verbatim_open(&self) -> Option<usize> {
        self.match_tag_word(0, "verbatim")
    }

    /// Matches `{%[-] <word> [-]%}` starting at `offset`; returns the offset
    /// just past the closer.
    fn match_tag_word(&self, offset: usize, word: &str) -> Option<usize> {
        if !self.starts_with_at(offset, "{%") {
            return None;
        }
        let mut i = offset + 2;
        if self.peek_at(i) == Some('-') {
            i += 1;
        }
        while self.peek_at(i).is_some_and(char::is_whitespace) {
            i += 1;
        }
        if !self.starts_with_at(i, word) {
            return None;
        }
        i += word.chars().count();
        // Must be a full word, not a prefix of a longer identifier.
        if self
            .peek_at(i)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return None;
        }
        while self.peek_at(i).is_some_and(char::is_whitespace) {
            i += 1;
        }
        if self.peek_at(i) == Some('-') {
            i += 1;
        }
        if !self.starts_with_at(i, "%}") {
            return None;
        }
        Some(i + 2)
    }

    fn enter_verbatim(&mut self, skip: usize) {
        let (line, col) = (self.line, self.col);
        self.advance_n(skip);
        if self.text_buf.is_empty() {
            self.text_line = self.line;
            self.text_col = self.col;
        }
        loop {
            if self.pos >= self.chars.len() {
                self.fail("unterminated verbatim block, expected '{% endverbatim %}'", line, col);
                return;
            }
            if self.starts_with("{%") {
                if let Some(after) = self.match_tag_word(0, "endverbatim") {
                    self.advance_n(after);
                    return;
                }
            }
            let c = self.chars[self.pos];
            self.text_buf.push(c);
            self.advance();
        }
    }

    // ── Code regions ─────────────────────────────────────────────────

    /// Lexes the interior of a `{{ }}` or `{% %}` region up to and
    /// including `closer`. Returns `false` on a lex failure.
    fn lex_code(&mut self, closer: &str) -> bool {
        let region_line = self.line;
        let region_col = self.col;
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.advance();
            }
            let Some(c) = self.peek() else {
                self.fail(
                    format!("unterminated block, expected '{closer}'"),
                    region_line,
                    region_col,
                );
                return false;
            };

            // Closing delimiter, optionally with a trim marker.
            if self.peek() == Some('-') && self.starts_with_at(1, closer) {
                let (line, col) = (self.line, self.col);
                self.advance_n(1 + closer.len());
                self.trim_next_text = true;
                self.emit(TokenKind::Symbol, closer, line, col);
                return true;
            }
            if self.starts_with(closer) {
                let (line, col) = (self.line, self.col);
                self.advance_n(closer.len());
                self.emit(TokenKind::Symbol, closer, line, col);
                return true;
            }

            if c.is_ascii_alphabetic() || c == '_' {
                self.lex_identifier();
            } else if c.is_ascii_digit() {
                self.lex_number();
            } else if c == '"' || c == '\'' {
                if !self.lex_string(c) {
                    return false;
                }
            } else if !self.lex_symbol() {
                return false;
            }
        }
    }

    fn lex_identifier(&mut self) {
        let (line, col) = (self.line, self.col);
        let mut ident = String::new();
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            ident.push(self.chars[self.pos]);
            self.advance();
        }
        let kind = if ident == "nil" || ident == "None" {
            TokenKind::Nil
        } else if KEYWORDS.contains(&ident.as_str()) {
            TokenKind::Keyword
        } else {
            TokenKind::Identifier
        };
        self.emit(kind, ident, line, col);
    }

    fn lex_number(&mut self) {
        let (line, col) = (self.line, self.col);
        let mut num = String::new();
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            num.push(self.chars[self.pos]);
            self.advance();
        }
        // A dot only joins the number when digits follow, so `items.0`
        // still lexes as a path.
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            num.push('.');
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                num.push(self.chars[self.pos]);
                self.advance();
            }
            self.emit(TokenKind::Float, num, line, col);
        } else {
            self.emit(TokenKind::Integer, num, line, col);
        }
    }

    fn lex_string(&mut self, quote: char) -> bool {
        let (line, col) = (self.line, self.col);
        self.advance();
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                self.fail("unterminated string literal", line, col);
                return false;
            };
            if c == quote {
                self.advance();
                self.emit(TokenKind::String, value, line, col);
                return true;
            }
            if c == '\\' {
                self.advance();
                let Some(escaped) = self.peek() else {
                    self.fail("unterminated string literal", line, col);
                    return false;
                };
                match escaped {
                    'n' => value.push('\n'),
                    'r' => value.push('\r'),
                    't' => value.push('\t'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    '\'' => value.push('\''),
                    other => {
                        self.fail(
                            format!("unknown escape sequence '\\{other}' in string literal"),
                            self.line,
                            self.col,
                        );
                        return false;
                    }
                }
                self.advance();
            } else {
                value.push(c);
                self.advance();
            }
        }
    }

    fn lex_symbol(&mut self) -> bool {
        let (line, col) = (self.line, self.col);
        for sym in SYMBOLS2 {
            if self.starts_with(sym) {
                self.advance_n(2);
                self.emit(TokenKind::Symbol, *sym, line, col);
                return true;
            }
        }
        let c = self.chars[self.pos];
        if SYMBOLS1.contains(c) {
            self.advance();
            self.emit(TokenKind::Symbol, c.to_string(), line, col);
            return true;
        }
        self.fail(format!("unexpected character '{c}'"), line, col);
        false
    }
}

/// Applies the `{{-`/`-}}` trim flags and the set-level `TrimBlocks` /
/// `LStripBlocks` options to the lexed `Html` tokens.
fn post_process(tokens: &mut Vec<Token>, options: Options) {
    for tok in tokens.iter_mut() {
        if tok.kind != TokenKind::Html {
            continue;
        }
        if tok.trim_left {
            tok.value = tok.value.trim_start().to_string();
        }
        if tok.trim_right {
            tok.value = tok.value.trim_end().to_string();
        }
    }

    if options.trim_blocks || options.lstrip_blocks {
        for i in 0..tokens.len() {
            if tokens[i].kind != TokenKind::Html {
                continue;
            }
            if options.trim_blocks {
                let after_tag_close = i > 0 && tokens[i - 1].is(TokenKind::Symbol, "%}");
                if after_tag_close {
                    if let Some(rest) = tokens[i].value.strip_prefix("\r\n") {
                        tokens[i].value = rest.to_string();
                    } else if let Some(rest) = tokens[i].value.strip_prefix('\n') {
                        tokens[i].value = rest.to_string();
                    }
                }
            }
            if options.lstrip_blocks {
                let before_tag_open =
                    i + 1 < tokens.len() && tokens[i + 1].is(TokenKind::Symbol, "{%");
                if before_tag_open {
                    let value = &tokens[i].value;
                    let cut = value.rfind('\n').map(|p| p + 1).unwrap_or(0);
                    let applies = cut > 0 || i == 0;
                    if applies && value[cut..].chars().all(|c| c == ' ' || c == '\t') {
                        tokens[i].value = value[..cut].to_string();
                    }
                }
            }
        }
    }

    tokens.retain(|t| t.kind != TokenKind::Html || !t.value.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    fn lex_default(source: &str) -> Vec<Token> {
        lex(source, Options::default())
    }

    #[test]
    fn test_plain_text() {
        let tokens = lex_default("Hello world");
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].is(TokenKind::Html, "Hello world"));
        assert_eq!(tokens[1].kind, TokenKind::Eof);
    }

    #[test]
    fn test_empty_input() {
        let tokens = lex_default("");
        assert_eq!(kinds(&tokens), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_variable_block() {
        let tokens = lex_default("{{ name }}");
        assert!(tokens[0].is(TokenKind::Symbol, "{{"));
        assert!(tokens[1].is(TokenKind::Identifier, "name"));
        assert!(tokens[2].is(TokenKind::Symbol, "}}"));
        assert_eq!(tokens[3].kind, TokenKind::Eof);
    }

    #[test]
    fn test_tag_block_with_args() {
        let tokens = lex_default("{% for item in items %}");
        assert!(tokens[0].is(TokenKind::Symbol, "{%"));
        assert!(tokens[1].is(TokenKind::Identifier, "for"));
        assert!(tokens[2].is(TokenKind::Identifier, "item"));
        assert!(tokens[3].is(TokenKind::Keyword, "in"));
        assert!(tokens[4].is(TokenKind::Identifier, "items"));
        assert!(tokens[5].is(TokenKind::Symbol, "%}"));
    }

    #[test]
    fn test_comment_dropped() {
        let tokens = lex_default("a{# hidden #}b");
        assert!(tokens[0].is(TokenKind::Html, "a"));
        assert!(tokens[1].is(TokenKind::Html, "b"));
        assert_eq!(tokens[2].kind, TokenKind::Eof);
    }

    #[test]
    fn test_positions() {
        let tokens = lex_default("ab\ncd{{ x }}");
        let x = tokens.iter().find(|t| t.value == "x").unwrap();
        assert_eq!(x.line, 2);
        assert_eq!(x.column, 6);
    }

    #[test]
    fn test_keywords_and_nil() {
        let tokens = lex_default("{{ true and not nil or None }}");
        assert!(tokens[1].is(TokenKind::Keyword, "true"));
        assert!(tokens[2].is(TokenKind::Keyword, "and"));
        assert!(tokens[3].is(TokenKind::Keyword, "not"));
        assert_eq!(tokens[4].kind, TokenKind::Nil);
        assert!(tokens[5].is(TokenKind::Keyword, "or"));
        assert_eq!(tokens[6].kind, TokenKind::Nil);
    }

    #[test]
    fn test_numbers() {
        let tokens = lex_default("{{ 42 3.25 }}");
        assert!(tokens[1].is(TokenKind::Integer, "42"));
        assert!(tokens[2].is(TokenKind::Float, "3.25"));
    }

    #[test]
    fn test_dotted_path_is_not_a_float() {
        let tokens = lex_default("{{ items.0.name }}");
        assert!(tokens[1].is(TokenKind::Identifier, "items"));
        assert!(tokens[2].is(TokenKind::Symbol, "."));
        assert!(tokens[3].is(TokenKind::Integer, "0"));
        assert!(tokens[4].is(TokenKind::Symbol, "."));
        assert!(tokens[5].is(TokenKind::Identifier, "name"));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = lex_default(r#"{{ "a\n\t\"b\\" }}"#);
        assert!(tokens[1].is(TokenKind::String, "a\n\t\"b\\"));
        let tokens = lex_default(r"{{ 'it\'s' }}");
        assert!(tokens[1].is(TokenKind::String, "it's"));
    }

    #[test]
    fn test_unknown_escape_is_error() {
        let tokens = lex_default(r#"{{ "a\qb" }}"#);
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Error));
    }

    #[test]
    fn test_unterminated_string() {
        let tokens = lex_default(r#"{{ "abc }}"#);
        let err = tokens.iter().find(|t| t.kind == TokenKind::Error).unwrap();
        assert!(err.value.contains("unterminated string"));
    }

    #[test]
    fn test_unterminated_variable_block() {
        let tokens = lex_default("{{ name ");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Error));
    }

    #[test]
    fn test_unterminated_comment() {
        let tokens = lex_default("{# never closed");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Error));
    }

    #[test]
    fn test_two_char_symbols_are_greedy() {
        let tokens = lex_default("{{ a <= b <> c != d }}");
        let symbols: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Symbol)
            .map(|t| t.value.as_str())
            .collect();
        assert_eq!(symbols, ["{{", "<=", "<>", "!=", "}}"]);
    }

    #[test]
    fn test_trim_markers() {
        let tokens = lex_default("a  {{- x -}}  b");
        assert!(tokens[0].is(TokenKind::Html, "a"));
        assert!(tokens[4].is(TokenKind::Html, "b"));
    }

    #[test]
    fn test_trim_markers_on_tags() {
        let tokens = lex_default("a\n{%- x -%}\nb");
        let html: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Html)
            .map(|t| t.value.as_str())
            .collect();
        assert_eq!(html, ["a", "b"]);
    }

    #[test]
    fn test_minus_still_lexes_as_operator() {
        let tokens = lex_default("{{ a - 1 }}");
        assert!(tokens[2].is(TokenKind::Symbol, "-"));
        assert!(tokens[3].is(TokenKind::Integer, "1"));
    }

    #[test]
    fn test_verbatim_interior_is_text() {
        let tokens = lex_default("{% verbatim %}{{ raw }} {% if %}{% endverbatim %}");
        assert!(tokens[0].is(TokenKind::Html, "{{ raw }} {% if %}"));
        assert_eq!(tokens[1].kind, TokenKind::Eof);
    }

    #[test]
    fn test_verbatim_unterminated() {
        let tokens = lex_default("{% verbatim %}{{ raw }}");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Error));
    }

    #[test]
    fn test_verbatim_requires_exact_word() {
        let tokens = lex_default("{% verbatimish %}");
        assert!(tokens[1].is(TokenKind::Identifier, "verbatimish"));
    }

    #[test]
    fn test_trim_blocks_option() {
        let opts = Options {
            trim_blocks: true,
            lstrip_blocks: false,
        };
        let tokens = lex("{% x %}\nrest", opts);
        let html = tokens.iter().find(|t| t.kind == TokenKind::Html).unwrap();
        assert_eq!(html.value, "rest");
    }

    #[test]
    fn test_lstrip_blocks_option() {
        let opts = Options {
            trim_blocks: false,
            lstrip_blocks: true,
        };
        let tokens = lex("text\n    {% x %}", opts);
        let html = tokens.iter().find(|t| t.kind == TokenKind::Html).unwrap();
        assert_eq!(html.value, "text\n");
    }

    #[test]
    fn test_lstrip_keeps_inline_text() {
        let opts = Options {
            trim_blocks: false,
            lstrip_blocks: true,
        };
        let tokens = lex("text  {% x %}", opts);
        let html = tokens.iter().find(|t| t.kind == TokenKind::Html).unwrap();
        assert_eq!(html.value, "text  ");
    }

    #[test]
    fn test_lexer_never_panics_on_odd_input() {
        for source in [
            "{{",
            "{%",
            "{#",
            "{{ \u{0} }}",
            "}} {{",
            "{{ @ }}",
            "{ {{ } }}",
            "{%%}",
            "{{}}",
            "\u{1F980} {{ crab }}",
        ] {
            let tokens = lex_default(source);
            assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
        }
    }

    #[test]
    fn test_tokenize_reports_position() {
        let err = tokenize("t.html", "line1\n{{ \"x }}", Options::default()).unwrap_err();
        assert_eq!(err.line, Some(2));
        assert_eq!(err.filename.as_deref(), Some("t.html"));
        assert_eq!(err.sender, "lexer");
    }
}
