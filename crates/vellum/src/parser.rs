//! The document parser.
//!
//! Consumes the lexer's token stream and produces the node tree a
//! [`crate::template::Template`] owns. Tag constructs are dispatched to the
//! parser functions registered in the owning set's tag table; those
//! functions receive this parser (to wrap block bodies) plus a sub-parser
//! over their argument tokens.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::Error;
use crate::expression::Expr;
use crate::output::TemplateWriter;
use crate::set::TemplateSet;
use crate::tags::MacroDefinition;
use crate::template::Template;
use crate::token::{Token, TokenKind};
use crate::value::escape_html;

/// Bound on nested block tags, protecting against pathological inputs.
const MAX_NESTING: usize = 200;

/// A tag construct compiled into the node tree.
///
/// A tag node is built once at parse time and executed on every render,
/// writing its output into the sink.
pub trait TagNode: Send + Sync {
    /// Renders this tag.
    fn execute(&self, ctx: &mut ExecutionContext, out: &mut dyn TemplateWriter)
        -> Result<(), Error>;
}

/// One unit of template output.
pub enum Node {
    /// Literal text.
    Text(String),
    /// `{{ expression }}` output.
    Variable(VariableNode),
    /// A `{% ... %}` construct.
    Tag(Box<dyn TagNode>),
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Variable(var) => f.debug_tuple("Variable").field(&var.token).finish(),
            Self::Tag(_) => f.write_str("Tag(..)"),
        }
    }
}

impl Node {
    /// Renders this node into `out`.
    pub fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        match self {
            Self::Text(text) => out.write_str(text),
            Self::Variable(var) => var.execute(ctx, out),
            Self::Tag(tag) => tag.execute(ctx, out),
        }
    }
}

/// A `{{ ... }}` node: one filtered expression.
pub struct VariableNode {
    /// The compiled expression.
    pub expr: Expr,
    /// The token starting the expression, for error attribution.
    pub token: Token,
}

impl VariableNode {
    fn execute(&self, ctx: &mut ExecutionContext, out: &mut dyn TemplateWriter) -> Result<(), Error> {
        let value = self.expr.evaluate(ctx).map_err(|mut e| {
            e.update_from_token(&self.token);
            e.filename.get_or_insert_with(|| ctx.template_name.clone());
            e
        })?;
        if value.is_nil() {
            if !ctx.allow_missing_val {
                out.write_str("<no value>")?;
            }
            return Ok(());
        }
        let suppressed = value.is_safe() || self.expr.filter_applied("safe");
        let rendered = value.to_display_string();
        if ctx.autoescape && !suppressed {
            out.write_str(&escape_html(&rendered))
        } else {
            out.write_str(&rendered)
        }
    }
}

/// The body of a whole template document.
#[derive(Default, Debug)]
pub struct NodeList {
    /// The nodes, in document order.
    pub nodes: Vec<Node>,
}

impl NodeList {
    /// Renders every node in order.
    pub fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        for node in &self.nodes {
            node.execute(ctx, out)?;
        }
        Ok(())
    }
}

/// The body between a block tag and the end tag that closed it.
pub struct Wrapper {
    /// The wrapped nodes.
    pub nodes: Vec<Node>,
    /// The name of the end tag that terminated the body (e.g. `endif`,
    /// `else`).
    pub end_tag: String,
}

impl std::fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wrapper")
            .field("nodes", &self.nodes.len())
            .field("end_tag", &self.end_tag)
            .finish()
    }
}

impl Wrapper {
    /// Renders the wrapped body.
    pub fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        for node in &self.nodes {
            node.execute(ctx, out)?;
        }
        Ok(())
    }
}

/// The token-stream parser handed to tag parser functions.
///
/// The same type serves two roles: the *document* parser walking the whole
/// token stream, and the *argument* parser over the tokens between a tag
/// name and its closing `%}`.
pub struct Parser<'a> {
    set: &'a TemplateSet,
    template_name: String,
    tokens: Vec<Token>,
    idx: usize,
    /// Canonical names of templates currently being compiled; used to
    /// detect inheritance and include cycles.
    pub(crate) ancestors: Vec<String>,
    /// Blocks registered while parsing this document.
    pub(crate) blocks: HashMap<String, Arc<Wrapper>>,
    /// Macros exported by this document.
    pub(crate) exported_macros: HashMap<String, Arc<MacroDefinition>>,
    /// The parent template named by `{% extends %}`.
    pub(crate) parent: Option<Arc<Template>>,
    /// Set once anything other than literal text has been parsed.
    pub(crate) body_started: bool,
    wrap_depth: usize,
}

impl<'a> Parser<'a> {
    /// Creates a document parser over a full token stream.
    pub(crate) fn new(
        set: &'a TemplateSet,
        template_name: impl Into<String>,
        tokens: Vec<Token>,
        ancestors: Vec<String>,
    ) -> Self {
        Self {
            set,
            template_name: template_name.into(),
            tokens,
            idx: 0,
            ancestors,
            blocks: HashMap::new(),
            exported_macros: HashMap::new(),
            parent: None,
            body_started: false,
            wrap_depth: 0,
        }
    }

    fn new_args(&self, tokens: Vec<Token>) -> Parser<'a> {
        Parser::new(
            self.set,
            self.template_name.clone(),
            tokens,
            self.ancestors.clone(),
        )
    }

    /// The owning set.
    pub fn set(&self) -> &TemplateSet {
        self.set
    }

    /// The name of the template being parsed.
    pub fn template_name(&self) -> &str {
        &self.template_name
    }

    // ── Token primitives ─────────────────────────────────────────────

    /// The current token, if any remains.
    pub fn current(&self) -> Option<&Token> {
        self.tokens.get(self.idx)
    }

    /// Looks `n` tokens ahead of the current one.
    pub fn peek_n(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.idx + n)
    }

    /// Returns the current token if it matches kind and value, without
    /// consuming it.
    pub fn peek(&self, kind: TokenKind, value: &str) -> Option<&Token> {
        self.current().filter(|t| t.is(kind, value))
    }

    /// Returns the current token if it has the given kind, without
    /// consuming it.
    pub fn peek_type(&self, kind: TokenKind) -> Option<&Token> {
        self.current().filter(|t| t.kind == kind)
    }

    /// Consumes and returns the current token if it matches kind and value.
    pub fn match_token(&mut self, kind: TokenKind, value: &str) -> Option<Token> {
        if self.peek(kind, value).is_some() {
            return self.consume();
        }
        None
    }

    /// Consumes and returns the current token if it matches the kind and
    /// any of the given values.
    pub fn match_one(&mut self, kind: TokenKind, values: &[&str]) -> Option<Token> {
        if let Some(tok) = self.current() {
            if tok.kind == kind && values.contains(&tok.value.as_str()) {
                return self.consume();
            }
        }
        None
    }

    /// Consumes and returns the current token if it has the given kind.
    pub fn match_type(&mut self, kind: TokenKind) -> Option<Token> {
        if self.peek_type(kind).is_some() {
            return self.consume();
        }
        None
    }

    /// Consumes and returns the current token.
    pub fn consume(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.idx).cloned();
        if tok.is_some() {
            self.idx += 1;
        }
        tok
    }

    /// How many tokens remain (the trailing EOF token, when present, is
    /// not counted).
    pub fn remaining(&self) -> usize {
        self.tokens[self.idx..]
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .count()
    }

    /// Returns `true` once all tokens are consumed.
    pub fn end(&self) -> bool {
        self.remaining() == 0
    }

    /// Builds a parse error attributed to the current (or last) token.
    pub fn error(&self, message: impl Into<String>) -> Error {
        self.error_from("parser", message)
    }

    /// Builds an error with an explicit sender.
    pub fn error_from(&self, sender: &str, message: impl Into<String>) -> Error {
        let mut err = Error::new(sender, message).with_filename(self.template_name.clone());
        let token = self.current().or_else(|| self.tokens.last());
        if let Some(tok) = token {
            err.update_from_token(tok);
        }
        err
    }

    // ── Document parsing ─────────────────────────────────────────────

    /// Parses the whole token stream into a document body.
    pub(crate) fn parse_document(&mut self) -> Result<NodeList, Error> {
        let mut nodes = Vec::new();
        while let Some(node) = self.parse_next(&mut None)? {
            nodes.push(node);
        }
        Ok(NodeList { nodes })
    }

    /// Scans nodes until a `{% name ... %}` whose name is in `names`,
    /// returning the wrapped body and an argument parser over the end
    /// tag's arguments. The matched name is recorded in the wrapper's
    /// `end_tag`.
    pub fn wrap_until_tag(&mut self, names: &[&str]) -> Result<(Wrapper, Parser<'a>), Error> {
        self.wrap_depth += 1;
        if self.wrap_depth > MAX_NESTING {
            self.wrap_depth -= 1;
            return Err(self.error("maximum tag nesting depth exceeded"));
        }
        let mut stop = Some((names, None));
        let mut nodes = Vec::new();
        loop {
            match self.parse_next(&mut stop)? {
                Some(node) => nodes.push(node),
                None => break,
            }
        }
        self.wrap_depth -= 1;
        match stop.and_then(|(_, hit)| hit) {
            Some((end_tag, arg_tokens)) => {
                let args = self.new_args(arg_tokens);
                Ok((Wrapper { nodes, end_tag }, args))
            }
            None => Err(self.error(format!(
                "unexpected end of template, expected one of: {}",
                names.join(", ")
            ))),
        }
    }

    /// Scans past nodes until `{% name %}`, discarding everything.
    pub fn skip_until_tag(&mut self, name: &str) -> Result<(), Error> {
        while self.idx < self.tokens.len() {
            if self.tokens[self.idx].is(TokenKind::Symbol, "{%")
                && self
                    .tokens
                    .get(self.idx + 1)
                    .is_some_and(|t| t.kind == TokenKind::Identifier && t.value == name)
            {
                self.idx += 2;
                while let Some(tok) = self.consume() {
                    if tok.is(TokenKind::Symbol, "%}") {
                        return Ok(());
                    }
                }
                return Err(self.error(format!("unterminated '{name}' tag")));
            }
            self.idx += 1;
        }
        Err(self.error(format!(
            "unexpected end of template, expected '{{% {name} %}}'"
        )))
    }

    /// Stop-condition plumbing for `wrap_until_tag`: when `stop` carries
    /// end-tag names and one of them is reached, its argument tokens are
    /// stored back into `stop` and `None` is returned.
    #[allow(clippy::type_complexity)]
    fn parse_next(
        &mut self,
        stop: &mut Option<(&[&str], Option<(String, Vec<Token>)>)>,
    ) -> Result<Option<Node>, Error> {
        let Some(tok) = self.current().cloned() else {
            return Ok(None);
        };
        match tok.kind {
            TokenKind::Eof => Ok(None),
            TokenKind::Html => {
                self.consume();
                Ok(Some(Node::Text(tok.value)))
            }
            TokenKind::Symbol if tok.value == "{{" => {
                self.consume();
                self.body_started = true;
                let start = self
                    .current()
                    .cloned()
                    .unwrap_or_else(|| tok.clone());
                let expr = self.parse_expression()?;
                if self.match_token(TokenKind::Symbol, "}}").is_none() {
                    return Err(self.error("unexpected token, expected '}}'"));
                }
                Ok(Some(Node::Variable(VariableNode { expr, token: start })))
            }
            TokenKind::Symbol if tok.value == "{%" => {
                // End tag the enclosing wrap is waiting for?
                if let Some((names, hit)) = stop.as_mut() {
                    if let Some(next) = self.peek_n(1) {
                        if next.kind == TokenKind::Identifier
                            && names.contains(&next.value.as_str())
                        {
                            let end_name = next.value.clone();
                            self.idx += 2;
                            let args = self.collect_tag_args()?;
                            *hit = Some((end_name, args));
                            return Ok(None);
                        }
                    }
                }
                self.parse_tag().map(Some)
            }
            _ => Err(self.error(format!("unexpected token '{}'", tok.value))),
        }
    }

    fn collect_tag_args(&mut self) -> Result<Vec<Token>, Error> {
        let mut args = Vec::new();
        loop {
            let Some(tok) = self.consume() else {
                return Err(self.error("unterminated tag, expected '%}'"));
            };
            if tok.is(TokenKind::Symbol, "%}") {
                return Ok(args);
            }
            args.push(tok);
        }
    }

    fn parse_tag(&mut self) -> Result<Node, Error> {
        self.consume(); // {%
        let Some(name_tok) = self.match_type(TokenKind::Identifier) else {
            return Err(self.error("tag name expected"));
        };
        let name = name_tok.value.clone();

        if self.set.is_tag_banned(&name) {
            return Err(self
                .error(format!("usage of tag '{name}' is not allowed (sandbox restriction)")));
        }
        let Some(tag_fn) = self.set.tag_function(&name) else {
            return Err(self.error(format!("tag '{name}' not found")).with_token(&name_tok));
        };

        let arg_tokens = self.collect_tag_args()?;
        let mut args = self.new_args(arg_tokens);
        let node = tag_fn(self, &name_tok, &mut args).map_err(|mut e| {
            if e.sender == "parser" || e.sender == "execution" {
                e.sender = format!("tag:{name}");
            }
            e.update_from_token(&name_tok);
            e.filename.get_or_insert_with(|| self.template_name.clone());
            e
        })?;
        if !args.end() {
            return Err(args.error(format!("malformed arguments for tag '{name}'")));
        }
        self.body_started = true;
        Ok(Node::Tag(node))
    }

    // ── Template loading (extends / include / import / ssi) ──────────

    /// Resolves and compiles another template relative to this one,
    /// detecting reference cycles.
    pub fn load_template(&self, ref_name: &str) -> Result<Arc<Template>, Error> {
        self.set
            .load_sub_template(Some(&self.template_name), ref_name, &self.ancestors)
            .map_err(|e| e.with_filename(self.template_name.clone()))
    }

    /// Resolves and reads a file through the set's loaders without
    /// compiling it.
    pub fn load_raw(&self, ref_name: &str) -> Result<String, Error> {
        self.set
            .load_source(Some(&self.template_name), ref_name)
            .map(|(_, source)| source)
            .map_err(|e| e.with_filename(self.template_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;
    use crate::loaders::MemoryLoader;
    use crate::set::Options;

    fn parse_source(source: &str) -> Result<NodeList, Error> {
        let set = TemplateSet::new("test", Box::new(MemoryLoader::new()));
        let tokens = lexer::tokenize("test.html", source, Options::default())?;
        let mut parser = Parser::new(&set, "test.html", tokens, vec![]);
        parser.parse_document()
    }

    #[test]
    fn test_parse_text_only() {
        let doc = parse_source("plain text").unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert!(matches!(&doc.nodes[0], Node::Text(s) if s == "plain text"));
    }

    #[test]
    fn test_parse_variable() {
        let doc = parse_source("{{ name }}").unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert!(matches!(&doc.nodes[0], Node::Variable(_)));
    }

    #[test]
    fn test_parse_mixed() {
        let doc = parse_source("a{{ x }}b{{ y }}c").unwrap();
        assert_eq!(doc.nodes.len(), 5);
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let err = parse_source("{% nosuchtag %}").unwrap_err();
        assert!(err.message.contains("tag 'nosuchtag' not found"));
    }

    #[test]
    fn test_unclosed_variable_expression() {
        let err = parse_source("{{ a b }}").unwrap_err();
        assert!(err.message.contains("expected '}}'"));
    }

    #[test]
    fn test_unbalanced_block_is_error() {
        let err = parse_source("{% if x %}no end").unwrap_err();
        assert!(err.message.contains("unexpected end of template"));
    }

    #[test]
    fn test_stray_end_tag_is_error() {
        let err = parse_source("{% endif %}").unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_error_carries_template_name() {
        let err = parse_source("{% bogus %}").unwrap_err();
        assert_eq!(err.filename.as_deref(), Some("test.html"));
        assert!(err.line.is_some());
    }

    #[test]
    fn test_banned_tag_message() {
        let set = TemplateSet::new("test", Box::new(MemoryLoader::new()));
        set.ban_tag("lorem").unwrap();
        let tokens =
            lexer::tokenize("t", "{% lorem %}", Options::default()).unwrap();
        let mut parser = Parser::new(&set, "t", tokens, vec![]);
        let err = parser.parse_document().unwrap_err();
        assert!(err.message.contains("sandbox restriction"));
    }

    #[test]
    fn test_end_tag_with_junk_arguments() {
        let err = parse_source("{% if x %}ok{% endif extra stuff %}").unwrap_err();
        assert!(err.message.contains("takes no further arguments"));
    }
}
