//! Built-in template tags.
//!
//! A tag is registered as a parser function `(document parser, start token,
//! argument parser) -> node`. The function consumes the tag's arguments —
//! and, for block tags, wraps the document body up to the matching end tag —
//! and returns the node executed on every render.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use chrono::TimeZone;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::context::ExecutionContext;
use crate::error::Error;
use crate::expression::Expr;
use crate::filters::django_date_format;
use crate::output::TemplateWriter;
use crate::parser::{Parser, TagNode, Wrapper};
use crate::template::{render_block_chain, Template};
use crate::token::{Token, TokenKind};
use crate::value::{escape_html, Value};

/// The shape of a registered tag parser.
pub type TagParseFn = Arc<
    dyn for<'a> Fn(&mut Parser<'a>, &Token, &mut Parser<'a>) -> Result<Box<dyn TagNode>, Error>
        + Send
        + Sync,
>;

type TagFn = for<'a> fn(
    &mut Parser<'a>,
    &Token,
    &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error>;

/// Seeds a tag table with every built-in tag.
pub(crate) fn register_builtins(table: &mut HashMap<String, TagParseFn>) {
    let builtins: &[(&str, TagFn)] = &[
        ("if", tag_if),
        ("for", tag_for),
        ("block", tag_block),
        ("extends", tag_extends),
        ("include", tag_include),
        ("macro", tag_macro),
        ("import", tag_import),
        ("with", tag_with),
        ("set", tag_set),
        ("autoescape", tag_autoescape),
        ("spaceless", tag_spaceless),
        ("firstof", tag_firstof),
        ("cycle", tag_cycle),
        ("ifchanged", tag_ifchanged),
        ("ifequal", tag_ifequal),
        ("ifnotequal", tag_ifnotequal),
        ("widthratio", tag_widthratio),
        ("templatetag", tag_templatetag),
        ("now", tag_now),
        ("lorem", tag_lorem),
        ("comment", tag_comment),
        ("ssi", tag_ssi),
        ("allowmissingval", tag_allowmissingval),
        ("exec", tag_exec),
    ];
    for (name, f) in builtins {
        table.insert((*name).to_string(), Arc::new(*f));
    }
}

/// Errors unless the given argument parser is exhausted.
fn no_args(p: &Parser<'_>, what: &str) -> Result<(), Error> {
    if p.end() {
        Ok(())
    } else {
        Err(p.error(format!("'{what}' takes no further arguments")))
    }
}

/// Writes a value with the ambient auto-escape rules applied.
fn write_value(
    ctx: &ExecutionContext,
    out: &mut dyn TemplateWriter,
    value: &Value,
    expr: &Expr,
) -> Result<(), Error> {
    let suppressed = value.is_safe() || expr.filter_applied("safe");
    let rendered = value.to_display_string();
    if ctx.autoescape && !suppressed {
        out.write_str(&escape_html(&rendered))
    } else {
        out.write_str(&rendered)
    }
}

fn state_key(doc: &Parser<'_>, start: &Token) -> String {
    format!("{}:{}:{}", doc.template_name(), start.line, start.column)
}

// ============================================================
// if / elif / else
// ============================================================

struct IfNode {
    branches: Vec<(Option<Expr>, Wrapper)>,
}

impl TagNode for IfNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        for (condition, body) in &self.branches {
            let take = match condition {
                Some(expr) => expr.evaluate(ctx)?.is_truthy(),
                None => true,
            };
            if take {
                return body.execute(ctx, out);
            }
        }
        Ok(())
    }
}

fn tag_if<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let mut branches = Vec::new();
    let mut condition = Some(args.parse_expression()?);
    no_args(args, "if")?;
    loop {
        let (wrapper, mut end_args) = doc.wrap_until_tag(&["elif", "else", "endif"])?;
        let end_tag = wrapper.end_tag.clone();
        branches.push((condition.take(), wrapper));
        match end_tag.as_str() {
            "elif" => {
                condition = Some(end_args.parse_expression()?);
                no_args(&end_args, "elif")?;
            }
            "else" => {
                no_args(&end_args, "else")?;
                let (else_body, else_end) = doc.wrap_until_tag(&["endif"])?;
                no_args(&else_end, "endif")?;
                branches.push((None, else_body));
                break;
            }
            _ => {
                no_args(&end_args, "endif")?;
                break;
            }
        }
    }
    Ok(Box::new(IfNode { branches }))
}

// ============================================================
// for / empty
// ============================================================

struct ForNode {
    var1: String,
    var2: Option<String>,
    iterable: Expr,
    sorted: bool,
    reversed: bool,
    body: Wrapper,
    empty_body: Option<Wrapper>,
}

impl TagNode for ForNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let value = self.iterable.evaluate(ctx)?;
        let items = value
            .iterate_order(self.sorted, self.reversed)
            .unwrap_or_default();

        if items.is_empty() {
            if let Some(empty) = &self.empty_body {
                return empty.execute(ctx, out);
            }
            return Ok(());
        }

        let total = items.len();
        for (idx, (item, mapped)) in items.iter().enumerate() {
            // Fetched each iteration so the inner loop observes the outer
            // loop's live counters.
            let parent_loop = ctx.get("forloop");
            ctx.push_scope();

            match (&self.var2, mapped) {
                (Some(var2), Some(map_value)) => {
                    ctx.set_private(self.var1.clone(), item.clone());
                    ctx.set_private(var2.clone(), map_value.clone());
                }
                (Some(var2), None) => {
                    // Positional unpacking of list items.
                    if let Some(inner) = item.as_list() {
                        ctx.set_private(
                            self.var1.clone(),
                            inner.first().cloned().unwrap_or_else(Value::none),
                        );
                        ctx.set_private(
                            var2.clone(),
                            inner.get(1).cloned().unwrap_or_else(Value::none),
                        );
                    } else {
                        ctx.set_private(self.var1.clone(), item.clone());
                        ctx.set_private(var2.clone(), Value::none());
                    }
                }
                (None, _) => {
                    ctx.set_private(self.var1.clone(), item.clone());
                }
            }

            let mut forloop = BTreeMap::new();
            forloop.insert("Counter".to_string(), Value::from(idx + 1));
            forloop.insert("Counter0".to_string(), Value::from(idx));
            forloop.insert("Revcounter".to_string(), Value::from(total - idx));
            forloop.insert("Revcounter0".to_string(), Value::from(total - idx - 1));
            forloop.insert("First".to_string(), Value::from(idx == 0));
            forloop.insert("Last".to_string(), Value::from(idx == total - 1));
            if let Some(parent) = parent_loop {
                forloop.insert("Parentloop".to_string(), parent);
            }
            ctx.set_private("forloop", Value::from(forloop));

            let result = self.body.execute(ctx, out);
            ctx.pop_scope();
            result?;
        }
        Ok(())
    }
}

fn tag_for<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(var1) = args.match_type(TokenKind::Identifier) else {
        return Err(args.error("expected a loop variable name"));
    };
    let var2 = if args.match_token(TokenKind::Symbol, ",").is_some() {
        match args.match_type(TokenKind::Identifier) {
            Some(tok) => Some(tok.value),
            None => return Err(args.error("expected a second loop variable after ','")),
        }
    } else {
        None
    };
    if args.match_token(TokenKind::Keyword, "in").is_none() {
        return Err(args.error("expected 'in' keyword"));
    }
    let iterable = args.parse_expression()?;
    let mut sorted = false;
    let mut reversed = false;
    loop {
        if args.match_token(TokenKind::Identifier, "sorted").is_some() {
            sorted = true;
        } else if args.match_token(TokenKind::Identifier, "reversed").is_some() {
            reversed = true;
        } else {
            break;
        }
    }
    no_args(args, "for")?;

    let (body, empty_end) = doc.wrap_until_tag(&["empty", "endfor"])?;
    let empty_body = if body.end_tag == "empty" {
        no_args(&empty_end, "empty")?;
        let (empty, end) = doc.wrap_until_tag(&["endfor"])?;
        no_args(&end, "endfor")?;
        Some(empty)
    } else {
        no_args(&empty_end, "endfor")?;
        None
    };

    Ok(Box::new(ForNode {
        var1: var1.value,
        var2,
        iterable,
        sorted,
        reversed,
        body,
        empty_body,
    }))
}

// ============================================================
// block / extends
// ============================================================

struct BlockNode {
    name: String,
}

impl TagNode for BlockNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let Some(chain) = ctx.state.blocks.get(&self.name).cloned() else {
            return Ok(());
        };
        render_block_chain(&chain, 0, ctx, out)
    }
}

fn tag_block<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(name_tok) = args.match_type(TokenKind::Identifier) else {
        return Err(args.error("expected a block name"));
    };
    no_args(args, "block")?;
    let name = name_tok.value.clone();

    let (wrapper, mut end_args) = doc.wrap_until_tag(&["endblock"])?;
    // `{% endblock name %}` may repeat the block name.
    if let Some(repeat) = end_args.match_type(TokenKind::Identifier) {
        if repeat.value != name {
            return Err(end_args.error(format!(
                "endblock name '{}' does not match block '{name}'",
                repeat.value
            )));
        }
    }
    no_args(&end_args, "endblock")?;

    if doc.blocks.contains_key(&name) {
        return Err(doc
            .error(format!("block '{name}' is already defined in this template"))
            .with_token(&name_tok));
    }
    doc.blocks.insert(name.clone(), Arc::new(wrapper));

    Ok(Box::new(BlockNode { name }))
}

struct ExtendsNode;

impl TagNode for ExtendsNode {
    fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        Ok(())
    }
}

fn tag_extends<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    if doc.parent.is_some() {
        return Err(args.error("this template is already extending another template"));
    }
    if doc.body_started {
        return Err(args.error("extends must be the first construct in the template"));
    }
    let Some(name_tok) = args.match_type(TokenKind::String) else {
        return Err(args.error("expected a quoted template name"));
    };
    no_args(args, "extends")?;
    let parent = doc.load_template(&name_tok.value)?;
    doc.parent = Some(parent);
    Ok(Box::new(ExtendsNode))
}

// ============================================================
// include
// ============================================================

enum IncludeTarget {
    Static(Arc<Template>),
    Dynamic(Expr),
}

struct IncludeNode {
    target: IncludeTarget,
    kwargs: Vec<(String, Expr)>,
    only: bool,
    token: Token,
}

impl TagNode for IncludeNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let template = match &self.target {
            IncludeTarget::Static(t) => Arc::clone(t),
            IncludeTarget::Dynamic(expr) => {
                let name = expr.evaluate(ctx)?.to_display_string();
                let base = ctx.template_name.clone();
                ctx.set
                    .load_sub_template(Some(&base), &name, &[])
                    .map_err(|mut e| {
                        e.sender = "execution".to_string();
                        e.update_from_token(&self.token);
                        e
                    })?
            }
        };

        let mut bound = Vec::with_capacity(self.kwargs.len());
        for (name, expr) in &self.kwargs {
            bound.push((name.clone(), expr.evaluate(ctx)?));
        }

        if self.only {
            let restricted: HashMap<String, Value> = bound.into_iter().collect();
            let saved_public = ctx.replace_public(restricted);
            let saved_private = ctx.replace_private(vec![HashMap::new()]);
            let result = template.render_with_context(ctx, out);
            ctx.replace_public(saved_public);
            ctx.replace_private(saved_private);
            result
        } else {
            ctx.push_scope();
            for (name, value) in bound {
                ctx.set_private(name, value);
            }
            let result = template.render_with_context(ctx, out);
            ctx.pop_scope();
            result
        }
    }
}

fn tag_include<'a>(
    doc: &mut Parser<'a>,
    start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let target = if let Some(name_tok) = args.match_type(TokenKind::String) {
        IncludeTarget::Static(doc.load_template(&name_tok.value)?)
    } else {
        IncludeTarget::Dynamic(args.parse_expression()?)
    };

    let mut kwargs = Vec::new();
    let mut only = false;
    if args.match_token(TokenKind::Identifier, "with").is_some() {
        while let Some(name_tok) = args.match_type(TokenKind::Identifier) {
            if name_tok.value == "only" && args.end() {
                only = true;
                break;
            }
            if args.match_token(TokenKind::Symbol, "=").is_none() {
                return Err(args.error(format!(
                    "expected '=' after keyword '{}'",
                    name_tok.value
                )));
            }
            kwargs.push((name_tok.value, args.parse_expression()?));
        }
        if kwargs.is_empty() && !only {
            return Err(args.error("'with' requires at least one keyword argument"));
        }
    } else if args.match_token(TokenKind::Identifier, "only").is_some() {
        only = true;
    }
    no_args(args, "include")?;

    Ok(Box::new(IncludeNode {
        target,
        kwargs,
        only,
        token: start.clone(),
    }))
}

// ============================================================
// macro / import
// ============================================================

/// A compiled `{% macro %}` definition shared between the defining
/// template, importers and the callable bound at render time.
pub struct MacroDefinition {
    /// The macro name.
    pub name: String,
    /// Positional parameter names, in order.
    pub args: Vec<String>,
    /// Default expressions for parameters that declare one.
    pub defaults: HashMap<String, Expr>,
    /// The macro body.
    pub wrapper: Wrapper,
    /// Whether the macro is importable by other templates.
    pub exported: bool,
    pub(crate) token: Token,
}

/// Wraps a macro definition into a callable template value.
pub(crate) fn macro_value(def: &Arc<MacroDefinition>) -> Value {
    let def = Arc::clone(def);
    Value::function(move |ctx, call_args| invoke_macro(&def, ctx, call_args))
}

fn invoke_macro(
    def: &MacroDefinition,
    ctx: &mut ExecutionContext,
    call_args: &[Value],
) -> Result<Value, Error> {
    if call_args.len() > def.args.len() {
        return Err(Error::new(
            "tag:macro",
            format!(
                "macro '{}' called with {} arguments, at most {} accepted",
                def.name,
                call_args.len(),
                def.args.len()
            ),
        )
        .with_token(&def.token));
    }
    ctx.enter_macro(&def.token)?;
    ctx.push_scope();
    let result = bind_and_render(def, ctx, call_args);
    ctx.pop_scope();
    ctx.leave_macro();
    result.map(Value::safe)
}

fn bind_and_render(
    def: &MacroDefinition,
    ctx: &mut ExecutionContext,
    call_args: &[Value],
) -> Result<String, Error> {
    for (i, name) in def.args.iter().enumerate() {
        let value = match call_args.get(i) {
            Some(v) => v.clone(),
            None => match def.defaults.get(name) {
                Some(default) => default.evaluate(ctx)?,
                None => Value::none(),
            },
        };
        ctx.set_private(name.clone(), value);
    }
    let mut buf = String::new();
    def.wrapper.execute(ctx, &mut buf)?;
    Ok(buf)
}

struct MacroNode {
    def: Arc<MacroDefinition>,
}

impl TagNode for MacroNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        ctx.set_private(self.def.name.clone(), macro_value(&self.def));
        Ok(())
    }
}

fn tag_macro<'a>(
    doc: &mut Parser<'a>,
    start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(name_tok) = args.match_type(TokenKind::Identifier) else {
        return Err(args.error("expected a macro name"));
    };
    if args.match_token(TokenKind::Symbol, "(").is_none() {
        return Err(args.error("expected '(' after macro name"));
    }
    let mut arg_names = Vec::new();
    let mut defaults = HashMap::new();
    loop {
        if args.match_token(TokenKind::Symbol, ")").is_some() {
            break;
        }
        let Some(param) = args.match_type(TokenKind::Identifier) else {
            return Err(args.error("expected a parameter name"));
        };
        if args.match_token(TokenKind::Symbol, "=").is_some() {
            defaults.insert(param.value.clone(), args.parse_expression()?);
        }
        arg_names.push(param.value);
        if args.match_token(TokenKind::Symbol, ",").is_none() {
            if args.match_token(TokenKind::Symbol, ")").is_none() {
                return Err(args.error("expected ',' or ')' in macro parameters"));
            }
            break;
        }
    }
    let exported = args.match_token(TokenKind::Keyword, "export").is_some();
    no_args(args, "macro")?;

    let (wrapper, end_args) = doc.wrap_until_tag(&["endmacro"])?;
    no_args(&end_args, "endmacro")?;

    let def = Arc::new(MacroDefinition {
        name: name_tok.value.clone(),
        args: arg_names,
        defaults,
        wrapper,
        exported,
        token: start.clone(),
    });
    if exported {
        if doc.exported_macros.contains_key(&def.name) {
            return Err(doc
                .error(format!("macro '{}' is already exported", def.name))
                .with_token(&name_tok));
        }
        doc.exported_macros.insert(def.name.clone(), Arc::clone(&def));
    }
    Ok(Box::new(MacroNode { def }))
}

struct ImportNode {
    macros: Vec<(String, Arc<MacroDefinition>)>,
}

impl TagNode for ImportNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        for (alias, def) in &self.macros {
            ctx.set_private(alias.clone(), macro_value(def));
        }
        Ok(())
    }
}

fn tag_import<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(file_tok) = args.match_type(TokenKind::String) else {
        return Err(args.error("expected a quoted template name"));
    };
    let template = doc.load_template(&file_tok.value)?;

    let mut macros = Vec::new();
    loop {
        let Some(macro_tok) = args.match_type(TokenKind::Identifier) else {
            return Err(args.error("expected a macro name to import"));
        };
        let alias = if args.match_token(TokenKind::Keyword, "as").is_some() {
            match args.match_type(TokenKind::Identifier) {
                Some(tok) => tok.value,
                None => return Err(args.error("expected an alias after 'as'")),
            }
        } else {
            macro_tok.value.clone()
        };
        let Some(def) = template.exported_macro(&macro_tok.value) else {
            return Err(args.error(format!(
                "macro '{}' is not exported by '{}'",
                macro_tok.value, file_tok.value
            )));
        };
        macros.push((alias, def));
        if args.match_token(TokenKind::Symbol, ",").is_none() {
            break;
        }
    }
    no_args(args, "import")?;
    Ok(Box::new(ImportNode { macros }))
}

// ============================================================
// with / set
// ============================================================

struct WithNode {
    assignments: Vec<(String, Expr)>,
    body: Wrapper,
}

impl TagNode for WithNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        ctx.push_scope();
        let result = (|| {
            for (name, expr) in &self.assignments {
                let value = expr.evaluate(ctx)?;
                ctx.set_private(name.clone(), value);
            }
            self.body.execute(ctx, out)
        })();
        ctx.pop_scope();
        result
    }
}

fn tag_with<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let mut assignments = Vec::new();

    let new_syntax = args.peek_type(TokenKind::Identifier).is_some()
        && args.peek_n(1).is_some_and(|t| t.is(TokenKind::Symbol, "="));
    if new_syntax {
        while let Some(name_tok) = args.match_type(TokenKind::Identifier) {
            if args.match_token(TokenKind::Symbol, "=").is_none() {
                return Err(args.error(format!("expected '=' after '{}'", name_tok.value)));
            }
            assignments.push((name_tok.value, args.parse_expression()?));
        }
    } else {
        // Legacy `{% with expr as name %}`.
        let expr = args.parse_expression()?;
        if args.match_token(TokenKind::Keyword, "as").is_none() {
            return Err(args.error("expected 'as' or 'name=value' assignments"));
        }
        let Some(name_tok) = args.match_type(TokenKind::Identifier) else {
            return Err(args.error("expected a variable name after 'as'"));
        };
        assignments.push((name_tok.value, expr));
    }
    no_args(args, "with")?;

    if assignments.is_empty() {
        return Err(args.error("'with' requires at least one assignment"));
    }

    let (body, end_args) = doc.wrap_until_tag(&["endwith"])?;
    no_args(&end_args, "endwith")?;
    Ok(Box::new(WithNode { assignments, body }))
}

struct SetNode {
    name: String,
    expr: Expr,
}

impl TagNode for SetNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let value = self.expr.evaluate(ctx)?;
        ctx.set_private(self.name.clone(), value);
        Ok(())
    }
}

fn tag_set<'a>(
    _doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(name_tok) = args.match_type(TokenKind::Identifier) else {
        return Err(args.error("expected a variable name"));
    };
    if args.match_token(TokenKind::Symbol, "=").is_none() {
        return Err(args.error("expected '=' after the variable name"));
    }
    let expr = args.parse_expression()?;
    no_args(args, "set")?;
    Ok(Box::new(SetNode {
        name: name_tok.value,
        expr,
    }))
}

// ============================================================
// autoescape / spaceless
// ============================================================

struct AutoescapeNode {
    enabled: bool,
    body: Wrapper,
}

impl TagNode for AutoescapeNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let saved = ctx.autoescape;
        ctx.autoescape = self.enabled;
        let result = self.body.execute(ctx, out);
        ctx.autoescape = saved;
        result
    }
}

fn tag_autoescape<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(mode) = args.match_one(TokenKind::Identifier, &["on", "off"]) else {
        return Err(args.error("expected 'on' or 'off'"));
    };
    no_args(args, "autoescape")?;
    let (body, end_args) = doc.wrap_until_tag(&["endautoescape"])?;
    no_args(&end_args, "endautoescape")?;
    Ok(Box::new(AutoescapeNode {
        enabled: mode.value == "on",
        body,
    }))
}

fn spaceless_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r">\s+<").unwrap())
}

struct SpacelessNode {
    body: Wrapper,
}

impl TagNode for SpacelessNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let mut buf = String::new();
        self.body.execute(ctx, &mut buf)?;
        let mut collapsed = buf.trim().to_string();
        loop {
            let next = spaceless_re().replace_all(&collapsed, "><").to_string();
            if next == collapsed {
                break;
            }
            collapsed = next;
        }
        out.write_str(&collapsed)
    }
}

fn tag_spaceless<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    no_args(args, "spaceless")?;
    let (body, end_args) = doc.wrap_until_tag(&["endspaceless"])?;
    no_args(&end_args, "endspaceless")?;
    Ok(Box::new(SpacelessNode { body }))
}

// ============================================================
// firstof / cycle / ifchanged
// ============================================================

struct FirstOfNode {
    choices: Vec<Expr>,
}

impl TagNode for FirstOfNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        for expr in &self.choices {
            let value = expr.evaluate(ctx)?;
            if value.is_truthy() {
                return write_value(ctx, out, &value, expr);
            }
        }
        Ok(())
    }
}

fn tag_firstof<'a>(
    _doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let mut choices = Vec::new();
    while !args.end() {
        choices.push(args.parse_expression()?);
    }
    if choices.is_empty() {
        return Err(args.error("'firstof' requires at least one argument"));
    }
    Ok(Box::new(FirstOfNode { choices }))
}

struct CycleNode {
    choices: Vec<Expr>,
    as_name: Option<String>,
    silent: bool,
    key: String,
}

impl TagNode for CycleNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let position = ctx.state.cycles.get(&self.key).copied().unwrap_or(0);
        let expr = &self.choices[position % self.choices.len()];
        let value = expr.evaluate(ctx)?;
        ctx.state.cycles.insert(self.key.clone(), position + 1);
        if let Some(name) = &self.as_name {
            ctx.set_private(name.clone(), value.clone());
        }
        if self.silent {
            return Ok(());
        }
        write_value(ctx, out, &value, expr)
    }
}

fn tag_cycle<'a>(
    doc: &mut Parser<'a>,
    start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let mut choices = Vec::new();
    let mut as_name = None;
    let mut silent = false;
    while !args.end() {
        if args.match_token(TokenKind::Keyword, "as").is_some() {
            let Some(name_tok) = args.match_type(TokenKind::Identifier) else {
                return Err(args.error("expected a variable name after 'as'"));
            };
            as_name = Some(name_tok.value);
            if args.match_token(TokenKind::Identifier, "silent").is_some() {
                silent = true;
            }
            break;
        }
        choices.push(args.parse_expression()?);
    }
    no_args(args, "cycle")?;
    if choices.is_empty() {
        return Err(args.error("'cycle' requires at least one argument"));
    }
    Ok(Box::new(CycleNode {
        choices,
        as_name,
        silent,
        key: state_key(doc, start),
    }))
}

struct IfChangedNode {
    exprs: Vec<Expr>,
    body: Wrapper,
    else_body: Option<Wrapper>,
    key: String,
}

impl TagNode for IfChangedNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let current = if self.exprs.is_empty() {
            let mut buf = String::new();
            self.body.execute(ctx, &mut buf)?;
            buf
        } else {
            let mut parts = Vec::with_capacity(self.exprs.len());
            for expr in &self.exprs {
                parts.push(expr.evaluate(ctx)?.to_display_string());
            }
            parts.join("\u{1}")
        };

        let changed = ctx.state.ifchanged.get(&self.key) != Some(&current);
        if changed {
            ctx.state.ifchanged.insert(self.key.clone(), current.clone());
            if self.exprs.is_empty() {
                out.write_str(&current)
            } else {
                self.body.execute(ctx, out)
            }
        } else if let Some(else_body) = &self.else_body {
            else_body.execute(ctx, out)
        } else {
            Ok(())
        }
    }
}

fn tag_ifchanged<'a>(
    doc: &mut Parser<'a>,
    start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let mut exprs = Vec::new();
    while !args.end() {
        exprs.push(args.parse_expression()?);
    }
    let (body, end_args) = doc.wrap_until_tag(&["else", "endifchanged"])?;
    let else_body = if body.end_tag == "else" {
        no_args(&end_args, "else")?;
        let (else_body, end) = doc.wrap_until_tag(&["endifchanged"])?;
        no_args(&end, "endifchanged")?;
        Some(else_body)
    } else {
        no_args(&end_args, "endifchanged")?;
        None
    };
    Ok(Box::new(IfChangedNode {
        exprs,
        body,
        else_body,
        key: state_key(doc, start),
    }))
}

// ============================================================
// ifequal / ifnotequal (legacy)
// ============================================================

struct IfEqualNode {
    left: Expr,
    right: Expr,
    negate: bool,
    body: Wrapper,
    else_body: Option<Wrapper>,
}

impl TagNode for IfEqualNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let equal = self.left.evaluate(ctx)? == self.right.evaluate(ctx)?;
        if equal != self.negate {
            self.body.execute(ctx, out)
        } else if let Some(else_body) = &self.else_body {
            else_body.execute(ctx, out)
        } else {
            Ok(())
        }
    }
}

fn parse_ifequal<'a>(
    doc: &mut Parser<'a>,
    args: &mut Parser<'a>,
    negate: bool,
    end_tag: &'static str,
) -> Result<Box<dyn TagNode>, Error> {
    let left = args.parse_expression()?;
    let right = args.parse_expression()?;
    no_args(args, if negate { "ifnotequal" } else { "ifequal" })?;
    let (body, end_args) = doc.wrap_until_tag(&["else", end_tag])?;
    let else_body = if body.end_tag == "else" {
        no_args(&end_args, "else")?;
        let (else_body, end) = doc.wrap_until_tag(&[end_tag])?;
        no_args(&end, end_tag)?;
        Some(else_body)
    } else {
        no_args(&end_args, end_tag)?;
        None
    };
    Ok(Box::new(IfEqualNode {
        left,
        right,
        negate,
        body,
        else_body,
    }))
}

fn tag_ifequal<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    parse_ifequal(doc, args, false, "endifequal")
}

fn tag_ifnotequal<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    parse_ifequal(doc, args, true, "endifnotequal")
}

// ============================================================
// widthratio / templatetag
// ============================================================

struct WidthRatioNode {
    current: Expr,
    max: Expr,
    width: Expr,
    as_name: Option<String>,
    token: Token,
}

impl TagNode for WidthRatioNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let read = |expr: &Expr, ctx: &mut ExecutionContext| -> Result<f64, Error> {
            let v = expr.evaluate(ctx)?;
            v.as_float().ok_or_else(|| {
                Error::new("tag:widthratio", "arguments must be numeric").with_token(&self.token)
            })
        };
        let current = read(&self.current, ctx)?;
        let max = read(&self.max, ctx)?;
        let width = read(&self.width, ctx)?;
        if max == 0.0 {
            return Err(Error::new("tag:widthratio", "division by zero").with_token(&self.token));
        }
        let ratio = (current / max * width + 0.5).ceil() as i64;
        if let Some(name) = &self.as_name {
            ctx.set_private(name.clone(), Value::from(ratio));
            Ok(())
        } else {
            out.write_str(&ratio.to_string())
        }
    }
}

fn tag_widthratio<'a>(
    _doc: &mut Parser<'a>,
    start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let current = args.parse_expression()?;
    let max = args.parse_expression()?;
    let width = args.parse_expression()?;
    let as_name = if args.match_token(TokenKind::Keyword, "as").is_some() {
        match args.match_type(TokenKind::Identifier) {
            Some(tok) => Some(tok.value),
            None => return Err(args.error("expected a variable name after 'as'")),
        }
    } else {
        None
    };
    no_args(args, "widthratio")?;
    Ok(Box::new(WidthRatioNode {
        current,
        max,
        width,
        as_name,
        token: start.clone(),
    }))
}

struct TemplateTagNode {
    literal: &'static str,
}

impl TagNode for TemplateTagNode {
    fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        out.write_str(self.literal)
    }
}

fn tag_templatetag<'a>(
    _doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(which) = args.match_type(TokenKind::Identifier) else {
        return Err(args.error("expected a delimiter name"));
    };
    let literal = match which.value.as_str() {
        "openblock" => "{%",
        "closeblock" => "%}",
        "openvariable" => "{{",
        "closevariable" => "}}",
        "openbrace" => "{",
        "closebrace" => "}",
        "opencomment" => "{#",
        "closecomment" => "#}",
        other => {
            return Err(args.error(format!("unknown delimiter name '{other}'")));
        }
    };
    no_args(args, "templatetag")?;
    Ok(Box::new(TemplateTagNode { literal }))
}

// ============================================================
// now / lorem
// ============================================================

struct NowNode {
    format: String,
    fake: bool,
}

impl TagNode for NowNode {
    fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let dt = if self.fake {
            chrono::Utc
                .with_ymd_and_hms(2014, 2, 5, 18, 31, 45)
                .unwrap()
                .fixed_offset()
        } else {
            chrono::Local::now().fixed_offset()
        };
        out.write_str(&django_date_format(&dt, &self.format))
    }
}

fn tag_now<'a>(
    _doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(format_tok) = args.match_type(TokenKind::String) else {
        return Err(args.error("expected a quoted format string"));
    };
    let fake = args.match_token(TokenKind::Identifier, "fake").is_some();
    no_args(args, "now")?;
    Ok(Box::new(NowNode {
        format: format_tok.value,
        fake,
    }))
}

const LOREM_PARAGRAPHS: &[&str] = &[
    "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod tempor incididunt \
     ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud exercitation \
     ullamco laboris nisi ut aliquip ex ea commodo consequat.",
    "Duis aute irure dolor in reprehenderit in voluptate velit esse cillum dolore eu fugiat \
     nulla pariatur. Excepteur sint occaecat cupidatat non proident, sunt in culpa qui officia \
     deserunt mollit anim id est laborum.",
    "Sed ut perspiciatis unde omnis iste natus error sit voluptatem accusantium doloremque \
     laudantium, totam rem aperiam, eaque ipsa quae ab illo inventore veritatis et quasi \
     architecto beatae vitae dicta sunt explicabo.",
];

/// Upper bound on `{% lorem %}` output units.
const LOREM_MAX_COUNT: i64 = 100_000;

struct LoremNode {
    count: i64,
    method: String,
    random: bool,
}

impl TagNode for LoremNode {
    fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        if self.count > LOREM_MAX_COUNT {
            return Err(Error::new(
                "tag:lorem",
                format!("count {} exceeds the maximum of {LOREM_MAX_COUNT}", self.count),
            ));
        }
        let count = self.count.max(0) as usize;
        let text = match self.method.as_str() {
            "w" => {
                let words: Vec<&str> = LOREM_PARAGRAPHS
                    .iter()
                    .flat_map(|p| p.split_whitespace())
                    .collect();
                let chosen: Vec<&str> = if self.random {
                    let mut rng = rand::thread_rng();
                    (0..count)
                        .map(|_| *words.choose(&mut rng).unwrap_or(&"lorem"))
                        .collect()
                } else {
                    words.iter().copied().cycle().take(count).collect()
                };
                chosen.join(" ")
            }
            "p" => paragraphs(count, self.random)
                .into_iter()
                .map(|p| format!("<p>{p}</p>"))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => paragraphs(count, self.random).join("\n\n"),
        };
        out.write_str(&text)
    }
}

fn paragraphs(count: usize, random: bool) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            if random {
                (*LOREM_PARAGRAPHS.choose(&mut rng).unwrap_or(&LOREM_PARAGRAPHS[0])).to_string()
            } else {
                LOREM_PARAGRAPHS[i % LOREM_PARAGRAPHS.len()].to_string()
            }
        })
        .collect()
}

fn tag_lorem<'a>(
    _doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let count = match args.match_type(TokenKind::Integer) {
        Some(tok) => tok
            .value
            .parse::<i64>()
            .map_err(|_| args.error("count out of range"))?,
        None => 1,
    };
    let method = match args.match_one(TokenKind::Identifier, &["w", "p", "b"]) {
        Some(tok) => tok.value,
        None => "b".to_string(),
    };
    let random = args.match_token(TokenKind::Identifier, "random").is_some();
    no_args(args, "lorem")?;
    Ok(Box::new(LoremNode {
        count,
        method,
        random,
    }))
}

// ============================================================
// comment / ssi
// ============================================================

struct CommentNode;

impl TagNode for CommentNode {
    fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        Ok(())
    }
}

fn tag_comment<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    no_args(args, "comment")?;
    doc.skip_until_tag("endcomment")?;
    Ok(Box::new(CommentNode))
}

enum SsiContent {
    Raw(String),
    Parsed(Arc<Template>),
}

struct SsiNode {
    content: SsiContent,
}

impl TagNode for SsiNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        match &self.content {
            SsiContent::Raw(text) => out.write_str(text),
            SsiContent::Parsed(template) => template.render_with_context(ctx, out),
        }
    }
}

fn tag_ssi<'a>(
    doc: &mut Parser<'a>,
    _start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    let Some(file_tok) = args.match_type(TokenKind::String) else {
        return Err(args.error("expected a quoted file name"));
    };
    let parsed = args.match_token(TokenKind::Identifier, "parsed").is_some();
    no_args(args, "ssi")?;
    let content = if parsed {
        SsiContent::Parsed(doc.load_template(&file_tok.value)?)
    } else {
        SsiContent::Raw(doc.load_raw(&file_tok.value)?)
    };
    Ok(Box::new(SsiNode { content }))
}

// ============================================================
// allowmissingval / exec
// ============================================================

/// Shared machinery for `exec` and `allowmissingval`: render the wrapped
/// body into a buffer, re-parse the buffer as a template against the same
/// set, and render the result.
struct ReparseNode {
    body: Wrapper,
    force_allow_missing: bool,
    token: Token,
}

impl TagNode for ReparseNode {
    fn execute(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let saved = ctx.allow_missing_val;
        if self.force_allow_missing {
            ctx.allow_missing_val = true;
        }
        let result = self.render_reparsed(ctx, out);
        ctx.allow_missing_val = saved;
        result
    }
}

impl ReparseNode {
    fn render_reparsed(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let mut buf = String::new();
        self.body.execute(ctx, &mut buf)?;
        let set = ctx.set.clone();
        let template = set.from_string(&buf).map_err(|mut e| {
            e.sender = "execution".to_string();
            e.update_from_token(&self.token);
            e
        })?;
        template.render_with_context(ctx, out)
    }
}

fn tag_allowmissingval<'a>(
    doc: &mut Parser<'a>,
    start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    no_args(args, "allowmissingval")?;
    let (body, end_args) = doc.wrap_until_tag(&["endallowmissingval"])?;
    no_args(&end_args, "endallowmissingval")?;
    Ok(Box::new(ReparseNode {
        body,
        force_allow_missing: true,
        token: start.clone(),
    }))
}

fn tag_exec<'a>(
    doc: &mut Parser<'a>,
    start: &Token,
    args: &mut Parser<'a>,
) -> Result<Box<dyn TagNode>, Error> {
    no_args(args, "exec")?;
    let (body, end_args) = doc.wrap_until_tag(&["endexec"])?;
    no_args(&end_args, "endexec")?;
    Ok(Box::new(ReparseNode {
        body,
        force_allow_missing: false,
        token: start.clone(),
    }))
}
