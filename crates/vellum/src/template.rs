//! Compiled templates.
//!
//! A [`Template`] owns the node tree produced by one compilation: the
//! document body, the blocks it defines, the macros it exports and, when it
//! `{% extends %}` another template, a reference to the compiled parent.
//! Compiled templates are shared immutably across renders.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::context::{Context, ExecutionContext};
use crate::error::Error;
use crate::lexer;
use crate::output::TemplateWriter;
use crate::parser::{NodeList, Parser, Wrapper};
use crate::set::{Options, TemplateSet};
use crate::tags::MacroDefinition;
use crate::value::Value;

/// A compiled template.
pub struct Template {
    set: TemplateSet,
    name: String,
    source: String,
    root: NodeList,
    parent: Option<Arc<Template>>,
    blocks: HashMap<String, Arc<Wrapper>>,
    exported_macros: HashMap<String, Arc<MacroDefinition>>,
    options: Options,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template").field("name", &self.name).finish()
    }
}

impl Template {
    /// Lexes and parses `source` into a compiled template owned by `set`.
    ///
    /// `ancestors` carries the canonical names of templates already being
    /// compiled further up the stack, for cycle detection.
    pub(crate) fn compile(
        set: &TemplateSet,
        name: &str,
        source: &str,
        ancestors: Vec<String>,
    ) -> Result<Arc<Self>, Error> {
        let options = set.options();
        let tokens = lexer::tokenize(name, source, options)?;
        let mut parser = Parser::new(set, name, tokens, ancestors);
        let root = parser.parse_document()?;
        tracing::debug!(template = name, "compiled template");
        Ok(Arc::new(Self {
            set: set.clone(),
            name: name.to_string(),
            source: source.to_string(),
            root,
            parent: parser.parent.take(),
            blocks: std::mem::take(&mut parser.blocks),
            exported_macros: std::mem::take(&mut parser.exported_macros),
            options,
        }))
    }

    /// The template's canonical name (`<string>` for string templates).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The compile-time options this template was built with.
    pub fn options(&self) -> Options {
        self.options
    }

    pub(crate) fn exported_macro(&self, name: &str) -> Option<Arc<MacroDefinition>> {
        self.exported_macros.get(name).cloned()
    }

    /// Renders with the given context into a fresh string.
    pub fn execute(&self, ctx: &Context) -> Result<String, Error> {
        let mut out = String::new();
        self.execute_writer(ctx, &mut out)?;
        Ok(out)
    }

    /// Renders with the given context, streaming into `out`. On error the
    /// sink may already contain partial output.
    pub fn execute_writer(
        &self,
        ctx: &Context,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let mut ec = self.new_execution_context(ctx)?;
        self.render_with_context(&mut ec, out)
    }

    /// Renders only the named blocks (all blocks when `names` is empty),
    /// applying the full inheritance chain, and returns them by name.
    pub fn execute_blocks(
        &self,
        ctx: &Context,
        names: &[&str],
    ) -> Result<HashMap<String, String>, Error> {
        let mut ec = self.new_execution_context(ctx)?;
        ec.state.blocks = self.block_chains();

        let wanted: Vec<String> = if names.is_empty() {
            ec.state.blocks.keys().cloned().collect()
        } else {
            names.iter().map(|n| (*n).to_string()).collect()
        };

        let mut rendered = HashMap::new();
        for name in wanted {
            if let Some(chain) = ec.state.blocks.get(&name).cloned() {
                let mut buf = String::new();
                render_block_chain(&chain, 0, &mut ec, &mut buf)?;
                rendered.insert(name, buf);
            }
        }
        Ok(rendered)
    }

    /// Renders this template (applying its own inheritance chain) inside an
    /// existing render, as `include`, `ssi parsed` and `exec` do.
    pub(crate) fn render_with_context(
        &self,
        ctx: &mut ExecutionContext,
        out: &mut dyn TemplateWriter,
    ) -> Result<(), Error> {
        let saved_blocks = std::mem::replace(&mut ctx.state.blocks, self.block_chains());
        let saved_name = std::mem::replace(&mut ctx.template_name, self.name.clone());
        let result = self.root_ancestor().root.execute(ctx, out);
        ctx.state.blocks = saved_blocks;
        ctx.template_name = saved_name;
        result.map_err(|e| e.with_filename(self.name.clone()))
    }

    fn new_execution_context(&self, ctx: &Context) -> Result<ExecutionContext, Error> {
        ctx.validate_keys()
            .map_err(|e| e.with_filename(self.name.clone()))?;
        let mut public = self.set.globals_snapshot();
        for (k, v) in ctx.vars() {
            public.insert(k.clone(), v.clone());
        }
        if self.set.debug() {
            tracing::debug!(template = %self.name, "rendering template");
        }
        Ok(ExecutionContext::new(
            self.set.clone(),
            self.name.clone(),
            public,
            self.set.autoescape_default(),
            self.set.allow_missing_default(),
        ))
    }

    /// The ancestor whose node tree is actually rendered: the template at
    /// the top of the `extends` chain.
    fn root_ancestor(&self) -> &Template {
        let mut current = self;
        while let Some(parent) = &current.parent {
            current = parent;
        }
        current
    }

    /// Collects the block override chains for the whole inheritance chain,
    /// leaf-most body first.
    fn block_chains(&self) -> HashMap<String, Vec<Arc<Wrapper>>> {
        let mut chains: HashMap<String, Vec<Arc<Wrapper>>> = HashMap::new();
        let mut current = Some(self);
        while let Some(template) = current {
            for (name, wrapper) in &template.blocks {
                chains
                    .entry(name.clone())
                    .or_default()
                    .push(Arc::clone(wrapper));
            }
            current = template.parent.as_deref();
        }
        chains
    }
}

/// Renders `chain[idx]` with `block.super` bound to the rendered content of
/// the rest of the chain.
pub(crate) fn render_block_chain(
    chain: &[Arc<Wrapper>],
    idx: usize,
    ctx: &mut ExecutionContext,
    out: &mut dyn TemplateWriter,
) -> Result<(), Error> {
    let Some(wrapper) = chain.get(idx) else {
        return Ok(());
    };
    if idx + 1 < chain.len() {
        let mut super_buf = String::new();
        render_block_chain(chain, idx + 1, ctx, &mut super_buf)?;
        ctx.push_scope();
        let mut block = BTreeMap::new();
        block.insert("super".to_string(), Value::safe(super_buf));
        ctx.set_private("block", Value::from(block));
        let result = wrapper.execute(ctx, out);
        ctx.pop_scope();
        result
    } else {
        wrapper.execute(ctx, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loaders::MemoryLoader;

    fn set_with(templates: &[(&str, &str)]) -> TemplateSet {
        let loader = MemoryLoader::new();
        for (name, source) in templates {
            loader.add(*name, *source);
        }
        TemplateSet::new("test", Box::new(loader))
    }

    #[test]
    fn test_basic_inheritance() {
        let set = set_with(&[
            ("base.html", "A{% block content %}default{% endblock %}Z"),
            (
                "child.html",
                r#"{% extends "base.html" %}{% block content %}override{% endblock %}"#,
            ),
        ]);
        let tpl = set.from_cache("child.html").unwrap();
        assert_eq!(tpl.execute(&Context::new()).unwrap(), "AoverrideZ");
    }

    #[test]
    fn test_inheritance_default_content() {
        let set = set_with(&[
            ("base.html", "A{% block content %}default{% endblock %}Z"),
            ("child.html", r#"{% extends "base.html" %}"#),
        ]);
        let tpl = set.from_cache("child.html").unwrap();
        assert_eq!(tpl.execute(&Context::new()).unwrap(), "AdefaultZ");
    }

    #[test]
    fn test_block_super() {
        let set = set_with(&[
            ("base.html", "{% block content %}parent{% endblock %}"),
            (
                "child.html",
                r#"{% extends "base.html" %}{% block content %}{{ block.super }}-child{% endblock %}"#,
            ),
        ]);
        let tpl = set.from_cache("child.html").unwrap();
        assert_eq!(tpl.execute(&Context::new()).unwrap(), "parent-child");
    }

    #[test]
    fn test_multi_level_inheritance() {
        let set = set_with(&[
            ("a.html", "[{% block x %}a{% endblock %}]"),
            (
                "b.html",
                r#"{% extends "a.html" %}{% block x %}b({{ block.super }}){% endblock %}"#,
            ),
            (
                "c.html",
                r#"{% extends "b.html" %}{% block x %}c({{ block.super }}){% endblock %}"#,
            ),
        ]);
        let tpl = set.from_cache("c.html").unwrap();
        assert_eq!(tpl.execute(&Context::new()).unwrap(), "[c(b(a))]");
    }

    #[test]
    fn test_extends_must_be_first() {
        let set = set_with(&[("base.html", "B")]);
        let err = set
            .from_string(r#"{{ x }}{% extends "base.html" %}"#)
            .unwrap_err();
        assert!(err.message.contains("first"));
    }

    #[test]
    fn test_text_before_extends_is_allowed() {
        let set = set_with(&[("base.html", "B")]);
        let tpl = set
            .from_string("  \n{% extends \"base.html\" %}")
            .unwrap();
        assert_eq!(tpl.execute(&Context::new()).unwrap(), "B");
    }

    #[test]
    fn test_extends_cycle_detected() {
        let set = set_with(&[
            ("a.html", r#"{% extends "b.html" %}"#),
            ("b.html", r#"{% extends "a.html" %}"#),
        ]);
        let err = set.from_cache("a.html").unwrap_err();
        assert!(err.message.contains("circular"));
    }

    #[test]
    fn test_duplicate_block_is_error() {
        let set = set_with(&[]);
        let err = set
            .from_string("{% block a %}{% endblock %}{% block a %}{% endblock %}")
            .unwrap_err();
        assert!(err.message.contains("already defined"));
    }

    #[test]
    fn test_execute_blocks() {
        let set = set_with(&[
            (
                "base.html",
                "{% block head %}H{% endblock %}{% block body %}B{% endblock %}",
            ),
            (
                "child.html",
                r#"{% extends "base.html" %}{% block body %}B2{% endblock %}"#,
            ),
        ]);
        let tpl = set.from_cache("child.html").unwrap();
        let blocks = tpl.execute_blocks(&Context::new(), &["head", "body"]).unwrap();
        assert_eq!(blocks["head"], "H");
        assert_eq!(blocks["body"], "B2");

        let all = tpl.execute_blocks(&Context::new(), &[]).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_execute_writer_streams() {
        let set = set_with(&[]);
        let tpl = set.from_string("a{{ 1 + 1 }}c").unwrap();
        let mut buf = Vec::new();
        tpl.execute_writer(&Context::new(), &mut buf).unwrap();
        assert_eq!(buf, b"a2c");
    }

    #[test]
    fn test_invalid_context_key_aborts() {
        let set = set_with(&[]);
        let tpl = set.from_string("x").unwrap();
        let mut ctx = Context::new();
        ctx.set("bad key", Value::from(1i64));
        let err = tpl.execute(&ctx).unwrap_err();
        assert!(err.message.contains("not a valid identifier"));
    }

    #[test]
    fn test_source_and_name_preserved() {
        let set = set_with(&[("t.html", "hello")]);
        let tpl = set.from_cache("t.html").unwrap();
        assert_eq!(tpl.name(), "t.html");
        assert_eq!(tpl.source(), "hello");
    }
}
