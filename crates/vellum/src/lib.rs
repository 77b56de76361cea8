//! # vellum
//!
//! A Django-syntax template engine: `{{ variables }}` with filter chains,
//! `{% tags %}` with template inheritance and macros, and `{# comments #}`,
//! compiled once into a node tree and rendered against a per-call context.
//!
//! ## Quick start
//!
//! ```
//! use vellum::{Context, MemoryLoader, TemplateSet, Value};
//!
//! let set = TemplateSet::new("examples", Box::new(MemoryLoader::new()));
//! let template = set.from_string("Hello {{ name|upper }}!").unwrap();
//!
//! let mut ctx = Context::new();
//! ctx.set("name", Value::from("world"));
//! assert_eq!(template.execute(&ctx).unwrap(), "Hello WORLD!");
//! ```
//!
//! ## Template inheritance
//!
//! ```
//! use vellum::{Context, MemoryLoader, TemplateSet};
//!
//! let loader = MemoryLoader::new();
//! loader.add("base.html", "<html>{% block content %}default{% endblock %}</html>");
//! loader.add(
//!     "page.html",
//!     r#"{% extends "base.html" %}{% block content %}Hello!{% endblock %}"#,
//! );
//!
//! let set = TemplateSet::new("site", Box::new(loader));
//! let out = set.render_template_file("page.html", &Context::new()).unwrap();
//! assert_eq!(out, "<html>Hello!</html>");
//! ```
//!
//! ## Custom filters and host objects
//!
//! Filters are `(value, parameter) -> value` functions registered on a set;
//! host data can implement [`Object`] to expose fields and methods to
//! templates without any reflection.
//!
//! Variable output is HTML-escaped by default; the `safe` filter,
//! [`Value::safe`] and `{% autoescape off %}` opt out.

// These clippy lints are intentionally suppressed for this crate:
// - needless_pass_by_value: filter and tag signatures take owned values in
//   several places by design of the registry types
// - cast_possible_truncation/wrap/sign_loss: template values bridge between
//   i64 and usize
// - cast_precision_loss: i64 -> f64 is acceptable for template numerics
#![allow(
    clippy::needless_pass_by_value,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions,
    clippy::missing_const_for_fn,
    clippy::float_cmp,
    clippy::option_if_let_else,
    clippy::similar_names,
    clippy::doc_markdown,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::if_not_else,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::unnecessary_wraps,
    clippy::use_self
)]

pub mod context;
pub mod error;
pub mod expression;
pub mod filters;
pub mod lexer;
pub mod loaders;
pub mod output;
pub mod parser;
pub mod set;
pub mod tags;
pub mod template;
pub mod token;
pub mod value;

// Re-export the most commonly used types.
pub use context::{Context, ExecutionContext};
pub use error::Error;
pub use expression::Expr;
pub use filters::FilterFunction;
pub use loaders::{FileSystemLoader, Loader, MemoryLoader};
pub use output::{IoWriter, TemplateWriter};
pub use parser::{Node, NodeList, Parser, TagNode, Wrapper};
pub use set::{Options, TemplateSet};
pub use tags::TagParseFn;
pub use template::Template;
pub use token::{Token, TokenKind};
pub use value::{escape_html, Object, Value, ValueData};

#[cfg(test)]
mod integration_tests {
    use super::*;

    fn render(source: &str, build: impl FnOnce(&mut Context)) -> String {
        let set = TemplateSet::new("it", Box::new(MemoryLoader::new()));
        let mut ctx = Context::new();
        build(&mut ctx);
        set.render_template_string(source, &ctx).unwrap()
    }

    #[test]
    fn test_forloop_counter_scenario() {
        let out = render(
            "{% for i in items %}{{ forloop.Counter }}:{{ i }} {% endfor %}",
            |ctx| ctx.set("items", Value::from(vec!["a", "b", "c"])),
        );
        assert_eq!(out, "1:a 2:b 3:c ");
    }

    #[test]
    fn test_if_and_not_scenario() {
        let out = render("{% if x and not y %}ok{% endif %}", |ctx| {
            ctx.set("x", Value::from(true));
            ctx.set("y", Value::from(false));
        });
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_escape_scenario() {
        let out = render(r#"{{ "<script>"|escape }}"#, |_| {});
        assert_eq!(out, "&lt;script&gt;");
    }

    #[test]
    fn test_filter_parameter_with_operators() {
        assert_eq!(render("{{ 10|add:2 * 3 }}", |_| {}), "16");
        let out = render("{{ x|add:-1 }}", |ctx| ctx.set("x", Value::from(5i64)));
        assert_eq!(out, "4");
    }

    #[test]
    fn test_autoescape_off_scenario() {
        let out = render(r#"{% autoescape off %}{{ "<b>" }}{% endautoescape %}"#, |_| {});
        assert_eq!(out, "<b>");
    }

    #[test]
    fn test_macro_scenario() {
        let out = render(
            r#"{% macro greet(n="world") %}Hi {{ n }}{% endmacro %}{{ greet() }}|{{ greet("Ada") }}"#,
            |_| {},
        );
        assert_eq!(out, "Hi world|Hi Ada");
    }

    #[test]
    fn test_widthratio_scenario() {
        assert_eq!(render("{% widthratio 50 100 200 %}", |_| {}), "101");
    }

    #[test]
    fn test_spaceless_scenario() {
        let out = render(
            "{% spaceless %}<p>   </p>   <b>ok</b>{% endspaceless %}",
            |_| {},
        );
        assert_eq!(out, "<p></p><b>ok</b>");
    }

    #[test]
    fn test_set_scenario() {
        assert_eq!(render("{% set x = 10 + 5 %}{{ x }}", |_| {}), "15");
    }

    #[test]
    fn test_autoescape_law() {
        // With autoescape on, unsafe variable output is byte-identical to
        // the escape filter's result.
        let set = TemplateSet::new("it", Box::new(MemoryLoader::new()));
        let raw = Value::from(r#"<a href="x">it's &"#);
        let mut ctx = Context::new();
        ctx.set("v", raw.clone());
        let rendered = set.render_template_string("{{ v }}", &ctx).unwrap();
        let filtered = set
            .apply_filter("escape", &raw, &Value::none())
            .unwrap()
            .to_display_string();
        assert_eq!(rendered, filtered);
    }

    #[test]
    fn test_safe_value_never_escaped() {
        let out = render("{{ v }}", |ctx| ctx.set("v", Value::safe("<b>bold</b>")));
        assert_eq!(out, "<b>bold</b>");
    }

    #[test]
    fn test_verbatim_round_trip() {
        let out = render(
            "{% verbatim %}{{ not_rendered }} {% if %}{% endverbatim %}",
            |_| {},
        );
        assert_eq!(out, "{{ not_rendered }} {% if %}");
    }

    #[test]
    fn test_rendered_output_reparses_cleanly() {
        // Rendering with an empty context yields text that is itself a
        // valid template (no delimiter injection).
        let set = TemplateSet::new("it", Box::new(MemoryLoader::new()));
        for source in [
            "plain text",
            "{{ missing }}tail",
            "{% if nope %}x{% endif %}done",
            "{% templatetag openbrace %}ok{% templatetag closebrace %}",
        ] {
            let once = set
                .render_template_string(source, &Context::new())
                .unwrap();
            let twice = set.render_template_string(&once, &Context::new()).unwrap();
            assert_eq!(once, twice, "render of {source:?} is not stable");
        }
    }

    #[test]
    fn test_whole_pipeline_with_inheritance_includes_and_macros() {
        let loader = MemoryLoader::new();
        loader.add(
            "base.html",
            "<title>{% block title %}site{% endblock %}</title>{% block body %}{% endblock %}",
        );
        loader.add("nav.html", "<nav>{{ section }}</nav>");
        loader.add(
            "macros.html",
            "{% macro chip(label) export %}<span>{{ label }}</span>{% endmacro %}",
        );
        loader.add(
            "page.html",
            concat!(
                r#"{% extends "base.html" %}"#,
                r#"{% block title %}{{ block.super }} / shop{% endblock %}"#,
                r#"{% block body %}{% import "macros.html" chip %}"#,
                r#"{% include "nav.html" with section="store" %}"#,
                "{% for p in products %}{{ chip(p) }}{% endfor %}",
                "{% endblock %}"
            ),
        );
        let set = TemplateSet::new("site", Box::new(loader));
        let mut ctx = Context::new();
        ctx.set("products", Value::from(vec!["tea", "jam"]));
        let out = set.render_template_file("page.html", &ctx).unwrap();
        assert_eq!(
            out,
            "<title>site / shop</title><nav>store</nav><span>tea</span><span>jam</span>"
        );
    }
}
