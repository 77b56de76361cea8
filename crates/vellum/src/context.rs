//! Render contexts.
//!
//! [`Context`] is the user-supplied key/value mapping handed to a render.
//! [`ExecutionContext`] is the engine-internal per-render state: a public
//! layer (globals plus the user context), a stack of private scopes (loop
//! variables, `with`/`set` bindings, macros), a shared layer that survives
//! across includes, the render flags, and the keyed side state used by the
//! `cycle` and `ifchanged` tags.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Error;
use crate::parser::Wrapper;
use crate::set::TemplateSet;
use crate::value::Value;

/// Upper bound on recursive macro invocations within one render.
pub(crate) const MAX_MACRO_DEPTH: usize = 1000;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_]+$").unwrap())
}

/// The key/value mapping supplied to a render.
///
/// Keys must match `[A-Za-z0-9_]+`; invalid keys abort the render when it
/// begins.
///
/// # Examples
///
/// ```
/// use vellum::{Context, Value};
///
/// let mut ctx = Context::new();
/// ctx.set("name", Value::from("vellum"));
/// assert_eq!(ctx.get("name").unwrap().to_display_string(), "vellum");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: HashMap<String, Value>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self {
            vars: HashMap::new(),
        }
    }

    /// Sets a variable.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Looks up a variable.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Removes a variable.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.vars.remove(key)
    }

    /// Copies all entries of `other` into this context.
    pub fn update(&mut self, other: &Context) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Returns the number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if no variables are set.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub(crate) fn vars(&self) -> &HashMap<String, Value> {
        &self.vars
    }

    /// Rejects empty keys and keys containing anything outside
    /// `[A-Za-z0-9_]`.
    pub(crate) fn validate_keys(&self) -> Result<(), Error> {
        for key in self.vars.keys() {
            if !identifier_re().is_match(key) {
                return Err(Error::new(
                    "execution",
                    format!("context key '{key}' is not a valid identifier"),
                ));
            }
        }
        Ok(())
    }
}

impl From<HashMap<String, Value>> for Context {
    fn from(vars: HashMap<String, Value>) -> Self {
        Self { vars }
    }
}

/// Per-render side state for tags that remember things between renders of
/// the same node: `cycle` counters, `ifchanged` last-seen values, and the
/// block override chains used by template inheritance.
#[derive(Debug, Default)]
pub(crate) struct RenderState {
    /// `cycle` round-robin positions, keyed by the tag's source position.
    pub cycles: HashMap<String, usize>,
    /// `ifchanged` last-seen values, keyed by the tag's source position.
    pub ifchanged: HashMap<String, String>,
    /// Block override chains, leaf-most first, keyed by block name.
    pub blocks: HashMap<String, Vec<Arc<Wrapper>>>,
}

/// The engine-side state of one render.
///
/// Lookups search the private scope stack top-down, then the public layer,
/// then the shared layer. Private scopes nest: a pushed scope sees
/// everything below it and its own bindings disappear on pop.
pub struct ExecutionContext {
    pub(crate) set: TemplateSet,
    pub(crate) template_name: String,
    public: HashMap<String, Value>,
    private: Vec<HashMap<String, Value>>,
    shared: HashMap<String, Value>,
    /// Whether variable output is HTML-escaped.
    pub autoescape: bool,
    /// Whether nil values render as empty output instead of a marker.
    pub allow_missing_val: bool,
    pub(crate) macro_depth: usize,
    pub(crate) state: RenderState,
}

impl ExecutionContext {
    pub(crate) fn new(
        set: TemplateSet,
        template_name: impl Into<String>,
        public: HashMap<String, Value>,
        autoescape: bool,
        allow_missing_val: bool,
    ) -> Self {
        Self {
            set,
            template_name: template_name.into(),
            public,
            private: vec![HashMap::new()],
            shared: HashMap::new(),
            autoescape,
            allow_missing_val,
            macro_depth: 0,
            state: RenderState::default(),
        }
    }

    /// Looks up a name: private scopes (innermost first), then public,
    /// then shared.
    pub fn get(&self, name: &str) -> Option<Value> {
        for scope in self.private.iter().rev() {
            if let Some(v) = scope.get(name) {
                return Some(v.clone());
            }
        }
        if let Some(v) = self.public.get(name) {
            return Some(v.clone());
        }
        self.shared.get(name).cloned()
    }

    /// Binds a name in the innermost private scope.
    pub fn set_private(&mut self, name: impl Into<String>, value: Value) {
        if let Some(top) = self.private.last_mut() {
            top.insert(name.into(), value);
        }
    }

    /// Binds a name in the shared layer, which persists across includes.
    pub fn set_shared(&mut self, name: impl Into<String>, value: Value) {
        self.shared.insert(name.into(), value);
    }

    /// Opens a fresh private scope.
    pub fn push_scope(&mut self) {
        self.private.push(HashMap::new());
    }

    /// Closes the innermost private scope. The outermost scope is never
    /// popped.
    pub fn pop_scope(&mut self) {
        if self.private.len() > 1 {
            self.private.pop();
        }
    }

    /// Swaps in a new public layer, returning the old one. Used by
    /// `{% include ... only %}` to restrict the visible context.
    pub(crate) fn replace_public(&mut self, public: HashMap<String, Value>) -> HashMap<String, Value> {
        std::mem::replace(&mut self.public, public)
    }

    /// Swaps out the whole private scope stack. Used by
    /// `{% include ... only %}` so loop variables and locals do not leak
    /// into the included template.
    pub(crate) fn replace_private(
        &mut self,
        private: Vec<HashMap<String, Value>>,
    ) -> Vec<HashMap<String, Value>> {
        std::mem::replace(&mut self.private, private)
    }

    pub(crate) fn enter_macro(&mut self, token: &crate::token::Token) -> Result<(), Error> {
        self.macro_depth += 1;
        if self.macro_depth > MAX_MACRO_DEPTH {
            return Err(Error::new(
                "tag:macro",
                "maximum recursive macro call depth reached",
            )
            .with_token(token)
            .with_filename(self.template_name.clone()));
        }
        Ok(())
    }

    pub(crate) fn leave_macro(&mut self) {
        self.macro_depth = self.macro_depth.saturating_sub(1);
    }
}
