//! The template set.
//!
//! A [`TemplateSet`] owns everything templates are compiled against: the
//! loader list, the filter and tag tables, the sandbox ban lists, the
//! compiled-template cache, the globals and the compile-time options. The
//! handle is cheap to clone and safe to share across threads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::context::Context;
use crate::error::Error;
use crate::filters::{self, FilterFunction};
use crate::loaders::Loader;
use crate::parser::{Parser, TagNode};
use crate::tags::{self, TagParseFn};
use crate::template::Template;
use crate::token::Token;
use crate::value::Value;

/// Compile-time whitespace options, snapshotted per compiled template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Remove the single newline immediately following a `{% ... %}`.
    pub trim_blocks: bool,
    /// Strip leading whitespace on lines that only lead up to a
    /// `{% ... %}`.
    pub lstrip_blocks: bool,
}

struct SetInner {
    name: String,
    loaders: RwLock<Vec<Box<dyn Loader>>>,
    filters: RwLock<HashMap<String, FilterFunction>>,
    tags: RwLock<HashMap<String, TagParseFn>>,
    banned_tags: RwLock<HashSet<String>>,
    banned_filters: RwLock<HashSet<String>>,
    /// Once any template has compiled, the ban lists are frozen.
    first_template_created: AtomicBool,
    cache: RwLock<HashMap<String, Arc<Template>>>,
    /// Held across cache-miss compilation so concurrent `from_cache`
    /// callers are serialized. Nested compilations (extends, include)
    /// only touch the cache `RwLock`.
    compile_lock: Mutex<()>,
    globals: RwLock<HashMap<String, Value>>,
    debug: AtomicBool,
    autoescape: AtomicBool,
    allow_missing_val: AtomicBool,
    options: RwLock<Options>,
}

/// The owning registry of loaders, filters, tags, globals and compiled
/// templates.
///
/// # Examples
///
/// ```
/// use vellum::{Context, MemoryLoader, TemplateSet, Value};
///
/// let set = TemplateSet::new("web", Box::new(MemoryLoader::new()));
/// let mut ctx = Context::new();
/// ctx.set("name", Value::from("world"));
///
/// let out = set
///     .render_template_string("Hello {{ name|capfirst }}!", &ctx)
///     .unwrap();
/// assert_eq!(out, "Hello World!");
/// ```
#[derive(Clone)]
pub struct TemplateSet {
    inner: Arc<SetInner>,
}

impl TemplateSet {
    /// Creates a set with one loader, seeded with the builtin filters and
    /// tags.
    pub fn new(name: impl Into<String>, loader: Box<dyn Loader>) -> Self {
        let mut filter_table = HashMap::new();
        filters::register_builtins(&mut filter_table);
        let mut tag_table = HashMap::new();
        tags::register_builtins(&mut tag_table);
        Self {
            inner: Arc::new(SetInner {
                name: name.into(),
                loaders: RwLock::new(vec![loader]),
                filters: RwLock::new(filter_table),
                tags: RwLock::new(tag_table),
                banned_tags: RwLock::new(HashSet::new()),
                banned_filters: RwLock::new(HashSet::new()),
                first_template_created: AtomicBool::new(false),
                cache: RwLock::new(HashMap::new()),
                compile_lock: Mutex::new(()),
                globals: RwLock::new(HashMap::new()),
                debug: AtomicBool::new(false),
                autoescape: AtomicBool::new(true),
                allow_missing_val: AtomicBool::new(true),
                options: RwLock::new(Options::default()),
            }),
        }
    }

    /// The set's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Appends a loader; loaders are consulted in registration order.
    pub fn add_loader(&self, loader: Box<dyn Loader>) {
        self.inner.loaders.write().unwrap().push(loader);
    }

    // ── Compilation ──────────────────────────────────────────────────

    /// Compiles a template from a source string. String templates are
    /// named `<string>` and are not cached.
    pub fn from_string(&self, source: &str) -> Result<Arc<Template>, Error> {
        self.mark_first_template();
        Template::compile(self, "<string>", source, Vec::new())
    }

    /// Resolves, loads and compiles a template by name, bypassing the
    /// cache.
    pub fn from_file(&self, name: &str) -> Result<Arc<Template>, Error> {
        self.mark_first_template();
        let (canonical, source) = self.load_source(None, name)?;
        Template::compile(self, &canonical, &source, vec![canonical.clone()])
    }

    /// Returns the cached compilation of `name`, compiling on a miss. In
    /// debug mode every call recompiles and replaces the cache entry.
    pub fn from_cache(&self, name: &str) -> Result<Arc<Template>, Error> {
        self.mark_first_template();

        if !self.debug() {
            if let Some(hit) = self.cache_lookup(name) {
                return Ok(hit);
            }
        }

        let _guard = self.inner.compile_lock.lock().unwrap();
        if !self.debug() {
            // A racing caller may have compiled while this one waited.
            if let Some(hit) = self.cache_lookup(name) {
                return Ok(hit);
            }
        }

        let (canonical, source) = self.load_source(None, name)?;
        tracing::debug!(template = %canonical, set = %self.inner.name, "cache miss, compiling");
        let template = Template::compile(self, &canonical, &source, vec![canonical.clone()])?;
        self.inner
            .cache
            .write()
            .unwrap()
            .insert(canonical, Arc::clone(&template));
        Ok(template)
    }

    /// Compiles and renders a source string in one step.
    pub fn render_template_string(&self, source: &str, ctx: &Context) -> Result<String, Error> {
        self.from_string(source)?.execute(ctx)
    }

    /// Loads (through the cache) and renders a named template.
    pub fn render_template_file(&self, name: &str, ctx: &Context) -> Result<String, Error> {
        self.from_cache(name)?.execute(ctx)
    }

    /// Drops cached compilations. An empty `names` slice clears the whole
    /// cache.
    pub fn clean_cache(&self, names: &[&str]) {
        let mut cache = self.inner.cache.write().unwrap();
        if names.is_empty() {
            cache.clear();
            return;
        }
        let loaders = self.inner.loaders.read().unwrap();
        for name in names {
            cache.remove(*name);
            for loader in loaders.iter() {
                cache.remove(&loader.resolve(None, name));
            }
        }
    }

    fn cache_lookup(&self, name: &str) -> Option<Arc<Template>> {
        let cache = self.inner.cache.read().unwrap();
        if let Some(hit) = cache.get(name) {
            return Some(Arc::clone(hit));
        }
        let loaders = self.inner.loaders.read().unwrap();
        for loader in loaders.iter() {
            if let Some(hit) = cache.get(&loader.resolve(None, name)) {
                return Some(Arc::clone(hit));
            }
        }
        None
    }

    /// Resolves `name` (relative to `base`) through the loaders and reads
    /// its source. Returns the canonical name together with the source.
    pub(crate) fn load_source(
        &self,
        base: Option<&str>,
        name: &str,
    ) -> Result<(String, String), Error> {
        let loaders = self.inner.loaders.read().unwrap();
        let mut last_error = None;
        for loader in loaders.iter() {
            let canonical = loader.resolve(base, name);
            match loader.load(&canonical) {
                Ok(source) => return Ok((canonical, source)),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::new("loader", format!("template '{name}' not found"))))
    }

    /// Loads and compiles a template referenced from another template
    /// (`extends`, `include`, `import`, `ssi parsed`), caching the result
    /// and detecting reference cycles.
    pub(crate) fn load_sub_template(
        &self,
        base: Option<&str>,
        name: &str,
        ancestors: &[String],
    ) -> Result<Arc<Template>, Error> {
        let (canonical, source) = self.load_source(base, name)?;
        if ancestors.contains(&canonical) {
            return Err(Error::new(
                "parser",
                format!("circular template reference involving '{canonical}'"),
            ));
        }
        if !self.debug() {
            if let Some(hit) = self.inner.cache.read().unwrap().get(&canonical) {
                return Ok(Arc::clone(hit));
            }
        }
        let mut chain = ancestors.to_vec();
        chain.push(canonical.clone());
        let template = Template::compile(self, &canonical, &source, chain)?;
        self.inner
            .cache
            .write()
            .unwrap()
            .insert(canonical, Arc::clone(&template));
        Ok(template)
    }

    fn mark_first_template(&self) {
        self.inner
            .first_template_created
            .store(true, Ordering::SeqCst);
    }

    // ── Filters ──────────────────────────────────────────────────────

    /// Registers a filter. Fails if the name is taken.
    pub fn register_filter<F>(&self, name: &str, f: F) -> Result<(), Error>
    where
        F: Fn(&Value, &Value) -> Result<Value, Error> + Send + Sync + 'static,
    {
        let mut table = self.inner.filters.write().unwrap();
        if table.contains_key(name) {
            return Err(Error::new(
                "parser",
                format!("filter '{name}' is already registered"),
            ));
        }
        table.insert(name.to_string(), Arc::new(f));
        Ok(())
    }

    /// Replaces an existing filter. Fails if the name is unknown.
    pub fn replace_filter<F>(&self, name: &str, f: F) -> Result<(), Error>
    where
        F: Fn(&Value, &Value) -> Result<Value, Error> + Send + Sync + 'static,
    {
        let mut table = self.inner.filters.write().unwrap();
        if !table.contains_key(name) {
            return Err(Error::new(
                "parser",
                format!("filter '{name}' does not exist and cannot be replaced"),
            ));
        }
        table.insert(name.to_string(), Arc::new(f));
        Ok(())
    }

    /// Whether a filter with this name is registered.
    pub fn filter_exists(&self, name: &str) -> bool {
        self.inner.filters.read().unwrap().contains_key(name)
    }

    /// Applies a registered filter to a value.
    pub fn apply_filter(&self, name: &str, value: &Value, param: &Value) -> Result<Value, Error> {
        let Some(f) = self.filter_function(name) else {
            return Err(Error::new(
                "parser",
                format!("filter '{name}' does not exist"),
            ));
        };
        f(value, param).map_err(|mut e| {
            if !e.sender.starts_with("filter:") {
                e.sender = format!("filter:{name}");
            }
            e
        })
    }

    /// Like [`TemplateSet::apply_filter`] but panics on failure.
    ///
    /// # Panics
    ///
    /// Panics if the filter does not exist or reports an error.
    pub fn must_apply_filter(&self, name: &str, value: &Value, param: &Value) -> Value {
        match self.apply_filter(name, value, param) {
            Ok(v) => v,
            Err(e) => panic!("must_apply_filter({name}): {e}"),
        }
    }

    pub(crate) fn filter_function(&self, name: &str) -> Option<FilterFunction> {
        self.inner.filters.read().unwrap().get(name).cloned()
    }

    // ── Tags ─────────────────────────────────────────────────────────

    /// Registers a tag parser. Fails if the name is taken.
    pub fn register_tag<F>(&self, name: &str, f: F) -> Result<(), Error>
    where
        F: for<'a> Fn(&mut Parser<'a>, &Token, &mut Parser<'a>) -> Result<Box<dyn TagNode>, Error>
            + Send
            + Sync
            + 'static,
    {
        let mut table = self.inner.tags.write().unwrap();
        if table.contains_key(name) {
            return Err(Error::new(
                "parser",
                format!("tag '{name}' is already registered"),
            ));
        }
        table.insert(name.to_string(), Arc::new(f));
        Ok(())
    }

    /// Replaces an existing tag parser. Fails if the name is unknown.
    pub fn replace_tag<F>(&self, name: &str, f: F) -> Result<(), Error>
    where
        F: for<'a> Fn(&mut Parser<'a>, &Token, &mut Parser<'a>) -> Result<Box<dyn TagNode>, Error>
            + Send
            + Sync
            + 'static,
    {
        let mut table = self.inner.tags.write().unwrap();
        if !table.contains_key(name) {
            return Err(Error::new(
                "parser",
                format!("tag '{name}' does not exist and cannot be replaced"),
            ));
        }
        table.insert(name.to_string(), Arc::new(f));
        Ok(())
    }

    /// Whether a tag with this name is registered.
    pub fn tag_exists(&self, name: &str) -> bool {
        self.inner.tags.read().unwrap().contains_key(name)
    }

    pub(crate) fn tag_function(&self, name: &str) -> Option<TagParseFn> {
        self.inner.tags.read().unwrap().get(name).cloned()
    }

    // ── Sandbox bans ─────────────────────────────────────────────────

    /// Forbids a tag. Only allowed before the first template compiles.
    pub fn ban_tag(&self, name: &str) -> Result<(), Error> {
        if self.inner.first_template_created.load(Ordering::SeqCst) {
            return Err(Error::new(
                "parser",
                "tags cannot be banned after a template has been compiled",
            ));
        }
        self.inner
            .banned_tags
            .write()
            .unwrap()
            .insert(name.to_string());
        Ok(())
    }

    /// Forbids a filter. Only allowed before the first template compiles.
    pub fn ban_filter(&self, name: &str) -> Result<(), Error> {
        if self.inner.first_template_created.load(Ordering::SeqCst) {
            return Err(Error::new(
                "parser",
                "filters cannot be banned after a template has been compiled",
            ));
        }
        self.inner
            .banned_filters
            .write()
            .unwrap()
            .insert(name.to_string());
        Ok(())
    }

    pub(crate) fn is_tag_banned(&self, name: &str) -> bool {
        self.inner.banned_tags.read().unwrap().contains(name)
    }

    pub(crate) fn is_filter_banned(&self, name: &str) -> bool {
        self.inner.banned_filters.read().unwrap().contains(name)
    }

    // ── Globals and flags ────────────────────────────────────────────

    /// Sets a global visible to every render of this set's templates.
    pub fn add_global(&self, name: impl Into<String>, value: Value) {
        self.inner.globals.write().unwrap().insert(name.into(), value);
    }

    pub(crate) fn globals_snapshot(&self) -> HashMap<String, Value> {
        self.inner.globals.read().unwrap().clone()
    }

    /// Enables debug mode: renders log through `tracing` and `from_cache`
    /// recompiles on every call.
    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug.store(enabled, Ordering::SeqCst);
    }

    /// Whether debug mode is on.
    pub fn debug(&self) -> bool {
        self.inner.debug.load(Ordering::SeqCst)
    }

    /// Sets the default ambient auto-escape flag for new renders.
    pub fn set_autoescape(&self, enabled: bool) {
        self.inner.autoescape.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn autoescape_default(&self) -> bool {
        self.inner.autoescape.load(Ordering::SeqCst)
    }

    /// When disabled, nil variable output renders as `<no value>` instead
    /// of an empty string.
    pub fn set_allow_missing_val(&self, enabled: bool) {
        self.inner.allow_missing_val.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn allow_missing_default(&self) -> bool {
        self.inner.allow_missing_val.load(Ordering::SeqCst)
    }

    /// Sets the compile-time whitespace options. Templates compiled
    /// earlier keep the options they were built with.
    pub fn set_options(&self, options: Options) {
        *self.inner.options.write().unwrap() = options;
    }

    /// The current compile-time options.
    pub fn options(&self) -> Options {
        *self.inner.options.read().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loaders::MemoryLoader;

    fn new_set() -> (TemplateSet, MemoryLoaderHandle) {
        let loader = MemoryLoader::new();
        let handle = MemoryLoaderHandle(loader.clone());
        (TemplateSet::new("test", Box::new(loader)), handle)
    }

    struct MemoryLoaderHandle(MemoryLoader);

    impl MemoryLoaderHandle {
        fn add(&self, name: &str, source: &str) {
            self.0.add(name, source);
        }
    }

    #[test]
    fn test_render_template_string() {
        let (set, _) = new_set();
        let mut ctx = Context::new();
        ctx.set("name", Value::from("vellum"));
        assert_eq!(
            set.render_template_string("hi {{ name }}", &ctx).unwrap(),
            "hi vellum"
        );
    }

    #[test]
    fn test_render_template_file() {
        let (set, files) = new_set();
        files.add("index.html", "number {{ 41 + 1 }}");
        assert_eq!(
            set.render_template_file("index.html", &Context::new())
                .unwrap(),
            "number 42"
        );
    }

    #[test]
    fn test_from_cache_reuses_compilation() {
        let (set, files) = new_set();
        files.add("t.html", "x");
        let a = set.from_cache("t.html").unwrap();
        let b = set.from_cache("t.html").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_clean_cache_recompiles() {
        let (set, files) = new_set();
        files.add("t.html", "x");
        let a = set.from_cache("t.html").unwrap();
        set.clean_cache(&["t.html"]);
        let b = set.from_cache("t.html").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(
            a.execute(&Context::new()).unwrap(),
            b.execute(&Context::new()).unwrap()
        );
    }

    #[test]
    fn test_clean_cache_all() {
        let (set, files) = new_set();
        files.add("t.html", "x");
        let a = set.from_cache("t.html").unwrap();
        set.clean_cache(&[]);
        let b = set.from_cache("t.html").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_debug_mode_bypasses_cache() {
        let (set, files) = new_set();
        files.add("t.html", "x");
        set.set_debug(true);
        let a = set.from_cache("t.html").unwrap();
        let b = set.from_cache("t.html").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_register_filter_twice_fails() {
        let (set, _) = new_set();
        set.register_filter("shout", |v, _| {
            Ok(Value::from(format!("{}!", v.to_display_string())))
        })
        .unwrap();
        assert!(set
            .register_filter("shout", |v, _| Ok(v.clone()))
            .is_err());
        // Builtins count as taken names too.
        assert!(set.register_filter("upper", |v, _| Ok(v.clone())).is_err());
    }

    #[test]
    fn test_custom_filter_usable_in_templates() {
        let (set, _) = new_set();
        set.register_filter("shout", |v, _| {
            Ok(Value::from(format!("{}!", v.to_display_string())))
        })
        .unwrap();
        assert_eq!(
            set.render_template_string("{{ \"hey\"|shout }}", &Context::new())
                .unwrap(),
            "hey!"
        );
    }

    #[test]
    fn test_replace_filter() {
        let (set, _) = new_set();
        assert!(set.replace_filter("nope", |v, _| Ok(v.clone())).is_err());
        set.replace_filter("upper", |_, _| Ok(Value::from("always")))
            .unwrap();
        assert_eq!(
            set.render_template_string("{{ \"x\"|upper }}", &Context::new())
                .unwrap(),
            "always"
        );
    }

    #[test]
    fn test_replacing_filter_does_not_affect_compiled_templates() {
        let (set, _) = new_set();
        let tpl = set.from_string("{{ \"x\"|upper }}").unwrap();
        set.replace_filter("upper", |_, _| Ok(Value::from("changed")))
            .unwrap();
        // The node captured the function at parse time.
        assert_eq!(tpl.execute(&Context::new()).unwrap(), "X");
        // Newly compiled templates see the replacement.
        assert_eq!(
            set.render_template_string("{{ \"x\"|upper }}", &Context::new())
                .unwrap(),
            "changed"
        );
    }

    #[test]
    fn test_apply_filter() {
        let (set, _) = new_set();
        assert_eq!(
            set.apply_filter("upper", &Value::from("ab"), &Value::none())
                .unwrap()
                .to_display_string(),
            "AB"
        );
        assert!(set
            .apply_filter("does_not_exist", &Value::from("ab"), &Value::none())
            .is_err());
    }

    #[test]
    fn test_must_apply_filter_panics() {
        let (set, _) = new_set();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            set.must_apply_filter("does_not_exist", &Value::from("x"), &Value::none())
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_register_tag() {
        let (set, _) = new_set();
        struct HelloNode;
        impl TagNode for HelloNode {
            fn execute(
                &self,
                _ctx: &mut crate::context::ExecutionContext,
                out: &mut dyn crate::output::TemplateWriter,
            ) -> Result<(), Error> {
                out.write_str("hello")
            }
        }
        fn parse_hello<'a>(
            _doc: &mut Parser<'a>,
            _start: &Token,
            _args: &mut Parser<'a>,
        ) -> Result<Box<dyn TagNode>, Error> {
            Ok(Box::new(HelloNode))
        }
        set.register_tag("hello", parse_hello).unwrap();
        assert!(set.tag_exists("hello"));
        assert_eq!(
            set.render_template_string("{% hello %}", &Context::new())
                .unwrap(),
            "hello"
        );
        assert!(set.register_tag("hello", parse_hello).is_err());
    }

    #[test]
    fn test_ban_after_first_compile_fails() {
        let (set, _) = new_set();
        set.ban_filter("upper").unwrap();
        let _ = set.from_string("x").unwrap();
        assert!(set.ban_filter("lower").is_err());
        assert!(set.ban_tag("lorem").is_err());
    }

    #[test]
    fn test_banned_filter_is_parse_error() {
        let (set, _) = new_set();
        set.ban_filter("upper").unwrap();
        let err = set.from_string("{{ x|upper }}").unwrap_err();
        assert!(err.message.contains("sandbox restriction"));
    }

    #[test]
    fn test_globals_visible_in_renders() {
        let (set, _) = new_set();
        set.add_global("version", Value::from("1.2"));
        assert_eq!(
            set.render_template_string("v{{ version }}", &Context::new())
                .unwrap(),
            "v1.2"
        );
        // The user context shadows globals.
        let mut ctx = Context::new();
        ctx.set("version", Value::from("9.9"));
        assert_eq!(
            set.render_template_string("v{{ version }}", &ctx).unwrap(),
            "v9.9"
        );
    }

    #[test]
    fn test_autoescape_default_off() {
        let (set, _) = new_set();
        set.set_autoescape(false);
        let mut ctx = Context::new();
        ctx.set("html", Value::from("<b>"));
        assert_eq!(
            set.render_template_string("{{ html }}", &ctx).unwrap(),
            "<b>"
        );
    }

    #[test]
    fn test_options_snapshot_per_template() {
        let (set, _) = new_set();
        set.set_options(Options {
            trim_blocks: true,
            lstrip_blocks: false,
        });
        let out = set
            .render_template_string("{% set x = 1 %}\nrest", &Context::new())
            .unwrap();
        assert_eq!(out, "rest");
    }

    #[test]
    fn test_include_through_loader() {
        let (set, files) = new_set();
        files.add("header.html", "HEAD");
        files.add("page.html", r#"{% include "header.html" %}BODY"#);
        assert_eq!(
            set.render_template_file("page.html", &Context::new())
                .unwrap(),
            "HEADBODY"
        );
    }

    #[test]
    fn test_concurrent_from_cache() {
        let (set, files) = new_set();
        files.add("t.html", "{{ 1 + 1 }}");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                set.render_template_file("t.html", &Context::new()).unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "2");
        }
    }
}
