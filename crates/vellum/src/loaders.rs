//! Template loaders.
//!
//! A [`Loader`] turns template references into canonical names and reads
//! their source. [`FileSystemLoader`] resolves references relative to the
//! referring template's directory; [`MemoryLoader`] serves templates from
//! an in-memory map, which is also what the tests render against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::Error;

/// Resolves and reads template sources by name.
pub trait Loader: Send + Sync {
    /// Produces the canonical name for `name` as referenced from the
    /// template `base` (or from outside any template when `base` is
    /// `None`). Must not perform I/O.
    fn resolve(&self, base: Option<&str>, name: &str) -> String;

    /// Reads the source for a canonical name.
    fn load(&self, canonical: &str) -> Result<String, Error>;
}

/// Loads templates from a directory tree.
///
/// References from one template to another (`extends`, `include`, ...)
/// resolve relative to the referring template's directory; everything else
/// resolves relative to the loader's base directory.
pub struct FileSystemLoader {
    base_dir: PathBuf,
}

impl FileSystemLoader {
    /// Creates a loader rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl Loader for FileSystemLoader {
    fn resolve(&self, base: Option<&str>, name: &str) -> String {
        if Path::new(name).is_absolute() {
            return name.to_string();
        }
        // Synthetic names like `<string>` have no directory to resolve
        // against.
        let base_dir = match base {
            Some(b) if !b.starts_with('<') => Path::new(b)
                .parent()
                .map_or_else(|| self.base_dir.clone(), Path::to_path_buf),
            _ => self.base_dir.clone(),
        };
        base_dir.join(name).to_string_lossy().into_owned()
    }

    fn load(&self, canonical: &str) -> Result<String, Error> {
        std::fs::read_to_string(canonical).map_err(|e| {
            Error::new(
                "loader",
                format!("template '{canonical}' could not be read"),
            )
            .with_cause(e)
        })
    }
}

/// Serves templates from an in-memory name → source map.
///
/// Cloning the loader shares the underlying map, so templates added after
/// the loader was handed to a set are still visible.
#[derive(Clone, Default)]
pub struct MemoryLoader {
    templates: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a template.
    pub fn add(&self, name: impl Into<String>, source: impl Into<String>) {
        self.templates
            .write()
            .unwrap()
            .insert(name.into(), source.into());
    }
}

impl Loader for MemoryLoader {
    fn resolve(&self, _base: Option<&str>, name: &str) -> String {
        name.to_string()
    }

    fn load(&self, canonical: &str) -> Result<String, Error> {
        self.templates
            .read()
            .unwrap()
            .get(canonical)
            .cloned()
            .ok_or_else(|| {
                Error::new("loader", format!("template '{canonical}' not found"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_loader_round_trip() {
        let loader = MemoryLoader::new();
        loader.add("a.html", "content");
        assert_eq!(loader.load("a.html").unwrap(), "content");
        assert!(loader.load("missing.html").is_err());
    }

    #[test]
    fn test_memory_loader_clone_shares_map() {
        let loader = MemoryLoader::new();
        let other = loader.clone();
        other.add("late.html", "x");
        assert_eq!(loader.load("late.html").unwrap(), "x");
    }

    #[test]
    fn test_memory_loader_resolve_is_identity() {
        let loader = MemoryLoader::new();
        assert_eq!(loader.resolve(Some("base.html"), "x.html"), "x.html");
    }

    #[test]
    fn test_filesystem_resolve_relative_to_base_template() {
        let loader = FileSystemLoader::new("/srv/templates");
        assert_eq!(
            loader.resolve(None, "index.html"),
            "/srv/templates/index.html"
        );
        assert_eq!(
            loader.resolve(Some("/srv/templates/shop/page.html"), "part.html"),
            "/srv/templates/shop/part.html"
        );
        assert_eq!(
            loader.resolve(Some("<string>"), "part.html"),
            "/srv/templates/part.html"
        );
    }

    #[test]
    fn test_filesystem_resolve_absolute_passthrough() {
        let loader = FileSystemLoader::new("/srv/templates");
        assert_eq!(loader.resolve(None, "/etc/motd"), "/etc/motd");
    }

    #[test]
    fn test_filesystem_loader_reads_files() {
        let dir = std::env::temp_dir().join("vellum_loader_test");
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(dir.join("t.html"), "from disk").unwrap();

        let loader = FileSystemLoader::new(&dir);
        let canonical = loader.resolve(None, "t.html");
        assert_eq!(loader.load(&canonical).unwrap(), "from disk");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_filesystem_loader_missing_file() {
        let loader = FileSystemLoader::new("/nonexistent");
        assert!(loader.load("/nonexistent/x.html").is_err());
    }
}
