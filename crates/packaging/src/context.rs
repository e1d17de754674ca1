use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use std::fs;
use std::path::{Component, Path, PathBuf};
use stowage_models::StowageError;
use tracing::{debug, warn};

/// Exclusion rules read from the context root, in gitignore syntax.
pub const IGNORE_FILE: &str = ".dockerignore";

/// The directory a build reads its sources from. Every resolved source stays
/// inside it, and excluded paths are invisible to it.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    rules: Gitignore,
    excluded: Vec<PathBuf>,
}

/// A source path matched inside the build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSource {
    /// Path relative to the context root, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

impl ContextSource {
    pub fn file_name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or(&self.relative)
    }
}

/// One filesystem entry below a directory source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Path relative to the directory source, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn load_rules(root: &Path) -> Result<Gitignore, StowageError> {
    let mut builder = GitignoreBuilder::new(root);
    let file = root.join(IGNORE_FILE);
    if file.is_file() {
        if let Some(e) = builder.add(&file) {
            return Err(StowageError::InvalidPath {
                path: file.display().to_string(),
                reason: e.to_string(),
            });
        }
    }
    builder.build().map_err(|e| StowageError::InvalidPath {
        path: file.display().to_string(),
        reason: e.to_string(),
    })
}

fn walk_error(dir: &Path, e: ignore::Error) -> StowageError {
    StowageError::storage(format!("failed to walk {}: {}", dir.display(), e))
}

impl BuildContext {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StowageError> {
        let root = root.as_ref();
        let root = fs::canonicalize(root).map_err(|e| StowageError::SourceNotFound {
            path: format!("build context {}: {}", root.display(), e),
        })?;
        if !root.is_dir() {
            return Err(StowageError::InvalidPath {
                path: root.display().to_string(),
                reason: "build context is not a directory".to_string(),
            });
        }
        let rules = load_rules(&root)?;
        Ok(Self {
            root,
            rules,
            excluded: Vec::new(),
        })
    }

    /// Hide `dir` and everything below it. Directories outside the context
    /// are ignored.
    pub fn exclude(mut self, dir: impl AsRef<Path>) -> Self {
        if let Ok(dir) = fs::canonicalize(dir.as_ref()) {
            if dir != self.root && dir.starts_with(&self.root) {
                debug!("Excluding {} from the build context", dir.display());
                self.excluded.push(dir);
            }
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute, inside the root) is hidden from the build.
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        if path == self.root || !path.starts_with(&self.root) {
            return false;
        }
        self.excluded.iter().any(|dir| path.starts_with(dir))
            || self
                .rules
                .matched_path_or_any_parents(path, is_dir)
                .is_ignore()
    }

    /// Lexically normalise a source path relative to the context root.
    fn normalize(&self, source: &str) -> Result<String, StowageError> {
        let mut parts: Vec<String> = Vec::new();
        for component in Path::new(source.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(StowageError::InvalidPath {
                            path: source.to_string(),
                            reason: "outside the build context".to_string(),
                        });
                    }
                }
                Component::Prefix(_) => {
                    return Err(StowageError::InvalidPath {
                        path: source.to_string(),
                        reason: "unsupported path prefix".to_string(),
                    })
                }
            }
        }
        Ok(parts.join("/"))
    }

    /// Symlinked sources are followed only when their target stays inside
    /// the context.
    fn check_inside(&self, source: &str, path: &Path) -> Result<(), StowageError> {
        let resolved = fs::canonicalize(path).map_err(|e| StowageError::SourceNotFound {
            path: format!("{}: {}", source, e),
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(StowageError::InvalidPath {
                path: source.to_string(),
                reason: "resolves outside the build context".to_string(),
            });
        }
        if resolved != path && self.is_excluded(&resolved, resolved.is_dir()) {
            return Err(StowageError::SourceNotFound {
                path: source.to_string(),
            });
        }
        Ok(())
    }

    fn source_at(&self, source: &str, relative: String) -> Result<ContextSource, StowageError> {
        let path = if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&relative)
        };
        let meta = fs::symlink_metadata(&path).map_err(|_| StowageError::SourceNotFound {
            path: source.to_string(),
        })?;
        if self.is_excluded(&path, meta.is_dir()) {
            return Err(StowageError::SourceNotFound {
                path: source.to_string(),
            });
        }
        self.check_inside(source, &path)?;
        let is_dir = path.is_dir();
        Ok(ContextSource {
            relative,
            path,
            is_dir,
        })
    }

    /// Resolve one recipe source. Wildcards are allowed in the last path
    /// component; a pattern that matches nothing is an error.
    pub fn resolve(&self, source: &str) -> Result<Vec<ContextSource>, StowageError> {
        let relative = self.normalize(source)?;
        let (parent, last) = match relative.rsplit_once('/') {
            Some((parent, last)) => (parent.to_string(), last.to_string()),
            None => (String::new(), relative.clone()),
        };

        if !has_glob(&last) {
            return Ok(vec![self.source_at(source, relative)?]);
        }
        if has_glob(&parent) {
            return Err(StowageError::InvalidPath {
                path: source.to_string(),
                reason: "wildcards are only supported in the last path component".to_string(),
            });
        }

        let dir = if parent.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&parent)
        };
        let pattern = OverrideBuilder::new(&dir)
            .add(&last)
            .and_then(|builder| builder.build())
            .map_err(|e| StowageError::InvalidPath {
                path: source.to_string(),
                reason: e.to_string(),
            })?;
        let entries = fs::read_dir(&dir).map_err(|_| StowageError::SourceNotFound {
            path: source.to_string(),
        })?;

        let mut names: Vec<String> = Vec::new();
        for entry in entries.filter_map(|entry| entry.ok()) {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if pattern.matched(&name, is_dir).is_whitelist() && !self.is_excluded(&entry.path(), is_dir) {
                names.push(name);
            }
        }
        names.sort();

        if names.is_empty() {
            return Err(StowageError::SourceNotFound {
                path: source.to_string(),
            });
        }
        debug!("Pattern {} matched {} entries", source, names.len());

        names
            .into_iter()
            .map(|name| {
                let relative = if parent.is_empty() {
                    name
                } else {
                    format!("{}/{}", parent, name)
                };
                self.source_at(source, relative)
            })
            .collect()
    }

    /// Walk `dir` without following links, skipping excluded paths. The
    /// directory itself is not returned.
    pub fn walk(&self, dir: &Path) -> Result<Vec<ContextEntry>, StowageError> {
        let rules = self.rules.clone();
        let excluded = self.excluded.clone();
        let root = self.root.clone();
        let walker = WalkBuilder::new(dir)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let path = entry.path();
                if entry.depth() == 0 || !path.starts_with(&root) {
                    return true;
                }
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                !excluded.iter().any(|d| path.starts_with(d)) && !rules.matched(path, is_dir).is_ignore()
            })
            .build();

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| walk_error(dir, e))?;
            if entry.depth() == 0 {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(StowageError::storage)?;
            let relative = relative
                .to_str()
                .ok_or_else(|| StowageError::InvalidPath {
                    path: relative.display().to_string(),
                    reason: "path is not valid UTF-8".to_string(),
                })?
                .to_string();
            entries.push(ContextEntry {
                relative,
                path: entry.path().to_path_buf(),
            });
        }
        Ok(entries)
    }

    /// Total size of regular files the build can see.
    pub fn total_size(&self) -> Result<u64, StowageError> {
        let mut total = 0u64;
        for entry in self.walk(&self.root)? {
            match fs::symlink_metadata(&entry.path) {
                Ok(meta) if meta.is_file() => total += meta.len(),
                Ok(_) => {}
                Err(e) => warn!("Cannot stat {}: {}", entry.path.display(), e),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn context() -> (tempfile::TempDir, BuildContext) {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bot.py"), "print('ready')").unwrap();
        fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        fs::create_dir(dir.path().join("handlers")).unwrap();
        fs::write(dir.path().join("handlers/echo.py"), "").unwrap();
        let ctx = BuildContext::new(dir.path()).unwrap();
        (dir, ctx)
    }

    fn walked(ctx: &BuildContext) -> Vec<String> {
        ctx.walk(ctx.root())
            .unwrap()
            .into_iter()
            .map(|e| e.relative)
            .collect()
    }

    #[test]
    fn test_resolve_plain_and_directory() {
        let (_dir, ctx) = context();
        let bot = ctx.resolve("./bot.py").unwrap();
        assert_eq!(bot.len(), 1);
        assert_eq!(bot[0].relative, "bot.py");
        assert!(!bot[0].is_dir);

        let handlers = ctx.resolve("handlers/").unwrap();
        assert!(handlers[0].is_dir);

        let root = ctx.resolve(".").unwrap();
        assert_eq!(root[0].relative, "");
        assert!(root[0].is_dir);
    }

    #[test]
    fn test_resolve_glob_sorted() {
        let (dir, ctx) = context();
        fs::write(dir.path().join("admin.py"), "").unwrap();
        let matches = ctx.resolve("*.py").unwrap();
        let names: Vec<&str> = matches.iter().map(|m| m.file_name()).collect();
        assert_eq!(names, vec!["admin.py", "bot.py"]);

        let matches = ctx.resolve("b?t.*").unwrap();
        assert_eq!(matches[0].file_name(), "bot.py");
        let matches = ctx.resolve("handlers/*.py").unwrap();
        assert_eq!(matches[0].relative, "handlers/echo.py");
    }

    #[test]
    fn test_missing_and_escaping_sources() {
        let (_dir, ctx) = context();
        assert!(matches!(
            ctx.resolve("missing.py").unwrap_err(),
            StowageError::SourceNotFound { .. }
        ));
        assert!(matches!(
            ctx.resolve("*.rs").unwrap_err(),
            StowageError::SourceNotFound { .. }
        ));
        assert!(matches!(
            ctx.resolve("../etc/passwd").unwrap_err(),
            StowageError::InvalidPath { .. }
        ));
        assert!(matches!(
            ctx.resolve("*/echo.py").unwrap_err(),
            StowageError::InvalidPath { .. }
        ));
    }

    #[test]
    fn test_symlink_outside_context_rejected() {
        let (dir, ctx) = context();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        symlink(outside.path().join("secret"), dir.path().join("link")).unwrap();

        assert!(matches!(
            ctx.resolve("link").unwrap_err(),
            StowageError::InvalidPath { .. }
        ));
    }

    #[test]
    fn test_excluded_store_is_invisible() {
        let (dir, _) = context();
        let store = dir.path().join(".stowage");
        fs::create_dir_all(store.join("blobs")).unwrap();
        fs::write(store.join("blobs/abc"), vec![0u8; 4096]).unwrap();
        let before = BuildContext::new(dir.path()).unwrap().total_size().unwrap();

        let ctx = BuildContext::new(dir.path()).unwrap().exclude(&store);
        assert_eq!(walked(&ctx), vec!["bot.py", "handlers", "handlers/echo.py", "requirements.txt"]);
        assert_eq!(ctx.total_size().unwrap(), before - 4096);
        assert!(matches!(
            ctx.resolve(".stowage/blobs/abc").unwrap_err(),
            StowageError::SourceNotFound { .. }
        ));
        let hidden: Vec<String> = ctx
            .resolve(".*")
            .map(|m| m.into_iter().map(|s| s.relative).collect())
            .unwrap_or_default();
        assert!(!hidden.contains(&".stowage".to_string()));
    }

    #[test]
    fn test_dockerignore_rules() {
        let (dir, _) = context();
        fs::write(dir.path().join(".dockerignore"), "*.log\n__pycache__/\n!keep.log\n").unwrap();
        fs::write(dir.path().join("debug.log"), "x").unwrap();
        fs::write(dir.path().join("keep.log"), "x").unwrap();
        fs::create_dir(dir.path().join("handlers/__pycache__")).unwrap();
        fs::write(dir.path().join("handlers/__pycache__/echo.pyc"), "x").unwrap();

        let ctx = BuildContext::new(dir.path()).unwrap();
        let files = walked(&ctx);
        assert!(files.contains(&"keep.log".to_string()));
        assert!(files.contains(&".dockerignore".to_string()));
        assert!(!files.contains(&"debug.log".to_string()));
        assert!(!files.iter().any(|f| f.contains("__pycache__")));

        let logs: Vec<String> = ctx
            .resolve("*.log")
            .unwrap()
            .into_iter()
            .map(|s| s.relative)
            .collect();
        assert_eq!(logs, vec!["keep.log"]);
        assert!(ctx.resolve("debug.log").is_err());
    }

    #[test]
    fn test_store_outside_context_is_not_excluded() {
        let (_dir, ctx) = context();
        let elsewhere = tempdir().unwrap();
        let ctx = ctx.exclude(elsewhere.path());
        assert_eq!(walked(&ctx).len(), 4);
    }
}
