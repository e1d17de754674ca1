use anyhow::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary build context plus a temporary store directory.
#[derive(Debug)]
pub struct TestContext {
    context: TempDir,
    store: TempDir,
}

impl TestContext {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: tempfile::tempdir()?,
            store: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.context.path()
    }

    pub fn store_dir(&self) -> &Path {
        self.store.path()
    }

    pub fn write_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = self.context.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Write an executable file.
    pub fn write_script(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = self.write_file(relative, content)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    pub fn write_recipe(&self, content: &str) -> Result<PathBuf> {
        self.write_file("Dockerfile", content)
    }

    pub fn remove(&self, relative: &str) -> Result<()> {
        let path = self.context.path().join(relative);
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
