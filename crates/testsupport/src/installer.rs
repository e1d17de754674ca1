use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use stowage_models::{normalize_name, DependencyManifest, StowageError};
use stowage_packaging::{InstallRequest, PackageInstaller};

/// Deterministic installer for tests.
///
/// Every known package becomes `<name>/__init__.py` in the target directory.
/// Unknown packages fail the install, but only after the known ones were
/// written, so a caller that keeps partial output would be caught.
#[derive(Debug, Default)]
pub struct FakeInstaller {
    known: BTreeSet<String>,
    calls: AtomicUsize,
}

impl FakeInstaller {
    pub fn new<'a>(known: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            known: known.into_iter().map(normalize_name).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of install invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn identity(&self, _request: &InstallRequest) -> Result<String, StowageError> {
        Ok("fake-installer".to_string())
    }

    async fn install(&self, request: &InstallRequest) -> Result<(), StowageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = tokio::fs::read_to_string(request.manifest_host_path())
            .await
            .map_err(|e| StowageError::DependencyInstall {
                reason: e.to_string(),
            })?;
        let manifest = DependencyManifest::parse(&content)?;

        let mut missing = Vec::new();
        for (name, requirement) in &manifest.packages {
            if !self.known.contains(name) {
                missing.push(requirement.name.clone());
                continue;
            }
            let package_dir = request.target.join(name.replace('-', "_"));
            tokio::fs::create_dir_all(&package_dir)
                .await
                .map_err(StowageError::storage)?;
            tokio::fs::write(
                package_dir.join("__init__.py"),
                format!("__version__ = {:?}\n", requirement.constraint),
            )
            .await
            .map_err(StowageError::storage)?;
        }

        if !missing.is_empty() {
            return Err(StowageError::DependencyInstall {
                reason: format!(
                    "No matching distribution found for {}",
                    missing.join(", ")
                ),
            });
        }
        Ok(())
    }
}
