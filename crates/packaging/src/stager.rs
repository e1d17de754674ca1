use crate::archive::ArchiveHandler;
use crate::context::{BuildContext, ContextSource};
use crate::fetch::{is_remote, remote_file_name, RemoteFetcher};
use crate::layer::{join_image_path, resolve_image_path, stale_paths, LayerDelta};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use stowage_models::{StageMode, StowageError};
use tempfile::TempDir;
use tracing::{debug, info, instrument};

/// One `COPY`/`ADD` operation, ready to be turned into a layer.
pub struct StagedFiles {
    pub delta: LayerDelta,
    /// Image paths this copy replaces wholesale.
    roots: Vec<String>,
    // Holds fetched files and expanded archives referenced by `delta`.
    _scratch: TempDir,
}

/// Resolves `COPY`/`ADD` sources from the build context into layer deltas.
pub struct Stager<'a> {
    context: &'a BuildContext,
    archives: &'a ArchiveHandler,
    fetcher: &'a RemoteFetcher,
    scratch_dir: &'a Path,
}

impl<'a> Stager<'a> {
    pub fn new(
        context: &'a BuildContext,
        archives: &'a ArchiveHandler,
        fetcher: &'a RemoteFetcher,
        scratch_dir: &'a Path,
    ) -> Self {
        Self {
            context,
            archives,
            fetcher,
            scratch_dir,
        }
    }

    fn destination_is_dir(
        destination: &str,
        dest_path: &str,
        sources: &[ContextSource],
        source_count: usize,
        rootfs: &Path,
    ) -> bool {
        destination.ends_with('/')
            || destination == "."
            || dest_path.is_empty()
            || source_count > 1
            || sources.iter().any(|source| source.is_dir)
            || fs::symlink_metadata(rootfs.join(dest_path))
                .map(|meta| meta.is_dir())
                .unwrap_or(false)
    }

    /// Build the delta for one copy operation.
    ///
    /// `rootfs` is the image under construction and `copied` the paths earlier
    /// copies put there. Those that sit under a replaced root and are not
    /// re-staged are whited out.
    #[instrument(skip(self, rootfs, copied))]
    pub async fn stage(
        &self,
        mode: StageMode,
        sources: &[String],
        destination: &str,
        workdir: &str,
        rootfs: &Path,
        copied: &BTreeSet<String>,
    ) -> Result<StagedFiles, StowageError> {
        let scratch = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(self.scratch_dir)
            .map_err(StowageError::storage)?;
        let dest_path = resolve_image_path(workdir, destination)?;

        let mut remote = Vec::new();
        let mut local = Vec::new();
        for source in sources {
            if is_remote(source) {
                if mode != StageMode::Add {
                    return Err(StowageError::InvalidPath {
                        path: source.clone(),
                        reason: "URLs are only supported by ADD".to_string(),
                    });
                }
                remote.push(source.clone());
            } else {
                local.extend(self.context.resolve(source)?);
            }
        }

        let dest_is_dir = Self::destination_is_dir(
            destination,
            &dest_path,
            &local,
            local.len() + remote.len(),
            rootfs,
        );

        let mut delta = LayerDelta::new();
        let mut roots = Vec::new();

        for (index, url) in remote.iter().enumerate() {
            let name = remote_file_name(url).unwrap_or_else(|| "download".to_string());
            let host = scratch.path().join(format!("fetch-{}", index));
            self.fetcher.fetch_to(url, &host).await?;
            let target = if dest_is_dir {
                join_image_path(&dest_path, &name)
            } else {
                dest_path.clone()
            };
            delta.add_file(&host, &target)?;
            roots.push(target);
        }

        for (index, source) in local.iter().enumerate() {
            if source.is_dir {
                delta.add_dir(&dest_path);
                for entry in self.context.walk(&source.path)? {
                    delta.add_entry(&entry.path, &join_image_path(&dest_path, &entry.relative))?;
                }
                roots.push(dest_path.clone());
                continue;
            }

            if mode == StageMode::Add {
                let expanded = scratch.path().join(format!("archive-{}", index));
                fs::create_dir_all(&expanded).map_err(StowageError::storage)?;
                if self.archives.extract(&source.path, &expanded)?.is_some() {
                    delta.add_tree(&expanded, &dest_path)?;
                    roots.push(dest_path.clone());
                    continue;
                }
            }

            let target = if dest_is_dir {
                join_image_path(&dest_path, source.file_name())
            } else {
                dest_path.clone()
            };
            if target.is_empty() {
                return Err(StowageError::InvalidPath {
                    path: destination.to_string(),
                    reason: "cannot replace the image root with a file".to_string(),
                });
            }
            delta.add_file(&source.path, &target)?;
            roots.push(target);
        }

        roots.sort();
        roots.dedup();

        let mut stale = BTreeSet::new();
        for root in &roots {
            stale.extend(stale_paths(copied, root, &delta).cloned());
        }
        for path in &stale {
            delta.whiteout(path);
        }
        if !stale.is_empty() {
            debug!("Whiting out {} paths replaced by this copy", stale.len());
        }

        info!(
            "Staged {} entries ({} bytes) at /{}",
            delta.len(),
            delta.content_size(),
            dest_path
        );
        Ok(StagedFiles {
            delta,
            roots,
            _scratch: scratch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        context_dir: TempDir,
        scratch: TempDir,
        rootfs: TempDir,
        archives: ArchiveHandler,
        fetcher: RemoteFetcher,
    }

    impl Fixture {
        fn new() -> Self {
            let context_dir = tempdir().unwrap();
            fs::write(context_dir.path().join("bot.py"), "print('ready')").unwrap();
            fs::write(context_dir.path().join("requirements.txt"), "requests\n").unwrap();
            fs::create_dir(context_dir.path().join("handlers")).unwrap();
            fs::write(context_dir.path().join("handlers/echo.py"), "").unwrap();
            Self {
                context_dir,
                scratch: tempdir().unwrap(),
                rootfs: tempdir().unwrap(),
                archives: ArchiveHandler::new(1024 * 1024),
                fetcher: RemoteFetcher::new(Duration::from_secs(1), 1024).unwrap(),
            }
        }

        async fn stage(
            &self,
            mode: StageMode,
            sources: &[&str],
            destination: &str,
            copied: &BTreeSet<String>,
        ) -> Result<StagedFiles, StowageError> {
            let context = BuildContext::new(self.context_dir.path()).unwrap();
            let stager = Stager::new(&context, &self.archives, &self.fetcher, self.scratch.path());
            let sources: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
            stager
                .stage(mode, &sources, destination, "/app", self.rootfs.path(), copied)
                .await
        }
    }

    #[tokio::test]
    async fn test_file_into_workdir() {
        let fixture = Fixture::new();
        let staged = fixture
            .stage(StageMode::Copy, &["requirements.txt"], ".", &BTreeSet::new())
            .await
            .unwrap();
        assert!(staged.delta.contains("app/requirements.txt"));
        assert_eq!(staged.roots, vec!["app/requirements.txt"]);
    }

    #[tokio::test]
    async fn test_file_renamed_at_destination() {
        let fixture = Fixture::new();
        let staged = fixture
            .stage(StageMode::Copy, &["bot.py"], "main.py", &BTreeSet::new())
            .await
            .unwrap();
        assert!(staged.delta.contains("app/main.py"));
        assert!(!staged.delta.contains("app/bot.py"));
    }

    #[tokio::test]
    async fn test_directory_contents_and_absolute_destination() {
        let fixture = Fixture::new();
        let staged = fixture
            .stage(StageMode::Copy, &["handlers"], "/opt/handlers", &BTreeSet::new())
            .await
            .unwrap();
        assert!(staged.delta.contains("opt/handlers/echo.py"));
        assert!(!staged.delta.contains("opt/handlers/handlers"));
    }

    #[tokio::test]
    async fn test_overlapping_copy_whites_out_stale_paths() {
        let fixture = Fixture::new();
        let copied: BTreeSet<String> = ["app/old.py", "app/requirements.txt", "usr/lib/base.so"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let staged = fixture
            .stage(StageMode::Copy, &["."], ".", &copied)
            .await
            .unwrap();
        let whiteouts: Vec<&str> = staged.delta.whiteouts().collect();
        assert_eq!(whiteouts, vec!["app/old.py"]);
        assert!(staged.delta.contains("app/requirements.txt"));
    }

    #[tokio::test]
    async fn test_directory_copy_skips_ignored_paths() {
        let fixture = Fixture::new();
        let root = fixture.context_dir.path();
        fs::write(root.join(".dockerignore"), "*.log\n").unwrap();
        fs::write(root.join("handlers/trace.log"), "x").unwrap();

        let staged = fixture
            .stage(StageMode::Copy, &["."], ".", &BTreeSet::new())
            .await
            .unwrap();
        assert!(staged.delta.contains("app/handlers/echo.py"));
        assert!(!staged.delta.contains("app/handlers/trace.log"));
    }

    #[tokio::test]
    async fn test_add_expands_local_archive() {
        let fixture = Fixture::new();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "vendor/lib.py", &b"pass"[..]).unwrap();
        fs::write(
            fixture.context_dir.path().join("vendor.tar"),
            builder.into_inner().unwrap(),
        )
        .unwrap();

        let added = fixture
            .stage(StageMode::Add, &["vendor.tar"], "/opt/", &BTreeSet::new())
            .await
            .unwrap();
        assert!(added.delta.contains("opt/vendor/lib.py"));

        let copied = fixture
            .stage(StageMode::Copy, &["vendor.tar"], "/opt/", &BTreeSet::new())
            .await
            .unwrap();
        assert!(copied.delta.contains("opt/vendor.tar"));
    }

    #[tokio::test]
    async fn test_missing_source_and_url_in_copy() {
        let fixture = Fixture::new();
        let err = fixture
            .stage(StageMode::Copy, &["missing.py"], ".", &BTreeSet::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StowageError::SourceNotFound { .. }));

        let err = fixture
            .stage(StageMode::Copy, &["https://example.com/a"], ".", &BTreeSet::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StowageError::InvalidPath { .. }));
    }
}
