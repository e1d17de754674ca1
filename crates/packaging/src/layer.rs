//! Layer deltas and their tar encoding.
//!
//! A layer is an uncompressed tar stream. Deletions use the OCI whiteout
//! convention: `dir/.wh.name` removes `dir/name`, and `dir/.wh..wh..opq`
//! clears everything previously in `dir`. Packing is deterministic (sorted
//! entries, zero mtime and ownership) so identical deltas produce identical
//! digests.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use stowage_models::StowageError;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEntry {
    Directory { mode: u32 },
    File { source: PathBuf, size: u64, mode: u32 },
    Bytes { data: Vec<u8>, mode: u32 },
    Symlink { target: PathBuf },
}

/// Filesystem changes produced by one instruction, keyed by image path
/// relative to `/`.
#[derive(Debug, Clone, Default)]
pub struct LayerDelta {
    entries: BTreeMap<String, DeltaEntry>,
    whiteouts: BTreeSet<String>,
    opaque_dirs: BTreeSet<String>,
}

/// Paths touched by applying a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedLayer {
    /// Regular files and symlinks written.
    pub added: Vec<String>,
    /// Paths removed together with everything below them.
    pub removed: Vec<String>,
}

/// Resolve `path` against the absolute `workdir` and return it relative to
/// the image root. `..` may not climb above `/`.
pub fn resolve_image_path(workdir: &str, path: &str) -> Result<String, StowageError> {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if parts.pop().is_none() {
                    return Err(StowageError::InvalidPath {
                        path: path.to_string(),
                        reason: "escapes the image root".to_string(),
                    });
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

pub fn join_image_path(dir: &str, name: &str) -> String {
    match (dir.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{}/{}", dir, name),
    }
}

fn is_under(path: &str, root: &str) -> bool {
    root.is_empty()
        || path == root
        || (path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/')
}

fn host_mode(metadata: &fs::Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

impl LayerDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.whiteouts.is_empty() && self.opaque_dirs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.whiteouts.len() + self.opaque_dirs.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &DeltaEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn whiteouts(&self) -> impl Iterator<Item = &str> {
        self.whiteouts.iter().map(|path| path.as_str())
    }

    /// Total bytes of file content carried by the delta.
    pub fn content_size(&self) -> u64 {
        self.entries
            .values()
            .map(|entry| match entry {
                DeltaEntry::File { size, .. } => *size,
                DeltaEntry::Bytes { data, .. } => data.len() as u64,
                _ => 0,
            })
            .sum()
    }

    /// Insert an entry, adding any missing parent directories.
    pub fn insert(&mut self, path: &str, entry: DeltaEntry) {
        if path.is_empty() {
            return;
        }
        let mut parent = String::new();
        let components: Vec<&str> = path.split('/').collect();
        for component in &components[..components.len() - 1] {
            parent = join_image_path(&parent, component);
            self.entries
                .entry(parent.clone())
                .or_insert(DeltaEntry::Directory {
                    mode: DEFAULT_DIR_MODE,
                });
        }
        self.whiteouts.remove(path);
        self.entries.insert(path.to_string(), entry);
    }

    pub fn whiteout(&mut self, path: &str) {
        if !path.is_empty() && !self.entries.contains_key(path) {
            self.whiteouts.insert(path.to_string());
        }
    }

    pub fn opaque(&mut self, dir: &str) {
        self.opaque_dirs.insert(dir.to_string());
    }

    pub fn add_file(&mut self, host_path: &Path, image_path: &str) -> Result<(), StowageError> {
        let metadata = fs::metadata(host_path).map_err(|e| StowageError::SourceNotFound {
            path: format!("{}: {}", host_path.display(), e),
        })?;
        self.insert(
            image_path,
            DeltaEntry::File {
                source: host_path.to_path_buf(),
                size: metadata.len(),
                mode: host_mode(&metadata),
            },
        );
        Ok(())
    }

    /// Make sure `image_dir` exists in the delta.
    pub fn add_dir(&mut self, image_dir: &str) {
        if !image_dir.is_empty() && !self.entries.contains_key(image_dir) {
            self.insert(
                image_dir,
                DeltaEntry::Directory {
                    mode: DEFAULT_DIR_MODE,
                },
            );
        }
    }

    /// Stage one host path without following it. Symlinks are kept as links;
    /// sockets and devices are skipped.
    pub fn add_entry(&mut self, host_path: &Path, image_path: &str) -> Result<(), StowageError> {
        let metadata = host_path.symlink_metadata().map_err(StowageError::storage)?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            self.insert(
                image_path,
                DeltaEntry::Directory {
                    mode: host_mode(&metadata),
                },
            );
        } else if file_type.is_file() {
            self.insert(
                image_path,
                DeltaEntry::File {
                    source: host_path.to_path_buf(),
                    size: metadata.len(),
                    mode: host_mode(&metadata),
                },
            );
        } else if file_type.is_symlink() {
            let target = fs::read_link(host_path).map_err(StowageError::storage)?;
            self.insert(image_path, DeltaEntry::Symlink { target });
        } else {
            warn!("Skipping special file {}", host_path.display());
        }
        Ok(())
    }

    /// Stage the contents of `host_dir` (not the directory itself) under
    /// `image_dir`.
    pub fn add_tree(&mut self, host_dir: &Path, image_dir: &str) -> Result<(), StowageError> {
        self.add_dir(image_dir);

        for entry in WalkDir::new(host_dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| StowageError::storage(format!(
                "failed to walk {}: {}",
                host_dir.display(),
                e
            )))?;
            let relative = entry
                .path()
                .strip_prefix(host_dir)
                .map_err(StowageError::storage)?;
            let relative = relative
                .to_str()
                .ok_or_else(|| StowageError::InvalidPath {
                    path: relative.display().to_string(),
                    reason: "path is not valid UTF-8".to_string(),
                })?;
            self.add_entry(entry.path(), &join_image_path(image_dir, relative))?;
        }
        Ok(())
    }

    /// Content digest of the delta, independent of its tar encoding.
    pub fn digest(&self) -> Result<String, StowageError> {
        let mut hasher = Sha256::new();
        for dir in &self.opaque_dirs {
            hasher.update(b"opaque\0");
            hasher.update(dir.as_bytes());
            hasher.update(b"\0");
        }
        for path in &self.whiteouts {
            hasher.update(b"whiteout\0");
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
        }
        for (path, entry) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            match entry {
                DeltaEntry::Directory { mode } => {
                    hasher.update(format!("dir {:o}\0", mode).as_bytes());
                }
                DeltaEntry::File { source, mode, .. } => {
                    hasher.update(format!("file {:o}\0", mode).as_bytes());
                    let mut file = File::open(source).map_err(|e| StowageError::SourceNotFound {
                        path: format!("{}: {}", source.display(), e),
                    })?;
                    io::copy(&mut file, &mut hasher).map_err(StowageError::storage)?;
                }
                DeltaEntry::Bytes { data, mode } => {
                    hasher.update(format!("file {:o}\0", mode).as_bytes());
                    hasher.update(data);
                }
                DeltaEntry::Symlink { target } => {
                    hasher.update(b"symlink\0");
                    hasher.update(target.to_string_lossy().as_bytes());
                }
            }
            hasher.update(b"\0");
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Encode as a deterministic tar stream: opaque markers, then whiteouts,
    /// then entries in path order.
    pub fn pack(&self) -> Result<Vec<u8>, StowageError> {
        let mut builder = tar::Builder::new(Vec::new());

        for dir in &self.opaque_dirs {
            append_marker(&mut builder, &join_image_path(dir, OPAQUE_WHITEOUT))?;
        }
        for path in &self.whiteouts {
            let (parent, name) = match path.rsplit_once('/') {
                Some((parent, name)) => (parent, name),
                None => ("", path.as_str()),
            };
            let marker = join_image_path(parent, &format!("{}{}", WHITEOUT_PREFIX, name));
            append_marker(&mut builder, &marker)?;
        }

        for (path, entry) in &self.entries {
            let mut header = base_header();
            match entry {
                DeltaEntry::Directory { mode } => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(*mode);
                    header.set_size(0);
                    builder
                        .append_data(&mut header, format!("{}/", path), io::empty())
                        .map_err(StowageError::storage)?;
                }
                DeltaEntry::File { source, mode, .. } => {
                    let data = fs::read(source).map_err(|e| StowageError::SourceNotFound {
                        path: format!("{}: {}", source.display(), e),
                    })?;
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(data.len() as u64);
                    builder
                        .append_data(&mut header, path, data.as_slice())
                        .map_err(StowageError::storage)?;
                }
                DeltaEntry::Bytes { data, mode } => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(data.len() as u64);
                    builder
                        .append_data(&mut header, path, data.as_slice())
                        .map_err(StowageError::storage)?;
                }
                DeltaEntry::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder
                        .append_link(&mut header, path, target)
                        .map_err(StowageError::storage)?;
                }
            }
        }

        builder.into_inner().map_err(StowageError::storage)
    }
}

fn base_header() -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_marker(builder: &mut tar::Builder<Vec<u8>>, path: &str) -> Result<(), StowageError> {
    let mut header = base_header();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(0);
    builder
        .append_data(&mut header, path, io::empty())
        .map_err(StowageError::storage)
}

fn archive_error(reason: impl std::fmt::Display) -> StowageError {
    StowageError::Archive {
        path: "layer".to_string(),
        reason: reason.to_string(),
    }
}

fn normalize_entry_path(path: &Path) -> Result<String, StowageError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| archive_error("entry path is not valid UTF-8"))?,
            ),
            Component::CurDir => {}
            Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(archive_error(format!(
                    "entry {} escapes the layer root",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Create the parent directories of `relative` below `root`, refusing to
/// traverse symlinks so an entry can never land outside `root`.
fn ensure_parent_dirs(root: &Path, relative: &str) -> Result<(), StowageError> {
    let mut current = root.to_path_buf();
    let components: Vec<&str> = relative.split('/').collect();
    for component in &components[..components.len().saturating_sub(1)] {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(archive_error(format!(
                    "entry {} traverses symlink {}",
                    relative,
                    current.display()
                )));
            }
            Ok(_) => {
                fs::remove_file(&current).map_err(StowageError::storage)?;
                fs::create_dir(&current).map_err(StowageError::storage)?;
            }
            Err(_) => fs::create_dir(&current).map_err(StowageError::storage)?,
        }
    }
    Ok(())
}

/// True when any component of `relative` below `root` is a symlink.
fn traverses_symlink(root: &Path, relative: &str) -> bool {
    if relative.is_empty() {
        return false;
    }
    let mut current = root.to_path_buf();
    relative.split('/').any(|component| {
        current.push(component);
        fs::symlink_metadata(&current)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
    })
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                remove_path(&entry?.path())?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Apply a layer tar stream on top of the filesystem at `dest`.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> Result<AppliedLayer, StowageError> {
    let mut archive = tar::Archive::new(reader);
    let mut applied = AppliedLayer::default();

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let relative = normalize_entry_path(&entry.path().map_err(archive_error)?)?;
        if relative.is_empty() {
            continue;
        }

        let (parent, name) = match relative.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name.to_string()),
            None => (String::new(), relative.clone()),
        };

        if name == OPAQUE_WHITEOUT {
            if traverses_symlink(dest, &parent) {
                warn!("Ignoring opaque whiteout below symlink /{}", parent);
                continue;
            }
            clear_dir(&dest.join(&parent)).map_err(StowageError::storage)?;
            debug!("Opaque whiteout cleared /{}", parent);
            applied.removed.push(parent);
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            let target = join_image_path(&parent, target);
            if traverses_symlink(dest, &parent) {
                warn!("Ignoring whiteout below symlink /{}", target);
                continue;
            }
            remove_path(&dest.join(&target)).map_err(StowageError::storage)?;
            debug!("Whiteout removed /{}", target);
            applied.removed.push(target);
            continue;
        }

        ensure_parent_dirs(dest, &relative)?;
        let full_path = dest.join(&relative);
        let mode = entry.header().mode().map_err(archive_error)?;
        let entry_type = entry.header().entry_type();

        match entry_type {
            tar::EntryType::Directory => {
                match fs::symlink_metadata(&full_path) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => {
                        fs::remove_file(&full_path).map_err(StowageError::storage)?;
                        fs::create_dir(&full_path).map_err(StowageError::storage)?;
                    }
                    Err(_) => fs::create_dir(&full_path).map_err(StowageError::storage)?,
                }
                // The owner must be able to populate the directory with later entries.
                fs::set_permissions(&full_path, fs::Permissions::from_mode(mode | 0o700))
                    .map_err(StowageError::storage)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                remove_path(&full_path).map_err(StowageError::storage)?;
                let mut file = File::create(&full_path).map_err(StowageError::storage)?;
                io::copy(&mut entry, &mut file).map_err(StowageError::storage)?;
                fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))
                    .map_err(StowageError::storage)?;
                applied.added.push(relative);
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(archive_error)?
                    .ok_or_else(|| archive_error(format!("symlink {} has no target", relative)))?
                    .into_owned();
                remove_path(&full_path).map_err(StowageError::storage)?;
                symlink(&target, &full_path).map_err(StowageError::storage)?;
                applied.added.push(relative);
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(archive_error)?
                    .ok_or_else(|| archive_error(format!("hardlink {} has no target", relative)))?;
                let target = dest.join(normalize_entry_path(&target)?);
                remove_path(&full_path).map_err(StowageError::storage)?;
                fs::hard_link(&target, &full_path).map_err(StowageError::storage)?;
                applied.added.push(relative);
            }
            other => {
                trace!("Skipping unsupported entry type {:?} at {}", other, relative);
            }
        }
    }

    Ok(applied)
}

/// Drop `removed` paths (and everything below them) from a set of image paths,
/// then add `added`.
pub fn track_applied(paths: &mut BTreeSet<String>, applied: &AppliedLayer) {
    for removed in &applied.removed {
        paths.retain(|path| !is_under(path, removed));
    }
    paths.extend(applied.added.iter().cloned());
}

/// Paths in `staged` that sit at or below `root` and are not part of `delta`.
pub fn stale_paths<'a>(
    staged: &'a BTreeSet<String>,
    root: &'a str,
    delta: &'a LayerDelta,
) -> impl Iterator<Item = &'a String> + 'a {
    staged
        .iter()
        .filter(move |path| is_under(path, root) && !delta.contains(path))
}
