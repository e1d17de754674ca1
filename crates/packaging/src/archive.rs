use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use stowage_models::StowageError;
use tracing::{info, instrument};
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveKind {
    /// Detect an archive by its leading bytes.
    pub fn sniff(path: &Path) -> Result<Option<Self>, StowageError> {
        let mut file = File::open(path).map_err(|e| StowageError::SourceNotFound {
            path: format!("{}: {}", path.display(), e),
        })?;
        let mut header = [0u8; 512];
        let mut read = 0;
        while read < header.len() {
            let n = file.read(&mut header[read..]).map_err(StowageError::storage)?;
            if n == 0 {
                break;
            }
            read += n;
        }

        if read >= 2 && header[0] == 0x1f && header[1] == 0x8b {
            return Ok(Some(ArchiveKind::TarGz));
        }
        if read >= 4 && &header[..4] == b"PK\x03\x04" {
            return Ok(Some(ArchiveKind::Zip));
        }
        if read >= 262 && &header[257..262] == b"ustar" {
            return Ok(Some(ArchiveKind::Tar));
        }
        Ok(None)
    }
}

/// Expands tar, gzip-compressed tar and zip archives with a size ceiling.
pub struct ArchiveHandler {
    max_bytes: u64,
}

impl ArchiveHandler {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Expand `archive` into `target_dir`. Returns `Ok(None)` when the file
    /// is not a recognised archive.
    #[instrument(skip(self))]
    pub fn extract(&self, archive: &Path, target_dir: &Path) -> Result<Option<u64>, StowageError> {
        let kind = match ArchiveKind::sniff(archive)? {
            Some(kind) => kind,
            None => return Ok(None),
        };

        let file = File::open(archive).map_err(|e| self.error(archive, e))?;
        let size = match kind {
            ArchiveKind::Tar => self.extract_tar(file, archive, target_dir)?,
            ArchiveKind::TarGz => self.extract_tar(GzDecoder::new(file), archive, target_dir)?,
            ArchiveKind::Zip => self.extract_zip(file, archive, target_dir)?,
        };

        info!(
            "Expanded {:?} archive {} ({} bytes) into {}",
            kind,
            archive.display(),
            size,
            target_dir.display()
        );
        Ok(Some(size))
    }

    fn error(&self, archive: &Path, reason: impl std::fmt::Display) -> StowageError {
        StowageError::Archive {
            path: archive.display().to_string(),
            reason: reason.to_string(),
        }
    }

    fn check_budget(&self, archive: &Path, total: u64) -> Result<(), StowageError> {
        if total > self.max_bytes {
            return Err(self.error(
                archive,
                format!("expanded size exceeds {} bytes", self.max_bytes),
            ));
        }
        Ok(())
    }

    fn extract_tar<R: Read>(&self, reader: R, archive: &Path, target_dir: &Path) -> Result<u64, StowageError> {
        let mut tar = tar::Archive::new(reader);
        tar.set_preserve_permissions(true);
        tar.set_overwrite(true);

        let mut total = 0u64;
        for entry in tar.entries().map_err(|e| self.error(archive, e))? {
            let mut entry = entry.map_err(|e| self.error(archive, e))?;
            total += entry.size();
            self.check_budget(archive, total)?;

            match entry.header().entry_type() {
                tar::EntryType::Regular
                | tar::EntryType::Continuous
                | tar::EntryType::Directory
                | tar::EntryType::Symlink
                | tar::EntryType::Link => {}
                _ => continue,
            }

            // unpack_in refuses entries that would land outside target_dir.
            let unpacked = entry
                .unpack_in(target_dir)
                .map_err(|e| self.error(archive, e))?;
            if !unpacked {
                return Err(self.error(archive, "entry escapes the destination"));
            }
        }
        Ok(total)
    }

    fn extract_zip(&self, file: File, archive: &Path, target_dir: &Path) -> Result<u64, StowageError> {
        let mut zip = ZipArchive::new(file).map_err(|e| self.error(archive, e))?;

        let mut total = 0u64;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(|e| self.error(archive, e))?;
            let relative: PathBuf = entry
                .enclosed_name()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| self.error(archive, format!("unsafe entry name {}", entry.name())))?;
            let out_path = target_dir.join(&relative);

            if entry.is_dir() {
                fs::create_dir_all(&out_path).map_err(|e| self.error(archive, e))?;
                continue;
            }

            total += entry.size();
            self.check_budget(archive, total)?;

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| self.error(archive, e))?;
            }
            let mut out = File::create(&out_path).map_err(|e| self.error(archive, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| self.error(archive, e))?;

            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| self.error(archive, e))?;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("vendor.tgz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&tar_bytes(&[("lib/helper.py", "def help(): pass")]))
            .unwrap();
        fs::write(&archive, encoder.finish().unwrap()).unwrap();

        let out = tempdir().unwrap();
        let size = ArchiveHandler::new(1024).extract(&archive, out.path()).unwrap();
        assert_eq!(size, Some(16));
        assert!(out.path().join("lib/helper.py").exists());
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("assets.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default().unix_permissions(0o755);
            writer.start_file("bin/start.sh", options).unwrap();
            writer.write_all(b"#!/bin/sh\necho ready\n").unwrap();
            writer.finish().unwrap();
        }

        let out = tempdir().unwrap();
        ArchiveHandler::new(1024).extract(&archive, out.path()).unwrap();
        let script = out.path().join("bin/start.sh");
        assert!(script.exists());
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_plain_file_is_not_an_archive() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("notes.txt");
        fs::write(&plain, "hello").unwrap();

        let out = tempdir().unwrap();
        assert_eq!(ArchiveHandler::new(1024).extract(&plain, out.path()).unwrap(), None);
    }

    #[test]
    fn test_size_limit() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("big.tar");
        fs::write(&archive, tar_bytes(&[("big.bin", &"x".repeat(4096))])).unwrap();

        let out = tempdir().unwrap();
        let err = ArchiveHandler::new(1024).extract(&archive, out.path()).unwrap_err();
        assert!(matches!(err, StowageError::Archive { .. }));
    }
}
