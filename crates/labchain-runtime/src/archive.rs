use crate::error::{Result, RuntimeError};
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// An unpacked algorithm bundle. The working directory is removed on drop.
#[derive(Debug)]
pub struct ExtractedBundle {
    workdir: TempDir,
    root: PathBuf,
}

impl ExtractedBundle {
    /// The single top-level directory of the archive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

/// Unpack a gzip-compressed tar archive into a fresh temporary directory.
///
/// The archive must unpack into exactly one top-level directory. Entries
/// that would land outside the working directory are rejected.
pub async fn extract_bundle(cid: &str, archive: Vec<u8>) -> Result<ExtractedBundle> {
    let prefix = format!("algo-{}-", cid);
    tokio::task::spawn_blocking(move || extract_blocking(&prefix, &archive))
        .await
        .map_err(|e| RuntimeError::InvalidBundle(format!("extraction task failed: {}", e)))?
}

fn extract_blocking(prefix: &str, archive: &[u8]) -> Result<ExtractedBundle> {
    let workdir = tempfile::Builder::new().prefix(prefix).tempdir()?;
    let mut tar = tar::Archive::new(GzDecoder::new(archive));

    let mut count = 0usize;
    let entries = tar
        .entries()
        .map_err(|e| RuntimeError::InvalidBundle(format!("unreadable archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| RuntimeError::InvalidBundle(format!("corrupt entry: {}", e)))?;
        let name = entry.path()?.display().to_string();
        let unpacked = entry
            .unpack_in(workdir.path())
            .map_err(|e| RuntimeError::InvalidBundle(format!("failed to unpack {}: {}", name, e)))?;
        if !unpacked {
            return Err(RuntimeError::InvalidBundle(format!(
                "entry {} escapes the bundle",
                name
            )));
        }
        count += 1;
        debug!(entry = %name, "Extracted");
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(workdir.path())? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    if dirs.len() != 1 {
        return Err(RuntimeError::InvalidBundle(format!(
            "expected a single root directory, found {}",
            dirs.len()
        )));
    }

    let root = dirs.remove(0);
    info!(entries = count, root = %root.display(), "📦 Bundle extracted");
    Ok(ExtractedBundle { workdir, root })
}

/// Build a gzip-compressed tar archive of `dir`, stored under `root_name`.
pub fn pack_directory(dir: &Path, root_name: &str) -> Result<Vec<u8>> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(root_name, dir)?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_with_roots(roots: &[&str]) -> Vec<u8> {
        let src = TempDir::new().unwrap();
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for root in roots {
            let dir = src.path().join(root);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("Dockerfile"), "FROM alpine\n").unwrap();
            builder.append_dir_all(root, &dir).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn test_single_root_extracted_and_removed_on_drop() {
        let bundle = extract_bundle("Qm123", bundle_with_roots(&["algo"]))
            .await
            .unwrap();
        assert!(bundle.root().join("Dockerfile").is_file());
        assert!(bundle
            .workdir()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("algo-Qm123-"));

        let workdir = bundle.workdir().to_path_buf();
        drop(bundle);
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_two_roots_rejected() {
        let err = extract_bundle("Qm1", bundle_with_roots(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidBundle(_)));
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        let err = extract_bundle("Qm1", b"not an archive".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidBundle(_) | RuntimeError::Io(_)));
    }

    #[test]
    fn test_pack_directory_roundtrips_layout() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        std::fs::write(src.path().join("main.py"), "print(42)\n").unwrap();
        let packed = pack_directory(src.path(), "algo").unwrap();

        let out = extract_blocking("t-", &packed).unwrap();
        assert!(out.root().ends_with("algo"));
        assert!(out.root().join("main.py").is_file());
    }
}
