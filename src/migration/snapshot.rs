//! Snapshot packaging: turn an agent's portable working directory into a
//! checksummed `.tar.gz` archive, with a manifest of any git repositories
//! found inside it (spec.md §4.4.4 "SNAPSHOTTING").

use crate::error::{MigrationError, MigrationErrorCode, MigrationErrorOrigin, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Portable directories larger than this are rejected rather than packaged
/// (spec.md §4.4.4, recovery table: `Abort{cleanup_required: false}`).
pub const MAX_PORTABLE_SIZE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitRepoState {
    pub relative_path: String,
    pub head_ref: String,
    pub dirty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkStateManifest {
    pub repos: Vec<GitRepoState>,
}

#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub archive_path: PathBuf,
    pub checksum_sha256: String,
    pub size_bytes: u64,
    pub manifest: WorkStateManifest,
}

/// Sum the apparent size of every regular file under `root`, skipping
/// symlinks so a link cycle can't inflate (or hang) the size check.
pub fn compute_directory_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            MigrationError::new(
                MigrationErrorCode::SnapshotArchiveFailed,
                "SNAPSHOTTING",
                MigrationErrorOrigin::Source,
                e.to_string(),
            )
        })?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Find every `.git` directory under `root` and record its current HEAD ref
/// and whether the working tree looks dirty (spec.md §4.4.4 manifest).
pub fn build_work_state_manifest(root: &Path) -> Result<WorkStateManifest> {
    let mut repos = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            MigrationError::new(
                MigrationErrorCode::SnapshotArchiveFailed,
                "SNAPSHOTTING",
                MigrationErrorOrigin::Source,
                e.to_string(),
            )
        })?;
        if entry.file_type().is_dir() && entry.file_name() == ".git" {
            let repo_dir = entry.path().parent().unwrap_or(entry.path());
            let relative_path = repo_dir
                .strip_prefix(root)
                .unwrap_or(repo_dir)
                .to_string_lossy()
                .to_string();
            let head_ref = read_head_ref(entry.path()).unwrap_or_else(|| "unknown".to_string());
            let dirty = has_uncommitted_marker(entry.path());
            repos.push(GitRepoState {
                relative_path,
                head_ref,
                dirty,
            });
        }
    }
    Ok(WorkStateManifest { repos })
}

fn read_head_ref(git_dir: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    Some(contents.trim().to_string())
}

/// Best-effort dirty check: presence of `index.lock` or a non-empty
/// `MERGE_HEAD` suggests in-progress work worth flagging in the manifest.
/// Not a substitute for `git status` — good enough for the manifest's
/// informational purpose.
fn has_uncommitted_marker(git_dir: &Path) -> bool {
    git_dir.join("index.lock").exists() || git_dir.join("MERGE_HEAD").exists()
}

/// A writer that hashes everything written to it while forwarding to an
/// inner writer, so the archive's checksum falls out of the same pass that
/// writes it to disk.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Package `source` into a gzip-compressed tar archive at `dest`, computing
/// its sha256 checksum in the same streaming pass (spec.md §4.4.4).
pub fn build_archive(source: &Path, dest: &Path) -> Result<SnapshotResult> {
    let size = compute_directory_size(source)?;
    if size > MAX_PORTABLE_SIZE_BYTES {
        return Err(MigrationError::new(
            MigrationErrorCode::SnapshotPortableSizeExceeded,
            "SNAPSHOTTING",
            MigrationErrorOrigin::Source,
            format!("portable directory is {size} bytes, exceeds {MAX_PORTABLE_SIZE_BYTES}"),
        )
        .into());
    }

    let manifest = build_work_state_manifest(source)?;

    let file = File::create(dest).map_err(|e| {
        MigrationError::new(
            MigrationErrorCode::SnapshotArchiveFailed,
            "SNAPSHOTTING",
            MigrationErrorOrigin::Source,
            e.to_string(),
        )
    })?;
    let hashing = HashingWriter {
        inner: file,
        hasher: Sha256::new(),
    };
    let encoder = GzEncoder::new(hashing, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    archive.append_dir_all(".", source).map_err(|e| {
        MigrationError::new(
            MigrationErrorCode::SnapshotArchiveFailed,
            "SNAPSHOTTING",
            MigrationErrorOrigin::Source,
            e.to_string(),
        )
    })?;

    let encoder = archive.into_inner().map_err(|e| {
        MigrationError::new(
            MigrationErrorCode::SnapshotArchiveFailed,
            "SNAPSHOTTING",
            MigrationErrorOrigin::Source,
            e.to_string(),
        )
    })?;
    let hashing = encoder.finish().map_err(|e| {
        MigrationError::new(
            MigrationErrorCode::SnapshotArchiveFailed,
            "SNAPSHOTTING",
            MigrationErrorOrigin::Source,
            e.to_string(),
        )
    })?;

    let checksum_sha256 = hex::encode(hashing.hasher.finalize());
    let archive_size = std::fs::metadata(dest)
        .map_err(|e| {
            MigrationError::new(
                MigrationErrorCode::SnapshotArchiveFailed,
                "SNAPSHOTTING",
                MigrationErrorOrigin::Source,
                e.to_string(),
            )
        })?
        .len();

    Ok(SnapshotResult {
        archive_path: dest.to_path_buf(),
        checksum_sha256,
        size_bytes: archive_size,
        manifest,
    })
}

/// Recompute a file's sha256 checksum by streaming it, for verification on
/// the receiving side (spec.md §4.4.4 "VERIFYING").
pub fn checksum_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| {
        MigrationError::new(
            MigrationErrorCode::VerifyArchiveCorrupt,
            "VERIFYING",
            MigrationErrorOrigin::Target,
            e.to_string(),
        )
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| {
            MigrationError::new(
                MigrationErrorCode::VerifyArchiveCorrupt,
                "VERIFYING",
                MigrationErrorOrigin::Target,
                e.to_string(),
            )
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn build_archive_round_trips_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("portable");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("note.txt"), b"hello world").unwrap();

        let dest = dir.path().join("out.tar.gz");
        let result = build_archive(&source, &dest).unwrap();

        let recomputed = checksum_file(&dest).unwrap();
        assert_eq!(result.checksum_sha256, recomputed);
        assert!(result.size_bytes > 0);
    }

    #[test]
    fn manifest_detects_git_repo_head() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("portable");
        let git_dir = source.join("project/.git");
        std::fs::create_dir_all(&git_dir).unwrap();
        let mut head = File::create(git_dir.join("HEAD")).unwrap();
        write!(head, "ref: refs/heads/main\n").unwrap();

        let manifest = build_work_state_manifest(&source).unwrap();
        assert_eq!(manifest.repos.len(), 1);
        assert_eq!(manifest.repos[0].head_ref, "ref: refs/heads/main");
        assert_eq!(manifest.repos[0].relative_path, "project");
    }

    #[test]
    fn oversized_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("portable");
        std::fs::create_dir_all(&source).unwrap();
        // We don't actually allocate 4GiB in a test; instead exercise the
        // size-check path directly.
        let size = compute_directory_size(&source).unwrap();
        assert_eq!(size, 0);
    }
}
