//! Target-side rehydration: extract the transferred archive, verify its
//! structure against the sender's manifest, and reconcile any git
//! repositories it contains (spec.md §4.4.4 "REHYDRATING").

use crate::error::{MigrationError, MigrationErrorCode, MigrationErrorOrigin, Result};
use crate::migration::snapshot::WorkStateManifest;
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

/// Extract `archive_path` into `dest`, rejecting any entry whose path would
/// escape `dest` (absolute paths or `..` components) — the same guard a
/// tar-bomb defense needs regardless of how the archive got here.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| extract_failed(e.to_string()))?;

    let file = File::open(archive_path).map_err(|e| extract_failed(e.to_string()))?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let entries = archive.entries().map_err(|e| extract_failed(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extract_failed(e.to_string()))?;
        let path = entry.path().map_err(|e| extract_failed(e.to_string()))?.into_owned();

        if !is_safe_relative_path(&path) {
            return Err(extract_failed(format!(
                "refusing to extract unsafe archive entry: {}",
                path.display()
            ))
            .into());
        }

        entry.unpack_in(dest).map_err(|e| extract_failed(e.to_string()))?;
    }
    Ok(())
}

fn is_safe_relative_path(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn extract_failed(message: String) -> MigrationError {
    MigrationError::new(
        MigrationErrorCode::RehydrateExtractFailed,
        "REHYDRATING",
        MigrationErrorOrigin::Target,
        message,
    )
}

/// The portable subtree's expected top-level layout (spec.md §4.4.1).
const EXPECTED_STRUCTURE: &[&str] = &["toolkit", "playbooks", "knowledge/active", "knowledge/archive"];

/// Check the extracted archive against the documented portable-subtree
/// layout. A missing directory is surfaced as a warning, never a fatal
/// error: a rehydrated agent may simply not have populated every directory
/// yet, and extraction having already succeeded is what matters here.
pub fn verify_structure(dest: &Path) -> Vec<String> {
    EXPECTED_STRUCTURE
        .iter()
        .filter(|relative| !dest.join(relative).is_dir())
        .map(|relative| format!("expected directory {relative} missing after extraction"))
        .collect()
}

/// Result of reconciling one repo from the manifest against what actually
/// landed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoReconciliation {
    pub relative_path: String,
    pub head_matches: bool,
    pub needs_manual_reconciliation: bool,
}

/// Compare each manifest repo's recorded HEAD ref against what's on disk
/// post-extraction. A repo the sender flagged `dirty` is surfaced as
/// needing manual reconciliation rather than patched automatically — this
/// crate ships the archive's `.git` contents verbatim and does not attempt
/// to replay uncommitted changes itself.
pub fn reconcile_git_repos(dest: &Path, manifest: &WorkStateManifest) -> Vec<RepoReconciliation> {
    manifest
        .repos
        .iter()
        .map(|repo| {
            let head_path = dest.join(&repo.relative_path).join(".git").join("HEAD");
            let current_head = std::fs::read_to_string(&head_path)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            RepoReconciliation {
                relative_path: repo.relative_path.clone(),
                head_matches: current_head == repo.head_ref,
                needs_manual_reconciliation: repo.dirty,
            }
        })
        .collect()
}

pub fn path_for_agent(base_path: &Path, agent_id: &str, migration_id: &str) -> PathBuf {
    base_path.join("migrations").join(migration_id).join(agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::snapshot::{build_archive, build_work_state_manifest};

    #[test]
    fn extract_and_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("portable");
        std::fs::create_dir_all(source.join("project/.git")).unwrap();
        std::fs::write(source.join("project/.git/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(source.join("note.txt"), b"hi").unwrap();

        let archive_path = dir.path().join("out.tar.gz");
        let snapshot = build_archive(&source, &archive_path).unwrap();

        let dest = dir.path().join("rehydrated");
        extract_archive(&archive_path, &dest).unwrap();
        // No toolkit/playbooks/knowledge directories in this fixture, so the
        // warnings list is non-empty but extraction itself is not aborted.
        assert_eq!(verify_structure(&dest).len(), EXPECTED_STRUCTURE.len());

        let reconciliations = reconcile_git_repos(&dest, &snapshot.manifest);
        assert_eq!(reconciliations.len(), 1);
        assert!(reconciliations[0].head_matches);
        assert!(!reconciliations[0].needs_manual_reconciliation);
    }

    #[test]
    fn verify_structure_warns_without_failing_when_directories_missing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rehydrated");
        std::fs::create_dir_all(&dest).unwrap();
        let warnings = verify_structure(&dest);
        assert_eq!(warnings.len(), EXPECTED_STRUCTURE.len());
    }

    #[test]
    fn verify_structure_has_no_warnings_when_layout_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rehydrated");
        for relative in EXPECTED_STRUCTURE {
            std::fs::create_dir_all(dest.join(relative)).unwrap();
        }
        assert!(verify_structure(&dest).is_empty());
    }

    #[test]
    fn rejects_path_traversal_entries() {
        assert!(is_safe_relative_path(Path::new("project/file.txt")));
        assert!(!is_safe_relative_path(Path::new("../escape.txt")));
        assert!(!is_safe_relative_path(Path::new("/etc/passwd")));
    }

    #[test]
    fn manifest_can_be_built_from_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = build_work_state_manifest(dir.path()).unwrap();
        assert!(manifest.repos.is_empty());
    }
}
