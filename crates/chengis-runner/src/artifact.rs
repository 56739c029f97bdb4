//! Artifact store.
//!
//! Declared glob patterns are resolved relative to the build workspace;
//! matches are copied into artifact storage keyed by build, hashed with
//! SHA-256, and recorded. Verification recomputes the hash against the
//! stored file.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use chengis_core::{Error, ResourceId, Result};
use chengis_db::{ArtifactRecord, ArtifactRepo};

pub struct ArtifactStore {
    root: PathBuf,
    repo: Arc<ArtifactRepo>,
}

/// Outcome of verifying one artifact. `valid` is `None` when the check
/// could not run (missing file or stored hash).
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub valid: Option<bool>,
    pub expected: Option<String>,
    pub computed: Option<String>,
    pub reason: Option<String>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, repo: Arc<ArtifactRepo>) -> Self {
        Self {
            root: root.into(),
            repo,
        }
    }

    /// Collect every file matching the patterns and persist it.
    pub async fn save(
        &self,
        build_id: ResourceId,
        workspace: &Path,
        patterns: &[String],
    ) -> Result<Vec<ArtifactRecord>> {
        let mut records = Vec::new();
        for (relative, absolute) in collect_matches(workspace, patterns) {
            let data = tokio::fs::read(&absolute)
                .await
                .map_err(|e| Error::Internal(format!("read artifact {relative}: {e}")))?;
            let sha256 = hex::encode(Sha256::digest(&data));

            let stored = self.root.join(build_id.to_string()).join(&relative);
            if let Some(parent) = stored.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Internal(format!("artifact dir: {e}")))?;
            }
            tokio::fs::copy(&absolute, &stored)
                .await
                .map_err(|e| Error::Internal(format!("copy artifact {relative}: {e}")))?;

            debug!(artifact = %relative, size = data.len(), "stored artifact");
            let record = self
                .repo
                .insert(
                    build_id,
                    &relative,
                    &stored.to_string_lossy(),
                    data.len() as i64,
                    None,
                    Some(&sha256),
                )
                .await
                .map_err(chengis_core::Error::from)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Persist an artifact produced elsewhere (a remote agent) from its
    /// raw bytes.
    pub async fn store_bytes(
        &self,
        build_id: ResourceId,
        filename: &str,
        data: &[u8],
    ) -> Result<ArtifactRecord> {
        let sha256 = hex::encode(Sha256::digest(data));
        let stored = self.root.join(build_id.to_string()).join(filename);
        if let Some(parent) = stored.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("artifact dir: {e}")))?;
        }
        tokio::fs::write(&stored, data)
            .await
            .map_err(|e| Error::Internal(format!("write artifact {filename}: {e}")))?;
        self.repo
            .insert(
                build_id,
                filename,
                &stored.to_string_lossy(),
                data.len() as i64,
                None,
                Some(&sha256),
            )
            .await
            .map_err(chengis_core::Error::from)
    }

    /// Recompute an artifact's hash and compare to the recorded one.
    pub async fn verify(&self, build_id: ResourceId, filename: &str) -> Result<VerifyOutcome> {
        let record = self
            .repo
            .get(build_id, filename)
            .await
            .map_err(chengis_core::Error::from)?;
        Ok(verify_record(&record).await)
    }

    pub async fn open(&self, build_id: ResourceId, filename: &str) -> Result<PathBuf> {
        let record = self
            .repo
            .get(build_id, filename)
            .await
            .map_err(chengis_core::Error::from)?;
        Ok(PathBuf::from(record.path))
    }
}

/// Verify a record against the file it points at.
pub async fn verify_record(record: &ArtifactRecord) -> VerifyOutcome {
    let Some(expected) = record.sha256.clone() else {
        return VerifyOutcome {
            valid: None,
            expected: None,
            computed: None,
            reason: Some("no stored hash".into()),
        };
    };
    let data = match tokio::fs::read(&record.path).await {
        Ok(data) => data,
        Err(e) => {
            return VerifyOutcome {
                valid: None,
                expected: Some(expected),
                computed: None,
                reason: Some(format!("file missing: {e}")),
            };
        }
    };
    let computed = hex::encode(Sha256::digest(&data));
    VerifyOutcome {
        valid: Some(computed == expected),
        expected: Some(expected),
        computed: Some(computed),
        reason: None,
    }
}

/// Resolve glob patterns to `(workspace-relative, absolute)` file pairs.
/// Patterns that match nothing are logged and skipped.
pub fn collect_matches(workspace: &Path, patterns: &[String]) -> Vec<(String, PathBuf)> {
    let mut matches = Vec::new();
    for pattern in patterns {
        let full = workspace.join(pattern);
        let Some(full) = full.to_str() else {
            warn!(pattern = %pattern, "non-utf8 artifact pattern");
            continue;
        };
        let paths = match glob::glob(full) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "bad artifact pattern");
                continue;
            }
        };
        let mut any = false;
        for entry in paths.flatten() {
            if !entry.is_file() {
                continue;
            }
            let Ok(relative) = entry.strip_prefix(workspace) else {
                continue;
            };
            any = true;
            matches.push((relative.to_string_lossy().into_owned(), entry.clone()));
        }
        if !any {
            debug!(pattern = %pattern, "artifact pattern matched nothing");
        }
    }
    matches.sort();
    matches.dedup();
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn glob_collects_relative_paths() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "dist/app.tar", "bin");
        write(ws.path(), "dist/sub/lib.so", "lib");
        write(ws.path(), "src/main.rs", "fn main() {}");

        let matches = collect_matches(ws.path(), &["dist/**/*".to_string()]);
        let names: Vec<&str> = matches.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["dist/app.tar", "dist/sub/lib.so"]);
    }

    #[test]
    fn unmatched_pattern_is_not_an_error() {
        let ws = tempfile::tempdir().unwrap();
        assert!(collect_matches(ws.path(), &["nothing/*".to_string()]).is_empty());
    }

    #[test]
    fn duplicate_matches_deduplicated() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "out/a.txt", "a");
        let matches = collect_matches(
            ws.path(),
            &["out/*.txt".to_string(), "out/a.txt".to_string()],
        );
        assert_eq!(matches.len(), 1);
    }

    fn record(path: &Path, sha256: Option<&str>) -> ArtifactRecord {
        ArtifactRecord {
            id: uuid::Uuid::now_v7(),
            build_id: uuid::Uuid::now_v7(),
            filename: "a.txt".into(),
            path: path.to_string_lossy().into_owned(),
            size: 1,
            content_type: None,
            sha256: sha256.map(String::from),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn verify_detects_intact_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "payload").unwrap();
        let sha = hex::encode(Sha256::digest(b"payload"));

        let outcome = verify_record(&record(&file, Some(&sha))).await;
        assert_eq!(outcome.valid, Some(true));
    }

    #[tokio::test]
    async fn verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "payload").unwrap();
        let sha = hex::encode(Sha256::digest(b"payload"));
        std::fs::write(&file, "tampered").unwrap();

        let outcome = verify_record(&record(&file, Some(&sha))).await;
        assert_eq!(outcome.valid, Some(false));
        assert_ne!(outcome.expected, outcome.computed);
    }

    #[tokio::test]
    async fn verify_without_hash_is_indeterminate() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "payload").unwrap();

        let outcome = verify_record(&record(&file, None)).await;
        assert_eq!(outcome.valid, None);
        assert!(outcome.reason.is_some());
    }

    #[tokio::test]
    async fn verify_missing_file_is_indeterminate() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = verify_record(&record(&dir.path().join("gone.txt"), Some("ab"))).await;
        assert_eq!(outcome.valid, None);
        assert!(outcome.reason.as_deref().unwrap().contains("file missing"));
    }
}
