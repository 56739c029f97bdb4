//! Per-build workspace management.
//!
//! Each build gets an exclusive directory under the workspace root. When
//! the pipeline declares a source, a shallow checkout is performed and
//! the repo is probed for an in-repo workflow file, which then replaces
//! the stored pipeline. Workspaces are deleted after the build unless a
//! retention override keeps them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use chengis_config::workflow::{MAX_WORKFLOW_BYTES, WORKFLOW_FILE_CANDIDATES, parse_workflow};
use chengis_core::pipeline::{Pipeline, SourceSpec};
use chengis_core::{Error, ResourceId, Result};

pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create `workspace-root/<job>/<build-id>/`, exclusive to one build.
    pub async fn create(&self, job_name: &str, build_id: ResourceId) -> Result<PathBuf> {
        let job_dir = sanitize(job_name);
        let dir = self.root.join(job_dir).join(build_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Internal(format!("create workspace: {e}")))?;
        Ok(dir)
    }

    /// Shallow-checkout the declared source into the workspace.
    pub async fn checkout(&self, dir: &Path, source: &SourceSpec) -> Result<()> {
        let mut command = Command::new("git");
        command.arg("clone");
        if let Some(depth) = source.depth {
            command.args(["--depth", &depth.to_string()]);
        } else {
            command.args(["--depth", "1"]);
        }
        if let Some(branch) = &source.branch {
            command.args(["--branch", branch]);
        }
        command
            .arg(&source.url)
            .arg(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(url = %source.url, branch = ?source.branch, "checking out source");
        let output = command
            .output()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("git clone: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExecutionFailed(format!(
                "git clone {} failed: {}",
                source.url,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Look for an in-repo workflow file and parse it. A `Chengisfile`
    /// without a YAML workflow is noted but not parsed here; its reader
    /// lives outside the core.
    pub async fn discover_pipeline(&self, dir: &Path) -> Result<Option<Pipeline>> {
        for candidate in WORKFLOW_FILE_CANDIDATES {
            let path = dir.join(candidate);
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if metadata.len() > MAX_WORKFLOW_BYTES as u64 {
                return Err(Error::InvalidInput(format!(
                    "{candidate} exceeds {MAX_WORKFLOW_BYTES} bytes"
                )));
            }
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Internal(format!("read {candidate}: {e}")))?;
            let pipeline = parse_workflow(&text)
                .map_err(|e| Error::InvalidInput(format!("{candidate}: {e}")))?;
            debug!(file = candidate, "using in-repo pipeline");
            return Ok(Some(pipeline));
        }
        if tokio::fs::metadata(dir.join("Chengisfile")).await.is_ok() {
            warn!("Chengisfile present but no YAML workflow; using stored pipeline");
        }
        Ok(None)
    }

    /// Remove the workspace unless retention keeps it.
    pub async fn cleanup(&self, dir: &Path, retain: bool) {
        if retain {
            debug!(dir = %dir.display(), "retaining workspace");
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove workspace");
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_isolated_directories() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let a = manager.create("my-job", ResourceId::new()).await.unwrap();
        let b = manager.create("my-job", ResourceId::new()).await.unwrap();
        assert_ne!(a, b);
        assert!(a.exists());
        assert!(b.exists());
    }

    #[tokio::test]
    async fn sanitizes_job_names() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let dir = manager.create("team/app:v2", ResourceId::new()).await.unwrap();
        assert!(dir.starts_with(root.path().join("team_app_v2")));
    }

    #[tokio::test]
    async fn empty_workspace_has_no_pipeline() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let dir = manager.create("job", ResourceId::new()).await.unwrap();
        assert!(manager.discover_pipeline(&dir).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discovers_workflow_file() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let dir = manager.create("job", ResourceId::new()).await.unwrap();
        tokio::fs::create_dir_all(dir.join(".chengis")).await.unwrap();
        tokio::fs::write(
            dir.join(".chengis/workflow.yml"),
            "name: repo-pipeline\nstages:\n  - name: S\n    steps:\n      - name: a\n        run: \"true\"\n",
        )
        .await
        .unwrap();

        let pipeline = manager.discover_pipeline(&dir).await.unwrap().unwrap();
        assert_eq!(pipeline.name, "repo-pipeline");
    }

    #[tokio::test]
    async fn oversized_workflow_rejected() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let dir = manager.create("job", ResourceId::new()).await.unwrap();
        let padding = "#".repeat(MAX_WORKFLOW_BYTES + 1);
        tokio::fs::write(dir.join("chengis.yml"), padding).await.unwrap();
        assert!(manager.discover_pipeline(&dir).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_removes_unless_retained() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let dir = manager.create("job", ResourceId::new()).await.unwrap();
        manager.cleanup(&dir, true).await;
        assert!(dir.exists());
        manager.cleanup(&dir, false).await;
        assert!(!dir.exists());
    }
}
