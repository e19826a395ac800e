//! # Git Worktree Isolation
//!
//! Gives each concurrently editing agent its own checkout. Every agent gets
//! a branch `hivemind/<agent_id>` checked out in
//! `.hivemind/worktrees/<agent_id>`.

use anyhow::{Context, Result};
use git2::{DiffOptions, DiffStatsFormat, Repository};
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::state::io::get_runtime_path;

/// Branch prefix owned by the swarm
pub const BRANCH_PREFIX: &str = "hivemind/";

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    base_dir: PathBuf,
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self::new(get_runtime_path().join("worktrees"))
    }
}

impl WorktreeManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn worktree_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    pub fn branch_name(id: &str) -> String {
        format!("{}{}", BRANCH_PREFIX, id)
    }

    /// Whether `path` is inside a git repository
    pub fn is_git_repo(path: &Path) -> bool {
        Repository::discover(path).is_ok()
    }

    /// Check out HEAD of `repo` into a fresh worktree for agent `id`
    pub async fn create_worktree(&self, repo: &Path, id: &str) -> Result<PathBuf> {
        let path = self.worktree_path(id);
        let branch = Self::branch_name(id);

        if path.exists() {
            tracing::debug!(agent_id = %id, "Removing stale worktree");
            self.cleanup_worktree(repo, id).await?;
        }

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("Failed to create worktree root: {:?}", self.base_dir))?;

        let path_arg = path.to_string_lossy().to_string();
        run_git(repo, &["worktree", "add", "-B", &branch, &path_arg, "HEAD"])
            .await
            .with_context(|| format!("Failed to create worktree for {}", id))?;

        tracing::debug!(agent_id = %id, path = %path.display(), "Created worktree");
        Ok(path)
    }

    /// Remove the worktree, its directory and its branch
    pub async fn cleanup_worktree(&self, repo: &Path, id: &str) -> Result<()> {
        let path = self.worktree_path(id);
        remove_worktree(repo, &path, &Self::branch_name(id)).await?;
        let _ = run_git(repo, &["worktree", "prune"]).await;
        Ok(())
    }

    /// Remove every `hivemind/*` worktree of `repo`. Returns how many were removed.
    pub async fn cleanup_all_worktrees(&self, repo: &Path) -> Result<usize> {
        let listing = run_git(repo, &["worktree", "list", "--porcelain"]).await?;
        let owned = parse_owned_worktrees(&listing);

        for (path, branch) in &owned {
            if let Err(e) = remove_worktree(repo, path, branch).await {
                tracing::warn!(path = %path.display(), "Failed to remove worktree: {}", e);
            }
        }

        let _ = run_git(repo, &["worktree", "prune"]).await;
        Ok(owned.len())
    }
}

async fn remove_worktree(repo: &Path, path: &Path, branch: &str) -> Result<()> {
    let path_arg = path.to_string_lossy().to_string();
    // Missing worktrees and branches are fine here
    let _ = run_git(repo, &["worktree", "remove", "--force", &path_arg]).await;

    if path.exists() {
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("Failed to remove worktree directory: {:?}", path))?;
    }

    let _ = run_git(repo, &["branch", "-D", branch]).await;
    Ok(())
}

/// (path, branch) for each worktree on a `hivemind/` branch
fn parse_owned_worktrees(porcelain: &str) -> Vec<(PathBuf, String)> {
    let mut owned = Vec::new();
    let mut current: Option<PathBuf> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            current = Some(PathBuf::from(path));
        } else if let Some(reference) = line.strip_prefix("branch ") {
            let branch = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            if branch.starts_with(BRANCH_PREFIX) {
                if let Some(path) = current.take() {
                    owned.push((path, branch.to_string()));
                }
            }
        } else if line.is_empty() {
            current = None;
        }
    }
    owned
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Diffstat of the working tree against HEAD, e.g. for the evidence ledger
pub fn diff_summary(repo_path: &Path) -> Result<String> {
    let repo = Repository::discover(repo_path)
        .with_context(|| format!("Failed to open repository at {:?}", repo_path))?;

    let head_tree = repo
        .head()
        .ok()
        .and_then(|head| head.peel_to_tree().ok());

    let mut options = DiffOptions::new();
    options.include_untracked(true).recurse_untracked_dirs(true);

    let diff = repo
        .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut options))
        .context("Failed to diff working tree")?;
    let stats = diff.stats().context("Failed to compute diff stats")?;

    if stats.files_changed() == 0 {
        return Ok("No changes.".to_string());
    }

    let buf = stats
        .to_buf(DiffStatsFormat::FULL, 80)
        .context("Failed to format diff stats")?;
    Ok(String::from_utf8_lossy(&buf).trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    fn init_repo(dir: &Path) {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Hivemind Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
    }

    #[test]
    fn test_is_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!WorktreeManager::is_git_repo(dir.path()));
        Repository::init(dir.path()).unwrap();
        assert!(WorktreeManager::is_git_repo(dir.path()));
    }

    #[test]
    fn test_branch_name() {
        assert_eq!(
            WorktreeManager::branch_name("code-coder-0"),
            "hivemind/code-coder-0"
        );
    }

    #[test]
    fn test_parse_porcelain() {
        let listing = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                       worktree /wt/code-coder-0\nHEAD abc\nbranch refs/heads/hivemind/code-coder-0\n\n\
                       worktree /wt/detached\nHEAD abc\ndetached\n";
        let owned = parse_owned_worktrees(listing);
        assert_eq!(
            owned,
            vec![(
                PathBuf::from("/wt/code-coder-0"),
                "hivemind/code-coder-0".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_create_and_cleanup_round_trip() {
        if !git_available() {
            return;
        }
        let repo_dir = tempfile::tempdir().unwrap();
        let wt_root = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());

        let manager = WorktreeManager::new(wt_root.path().join("worktrees"));
        let path = manager
            .create_worktree(repo_dir.path(), "code-coder-0")
            .await
            .unwrap();
        assert!(path.join("README.md").exists());

        let repo = Repository::open(repo_dir.path()).unwrap();
        assert!(repo
            .find_branch("hivemind/code-coder-0", git2::BranchType::Local)
            .is_ok());

        manager
            .cleanup_worktree(repo_dir.path(), "code-coder-0")
            .await
            .unwrap();
        assert!(!path.exists());
        assert!(repo
            .find_branch("hivemind/code-coder-0", git2::BranchType::Local)
            .is_err());
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        if !git_available() {
            return;
        }
        let repo_dir = tempfile::tempdir().unwrap();
        let wt_root = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());

        let manager = WorktreeManager::new(wt_root.path().join("worktrees"));
        let a = manager.create_worktree(repo_dir.path(), "a").await.unwrap();
        let b = manager.create_worktree(repo_dir.path(), "b").await.unwrap();

        let removed = manager.cleanup_all_worktrees(repo_dir.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_diff_summary() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert_eq!(diff_summary(dir.path()).unwrap(), "No changes.");

        std::fs::write(dir.path().join("README.md"), "hello\nworld\n").unwrap();
        let summary = diff_summary(dir.path()).unwrap();
        assert!(summary.contains("README.md"));
        assert!(summary.contains("1 file changed"));
    }
}
