use anyhow::{Context, Result};
use git2::{BranchType, DiffOptions, Repository, Status, StatusOptions, WorktreeAddOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::env::WORKSPACE_DIR;

/// One line added relative to a base ref.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddedLine {
    pub file: String,
    pub content: String,
}

/// Line counts of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiffSize {
    pub insertions: usize,
    pub deletions: usize,
}

impl DiffSize {
    pub fn total(&self) -> usize {
        self.insertions + self.deletions
    }
}

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Whether `dir` is inside a git repository.
    pub fn is_repo(dir: &Path) -> bool {
        Repository::discover(dir).is_ok()
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Name of the checked-out branch, if any.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if head.is_branch() {
            head.shorthand().map(|s| s.to_string())
        } else {
            None
        }
    }

    /// Paths with uncommitted changes (staged, unstaged or untracked), excluding convoy's own state.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;

        let mut files: Vec<String> = statuses
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT && !entry.status().is_ignored())
            .filter_map(|entry| entry.path().map(|p| p.to_string()))
            .filter(|p| !is_convoy_path(p))
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Lines added in the working tree (index and untracked files included) relative to `base_ref`.
    pub fn added_lines(&self, base_ref: &str) -> Result<Vec<AddedLine>> {
        let tree = match self.repo.revparse_single(base_ref) {
            Ok(obj) => Some(
                obj.peel_to_tree()
                    .with_context(|| format!("'{}' does not resolve to a tree", base_ref))?,
            ),
            Err(_) if self.get_head_commit().is_none() => None,
            Err(e) => return Err(e).with_context(|| format!("Unknown git ref '{}'", base_ref)),
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(tree.as_ref(), Some(&mut opts))?;

        let mut added = Vec::new();
        diff.foreach(
            &mut |_delta, _progress| true,
            None,
            None,
            Some(&mut |delta, _hunk, line| {
                if line.origin() == '+'
                    && let Some(path) = delta.new_file().path()
                {
                    let file = path.to_string_lossy().to_string();
                    if !is_convoy_path(&file) {
                        added.push(AddedLine {
                            file,
                            content: String::from_utf8_lossy(line.content())
                                .trim_end_matches(['\n', '\r'])
                                .to_string(),
                        });
                    }
                }
                true
            }),
        )?;
        Ok(added)
    }

    /// Insertions and deletions from commit `since_sha` to the working tree.
    pub fn diff_size_since(&self, since_sha: &str) -> Result<DiffSize> {
        let oid = git2::Oid::from_str(since_sha)?;
        let tree = self.repo.find_commit(oid)?.tree()?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;
        let stats = diff.stats()?;
        Ok(DiffSize {
            insertions: stats.insertions(),
            deletions: stats.deletions(),
        })
    }

    /// Create `branch` from HEAD if it doesn't exist, then check it out.
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        let head = self
            .get_head_commit()
            .context("Cannot create a branch in a repository with no commits")?;
        if self.repo.find_branch(branch, BranchType::Local).is_err() {
            self.repo
                .branch(branch, &head, false)
                .with_context(|| format!("Failed to create branch {}", branch))?;
        }
        let refname = format!("refs/heads/{}", branch);
        self.repo
            .set_head(&refname)
            .with_context(|| format!("Failed to switch HEAD to {}", branch))?;
        self.repo
            .checkout_head(Some(git2::build::CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out {}", branch))?;
        Ok(())
    }

    /// Add a worktree named `name` at `path` with `branch` (created from HEAD if missing).
    pub fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<()> {
        let head = self
            .get_head_commit()
            .context("Cannot create a worktree in a repository with no commits")?;
        let branch_ref = match self.repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing,
            Err(_) => self
                .repo
                .branch(branch, &head, false)
                .with_context(|| format!("Failed to create branch {}", branch))?,
        };
        let reference = branch_ref.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        self.repo
            .worktree(name, path, Some(&opts))
            .with_context(|| format!("Failed to add worktree {} at {}", name, path.display()))?;
        Ok(())
    }
}

fn is_convoy_path(path: &str) -> bool {
    path == WORKSPACE_DIR || path.starts_with(&format!("{}/", WORKSPACE_DIR))
}
