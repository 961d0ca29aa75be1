//! Data model shared by the collector, the object store clients and the
//! publish orchestrator.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PublishError, StoreError};

// ---------------------------------------------------------------------------
// Repository configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn is_private(self) -> bool {
        self == Self::Private
    }
}

/// An issue label created alongside the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub description: String,
}

/// Settings for the remote repository container.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub description: String,
    /// Topic labels; order is irrelevant.
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default = "bool_true")]
    pub has_issues: bool,
    #[serde(default)]
    pub has_wiki: bool,
    #[serde(default)]
    pub has_projects: bool,
    #[serde(default)]
    pub labels: Vec<LabelSpec>,
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
impl RepositoryConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::Public,
            description: String::new(),
            topics: BTreeSet::new(),
            homepage: None,
            has_issues: true,
            has_wiki: false,
            has_projects: false,
            labels: Vec::new(),
        }
    }
}

/// Identity of a repository as reported by the remote after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    pub default_branch: String,
}

// ---------------------------------------------------------------------------
// Files and trees
// ---------------------------------------------------------------------------

/// Git file mode of a tree entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FileMode {
    #[default]
    Regular,
    Executable,
}

impl FileMode {
    pub fn as_git_mode(self) -> &'static str {
        match self {
            Self::Regular => "100644",
            Self::Executable => "100755",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

/// One collected file and its upload progress.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Repository-relative path with `/` separators.
    pub path: String,
    pub content: Vec<u8>,
    pub mode: FileMode,
    pub remote_id: Option<String>,
    pub status: FileStatus,
    pub error: Option<StoreError>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content: Vec<u8>, mode: FileMode) -> Self {
        Self {
            path: path.into(),
            content,
            mode,
            remote_id: None,
            status: FileStatus::Pending,
            error: None,
        }
    }

    pub(crate) fn begin_upload(&mut self) {
        debug_assert_eq!(self.status, FileStatus::Pending);
        self.status = FileStatus::Uploading;
    }

    pub(crate) fn mark_uploaded(&mut self, remote_id: String) {
        debug_assert_eq!(self.status, FileStatus::Uploading);
        self.remote_id = Some(remote_id);
        self.status = FileStatus::Uploaded;
    }

    pub(crate) fn mark_failed(&mut self, error: StoreError) {
        debug_assert_eq!(self.status, FileStatus::Uploading);
        self.error = Some(error);
        self.status = FileStatus::Failed;
    }

    /// The tree entry for this file, if its blob exists remotely.
    pub fn tree_entry(&self) -> Option<TreeEntry> {
        match (self.status, &self.remote_id) {
            (FileStatus::Uploaded, Some(id)) => Some(TreeEntry {
                path: self.path.clone(),
                mode: self.mode,
                object_type: ObjectType::Blob,
                remote_id: id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Blob,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeEntry {
    pub path: String,
    pub mode: FileMode,
    pub object_type: ObjectType,
    pub remote_id: String,
}

/// A created commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub html_url: String,
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Stages of a publish run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PublishState {
    Validating,
    Collecting,
    Provisioning,
    Uploading,
    Assembling,
    Committing,
    Updated,
    Failed,
}

impl PublishState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Updated | Self::Failed)
    }
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::Collecting => "collecting",
            Self::Provisioning => "provisioning",
            Self::Uploading => "uploading",
            Self::Assembling => "assembling",
            Self::Committing => "committing",
            Self::Updated => "updated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A file that did not make it into the published tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// Aggregate outcome of one publish run.
#[derive(Debug)]
pub struct PublishResult {
    pub success: bool,
    pub repo_url: Option<String>,
    pub commit_sha: Option<String>,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub error: Option<PublishError>,
    /// Stage in which the run ended; `Updated` on success.
    pub final_state: PublishState,
    /// The stage that was active when a failure occurred.
    pub failed_in: Option<PublishState>,
    pub failures: Vec<FileFailure>,
}

impl PublishResult {
    pub fn files_total(&self) -> usize {
        self.files_uploaded + self.files_skipped + self.files_failed
    }
}
