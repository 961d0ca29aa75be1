//! Object store abstraction layer.
//!
//! Provides the [`ObjectStore`] trait that encapsulates every remote call a
//! publish run makes: repository provisioning plus the git data API
//! (blob → tree → commit → ref).  The publisher dispatches through this trait
//! so that no URL construction or response parsing leaks outside this module.

pub mod github;
pub mod memory;
pub mod rate_limit;

use std::collections::BTreeSet;
use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::model::{CommitInfo, LabelSpec, RepoInfo, RepositoryConfig, TreeEntry};

pub use rate_limit::RateLimitSnapshot;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Remote repository host and content-addressable object store.
///
/// `repo` arguments are bare repository names; the owner is fixed by the
/// store's authenticated session.  Ref names are given relative to `refs/`
/// (e.g. `heads/main`).
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether a repository with this name already exists for the owner.
    async fn repository_exists(&self, name: &str) -> StoreResult<bool>;

    /// Create the repository with an auto-generated initial commit.
    async fn create_repository(&self, config: &RepositoryConfig) -> StoreResult<RepoInfo>;

    /// Replace the repository's topic labels.
    async fn set_topics(&self, repo: &str, topics: &BTreeSet<String>) -> StoreResult<()>;

    /// Create one issue label.
    async fn create_label(&self, repo: &str, label: &LabelSpec) -> StoreResult<()>;

    /// Commit at the head of `branch`, or `None` when the branch has no
    /// commits yet.
    async fn default_branch_head(&self, repo: &str, branch: &str) -> StoreResult<Option<String>>;

    /// Tree referenced by an existing commit.
    async fn commit_tree(&self, repo: &str, commit: &str) -> StoreResult<String>;

    /// Store `content` as a blob and return its identifier.
    ///
    /// Fails with [`StoreError::PayloadTooLarge`] before issuing any request
    /// when `content` exceeds [`ObjectStore::max_blob_bytes`].
    async fn create_blob(&self, repo: &str, content: &[u8]) -> StoreResult<String>;

    /// Create a tree, layered onto `base_tree` when given.
    async fn create_tree(
        &self,
        repo: &str,
        entries: &[TreeEntry],
        base_tree: Option<&str>,
    ) -> StoreResult<String>;

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parent: Option<&str>,
    ) -> StoreResult<CommitInfo>;

    /// Point an existing ref at `commit`.
    async fn update_ref(&self, repo: &str, ref_name: &str, commit: &str, force: bool)
        -> StoreResult<()>;

    /// Create a ref that does not exist yet.
    async fn create_ref(&self, repo: &str, ref_name: &str, commit: &str) -> StoreResult<()>;

    /// Byte ceiling enforced by [`ObjectStore::create_blob`].
    fn max_blob_bytes(&self) -> u64;

    /// Latest rate-limit budget reported by the remote, if it reports one.
    fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        None
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reject blobs above `limit` without touching the network.
pub(crate) fn check_blob_size(content: &[u8], limit: u64) -> StoreResult<()> {
    let size = content.len() as u64;
    if size > limit {
        return Err(StoreError::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Drive a store call to completion unless `cancel` fires first.
///
/// A cancelled call may still have been applied remotely; the caller only
/// learns that it must not build on the result.
pub async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StoreError::Cancelled),
        result = call => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_size_limit_is_inclusive() {
        assert!(check_blob_size(&[0u8; 4], 4).is_ok());
        assert_eq!(
            check_blob_size(&[0u8; 5], 4),
            Err(StoreError::PayloadTooLarge { size: 5, limit: 4 })
        );
    }

    #[tokio::test]
    async fn cancellable_passes_result_through() {
        let token = CancellationToken::new();
        let value = cancellable(&token, async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancellable_short_circuits_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = cancellable(&token, std::future::pending::<StoreResult<()>>()).await;
        assert_eq!(result, Err(StoreError::Cancelled));
    }
}
