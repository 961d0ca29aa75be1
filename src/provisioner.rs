//! Remote repository provisioning.
//!
//! Creates the target repository (never reusing an existing one), waits for
//! its auto-initialised head commit, then applies topics and labels on a
//! best-effort basis.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::PublishError;
use crate::model::{RepoInfo, RepositoryConfig};
use crate::store::{cancellable, ObjectStore};

/// A freshly created repository.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub repo: RepoInfo,
    /// Head of the default branch after auto-initialisation, if it appeared.
    pub head: Option<String>,
    /// Metadata steps that failed without aborting provisioning.
    pub degraded: Vec<String>,
}

/// How long to wait for the auto-initialised commit to become visible.
#[derive(Debug, Clone, Copy)]
pub struct InitPoll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for InitPoll {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

pub struct Provisioner<'a> {
    store: &'a dyn ObjectStore,
    poll: InitPoll,
    cancel: &'a CancellationToken,
}

impl<'a> Provisioner<'a> {
    pub fn new(store: &'a dyn ObjectStore, poll: InitPoll, cancel: &'a CancellationToken) -> Self {
        Self {
            store,
            poll,
            cancel,
        }
    }

    #[instrument(skip_all, fields(repo = %config.name))]
    pub async fn provision(&self, config: &RepositoryConfig) -> Result<Provisioned, PublishError> {
        let exists = cancellable(self.cancel, self.store.repository_exists(&config.name))
            .await
            .map_err(PublishError::provisioning)?;
        if exists {
            return Err(PublishError::AlreadyExists(config.name.clone()));
        }

        let repo = cancellable(self.cancel, self.store.create_repository(config))
            .await
            .map_err(PublishError::provisioning)?;
        info!(full_name = %repo.full_name, url = %repo.html_url, "repository created");

        let head = self.wait_for_head(&repo).await?;

        let mut degraded = Vec::new();
        if !config.topics.is_empty() {
            match cancellable(self.cancel, self.store.set_topics(&repo.name, &config.topics)).await
            {
                Ok(()) => info!(count = config.topics.len(), "topics configured"),
                Err(e) => {
                    warn!(error = %e, "failed to set topics; continuing");
                    degraded.push(format!("topics: {e}"));
                }
            }
        }
        for label in &config.labels {
            match cancellable(self.cancel, self.store.create_label(&repo.name, label)).await {
                Ok(()) => debug!(label = %label.name, "label created"),
                Err(e) => {
                    warn!(label = %label.name, error = %e, "failed to create label; continuing");
                    degraded.push(format!("label {}: {e}", label.name));
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }

        Ok(Provisioned {
            repo,
            head,
            degraded,
        })
    }

    /// Poll the default branch until the auto-init commit shows up.
    async fn wait_for_head(&self, repo: &RepoInfo) -> Result<Option<String>, PublishError> {
        for attempt in 1..=self.poll.attempts.max(1) {
            let head = cancellable(
                self.cancel,
                self.store
                    .default_branch_head(&repo.name, &repo.default_branch),
            )
            .await
            .map_err(PublishError::provisioning)?;
            if head.is_some() {
                debug!(attempt, "initial commit visible");
                return Ok(head);
            }
            if attempt < self.poll.attempts {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(PublishError::Cancelled),
                    () = tokio::time::sleep(self.poll.interval) => {}
                }
            }
        }
        warn!(
            branch = %repo.default_branch,
            "initial commit never appeared; publishing without a parent"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LabelSpec;
    use crate::store::memory::{MemoryStore, StoreCall};

    fn quick() -> InitPoll {
        InitPoll {
            attempts: 2,
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn creates_repository_and_reports_head() {
        let store = MemoryStore::new("octo", 1024);
        let cancel = CancellationToken::new();
        let mut config = RepositoryConfig::named("widgets");
        config.topics = ["rust".to_string(), "cli".to_string()].into();

        let provisioned = Provisioner::new(&store, quick(), &cancel)
            .provision(&config)
            .await
            .unwrap();

        assert_eq!(provisioned.repo.full_name, "octo/widgets");
        assert!(provisioned.head.is_some());
        assert!(provisioned.degraded.is_empty());
        assert_eq!(store.topics("widgets").await.len(), 2);
    }

    #[tokio::test]
    async fn existing_repository_fails_without_side_effects() {
        let store = MemoryStore::new("octo", 1024);
        store.seed_repository("widgets").await;
        let cancel = CancellationToken::new();

        let err = Provisioner::new(&store, quick(), &cancel)
            .provision(&RepositoryConfig::named("widgets"))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::AlreadyExists(ref n) if n == "widgets"));
        assert_eq!(
            store.calls().await,
            vec![StoreCall::RepositoryExists("widgets".into())]
        );
    }

    #[tokio::test]
    async fn label_failure_is_degraded_success() {
        let store = MemoryStore::new("octo", 1024);
        let cancel = CancellationToken::new();
        let bug = LabelSpec {
            name: "bug".into(),
            color: "d73a4a".into(),
            description: String::new(),
        };
        let mut config = RepositoryConfig::named("widgets");
        config.labels = vec![bug.clone(), bug];

        let provisioned = Provisioner::new(&store, quick(), &cancel)
            .provision(&config)
            .await
            .unwrap();

        assert_eq!(provisioned.degraded.len(), 1);
        assert!(provisioned.degraded[0].starts_with("label bug"));
        assert_eq!(store.labels("widgets").await, vec!["bug"]);
    }

    #[tokio::test]
    async fn cancelled_before_start_issues_no_calls() {
        let store = MemoryStore::new("octo", 1024);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Provisioner::new(&store, quick(), &cancel)
            .provision(&RepositoryConfig::named("widgets"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Cancelled));
        assert!(store.calls().await.is_empty());
    }
}
