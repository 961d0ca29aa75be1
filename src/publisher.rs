//! Publish orchestrator.
//!
//! Drives one run through `Validating → Collecting → Provisioning →
//! Uploading → Assembling → Committing → Updated`.  Any stage may fail into
//! the terminal `Failed` state; the error is caught here and folded into the
//! returned [`PublishResult`], which is produced exactly once per run.
//!
//! Store calls are issued one at a time.  Blobs always exist before the tree
//! that names them, the tree before the commit, and the branch ref is moved
//! only after the commit exists, so the published content becomes visible in
//! a single ref update.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collector::{collect, CollectPolicy};
use crate::config::PublishConfig;
use crate::error::{PublishError, StoreError};
use crate::metrics::{MetricsRegistry, UploadOutcome};
use crate::model::{
    FileEntry, FileFailure, FileStatus, PublishResult, PublishState, RepositoryConfig, TreeEntry,
};
use crate::pacing::Pacer;
use crate::provisioner::{InitPoll, Provisioned, Provisioner};
use crate::store::{cancellable, ObjectStore};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub commit_message: String,
    pub init_poll: InitPoll,
}

impl PublishOptions {
    pub fn from_config(config: &PublishConfig) -> Self {
        Self {
            commit_message: config.commit_message.clone(),
            init_poll: InitPoll {
                attempts: config.init_poll_attempts,
                interval: Duration::from_millis(config.init_poll_interval_ms),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Mutable bookkeeping for a single run.
struct Run {
    state: PublishState,
    repo_url: Option<String>,
    commit_sha: Option<String>,
    entries: Vec<FileEntry>,
    unreadable: Vec<FileFailure>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: PublishState::Validating,
            repo_url: None,
            commit_sha: None,
            entries: Vec::new(),
            unreadable: Vec::new(),
        }
    }

    fn enter(&mut self, next: PublishState) {
        debug_assert!(next > self.state && !self.state.is_terminal());
        info!(from = %self.state, to = %next, "publish state transition");
        self.state = next;
    }
}

/// Uploads between two progress lines at info level.
const PROGRESS_EVERY: usize = 20;

fn progress_due(done: usize, total: usize) -> bool {
    done == total || done % PROGRESS_EVERY == 0
}

/// Wrap a stage error, keeping cancellation distinguishable.
fn stage_error(err: StoreError, wrap: fn(StoreError) -> PublishError) -> PublishError {
    match err {
        StoreError::Cancelled => PublishError::Cancelled,
        other => wrap(other),
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct Publisher<S> {
    store: S,
    options: PublishOptions,
    pacer: Pacer,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
}

impl<S: ObjectStore> Publisher<S> {
    pub fn new(
        store: S,
        options: PublishOptions,
        pacer: Pacer,
        metrics: MetricsRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            options,
            pacer,
            metrics,
            cancel,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Publish the tree under `source` as the new repository `repo`.
    ///
    /// Never returns an error directly: failures are reported through
    /// [`PublishResult::error`] together with whatever progress was made.
    #[instrument(skip_all, fields(repo = %repo.name, source = %source.display()))]
    pub async fn publish(
        &mut self,
        source: &Path,
        repo: &RepositoryConfig,
        policy: &CollectPolicy,
    ) -> PublishResult {
        let started = Instant::now();
        let mut run = Run::new();
        let outcome = self.execute(&mut run, source, repo, policy).await;
        self.metrics
            .metrics
            .publish_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        self.finish(run, outcome)
    }

    fn check_cancelled(&self) -> Result<(), PublishError> {
        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        run: &mut Run,
        source: &Path,
        repo: &RepositoryConfig,
        policy: &CollectPolicy,
    ) -> Result<(), PublishError> {
        // Validating
        self.check_cancelled()?;
        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(PublishError::InvalidSource(format!(
                    "{} is not a directory",
                    source.display()
                )));
            }
            Err(e) => {
                return Err(PublishError::InvalidSource(format!(
                    "{}: {e}",
                    source.display()
                )));
            }
        }

        run.enter(PublishState::Collecting);
        self.check_cancelled()?;
        let root = source.to_path_buf();
        let walk_policy = policy.clone();
        let collection = tokio::task::spawn_blocking(move || collect(&root, &walk_policy))
            .await
            .map_err(|e| PublishError::Collection(format!("collector task failed: {e}")))??;
        for _ in &collection.unreadable {
            self.metrics.metrics.record_file(UploadOutcome::Skipped);
        }
        run.entries = collection.entries;
        run.unreadable = collection.unreadable;
        if run.entries.is_empty() {
            return Err(PublishError::NothingToPublish);
        }

        run.enter(PublishState::Provisioning);
        self.check_cancelled()?;
        let Provisioned {
            repo: info,
            head,
            degraded,
        } = Provisioner::new(&self.store, self.options.init_poll, &self.cancel)
            .provision(repo)
            .await?;
        run.repo_url = Some(info.html_url.clone());
        if !degraded.is_empty() {
            warn!(steps = degraded.len(), "repository metadata partially applied");
        }

        run.enter(PublishState::Uploading);
        self.check_cancelled()?;
        self.upload_all(&info.name, &mut run.entries).await?;

        run.enter(PublishState::Assembling);
        self.check_cancelled()?;
        let tree_entries: Vec<TreeEntry> =
            run.entries.iter().filter_map(FileEntry::tree_entry).collect();
        if tree_entries.is_empty() {
            return Err(PublishError::NoFilesUploaded);
        }
        let head = match head {
            Some(commit) => Some(commit),
            None => {
                let late = cancellable(
                    &self.cancel,
                    self.store
                        .default_branch_head(&info.name, &info.default_branch),
                )
                .await
                .map_err(|e| stage_error(e, PublishError::TreeCreation))?;
                if let Some(commit) = &late {
                    info!(%commit, "initial commit appeared during upload");
                }
                late
            }
        };
        let base_tree = match &head {
            Some(commit) => Some(
                cancellable(&self.cancel, self.store.commit_tree(&info.name, commit))
                    .await
                    .map_err(|e| stage_error(e, PublishError::TreeCreation))?,
            ),
            None => None,
        };
        let tree = cancellable(
            &self.cancel,
            self.store
                .create_tree(&info.name, &tree_entries, base_tree.as_deref()),
        )
        .await
        .map_err(|e| stage_error(e, PublishError::TreeCreation))?;
        debug!(%tree, entries = tree_entries.len(), "tree created");

        run.enter(PublishState::Committing);
        self.check_cancelled()?;
        let commit = cancellable(
            &self.cancel,
            self.store.create_commit(
                &info.name,
                &self.options.commit_message,
                &tree,
                head.as_deref(),
            ),
        )
        .await
        .map_err(|e| stage_error(e, PublishError::CommitCreation))?;
        run.commit_sha = Some(commit.sha.clone());
        debug!(commit = %commit.sha, url = %commit.html_url, "commit created");

        self.check_cancelled()?;
        let ref_name = format!("heads/{}", info.default_branch);
        let moved = match head {
            Some(_) => {
                cancellable(
                    &self.cancel,
                    self.store
                        .update_ref(&info.name, &ref_name, &commit.sha, true),
                )
                .await
            }
            None => {
                cancellable(
                    &self.cancel,
                    self.store.create_ref(&info.name, &ref_name, &commit.sha),
                )
                .await
            }
        };
        moved.map_err(|e| match e {
            StoreError::Cancelled => PublishError::Cancelled,
            source => PublishError::RefUpdateFailed {
                commit: commit.sha.clone(),
                source,
            },
        })?;

        run.enter(PublishState::Updated);
        info!(commit = %commit.sha, url = %info.html_url, "repository published");
        Ok(())
    }

    /// Upload every entry in order; per-file failures are recorded on the
    /// entry and do not stop the loop.
    async fn upload_all(&mut self, repo: &str, entries: &mut [FileEntry]) -> Result<(), PublishError> {
        let total = entries.len();
        for (index, entry) in entries.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.pacer.wait(self.store.rate_limit(), &self.cancel).await {
                None => break,
                Some(decision) if decision.throttled => {
                    self.metrics.metrics.throttle_waits.inc();
                }
                Some(_) => {}
            }

            entry.begin_upload();
            let started = Instant::now();
            let result = cancellable(&self.cancel, self.store.create_blob(repo, &entry.content)).await;
            match result {
                Ok(id) => {
                    self.pacer.mark();
                    let metrics = &self.metrics.metrics;
                    metrics.blob_bytes.inc_by(entry.content.len() as u64);
                    metrics
                        .blob_upload_seconds
                        .observe(started.elapsed().as_secs_f64());
                    metrics.record_file(UploadOutcome::Uploaded);
                    debug!(
                        path = %entry.path,
                        blob = %id,
                        n = index + 1,
                        total,
                        "uploaded"
                    );
                    entry.mark_uploaded(id);
                }
                Err(e) => {
                    if e.is_local() {
                        self.metrics.metrics.record_file(UploadOutcome::Skipped);
                    } else {
                        self.pacer.mark();
                        self.metrics.metrics.record_file(UploadOutcome::Failed);
                    }
                    if e != StoreError::Cancelled {
                        warn!(
                            path = %entry.path,
                            error = %e,
                            rate_limited = e.is_rate_limited(),
                            "upload failed"
                        );
                    }
                    entry.mark_failed(e);
                }
            }
            if progress_due(index + 1, total) {
                info!(done = index + 1, total, "upload progress");
            }
        }

        let uploaded = entries
            .iter()
            .filter(|e| e.status == FileStatus::Uploaded)
            .count();
        info!(uploaded, total, "blob upload finished");
        self.check_cancelled()
    }

    fn finish(&self, run: Run, outcome: Result<(), PublishError>) -> PublishResult {
        let upload_started = run.state >= PublishState::Uploading;
        let mut files_uploaded = 0;
        let mut files_skipped = run.unreadable.len();
        let mut files_failed = 0;
        let mut failures = run.unreadable;

        for entry in &run.entries {
            match (entry.status, &entry.error) {
                (FileStatus::Uploaded, _) => files_uploaded += 1,
                (FileStatus::Failed, Some(e)) if e.is_local() => {
                    files_skipped += 1;
                    failures.push(FileFailure {
                        path: entry.path.clone(),
                        reason: e.to_string(),
                    });
                }
                (FileStatus::Failed, e) => {
                    files_failed += 1;
                    failures.push(FileFailure {
                        path: entry.path.clone(),
                        reason: e
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "upload failed".to_string()),
                    });
                }
                (FileStatus::Pending | FileStatus::Uploading, _) if upload_started => {
                    files_skipped += 1;
                    self.metrics.metrics.record_file(UploadOutcome::Skipped);
                    failures.push(FileFailure {
                        path: entry.path.clone(),
                        reason: "not uploaded before the run stopped".to_string(),
                    });
                }
                _ => {}
            }
        }

        let (success, error, final_state, failed_in) = match outcome {
            Ok(()) => (true, None, PublishState::Updated, None),
            Err(e) => {
                error!(state = %run.state, error = %e, "publish failed");
                (false, Some(e), PublishState::Failed, Some(run.state))
            }
        };

        PublishResult {
            success,
            repo_url: run.repo_url,
            commit_sha: run.commit_sha,
            files_uploaded,
            files_skipped,
            files_failed,
            error,
            final_state,
            failed_in,
            failures,
        }
    }
}
