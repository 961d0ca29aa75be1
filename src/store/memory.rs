//! In-process [`ObjectStore`] used for dry runs.
//!
//! Objects are content addressed with SHA-256 over a git-style header, so the
//! same bytes always produce the same blob id.  Commits additionally hash a
//! per-store sequence number, which keeps two publishes of identical content
//! distinguishable.  Every call is appended to a log that callers can inspect.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{CommitInfo, FileMode, LabelSpec, RepoInfo, RepositoryConfig, TreeEntry};

use super::{check_blob_size, ObjectStore, StoreResult};

/// One call received by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    RepositoryExists(String),
    CreateRepository(String),
    SetTopics(String),
    CreateLabel(String),
    DefaultBranchHead(String),
    CommitTree(String),
    CreateBlob { size: usize },
    CreateTree { entries: usize, base: Option<String> },
    CreateCommit { tree: String, parent: Option<String> },
    UpdateRef { name: String, commit: String, force: bool },
    CreateRef { name: String, commit: String },
}

impl StoreCall {
    /// Calls that create or move git objects.
    pub fn is_git_write(&self) -> bool {
        matches!(
            self,
            Self::CreateBlob { .. }
                | Self::CreateTree { .. }
                | Self::CreateCommit { .. }
                | Self::UpdateRef { .. }
                | Self::CreateRef { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct StoredCommit {
    tree: String,
    parent: Option<String>,
    message: String,
}

type StoredTree = BTreeMap<String, (FileMode, String)>;

#[derive(Debug)]
struct MemoryRepo {
    topics: BTreeSet<String>,
    labels: Vec<LabelSpec>,
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, StoredTree>,
    commits: HashMap<String, StoredCommit>,
    refs: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    repos: HashMap<String, MemoryRepo>,
    calls: Vec<StoreCall>,
    sequence: u64,
}

pub struct MemoryStore {
    owner: String,
    max_blob_bytes: u64,
    state: Mutex<MemoryState>,
}

fn digest(kind: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind} {}\0", body.len()).as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub(crate) fn blob_id(content: &[u8]) -> String {
    digest("blob", content)
}

fn tree_id(tree: &StoredTree) -> String {
    let mut body = Vec::new();
    for (path, (mode, id)) in tree {
        body.extend_from_slice(format!("{} {path}\0{id}\n", mode.as_git_mode()).as_bytes());
    }
    digest("tree", &body)
}

fn unprocessable(message: impl Into<String>) -> StoreError {
    StoreError::remote(422, message)
}

fn not_found() -> StoreError {
    StoreError::remote(404, "Not Found")
}

impl MemoryState {
    fn repo(&self, name: &str) -> StoreResult<&MemoryRepo> {
        self.repos.get(name).ok_or_else(not_found)
    }

    fn repo_mut(&mut self, name: &str) -> StoreResult<&mut MemoryRepo> {
        self.repos.get_mut(name).ok_or_else(not_found)
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

impl MemoryRepo {
    fn insert_commit(&mut self, commit: StoredCommit, sequence: u64) -> String {
        let body = format!(
            "tree {}\nparent {}\nseq {sequence}\n\n{}",
            commit.tree,
            commit.parent.as_deref().unwrap_or("-"),
            commit.message
        );
        let id = digest("commit", body.as_bytes());
        self.commits.insert(id.clone(), commit);
        id
    }
}

impl MemoryStore {
    pub fn new(owner: impl Into<String>, max_blob_bytes: u64) -> Self {
        Self {
            owner: owner.into(),
            max_blob_bytes,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Snapshot of every call received so far.
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    fn html_url(&self, repo: &str) -> String {
        format!("memory://{}/{repo}", self.owner)
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn repository_exists(&self, name: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::RepositoryExists(name.to_string()));
        Ok(state.repos.contains_key(name))
    }

    async fn create_repository(&self, config: &RepositoryConfig) -> StoreResult<RepoInfo> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(StoreCall::CreateRepository(config.name.clone()));
        if state.repos.contains_key(&config.name) {
            return Err(unprocessable("name already exists on this account"));
        }

        let info = RepoInfo {
            name: config.name.clone(),
            full_name: format!("{}/{}", self.owner, config.name),
            html_url: self.html_url(&config.name),
            default_branch: "main".to_string(),
        };

        // Auto-init: a README in a single root commit on the default branch.
        let readme = format!("# {}\n\n{}\n", config.name, config.description).into_bytes();
        let readme_id = blob_id(&readme);
        let tree: StoredTree =
            BTreeMap::from([("README.md".to_string(), (FileMode::Regular, readme_id.clone()))]);
        let root_tree = tree_id(&tree);

        let sequence = state.next_sequence();
        let mut repo = MemoryRepo {
            topics: BTreeSet::new(),
            labels: Vec::new(),
            blobs: HashMap::from([(readme_id, readme)]),
            trees: HashMap::from([(root_tree.clone(), tree)]),
            commits: HashMap::new(),
            refs: HashMap::new(),
        };
        let root = repo.insert_commit(
            StoredCommit {
                tree: root_tree,
                parent: None,
                message: "Initial commit".to_string(),
            },
            sequence,
        );
        repo.refs.insert(format!("heads/{}", info.default_branch), root);
        state.repos.insert(config.name.clone(), repo);
        Ok(info)
    }

    async fn set_topics(&self, repo: &str, topics: &BTreeSet<String>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::SetTopics(repo.to_string()));
        state.repo_mut(repo)?.topics = topics.clone();
        Ok(())
    }

    async fn create_label(&self, repo: &str, label: &LabelSpec) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CreateLabel(label.name.clone()));
        let repo = state.repo_mut(repo)?;
        if repo.labels.iter().any(|l| l.name == label.name) {
            return Err(unprocessable(format!("label '{}' already exists", label.name)));
        }
        repo.labels.push(label.clone());
        Ok(())
    }

    async fn default_branch_head(&self, repo: &str, branch: &str) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::DefaultBranchHead(branch.to_string()));
        Ok(state.repo(repo)?.refs.get(&format!("heads/{branch}")).cloned())
    }

    async fn commit_tree(&self, repo: &str, commit: &str) -> StoreResult<String> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CommitTree(commit.to_string()));
        state
            .repo(repo)?
            .commits
            .get(commit)
            .map(|c| c.tree.clone())
            .ok_or_else(not_found)
    }

    async fn create_blob(&self, repo: &str, content: &[u8]) -> StoreResult<String> {
        check_blob_size(content, self.max_blob_bytes())?;

        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CreateBlob {
            size: content.len(),
        });
        let id = blob_id(content);
        state
            .repo_mut(repo)?
            .blobs
            .entry(id.clone())
            .or_insert_with(|| content.to_vec());
        Ok(id)
    }

    async fn create_tree(
        &self,
        repo: &str,
        entries: &[TreeEntry],
        base_tree: Option<&str>,
    ) -> StoreResult<String> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CreateTree {
            entries: entries.len(),
            base: base_tree.map(String::from),
        });
        let repo = state.repo_mut(repo)?;

        let mut tree = match base_tree {
            Some(base) => repo
                .trees
                .get(base)
                .cloned()
                .ok_or_else(|| unprocessable(format!("base_tree {base} does not exist")))?,
            None => StoredTree::new(),
        };
        for entry in entries {
            if !repo.blobs.contains_key(&entry.remote_id) {
                return Err(unprocessable(format!(
                    "tree entry {} references unknown blob {}",
                    entry.path, entry.remote_id
                )));
            }
            tree.insert(entry.path.clone(), (entry.mode, entry.remote_id.clone()));
        }

        let id = tree_id(&tree);
        repo.trees.insert(id.clone(), tree);
        Ok(id)
    }

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parent: Option<&str>,
    ) -> StoreResult<CommitInfo> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CreateCommit {
            tree: tree.to_string(),
            parent: parent.map(String::from),
        });
        let sequence = state.next_sequence();
        let html_base = self.html_url(repo);
        let repo = state.repo_mut(repo)?;

        if !repo.trees.contains_key(tree) {
            return Err(unprocessable(format!("tree {tree} does not exist")));
        }
        if let Some(p) = parent {
            if !repo.commits.contains_key(p) {
                return Err(unprocessable(format!("parent {p} does not exist")));
            }
        }

        let sha = repo.insert_commit(
            StoredCommit {
                tree: tree.to_string(),
                parent: parent.map(String::from),
                message: message.to_string(),
            },
            sequence,
        );
        Ok(CommitInfo {
            html_url: format!("{html_base}/commit/{sha}"),
            sha,
        })
    }

    async fn update_ref(
        &self,
        repo: &str,
        ref_name: &str,
        commit: &str,
        force: bool,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::UpdateRef {
            name: ref_name.to_string(),
            commit: commit.to_string(),
            force,
        });
        let repo = state.repo_mut(repo)?;
        if !repo.commits.contains_key(commit) {
            return Err(unprocessable(format!("object {commit} does not exist")));
        }
        if !force && !repo.refs.contains_key(ref_name) {
            return Err(unprocessable("Reference does not exist"));
        }
        repo.refs.insert(ref_name.to_string(), commit.to_string());
        Ok(())
    }

    async fn create_ref(&self, repo: &str, ref_name: &str, commit: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CreateRef {
            name: ref_name.to_string(),
            commit: commit.to_string(),
        });
        let repo = state.repo_mut(repo)?;
        if repo.refs.contains_key(ref_name) {
            return Err(unprocessable("Reference already exists"));
        }
        if !repo.commits.contains_key(commit) {
            return Err(unprocessable(format!("object {commit} does not exist")));
        }
        repo.refs.insert(ref_name.to_string(), commit.to_string());
        Ok(())
    }

    fn max_blob_bytes(&self) -> u64 {
        self.max_blob_bytes
    }
}

// ---------------------------------------------------------------------------
// Inspection helpers for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
impl MemoryStore {
    /// Register a repository that already exists, without auto-init content.
    pub async fn seed_repository(&self, name: &str) {
        self.state.lock().await.repos.insert(
            name.to_string(),
            MemoryRepo {
                topics: BTreeSet::new(),
                labels: Vec::new(),
                blobs: HashMap::new(),
                trees: HashMap::new(),
                commits: HashMap::new(),
                refs: HashMap::new(),
            },
        );
    }

    pub async fn ref_target(&self, repo: &str, ref_name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.repos.get(repo)?.refs.get(ref_name).cloned()
    }

    /// Paths in the tree of `commit`, sorted.
    pub async fn commit_paths(&self, repo: &str, commit: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(repo) = state.repos.get(repo) else {
            return Vec::new();
        };
        repo.commits
            .get(commit)
            .and_then(|c| repo.trees.get(&c.tree))
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn commit_parent(&self, repo: &str, commit: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.repos.get(repo)?.commits.get(commit)?.parent.clone()
    }

    pub async fn commit_message(&self, repo: &str, commit: &str) -> Option<String> {
        let state = self.state.lock().await;
        Some(state.repos.get(repo)?.commits.get(commit)?.message.clone())
    }

    pub async fn topics(&self, repo: &str) -> BTreeSet<String> {
        let state = self.state.lock().await;
        state
            .repos
            .get(repo)
            .map(|r| r.topics.clone())
            .unwrap_or_default()
    }

    pub async fn labels(&self, repo: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .repos
            .get(repo)
            .map(|r| r.labels.iter().map(|l| l.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectType;

    fn entry(path: &str, id: &str) -> TreeEntry {
        TreeEntry {
            path: path.into(),
            mode: FileMode::Regular,
            object_type: ObjectType::Blob,
            remote_id: id.into(),
        }
    }

    #[tokio::test]
    async fn identical_content_yields_identical_blob_ids() {
        let a = MemoryStore::new("octo", 1024);
        let b = MemoryStore::new("octo", 1024);
        a.create_repository(&RepositoryConfig::named("r")).await.unwrap();
        b.create_repository(&RepositoryConfig::named("r")).await.unwrap();

        let id_a = a.create_blob("r", b"same bytes").await.unwrap();
        let id_b = b.create_blob("r", b"same bytes").await.unwrap();
        let other = b.create_blob("r", b"other bytes").await.unwrap();
        assert_eq!(id_a, id_b);
        assert_ne!(id_a, other);
    }

    #[tokio::test]
    async fn auto_init_creates_readme_commit_on_main() {
        let store = MemoryStore::new("octo", 1024);
        let mut config = RepositoryConfig::named("r");
        config.description = "demo".into();
        let info = store.create_repository(&config).await.unwrap();
        assert_eq!(info.full_name, "octo/r");

        let head = store.default_branch_head("r", "main").await.unwrap().unwrap();
        assert_eq!(store.commit_paths("r", &head).await, vec!["README.md"]);
        assert_eq!(store.commit_parent("r", &head).await, None);
    }

    #[tokio::test]
    async fn tree_rejects_unknown_blob() {
        let store = MemoryStore::new("octo", 1024);
        store.create_repository(&RepositoryConfig::named("r")).await.unwrap();

        let err = store
            .create_tree("r", &[entry("a.txt", "deadbeef")], None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn base_tree_layers_entries() {
        let store = MemoryStore::new("octo", 1024);
        store.create_repository(&RepositoryConfig::named("r")).await.unwrap();
        let head = store.default_branch_head("r", "main").await.unwrap().unwrap();
        let base = store.commit_tree("r", &head).await.unwrap();

        let blob = store.create_blob("r", b"a").await.unwrap();
        let tree = store
            .create_tree("r", &[entry("src/a.txt", &blob)], Some(&base))
            .await
            .unwrap();
        let commit = store
            .create_commit("r", "add", &tree, Some(&head))
            .await
            .unwrap();
        assert_eq!(
            store.commit_paths("r", &commit.sha).await,
            vec!["README.md", "src/a.txt"]
        );
    }

    #[tokio::test]
    async fn commits_of_identical_trees_differ() {
        let store = MemoryStore::new("octo", 1024);
        store.create_repository(&RepositoryConfig::named("r")).await.unwrap();
        let blob = store.create_blob("r", b"a").await.unwrap();
        let tree = store.create_tree("r", &[entry("a", &blob)], None).await.unwrap();

        let first = store.create_commit("r", "m", &tree, None).await.unwrap();
        let second = store.create_commit("r", "m", &tree, None).await.unwrap();
        assert_ne!(first.sha, second.sha);
    }

    #[tokio::test]
    async fn update_ref_requires_existing_ref_unless_forced() {
        let store = MemoryStore::new("octo", 1024);
        store.create_repository(&RepositoryConfig::named("r")).await.unwrap();
        let head = store.default_branch_head("r", "main").await.unwrap().unwrap();

        let err = store
            .update_ref("r", "heads/dev", &head, false)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::remote(422, "Reference does not exist"));

        store.update_ref("r", "heads/dev", &head, true).await.unwrap();
        assert_eq!(store.ref_target("r", "heads/dev").await, Some(head));
    }

    #[tokio::test]
    async fn oversized_blob_is_not_logged() {
        let store = MemoryStore::new("octo", 2);
        store.create_repository(&RepositoryConfig::named("r")).await.unwrap();

        let err = store.create_blob("r", b"abc").await.unwrap_err();
        assert_eq!(err, StoreError::PayloadTooLarge { size: 3, limit: 2 });
        assert!(!store
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, StoreCall::CreateBlob { .. })));
    }
}
