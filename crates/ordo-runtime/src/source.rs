//! Code sources: where an order's files come from before bundling.
//!
//! A [`CodeTree`] is the in-memory form of an order's code directory.
//! Fetchers resolve a [`SourceSpec`] into a tree: blob sources unpack an
//! existing archive from the artifact store, repo sources clone the named
//! revision with a token from the credential source.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use ordo_kernel::{parse_blob_uri, ArtifactStore, KernelError, SourceSpec};

use crate::credentials::CredentialSource;

/// One file inside a code tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeFile {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    pub mode: u32,
    pub contents: Vec<u8>,
}

/// An order's code directory, held in memory for repackaging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeTree {
    pub files: Vec<CodeFile>,
}

impl CodeTree {
    /// Select a subfolder as a new tree root. `None` keeps the whole tree.
    pub fn subtree(&self, folder: Option<&str>) -> Result<CodeTree, KernelError> {
        let Some(folder) = folder else {
            return Ok(self.clone());
        };
        let prefix = format!("{}/", folder.trim_matches('/'));
        let files: Vec<CodeFile> = self
            .files
            .iter()
            .filter_map(|f| {
                f.path.strip_prefix(&prefix).map(|rest| CodeFile {
                    path: rest.to_string(),
                    mode: f.mode,
                    contents: f.contents.clone(),
                })
            })
            .collect();
        if files.is_empty() {
            return Err(KernelError::Source(format!(
                "folder '{folder}' not found in fetched code"
            )));
        }
        Ok(CodeTree { files })
    }

    /// Add or replace a file at the tree root.
    pub fn upsert(&mut self, path: &str, mode: u32, contents: Vec<u8>) {
        if let Some(existing) = self.files.iter_mut().find(|f| f.path == path) {
            existing.mode = mode;
            existing.contents = contents;
            return;
        }
        self.files.push(CodeFile {
            path: path.to_string(),
            mode,
            contents,
        });
    }

    /// Read a tree from a directory on disk, skipping `.git`.
    pub fn from_dir(root: &Path) -> Result<CodeTree, KernelError> {
        fn walk(root: &Path, dir: &Path, files: &mut Vec<CodeFile>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name();
                if name == ".git" {
                    continue;
                }
                if path.is_dir() {
                    walk(root, &path, files)?;
                } else if path.is_file() {
                    let rel = path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push(CodeFile {
                        path: rel,
                        mode: 0o644,
                        contents: std::fs::read(&path)?,
                    });
                }
            }
            Ok(())
        }

        let mut files = Vec::new();
        walk(root, root, &mut files)
            .map_err(|e| KernelError::Source(format!("read {}: {e}", root.display())))?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(CodeTree { files })
    }
}

/// Resolves a [`SourceSpec`] into a [`CodeTree`].
#[async_trait]
pub trait CodeFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceSpec) -> Result<CodeTree, KernelError>;
}

/// Fetches blob sources (`ordo+blob://<root>/<key>`) from the artifact store
/// and unpacks the archive.
pub struct StoreCodeFetcher {
    store: Arc<dyn ArtifactStore>,
}

impl StoreCodeFetcher {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CodeFetcher for StoreCodeFetcher {
    async fn fetch(&self, source: &SourceSpec) -> Result<CodeTree, KernelError> {
        let SourceSpec::Bundle { bundle_location } = source else {
            return Err(KernelError::Source(
                "store fetcher only handles bundle sources".into(),
            ));
        };
        let (root, key) = parse_blob_uri(bundle_location).ok_or_else(|| {
            KernelError::Source(format!("unsupported bundle location: {bundle_location}"))
        })?;
        if root != self.store.root() {
            return Err(KernelError::Source(format!(
                "bundle location root '{root}' does not match store '{}'",
                self.store.root()
            )));
        }
        let bytes = self.store.get(key).await?.ok_or_else(|| {
            KernelError::Source(format!("bundle not found: {bundle_location}"))
        })?;
        crate::bundle::unpack_archive(&bytes)
    }
}

/// Routes each source variant to its fetcher.
pub struct RoutingCodeFetcher {
    bundle: Arc<dyn CodeFetcher>,
    repo: Arc<dyn CodeFetcher>,
}

impl RoutingCodeFetcher {
    pub fn new(bundle: Arc<dyn CodeFetcher>, repo: Arc<dyn CodeFetcher>) -> Self {
        Self { bundle, repo }
    }
}

#[async_trait]
impl CodeFetcher for RoutingCodeFetcher {
    async fn fetch(&self, source: &SourceSpec) -> Result<CodeTree, KernelError> {
        match source {
            SourceSpec::Bundle { .. } => self.bundle.fetch(source).await,
            SourceSpec::Repo { .. } => self.repo.fetch(source).await,
        }
    }
}

/// Clones repo sources with `git`, checking out the named commit when one
/// is given. Shallow depth mirrors what a CI fetch needs: 1 for HEAD, 2
/// when a specific commit must be reachable.
pub struct GitCodeFetcher {
    credentials: Arc<dyn CredentialSource>,
    base_url: String,
}

impl GitCodeFetcher {
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            credentials,
            base_url: "https://github.com".into(),
        }
    }

    pub fn with_base_url(credentials: Arc<dyn CredentialSource>, base_url: String) -> Self {
        Self {
            credentials,
            base_url,
        }
    }

    async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<(), KernelError> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| KernelError::Source(format!("spawn git: {e}")))?;
        if !output.status.success() {
            return Err(KernelError::Source(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CodeFetcher for GitCodeFetcher {
    async fn fetch(&self, source: &SourceSpec) -> Result<CodeTree, KernelError> {
        let SourceSpec::Repo {
            repo,
            token_ref,
            folder,
            commit,
        } = source
        else {
            return Err(KernelError::Source(
                "git fetcher only handles repo sources".into(),
            ));
        };

        let token = self.credentials.fetch(token_ref).await?;
        let token = String::from_utf8(token)
            .map_err(|_| KernelError::Credential("git token is not utf-8".into()))?;

        let work_dir = tempfile::tempdir()
            .map_err(|e| KernelError::Source(format!("create temp dir: {e}")))?;
        let clone_url = match self.base_url.split_once("://") {
            Some((scheme, host)) => {
                format!("{scheme}://x-access-token:{token}@{host}/{repo}.git")
            }
            None => format!("{}/{repo}.git", self.base_url),
        };

        let depth = if commit.is_some() { "2" } else { "1" };
        let target = work_dir.path().to_string_lossy().into_owned();
        Self::run_git(&["clone", "--depth", depth, &clone_url, &target], None).await?;
        if let Some(commit) = commit {
            Self::run_git(&["checkout", commit], Some(work_dir.path())).await?;
        }

        let tree = CodeTree::from_dir(work_dir.path())?;
        tree.subtree(folder.as_deref())
    }
}
