//! Artifact Store: filesystem-backed, versioned storage for workspace inputs
//! and workflow outputs.
//!
//! Layout under the data root:
//!
//! ```text
//! users/{workspace}/config.json
//! users/{workspace}/templates/{file}
//! users/{workspace}/profiles/{file}
//! users/{workspace}/output/{workflow}/{version}/{file}
//! users/{workspace}/output/{workflow}/.staging-{token}/{file}
//! ```
//!
//! Renders land in a staging directory first and are promoted to a numbered
//! version only once that number has been assigned.
//!
//! Every identifier is validated before any filesystem access. This module
//! knows nothing about jobs or generation backends.

pub mod handlers;
pub mod workspace;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::workflow::VersionLabel;
use crate::storage::workspace::WorkspaceConfig;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid {kind}: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version {0} already exists on disk")]
    VersionExists(String),

    #[error("Malformed workspace config: {0}")]
    MalformedConfig(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Workspace input areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputCategory {
    Template,
    Profile,
}

impl InputCategory {
    fn dir_name(&self) -> &'static str {
        match self {
            InputCategory::Template => "templates",
            InputCategory::Profile => "profiles",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            InputCategory::Template => &["tex", "txt"],
            InputCategory::Profile => &["pdf", "txt"],
        }
    }
}

const STAGING_PREFIX: &str = ".staging-";

/// Rejects identifiers that could escape their directory or break a header.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), StorageError> {
    let bad = value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains('/')
        || value.contains('\\')
        || value.contains('"')
        || value.chars().any(char::is_control);
    if bad {
        return Err(StorageError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn workspace_dir(&self, workspace: &str) -> Result<PathBuf, StorageError> {
        validate_identifier("workspace id", workspace)?;
        Ok(self.root.join("users").join(workspace))
    }

    fn workflow_dir(&self, workspace: &str, workflow: Uuid) -> Result<PathBuf, StorageError> {
        Ok(self
            .workspace_dir(workspace)?
            .join("output")
            .join(workflow.to_string()))
    }

    /// Directory holding every file of one version.
    pub fn version_dir(
        &self,
        workspace: &str,
        workflow: Uuid,
        version: VersionLabel,
    ) -> Result<PathBuf, StorageError> {
        Ok(self
            .workflow_dir(workspace, workflow)?
            .join(version.to_string()))
    }

    /// Scratch directory a render writes into before it has a version number.
    pub fn staging_dir(
        &self,
        workspace: &str,
        workflow: Uuid,
        token: Uuid,
    ) -> Result<PathBuf, StorageError> {
        Ok(self
            .workflow_dir(workspace, workflow)?
            .join(format!("{STAGING_PREFIX}{token}")))
    }

    /// Writes one file into a staging directory, creating it as needed.
    pub async fn write_staged(
        &self,
        workspace: &str,
        workflow: Uuid,
        token: Uuid,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        validate_identifier("filename", filename)?;
        let dir = self.staging_dir(workspace, workflow, token)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        let path = dir.join(filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(path)
    }

    /// Renames a staging directory to `version`. Returns `(staging, version)` dirs.
    /// A missing staging directory promotes to an empty version.
    pub async fn promote(
        &self,
        workspace: &str,
        workflow: Uuid,
        token: Uuid,
        version: VersionLabel,
    ) -> Result<(PathBuf, PathBuf), StorageError> {
        let staging = self.staging_dir(workspace, workflow, token)?;
        let target = self.version_dir(workspace, workflow, version)?;
        if tokio::fs::try_exists(&target)
            .await
            .map_err(|e| io_error(&target, e))?
        {
            return Err(StorageError::VersionExists(version.to_string()));
        }
        let result = match tokio::fs::rename(&staging, &target).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => tokio::fs::create_dir_all(&target).await,
            other => other,
        };
        result.map_err(|e| io_error(&target, e))?;
        info!("Promoted staged render to {workspace}/{workflow}/{version}");
        Ok((staging, target))
    }

    /// Moves a promoted version back into staging.
    pub async fn demote(
        &self,
        workspace: &str,
        workflow: Uuid,
        token: Uuid,
        version: VersionLabel,
    ) -> Result<(), StorageError> {
        let staging = self.staging_dir(workspace, workflow, token)?;
        let target = self.version_dir(workspace, workflow, version)?;
        tokio::fs::rename(&target, &staging)
            .await
            .map_err(|e| io_error(&target, e))
    }

    /// Removes a staging directory. Missing is fine.
    pub async fn discard_staged(
        &self,
        workspace: &str,
        workflow: Uuid,
        token: Uuid,
    ) -> Result<(), StorageError> {
        let staging = self.staging_dir(workspace, workflow, token)?;
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {
                debug!("Discarded staging directory {}", staging.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&staging, e)),
        }
    }

    /// Path of one versioned file. Does not touch the filesystem.
    pub fn artifact_path(
        &self,
        workspace: &str,
        workflow: Uuid,
        version: VersionLabel,
        filename: &str,
    ) -> Result<PathBuf, StorageError> {
        validate_identifier("filename", filename)?;
        Ok(self.version_dir(workspace, workflow, version)?.join(filename))
    }

    /// Writes a versioned file, creating directories as needed. Overwrites.
    pub async fn write(
        &self,
        workspace: &str,
        workflow: Uuid,
        version: VersionLabel,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let path = self.artifact_path(workspace, workflow, version, filename)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error(&path, e))?;
        debug!(
            "Wrote {} bytes to {workspace}/{workflow}/{version}/{filename}",
            bytes.len()
        );
        Ok(path)
    }

    pub async fn read(
        &self,
        workspace: &str,
        workflow: Uuid,
        version: VersionLabel,
        filename: &str,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.artifact_path(workspace, workflow, version, filename)?;
        read_file(&path, || format!("{workflow}/{version}/{filename}")).await
    }

    /// Reads from a version directory named by a raw label. Labels written
    /// before numbering was enforced (`final`, `vX`) are still readable.
    pub async fn read_labelled(
        &self,
        workspace: &str,
        workflow: Uuid,
        label: &str,
        filename: &str,
    ) -> Result<Vec<u8>, StorageError> {
        validate_identifier("version", label)?;
        validate_identifier("filename", filename)?;
        if label.starts_with(STAGING_PREFIX) {
            return Err(StorageError::NotFound(format!("{workflow}/{label}/{filename}")));
        }
        let path = self.workflow_dir(workspace, workflow)?.join(label).join(filename);
        read_file(&path, || format!("{workflow}/{label}/{filename}")).await
    }

    /// Version labels present on disk for a workflow, in numeric order.
    /// Directories that are not `v<N>` are ignored; a missing workflow yields nothing.
    pub async fn list_versions(
        &self,
        workspace: &str,
        workflow: Uuid,
    ) -> Result<Vec<VersionLabel>, StorageError> {
        let dir = self.workflow_dir(workspace, workflow)?;
        let mut versions = Vec::new();
        for (name, is_dir) in list_dir(&dir).await? {
            if !is_dir {
                continue;
            }
            if let Ok(label) = name.parse::<VersionLabel>() {
                versions.push(label);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Creates the workspace tree and a default config on first access.
    pub async fn ensure_workspace(&self, workspace: &str) -> Result<PathBuf, StorageError> {
        let dir = self.workspace_dir(workspace)?;
        for sub in ["templates", "profiles", "output"] {
            let path = dir.join(sub);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
        }

        let config_path = dir.join(CONFIG_FILE);
        if !tokio::fs::try_exists(&config_path)
            .await
            .map_err(|e| io_error(&config_path, e))?
        {
            write_config_atomically(config_path, &WorkspaceConfig::default()).await?;
            info!("Initialised workspace {workspace}");
        }
        Ok(dir)
    }

    pub async fn read_input(
        &self,
        workspace: &str,
        category: InputCategory,
        filename: &str,
    ) -> Result<Vec<u8>, StorageError> {
        validate_identifier("filename", filename)?;
        let path = self
            .workspace_dir(workspace)?
            .join(category.dir_name())
            .join(filename);
        read_file(&path, || format!("{}/{filename}", category.dir_name())).await
    }

    /// Input files of one category, sorted by name.
    pub async fn list_inputs(
        &self,
        workspace: &str,
        category: InputCategory,
    ) -> Result<Vec<String>, StorageError> {
        let dir = self.workspace_dir(workspace)?.join(category.dir_name());
        let mut names: Vec<String> = list_dir(&dir)
            .await?
            .into_iter()
            .filter(|(name, is_dir)| {
                !is_dir
                    && Path::new(name)
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| category.extensions().contains(&e.to_ascii_lowercase().as_str()))
                        .unwrap_or(false)
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn load_config(&self, workspace: &str) -> Result<WorkspaceConfig, StorageError> {
        let dir = self.ensure_workspace(workspace).await?;
        let bytes = read_file(&dir.join(CONFIG_FILE), || CONFIG_FILE.to_string()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn save_config(
        &self,
        workspace: &str,
        config: &WorkspaceConfig,
    ) -> Result<(), StorageError> {
        let dir = self.ensure_workspace(workspace).await?;
        write_config_atomically(dir.join(CONFIG_FILE), config).await
    }
}

fn io_error(path: &Path, source: io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn read_file(path: &Path, describe: impl FnOnce() -> String) -> Result<Vec<u8>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(describe())),
        Err(e) => Err(io_error(path, e)),
    }
}

/// `(name, is_dir)` for each entry; a missing directory is empty.
async fn list_dir(dir: &Path) -> Result<Vec<(String, bool)>, StorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(dir, e)),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        out.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
    }
    Ok(out)
}

/// Writes through a temp file in the same directory so readers never see a partial config.
async fn write_config_atomically(path: PathBuf, config: &WorkspaceConfig) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(config)?;
    tokio::task::spawn_blocking(move || {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
        io::Write::write_all(&mut tmp, &body).map_err(|e| io_error(&path, e))?;
        tmp.persist(&path).map_err(|e| io_error(&path, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StorageError::Io {
        path: "config.json".to_string(),
        source: io::Error::new(io::ErrorKind::Other, e),
    })?
}
