//! Backend resolution: workspace selection → inventory item → catalog entry.
//!
//! Precedence is fixed: on overlapping fields the inventory wins. The API key
//! only ever comes from the inventory; the catalog carries capability metadata.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::workspace::WorkspaceConfig;

const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("No generation backend selected in workspace configuration")]
    NoBackendSelected,

    #[error("Selected backend '{0}' not found in workspace inventory")]
    NotInInventory(String),

    #[error("Backend definition '{0}' not found in catalog")]
    NotInCatalog(String),

    #[error("Unsupported backend provider '{0}'")]
    UnsupportedProvider(String),
}

/// One entry of the global catalog (`llms.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Global backend catalog, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct BackendCatalog {
    entries: Vec<CatalogEntry>,
}

impl BackendCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Reads the catalog file. A missing file yields an empty catalog.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!("Backend catalog {} not found; starting with an empty catalog", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read backend catalog {}", path.display()))?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("Backend catalog {} is not valid JSON", path.display()))?;
        info!("Loaded {} backend catalog entries", entries.len());
        Ok(Self { entries })
    }

    pub fn find(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Fully resolved backend: everything a backend implementation needs for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model_id: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
}

/// Resolves the workspace's selected backend against its inventory and the catalog.
pub fn resolve_backend(
    config: &WorkspaceConfig,
    catalog: &BackendCatalog,
) -> Result<BackendConfig, ConfigError> {
    let selected = config
        .selected_backend_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or(ConfigError::NoBackendSelected)?;

    let item = config
        .backend_inventory
        .iter()
        .find(|i| i.id == selected)
        .ok_or_else(|| ConfigError::NotInInventory(selected.to_string()))?;

    let catalog_id = item.catalog_id().unwrap_or(selected);
    let entry = catalog
        .find(catalog_id)
        .ok_or_else(|| ConfigError::NotInCatalog(catalog_id.to_string()))?;

    Ok(BackendConfig {
        id: item.id.clone(),
        name: item
            .name
            .clone()
            .or_else(|| entry.name.clone())
            .unwrap_or_else(|| entry.id.clone()),
        provider: item.provider.clone().unwrap_or_else(|| entry.provider.clone()),
        model_id: item
            .model_id
            .clone()
            .or_else(|| entry.model_id.clone())
            .unwrap_or_else(|| entry.id.clone()),
        api_key: item.api_key.clone(),
        base_url: entry.base_url.clone(),
        max_tokens: entry.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    })
}
