//! Per-workspace configuration: selected backend, prompt overrides and the
//! backend inventory (credentials + model identifiers).

use serde::{Deserialize, Serialize};

const MASK: &str = "****";

/// Persisted as `users/{workspace}/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default, alias = "selected_llm_id")]
    pub selected_backend_id: Option<String>,
    #[serde(default)]
    pub prompts: PromptOverrides,
    #[serde(default, alias = "llm_inventory")]
    pub backend_inventory: Vec<InventoryItem>,
}

impl WorkspaceConfig {
    /// Copy with every API key masked, for returning over HTTP.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for item in &mut config.backend_inventory {
            item.api_key = mask_secret(&item.api_key);
        }
        config
    }

    /// Items sent back with a masked or empty key keep the key stored for
    /// the same id.
    pub fn keep_secrets_from(&mut self, stored: &WorkspaceConfig) {
        for item in &mut self.backend_inventory {
            if !item.api_key.is_empty() && !item.api_key.starts_with(MASK) {
                continue;
            }
            if let Some(previous) = stored.backend_inventory.iter().find(|p| p.id == item.id) {
                item.api_key = previous.api_key.clone();
            }
        }
    }
}

/// `****` plus the last four characters of keys long enough to spare them.
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 8 {
        return MASK.to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("{MASK}{tail}")
}

/// User-authored prompt templates. Empty or missing entries use the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyze_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refine_prompt: Option<String>,
}

impl PromptOverrides {
    pub fn analyze(&self) -> Option<&str> {
        non_blank(&self.analyze_prompt)
    }

    pub fn optimize(&self) -> Option<&str> {
        non_blank(&self.optimize_prompt)
    }

    pub fn refine(&self) -> Option<&str> {
        non_blank(&self.refine_prompt)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

/// One backend the workspace has credentials for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: String,
    /// Catalog entry this item instantiates. Defaults to `model_id` for older configs.
    #[serde(default)]
    pub sdk_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    pub api_key: String,
    #[serde(default)]
    pub plan_type: Option<String>,
}

impl InventoryItem {
    pub fn catalog_id(&self) -> Option<&str> {
        self.sdk_id.as_deref().or(self.model_id.as_deref())
    }
}
