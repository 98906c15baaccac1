//! YAML configuration with `${VAR}` environment substitution, mirroring
//! `config.py`'s `load_config`/`substitute_env_vars`/`default_config`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub main: String,
    pub reviewer: String,
    pub light: String,
    pub embedding: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            main: "gpt-4o".to_string(),
            reviewer: "claude-3-5-sonnet".to_string(),
            light: "gpt-4o-mini".to_string(),
            embedding: "text-embedding-3-small".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/runtime.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_context_tokens: u32,
    pub narrative_budget_tokens: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 4000,
            narrative_budget_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub similarity_threshold: f64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            similarity_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AegeanConsensusConfig {
    pub beta_threshold: u32,
    pub alpha_quorum: f64,
    pub sessions_between_analysis: u32,
    pub min_summaries_for_profile: u32,
    pub enabled: bool,
}

impl Default for AegeanConsensusConfig {
    fn default() -> Self {
        Self {
            beta_threshold: 2,
            alpha_quorum: 1.0,
            sessions_between_analysis: 5,
            min_summaries_for_profile: 3,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CondensationConfig {
    pub hot_buffer_tokens: u32,
    pub chunk_threshold_tokens: u32,
    pub summary_budget_tokens: u32,
    pub use_consensus: bool,
}

impl Default for CondensationConfig {
    fn default() -> Self {
        Self {
            hot_buffer_tokens: 4000,
            chunk_threshold_tokens: 8000,
            summary_budget_tokens: 12000,
            use_consensus: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub rag: RagConfig,
    pub aegean_consensus: AegeanConsensusConfig,
    pub condensation: CondensationConfig,
}

impl Config {
    /// Loads `path` if it exists, substituting `${VAR}` references against
    /// the process environment; falls back to [`Config::default`] if the
    /// file is absent. Unknown keys are ignored because every section uses
    /// `#[serde(default)]` rather than `deny_unknown_fields`.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("reading {}: {e}", path.display())))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("parsing {}: {e}", path.display())))?;
        let substituted = substitute_env_vars(value);
        serde_yaml::from_value(substituted)
            .map_err(|e| AppError::Config(format!("mapping {}: {e}", path.display())))
    }

    pub fn load_env() {
        dotenvy::dotenv().ok();
    }
}

/// Recursively replaces any string value of the exact form `${VAR}` with
/// `env::var("VAR")`, leaving the literal `${VAR}` in place if unset.
fn substitute_env_vars(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Mapping(map) => {
            let substituted = map
                .into_iter()
                .map(|(k, v)| (k, substitute_env_vars(v)))
                .collect();
            serde_yaml::Value::Mapping(substituted)
        }
        serde_yaml::Value::Sequence(seq) => {
            serde_yaml::Value::Sequence(seq.into_iter().map(substitute_env_vars).collect())
        }
        serde_yaml::Value::String(s) => {
            if let Some(var) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
                match std::env::var(var) {
                    Ok(resolved) => serde_yaml::Value::String(resolved),
                    Err(_) => serde_yaml::Value::String(s),
                }
            } else {
                serde_yaml::Value::String(s)
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.aegean_consensus.beta_threshold, 2);
        assert_eq!(cfg.condensation.hot_buffer_tokens, 4000);
        assert_eq!(cfg.condensation.chunk_threshold_tokens, 8000);
        assert_eq!(cfg.condensation.summary_budget_tokens, 12000);
        assert_eq!(cfg.memory.max_context_tokens, 4000);
        assert_eq!(cfg.memory.narrative_budget_tokens, 2000);
        assert_eq!(cfg.models.embedding, "text-embedding-3-small");
        assert_eq!(cfg.rag.chunk_size, 500);
    }

    #[test]
    fn substitutes_env_var() {
        unsafe {
            std::env::set_var("TEST_CONFIG_VAR_XYZ", "resolved-value");
        }
        let value = serde_yaml::Value::String("${TEST_CONFIG_VAR_XYZ}".to_string());
        let out = substitute_env_vars(value);
        assert_eq!(out, serde_yaml::Value::String("resolved-value".to_string()));
    }

    #[test]
    fn leaves_unset_var_literal() {
        let value = serde_yaml::Value::String("${TEST_CONFIG_VAR_TOTALLY_UNSET}".to_string());
        let out = substitute_env_vars(value);
        assert_eq!(
            out,
            serde_yaml::Value::String("${TEST_CONFIG_VAR_TOTALLY_UNSET}".to_string())
        );
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        let cfg = Config::load("/nonexistent/path/does-not-exist.yaml").unwrap();
        assert_eq!(cfg.database.url, Config::default().database.url);
    }
}
