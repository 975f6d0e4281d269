use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::SourceKind;
use crate::error::PrepError;

pub const DEFAULT_CONFIG_FILE: &str = "matrix-prep.json";

const DEFAULT_SERVICE_URL: &str = "https://matrix.data.humancellatlas.org/v1/";
const DEFAULT_CATALOG_URL: &str =
    "https://service.explore.data.humancellatlas.org/repository/projects/";
const DEFAULT_MATRIX_PREFIX: &str = "project-assets/project-matrices/";
const DEFAULT_FIGURE_PREFIX: &str = "project-assets/project-stats/";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub source: String,
    #[serde(default)]
    pub use_blacklist: Option<bool>,
    #[serde(default)]
    pub target_ids: Option<Vec<String>>,
    #[serde(default)]
    pub force: Option<bool>,
    #[serde(default)]
    pub keep_fraction: Option<f64>,
    #[serde(default)]
    pub projects_dir: Option<String>,
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub matrix_prefix: Option<String>,
    #[serde(default)]
    pub figure_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub source: SourceKind,
    pub use_blacklist: bool,
    pub target_ids: Option<Vec<String>>,
    pub force: bool,
    pub keep_fraction: Option<f64>,
    pub projects_dir: Utf8PathBuf,
    pub service_url: String,
    pub catalog_url: String,
    pub matrix_prefix: String,
    pub figure_prefix: String,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PrepError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(PrepError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PrepError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| PrepError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PrepError> {
        let source: SourceKind = config.source.parse()?;

        if let Some(fraction) = config.keep_fraction {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(PrepError::InvalidFraction(fraction));
            }
        }

        Ok(ResolvedConfig {
            source,
            use_blacklist: config.use_blacklist.unwrap_or(false),
            target_ids: config.target_ids.filter(|targets| !targets.is_empty()),
            force: config.force.unwrap_or(false),
            keep_fraction: config.keep_fraction,
            projects_dir: Utf8PathBuf::from(
                config.projects_dir.unwrap_or_else(|| "projects".to_string()),
            ),
            service_url: config
                .service_url
                .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string()),
            catalog_url: config
                .catalog_url
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            matrix_prefix: config
                .matrix_prefix
                .unwrap_or_else(|| DEFAULT_MATRIX_PREFIX.to_string()),
            figure_prefix: config
                .figure_prefix
                .unwrap_or_else(|| DEFAULT_FIGURE_PREFIX.to_string()),
        })
    }
}
