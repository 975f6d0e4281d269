use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::config::ResolvedConfig;
use crate::domain::{MatrixSource, ProjectId, SourceKind};
use crate::error::PrepError;
use crate::object_store::{ObjectStore, artifact_mtimes};
use crate::provider::{AdmissionRule, FreshnessRule, SourceBackend};

const BUNDLE_DIR: &str = "bundle";
const ARCHIVE_NAME: &str = "matrix.mtx.zip";
const DONOR_FILE: &str = "donor_organism_0.json";

/// Matrices already present on disk, one project per subdirectory of a
/// configured root. Fetch only describes the pre-existing archive.
pub struct LocalBackend {
    projects_dir: Utf8PathBuf,
    ids: Vec<String>,
    mtimes: HashMap<String, DateTime<Utc>>,
    sizes: HashMap<String, u64>,
    species: HashMap<String, String>,
}

impl LocalBackend {
    pub fn new(projects_dir: &Utf8Path) -> Result<Self, PrepError> {
        // archive paths are handed out while the pipeline sits in a scratch
        // directory, so the root must be resolved to an absolute path first
        let projects_dir = fs::canonicalize(projects_dir.as_std_path())
            .map_err(|err| PrepError::Filesystem(format!("resolve {projects_dir}: {err}")))
            .and_then(|path| {
                Utf8PathBuf::from_path_buf(path)
                    .map_err(|path| PrepError::Filesystem(format!("non-UTF8 path {path:?}")))
            })?;

        let mut ids = Vec::new();
        let mut mtimes = HashMap::new();
        let mut sizes = HashMap::new();
        let mut species = HashMap::new();

        let entries = fs::read_dir(projects_dir.as_std_path())
            .map_err(|err| PrepError::Filesystem(format!("read {projects_dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| PrepError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if !path.is_dir() || path.is_symlink() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let id = id.to_string();
            let metadata =
                entry.metadata().map_err(|err| PrepError::Filesystem(err.to_string()))?;
            if let Ok(modified) = metadata.modified() {
                mtimes.insert(id.clone(), DateTime::<Utc>::from(modified));
            }
            sizes.insert(id.clone(), metadata.len());

            let bundle = Utf8PathBuf::from_path_buf(path.join(BUNDLE_DIR))
                .map_err(|path| PrepError::Filesystem(format!("non-UTF8 path {path:?}")))?;
            match find_species(&bundle) {
                Ok(name) => {
                    species.insert(id.clone(), name);
                }
                Err(err) => {
                    warn!(id, %err, "failed to load species data for project");
                }
            }
            ids.push(id);
        }

        Ok(Self {
            projects_dir,
            ids,
            mtimes,
            sizes,
            species,
        })
    }

    pub fn fitness_rule(&self) -> LocalFitnessRule {
        LocalFitnessRule {
            projects_dir: self.projects_dir.clone(),
            species: self.species.clone(),
        }
    }

    pub fn freshness_rule(
        &self,
        store: &Arc<dyn ObjectStore>,
        config: &ResolvedConfig,
    ) -> Result<FreshnessRule, PrepError> {
        let figures = store.list(&config.figure_prefix)?;
        Ok(FreshnessRule::new(
            self.mtimes.clone(),
            artifact_mtimes(&figures),
            config.force,
        ))
    }

    fn archive_path(&self, id: &str) -> Utf8PathBuf {
        self.projects_dir.join(id).join(BUNDLE_DIR).join(ARCHIVE_NAME)
    }
}

impl SourceBackend for LocalBackend {
    fn candidate_ids(&self) -> Result<Vec<String>, PrepError> {
        Ok(self.ids.clone())
    }

    fn fetch(&self, id: &str) -> Result<MatrixSource, PrepError> {
        let project_id = match self.species.get(id) {
            Some(species) => ProjectId::with_species(id, species.clone()),
            None => ProjectId::new(id),
        };
        Ok(MatrixSource::new(
            SourceKind::Local,
            Some(self.archive_path(id)),
            Utf8PathBuf::from(id),
            project_id,
        ))
    }

    fn estimate_size(&self, id: &str) -> Option<u64> {
        self.sizes.get(id).copied()
    }
}

/// Local candidates must have their archive on disk and a resolvable
/// species label; anything else is a skip, not an error.
pub struct LocalFitnessRule {
    projects_dir: Utf8PathBuf,
    species: HashMap<String, String>,
}

impl AdmissionRule for LocalFitnessRule {
    fn admit(&self, id: &str) -> Result<(), String> {
        let archive = self
            .projects_dir
            .join(id)
            .join(BUNDLE_DIR)
            .join(ARCHIVE_NAME);
        if !archive.as_std_path().exists() {
            return Err(format!("matrix file does not exist for project {id}"));
        }
        if !self.species.contains_key(id) {
            return Err(format!("species not found for project {id}"));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct DonorDocument {
    genus_species: Vec<GenusSpecies>,
}

#[derive(Deserialize)]
struct GenusSpecies {
    text: String,
}

/// Resolve the species label from the bundle's donor-organism document.
fn find_species(bundle_dir: &Utf8Path) -> Result<String, PrepError> {
    let donor_path = bundle_dir.join(DONOR_FILE);
    let content = fs::read_to_string(donor_path.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("read {donor_path}: {err}")))?;
    let document: DonorDocument = serde_json::from_str(&content)
        .map_err(|err| PrepError::Format(format!("parse {donor_path}: {err}")))?;
    let name = document
        .genus_species
        .first()
        .map(|entry| entry.text.as_str())
        .ok_or_else(|| PrepError::Format(format!("{donor_path} lists no species")))?;
    Ok(sanitize_species(name))
}

/// Species names become path components of downstream asset keys, so
/// anything outside a conservative character set is replaced.
fn sanitize_species(name: &str) -> String {
    let pattern = Regex::new(r"[^\w,.@%&\-_()\[\]/{}]").unwrap();
    pattern
        .replace_all(name, "_")
        .trim_matches('_')
        .to_lowercase()
}
