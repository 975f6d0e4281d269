use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::ResolvedConfig;
use crate::domain::{MatrixSource, ProjectId, SourceKind};
use crate::error::PrepError;
use crate::fs_util::format_size;
use crate::object_store::{ObjectStore, artifact_mtimes};
use crate::provider::{FreshnessRule, SourceBackend};

pub const MTX_EXT: &str = ".mtx.zip";

/// Pre-built matrix archives in an object-store bucket. Candidate ids are
/// the archive uuids; sizes and modification times come from the listing
/// metadata captured once at construction.
pub struct CannedBackend {
    store: Arc<dyn ObjectStore>,
    matrix_prefix: String,
    keys: HashMap<String, String>,
    sizes: HashMap<String, u64>,
    mtimes: HashMap<String, DateTime<Utc>>,
    artifact_mtimes: HashMap<String, DateTime<Utc>>,
    ids: Vec<String>,
}

impl CannedBackend {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ResolvedConfig) -> Result<Self, PrepError> {
        let mut keys = HashMap::new();
        let mut sizes = HashMap::new();
        let mut mtimes = HashMap::new();
        let mut ids = Vec::new();
        for object in store.list(&config.matrix_prefix)? {
            let Some(id) = matrix_uuid(&object.key) else {
                continue;
            };
            ids.push(id.clone());
            sizes.insert(id.clone(), object.size);
            mtimes.insert(id.clone(), object.last_modified);
            keys.insert(id, object.key);
        }

        let figures = store.list(&config.figure_prefix)?;
        let artifact_mtimes = artifact_mtimes(&figures);

        Ok(Self {
            store,
            matrix_prefix: config.matrix_prefix.clone(),
            keys,
            sizes,
            mtimes,
            artifact_mtimes,
            ids,
        })
    }

    pub fn freshness_rule(&self, force: bool) -> FreshnessRule {
        FreshnessRule::new(self.mtimes.clone(), self.artifact_mtimes.clone(), force)
    }
}

impl SourceBackend for CannedBackend {
    fn candidate_ids(&self) -> Result<Vec<String>, PrepError> {
        Ok(self.ids.clone())
    }

    fn fetch(&self, id: &str) -> Result<MatrixSource, PrepError> {
        let key = self.keys.get(id).ok_or_else(|| {
            PrepError::ObjectStore(format!(
                "no object under {} for matrix {id}",
                self.matrix_prefix
            ))
        })?;
        info!(id, "downloading matrix archive from object store");
        let filename = format!("{id}{MTX_EXT}");
        self.store.download(key, Path::new(&filename))?;
        if let Some(size) = self.sizes.get(id) {
            info!("size of {filename}: {}", format_size(*size));
        }
        Ok(MatrixSource::new(
            SourceKind::Canned,
            Some(Utf8PathBuf::from(&filename)),
            Utf8PathBuf::from(format!("{id}.mtx")),
            ProjectId::new(id),
        ))
    }

    fn estimate_size(&self, id: &str) -> Option<u64> {
        self.sizes.get(id).copied()
    }
}

/// Extract the matrix uuid from an archive object key, or `None` if the key
/// does not name a matrix archive.
fn matrix_uuid(key: &str) -> Option<String> {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.strip_suffix(MTX_EXT).map(str::to_string)
}
