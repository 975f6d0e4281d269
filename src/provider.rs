use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::domain::{Lca, MatrixSource, SourceKind};
use crate::error::PrepError;
use crate::object_store::{BLACKLIST_KEY, ObjectStore, parse_blacklist};
use crate::providers::canned::CannedBackend;
use crate::providers::fresh::FreshBackend;
use crate::providers::local::LocalBackend;
use crate::service::MatrixService;

/// Backing-source capabilities: enumerate candidates, estimate their size
/// for ordering, and materialize one into the current working directory.
pub trait SourceBackend {
    fn candidate_ids(&self) -> Result<Vec<String>, PrepError>;

    /// Fetch the archive into cwd and describe it. May fail with
    /// `PrepError::Skipped` for defects discovered only once the payload is
    /// inspected; the iteration boundary treats that as skip-and-continue.
    fn fetch(&self, id: &str) -> Result<MatrixSource, PrepError>;

    /// Byte-count estimate used only for ordering, never for correctness.
    fn estimate_size(&self, id: &str) -> Option<u64>;
}

/// One independent admission predicate. Rules are evaluated in order with
/// short-circuit on the first rejection; the `Err` carries the skip reason.
pub trait AdmissionRule {
    fn admit(&self, id: &str) -> Result<(), String>;
}

pub struct BlacklistRule {
    blacklist: HashSet<String>,
}

impl BlacklistRule {
    pub fn new(blacklist: impl IntoIterator<Item = String>) -> Self {
        Self {
            blacklist: blacklist.into_iter().collect(),
        }
    }
}

impl AdmissionRule for BlacklistRule {
    fn admit(&self, id: &str) -> Result<(), String> {
        if self.blacklist.contains(id) {
            Err(format!("matrix {id} is blacklisted"))
        } else {
            Ok(())
        }
    }
}

pub struct TargetSetRule {
    targets: HashSet<String>,
}

impl TargetSetRule {
    pub fn new(targets: impl IntoIterator<Item = String>) -> Self {
        Self {
            targets: targets.into_iter().collect(),
        }
    }
}

impl AdmissionRule for TargetSetRule {
    fn admit(&self, id: &str) -> Result<(), String> {
        // ids may carry a suffix after the uuid
        let uuid = id.split('.').next().unwrap_or(id);
        if self.targets.contains(uuid) {
            Ok(())
        } else {
            Err(format!("matrix {id} is not among the targeted ids"))
        }
    }
}

/// Rejects candidates whose source matrix is not strictly newer than the
/// oldest downstream artifact already produced for them. Candidates with no
/// known artifact are conservatively treated as needing processing. All
/// timestamps are timezone-aware.
pub struct FreshnessRule {
    matrix_mtimes: HashMap<String, DateTime<Utc>>,
    artifact_mtimes: HashMap<String, DateTime<Utc>>,
    force: bool,
}

impl FreshnessRule {
    pub fn new(
        matrix_mtimes: HashMap<String, DateTime<Utc>>,
        artifact_mtimes: HashMap<String, DateTime<Utc>>,
        force: bool,
    ) -> Self {
        Self {
            matrix_mtimes,
            artifact_mtimes,
            force,
        }
    }
}

impl AdmissionRule for FreshnessRule {
    fn admit(&self, id: &str) -> Result<(), String> {
        if self.force {
            return Ok(());
        }
        let Some(matrix_mtime) = self.matrix_mtimes.get(id) else {
            return Ok(());
        };
        let Some(artifact_mtime) = self.artifact_mtimes.get(id) else {
            debug!(id, "unable to determine artifact modification time");
            return Ok(());
        };
        if matrix_mtime > artifact_mtime {
            debug!(
                id,
                %matrix_mtime,
                %artifact_mtime,
                "matrix requires update"
            );
            Ok(())
        } else {
            Err(format!(
                "matrix {id} is up-to-date (matrix modified {matrix_mtime}, \
                 oldest artifact uploaded {artifact_mtime})"
            ))
        }
    }
}

/// Rejects candidates whose upstream-declared protocol labels fall outside
/// the closed label classification.
pub struct ClassifiableLabelsRule {
    declared_labels: HashMap<String, Vec<String>>,
}

impl ClassifiableLabelsRule {
    pub fn new(declared_labels: HashMap<String, Vec<String>>) -> Self {
        Self { declared_labels }
    }
}

impl AdmissionRule for ClassifiableLabelsRule {
    fn admit(&self, id: &str) -> Result<(), String> {
        let Some(labels) = self.declared_labels.get(id) else {
            return Ok(());
        };
        for label in labels {
            if Lca::classify(label).is_err() {
                return Err(format!(
                    "matrix {id} declares unclassifiable protocol label {label:?}"
                ));
            }
        }
        Ok(())
    }
}

/// A provider is a backend plus an ordered list of admission rules.
pub struct MatrixProvider {
    backend: Box<dyn SourceBackend>,
    rules: Vec<Box<dyn AdmissionRule>>,
}

impl std::fmt::Debug for MatrixProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixProvider").finish_non_exhaustive()
    }
}

impl MatrixProvider {
    pub fn new(backend: Box<dyn SourceBackend>, rules: Vec<Box<dyn AdmissionRule>>) -> Self {
        Self { backend, rules }
    }

    pub fn admit(&self, id: &str) -> Result<(), String> {
        for rule in &self.rules {
            rule.admit(id)?;
        }
        Ok(())
    }

    /// Enumerate, filter, and order candidates, then lazily fetch them.
    ///
    /// Candidates are ordered by descending size estimate (unknown sizes
    /// last, ties in enumeration order) and fetched only when consumed, so a
    /// partial pipeline failure does not waste fetch bandwidth. A fetch that
    /// raises a skip signal is logged and iteration continues.
    pub fn matrices(
        &self,
    ) -> Result<impl Iterator<Item = Result<MatrixSource, PrepError>> + '_, PrepError> {
        let candidates = self.backend.candidate_ids()?;
        let total = candidates.len();

        let mut admitted = Vec::new();
        for id in candidates {
            match self.admit(&id) {
                Ok(()) => admitted.push(id),
                Err(reason) => debug!(id, reason, "candidate skipped"),
            }
        }
        info!(
            admitted = admitted.len(),
            total, "admitted matrix candidates"
        );

        // stable sort keeps enumeration order among equal estimates
        admitted.sort_by_key(|id| Reverse(self.backend.estimate_size(id)));

        Ok(admitted.into_iter().filter_map(move |id| {
            match self.backend.fetch(&id) {
                Err(err) if err.is_skip() => {
                    info!(id, %err, "skipping matrix during fetch");
                    None
                }
                other => Some(other),
            }
        }))
    }
}

/// Explicit registry mapping a source selector to a provider. An
/// unrecognized selector is a whole-run configuration error.
pub fn provider_for(
    kind: SourceKind,
    config: &ResolvedConfig,
    store: Arc<dyn ObjectStore>,
    service: Arc<dyn MatrixService>,
) -> Result<MatrixProvider, PrepError> {
    let blacklist = if config.use_blacklist {
        parse_blacklist(&store.read_text(BLACKLIST_KEY)?)
    } else {
        Vec::new()
    };
    let mut rules: Vec<Box<dyn AdmissionRule>> = vec![Box::new(BlacklistRule::new(blacklist))];
    if let Some(targets) = &config.target_ids {
        rules.push(Box::new(TargetSetRule::new(targets.iter().cloned())));
    }

    match kind {
        SourceKind::Canned => {
            let backend = CannedBackend::new(store, config)?;
            rules.push(Box::new(backend.freshness_rule(config.force)));
            Ok(MatrixProvider::new(Box::new(backend), rules))
        }
        SourceKind::Fresh => {
            let backend = FreshBackend::new(service)?;
            rules.push(Box::new(backend.labels_rule()));
            Ok(MatrixProvider::new(Box::new(backend), rules))
        }
        SourceKind::Local => {
            let backend = LocalBackend::new(&config.projects_dir)?;
            rules.push(Box::new(backend.fitness_rule()));
            rules.push(Box::new(backend.freshness_rule(&store, config)?));
            Ok(MatrixProvider::new(Box::new(backend), rules))
        }
        SourceKind::Mock => Err(PrepError::UnknownSource(kind.to_string())),
    }
}
