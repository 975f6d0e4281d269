use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::PrepError;

/// Library construction approach: a short code classifying the protocol used
/// to build a matrix's cell libraries. This is a closed classification; new
/// label vocabularies require an explicit mapping here, never pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Lca {
    Ss2,
    TenX,
}

impl Lca {
    /// Translate an upstream protocol label into its short code.
    pub fn classify(label: &str) -> Result<Self, PrepError> {
        // Some projects declare the bare label 'Smart-seq', which does not
        // correspond to any cells after filtering and stays unmapped.
        if label == "Smart-seq2" {
            Ok(Lca::Ss2)
        } else if label.to_uppercase().starts_with("10X") {
            // both upper and lower case spellings occur upstream
            Ok(Lca::TenX)
        } else {
            Err(PrepError::UnrecognizedLabel(label.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lca::Ss2 => "SS2",
            Lca::TenX => "10X",
        }
    }
}

impl fmt::Display for Lca {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backing source a matrix was obtained from, doubling as the selector key
/// for provider construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Canned,
    Fresh,
    Local,
    Mock,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Canned => "canned",
            SourceKind::Fresh => "fresh",
            SourceKind::Local => "local",
            SourceKind::Mock => "mock",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "canned" => Ok(SourceKind::Canned),
            "fresh" => Ok(SourceKind::Fresh),
            "local" => Ok(SourceKind::Local),
            "mock" => Ok(SourceKind::Mock),
            other => Err(PrepError::UnknownSource(other.to_string())),
        }
    }
}

/// Stable external identifier for a matrix: provenance UUID plus, where
/// resolvable, a species label. Rendered `uuid.species`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId {
    uuid: String,
    species: Option<String>,
}

impl ProjectId {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            species: None,
        }
    }

    pub fn with_species(uuid: impl Into<String>, species: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            species: Some(species.into()),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.species {
            Some(species) => write!(f, "{}.{}", self.uuid, species),
            None => write!(f, "{}", self.uuid),
        }
    }
}

/// Descriptor for one matrix as it moves through the pipeline.
///
/// Created by a provider at fetch time with the archive present and the
/// working directory not yet materialized. The preparer derives new
/// descriptor values per transformation instead of mutating a shared one.
/// After partitioning, every descriptor carries exactly one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSource {
    pub kind: SourceKind,
    pub archive_path: Option<Utf8PathBuf>,
    pub working_path: Utf8PathBuf,
    pub project_id: ProjectId,
    pub labels: BTreeSet<Lca>,
}

impl MatrixSource {
    pub fn new(
        kind: SourceKind,
        archive_path: Option<Utf8PathBuf>,
        working_path: Utf8PathBuf,
        project_id: ProjectId,
    ) -> Self {
        Self {
            kind,
            archive_path,
            working_path,
            project_id,
            labels: BTreeSet::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeSet<Lca>) -> Self {
        self.labels = labels;
        self
    }

    /// The single label of a partitioned matrix.
    pub fn sole_label(&self) -> Option<Lca> {
        if self.labels.len() == 1 {
            self.labels.iter().next().copied()
        } else {
            None
        }
    }
}
