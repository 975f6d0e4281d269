use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::PrepError;

/// Listing metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Object-storage collaborator: bucket listing with size/mtime metadata,
/// single-object transfer, and small text objects (blacklist).
///
/// The production implementation lives outside this crate; tests use
/// in-memory doubles.
pub trait ObjectStore: Send + Sync {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, PrepError>;
    fn download(&self, key: &str, dest: &Path) -> Result<(), PrepError>;
    fn upload(&self, src: &Path, key: &str) -> Result<(), PrepError>;
    fn read_text(&self, key: &str) -> Result<String, PrepError>;
}

pub const BLACKLIST_KEY: &str = "blacklist";

/// Store stand-in for deployments with no object store wired up: listings
/// are empty (so freshness checks admit everything) and transfers fail.
pub struct NullObjectStore;

impl ObjectStore for NullObjectStore {
    fn list(&self, _prefix: &str) -> Result<Vec<ObjectMeta>, PrepError> {
        Ok(Vec::new())
    }

    fn download(&self, key: &str, _dest: &Path) -> Result<(), PrepError> {
        Err(PrepError::ObjectStore(format!(
            "no object store configured; cannot download {key}"
        )))
    }

    fn upload(&self, _src: &Path, key: &str) -> Result<(), PrepError> {
        Err(PrepError::ObjectStore(format!(
            "no object store configured; cannot upload {key}"
        )))
    }

    fn read_text(&self, key: &str) -> Result<String, PrepError> {
        Err(PrepError::ObjectStore(format!(
            "no object store configured; cannot read {key}"
        )))
    }
}

/// Parse the newline-delimited blacklist object.
pub fn parse_blacklist(text: &str) -> Vec<String> {
    text.trim_matches('\n')
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Modification time of the oldest downstream artifact per project, keyed by
/// the project uuid embedded in the artifact key. Artifact keys look like
/// `<prefix>/<project>/<uuid>.<species>/<figure>.png`; the uuid is the third
/// path segment up to the first dot.
pub fn artifact_mtimes(objects: &[ObjectMeta]) -> HashMap<String, DateTime<Utc>> {
    let mut oldest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for object in objects {
        let Some(segment) = object.key.split('/').nth(2) else {
            continue;
        };
        let uuid = segment.split('.').next().unwrap_or(segment).to_string();
        oldest
            .entry(uuid)
            .and_modify(|mtime| {
                if object.last_modified < *mtime {
                    *mtime = object.last_modified;
                }
            })
            .or_insert(object.last_modified);
    }
    oldest
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn meta(key: &str, hour: u32) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: 1,
            last_modified: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn blacklist_parsing() {
        assert_eq!(
            parse_blacklist("aaa\nbbb\n\nccc\n"),
            vec!["aaa".to_string(), "bbb".to_string(), "ccc".to_string()]
        );
        assert!(parse_blacklist("\n").is_empty());
    }

    #[test]
    fn artifact_mtimes_take_oldest_per_uuid() {
        let objects = vec![
            meta("assets/stats/u1.homo_sapiens/violin.png", 9),
            meta("assets/stats/u1.homo_sapiens/pca.png", 7),
            meta("assets/stats/u2/violin.png", 12),
        ];
        let mtimes = artifact_mtimes(&objects);
        assert_eq!(mtimes.len(), 2);
        assert_eq!(
            mtimes["u1"],
            Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap()
        );
        assert_eq!(
            mtimes["u2"],
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }
}
