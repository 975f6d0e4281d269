use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::info;

use crate::domain::{Lca, MatrixSource, ProjectId, SourceKind};
use crate::error::PrepError;
use crate::provider::{ClassifiableLabelsRule, SourceBackend};
use crate::service::{MatrixService, ProjectRecord, RequestStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Matrices generated on demand by the remote matrix service. Candidate ids
/// come from the service's filter endpoint; per-project titles and declared
/// protocol labels are captured from the catalog at construction.
pub struct FreshBackend {
    service: Arc<dyn MatrixService>,
    catalog: HashMap<String, ProjectRecord>,
    poll_interval: Duration,
}

impl FreshBackend {
    pub fn new(service: Arc<dyn MatrixService>) -> Result<Self, PrepError> {
        let catalog = service.project_catalog()?;
        Ok(Self {
            service,
            catalog,
            poll_interval: POLL_INTERVAL,
        })
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn labels_rule(&self) -> ClassifiableLabelsRule {
        ClassifiableLabelsRule::new(
            self.catalog
                .iter()
                .map(|(id, record)| (id.clone(), record.labels.clone()))
                .collect(),
        )
    }

    /// Poll the generation request until it terminates, sleeping a fixed
    /// interval between status checks.
    fn await_download_url(&self, request_id: &str) -> Result<String, PrepError> {
        let mut elapsed = Duration::ZERO;
        loop {
            match self.service.status(request_id)? {
                RequestStatus::Complete { download_url } => {
                    info!(request_id, ?elapsed, "matrix generation complete");
                    return Ok(download_url);
                }
                RequestStatus::InProgress => {
                    info!(request_id, "matrix request in progress...");
                    thread::sleep(self.poll_interval);
                    elapsed += self.poll_interval;
                }
                RequestStatus::Other(status) => {
                    return Err(PrepError::RemoteService(format!(
                        "matrix service returned unexpected request status: {status}"
                    )));
                }
            }
        }
    }
}

impl SourceBackend for FreshBackend {
    fn candidate_ids(&self) -> Result<Vec<String>, PrepError> {
        self.service.project_ids()
    }

    fn fetch(&self, id: &str) -> Result<MatrixSource, PrepError> {
        let record = self.catalog.get(id);
        match record.and_then(|record| record.title.as_deref()) {
            Some(title) => info!(id, title, "requesting matrix from service"),
            None => info!(id, "requesting matrix from service; no title in catalog"),
        }

        let labels = record
            .map(|record| record.labels.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|label| Lca::classify(label))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|err| PrepError::skip(err.to_string()))?;

        let request_id = self.service.request_matrix(id)?;
        let download_url = self.await_download_url(&request_id)?;
        info!(download_url, "matrix download URL resolved");

        let filename = archive_name(&download_url);
        self.service.download(&download_url, Path::new(&filename))?;

        let working = filename.strip_suffix(".zip").unwrap_or(&filename);
        Ok(MatrixSource::new(
            SourceKind::Fresh,
            Some(Utf8PathBuf::from(&filename)),
            Utf8PathBuf::from(working),
            ProjectId::new(id),
        )
        .with_labels(labels))
    }

    fn estimate_size(&self, _id: &str) -> Option<u64> {
        // the service reports cell counts, not archive bytes
        None
    }
}

fn archive_name(url: &str) -> String {
    let name = url.rsplit('/').next().unwrap_or(url);
    name.split('?').next().unwrap_or(name).to_string()
}
