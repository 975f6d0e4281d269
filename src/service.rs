use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::PrepError;

/// Field the matrix service filters on when listing and generating.
pub const PROJECT_ID_FIELD: &str = "project.provenance.document_id";

const MTX_FEATURE: &str = "gene";
const MTX_FORMAT: &str = "mtx";

/// Terminal and non-terminal states of a matrix generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Complete { download_url: String },
    InProgress,
    Other(String),
}

/// Catalog metadata for one project: display title and the protocol labels
/// the service itself declares for it.
#[derive(Debug, Clone, Default)]
pub struct ProjectRecord {
    pub title: Option<String>,
    pub labels: Vec<String>,
}

/// Remote matrix-generation collaborator: listing/filter endpoint, catalog
/// of per-project metadata, and the request/poll/fetch protocol.
pub trait MatrixService: Send + Sync {
    fn project_ids(&self) -> Result<Vec<String>, PrepError>;
    fn project_catalog(&self) -> Result<HashMap<String, ProjectRecord>, PrepError>;
    fn request_matrix(&self, project_id: &str) -> Result<String, PrepError>;
    fn status(&self, request_id: &str) -> Result<RequestStatus, PrepError>;
    fn download(&self, url: &str, dest: &Path) -> Result<(), PrepError>;
}

#[derive(Clone)]
pub struct MatrixHttpService {
    client: Client,
    service_url: String,
    catalog_url: String,
}

#[derive(Deserialize)]
struct ListingResponse {
    cell_counts: HashMap<String, u64>,
}

#[derive(Deserialize)]
struct RequestResponse {
    request_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    matrix_url: Option<String>,
}

#[derive(Deserialize)]
struct CatalogResponse {
    hits: Vec<CatalogHit>,
    pagination: CatalogPagination,
}

#[derive(Deserialize)]
struct CatalogHit {
    #[serde(rename = "entryId")]
    entry_id: String,
    projects: Vec<CatalogProject>,
    protocols: Vec<CatalogProtocol>,
}

#[derive(Deserialize)]
struct CatalogProject {
    #[serde(rename = "projectTitle")]
    project_title: Option<String>,
}

#[derive(Deserialize)]
struct CatalogProtocol {
    #[serde(rename = "libraryConstructionApproach", default)]
    library_construction_approach: Vec<String>,
}

#[derive(Deserialize)]
struct CatalogPagination {
    search_after: Option<String>,
    search_after_uid: Option<String>,
}

impl MatrixHttpService {
    pub fn new(service_url: String, catalog_url: String) -> Result<Self, PrepError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("matrix-prep/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PrepError::RemoteService(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| PrepError::RemoteService(err.to_string()))?;
        Ok(Self {
            client,
            service_url,
            catalog_url,
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<T, PrepError> {
        let response = request
            .send()
            .map_err(|err| PrepError::RemoteService(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PrepError::RemoteService(format!(
                "service returned status {}",
                response.status().as_u16()
            )));
        }
        response
            .json()
            .map_err(|err| PrepError::RemoteService(err.to_string()))
    }
}

impl MatrixService for MatrixHttpService {
    fn project_ids(&self) -> Result<Vec<String>, PrepError> {
        let url = format!("{}filters/{}", self.service_url, PROJECT_ID_FIELD);
        let listing: ListingResponse = self.get_json(self.client.get(url))?;
        Ok(listing.cell_counts.into_keys().collect())
    }

    fn project_catalog(&self) -> Result<HashMap<String, ProjectRecord>, PrepError> {
        let mut projects = HashMap::new();
        let mut cursor: Option<(String, String)> = None;
        loop {
            let mut request = self.client.get(&self.catalog_url);
            if let Some((search_after, search_after_uid)) = &cursor {
                request = request.query(&[
                    ("search_after", search_after.as_str()),
                    ("search_after_uid", search_after_uid.as_str()),
                ]);
            }
            let page: CatalogResponse = self.get_json(request)?;
            for hit in page.hits {
                let title = hit
                    .projects
                    .into_iter()
                    .next()
                    .and_then(|project| project.project_title);
                let labels = hit
                    .protocols
                    .into_iter()
                    .next()
                    .map(|protocol| protocol.library_construction_approach)
                    .unwrap_or_default();
                projects.insert(hit.entry_id, ProjectRecord { title, labels });
            }
            cursor = match (
                page.pagination.search_after,
                page.pagination.search_after_uid,
            ) {
                (Some(search_after), Some(uid)) => Some((search_after, uid)),
                _ => break,
            };
        }
        Ok(projects)
    }

    fn request_matrix(&self, project_id: &str) -> Result<String, PrepError> {
        let url = format!("{}matrix/", self.service_url);
        let payload = json!({
            "feature": MTX_FEATURE,
            "format": MTX_FORMAT,
            "filter": {
                "op": "=",
                "value": project_id,
                "field": PROJECT_ID_FIELD,
            },
        });
        info!(project_id, "requesting expression matrix generation");
        let response: RequestResponse = self.get_json(self.client.post(url).json(&payload))?;
        Ok(response.request_id)
    }

    fn status(&self, request_id: &str) -> Result<RequestStatus, PrepError> {
        let url = format!("{}matrix/{}", self.service_url, request_id);
        let response: StatusResponse = self.get_json(self.client.get(url))?;
        Ok(match response.status.as_str() {
            "Complete" => {
                let download_url = response.matrix_url.ok_or_else(|| {
                    PrepError::RemoteService("complete status without matrix url".to_string())
                })?;
                RequestStatus::Complete { download_url }
            }
            "In Progress" => RequestStatus::InProgress,
            other => RequestStatus::Other(other.to_string()),
        })
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), PrepError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| PrepError::RemoteService(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PrepError::RemoteService(format!(
                "matrix download returned status {}",
                response.status().as_u16()
            )));
        }
        let mut file =
            File::create(dest).map_err(|err| PrepError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| PrepError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
