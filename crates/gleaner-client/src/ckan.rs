use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use gleaner_core::config::HttpConfig;
use gleaner_core::error::AppError;
use gleaner_core::models::{epoch, Language, Seed, SeedFile, SeedState};
use gleaner_core::traits::Connector;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::http::{build_client, send_with_retry};

/// Packages requested per `package_search` page.
const PAGE_SIZE: usize = 500;

/// Generic wrapper for CKAN API responses.
///
/// CKAN API reference: <https://docs.ckan.org/en/2.9/api/>
///
/// CKAN always returns responses with the structure:
/// ```json
/// {
///     "success": bool,
///     "result": T
/// }
/// ```
#[derive(Deserialize, Debug)]
struct CkanResponse<T> {
    success: bool,
    result: T,
}

/// One page of `package_search` results.
#[derive(Deserialize, Debug)]
struct SearchPage {
    count: usize,
    results: Vec<CkanDataset>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct CkanOrganization {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct CkanResource {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CkanTag {
    pub name: String,
}

/// Data Transfer Object for CKAN dataset details.
///
/// Represents the fields of a `package_search` result that map onto seeds.
/// Everything else CKAN returns is captured in the `extras` map.
///
/// # Examples
///
/// ```
/// use gleaner_client::ckan::CkanDataset;
///
/// let json = r#"{
///     "id": "dataset-123",
///     "name": "my-dataset",
///     "title": "My Dataset",
///     "notes": "Description of the dataset",
///     "organization": {"name": "test-org"},
///     "num_resources": 0
/// }"#;
///
/// let dataset: CkanDataset = serde_json::from_str(json).unwrap();
/// assert_eq!(dataset.id, "dataset-123");
/// assert_eq!(dataset.organization.unwrap().name, "test-org");
/// assert!(dataset.extras.contains_key("num_resources"));
/// ```
#[derive(Deserialize, Debug, Clone)]
pub struct CkanDataset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// `active`, `draft` or `deleted`.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub license_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub metadata_modified: Option<String>,
    #[serde(default)]
    pub organization: Option<CkanOrganization>,
    #[serde(default)]
    pub resources: Vec<CkanResource>,
    #[serde(default)]
    pub tags: Vec<CkanTag>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

/// Connector for CKAN open data portals.
///
/// The set specification selects an organization; `*` or an empty string
/// harvests the whole portal.
///
/// # Examples
///
/// ```no_run
/// use gleaner_client::CkanClient;
/// use gleaner_core::config::HttpConfig;
/// use gleaner_core::models::epoch;
/// use gleaner_core::traits::Connector;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = CkanClient::new("https://data.overheid.nl/data", HttpConfig::default())?;
/// let seeds = client.extract_seeds("*", epoch()).await?;
/// println!("Found {} records", seeds.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CkanClient {
    client: Client,
    base_url: Url,
    config: HttpConfig,
}

impl CkanClient {
    /// Creates a new CKAN client for the specified portal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the URL is malformed.
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(base_url_str: &str, config: HttpConfig) -> Result<Self, AppError> {
        let mut base_url = Url::parse(base_url_str)
            .map_err(|_| AppError::InvalidUrl(format!("Invalid CKAN URL: {}", base_url_str)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client: build_client(&config)?,
            base_url,
            config,
        })
    }

    /// Fetches one page of packages modified since `since`.
    async fn search_page(
        &self,
        set_specification: &str,
        since: DateTime<Utc>,
        start: usize,
    ) -> Result<SearchPage, AppError> {
        let mut url = self
            .base_url
            .join("api/3/action/package_search")
            .map_err(|e| AppError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("q", "*:*")
            .append_pair("sort", "metadata_modified asc")
            .append_pair("rows", &PAGE_SIZE.to_string())
            .append_pair("start", &start.to_string())
            .append_pair("include_deleted", "true");
        if let Some(fq) = filter_query(set_specification, since) {
            url.query_pairs_mut().append_pair("fq", &fq);
        }

        let resp = send_with_retry(&self.config, || self.client.get(url.clone())).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::ClientError(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            )));
        }

        let ckan_resp: CkanResponse<SearchPage> = resp
            .json()
            .await
            .map_err(|e| AppError::ClientError(e.to_string()))?;
        if !ckan_resp.success {
            return Err(AppError::Generic(
                "CKAN API returned success: false".to_string(),
            ));
        }
        Ok(ckan_resp.result)
    }

    /// Converts a CKAN dataset into a seed.
    ///
    /// # Examples
    ///
    /// ```
    /// use gleaner_client::CkanClient;
    /// use gleaner_client::ckan::CkanDataset;
    ///
    /// let dataset: CkanDataset = serde_json::from_str(
    ///     r#"{"id": "abc-123", "name": "air-quality", "title": "Air Quality"}"#,
    /// ).unwrap();
    /// let seed = CkanClient::into_seed(dataset, "https://dati.gov.it");
    ///
    /// assert_eq!(seed.external_id, "abc-123");
    /// assert_eq!(seed.url.as_deref(), Some("https://dati.gov.it/dataset/air-quality"));
    /// ```
    pub fn into_seed(dataset: CkanDataset, portal_url: &str) -> Seed {
        let state = match dataset.state.as_deref() {
            Some("deleted") => SeedState::Deleted,
            Some("draft") => SeedState::Inactive,
            _ if dataset.private => SeedState::Inactive,
            _ => SeedState::Active,
        };
        let landing_page = format!(
            "{}/dataset/{}",
            portal_url.trim_end_matches('/'),
            dataset.name
        );

        let mut metadata = dataset.extras;
        metadata.insert("ckan_name".to_string(), Value::String(dataset.name));
        metadata.insert(
            "keywords".to_string(),
            Value::Array(
                dataset
                    .tags
                    .into_iter()
                    .map(|t| Value::String(t.name))
                    .collect(),
            ),
        );

        Seed {
            external_id: dataset.id,
            state,
            url: Some(landing_page),
            title: dataset.title,
            description: dataset.notes,
            files: dataset
                .resources
                .into_iter()
                .filter(|r| !r.url.is_empty())
                .map(|r| SeedFile {
                    url: r.url,
                    mime_type: r.mimetype.or(r.format),
                    title: r.name,
                })
                .collect(),
            authors: dataset.author.into_iter().collect(),
            publishers: dataset
                .organization
                .map(|o| o.title.unwrap_or(o.name))
                .into_iter()
                .collect(),
            copyright: dataset.license_id,
            language: Language {
                metadata: dataset.language,
            },
            technical_type: Some("dataset".to_string()),
            modified_at: dataset.metadata_modified.as_deref().and_then(parse_modified),
            metadata,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for CkanClient {
    fn connector_type(&self) -> &str {
        "ckan"
    }

    async fn extract_seeds(
        &self,
        set_specification: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Seed>, AppError> {
        let mut seeds = Vec::new();
        let mut start = 0;
        loop {
            let page = self.search_page(set_specification, since, start).await?;
            let received = page.results.len();
            seeds.extend(
                page.results
                    .into_iter()
                    .map(|d| Self::into_seed(d, self.base_url.as_str())),
            );
            start += received;
            tracing::debug!(
                endpoint = %self.base_url,
                set = set_specification,
                fetched = start,
                total = page.count,
                "Fetched CKAN page"
            );
            if received == 0 || start >= page.count {
                break;
            }
        }
        Ok(seeds)
    }
}

/// Solr filter for the organization and the modification window.
fn filter_query(set_specification: &str, since: DateTime<Utc>) -> Option<String> {
    let mut filters = Vec::new();
    let set = set_specification.trim();
    if !set.is_empty() && set != "*" {
        filters.push(format!("organization:{}", set));
    }
    if since > epoch() {
        filters.push(format!(
            "metadata_modified:[{} TO *]",
            since.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        ));
    }
    (!filters.is_empty()).then(|| filters.join(" AND "))
}

/// CKAN timestamps are UTC without an offset, e.g. `2024-01-15T10:30:00.123456`.
fn parse_modified(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dataset(json: &str) -> CkanDataset {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_new_with_valid_url() {
        let client = CkanClient::new("https://dati.gov.it/opendata", HttpConfig::default()).unwrap();
        assert_eq!(client.base_url.as_str(), "https://dati.gov.it/opendata/");
        assert_eq!(client.connector_type(), "ckan");
    }

    #[test]
    fn test_new_with_invalid_url() {
        let result = CkanClient::new("not-a-valid-url", HttpConfig::default());
        assert!(matches!(result, Err(AppError::InvalidUrl(msg)) if msg.contains("Invalid CKAN URL")));
    }

    #[test]
    fn test_into_seed_maps_fields() {
        let seed = CkanClient::into_seed(
            dataset(
                r#"{
                "id": "dataset-123",
                "name": "my-dataset",
                "title": "My Dataset",
                "notes": "This is a test dataset",
                "author": "Jane",
                "license_id": "cc-by",
                "language": "nl",
                "metadata_modified": "2024-01-15T10:30:00.123456",
                "organization": {"name": "org", "title": "Organisation"},
                "resources": [
                    {"url": "https://example.com/a.csv", "format": "CSV", "name": "A"},
                    {"url": ""}
                ],
                "tags": [{"name": "air"}],
                "num_resources": 2
            }"#,
            ),
            "https://dati.gov.it/",
        );

        assert_eq!(seed.state, SeedState::Active);
        assert_eq!(seed.url.as_deref(), Some("https://dati.gov.it/dataset/my-dataset"));
        assert_eq!(seed.files.len(), 1);
        assert_eq!(seed.files[0].mime_type.as_deref(), Some("CSV"));
        assert_eq!(seed.publishers, vec!["Organisation".to_string()]);
        assert_eq!(seed.authors, vec!["Jane".to_string()]);
        assert_eq!(seed.language.metadata.as_deref(), Some("nl"));
        assert_eq!(
            seed.modified_at.unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
                + chrono::Duration::microseconds(123456)
        );
        assert_eq!(seed.metadata["keywords"], serde_json::json!(["air"]));
        assert_eq!(seed.metadata["num_resources"], serde_json::json!(2));
    }

    #[test]
    fn test_into_seed_states() {
        let deleted = dataset(r#"{"id": "a", "name": "a", "state": "deleted"}"#);
        assert_eq!(CkanClient::into_seed(deleted, "x").state, SeedState::Deleted);
        let private = dataset(r#"{"id": "b", "name": "b", "private": true}"#);
        assert_eq!(CkanClient::into_seed(private, "x").state, SeedState::Inactive);
    }

    #[test]
    fn test_filter_query() {
        assert_eq!(filter_query("*", epoch()), None);
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            filter_query("rivm", since).unwrap(),
            "organization:rivm AND metadata_modified:[2024-03-01T12:00:00.000Z TO *]"
        );
    }

    #[test]
    fn test_search_page_deserialization() {
        let json = r#"{
            "success": true,
            "result": {"count": 1, "results": [{"id": "x", "name": "x"}]}
        }"#;
        let response: CkanResponse<SearchPage> = serde_json::from_str(json).unwrap();
        assert!(response.success);
        assert_eq!(response.result.count, 1);
        assert_eq!(response.result.results[0].id, "x");
    }
}
