//! Elasticsearch/OpenSearch implementation of [`SearchEngine`].

use async_trait::async_trait;
use gleaner_core::config::HttpConfig;
use gleaner_core::error::AppError;
use gleaner_core::traits::{AliasAction, BulkAction, BulkItemResult, SearchEngine};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use url::Url;

use crate::http::{build_client, send_with_retry};

#[derive(Clone)]
pub struct ElasticClient {
    client: Client,
    base_url: Url,
    credentials: Option<(String, String)>,
    config: HttpConfig,
}

impl ElasticClient {
    /// Creates a client for the cluster at `base_url_str`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the URL is malformed.
    pub fn new(base_url_str: &str, config: HttpConfig) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url_str).map_err(|_| {
            AppError::InvalidUrl(format!("Invalid search engine URL: {}", base_url_str))
        })?;
        Ok(Self {
            client: build_client(&config)?,
            base_url,
            credentials: None,
            config,
        })
    }

    /// Uses basic authentication on every request.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    fn url(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::InvalidUrl(e.to_string()))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    async fn send<F>(&self, build: F) -> Result<Response, AppError>
    where
        F: Fn() -> RequestBuilder,
    {
        send_with_retry(&self.config, || self.authorized(build())).await
    }
}

#[async_trait]
impl SearchEngine for ElasticClient {
    async fn index_exists(&self, name: &str) -> Result<bool, AppError> {
        let url = self.url(name)?;
        let resp = self.send(|| self.client.head(url.clone())).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(AppError::SearchEngineError(format!(
                "HEAD {} returned HTTP {}",
                name,
                s.as_u16()
            ))),
        }
    }

    async fn create_index(&self, name: &str, configuration: &Value) -> Result<(), AppError> {
        let url = self.url(name)?;
        let resp = self
            .send(|| self.client.put(url.clone()).json(configuration))
            .await?;
        expect_success(resp, name).await?;
        tracing::info!(index = name, "Created search index");
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), AppError> {
        let url = self.url(name)?;
        let resp = self.send(|| self.client.delete(url.clone())).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::IndexNotFound(name.to_string()));
        }
        expect_success(resp, name).await?;
        tracing::info!(index = name, "Deleted search index");
        Ok(())
    }

    async fn bulk(
        &self,
        index: &str,
        actions: &[BulkAction],
    ) -> Result<Vec<BulkItemResult>, AppError> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(&format!("{}/_bulk", index))?;
        let body = bulk_body(actions)?;
        let resp = self
            .send(|| {
                self.client
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::IndexNotFound(index.to_string()));
        }
        let value = expect_success(resp, index).await?;
        parse_bulk_response(&value)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), AppError> {
        if actions.is_empty() {
            return Ok(());
        }
        let url = self.url("_aliases")?;
        let body = alias_body(actions);
        let resp = self.send(|| self.client.post(url.clone()).json(&body)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::IndexNotFound(
                "alias update matched no index".to_string(),
            ));
        }
        expect_success(resp, "_aliases").await?;
        Ok(())
    }
}

/// Returns the JSON body of a 2xx response, or a search engine error.
async fn expect_success(resp: Response, target: &str) -> Result<Value, AppError> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| AppError::ClientError(e.to_string()))?;
    if !status.is_success() {
        return Err(AppError::SearchEngineError(format!(
            "{} returned HTTP {}: {}",
            target,
            status.as_u16(),
            text
        )));
    }
    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// Newline-delimited bulk request body, terminated by a newline.
fn bulk_body(actions: &[BulkAction]) -> Result<String, AppError> {
    let mut body = String::new();
    for action in actions {
        match action {
            BulkAction::Index { id, body: doc } => {
                body.push_str(&serde_json::to_string(&json!({"index": {"_id": id}}))?);
                body.push('\n');
                body.push_str(&serde_json::to_string(doc)?);
                body.push('\n');
            }
            BulkAction::Delete { id } => {
                body.push_str(&serde_json::to_string(&json!({"delete": {"_id": id}}))?);
                body.push('\n');
            }
        }
    }
    Ok(body)
}

fn parse_bulk_response(value: &Value) -> Result<Vec<BulkItemResult>, AppError> {
    let items = value
        .get("items")
        .and_then(Value::as_array)
        .ok_or(AppError::EmptyResponse)?;

    Ok(items
        .iter()
        .filter_map(|item| item.as_object()?.values().next())
        .map(|result| BulkItemResult {
            id: result
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: result
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(500),
            error: result.get("error").map(|e| match e {
                Value::String(s) => s.clone(),
                other => other
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            }),
        })
        .collect())
}

fn alias_body(actions: &[AliasAction]) -> Value {
    let actions: Vec<Value> = actions
        .iter()
        .map(|action| match action {
            AliasAction::Remove { index, alias } => {
                json!({"remove": {"index": index, "alias": alias}})
            }
            AliasAction::Add { index, alias } => json!({"add": {"index": index, "alias": alias}}),
        })
        .collect();
    json!({ "actions": actions })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_url() {
        assert!(matches!(
            ElasticClient::new("::", HttpConfig::default()),
            Err(AppError::InvalidUrl(_))
        ));
        let client = ElasticClient::new("http://localhost:9200", HttpConfig::default())
            .unwrap()
            .with_credentials("elastic", "secret");
        assert_eq!(
            client.url("edusources-nl/_bulk").unwrap().as_str(),
            "http://localhost:9200/edusources-nl/_bulk"
        );
    }

    #[test]
    fn test_bulk_body_is_ndjson() {
        let body = bulk_body(&[
            BulkAction::Index {
                id: "a".to_string(),
                body: json!({"title": "A"}),
            },
            BulkAction::Delete {
                id: "b".to_string(),
            },
        ])
        .unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], r#"{"index":{"_id":"a"}}"#);
        assert_eq!(lines[1], r#"{"title":"A"}"#);
        assert_eq!(lines[2], r#"{"delete":{"_id":"b"}}"#);
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_parse_bulk_response() {
        let response = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "bad field"}}},
                {"delete": {"_id": "c", "status": 404}}
            ]
        });
        let items = parse_bulk_response(&response).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].status, 201);
        assert!(items[0].error.is_none());
        assert_eq!(items[1].error.as_deref(), Some("bad field"));
        assert_eq!(items[2].id, "c");
        assert_eq!(items[2].status, 404);

        assert!(matches!(
            parse_bulk_response(&json!({})),
            Err(AppError::EmptyResponse)
        ));
    }

    #[test]
    fn test_alias_body_keeps_order() {
        let body = alias_body(&[
            AliasAction::Remove {
                index: "edusources-nl-*".to_string(),
                alias: "edusources-nl".to_string(),
            },
            AliasAction::Add {
                index: "edusources-nl-0.0.2".to_string(),
                alias: "edusources-nl".to_string(),
            },
        ]);
        assert_eq!(body["actions"][0]["remove"]["index"], "edusources-nl-*");
        assert_eq!(body["actions"][1]["add"]["index"], "edusources-nl-0.0.2");
    }
}
