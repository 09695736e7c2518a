//! HTTP client for the enrichment resource service.
//!
//! The service exposes one endpoint per resource kind:
//!
//! - `POST {base}/{kind}` with `{"args": [...], "kwargs": {...}}` runs a
//!   resource and answers `{"successes": [ids], "failures": [ids]}`.
//! - `GET {base}/{kind}/{id}` returns the content of a produced resource.
//!
//! Each call is a single attempt. Budgets and retries belong to the caller.

use async_trait::async_trait;
use gleaner_core::config::HttpConfig;
use gleaner_core::error::AppError;
use gleaner_core::models::ResourceRef;
use gleaner_core::traits::{CallOutcome, ResourceFetcher, ResourceRequest};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::http::{build_client, transport_error};

#[derive(Serialize, Debug)]
struct CallBody<'a> {
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
}

#[derive(Deserialize, Debug)]
struct CallResponse {
    #[serde(default)]
    successes: Vec<Value>,
    #[serde(default)]
    failures: Vec<Value>,
}

impl CallResponse {
    fn into_outcome(self, kind: &str) -> CallOutcome {
        let refs = |ids: Vec<Value>| -> Vec<ResourceRef> {
            ids.into_iter()
                .filter_map(|id| match id {
                    Value::String(s) => Some(s),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .map(|id| ResourceRef::new(kind, id))
                .collect()
        };
        CallOutcome {
            successes: refs(self.successes),
            failures: refs(self.failures),
        }
    }
}

#[derive(Clone)]
pub struct ResourceServiceClient {
    client: Client,
    base_url: Url,
    config: HttpConfig,
}

impl ResourceServiceClient {
    pub fn new(base_url_str: &str, config: HttpConfig) -> Result<Self, AppError> {
        let mut base_url = Url::parse(base_url_str).map_err(|_| {
            AppError::InvalidUrl(format!("Invalid resource service URL: {}", base_url_str))
        })?;
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

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::InvalidUrl(e.to_string()))
    }

    async fn json(&self, resp: Response) -> Result<Value, AppError> {
        let status = resp.status();
        if status.is_server_error() {
            return Err(AppError::NetworkError(format!(
                "Resource service error: HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(AppError::ClientError(format!(
                "Resource service returned HTTP {}",
                status.as_u16()
            )));
        }
        resp.json()
            .await
            .map_err(|e| transport_error(e, &self.config))
    }
}

#[async_trait]
impl ResourceFetcher for ResourceServiceClient {
    async fn call(&self, request: &ResourceRequest) -> Result<CallOutcome, AppError> {
        let url = self.endpoint(&request.kind)?;
        let body = CallBody {
            args: &request.args,
            kwargs: &request.kwargs,
        };
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, &self.config))?;
        let value = self.json(resp).await?;
        let response: CallResponse = serde_json::from_value(value)?;
        Ok(response.into_outcome(&request.kind))
    }

    async fn retrieve(&self, resource: &ResourceRef) -> Result<Value, AppError> {
        let url = self.endpoint(&format!("{}/{}", resource.kind, resource.id))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, &self.config))?;
        self.json(resp).await
    }
}
