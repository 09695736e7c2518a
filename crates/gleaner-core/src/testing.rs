//! In-process fakes of the remote collaborators, shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::models::ResourceRef;
use crate::traits::{
    AliasAction, BulkAction, BulkItemResult, CallOutcome, ResourceFetcher, ResourceRequest,
    SearchEngine,
};

fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((head, tail)) => {
            name.starts_with(head)
                && (0..=name.len().saturating_sub(head.len()))
                    .filter_map(|skip| name.get(head.len() + skip..))
                    .any(|rest| wildcard_match(tail, rest))
        }
    }
}

#[derive(Debug, Default, Clone)]
struct EngineState {
    indices: BTreeMap<String, BTreeMap<String, Value>>,
    aliases: BTreeMap<String, BTreeSet<String>>,
}

/// Search engine keeping indices, documents and aliases in memory.
#[derive(Debug, Default)]
pub struct FakeSearchEngine {
    state: Mutex<EngineState>,
    log: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    answer_limit: Mutex<Option<usize>>,
}

impl FakeSearchEngine {
    pub fn insert_index(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .indices
            .insert(name.to_string(), BTreeMap::new());
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.state.lock().unwrap().indices.contains_key(name)
    }

    pub fn documents(&self, index: &str) -> BTreeMap<String, Value> {
        self.state
            .lock()
            .unwrap()
            .indices
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn alias_targets(&self, alias: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .aliases
            .get(alias)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ordered record of the mutating calls.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Makes bulk indexing of this document id fail with status 400.
    pub fn reject(&self, id: &str) {
        self.rejected.lock().unwrap().insert(id.to_string());
    }

    /// Drops bulk response items beyond the first `limit` of each request.
    pub fn answer_at_most(&self, limit: usize) {
        *self.answer_limit.lock().unwrap() = Some(limit);
    }

    pub fn rejected_clear(&self) {
        self.rejected.lock().unwrap().clear();
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl SearchEngine for FakeSearchEngine {
    async fn index_exists(&self, name: &str) -> Result<bool, AppError> {
        Ok(self.has_index(name))
    }

    async fn create_index(&self, name: &str, _configuration: &Value) -> Result<(), AppError> {
        self.record(format!("create {}", name));
        let mut state = self.state.lock().unwrap();
        if state.indices.contains_key(name) {
            return Err(AppError::SearchEngineError(format!(
                "index {} already exists",
                name
            )));
        }
        state.indices.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), AppError> {
        self.record(format!("delete {}", name));
        let mut state = self.state.lock().unwrap();
        if state.indices.remove(name).is_none() {
            return Err(AppError::IndexNotFound(name.to_string()));
        }
        for targets in state.aliases.values_mut() {
            targets.remove(name);
        }
        Ok(())
    }

    async fn bulk(
        &self,
        index: &str,
        actions: &[BulkAction],
    ) -> Result<Vec<BulkItemResult>, AppError> {
        self.record(format!("bulk {} {}", index, actions.len()));
        let rejected = self.rejected.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        let docs = state
            .indices
            .get_mut(index)
            .ok_or_else(|| AppError::IndexNotFound(index.to_string()))?;

        let mut results: Vec<BulkItemResult> = actions
            .iter()
            .map(|action| match action {
                BulkAction::Index { id, .. } if rejected.contains(id) => BulkItemResult {
                    id: id.clone(),
                    status: 400,
                    error: Some("mapper_parsing_exception".to_string()),
                },
                BulkAction::Index { id, body } => {
                    let status = if docs.insert(id.clone(), body.clone()).is_some() {
                        200
                    } else {
                        201
                    };
                    BulkItemResult {
                        id: id.clone(),
                        status,
                        error: None,
                    }
                }
                BulkAction::Delete { id } => {
                    let status = if docs.remove(id).is_some() { 200 } else { 404 };
                    BulkItemResult {
                        id: id.clone(),
                        status,
                        error: None,
                    }
                }
            })
            .collect();
        if let Some(limit) = *self.answer_limit.lock().unwrap() {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), AppError> {
        self.record(format!("aliases {}", actions.len()));
        let mut state = self.state.lock().unwrap();
        let mut next = state.clone();

        for action in actions {
            match action {
                AliasAction::Remove { index, alias } => {
                    let targets = next.aliases.entry(alias.clone()).or_default();
                    let before = targets.len();
                    targets.retain(|name| !wildcard_match(index, name));
                    if targets.len() == before {
                        return Err(AppError::IndexNotFound(format!("{} on {}", alias, index)));
                    }
                }
                AliasAction::Add { index, alias } => {
                    if !next.indices.contains_key(index) {
                        return Err(AppError::IndexNotFound(index.clone()));
                    }
                    next.aliases
                        .entry(alias.clone())
                        .or_default()
                        .insert(index.clone());
                }
            }
        }

        *state = next;
        Ok(())
    }
}

/// Resource service that succeeds unless told otherwise.
///
/// Successful calls store content shaped like the real extract, video and
/// preview services return.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    /// Number of upcoming calls that fail at transport level.
    pub transport_failures: AtomicUsize,
    pub always_unreachable: AtomicBool,
    /// Urls whose calls report a failure.
    pub failing_urls: Mutex<HashSet<String>>,
    pub delay: Mutex<Option<Duration>>,
    /// Urls whose calls hang far beyond any time budget.
    pub slow_urls: Mutex<HashSet<String>>,
    /// Extra results returned per successful call.
    pub extra_results: AtomicUsize,
    calls: AtomicUsize,
    contents: Mutex<HashMap<String, Value>>,
}

impl FakeFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().insert(url.to_string());
    }

    fn content(kind: &str, url: &str, call: usize, n: usize) -> Value {
        match kind {
            "video" => json!({"duration": "PT1M30S", "embed_url": format!("{}/embed", url)}),
            "preview" => json!({
                "full_size": format!("{}/full.png", url),
                "preview": format!("{}/preview.png", url),
                "preview_small": format!("{}/small.png", url),
            }),
            _ => json!({"text": format!("  text of\n{} part {} call {}  ", url, n, call)}),
        }
    }
}

#[async_trait]
impl ResourceFetcher for FakeFetcher {
    async fn call(&self, request: &ResourceRequest) -> Result<CallOutcome, AppError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let url = request
            .args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let slow = self.slow_urls.lock().unwrap().contains(&url);
        if slow {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        if self.always_unreachable.load(Ordering::SeqCst) {
            return Err(AppError::NetworkError("connection refused".to_string()));
        }
        if self
            .transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::NetworkError("connection reset".to_string()));
        }

        if self.failing_urls.lock().unwrap().contains(&url) {
            return Ok(CallOutcome {
                successes: Vec::new(),
                failures: vec![ResourceRef::new(&request.kind, format!("error-{}", n))],
            });
        }

        let mut successes = Vec::new();
        let mut contents = self.contents.lock().unwrap();
        for part in 0..=self.extra_results.load(Ordering::SeqCst) {
            let id = format!("{}-{}", n, part);
            contents.insert(id.clone(), Self::content(&request.kind, &url, n, part));
            successes.push(ResourceRef::new(&request.kind, id));
        }
        Ok(CallOutcome {
            successes,
            failures: Vec::new(),
        })
    }

    async fn retrieve(&self, resource: &ResourceRef) -> Result<Value, AppError> {
        self.contents
            .lock()
            .unwrap()
            .get(&resource.id)
            .cloned()
            .ok_or_else(|| AppError::ClientError(format!("no resource {}", resource.id)))
    }
}

#[test]
fn test_wildcard_match() {
    assert!(wildcard_match("*-gleaner-nl", "edusources-0-0-1-gleaner-nl"));
    assert!(!wildcard_match("*-gleaner-nl", "edusources-0-0-1-gleaner-en"));
    assert!(wildcard_match("exact", "exact"));
    assert!(wildcard_match("a*c*e", "abcde"));
}
