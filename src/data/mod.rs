//! Data-fetch providers with failover
//!
//! Providers are tried in priority order per requirement. Whatever
//! succeeds refreshes the last-known cache, which is consulted last.

use crate::error::OrchestrationError;
use crate::models::{DataProvenance, DataRequirement};
use crate::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const CACHE_PROVIDER_NAME: &str = "last_known_cache";
const FETCH_PATH: &str = "/api/v1/data/fetch";

/// Resolved payload for one requirement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub requirement_id: String,
    /// Provider that actually served the data.
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: Value,
}

impl Dataset {
    pub fn provenance(&self) -> DataProvenance {
        DataProvenance {
            requirement_id: self.requirement_id.clone(),
            provider: self.provider.clone(),
            fetched_at: self.fetched_at,
        }
    }
}

/// One market/economic data source
#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, requirement: &DataRequirement) -> Result<Dataset>;
}

#[derive(Debug, Clone)]
pub struct DataApiConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// JSON-over-HTTP data service
pub struct HttpDataProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDataProvider {
    pub fn new(config: &DataApiConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            OrchestrationError::FetchError(format!(
                "{} request failed for {}: {}",
                self.name, path, e
            ))
        })?;

        let status = response.status();
        let body = response.json::<Value>().await.map_err(|e| {
            OrchestrationError::FetchError(format!("{} returned invalid JSON: {}", self.name, e))
        })?;

        if !status.is_success() {
            return Err(OrchestrationError::FetchError(format!(
                "{} returned {} for {}: {}",
                self.name, status, path, body
            )));
        }

        Ok(body)
    }
}

#[async_trait::async_trait]
impl DataProvider for HttpDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, requirement: &DataRequirement) -> Result<Dataset> {
        let body = json!({
            "id": requirement.id,
            "kind": requirement.kind,
            "source": requirement.source,
            "start": requirement.range.start,
            "end": requirement.range.end,
        });

        let response = self.post_json(FETCH_PATH, &body).await?;
        let payload = response.get("data").cloned().unwrap_or(response);

        if payload.is_null() {
            return Err(OrchestrationError::FetchError(format!(
                "{} returned no data for {}",
                self.name, requirement.id
            )));
        }

        Ok(Dataset {
            requirement_id: requirement.id.clone(),
            provider: self.name.clone(),
            fetched_at: Utc::now(),
            payload,
        })
    }
}

/// Last successful payload per requirement
#[derive(Default)]
pub struct CachedDataProvider {
    entries: RwLock<HashMap<String, Dataset>>,
}

impl CachedDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, requirement: &DataRequirement, dataset: &Dataset) {
        let mut entries = self.entries.write().await;
        entries.insert(cache_key(requirement), dataset.clone());
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl DataProvider for CachedDataProvider {
    fn name(&self) -> &str {
        CACHE_PROVIDER_NAME
    }

    /// Served data keeps its original fetch time so freshness stays honest.
    async fn fetch(&self, requirement: &DataRequirement) -> Result<Dataset> {
        let entries = self.entries.read().await;
        entries
            .get(&cache_key(requirement))
            .map(|cached| Dataset {
                provider: CACHE_PROVIDER_NAME.to_string(),
                ..cached.clone()
            })
            .ok_or_else(|| {
                OrchestrationError::FetchError(format!(
                    "no cached data for {}",
                    requirement.id
                ))
            })
    }
}

fn cache_key(requirement: &DataRequirement) -> String {
    format!(
        "{:?}|{}|{}|{:?}|{:?}",
        requirement.kind,
        requirement.source,
        requirement.id,
        requirement.range.start,
        requirement.range.end
    )
}

/// Priority-ordered failover over providers plus the cache
#[derive(Clone)]
pub struct DataFetcher {
    providers: Vec<Arc<dyn DataProvider>>,
    cache: Arc<CachedDataProvider>,
}

impl DataFetcher {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>, cache: Arc<CachedDataProvider>) -> Self {
        Self { providers, cache }
    }

    pub fn from_configs(configs: &[DataApiConfig]) -> Result<Self> {
        let providers = configs
            .iter()
            .map(|c| HttpDataProvider::new(c).map(|p| Arc::new(p) as Arc<dyn DataProvider>))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(providers, Arc::new(CachedDataProvider::new())))
    }

    pub fn cache(&self) -> &Arc<CachedDataProvider> {
        &self.cache
    }

    pub async fn fetch(&self, requirement: &DataRequirement) -> Result<Dataset> {
        let mut failures = Vec::new();

        for provider in &self.providers {
            match provider.fetch(requirement).await {
                Ok(dataset) => {
                    debug!(
                        requirement = %requirement.id,
                        provider = provider.name(),
                        "Data requirement resolved"
                    );
                    self.cache.store(requirement, &dataset).await;
                    return Ok(dataset);
                }
                Err(e) => {
                    warn!(
                        requirement = %requirement.id,
                        provider = provider.name(),
                        error = %e,
                        "Data provider failed, trying next"
                    );
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        match self.cache.fetch(requirement).await {
            Ok(dataset) => {
                warn!(requirement = %requirement.id, "Serving last-known cached data");
                Ok(dataset)
            }
            Err(e) => {
                failures.push(format!("{}: {}", CACHE_PROVIDER_NAME, e));
                Err(OrchestrationError::FetchError(format!(
                    "all providers failed for {} ({})",
                    requirement.id,
                    failures.join("; ")
                )))
            }
        }
    }

    /// Resolve every requirement; the first unresolvable one fails the batch.
    pub async fn fetch_all(&self, requirements: &[DataRequirement]) -> Result<Vec<Dataset>> {
        let mut datasets = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            datasets.push(self.fetch(requirement).await?);
        }
        Ok(datasets)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{DataKind, DateRange};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory provider that fails the first `failures` calls.
    pub(crate) struct StaticProvider {
        pub name: String,
        pub payload: Value,
        pub failures: usize,
        pub calls: AtomicUsize,
    }

    impl StaticProvider {
        pub(crate) fn new(name: &str, payload: Value, failures: usize) -> Self {
            Self {
                name: name.to_string(),
                payload,
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl DataProvider for StaticProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self, requirement: &DataRequirement) -> Result<Dataset> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(OrchestrationError::FetchError(format!("{} down", self.name)));
            }
            Ok(Dataset {
                requirement_id: requirement.id.clone(),
                provider: self.name.clone(),
                fetched_at: Utc::now(),
                payload: self.payload.clone(),
            })
        }
    }

    fn requirement() -> DataRequirement {
        DataRequirement {
            id: "aapl_prices".to_string(),
            kind: DataKind::Prices,
            source: "AAPL".to_string(),
            range: DateRange::default(),
        }
    }

    #[tokio::test]
    async fn test_primary_serves_first() {
        let fetcher = DataFetcher::new(
            vec![
                Arc::new(StaticProvider::new("primary", json!([1]), 0)),
                Arc::new(StaticProvider::new("secondary", json!([2]), 0)),
            ],
            Arc::new(CachedDataProvider::new()),
        );

        let ds = fetcher.fetch(&requirement()).await.unwrap();
        assert_eq!(ds.provider, "primary");
        assert_eq!(ds.payload, json!([1]));
        assert_eq!(fetcher.cache().len().await, 1);
    }

    #[tokio::test]
    async fn test_fails_over_to_secondary() {
        let fetcher = DataFetcher::new(
            vec![
                Arc::new(StaticProvider::new("primary", json!([1]), usize::MAX)),
                Arc::new(StaticProvider::new("secondary", json!([2]), 0)),
            ],
            Arc::new(CachedDataProvider::new()),
        );

        let ds = fetcher.fetch(&requirement()).await.unwrap();
        assert_eq!(ds.provider, "secondary");
        assert_eq!(ds.provenance().provider, "secondary");
    }

    #[tokio::test]
    async fn test_cache_serves_with_original_timestamp() {
        let primary = Arc::new(StaticProvider::new("primary", json!([1]), 0));
        let cache = Arc::new(CachedDataProvider::new());
        let fetcher = DataFetcher::new(vec![primary.clone()], cache.clone());

        let first = fetcher.fetch(&requirement()).await.unwrap();

        let offline = DataFetcher::new(
            vec![Arc::new(StaticProvider::new("primary", json!([9]), usize::MAX))],
            cache,
        );
        let cached = offline.fetch(&requirement()).await.unwrap();

        assert_eq!(cached.provider, CACHE_PROVIDER_NAME);
        assert_eq!(cached.fetched_at, first.fetched_at);
        assert_eq!(cached.payload, json!([1]));
    }

    #[tokio::test]
    async fn test_all_failing_is_fetch_error() {
        let fetcher = DataFetcher::new(
            vec![Arc::new(StaticProvider::new("primary", json!([1]), usize::MAX))],
            Arc::new(CachedDataProvider::new()),
        );

        match fetcher.fetch_all(&[requirement()]).await {
            Err(OrchestrationError::FetchError(msg)) => {
                assert!(msg.contains("primary"));
                assert!(msg.contains(CACHE_PROVIDER_NAME));
            }
            other => panic!("expected fetch error, got {:?}", other),
        }
    }
}
