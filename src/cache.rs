//! Two-tier TTL cache for upstream filter data.
//!
//! Tier 1 holds the structural metadata tree (cost center → filter type →
//! filter descriptors, no value lists) in a single slot with a 15 minute
//! TTL. Tier 2 holds per-filter value lists keyed by
//! `cost_center:filter_type:filter_key` with a 10 minute TTL.
//!
//! Both tiers run check → lock → re-check → fetch → populate so that any
//! number of concurrent misses for one key collapse into a single upstream
//! fetch. Fetch failures are never cached; the slot stays empty and the
//! next caller retries. Per-key locking uses a fixed sharded pool instead
//! of a lock-per-key map, which bounds memory under many distinct keys.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

pub const METADATA_TTL: Duration = Duration::from_secs(15 * 60);
pub const VALUE_TTL: Duration = Duration::from_secs(10 * 60);
const LOCK_SHARDS: usize = 64;

/// Date window forwarded to the upstream fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Identifies one filter in the upstream taxonomy. The components are
/// opaque here; they only shape the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterKey {
    pub filter_key: String,
    #[serde(default)]
    pub cost_center: Option<String>,
    #[serde(default)]
    pub filter_type: Option<String>,
}

impl FilterKey {
    pub fn new(filter_key: impl Into<String>) -> Self {
        Self {
            filter_key: filter_key.into(),
            cost_center: None,
            filter_type: None,
        }
    }

    pub fn scoped(
        filter_key: impl Into<String>,
        cost_center: impl Into<String>,
        filter_type: impl Into<String>,
    ) -> Self {
        Self {
            filter_key: filter_key.into(),
            cost_center: Some(cost_center.into()),
            filter_type: Some(filter_type.into()),
        }
    }

    /// Composite cache key: `cost_center:filter_type:filter_key`, with
    /// absent components skipped.
    pub fn cache_key(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if let Some(cc) = &self.cost_center {
            parts.push(cc);
        }
        if let Some(ft) = &self.filter_type {
            parts.push(ft);
        }
        parts.push(&self.filter_key);
        parts.join(":")
    }
}

/// Upstream fetch capability injected into the cache.
#[async_trait]
pub trait FilterFetcher: Send + Sync {
    /// Fetch the full metadata tree, without value lists.
    async fn fetch_metadata(&self, date: Option<&DateRange>) -> Result<Value, FetchError>;

    /// Fetch the complete value list for one filter.
    async fn fetch_values(
        &self,
        key: &FilterKey,
        date: Option<&DateRange>,
    ) -> Result<Vec<Value>, FetchError>;
}

/// Production fetcher against the internal cost-service filters endpoint.
///
/// Metadata is requested with `includeValues: false` (the full payload runs
/// to many megabytes); value lists are requested per filter key and pulled
/// out of the matching entry's `values` map.
pub struct HttpFilterFetcher {
    client: reqwest::Client,
    base_url: String,
    account_id: String,
}

impl HttpFilterFetcher {
    pub fn new(base_url: &str, account_id: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
        }
    }

    async fn post_filters(&self, payload: Value) -> Result<Value, FetchError> {
        let url = format!("{}/cost-service/filters", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("authorized-user-roles", "admin")
            .header("authorized-account-id", &self.account_id)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl FilterFetcher for HttpFilterFetcher {
    async fn fetch_metadata(&self, date: Option<&DateRange>) -> Result<Value, FetchError> {
        let mut payload = serde_json::json!({"includeValues": false});
        if let Some(date) = date {
            payload["date"] = date_payload(date);
        }
        self.post_filters(payload).await
    }

    async fn fetch_values(
        &self,
        key: &FilterKey,
        date: Option<&DateRange>,
    ) -> Result<Vec<Value>, FetchError> {
        let mut payload = serde_json::json!({
            "includeValues": true,
            "filterKey": key.filter_key,
        });
        if let Some(date) = date {
            payload["date"] = date_payload(date);
        }
        if let Some(cc) = &key.cost_center {
            payload["costCenter"] = Value::String(cc.clone());
        }
        if let Some(ft) = &key.filter_type {
            payload["filterType"] = Value::String(ft.clone());
        }

        let result = self.post_filters(payload).await?;
        Ok(extract_values(&result, key))
    }
}

fn date_payload(date: &DateRange) -> Value {
    serde_json::json!({
        "from": date.from.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis(),
        "to": date.to.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis(),
    })
}

/// Pull the value list for one filter out of the endpoint's response: an
/// array of filter entries whose `values` field maps value → metadata.
fn extract_values(result: &Value, key: &FilterKey) -> Vec<Value> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    for item in items {
        if item["key"].as_str() != Some(key.filter_key.as_str()) {
            continue;
        }
        if let Some(cc) = &key.cost_center {
            if item["costCenter"].as_str() != Some(cc.as_str()) {
                continue;
            }
        }
        if let Some(values) = item["values"].as_object() {
            return values.keys().cloned().map(Value::String).collect();
        }
        return Vec::new();
    }
    Vec::new()
}

/// Truncated value page returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct FilterValuesPage {
    pub values: Vec<Value>,
    pub total_count: usize,
    pub returned_count: usize,
    pub is_truncated: bool,
}

/// Snapshot of cache freshness, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub metadata_cached: bool,
    pub metadata_age_secs: Option<u64>,
    pub metadata_fresh: bool,
    pub value_entries: usize,
}

struct MetadataEntry {
    data: Value,
    fetched_at: Instant,
}

struct ValueEntry {
    values: Vec<Value>,
    fetched_at: Instant,
}

pub struct FilterCache {
    fetcher: Arc<dyn FilterFetcher>,
    metadata_ttl: Duration,
    value_ttl: Duration,
    metadata: Mutex<Option<MetadataEntry>>,
    metadata_fetch: Mutex<()>,
    values: Mutex<HashMap<String, ValueEntry>>,
    value_locks: Vec<Mutex<()>>,
}

impl FilterCache {
    pub fn new(fetcher: Arc<dyn FilterFetcher>) -> Self {
        Self::with_ttls(fetcher, METADATA_TTL, VALUE_TTL)
    }

    pub fn with_ttls(
        fetcher: Arc<dyn FilterFetcher>,
        metadata_ttl: Duration,
        value_ttl: Duration,
    ) -> Self {
        Self {
            fetcher,
            metadata_ttl,
            value_ttl,
            metadata: Mutex::new(None),
            metadata_fetch: Mutex::new(()),
            values: Mutex::new(HashMap::new()),
            value_locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Structural metadata tree, cached for 15 minutes.
    pub async fn get_metadata(
        &self,
        date: Option<&DateRange>,
        use_cache: bool,
    ) -> Result<Value, FetchError> {
        if use_cache {
            if let Some(data) = self.fresh_metadata().await {
                return Ok(data);
            }
        }

        // Single fetch lock collapses a stampede of concurrent misses.
        let _fetch = self.metadata_fetch.lock().await;
        if use_cache {
            if let Some(data) = self.fresh_metadata().await {
                return Ok(data);
            }
        }

        debug!("fetching filter metadata from upstream");
        let data = self.fetcher.fetch_metadata(date).await?;
        *self.metadata.lock().await = Some(MetadataEntry {
            data: data.clone(),
            fetched_at: Instant::now(),
        });
        Ok(data)
    }

    /// Value list for one filter, lazy-loaded and cached for 10 minutes.
    /// The full fetched list is cached; at most `limit` values are
    /// returned, in fetch order, with the total always reported.
    pub async fn get_values(
        &self,
        key: &FilterKey,
        date: Option<&DateRange>,
        limit: usize,
        use_cache: bool,
    ) -> Result<FilterValuesPage, FetchError> {
        let cache_key = key.cache_key();

        if use_cache {
            if let Some(page) = self.fresh_values(&cache_key, limit).await {
                return Ok(page);
            }
        }

        let shard = &self.value_locks[shard_index(&cache_key, self.value_locks.len())];
        let _guard = shard.lock().await;
        if use_cache {
            if let Some(page) = self.fresh_values(&cache_key, limit).await {
                return Ok(page);
            }
        }

        debug!(key = %cache_key, "fetching filter values from upstream");
        let values = self.fetcher.fetch_values(key, date).await?;
        let page = make_page(&values, limit);
        self.values.lock().await.insert(
            cache_key,
            ValueEntry {
                values,
                fetched_at: Instant::now(),
            },
        );
        Ok(page)
    }

    /// Drop the metadata tier.
    pub async fn clear_metadata(&self) {
        *self.metadata.lock().await = None;
    }

    /// Drop value entries, either for one filter key (any cost center or
    /// type) or all of them.
    pub async fn clear_values(&self, filter_key: Option<&str>) {
        let mut values = self.values.lock().await;
        match filter_key {
            Some(fk) => {
                let suffix = format!(":{fk}");
                values.retain(|k, _| !(k.ends_with(&suffix) || k == fk));
            }
            None => values.clear(),
        }
    }

    pub async fn clear_all(&self) {
        self.clear_metadata().await;
        self.clear_values(None).await;
    }

    pub async fn stats(&self) -> CacheStats {
        let metadata = self.metadata.lock().await;
        let age = metadata.as_ref().map(|e| e.fetched_at.elapsed());
        CacheStats {
            metadata_cached: metadata.is_some(),
            metadata_age_secs: age.map(|a| a.as_secs()),
            metadata_fresh: age.map(|a| a < self.metadata_ttl).unwrap_or(false),
            value_entries: self.values.lock().await.len(),
        }
    }

    async fn fresh_metadata(&self) -> Option<Value> {
        let metadata = self.metadata.lock().await;
        metadata
            .as_ref()
            .filter(|e| e.fetched_at.elapsed() < self.metadata_ttl)
            .map(|e| e.data.clone())
    }

    async fn fresh_values(&self, cache_key: &str, limit: usize) -> Option<FilterValuesPage> {
        let values = self.values.lock().await;
        values
            .get(cache_key)
            .filter(|e| e.fetched_at.elapsed() < self.value_ttl)
            .map(|e| make_page(&e.values, limit))
    }

    #[cfg(test)]
    async fn backdate_metadata(&self, by: Duration) {
        let mut metadata = self.metadata.lock().await;
        if let Some(entry) = metadata.as_mut() {
            entry.fetched_at = entry.fetched_at.checked_sub(by).expect("backdate underflow");
        }
    }

    #[cfg(test)]
    async fn backdate_values(&self, cache_key: &str, by: Duration) {
        let mut values = self.values.lock().await;
        if let Some(entry) = values.get_mut(cache_key) {
            entry.fetched_at = entry.fetched_at.checked_sub(by).expect("backdate underflow");
        }
    }
}

fn make_page(values: &[Value], limit: usize) -> FilterValuesPage {
    let returned: Vec<Value> = values.iter().take(limit).cloned().collect();
    FilterValuesPage {
        total_count: values.len(),
        returned_count: returned.len(),
        is_truncated: values.len() > limit,
        values: returned,
    }
}

fn shard_index(cache_key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    cache_key.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}
