//! Upstream account directory with a long-lived cache.
//!
//! The internal account API changes rarely, so listings are cached for
//! three hours. Only accounts with AI features enabled are exposed. The
//! upstream payload is either a bare array or `{"accounts": [...]}`, both
//! handled here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

pub const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("account api error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccountInfo {
    pub name: String,
    #[serde(rename = "accountId")]
    pub account_id: String,
}

struct CachedListing {
    accounts: Vec<AccountInfo>,
    fetched_at: Instant,
}

/// Client for the internal account service. Shared via `Arc`; the single
/// listing slot uses the same double-checked discipline as the filter
/// cache so a cold start fetches once.
pub struct AccountDirectory {
    client: Client,
    base_url: String,
    ttl: Duration,
    listing: Mutex<Option<CachedListing>>,
    fetch_lock: Mutex<()>,
}

impl AccountDirectory {
    pub fn new(base_url: &str) -> Arc<Self> {
        Self::with_ttl(base_url, ACCOUNT_CACHE_TTL)
    }

    pub fn with_ttl(base_url: &str, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
            listing: Mutex::new(None),
            fetch_lock: Mutex::new(()),
        })
    }

    /// Active AI-enabled accounts, served from cache when fresh.
    pub async fn list(&self) -> Result<Vec<AccountInfo>, DirectoryError> {
        if let Some(accounts) = self.cached().await {
            return Ok(accounts);
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(accounts) = self.cached().await {
            return Ok(accounts);
        }

        let accounts = self.fetch().await?;
        info!(accounts = accounts.len(), "refreshed account directory");
        *self.listing.lock().await = Some(CachedListing {
            accounts: accounts.clone(),
            fetched_at: Instant::now(),
        });
        Ok(accounts)
    }

    async fn cached(&self) -> Option<Vec<AccountInfo>> {
        let listing = self.listing.lock().await;
        listing
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.accounts.clone())
    }

    async fn fetch(&self) -> Result<Vec<AccountInfo>, DirectoryError> {
        let url = format!("{}/account-service/account", self.base_url);
        let payload: Value = self
            .client
            .get(&url)
            .header("authorized-user-roles", "sysAdmin")
            .query(&[("isActive", "true")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_accounts(&payload))
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, by: Duration) {
        let mut listing = self.listing.lock().await;
        if let Some(entry) = listing.as_mut() {
            entry.fetched_at -= by;
        }
    }

    #[cfg(test)]
    pub(crate) async fn prime(&self, accounts: Vec<AccountInfo>) {
        *self.listing.lock().await = Some(CachedListing {
            accounts,
            fetched_at: Instant::now(),
        });
    }
}

/// Extract AI-enabled accounts from either upstream payload shape.
fn parse_accounts(payload: &Value) -> Vec<AccountInfo> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("accounts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };

    items
        .iter()
        .filter(|account| {
            account["generalConfig"]["aiFeaturesEnabled"]
                .as_bool()
                .unwrap_or(false)
        })
        .map(|account| AccountInfo {
            name: account["name"].as_str().unwrap_or("Unknown").to_string(),
            account_id: account["accountId"].as_str().unwrap_or("").to_string(),
        })
        .collect()
}
