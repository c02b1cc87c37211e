//! Out-of-band store for full tool outputs.
//!
//! Stream events carry only lean tool summaries; the full records
//! (including raw tool output, which can be large) are parked here under a
//! generated request id and fetched by the client in a follow-up request.
//! Entries expire after a fixed TTL and expired entries are distinguishable
//! from ids that never existed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::chat::ToolCallRecord;

/// How long stored tool outputs stay fetchable.
pub const OUTPUT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("no stored results for request {0}")]
    NotFound(String),
    #[error("results for request {0} have expired")]
    Expired(String),
}

struct StoredOutput {
    records: Vec<ToolCallRecord>,
    stored_at: Instant,
}

/// Owned store; clone the `Arc` to share between the pipeline and the
/// fetch path.
pub struct ToolOutputStore {
    entries: Mutex<HashMap<String, StoredOutput>>,
    ttl: Duration,
}

impl ToolOutputStore {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(OUTPUT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    /// Store one turn's tool records; returns the request id the client
    /// uses to fetch them.
    pub async fn insert(&self, records: Vec<ToolCallRecord>) -> String {
        let request_id = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().await;
        entries.insert(
            request_id.clone(),
            StoredOutput {
                records,
                stored_at: Instant::now(),
            },
        );
        debug!(request_id = %request_id, "stored tool outputs");
        request_id
    }

    /// Fetch (without consuming) the records for a request id.
    pub async fn fetch(&self, request_id: &str) -> Result<Vec<ToolCallRecord>, OutboxError> {
        let mut entries = self.entries.lock().await;
        match entries.get(request_id) {
            None => Err(OutboxError::NotFound(request_id.to_string())),
            Some(entry) if entry.stored_at.elapsed() > self.ttl => {
                entries.remove(request_id);
                Err(OutboxError::Expired(request_id.to_string()))
            }
            Some(entry) => Ok(entry.records.clone()),
        }
    }

    /// Drop every expired entry; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, request_id: &str, by: Duration) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(request_id) {
            entry.stored_at -= by;
        }
    }
}
