//! Session registry: one live MCP bridge per user session.
//!
//! Owns the session map behind a single mutex, so every mutation
//! (create, self-heal, account switch, eviction, sweep) is serialized.
//! Registry operations hold the lock across bridge lifecycle awaits on
//! purpose: concurrent binds for the same capacity slot must not interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bridge::{BridgeError, BridgeFactory, ToolBridge};
use crate::metrics::{self, SharedMetrics};
use crate::security::{validate_account_id, ValidationError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

struct SessionRecord {
    account_id: String,
    bridge: Arc<dyn ToolBridge>,
    last_activity: Instant,
}

/// Maps session tokens to their bridge and bound account.
pub struct SessionRegistry {
    factory: Arc<dyn BridgeFactory>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    capacity: usize,
    idle_timeout: Duration,
    metrics: SharedMetrics,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn BridgeFactory>,
        capacity: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
            capacity,
            idle_timeout,
            metrics: metrics::shared(),
        }
    }

    /// Report lifecycle counters to an externally owned handle instead of
    /// the registry's private one.
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Resolve the bridge for `session_id`, healing or creating as needed.
    ///
    /// An existing record whose subprocess died is transparently restarted
    /// with its previously bound account. A missing record is created from
    /// `account_hint` only; without a hint there is deliberately no
    /// process-wide fallback account, so the caller gets `None` and must
    /// ask the user to bind an account first.
    pub async fn ensure(
        &self,
        session_id: &str,
        account_hint: Option<&str>,
    ) -> Result<Option<Arc<dyn ToolBridge>>, RegistryError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(record) = sessions.get_mut(session_id) {
            if !record.bridge.is_alive().await {
                warn!(
                    session = %short(session_id),
                    account = %record.account_id,
                    "bridge died, restarting"
                );
                record.bridge.restart(&record.account_id).await?;
                metrics::lock(&self.metrics).record_bridge_healed();
            }
            record.last_activity = Instant::now();
            return Ok(Some(record.bridge.clone()));
        }

        let account_id = match account_hint {
            Some(hint) => validate_account_id(hint)?,
            None => return Ok(None),
        };

        if sessions.len() >= self.capacity && evict_oldest(&mut sessions).await {
            metrics::lock(&self.metrics).record_sessions_evicted(1);
        }

        info!(session = %short(session_id), account = %account_id, "creating session bridge");
        let bridge = self.factory.create(account_id).await?;
        sessions.insert(
            session_id.to_string(),
            SessionRecord {
                account_id: account_id.to_string(),
                bridge: bridge.clone(),
                last_activity: Instant::now(),
            },
        );
        metrics::lock(&self.metrics).record_session_created();
        Ok(Some(bridge))
    }

    /// Bind `session_id` to `account_id`, restarting its bridge when the
    /// account actually changes. The restart happens before the record is
    /// updated so the old subprocess can never answer under the new account.
    pub async fn switch(&self, session_id: &str, account_id: &str) -> Result<(), RegistryError> {
        let account_id = validate_account_id(account_id)?;
        let mut sessions = self.sessions.lock().await;

        if let Some(record) = sessions.get_mut(session_id) {
            if record.account_id != account_id {
                info!(
                    session = %short(session_id),
                    from = %record.account_id,
                    to = %account_id,
                    "switching account"
                );
                record.bridge.restart(account_id).await?;
                record.account_id = account_id.to_string();
            }
            record.last_activity = Instant::now();
            return Ok(());
        }

        if sessions.len() >= self.capacity && evict_oldest(&mut sessions).await {
            metrics::lock(&self.metrics).record_sessions_evicted(1);
        }

        info!(session = %short(session_id), account = %account_id, "creating session bridge");
        let bridge = self.factory.create(account_id).await?;
        sessions.insert(
            session_id.to_string(),
            SessionRecord {
                account_id: account_id.to_string(),
                bridge,
                last_activity: Instant::now(),
            },
        );
        metrics::lock(&self.metrics).record_session_created();
        Ok(())
    }

    /// Account currently bound to a session, if any.
    pub async fn account_for(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|r| r.account_id.clone())
    }

    /// Stop and remove every session idle longer than the timeout.
    /// Returns the number of sessions removed.
    pub async fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now()).await
    }

    async fn sweep_idle_at(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_activity) > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &expired {
            if let Some(record) = sessions.remove(session_id) {
                info!(
                    session = %short(session_id),
                    account = %record.account_id,
                    "cleaning up idle session"
                );
                record.bridge.stop().await;
            }
        }

        if !expired.is_empty() {
            metrics::lock(&self.metrics).record_sessions_expired(expired.len() as u64);
            info!(removed = expired.len(), active = sessions.len(), "idle sweep done");
        }
        expired.len()
    }

    /// Number of live sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Stop every bridge and clear the map. Used at process shutdown.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (session_id, record) in sessions.drain() {
            info!(session = %short(&session_id), "stopping session bridge");
            record.bridge.stop().await;
        }
    }

    #[cfg(test)]
    async fn backdate(&self, session_id: &str, by: Duration) {
        let mut sessions = self.sessions.lock().await;
        if let Some(record) = sessions.get_mut(session_id) {
            record.last_activity = record
                .last_activity
                .checked_sub(by)
                .expect("backdate underflow");
        }
    }
}

/// Evict the single globally oldest-by-activity record to free a slot.
/// Returns whether a record was actually removed.
async fn evict_oldest(sessions: &mut HashMap<String, SessionRecord>) -> bool {
    let oldest = sessions
        .iter()
        .min_by_key(|(_, r)| r.last_activity)
        .map(|(id, _)| id.clone());

    if let Some(session_id) = oldest {
        if let Some(record) = sessions.remove(&session_id) {
            warn!(
                session = %short(&session_id),
                account = %record.account_id,
                "evicting oldest session"
            );
            record.bridge.stop().await;
            return true;
        }
    }
    false
}

/// Truncated token for logs; full session tokens never hit the log stream.
/// Cuts on a character boundary so arbitrary cookie values cannot panic
/// the log-field expression.
fn short(session_id: &str) -> &str {
    session_id
        .char_indices()
        .nth(8)
        .map_or(session_id, |(i, _)| &session_id[..i])
}
