use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use finops_gateway::bridge::{BridgeFactory, McpBridgeFactory};
use finops_gateway::cache::{DateRange, FetchError, FilterCache, FilterFetcher, FilterKey};
use finops_gateway::chat::ChatTurn;
use finops_gateway::config::{BridgeConfig, Config};
use finops_gateway::llm::{ContentBlock, LlmError, ModelClient, ModelRequest, ModelResponse, Usage};
use finops_gateway::outbox::ToolOutputStore;
use finops_gateway::registry::SessionRegistry;
use finops_gateway::security::{generate_session_token, validate_session_token};
use finops_gateway::stream::{ChatPipeline, StreamEvent};

/// `cat` echoes request frames back as valid response frames, so the whole
/// bridge stack runs against a real subprocess without an MCP server.
fn echo_bridge_config() -> BridgeConfig {
    BridgeConfig {
        command: "cat".to_string(),
        args: vec![],
        account_env: "FINOPS_ACCOUNT_ID".to_string(),
        stop_grace_secs: 2,
    }
}

fn registry(capacity: usize) -> SessionRegistry {
    SessionRegistry::new(
        Arc::new(McpBridgeFactory::new(echo_bridge_config())),
        capacity,
        Duration::from_secs(30 * 60),
    )
}

/// Test session bind → use → switch → shutdown against a real subprocess
#[tokio::test]
async fn test_session_lifecycle() {
    let registry = registry(10);
    let token = generate_session_token();

    // No record and no hint: the caller must bind an account first.
    let unbound = registry.ensure(&token, None).await.unwrap();
    assert!(unbound.is_none());

    let bridge = registry
        .ensure(&token, Some("acct_alpha"))
        .await
        .unwrap()
        .expect("hint should create a session");
    assert!(bridge.is_alive().await);
    assert_eq!(registry.account_for(&token).await.as_deref(), Some("acct_alpha"));

    // The bound account wins over a different hint on later requests.
    registry.ensure(&token, Some("acct_other")).await.unwrap();
    assert_eq!(registry.account_for(&token).await.as_deref(), Some("acct_alpha"));

    // Explicit switch restarts the subprocess under the new account.
    registry.switch(&token, "acct_beta").await.unwrap();
    assert_eq!(registry.account_for(&token).await.as_deref(), Some("acct_beta"));
    assert_eq!(registry.active_count().await, 1);

    registry.shutdown().await;
    assert_eq!(registry.active_count().await, 0);
}

/// Test capacity eviction drops the globally oldest session
#[tokio::test]
async fn test_capacity_evicts_oldest_session() {
    let registry = registry(2);

    registry.ensure("session_a", Some("acct_a")).await.unwrap();
    registry.ensure("session_b", Some("acct_b")).await.unwrap();
    // Touch A so B becomes the oldest.
    registry.ensure("session_a", None).await.unwrap();

    registry.ensure("session_c", Some("acct_c")).await.unwrap();

    assert_eq!(registry.active_count().await, 2);
    assert!(registry.account_for("session_a").await.is_some());
    assert!(registry.account_for("session_b").await.is_none());
    assert!(registry.account_for("session_c").await.is_some());

    registry.shutdown().await;
}

/// Test malformed account hints are rejected before any subprocess spawns
#[tokio::test]
async fn test_invalid_account_hint_rejected() {
    let registry = registry(10);
    assert!(registry.ensure("session_x", Some("bad account!")).await.is_err());
    assert_eq!(registry.active_count().await, 0);
}

struct StaticFetcher;

#[async_trait]
impl FilterFetcher for StaticFetcher {
    async fn fetch_metadata(
        &self,
        _date: Option<&DateRange>,
    ) -> Result<serde_json::Value, FetchError> {
        Ok(json!({"filters": [{"key": "service"}, {"key": "region"}]}))
    }

    async fn fetch_values(
        &self,
        _key: &FilterKey,
        _date: Option<&DateRange>,
    ) -> Result<Vec<serde_json::Value>, FetchError> {
        Ok((0..120).map(|i| json!(format!("value-{i}"))).collect())
    }
}

/// Test filter metadata and value caching through the public API
#[tokio::test]
async fn test_filter_cache_flow() {
    let cache = FilterCache::new(Arc::new(StaticFetcher));
    let date = DateRange {
        from: chrono::NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
        to: chrono::NaiveDate::from_ymd_opt(2026, 8, 25).unwrap(),
    };

    let metadata = cache.get_metadata(Some(&date), true).await.unwrap();
    assert_eq!(metadata["filters"][0]["key"], "service");

    let key = FilterKey::new("service");
    let page = cache.get_values(&key, Some(&date), 50, true).await.unwrap();
    assert_eq!(page.returned_count, 50);
    assert_eq!(page.total_count, 120);
    assert!(page.is_truncated);
    assert_eq!(page.values[0], json!("value-0"));

    let full = cache.get_values(&key, Some(&date), 500, true).await.unwrap();
    assert_eq!(full.returned_count, 120);
    assert!(!full.is_truncated);

    let stats = cache.stats().await;
    assert!(stats.metadata_cached);
    assert_eq!(stats.value_entries, 1);
}

struct OneShotModel;

#[async_trait]
impl ModelClient for OneShotModel {
    async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        Ok(ModelResponse {
            content: vec![ContentBlock {
                kind: "text".to_string(),
                text: Some("Your EC2 spend rose 8% this week.".to_string()),
                id: None,
                name: None,
                input: None,
            }],
            stop_reason: Some("end_turn".to_string()),
            usage: Some(Usage {
                input_tokens: 12,
                output_tokens: 9,
                ..Usage::default()
            }),
        })
    }
}

/// Test the streaming pipeline end to end over a real subprocess bridge
#[tokio::test]
async fn test_stream_pipeline_end_to_end() {
    let factory = McpBridgeFactory::new(echo_bridge_config());
    let bridge = factory.create("acct_alpha").await.unwrap();

    let outbox = ToolOutputStore::new();
    let pipeline = ChatPipeline::new(Arc::new(OneShotModel), Arc::clone(&outbox));
    let mut stream = pipeline.spawn(
        bridge.clone(),
        ChatTurn::new("how is spend?", "claude-sonnet-4-5-20250929"),
    );

    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }

    let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    match terminals[0] {
        StreamEvent::Final {
            response,
            request_id,
            usage,
            ..
        } => {
            assert!(response.contains("EC2 spend"));
            assert!(request_id.is_none());
            assert_eq!(usage.total_tokens, 21);
        }
        other => panic!("expected final event, got {other:?}"),
    }

    bridge.stop().await;
}

/// Test session tokens survive a cookie round trip
#[test]
fn test_session_token_round_trip() {
    let token = generate_session_token();
    assert_eq!(validate_session_token(&token).unwrap(), token);
    assert!(validate_session_token("forged").is_err());
}

/// Test config loading from TOML
#[test]
fn test_config_from_file() {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let toml_content = r#"
service_name = "gateway-integration"

[bridge]
command = "cat"
account_env = "FINOPS_ACCOUNT_ID"

[sessions]
max_sessions = 5
idle_timeout_secs = 600

[llm]
base_url = "http://localhost:8080"
model = "claude-haiku-4-5-20251001"

[upstream]
internal_api_url = "http://internal-api.local"
    "#;

    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(toml_content.as_bytes()).unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.service_name, "gateway-integration");
    assert_eq!(config.bridge.command, "cat");
    assert_eq!(config.sessions.max_sessions, 5);
    assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(600));
    assert_eq!(config.llm.model, "claude-haiku-4-5-20251001");
    assert_eq!(config.stream.deadline(), Duration::from_secs(300));
}
