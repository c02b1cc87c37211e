pub mod accounts;
pub mod bridge;
pub mod cache;
pub mod chat;
pub mod config;
pub mod llm;
pub mod metrics;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod security;
pub mod stream;
