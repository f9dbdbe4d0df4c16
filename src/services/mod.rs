/// Exponential backoff shared by writers.
pub mod backoff;
/// Per-session change subscriptions.
pub mod change_notifier;
/// OpenAPI documentation generation.
pub mod documentation;
/// Caller-facing synchronization engine.
pub mod engine;
/// Health check service.
pub mod health_service;
/// End-of-game reconciliation.
pub mod reconciliation;
/// Durable ledger of failed writes.
pub mod retry_store;
/// Server-Sent Events forwarding for room subscriptions.
pub mod sse_service;
/// Store health polling and reconnection.
pub mod storage_supervisor;
/// Facade over the fast and authoritative stores.
pub mod sync_facade;
/// Batched score writes.
pub mod update_queue;
