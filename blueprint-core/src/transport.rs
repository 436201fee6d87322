//! The wire collaborator.

use async_trait::async_trait;
use serde_json::Value;

use crate::{BlueprintResult, QueryRequest};

/// Executes one query and returns its data.
///
/// Implementations own the protocol. The cache only sees the JSON tree that
/// comes back; failures should be reported as
/// [`FetchError`](crate::FetchError)s.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &QueryRequest) -> BlueprintResult<Value>;
}
