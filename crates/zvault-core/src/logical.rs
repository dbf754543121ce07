//! Logical request records and the backend seam they are executed against.
//!
//! A [`Request`] is what a client asked for; the same record travels
//! verbatim from a standby to the active node when forwarded, so every type
//! here is serde-serializable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::barrier::Barrier;
use crate::error::LogicalError;

/// Operation requested on a logical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    List,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
        };
        f.write_str(s)
    }
}

/// A client request against a logical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub operation: Operation,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, Value>>,
}

impl Request {
    /// Create a request with no token and no payload.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            client_token: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.data = Some(data);
        self
    }
}

/// The result of executing a [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, Value>>,
}

/// Executes logical requests against the barrier on the active node.
#[async_trait]
pub trait LogicalHandler: Send + Sync + 'static {
    /// Execute one request.
    ///
    /// # Errors
    ///
    /// Implementations return [`LogicalError`] for anything the client
    /// should see; the error crosses the forwarding transport unchanged.
    async fn handle(&self, barrier: &Barrier, request: &Request) -> Result<Response, LogicalError>;
}

/// Generic JSON key-value backend rooted at a storage prefix.
///
/// Writes store the request's data map verbatim; reads return it; `list`
/// returns the immediate children under a path as `{"keys": [...]}`.
#[derive(Debug, Clone)]
pub struct PassthroughBackend {
    prefix: String,
}

impl PassthroughBackend {
    /// Create a backend storing entries under `prefix` (e.g. `logical/`).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    fn storage_path(&self, path: &str) -> Result<String, LogicalError> {
        let path = path.trim_start_matches('/');
        if path.split('/').any(|segment| segment == "..") {
            return Err(LogicalError::InvalidRequest {
                reason: format!("path '{path}' must not contain '..'"),
            });
        }
        Ok(format!("{}{path}", self.prefix))
    }
}

impl Default for PassthroughBackend {
    fn default() -> Self {
        Self::new("logical/")
    }
}

#[async_trait]
impl LogicalHandler for PassthroughBackend {
    async fn handle(&self, barrier: &Barrier, request: &Request) -> Result<Response, LogicalError> {
        let key = self.storage_path(&request.path)?;

        match request.operation {
            Operation::Read => {
                let Some(bytes) = barrier.get(&key).await? else {
                    return Ok(Response::default());
                };
                let data = serde_json::from_slice(&bytes).map_err(|e| LogicalError::Backend {
                    reason: format!("stored entry at '{}' is not JSON: {e}", request.path),
                })?;
                Ok(Response { data: Some(data) })
            }
            Operation::Create | Operation::Update => {
                let data = request
                    .data
                    .as_ref()
                    .ok_or_else(|| LogicalError::InvalidRequest {
                        reason: "write requires a data payload".to_owned(),
                    })?;
                let bytes = serde_json::to_vec(data).map_err(|e| LogicalError::InvalidRequest {
                    reason: e.to_string(),
                })?;
                barrier.put(&key, &bytes).await?;
                Ok(Response::default())
            }
            Operation::Delete => {
                barrier.delete(&key).await?;
                Ok(Response::default())
            }
            Operation::List => {
                let mut dir = key;
                if !dir.ends_with('/') {
                    dir.push('/');
                }
                let mut keys: Vec<String> = barrier
                    .list(&dir)
                    .await?
                    .iter()
                    .filter_map(|full| full.strip_prefix(dir.as_str()))
                    .map(|rest| match rest.split_once('/') {
                        Some((child, _)) => format!("{child}/"),
                        None => rest.to_owned(),
                    })
                    .collect();
                keys.dedup();

                let mut data = BTreeMap::new();
                data.insert("keys".to_owned(), Value::from(keys));
                Ok(Response { data: Some(data) })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use zvault_storage::MemoryBackend;

    use super::*;
    use crate::crypto::EncryptionKey;

    async fn unsealed_barrier() -> Barrier {
        let barrier = Barrier::new(Arc::new(MemoryBackend::new()));
        let master = EncryptionKey::generate();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        barrier
    }

    fn payload(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn write_then_read() {
        let barrier = unsealed_barrier().await;
        let backend = PassthroughBackend::default();

        let write = Request::new(Operation::Update, "secret/app")
            .with_data(payload(json!({"password": "hunter2", "ttl": 30})));
        backend.handle(&barrier, &write).await.unwrap();

        let read = Request::new(Operation::Read, "secret/app");
        let resp = backend.handle(&barrier, &read).await.unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["password"], "hunter2");
        assert_eq!(data["ttl"], 30);
    }

    #[tokio::test]
    async fn read_missing_returns_empty_response() {
        let barrier = unsealed_barrier().await;
        let resp = PassthroughBackend::default()
            .handle(&barrier, &Request::new(Operation::Read, "nope"))
            .await
            .unwrap();
        assert_eq!(resp, Response::default());
    }

    #[tokio::test]
    async fn write_without_data_is_invalid() {
        let barrier = unsealed_barrier().await;
        let err = PassthroughBackend::default()
            .handle(&barrier, &Request::new(Operation::Create, "secret/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LogicalError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn list_returns_immediate_children() {
        let barrier = unsealed_barrier().await;
        let backend = PassthroughBackend::default();
        for path in ["secret/a", "secret/b", "secret/nested/c", "secret/nested/d"] {
            let req = Request::new(Operation::Update, path).with_data(payload(json!({"v": 1})));
            backend.handle(&barrier, &req).await.unwrap();
        }

        let resp = backend
            .handle(&barrier, &Request::new(Operation::List, "secret"))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["keys"], json!(["a", "b", "nested/"]));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let barrier = unsealed_barrier().await;
        let backend = PassthroughBackend::default();
        let write = Request::new(Operation::Update, "k").with_data(payload(json!({"v": true})));
        backend.handle(&barrier, &write).await.unwrap();
        backend
            .handle(&barrier, &Request::new(Operation::Delete, "k"))
            .await
            .unwrap();
        let resp = backend
            .handle(&barrier, &Request::new(Operation::Read, "k"))
            .await
            .unwrap();
        assert!(resp.data.is_none());
    }

    #[tokio::test]
    async fn dot_dot_segments_are_rejected() {
        let barrier = unsealed_barrier().await;
        let err = PassthroughBackend::default()
            .handle(&barrier, &Request::new(Operation::Read, "../core/keyring"))
            .await
            .unwrap_err();
        assert!(matches!(err, LogicalError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn sealed_barrier_surfaces_as_sealed() {
        let barrier = unsealed_barrier().await;
        barrier.seal().await;
        let err = PassthroughBackend::default()
            .handle(&barrier, &Request::new(Operation::Read, "k"))
            .await
            .unwrap_err();
        assert_eq!(err, LogicalError::Sealed);
    }

    #[test]
    fn request_wire_shape() {
        let req = Request::new(Operation::Update, "secret/app").with_token("t");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"operation": "update", "path": "secret/app", "client_token": "t"}));
    }
}
