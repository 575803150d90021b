use crate::application::tooling::{StdioConnection, ToolServerConnection, ToolingError};
use crate::config::{ServerConfig, Timeouts};
use crate::types::{CatalogServer, ToolDescriptor};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use utoipa::ToSchema;

/// One configured tool server. Created once at registry construction and
/// shared by reference for the process lifetime; the transport configuration
/// behind it never changes.
pub struct ServerHandle {
    name: String,
    connection: Arc<dyn ToolServerConnection>,
}

impl ServerHandle {
    pub fn new(name: impl Into<String>, connection: Arc<dyn ToolServerConnection>) -> Self {
        Self {
            name: name.into(),
            connection,
        }
    }

    pub fn stdio(config: ServerConfig, timeouts: Timeouts) -> Self {
        let name = config.name.clone();
        Self::new(name, Arc::new(StdioConnection::new(config, timeouts)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<dyn ToolServerConnection> {
        &self.connection
    }
}

#[derive(Clone)]
pub struct RegistryEntry {
    pub descriptor: ToolDescriptor,
    pub server: Arc<ServerHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DiscoveryFailure {
    pub server: String,
    pub error: String,
}

/// Immutable aggregation of one full discovery pass. Replaced wholesale on
/// rebuild; readers hold an `Arc` and are never shown a partial catalog.
pub struct CatalogSnapshot {
    entries: HashMap<String, RegistryEntry>,
    servers: Vec<CatalogServer>,
    failures: Vec<DiscoveryFailure>,
    rebuilt_at: Option<DateTime<Utc>>,
}

impl CatalogSnapshot {
    fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            servers: Vec::new(),
            failures: Vec::new(),
            rebuilt_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tool_count(&self) -> usize {
        self.entries.len()
    }

    pub fn resolve(&self, tool: &str) -> Option<&RegistryEntry> {
        self.entries.get(tool)
    }

    /// Read-only grouped view, server order then schema order. This is the
    /// catalog presented to deciders and to the introspection endpoint.
    pub fn servers(&self) -> &[CatalogServer] {
        &self.servers
    }

    pub fn failures(&self) -> &[DiscoveryFailure] {
        &self.failures
    }

    pub fn rebuilt_at(&self) -> Option<DateTime<Utc>> {
        self.rebuilt_at
    }
}

pub struct ToolRegistry {
    handles: Vec<Arc<ServerHandle>>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    rebuild_gate: AsyncMutex<()>,
}

impl ToolRegistry {
    pub fn new(handles: Vec<ServerHandle>) -> Self {
        Self {
            handles: handles.into_iter().map(Arc::new).collect(),
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            rebuild_gate: AsyncMutex::new(()),
        }
    }

    pub fn from_config(servers: Vec<ServerConfig>, timeouts: Timeouts) -> Self {
        Self::new(
            servers
                .into_iter()
                .map(|config| ServerHandle::stdio(config, timeouts))
                .collect(),
        )
    }

    pub fn server_count(&self) -> usize {
        self.handles.len()
    }

    /// Current catalog. Cheap; readers see either the previous snapshot or a
    /// fully rebuilt one, never anything in between.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().expect("catalog lock").clone()
    }

    /// Full discovery pass over every configured server. One server failing
    /// contributes zero tools and a failure record; it never aborts the
    /// others. Concurrent rebuild triggers are serialized; the snapshot swap
    /// at the end is atomic.
    pub async fn rebuild(&self) -> (usize, Vec<DiscoveryFailure>) {
        let _writer = self.rebuild_gate.lock().await;

        let discoveries: Vec<(Arc<ServerHandle>, Result<Vec<ToolDescriptor>, ToolingError>)> =
            join_all(self.handles.iter().map(|handle| {
                let handle = handle.clone();
                async move {
                    let outcome = handle.connection().discover().await;
                    (handle, outcome)
                }
            }))
            .await;

        let mut entries = HashMap::new();
        let mut servers = Vec::new();
        let mut failures = Vec::new();

        // Fold in handle order so name collisions stay last-write-wins
        // deterministically, regardless of discovery completion order.
        for (handle, outcome) in discoveries {
            match outcome {
                Ok(tools) => {
                    info!(server = handle.name(), tools = tools.len(), "Discovered tools");
                    let mut listed = Vec::new();
                    for descriptor in tools {
                        if entries.contains_key(&descriptor.name) {
                            warn!(
                                tool = %descriptor.name,
                                server = handle.name(),
                                "Tool name collision; keeping the later registration"
                            );
                        }
                        listed.push(descriptor.clone());
                        entries.insert(
                            descriptor.name.clone(),
                            RegistryEntry {
                                descriptor,
                                server: handle.clone(),
                            },
                        );
                    }
                    servers.push(CatalogServer {
                        server: handle.name().to_string(),
                        tools: listed,
                    });
                }
                Err(err) => {
                    warn!(
                        server = handle.name(),
                        %err,
                        "Tool discovery failed; server contributes no tools"
                    );
                    failures.push(DiscoveryFailure {
                        server: handle.name().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let count = entries.len();
        let next = Arc::new(CatalogSnapshot {
            entries,
            servers,
            failures: failures.clone(),
            rebuilt_at: Some(Utc::now()),
        });
        *self.snapshot.write().expect("catalog lock") = next;

        info!(tools = count, failures = failures.len(), "Catalog rebuilt");
        (count, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParamType, ParameterSpec};
    use async_trait::async_trait;
    use serde_json::Value;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: vec![ParameterSpec {
                name: "query".to_string(),
                kind: ParamType::String,
                description: String::new(),
                required: false,
                default: None,
            }],
        }
    }

    struct StaticConnection {
        tools: Vec<ToolDescriptor>,
        fail_discovery: bool,
    }

    impl StaticConnection {
        fn healthy(tools: Vec<ToolDescriptor>) -> Arc<Self> {
            Arc::new(Self {
                tools,
                fail_discovery: false,
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                tools: Vec::new(),
                fail_discovery: true,
            })
        }
    }

    #[async_trait]
    impl ToolServerConnection for StaticConnection {
        async fn discover(&self) -> Result<Vec<ToolDescriptor>, ToolingError> {
            if self.fail_discovery {
                return Err(ToolingError::Terminated {
                    server: "broken".to_string(),
                });
            }
            Ok(self.tools.clone())
        }

        async fn invoke(&self, _tool: &str, _arguments: Value) -> Result<String, ToolingError> {
            Ok("ok".to_string())
        }
    }

    #[tokio::test]
    async fn rebuild_survives_single_server_failure() {
        let registry = ToolRegistry::new(vec![
            ServerHandle::new("alpha", StaticConnection::healthy(vec![descriptor("a1")])),
            ServerHandle::new("broken", StaticConnection::broken()),
            ServerHandle::new(
                "gamma",
                StaticConnection::healthy(vec![descriptor("g1"), descriptor("g2")]),
            ),
        ]);

        let (count, failures) = registry.rebuild().await;
        assert_eq!(count, 3);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].server, "broken");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.tool_count(), 3);
        assert!(snapshot.resolve("a1").is_some());
        assert!(snapshot.resolve("g2").is_some());
        assert_eq!(snapshot.servers().len(), 2);
    }

    #[tokio::test]
    async fn collisions_resolve_to_last_registered_server() {
        let registry = ToolRegistry::new(vec![
            ServerHandle::new("first", StaticConnection::healthy(vec![descriptor("shared")])),
            ServerHandle::new("second", StaticConnection::healthy(vec![descriptor("shared")])),
        ]);

        registry.rebuild().await;

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.tool_count(), 1);
        let entry = snapshot.resolve("shared").expect("entry exists");
        assert_eq!(entry.server.name(), "second");
    }

    #[tokio::test]
    async fn snapshot_survives_until_swapped() {
        let registry = Arc::new(ToolRegistry::new(vec![ServerHandle::new(
            "alpha",
            StaticConnection::healthy(vec![descriptor("a1")]),
        )]));

        assert!(registry.snapshot().is_empty());
        assert!(registry.snapshot().rebuilt_at().is_none());

        registry.rebuild().await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.tool_count(), 1);
        assert!(snapshot.rebuilt_at().is_some());
    }

    #[tokio::test]
    async fn concurrent_rebuilds_never_publish_partial_catalogs() {
        let registry = Arc::new(ToolRegistry::new(vec![
            ServerHandle::new("alpha", StaticConnection::healthy(vec![descriptor("a1")])),
            ServerHandle::new(
                "beta",
                StaticConnection::healthy(vec![descriptor("b1"), descriptor("b2")]),
            ),
        ]));

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.rebuild().await }
        });
        let second = tokio::spawn({
            let registry = registry.clone();
            async move { registry.rebuild().await }
        });

        let (count_a, _) = first.await.expect("task joins");
        let (count_b, _) = second.await.expect("task joins");
        assert_eq!(count_a, 3);
        assert_eq!(count_b, 3);

        // Whatever interleaving occurred, the published snapshot is complete.
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.tool_count(), 3);
        for name in ["a1", "b1", "b2"] {
            assert!(snapshot.resolve(name).is_some(), "missing {name}");
        }
    }
}
