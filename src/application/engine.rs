use crate::application::decider::{
    self, ArgumentSet, Decider, heuristic_arguments, validate_arguments,
};
use crate::application::registry::{CatalogSnapshot, RegistryEntry, ToolRegistry};
use crate::application::tooling::ToolingError;
use crate::types::{DispatchErrorKind, DispatchResult, ErrorDetail, Selection, ToolDescriptor};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const APOLOGY: &str = "Sorry, I encountered an error processing your request.";
const NO_TOOLS_MESSAGE: &str =
    "No tools are currently available. Try again after the catalog has been refreshed.";

/// Orchestrates one request end to end: catalog snapshot, tool selection,
/// argument extraction, invocation, result shaping. Every path terminates in
/// a `DispatchResult`; nothing escapes this boundary.
pub struct DispatchEngine<D: Decider> {
    registry: Arc<ToolRegistry>,
    decider: D,
    decider_timeout: Duration,
}

impl<D: Decider> DispatchEngine<D> {
    pub fn new(registry: Arc<ToolRegistry>, decider: D, decider_timeout: Duration) -> Self {
        Self {
            registry,
            decider,
            decider_timeout,
        }
    }

    /// Single-shot dispatch: exactly one tool invocation per request.
    pub async fn dispatch(&self, request: &str) -> DispatchResult {
        let dispatch_id = Uuid::new_v4();
        info!(%dispatch_id, "Dispatch started");

        let snapshot = self.registry.snapshot();
        let Some((selection, entry)) = self.select(&snapshot, request).await else {
            warn!(%dispatch_id, "Dispatch rejected: catalog is empty");
            return DispatchResult {
                response: NO_TOOLS_MESSAGE.to_string(),
                server_used: None,
                tool_used: None,
                arguments_used: None,
                reasoning: None,
                error: Some(ErrorDetail {
                    kind: DispatchErrorKind::RegistryEmpty,
                    message: "no tools discovered on any configured server".to_string(),
                }),
            };
        };

        debug!(
            %dispatch_id,
            server = %selection.server,
            tool = %selection.tool,
            "Tool selected"
        );

        let arguments = self.extract(&entry.descriptor, request).await;
        let outcome = self.invoke(&entry, &arguments).await;

        let server_used = Some(entry.server.name().to_string());
        let tool_used = Some(entry.descriptor.name.clone());
        let arguments_used = Some(Value::Object(arguments));
        let reasoning = Some(selection.reasoning);

        match outcome {
            Ok(text) => {
                info!(%dispatch_id, tool = %entry.descriptor.name, "Dispatch completed");
                DispatchResult {
                    response: text,
                    server_used,
                    tool_used,
                    arguments_used,
                    reasoning,
                    error: None,
                }
            }
            Err(err) => {
                warn!(%dispatch_id, tool = %entry.descriptor.name, %err, "Dispatch errored");
                DispatchResult {
                    response: APOLOGY.to_string(),
                    server_used,
                    tool_used,
                    arguments_used,
                    reasoning,
                    error: Some(ErrorDetail {
                        kind: DispatchErrorKind::Invocation,
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    /// Validated selection, or the deterministic first-entry fallback on any
    /// decider contract violation. `None` only when the catalog is empty.
    async fn select(
        &self,
        snapshot: &CatalogSnapshot,
        request: &str,
    ) -> Option<(Selection, RegistryEntry)> {
        if snapshot.is_empty() {
            return None;
        }
        let catalog = snapshot.servers();

        let decided = match timeout(
            self.decider_timeout,
            self.decider.select_tool(catalog, request),
        )
        .await
        {
            Ok(Ok(selection)) => Some(selection),
            Ok(Err(err)) => {
                warn!(%err, "Decider selection failed; using fallback");
                None
            }
            Err(_) => {
                warn!("Decider selection timed out; using fallback");
                None
            }
        };

        if let Some(selection) = decided {
            match snapshot.resolve(&selection.tool) {
                Some(entry) if entry.server.name() == selection.server => {
                    return Some((selection, entry.clone()));
                }
                Some(_) => warn!(
                    tool = %selection.tool,
                    server = %selection.server,
                    "Decider named a server that does not own the tool; using fallback"
                ),
                None => warn!(
                    tool = %selection.tool,
                    "Decider selected a tool absent from the catalog; using fallback"
                ),
            }
        }

        let fallback = decider::fallback_selection(catalog)?;
        let entry = snapshot.resolve(&fallback.tool)?.clone();
        Some((fallback, entry))
    }

    /// Validated arguments. A decider failure falls back to the heuristic
    /// extractor wholesale; a decider answer missing required keys keeps its
    /// valid values and fills only the gaps heuristically. Missing required
    /// parameters never block the invocation.
    async fn extract(&self, tool: &ToolDescriptor, request: &str) -> ArgumentSet {
        let decided = match timeout(
            self.decider_timeout,
            self.decider.extract_arguments(tool, request),
        )
        .await
        {
            Ok(Ok(raw)) => Some(raw),
            Ok(Err(err)) => {
                warn!(%err, tool = %tool.name, "Decider extraction failed; using heuristic extractor");
                None
            }
            Err(_) => {
                warn!(tool = %tool.name, "Decider extraction timed out; using heuristic extractor");
                None
            }
        };

        match decided {
            Some(raw) => {
                let (mut cleaned, missing) = validate_arguments(tool, raw);
                if !missing.is_empty() {
                    debug!(
                        tool = %tool.name,
                        ?missing,
                        "Decider output missing required parameters; filling from heuristics"
                    );
                    let heuristic = heuristic_arguments(tool, request);
                    for name in missing {
                        if let Some(value) = heuristic.get(&name) {
                            cleaned.insert(name, value.clone());
                        }
                    }
                }
                cleaned
            }
            None => {
                let (cleaned, missing) =
                    validate_arguments(tool, heuristic_arguments(tool, request));
                if !missing.is_empty() {
                    debug!(
                        tool = %tool.name,
                        ?missing,
                        "Proceeding without required parameters; the tool owns that validation"
                    );
                }
                cleaned
            }
        }
    }

    /// One retry on connection-class failures, no backoff. Invocation and
    /// protocol failures surface immediately.
    async fn invoke(
        &self,
        entry: &RegistryEntry,
        arguments: &ArgumentSet,
    ) -> Result<String, ToolingError> {
        let payload = Value::Object(arguments.clone());
        let connection = entry.server.connection();
        match connection.invoke(&entry.descriptor.name, payload.clone()).await {
            Err(err) if err.is_connection() => {
                warn!(
                    server = entry.server.name(),
                    tool = %entry.descriptor.name,
                    %err,
                    "Connection to tool server failed; retrying once"
                );
                connection.invoke(&entry.descriptor.name, payload).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::decider::{DeciderError, FALLBACK_REASONING};
    use crate::application::registry::ServerHandle;
    use crate::application::tooling::ToolServerConnection;
    use crate::types::{CatalogServer, ParamType, ParameterSpec};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn weather_descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "get_current_weather".to_string(),
            description: "Current weather for a city".to_string(),
            parameters: vec![ParameterSpec {
                name: "city".to_string(),
                kind: ParamType::String,
                description: "City name".to_string(),
                required: true,
                default: None,
            }],
        }
    }

    fn posts_descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "get_placeholder_posts".to_string(),
            description: "Fetch mock blog posts".to_string(),
            parameters: vec![ParameterSpec {
                name: "limit".to_string(),
                kind: ParamType::Integer,
                description: String::new(),
                required: false,
                default: Some(json!(5)),
            }],
        }
    }

    /// Serves a fixed tool listing and records every invocation.
    struct RecordingConnection {
        tools: Vec<ToolDescriptor>,
        reply: Result<String, fn(&str) -> ToolingError>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingConnection {
        fn new(tools: Vec<ToolDescriptor>) -> Arc<Self> {
            Arc::new(Self {
                tools,
                reply: Ok("sunny, 21C".to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(tools: Vec<ToolDescriptor>, reply: fn(&str) -> ToolingError) -> Arc<Self> {
            Arc::new(Self {
                tools,
                reply: Err(reply),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl ToolServerConnection for RecordingConnection {
        async fn discover(&self) -> Result<Vec<ToolDescriptor>, ToolingError> {
            Ok(self.tools.clone())
        }

        async fn invoke(&self, tool: &str, arguments: Value) -> Result<String, ToolingError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((tool.to_string(), arguments));
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(make) => Err(make(tool)),
            }
        }
    }

    /// Scripted decider behaviours for contract-violation paths.
    enum ScriptedDecider {
        Answer(Selection, ArgumentSet),
        SelectsUnknownTool,
        Unreachable,
    }

    #[async_trait]
    impl Decider for ScriptedDecider {
        async fn select_tool(
            &self,
            _catalog: &[CatalogServer],
            _request: &str,
        ) -> Result<Selection, DeciderError> {
            match self {
                ScriptedDecider::Answer(selection, _) => Ok(selection.clone()),
                ScriptedDecider::SelectsUnknownTool => Ok(Selection {
                    server: "agri".to_string(),
                    tool: "made_up_tool".to_string(),
                    reasoning: "confident hallucination".to_string(),
                }),
                ScriptedDecider::Unreachable => Err(DeciderError::Malformed(
                    "model endpoint unreachable".to_string(),
                )),
            }
        }

        async fn extract_arguments(
            &self,
            _tool: &ToolDescriptor,
            _request: &str,
        ) -> Result<ArgumentSet, DeciderError> {
            match self {
                ScriptedDecider::Answer(_, arguments) => Ok(arguments.clone()),
                _ => Err(DeciderError::Malformed("no structured output".to_string())),
            }
        }
    }

    async fn engine_with(
        connection: Arc<RecordingConnection>,
        decider: ScriptedDecider,
    ) -> DispatchEngine<ScriptedDecider> {
        let registry = Arc::new(ToolRegistry::new(vec![ServerHandle::new(
            "agri",
            connection,
        )]));
        registry.rebuild().await;
        DispatchEngine::new(registry, decider, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn happy_path_returns_tool_text() {
        let connection = RecordingConnection::new(vec![weather_descriptor()]);
        let mut arguments = ArgumentSet::new();
        arguments.insert("city".to_string(), json!("Tokyo"));
        let engine = engine_with(
            connection.clone(),
            ScriptedDecider::Answer(
                Selection {
                    server: "agri".to_string(),
                    tool: "get_current_weather".to_string(),
                    reasoning: "weather question".to_string(),
                },
                arguments,
            ),
        )
        .await;

        let result = engine.dispatch("What's the weather in Tokyo?").await;
        assert!(!result.is_error());
        assert_eq!(result.response, "sunny, 21C");
        assert_eq!(result.server_used.as_deref(), Some("agri"));
        assert_eq!(result.tool_used.as_deref(), Some("get_current_weather"));
        assert_eq!(
            result.arguments_used,
            Some(json!({ "city": "Tokyo" }))
        );

        let calls = connection.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, json!({ "city": "Tokyo" }));
    }

    #[tokio::test]
    async fn hallucinated_tool_falls_back_to_first_entry() {
        let connection =
            RecordingConnection::new(vec![weather_descriptor(), posts_descriptor()]);
        let engine = engine_with(connection.clone(), ScriptedDecider::SelectsUnknownTool).await;

        let result = engine.dispatch("What's the weather in Tokyo?").await;
        assert!(!result.is_error());
        assert_eq!(result.tool_used.as_deref(), Some("get_current_weather"));
        assert_eq!(result.reasoning.as_deref(), Some(FALLBACK_REASONING));
        // Heuristic extraction filled the city after the decider failed.
        assert_eq!(result.arguments_used, Some(json!({ "city": "Tokyo" })));
    }

    #[tokio::test]
    async fn unreachable_decider_still_dispatches() {
        let connection = RecordingConnection::new(vec![weather_descriptor()]);
        let engine = engine_with(connection.clone(), ScriptedDecider::Unreachable).await;

        let result = engine.dispatch("What's the weather in Tokyo?").await;
        assert!(!result.is_error());
        assert_eq!(result.tool_used.as_deref(), Some("get_current_weather"));
        assert_eq!(result.reasoning.as_deref(), Some(FALLBACK_REASONING));
        assert_eq!(result.arguments_used, Some(json!({ "city": "Tokyo" })));
        assert_eq!(result.response, "sunny, 21C");
    }

    #[tokio::test]
    async fn empty_catalog_errors_without_connection_attempts() {
        let connection = RecordingConnection::new(Vec::new());
        let engine = engine_with(connection.clone(), ScriptedDecider::Unreachable).await;

        let result = engine.dispatch("anything").await;
        assert!(result.is_error());
        let error = result.error.expect("error detail present");
        assert_eq!(error.kind, DispatchErrorKind::RegistryEmpty);
        assert!(result.server_used.is_none());
        assert!(connection.calls().is_empty(), "no invocation may happen");
    }

    #[tokio::test]
    async fn missing_required_argument_does_not_block_invocation() {
        let connection = RecordingConnection::new(vec![weather_descriptor()]);
        let engine = engine_with(connection.clone(), ScriptedDecider::Unreachable).await;

        // No preposition phrase, so the heuristic cannot find a city.
        let result = engine.dispatch("weather please").await;
        assert!(!result.is_error());
        assert_eq!(result.arguments_used, Some(json!({})));

        let calls = connection.calls();
        assert_eq!(calls.len(), 1, "invocation still attempted");
        assert_eq!(calls[0].1, json!({}));
    }

    #[tokio::test]
    async fn tool_failure_surfaces_in_error_detail() {
        let connection =
            RecordingConnection::failing(vec![weather_descriptor()], |tool| ToolingError::Failed {
                server: "agri".to_string(),
                tool: tool.to_string(),
                message: "city not found".to_string(),
            });
        let mut arguments = ArgumentSet::new();
        arguments.insert("city".to_string(), json!("Atlantis"));
        let engine = engine_with(
            connection.clone(),
            ScriptedDecider::Answer(
                Selection {
                    server: "agri".to_string(),
                    tool: "get_current_weather".to_string(),
                    reasoning: "weather question".to_string(),
                },
                arguments,
            ),
        )
        .await;

        let result = engine.dispatch("weather in Atlantis").await;
        assert!(result.is_error());
        assert_eq!(result.response, APOLOGY);
        let error = result.error.expect("error detail present");
        assert_eq!(error.kind, DispatchErrorKind::Invocation);
        assert!(error.message.contains("city not found"));
        assert_eq!(connection.calls().len(), 1, "invocation errors are not retried");
    }

    #[tokio::test]
    async fn connection_failure_is_retried_once() {
        let connection =
            RecordingConnection::failing(vec![weather_descriptor()], |_| ToolingError::Terminated {
                server: "agri".to_string(),
            });
        let engine = engine_with(connection.clone(), ScriptedDecider::Unreachable).await;

        let result = engine.dispatch("weather in Tokyo").await;
        assert!(result.is_error());
        assert_eq!(connection.calls().len(), 2, "one retry, no more");
    }
}
