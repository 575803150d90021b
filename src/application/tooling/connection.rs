use super::error::ToolingError;
use super::process::StdioSession;
use crate::config::{ServerConfig, Timeouts};
use crate::types::{ParamType, ParameterSpec, ToolDescriptor};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

/// Returned instead of an empty string when a tool call yields zero text
/// content, so callers can tell "empty but successful" from "nothing".
pub const NO_CONTENT_SENTINEL: &str = "No response from tool";

/// One transport session per call: every `discover` and `invoke` spawns the
/// server process, runs the handshake, performs its single operation, and
/// tears the process down again.
#[async_trait]
pub trait ToolServerConnection: Send + Sync {
    async fn discover(&self) -> Result<Vec<ToolDescriptor>, ToolingError>;

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<String, ToolingError>;
}

pub struct StdioConnection {
    config: ServerConfig,
    timeouts: Timeouts,
}

impl StdioConnection {
    pub fn new(config: ServerConfig, timeouts: Timeouts) -> Self {
        Self { config, timeouts }
    }
}

#[async_trait]
impl ToolServerConnection for StdioConnection {
    async fn discover(&self) -> Result<Vec<ToolDescriptor>, ToolingError> {
        let mut session = StdioSession::connect(&self.config, self.timeouts.handshake).await?;
        let listing = session
            .request("tools/list", json!({}), self.timeouts.call)
            .await;
        session.shutdown().await;
        parse_tool_listing(&self.config.name, listing?)
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<String, ToolingError> {
        let mut session = StdioSession::connect(&self.config, self.timeouts.handshake).await?;
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        let result = session
            .request("tools/call", params, self.timeouts.call)
            .await;
        session.shutdown().await;
        shape_call_result(&self.config.name, tool, result?)
    }
}

pub(crate) fn parse_tool_listing(
    server: &str,
    result: Value,
) -> Result<Vec<ToolDescriptor>, ToolingError> {
    let Some(tools) = result.get("tools").and_then(Value::as_array) else {
        return Err(ToolingError::Protocol {
            server: server.to_string(),
            detail: "tool listing without a 'tools' array".to_string(),
        });
    };
    tools
        .iter()
        .map(|tool| parse_descriptor(server, tool))
        .collect()
}

fn parse_descriptor(server: &str, tool: &Value) -> Result<ToolDescriptor, ToolingError> {
    let name = tool
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolingError::Protocol {
            server: server.to_string(),
            detail: "tool entry without a name".to_string(),
        })?;

    let schema = tool.get("inputSchema").cloned().unwrap_or_else(|| json!({}));
    if !schema.is_object() {
        return Err(ToolingError::Protocol {
            server: server.to_string(),
            detail: format!("input schema for tool '{name}' that is not an object"),
        });
    }

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut parameters = Vec::new();
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (param_name, info) in properties {
            let is_required = required.contains(&param_name.as_str());
            let default = if is_required {
                if info.get("default").is_some() {
                    debug!(
                        server,
                        tool = name,
                        parameter = %param_name,
                        "discarding default declared on a required parameter"
                    );
                }
                None
            } else {
                info.get("default").cloned()
            };
            parameters.push(ParameterSpec {
                name: param_name.clone(),
                kind: ParamType::from_schema(
                    info.get("type").and_then(Value::as_str).unwrap_or("string"),
                ),
                description: info
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                required: is_required,
                default,
            });
        }
    }

    Ok(ToolDescriptor {
        name: name.to_string(),
        description: tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parameters,
    })
}

pub(crate) fn shape_call_result(
    server: &str,
    tool: &str,
    result: Value,
) -> Result<String, ToolingError> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| {
                    block
                        .get("type")
                        .and_then(Value::as_str)
                        .map(|kind| kind.eq_ignore_ascii_case("text"))
                        .unwrap_or(false)
                })
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|joined| !joined.trim().is_empty());

    if is_error {
        return Err(ToolingError::Failed {
            server: server.to_string(),
            tool: tool.to_string(),
            message: text.unwrap_or_else(|| "tool reported an unspecified error".to_string()),
        });
    }

    Ok(text.unwrap_or_else(|| NO_CONTENT_SENTINEL.to_string()))
}
