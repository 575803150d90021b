use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// JSON schema scalar/container types a tool parameter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// Unknown schema types decode as `String`; a foreign type annotation is
    /// never a reason to drop the tool.
    pub fn from_schema(value: &str) -> Self {
        match value {
            "integer" => ParamType::Integer,
            "number" => ParamType::Number,
            "boolean" => ParamType::Boolean,
            "array" => ParamType::Array,
            "object" => ParamType::Object,
            _ => ParamType::String,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub description: String,
    pub required: bool,
    /// Never present on a required parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub default: Option<Value>,
}

/// One discovered tool. Parameter order follows the server's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDescriptor {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|spec| spec.name == name)
    }
}

/// Catalog view entry: one server and the tools it contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CatalogServer {
    pub server: String,
    pub tools: Vec<ToolDescriptor>,
}

/// A decider's answer to "which tool handles this request".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Selection {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    RegistryEmpty,
    Invocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    pub kind: DispatchErrorKind,
    pub message: String,
}

/// The engine's only output shape. Errors are encoded, never raised.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DispatchResult {
    pub response: String,
    pub server_used: Option<String>,
    pub tool_used: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub arguments_used: Option<Value>,
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl DispatchResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
