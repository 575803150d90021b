use crate::application::decider::{ArgumentSet, Decider, DeciderError};
use crate::types::{CatalogServer, Selection, ToolDescriptor};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("model provider returned invalid response: {0}")]
    InvalidResponse(String),
}

/// Single-turn completion against a chat model. The decider built on top only
/// ever needs one prompt in, one text out.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, ModelError>;
}

#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            http: client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{trimmed}/{path}")
    }
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaResponseMessage>,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[async_trait]
impl ModelProvider for OllamaClient {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, ModelError> {
        let url = self.endpoint("/api/chat");
        info!(model, url = %url, "Sending request to model provider");
        let response: OllamaChatResponse = self
            .http
            .post(url)
            .json(&OllamaChatRequest {
                model,
                messages: vec![OllamaMessage {
                    role: "user",
                    content: prompt,
                }],
                stream: false,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Received response from model provider");

        let message = response
            .message
            .ok_or_else(|| ModelError::InvalidResponse("missing message field".into()))?;
        Ok(message.content)
    }
}

/// Model-backed `Decider`: prompts a chat model for the tool selection and
/// the argument set, expecting a single JSON object back. Anything else is a
/// `Malformed` error; the dispatch engine recovers through its fallbacks.
pub struct ModelDecider<P: ModelProvider> {
    provider: P,
    model: String,
}

impl<P: ModelProvider> ModelDecider<P> {
    pub fn new(provider: P, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct RawSelection {
    server: String,
    tool: String,
    reasoning: Option<String>,
}

#[async_trait]
impl<P: ModelProvider> Decider for ModelDecider<P> {
    async fn select_tool(
        &self,
        catalog: &[CatalogServer],
        request: &str,
    ) -> Result<Selection, DeciderError> {
        let prompt = selection_prompt(catalog, request);
        let content = self.provider.complete(&self.model, &prompt).await?;
        let value = extract_json(&content)
            .ok_or_else(|| DeciderError::Malformed("no JSON object in selection output".into()))?;
        let raw: RawSelection = serde_json::from_value(value)
            .map_err(|err| DeciderError::Malformed(format!("selection shape: {err}")))?;
        Ok(Selection {
            server: raw.server,
            tool: raw.tool,
            reasoning: raw
                .reasoning
                .unwrap_or_else(|| "model provided no reasoning".to_string()),
        })
    }

    async fn extract_arguments(
        &self,
        tool: &ToolDescriptor,
        request: &str,
    ) -> Result<ArgumentSet, DeciderError> {
        if tool.parameters.is_empty() {
            return Ok(ArgumentSet::new());
        }
        let prompt = extraction_prompt(tool, request);
        let content = self.provider.complete(&self.model, &prompt).await?;
        let value = extract_json(&content)
            .ok_or_else(|| DeciderError::Malformed("no JSON object in extraction output".into()))?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(DeciderError::Malformed(format!(
                "expected a JSON object of arguments, got {other}"
            ))),
        }
    }
}

fn selection_prompt(catalog: &[CatalogServer], request: &str) -> String {
    let mut blocks = Vec::new();
    for server in catalog {
        for tool in &server.tools {
            let mut block = String::new();
            let _ = writeln!(block, "Tool: {}", tool.name);
            let _ = writeln!(block, "Server: {}", server.server);
            let _ = writeln!(block, "Description: {}", tool.description);
            let _ = writeln!(block, "Parameters:");
            if tool.parameters.is_empty() {
                let _ = write!(block, "  - No parameters");
            } else {
                for spec in &tool.parameters {
                    let _ = writeln!(
                        block,
                        "  - {} ({}): {}",
                        spec.name,
                        spec.kind.as_str(),
                        spec.description
                    );
                }
            }
            blocks.push(block.trim_end().to_string());
        }
    }
    let tools_list = blocks.join("\n\n");

    format!(
        "You are an intelligent tool selection assistant. Given a user query and a list of \
         available tools, select the BEST tool to answer the query.\n\n\
         AVAILABLE TOOLS:\n{tools_list}\n\n\
         USER QUERY: {request}\n\n\
         Analyze the query and select the most appropriate tool. Respond ONLY with valid JSON \
         in this EXACT format:\n\
         {{\n  \"server\": \"server-name\",\n  \"tool\": \"tool-name\",\n  \
         \"reasoning\": \"brief explanation of why this tool was selected\"\n}}\n\n\
         Important:\n\
         - Choose the tool whose description best matches the user's intent\n\
         - Use EXACT tool and server names from the list above\n\
         - If no tool is perfect, choose the closest match\n\
         - Be concise in reasoning (1 sentence max)"
    )
}

fn extraction_prompt(tool: &ToolDescriptor, request: &str) -> String {
    let mut schema = String::new();
    for spec in &tool.parameters {
        let default = spec
            .default
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(
            schema,
            "  - {} ({}): {} [default: {}]",
            spec.name,
            spec.kind.as_str(),
            spec.description,
            default
        );
    }

    format!(
        "You are an argument extraction assistant. Extract the required arguments from the \
         user's message.\n\n\
         TOOL: {name}\n\
         PARAMETERS NEEDED:\n{schema}\n\
         USER MESSAGE: {request}\n\n\
         Extract the arguments from the user's message. Respond ONLY with valid JSON mapping \
         parameter names to their values.\n\n\
         Examples:\n\
         - If user says \"weather in Paris\" and tool needs \"city\", respond: {{\"city\": \"Paris\"}}\n\
         - If user says \"show me 5 posts\" and tool needs \"limit\", respond: {{\"limit\": 5}}\n\
         - If user says \"tell me about pesticides\" and tool needs \"query\", respond: {{\"query\": \"pesticides\"}}\n\n\
         Important:\n\
         - Use EXACT parameter names from the schema\n\
         - Match the expected type (string, integer, etc.)\n\
         - If a parameter isn't mentioned, use its default value or omit it\n\
         - Respond with ONLY the JSON object, nothing else\n\n\
         JSON:",
        name = tool.name
    )
}

/// Pulls one JSON value out of model output that may wrap it in prose or a
/// markdown fence. Tries a direct parse, then the fenced block, then the
/// outermost brace span.
fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}
