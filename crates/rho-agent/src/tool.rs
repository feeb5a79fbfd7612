//! Tool trait, requests/responses and the registry that executes them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Identifier responses are matched back on
    pub id: String,
    /// Tool name
    pub name: String,
    /// Serialized JSON arguments
    pub arguments: String,
    /// False while the call is still streaming
    pub is_complete: bool,
}

impl ToolRequest {
    /// Create a complete request with a fresh id
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments: arguments.into(),
            is_complete: true,
        }
    }

    /// Replace the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Mark the request as still streaming
    pub fn incomplete(mut self) -> Self {
        self.is_complete = false;
        self
    }

    /// Parse the arguments; an empty payload is treated as `{}`
    pub fn parsed_arguments(&self) -> serde_json::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Result of running one [`ToolRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Id of the originating request
    pub request_id: String,
    pub tool_name: String,
    /// Result payload
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    /// A successful response to `request`
    pub fn success(request: &ToolRequest, result: impl Into<String>) -> Self {
        Self {
            request_id: request.id.clone(),
            tool_name: request.name.clone(),
            result: result.into(),
            error: None,
        }
    }

    /// A failed response to `request`; the error doubles as the payload
    pub fn failure(request: &ToolRequest, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            request_id: request.id.clone(),
            tool_name: request.name.clone(),
            result: serde_json::json!({ "error": error }).to_string(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content to return to the model
    pub content: String,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Tool description handed to the context builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in tool calls)
    fn name(&self) -> &str;

    /// Human-readable label for UI
    fn label(&self) -> &str {
        self.name()
    }

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// Convert a Tool to its definition
pub fn to_definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}

/// Runs tool requests on behalf of the loop
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools the model may call
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Whether several requests may run at once
    fn supports_concurrency(&self) -> bool {
        false
    }

    /// Run one request. Failures are reported in the response, never raised.
    async fn execute(&self, request: &ToolRequest, cancel: CancellationToken) -> ToolResponse;
}

/// The standard [`ToolExecutor`]: a named set of tools with schema validation
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
    concurrent: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: BoxedTool) {
        self.tools.retain(|t| t.name() != tool.name());
        self.cache_tool_schema(&tool);
        self.tools.push(tool);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_tool(mut self, tool: BoxedTool) -> Self {
        self.register(tool);
        self
    }

    /// Allow requests to run concurrently
    pub fn with_concurrency(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// A registry holding only the allow-listed tools
    pub fn restricted(&self, allow_list: &[String]) -> Self {
        let allowed = |name: &str| allow_list.iter().any(|a| a == name);
        Self {
            tools: self
                .tools
                .iter()
                .filter(|t| allowed(t.name()))
                .cloned()
                .collect(),
            schema_cache: self
                .schema_cache
                .iter()
                .filter(|(name, _)| allowed(name))
                .map(|(name, v)| (name.clone(), Arc::clone(v)))
                .collect(),
            concurrent: self.concurrent,
        }
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Compile and cache the JSON schema validator for a tool.
    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| to_definition(t.as_ref())).collect()
    }

    fn supports_concurrency(&self) -> bool {
        self.concurrent
    }

    async fn execute(&self, request: &ToolRequest, cancel: CancellationToken) -> ToolResponse {
        let Some(tool) = self.get(&request.name) else {
            return ToolResponse::failure(request, format!("Tool not found: {}", request.name));
        };

        let args = match request.parsed_arguments() {
            Ok(args) => args,
            Err(e) => {
                return ToolResponse::failure(request, format!("Invalid tool arguments: {}", e));
            }
        };

        if let Some(err) = self
            .schema_cache
            .get(&request.name)
            .and_then(|validator| validate_with_validator(&args, validator))
        {
            return ToolResponse::failure(request, err);
        }

        let result = tool.execute(&request.id, args, cancel).await;
        if result.is_error {
            ToolResponse::failure(request, result.content)
        } else {
            ToolResponse::success(request, result.content)
        }
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool that echoes its arguments.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            _tool_call_id: &str,
            arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolResult {
            match arguments.get("text").and_then(|v| v.as_str()) {
                Some("fail") => ToolResult::error("asked to fail"),
                Some(text) => ToolResult::text(text),
                None => ToolResult::error("missing text"),
            }
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new().with_tool(Arc::new(EchoTool))
    }

    #[tokio::test]
    async fn test_execute_matches_request_id() {
        let request = ToolRequest::new("echo", r#"{"text":"hi"}"#).with_id("call_7");
        let response = registry().execute(&request, CancellationToken::new()).await;
        assert_eq!(response.request_id, "call_7");
        assert_eq!(response.tool_name, "echo");
        assert_eq!(response.result, "hi");
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_response() {
        let request = ToolRequest::new("rm_rf", "{}");
        let response = registry().execute(&request, CancellationToken::new()).await;
        assert_eq!(response.error.as_deref(), Some("Tool not found: rm_rf"));
        assert_eq!(response.request_id, request.id);
    }

    #[tokio::test]
    async fn test_invalid_json_is_error_response() {
        let request = ToolRequest::new("echo", "{not json");
        let response = registry().execute(&request, CancellationToken::new()).await;
        assert!(response.error.unwrap().starts_with("Invalid tool arguments"));
    }

    #[tokio::test]
    async fn test_schema_violation_is_error_response() {
        let request = ToolRequest::new("echo", r#"{"text": 5}"#);
        let response = registry().execute(&request, CancellationToken::new()).await;
        let err = response.error.unwrap();
        assert!(err.contains("validation failed"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_tool_error_fills_payload() {
        let request = ToolRequest::new("echo", r#"{"text":"fail"}"#);
        let response = registry().execute(&request, CancellationToken::new()).await;
        assert_eq!(response.error.as_deref(), Some("asked to fail"));
        assert!(response.result.contains("asked to fail"));
    }

    #[test]
    fn test_restricted_drops_unlisted_tools() {
        let restricted = registry().restricted(&["other".to_string()]);
        assert!(restricted.is_empty());
        let kept = registry().restricted(&["echo".to_string()]);
        assert_eq!(kept.names(), vec!["echo"]);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut reg = registry();
        reg.register(Arc::new(EchoTool));
        assert_eq!(reg.names().len(), 1);
    }

    #[test]
    fn test_empty_arguments_parse_as_object() {
        let r = ToolRequest::new("x", "  ");
        assert!(r.parsed_arguments().unwrap().is_object());
    }

    #[test]
    fn test_definitions() {
        let defs = registry().definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].description, "Echoes input");
    }
}
