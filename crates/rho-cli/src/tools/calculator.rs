//! Arithmetic on two operands

use async_trait::async_trait;
use rho_agent::tool::{Tool, ToolResult};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Tool for add/subtract/multiply/divide on two numbers
pub struct CalculatorTool;

impl CalculatorTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn label(&self) -> &str {
        "Calculator"
    }

    fn description(&self) -> &str {
        "Apply an arithmetic operation (add, subtract, multiply, divide) to two numbers."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["add", "subtract", "multiply", "divide"],
                    "description": "Operation to apply"
                },
                "first": {
                    "type": "number",
                    "description": "Left operand"
                },
                "second": {
                    "type": "number",
                    "description": "Right operand"
                }
            },
            "required": ["operation", "first", "second"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let Some(operation) = arguments.get("operation").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing 'operation' argument");
        };
        let Some(first) = arguments.get("first").and_then(|v| v.as_f64()) else {
            return ToolResult::error("Missing 'first' argument");
        };
        let Some(second) = arguments.get("second").and_then(|v| v.as_f64()) else {
            return ToolResult::error("Missing 'second' argument");
        };

        match evaluate(operation, first, second) {
            Ok(value) => ToolResult::text(format_number(value)),
            Err(e) => ToolResult::error(e),
        }
    }
}

fn evaluate(operation: &str, first: f64, second: f64) -> Result<f64, String> {
    match operation {
        "add" => Ok(first + second),
        "subtract" => Ok(first - second),
        "multiply" => Ok(first * second),
        "divide" => {
            if second == 0.0 {
                return Err("Division by zero".into());
            }
            Ok(first / second)
        }
        other => Err(format!("Unknown operation: {}", other)),
    }
}

/// Integers print without a trailing `.0`
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
