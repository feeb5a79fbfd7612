//! Parsed model output: an ordered list of tagged channels

use serde::{Deserialize, Serialize};

use crate::tool::ToolRequest;

/// Tag of one output segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Private reasoning
    Analysis,
    /// User-visible narration between tool calls
    Commentary,
    /// A request to run a tool
    ToolCall,
    /// The answer
    Final,
}

/// One tagged segment of a model's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub kind: ChannelKind,
    pub content: String,
    /// Present on `ToolCall` channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolRequest>,
}

impl Channel {
    /// A text channel of the given kind
    pub fn text(kind: ChannelKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tool_call: None,
        }
    }

    /// A final-answer channel
    pub fn final_answer(content: impl Into<String>) -> Self {
        Self::text(ChannelKind::Final, content)
    }

    /// A tool-call channel
    pub fn tool_call(request: ToolRequest) -> Self {
        Self {
            kind: ChannelKind::ToolCall,
            content: request.arguments.clone(),
            tool_call: Some(request),
        }
    }
}

/// Structured form of one complete model turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedOutput {
    pub channels: Vec<Channel>,
}

impl ParsedOutput {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    /// Complete tool requests in the order their channels appear
    pub fn tool_requests(&self) -> Vec<ToolRequest> {
        self.channels
            .iter()
            .filter(|c| c.kind == ChannelKind::ToolCall)
            .filter_map(|c| c.tool_call.as_ref())
            .filter(|r| r.is_complete)
            .cloned()
            .collect()
    }

    /// Whether any channel is tagged as a tool call, complete or not
    pub fn has_tool_channels(&self) -> bool {
        self.channels.iter().any(|c| c.kind == ChannelKind::ToolCall)
    }

    /// Text of the final-answer channels
    pub fn final_text(&self) -> String {
        self.channels
            .iter()
            .filter(|c| c.kind == ChannelKind::Final)
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether nothing but whitespace was produced
    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(|c| c.content.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_requests_keep_channel_order() {
        let output = ParsedOutput::new(vec![
            Channel::text(ChannelKind::Analysis, "thinking"),
            Channel::tool_call(ToolRequest::new("zeta", "{}").with_id("c1")),
            Channel::text(ChannelKind::Commentary, "and also"),
            Channel::tool_call(ToolRequest::new("alpha", "{}").with_id("c2")),
        ]);
        let ids: Vec<String> = output.tool_requests().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_incomplete_tool_calls_are_skipped() {
        let output = ParsedOutput::new(vec![Channel::tool_call(
            ToolRequest::new("calculator", "{\"op").incomplete(),
        )]);
        assert!(output.has_tool_channels());
        assert!(output.tool_requests().is_empty());
    }

    #[test]
    fn test_final_text_joins_final_channels_only() {
        let output = ParsedOutput::new(vec![
            Channel::text(ChannelKind::Analysis, "hidden"),
            Channel::final_answer("Hello"),
            Channel::final_answer("world"),
        ]);
        assert_eq!(output.final_text(), "Hello\nworld");
    }

    #[test]
    fn test_is_empty() {
        assert!(ParsedOutput::default().is_empty());
        assert!(ParsedOutput::new(vec![Channel::final_answer("  \n")]).is_empty());
        assert!(!ParsedOutput::new(vec![Channel::final_answer("x")]).is_empty());
    }
}
