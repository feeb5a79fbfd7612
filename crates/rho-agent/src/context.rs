//! Prompt construction and output parsing
//!
//! [`ContextBuilder`] is the seam between the loop and a model's prompt
//! format. [`TaggedContextBuilder`] is the default: a flat XML-ish transcript
//! in, tagged channels out.

use regex::Regex;
use rho_engine::ModelDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::channel::{Channel, ChannelKind, ParsedOutput};
use crate::error::Result;
use crate::generation::{Attachment, GenerationAction};
use crate::tool::{ToolDefinition, ToolRequest, ToolResponse};

/// One entry of the transcript handed to the builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ContextEntry {
    User {
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        image: bool,
    },
    Assistant {
        content: String,
    },
    ToolResponse {
        response: ToolResponse,
    },
    /// Loop-issued instruction, such as the memory flush prompt
    Instruction {
        content: String,
    },
}

impl ContextEntry {
    /// A plain user turn
    pub fn user(content: impl Into<String>) -> Self {
        ContextEntry::User {
            content: content.into(),
            attachments: Vec::new(),
            image: false,
        }
    }

    /// The user turn for a request's prompt and action
    pub fn from_action(prompt: &str, action: &GenerationAction) -> Self {
        match action {
            GenerationAction::Text { attachments } => ContextEntry::User {
                content: prompt.to_string(),
                attachments: attachments.clone(),
                image: false,
            },
            GenerationAction::Image => ContextEntry::User {
                content: prompt.to_string(),
                attachments: Vec::new(),
                image: true,
            },
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ContextEntry::Assistant {
            content: content.into(),
        }
    }

    pub fn instruction(content: impl Into<String>) -> Self {
        ContextEntry::Instruction {
            content: content.into(),
        }
    }
}

impl From<ToolResponse> for ContextEntry {
    fn from(response: ToolResponse) -> Self {
        ContextEntry::ToolResponse { response }
    }
}

/// Everything needed to render one prompt
#[derive(Debug, Clone)]
pub struct ContextParameters {
    pub model: ModelDescriptor,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDefinition>,
    /// Prior turns of the chat followed by this run's transcript
    pub entries: Vec<ContextEntry>,
}

/// Renders prompts and parses raw model output into channels
pub trait ContextBuilder: Send + Sync {
    /// Render the full textual context
    fn build(&self, params: &ContextParameters) -> Result<String>;

    /// Parse a complete raw output
    fn process(&self, raw: &str, model: &ModelDescriptor) -> Result<ParsedOutput>;
}

static CHANNEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<analysis>(?P<analysis>.*?)</analysis>|<commentary>(?P<commentary>.*?)</commentary>|<tool_call>(?P<tool_call>.*?)</tool_call>|<final>(?P<final>.*?)</final>",
    )
    .unwrap()
});

const OPEN_TOOL_CALL: &str = "<tool_call>";

/// Wire shape of a tool call inside `<tool_call>` tags
#[derive(Debug, Deserialize)]
struct RawToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Tag-based prompt format
///
/// Output grammar: `<analysis>`, `<commentary>`, `<tool_call>` and `<final>`
/// sections. Untagged text is part of the final answer. A `<tool_call>`
/// body is `{"name": ..., "arguments": {...}}` with an optional `"id"`.
#[derive(Debug, Clone, Default)]
pub struct TaggedContextBuilder;

impl TaggedContextBuilder {
    pub fn new() -> Self {
        Self
    }

    fn render_system(&self, params: &ContextParameters, out: &mut String) {
        let instruction = params.system_instruction.as_deref().unwrap_or_default();
        if instruction.is_empty() && params.tools.is_empty() {
            return;
        }
        out.push_str("<system>\n");
        if !instruction.is_empty() {
            out.push_str(instruction);
            out.push('\n');
        }
        if !params.tools.is_empty() {
            out.push_str(
                "\nCall a tool by replying with <tool_call>{\"name\": \"...\", \"arguments\": {...}}</tool_call>. \
                 Put your answer for the user in <final></final>.\nAvailable tools:\n",
            );
            for tool in &params.tools {
                out.push_str(&format!(
                    "- {}: {}\n  parameters: {}\n",
                    tool.name, tool.description, tool.parameters
                ));
            }
        }
        out.push_str("</system>\n");
    }

    /// Model-supplied ids are kept only while unique within one output
    fn parse_tool_call(body: &str, seen_ids: &mut HashSet<String>) -> Channel {
        match serde_json::from_str::<RawToolCall>(body.trim()) {
            Ok(call) => {
                let arguments = match call.arguments {
                    serde_json::Value::Null => "{}".to_string(),
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                let mut request = ToolRequest::new(call.name, arguments);
                if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    if seen_ids.contains(&id) {
                        tracing::debug!("Duplicate tool call id {}, assigned {}", id, request.id);
                    } else {
                        request = request.with_id(id);
                    }
                }
                seen_ids.insert(request.id.clone());
                Channel::tool_call(request)
            }
            Err(e) => {
                tracing::warn!("Malformed tool call, keeping it as commentary: {}", e);
                Channel::text(ChannelKind::Commentary, body.trim())
            }
        }
    }

    /// A `<tool_call>` that never closed: keep whatever name is visible
    fn parse_open_tool_call(body: &str) -> Channel {
        static NAME: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r#""name"\s*:\s*"(?P<name>[^"]*)""#).unwrap());
        let name = NAME
            .captures(body)
            .and_then(|c| c.name("name"))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Channel::tool_call(ToolRequest::new(name, body.trim()).incomplete())
    }
}

fn push_untagged(channels: &mut Vec<Channel>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        channels.push(Channel::final_answer(text));
    }
}

impl ContextBuilder for TaggedContextBuilder {
    fn build(&self, params: &ContextParameters) -> Result<String> {
        let mut out = String::new();
        self.render_system(params, &mut out);

        for entry in &params.entries {
            match entry {
                ContextEntry::User {
                    content,
                    attachments,
                    image,
                } => {
                    if *image {
                        out.push_str("<user action=\"image\">\n");
                    } else {
                        out.push_str("<user>\n");
                    }
                    for a in attachments {
                        out.push_str(&format!(
                            "<attachment name=\"{}\" type=\"{}\">\n{}\n</attachment>\n",
                            a.name, a.mime_type, a.content
                        ));
                    }
                    out.push_str(content);
                    out.push_str("\n</user>\n");
                }
                ContextEntry::Assistant { content } => {
                    out.push_str(&format!("<assistant>\n{}\n</assistant>\n", content));
                }
                ContextEntry::ToolResponse { response } => {
                    out.push_str(&format!(
                        "<tool_response id=\"{}\" name=\"{}\">\n{}\n</tool_response>\n",
                        response.request_id, response.tool_name, response.result
                    ));
                }
                ContextEntry::Instruction { content } => {
                    out.push_str(&format!("<instruction>\n{}\n</instruction>\n", content));
                }
            }
        }

        out.push_str("<assistant>\n");
        Ok(out)
    }

    fn process(&self, raw: &str, _model: &ModelDescriptor) -> Result<ParsedOutput> {
        let mut channels = Vec::new();
        let mut cursor = 0;
        let mut seen_ids = HashSet::new();

        for caps in CHANNEL_PATTERN.captures_iter(raw) {
            let Some(whole) = caps.get(0) else { continue };
            push_untagged(&mut channels, &raw[cursor..whole.start()]);
            cursor = whole.end();

            if let Some(m) = caps.name("analysis") {
                channels.push(Channel::text(ChannelKind::Analysis, m.as_str().trim()));
            } else if let Some(m) = caps.name("commentary") {
                channels.push(Channel::text(ChannelKind::Commentary, m.as_str().trim()));
            } else if let Some(m) = caps.name("tool_call") {
                channels.push(Self::parse_tool_call(m.as_str(), &mut seen_ids));
            } else if let Some(m) = caps.name("final") {
                channels.push(Channel::final_answer(m.as_str().trim()));
            }
        }

        let rest = &raw[cursor..];
        match rest.find(OPEN_TOOL_CALL) {
            Some(open) => {
                push_untagged(&mut channels, &rest[..open]);
                channels.push(Self::parse_open_tool_call(
                    &rest[open + OPEN_TOOL_CALL.len()..],
                ));
            }
            None => push_untagged(&mut channels, rest),
        }

        Ok(ParsedOutput::new(channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use rho_engine::BackendKind;

    fn model() -> ModelDescriptor {
        testing::model("tiny", BackendKind::Cpu)
    }

    fn process(raw: &str) -> ParsedOutput {
        TaggedContextBuilder::new().process(raw, &model()).unwrap()
    }

    #[test]
    fn test_plain_text_is_final() {
        let output = process("The answer is 4.");
        assert_eq!(output.channels, vec![Channel::final_answer("The answer is 4.")]);
    }

    #[test]
    fn test_tagged_channels_in_order() {
        let output = process(
            "<analysis>need math</analysis>\n<commentary>Let me compute.</commentary>\
             <tool_call>{\"id\":\"c1\",\"name\":\"calculator\",\"arguments\":{\"operation\":\"add\",\"first\":2,\"second\":2}}</tool_call>",
        );
        let kinds: Vec<ChannelKind> = output.channels.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChannelKind::Analysis, ChannelKind::Commentary, ChannelKind::ToolCall]
        );
        let requests = output.tool_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "c1");
        assert_eq!(requests[0].name, "calculator");
        let args = requests[0].parsed_arguments().unwrap();
        assert_eq!(args["operation"], "add");
    }

    #[test]
    fn test_tool_call_without_id_gets_one() {
        let output = process(r#"<tool_call>{"name":"clock"}</tool_call>"#);
        let requests = output.tool_requests();
        assert_eq!(requests[0].arguments, "{}");
        assert!(requests[0].id.starts_with("call_"));
    }

    #[test]
    fn test_repeated_tool_call_id_is_replaced() {
        let output = process(
            r#"<tool_call>{"id":"1","name":"calculator"}</tool_call><tool_call>{"id":"1","name":"clock"}</tool_call>"#,
        );
        let requests = output.tool_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].id, "1");
        assert_eq!(requests[0].name, "calculator");
        assert_ne!(requests[1].id, "1");
        assert!(requests[1].id.starts_with("call_"));
        assert_eq!(requests[1].name, "clock");
    }

    #[test]
    fn test_unclosed_tool_call_is_incomplete() {
        let output = process(r#"Working on it <tool_call>{"name":"calculator","argu"#);
        assert_eq!(output.channels[0], Channel::final_answer("Working on it"));
        let call = output.channels[1].tool_call.as_ref().unwrap();
        assert_eq!(call.name, "calculator");
        assert!(!call.is_complete);
        assert!(output.tool_requests().is_empty());
    }

    #[test]
    fn test_malformed_tool_call_becomes_commentary() {
        let output = process("<tool_call>not json</tool_call>");
        assert_eq!(output.channels[0].kind, ChannelKind::Commentary);
        assert!(output.tool_requests().is_empty());
    }

    #[test]
    fn test_build_renders_transcript() {
        let request = ToolRequest::new("calculator", "{}").with_id("c1");
        let params = ContextParameters {
            model: model(),
            system_instruction: Some("Be brief.".into()),
            tools: vec![ToolDefinition {
                name: "calculator".into(),
                description: "Arithmetic".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            entries: vec![
                ContextEntry::user("2+2?"),
                ContextEntry::assistant("<tool_call>...</tool_call>"),
                ToolResponse::success(&request, "4").into(),
                ContextEntry::instruction("Summarize."),
            ],
        };
        let prompt = TaggedContextBuilder::new().build(&params).unwrap();
        assert!(prompt.starts_with("<system>\nBe brief.\n"));
        assert!(prompt.contains("- calculator: Arithmetic"));
        assert!(prompt.contains("<user>\n2+2?\n</user>"));
        assert!(prompt.contains("<tool_response id=\"c1\" name=\"calculator\">\n4\n</tool_response>"));
        assert!(prompt.contains("<instruction>\nSummarize.\n</instruction>"));
        assert!(prompt.ends_with("<assistant>\n"));
    }

    #[test]
    fn test_build_image_and_attachments() {
        let params = ContextParameters {
            model: model(),
            system_instruction: None,
            tools: vec![],
            entries: vec![
                ContextEntry::from_action("a cat", &GenerationAction::Image),
                ContextEntry::from_action(
                    "summarize",
                    &GenerationAction::Text {
                        attachments: vec![Attachment {
                            name: "notes.txt".into(),
                            mime_type: "text/plain".into(),
                            content: "hello".into(),
                        }],
                    },
                ),
            ],
        };
        let prompt = TaggedContextBuilder::new().build(&params).unwrap();
        assert!(!prompt.contains("<system>"));
        assert!(prompt.contains("<user action=\"image\">\na cat"));
        assert!(prompt.contains("<attachment name=\"notes.txt\" type=\"text/plain\">\nhello\n</attachment>"));
    }
}
