// src/stream/protocol.rs — stream-json wire records
//
// One JSON object per line on the agent's stdout. The `type` field selects
// the record; unknown types decode to `AgentRecord::Other` and are skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `result.subtype` value that marks a successful run.
pub const RESULT_SUCCESS: &str = "success";

/// `system.subtype` value that announces the session id.
pub const SYSTEM_INIT: &str = "init";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    System(SystemRecord),
    User(UserRecord),
    Assistant(AssistantRecord),
    ToolResult(ToolResultRecord),
    Result(ResultRecord),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemRecord {
    #[serde(default)]
    pub subtype: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
}

impl SystemRecord {
    /// Tool names, accepting plain strings or `{ "name": … }` objects.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter_map(|t| match t {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserRecord {
    pub uuid: Option<String>,
    pub message: UserMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of the message, ignoring non-text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantRecord {
    pub uuid: Option<String>,
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolResultRecord {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultRecord {
    #[serde(default)]
    pub subtype: String,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    #[serde(rename = "costUSD")]
    pub cost_usd_camel: Option<f64>,
    pub total_cost_usd: Option<f64>,
}

impl ResultRecord {
    pub fn is_success(&self) -> bool {
        self.subtype == RESULT_SUCCESS
    }

    /// Cost under whichever spelling the agent used. Zero when absent.
    pub fn cost(&self) -> f64 {
        self.cost_usd
            .or(self.cost_usd_camel)
            .or(self.total_cost_usd)
            .unwrap_or(0.0)
    }
}

/// Decode one line of agent output.
pub fn decode_line(line: &str) -> serde_json::Result<AgentRecord> {
    serde_json::from_str(line)
}

#[derive(Serialize)]
struct UserEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: OutboundMessage<'a>,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// The single stdin line that carries a user message, newline included.
pub fn encode_user_message(text: &str) -> serde_json::Result<String> {
    let envelope = UserEnvelope {
        kind: "user",
        message: OutboundMessage {
            role: "user",
            content: text,
        },
    };
    let mut line = serde_json::to_string(&envelope)?;
    line.push('\n');
    Ok(line)
}
