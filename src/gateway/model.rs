//! `OpenAI` Chat Completions 报文结构
//!
//! 入站：`ChatRequest` / `ChatMessage`
//! 出站：流式 `CompletionChunk`，非流式 `CompletionObject`

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// 其他角色（`tool`、`developer` 等）照常接受，转发时与 assistant 一样处理
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// `null` 与缺省都视为非流式
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

const ASSISTANT: &str = "assistant";

#[derive(Debug, Serialize)]
pub struct Delta<'a> {
    pub content: &'a str,
    pub role: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice<'a> {
    pub index: u32,
    pub delta: Delta<'a>,
    pub finish_reason: Option<&'static str>,
}

/// 流式响应中的单个 chunk（`chat.completion.chunk`）
#[derive(Debug, Serialize)]
pub struct CompletionChunk<'a> {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: &'a str,
    pub choices: [ChunkChoice<'a>; 1],
    pub usage: Option<()>,
}

impl<'a> CompletionChunk<'a> {
    /// 每个 chunk 都生成新的 id
    pub fn new(model: &'a str, content: &'a str) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion.chunk",
            created: Utc::now().timestamp(),
            model,
            choices: [ChunkChoice {
                index: 0,
                delta: Delta {
                    content,
                    role: ASSISTANT,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

/// 非流式响应（`chat.completion`）
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<serde_json::Value>,
}

impl CompletionObject {
    pub fn new(model: &str, content: String) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion".to_owned(),
            created: Utc::now().timestamp(),
            model: model.to_owned(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: ASSISTANT.to_owned(),
                    content,
                },
                finish_reason: "stop".to_owned(),
            }],
            usage: None,
        }
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map_or("", |choice| choice.message.content.as_str())
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}
