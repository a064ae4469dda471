pub mod gemini;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A structured function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_call: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_call: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_call: None }
    }

    /// Assistant turn that carries a pending tool call alongside any free text.
    pub fn assistant_call(content: impl Into<String>, call: ToolCall) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_call: Some(call) }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self { role: Role::Tool, content: content.into(), tool_call: None }
    }
}

/// Declaration of a function the model may call, JSON-schema parameters included.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides whether to call a tool.
    Auto,
    /// The model must call one of the offered tools.
    Required,
}

#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub text: String,
    pub tool_call: Option<ToolCall>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    // Execute a structured conversation, optionally binding tools the model can call.
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        tool_choice: ToolChoice,
    ) -> Result<ModelReply>;

    // Plain text completion without any tools bound.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        Ok(self.invoke(messages, &[], ToolChoice::Auto).await?.text)
    }
}
