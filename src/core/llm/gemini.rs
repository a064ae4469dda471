use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::llm::{ChatMessage, LanguageModel, ModelReply, Role, ToolCall, ToolChoice, ToolSpec};

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TEMPERATURE: f32 = 0.2;

#[derive(Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTools>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiTools {
    function_declarations: Vec<GeminiFunctionDecl>,
}

#[derive(Serialize)]
struct GeminiFunctionDecl {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct GeminiToolConfig {
    function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Serialize)]
struct GeminiFunctionCallingConfig {
    mode: &'static str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResContent>,
}

#[derive(Deserialize)]
struct GeminiResContent {
    #[serde(default)]
    parts: Vec<GeminiResPart>,
}

#[derive(Deserialize)]
struct GeminiResPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

pub struct GeminiModel {
    api_key: String,
    model_id: String,
    temperature: f32,
    base_url: String,
    client: Client,
}

impl GeminiModel {
    pub fn new(api_key: String, model_id: String) -> Self {
        Self {
            api_key,
            model_id,
            temperature: DEFAULT_TEMPERATURE,
            base_url: GEMINI_API_BASE.to_string(),
            client: Client::new(),
        }
    }

    /// Point the provider at a different endpoint (local mock servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Text rendering of one conversation entry as Gemini sees it. Pending tool
/// calls are spelled out so the model can read back its own earlier requests.
fn message_text(m: &ChatMessage) -> String {
    match &m.tool_call {
        Some(call) if m.content.is_empty() => {
            format!("[tool_call] {} {}", call.name, call.arguments)
        }
        Some(call) => format!("{}\n[tool_call] {} {}", m.content, call.name, call.arguments),
        None => m.content.clone(),
    }
}

fn push_or_merge(contents: &mut Vec<GeminiContent>, role: &str, text: String) {
    let should_merge = contents.last().map(|c| c.role == role).unwrap_or(false);
    if should_merge {
        if let Some(last) = contents.last_mut()
            && let Some(part) = last.parts.first_mut()
        {
            part.text.push('\n');
            part.text.push_str(&text);
        }
    } else {
        contents.push(GeminiContent {
            role: role.to_string(),
            parts: vec![GeminiPart { text }],
        });
    }
}

/// Fold role-tagged messages into Gemini's alternating user/model contents.
/// Leading system messages become the system_instruction; mid-conversation
/// system messages are injected as [SYSTEM]-prefixed user text. Consecutive
/// same-role entries are merged because Gemini requires strict alternation.
fn build_contents(messages: &[ChatMessage]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
    let mut contents: Vec<GeminiContent> = Vec::new();
    let mut system_instruction: Option<GeminiContent> = None;
    let mut past_first_non_system = false;

    for m in messages {
        let text = message_text(m);
        if m.role == Role::System {
            if !past_first_non_system {
                if let Some(ref mut si) = system_instruction {
                    if let Some(part) = si.parts.first_mut() {
                        part.text.push('\n');
                        part.text.push_str(&text);
                    }
                } else {
                    system_instruction = Some(GeminiContent {
                        role: "user".to_string(), // role is ignored for system_instruction but required by struct
                        parts: vec![GeminiPart { text }],
                    });
                }
            } else {
                push_or_merge(&mut contents, "user", format!("[SYSTEM] {}", text));
            }
        } else {
            past_first_non_system = true;
            let gemini_role = if m.role == Role::Assistant { "model" } else { "user" };
            push_or_merge(&mut contents, gemini_role, text);
        }
    }

    (system_instruction, contents)
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        tool_choice: ToolChoice,
    ) -> Result<ModelReply> {
        let (system_instruction, contents) = build_contents(messages);

        let (wire_tools, tool_config) = if tools.is_empty() {
            (None, None)
        } else {
            let declarations = tools
                .iter()
                .map(|t| GeminiFunctionDecl {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect();
            let mode = match tool_choice {
                ToolChoice::Auto => "AUTO",
                ToolChoice::Required => "ANY",
            };
            (
                Some(vec![GeminiTools { function_declarations: declarations }]),
                Some(GeminiToolConfig {
                    function_calling_config: GeminiFunctionCallingConfig { mode },
                }),
            )
        };

        let req = GeminiRequest {
            system_instruction,
            contents,
            tools: wire_tools,
            tool_config,
            generation_config: GeminiGenerationConfig { temperature: self.temperature },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model_id, self.api_key
        );
        let res = self.client.post(&url).json(&req).send().await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Google Gemini API Error: {}",
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: GeminiResponse = res.json().await?;

        let mut reply = ModelReply::default();
        if let Some(content) = parsed.candidates.into_iter().next().and_then(|c| c.content) {
            for part in content.parts {
                if let Some(t) = part.text {
                    reply.text.push_str(&t);
                }
                if reply.tool_call.is_none()
                    && let Some(fc) = part.function_call
                {
                    reply.tool_call = Some(ToolCall { name: fc.name, arguments: fc.args });
                }
            }
        }
        Ok(reply)
    }
}
