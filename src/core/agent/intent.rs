use anyhow::Result;
use serde_json::json;
use tracing::info;

use super::state::ConversationState;
use crate::core::llm::{ChatMessage, LanguageModel};

/// Coarse routing label for an incoming question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentLabel {
    ListTables,
    Greeting,
    Other,
}

impl IntentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::ListTables => "list_tables",
            IntentLabel::Greeting => "greeting",
            IntentLabel::Other => "other",
        }
    }

    /// Substring sniff over a free-text reply. `list_tables` wins ties so a
    /// rambling reply that mentions both labels still reaches the data path.
    pub fn from_reply(reply: &str) -> Self {
        let lowered = reply.to_lowercase();
        if lowered.contains("list_tables") {
            IntentLabel::ListTables
        } else if lowered.contains("greeting") {
            IntentLabel::Greeting
        } else {
            IntentLabel::Other
        }
    }
}

fn routing_prompt() -> String {
    r#"You are a Health Informatics AI routing system.

Analyze the user query and classify it into one of these categories:

1. Return "greeting" if the query is:
- Greetings (hello, hi, good morning, etc.)
- Farewells (goodbye, bye, see you later, etc.)
- Courtesy questions (how are you, thanks, etc.)
- General help requests (what can you do, who are you, help, etc.)

2. Return "list_tables" if the query is asking for:
- Patient treatment history, medications, or therapies
- Pathology results, lab results, or diagnostic reports
- Patient registration details, contact info, or demographics
- Medical records, health data, or clinical information
- Specific patient data by ID or condition

3. Return "other" for any other queries that don't fit the above categories.

Respond with only one word: "greeting", "list_tables", or "other""#
        .to_string()
}

/// Ask the model for a routing label and append it as an assistant entry.
pub async fn classify(
    llm: &dyn LanguageModel,
    state: ConversationState,
) -> Result<ConversationState> {
    let question = state.question().to_string();
    let reply = llm
        .generate(&[
            ChatMessage::system(routing_prompt()),
            ChatMessage::user(question),
        ])
        .await?;

    let label = IntentLabel::from_reply(&reply);
    info!("Query classified as: {}", label.as_str());
    Ok(state.push(ChatMessage::assistant(label.as_str())))
}

/// Read the routing label back out of the newest entry.
pub fn route(state: &ConversationState) -> IntentLabel {
    IntentLabel::from_reply(state.last_content())
}

fn greeting_prompt(patient_id: &str, question: &str) -> String {
    format!(
        r#"You are a Health Informatics AI assistant designed for healthcare professionals.

The user has sent: "{question}"

Your task is to respond appropriately and CONCISELY based on the type of message:

For GREETINGS (hello, hi, good morning, etc.):
- Greet warmly in 1-2 sentences
- Briefly mention you help with patient data
- Give 1 simple example
- Keep total response under 150 characters

For FAREWELLS (goodbye, bye, etc.):
- Simple, friendly farewell in 1 sentence
- Maximum 50 characters

For HELP/CAPABILITY questions (what can you do, who are you, etc.):
- Explain role in 2-3 short sentences
- List 2-3 main capabilities briefly
- Keep under 200 characters total

For COURTESY (thanks, how are you, etc.):
- Brief appropriate response
- Mention availability
- Maximum 100 characters

Guidelines:
- BE CONCISE - short responses only
- Use simple, direct language
- No bullet points or complex formatting
- Keep responses conversational but brief
- Current patient: {patient_id}

Examples of good responses:
- "Hello! I help with patient data analysis. Try asking about patient {patient_id}'s treatment history!"
- "I'm your Health Informatics AI. I can analyze patient records, treatments, and lab results. What would you like to know?"
- "Goodbye! Feel free to return for patient data help anytime.""#
    )
}

/// Produce the conversational reply for greeting-class questions, wrapped in
/// the text-typed response envelope.
pub async fn respond_greeting(
    llm: &dyn LanguageModel,
    state: ConversationState,
    patient_id: &str,
) -> Result<ConversationState> {
    let question = state.question().to_string();
    let reply = llm
        .generate(&[
            ChatMessage::system(greeting_prompt(patient_id, &question)),
            ChatMessage::user(question.clone()),
        ])
        .await?;

    let payload = json!({
        "type": "text",
        "content": reply,
        "context": "greeting_response",
    });
    Ok(state.push(ChatMessage::assistant(payload.to_string())))
}
