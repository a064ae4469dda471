use anyhow::Result;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use super::state::{ConversationState, SCHEMA_TOOL};
use crate::core::db::ClinicalDatabase;
use crate::core::llm::{ChatMessage, LanguageModel, ToolChoice, ToolSpec};

/// Table-name keywords that mark a table as clinically relevant.
const DOMAIN_KEYWORDS: [&str; 4] = ["patient", "registration", "treatment", "pathology"];

pub fn schema_tool() -> ToolSpec {
    ToolSpec {
        name: SCHEMA_TOOL.to_string(),
        description: "Fetch the CREATE TABLE statements for the given tables.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "tables": {
                    "type": "string",
                    "description": "Comma-separated list of table names",
                }
            },
            "required": ["tables"],
        }),
    }
}

/// Enumerate the database tables and append them to the conversation.
pub async fn list_tables(
    db: &dyn ClinicalDatabase,
    state: ConversationState,
) -> Result<ConversationState> {
    let tables = db.list_tables().await?;
    info!("Available tables: {}", tables);
    let summary = format!("Available tables: {}", tables);
    Ok(state.push(ChatMessage::tool(tables)).push(ChatMessage::assistant(summary)))
}

/// Table names the schema tool was asked for. Accepts the declared
/// comma-separated string and tolerates an array argument.
fn requested_tables(arguments: &serde_json::Value) -> Vec<String> {
    match arguments.get("tables") {
        Some(serde_json::Value::String(s)) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Table names in a DDL blob, first-seen order, deduplicated.
pub fn parse_ddl_tables(ddl: &str) -> Vec<String> {
    let re = Regex::new(r#"(?i)CREATE TABLE\s+(?:IF NOT EXISTS\s+)?[`"]?(\w+)"#).unwrap();
    let mut tables = Vec::new();
    for cap in re.captures_iter(ddl) {
        let name = cap[1].to_string();
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

/// Pick the tables worth querying: keyword matches and tables the question
/// names directly, falling back to the first discovered table.
pub fn select_relevant_tables(all_tables: &[String], question: &str) -> Vec<String> {
    let question_lower = question.to_lowercase();
    let mut selected = Vec::new();

    for table in all_tables {
        let table_lower = table.to_lowercase();
        if DOMAIN_KEYWORDS.iter().any(|k| table_lower.contains(k)) {
            selected.push(table.clone());
        } else if question_lower.contains(&table_lower) {
            selected.push(table.clone());
        }
    }

    if selected.is_empty()
        && let Some(first) = all_tables.first()
    {
        warn!("No relevant tables matched; falling back to '{}'", first);
        selected.push(first.clone());
    }
    selected
}

/// Let the model request DDL through the schema tool, run the fetch, then
/// derive the selected-tables set from whatever DDL is now in the log.
pub async fn fetch_schema(
    llm: &dyn LanguageModel,
    db: &dyn ClinicalDatabase,
    state: ConversationState,
) -> Result<ConversationState> {
    let reply = llm
        .invoke(state.messages(), &[schema_tool()], ToolChoice::Required)
        .await?;

    let mut state = state;
    match reply.tool_call {
        Some(call) if call.name == SCHEMA_TOOL => {
            let tables = requested_tables(&call.arguments);
            info!("Fetching schema for: {:?}", tables);
            let ddl = db.table_schema(&tables).await?;
            state = state
                .push(ChatMessage::assistant_call(reply.text, call))
                .push(ChatMessage::tool(ddl));
        }
        Some(call) => {
            warn!("Model requested unexpected tool '{}'; skipping schema fetch", call.name);
        }
        None => {
            warn!("Model declined the schema tool; continuing without fresh DDL");
        }
    }

    // Newest DDL wins, wherever it came from.
    let schema_content = state
        .messages()
        .iter()
        .rev()
        .find(|m| m.content.contains("CREATE TABLE"))
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let all_tables = parse_ddl_tables(&schema_content);
    let selected = select_relevant_tables(&all_tables, state.question());
    info!("Selected tables: {:?}", selected);

    Ok(state.with_selected_tables(selected))
}
