use anyhow::{Result, anyhow};
use serde_json::json;
use tracing::{info, warn};

use super::state::{ConversationState, QUERY_TOOL};
use crate::core::llm::{ChatMessage, LanguageModel, ToolChoice, ToolSpec};

pub fn query_tool() -> ToolSpec {
    ToolSpec {
        name: QUERY_TOOL.to_string(),
        description: "Execute a SQL query against the clinical database.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A syntactically correct SQL query",
                }
            },
            "required": ["query"],
        }),
    }
}

fn generation_prompt(patient_id: &str, dialect: &str, selected_tables: &[String]) -> String {
    let focus = if selected_tables.is_empty() {
        "patient-related tables".to_string()
    } else {
        selected_tables.join(", ")
    };
    format!(
        r#"You are an agent designed to interact with a SQL database.
Given an input question about patient patient_id={patient_id}, create a syntactically correct {dialect} query to run.

Guidelines:
- Focus on the most relevant tables: {focus}
- Look at the schema information in the previous messages to understand available columns
- Only select columns that are needed to answer the question
- Always include patient_id filter where applicable (use id column for patient_id)
- Limit results to 100 unless user specifies otherwise
- DO NOT make any DML statements (INSERT, UPDATE, DELETE, DROP etc.)

You must generate a SQL query using the {QUERY_TOOL} tool. The query will be validated and executed in the next step.
Return only the SQL query via the tool call - do not execute it yet."#
    )
}

/// Ask the model for exactly one SQL emission through the query tool. A reply
/// without a tool call is a hard error; there is nothing downstream to run.
pub async fn generate_query(
    llm: &dyn LanguageModel,
    state: ConversationState,
    patient_id: &str,
    dialect: &str,
) -> Result<ConversationState> {
    let mut messages = vec![ChatMessage::system(generation_prompt(
        patient_id,
        dialect,
        state.selected_tables(),
    ))];
    messages.extend_from_slice(state.messages());

    let reply = llm
        .invoke(&messages, &[query_tool()], ToolChoice::Required)
        .await?;

    match reply.tool_call {
        Some(call) if call.name == QUERY_TOOL => {
            if let Some(query) = call.arguments.get("query").and_then(|q| q.as_str()) {
                info!("Generated query: {}", query);
            }
            Ok(state.push(ChatMessage::assistant_call(reply.text, call)))
        }
        _ => Err(anyhow!("query generation produced no SQL tool call")),
    }
}

fn validation_prompt(dialect: &str) -> String {
    format!(
        r#"You are a SQL expert with a strong attention to detail.
Double check the {dialect} query for common mistakes, including:
- Using NOT IN with NULL values
- Using UNION when UNION ALL should have been used
- Using BETWEEN for exclusive ranges
- Data type mismatch in predicates
- Properly quoting identifiers
- Using the correct number of arguments for functions
- Casting to the correct data type
- Using the proper columns for joins

If there are any mistakes, rewrite the query. If there are no mistakes,
just reproduce the original query.

You will call the appropriate tool to execute the query after running this check."#
    )
}

/// Optional second look at the pending query. A corrected emission supersedes
/// the original; a reply without a tool call leaves the original in place.
pub async fn check_query(
    llm: &dyn LanguageModel,
    state: ConversationState,
    dialect: &str,
) -> Result<ConversationState> {
    let Some(pending) = state.pending_query().map(str::to_string) else {
        warn!("Validation requested with no pending query; skipping");
        return Ok(state);
    };
    info!("Validating query: {}", pending);

    let reply = llm
        .invoke(
            &[
                ChatMessage::system(validation_prompt(dialect)),
                ChatMessage::user(pending),
            ],
            &[query_tool()],
            ToolChoice::Required,
        )
        .await?;

    match reply.tool_call {
        Some(call) if call.name == QUERY_TOOL => {
            Ok(state.push(ChatMessage::assistant_call(reply.text, call)))
        }
        _ => {
            warn!("Validator produced no tool call; keeping the original query");
            Ok(state)
        }
    }
}
