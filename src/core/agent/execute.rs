use anyhow::Result;
use regex::Regex;
use tracing::{info, warn};

use super::state::{ConversationState, ExecutionOutcome};
use crate::core::db::ClinicalDatabase;
use crate::core::llm::ChatMessage;

/// First write-class keyword in the statement, ignoring quoted literals.
/// `REPLACE` alone is allowed (it is a common string function); `REPLACE INTO`
/// is not.
pub fn first_forbidden_keyword(sql: &str) -> Option<String> {
    let stripped = strip_string_literals(sql);
    let re = Regex::new(
        r"(?i)\breplace\s+into\b|\b(insert|update|delete|drop|alter|create|truncate)\b",
    )
    .unwrap();
    re.find(&stripped).map(|m| {
        let kw = m.as_str().to_lowercase();
        if kw.starts_with("replace") {
            "replace into".to_string()
        } else {
            kw
        }
    })
}

/// Blank out single- and double-quoted literals so keyword scanning cannot be
/// tricked by text values. Doubled quotes inside a literal are handled.
fn strip_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' || c == '"' {
            let quote = c;
            out.push(' ');
            while let Some(inner) = chars.next() {
                if inner == quote {
                    if chars.peek() == Some(&quote) {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

/// Execute the pending query exactly once, recording a typed outcome. Guard
/// rejections and database errors are captured as entries, not bubbled up.
pub async fn run_query(
    db: &dyn ClinicalDatabase,
    state: ConversationState,
) -> Result<ConversationState> {
    let Some(query) = state.pending_query().map(str::to_string) else {
        warn!("No pending query to execute");
        let message = "Error executing query: no pending query to execute".to_string();
        return Ok(state
            .push(ChatMessage::assistant(message.clone()))
            .with_execution(ExecutionOutcome::Failed(message)));
    };

    info!("Executing: {}", query);

    let outcome = if let Some(keyword) = first_forbidden_keyword(&query) {
        warn!("Rejected query containing forbidden keyword '{}'", keyword);
        ExecutionOutcome::Failed(format!(
            "Error executing query: statement contains forbidden keyword '{}'",
            keyword
        ))
    } else {
        match db.run_query(&query).await {
            Ok(rows) => {
                info!("Query returned {} row(s)", rows.len());
                ExecutionOutcome::Rows(rows)
            }
            Err(e) => {
                warn!("Error executing query: {}", e);
                ExecutionOutcome::Failed(format!("Error executing query: {}", e))
            }
        }
    };

    let state = state.with_executed_query(&query);
    Ok(match &outcome {
        ExecutionOutcome::Rows(rows) => {
            let rendered = rows.render_tuples();
            state.push(ChatMessage::tool(rendered)).with_execution(outcome)
        }
        ExecutionOutcome::Failed(message) => {
            let entry = ChatMessage::assistant(message.clone());
            state.push(entry).with_execution(outcome)
        }
    })
}
