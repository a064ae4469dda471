use std::collections::HashMap;

use crate::core::db::QueryRows;
use crate::core::llm::{ChatMessage, ToolCall};

pub const QUERY_TOOL: &str = "sql_db_query";
pub const SCHEMA_TOOL: &str = "sql_db_schema";

/// Typed record of the single query execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Rows(QueryRows),
    Failed(String),
}

/// Conversation snapshot threaded through the pipeline. Stages consume the
/// current value and return a rebuilt one; entries are append-only except for
/// the formatting stage, which replaces the raw result it consumed.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
    selected_tables: Vec<String>,
    table_schemas: HashMap<String, String>,
    relevant_columns: HashMap<String, Vec<String>>,
    executed_query: String,
    execution: Option<ExecutionOutcome>,
}

impl ConversationState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(question)],
            ..Default::default()
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The user question that opened the conversation.
    pub fn question(&self) -> &str {
        self.messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    pub fn last_content(&self) -> &str {
        self.messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    pub fn push(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Swap the newest entry for `message`. Used when a raw result entry is
    /// superseded by its formatted rendering.
    pub fn replace_last(mut self, message: ChatMessage) -> Self {
        self.messages.pop();
        self.messages.push(message);
        self
    }

    pub fn selected_tables(&self) -> &[String] {
        &self.selected_tables
    }

    /// Record the discovery outcome. Set once; later writers are ignored.
    pub fn with_selected_tables(mut self, tables: Vec<String>) -> Self {
        if self.selected_tables.is_empty() {
            self.selected_tables = tables;
        }
        self
    }

    /// Reserved per-table DDL cache; discovery currently leaves the raw DDL in
    /// the message log instead of parsing it here.
    pub fn table_schemas(&self) -> &HashMap<String, String> {
        &self.table_schemas
    }

    /// Reserved column-relevance map, same deferred-parsing contract as
    /// `table_schemas`.
    pub fn relevant_columns(&self) -> &HashMap<String, Vec<String>> {
        &self.relevant_columns
    }

    pub fn executed_query(&self) -> &str {
        &self.executed_query
    }

    pub fn with_executed_query(mut self, query: impl Into<String>) -> Self {
        self.executed_query = query.into();
        self
    }

    pub fn execution(&self) -> Option<&ExecutionOutcome> {
        self.execution.as_ref()
    }

    pub fn with_execution(mut self, outcome: ExecutionOutcome) -> Self {
        self.execution = Some(outcome);
        self
    }

    /// Most recent pending SQL emission, scanning newest-first.
    pub fn pending_query(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match &m.tool_call {
            Some(ToolCall { name, arguments }) if name == QUERY_TOOL => {
                arguments.get("query").and_then(|q| q.as_str())
            }
            _ => None,
        })
    }
}
