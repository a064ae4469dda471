pub mod discover;
pub mod execute;
pub mod format;
pub mod generate;
pub mod intent;
pub mod state;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use self::intent::IntentLabel;
use self::state::{ConversationState, ExecutionOutcome};
use crate::core::db::ClinicalDatabase;
use crate::core::llm::LanguageModel;

/// Pipeline stages. Exactly one stage runs at a time; transitions are
/// validated against `can_transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ClassifyIntent,
    HandleGreeting,
    ListTables,
    FetchSchema,
    GenerateQuery,
    CheckQuery,
    RunQuery,
    FormatResults,
}

/// Legal edges of the stage graph. Terminal stages have no outgoing edges;
/// ending the run is always allowed.
pub fn can_transition(from: Stage, to: Stage) -> bool {
    matches!(
        (from, to),
        (Stage::ClassifyIntent, Stage::HandleGreeting)
            | (Stage::ClassifyIntent, Stage::ListTables)
            | (Stage::ListTables, Stage::FetchSchema)
            | (Stage::FetchSchema, Stage::GenerateQuery)
            | (Stage::GenerateQuery, Stage::CheckQuery)
            | (Stage::GenerateQuery, Stage::RunQuery)
            | (Stage::CheckQuery, Stage::RunQuery)
            | (Stage::RunQuery, Stage::FormatResults)
    )
}

enum StageOutcome {
    Next(Stage),
    Done,
}

/// What the caller gets back: the primary text plus an HTML table when the
/// run produced tabular data.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub primary_text: String,
    pub table_html: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryAgentConfig {
    /// Run the SQL self-check stage between generation and execution.
    pub validate_queries: bool,
}

impl Default for QueryAgentConfig {
    fn default() -> Self {
        Self { validate_queries: false }
    }
}

/// Single-turn conversational agent over the clinical database. Each `run`
/// drives one question through classification, discovery, generation,
/// execution and formatting.
pub struct QueryAgent {
    llm: Arc<dyn LanguageModel>,
    db: Arc<dyn ClinicalDatabase>,
    config: QueryAgentConfig,
}

impl QueryAgent {
    pub fn new(llm: Arc<dyn LanguageModel>, db: Arc<dyn ClinicalDatabase>) -> Self {
        Self { llm, db, config: QueryAgentConfig::default() }
    }

    pub fn with_config(mut self, config: QueryAgentConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(&self, patient_id: &str, question: &str) -> Result<AgentReply> {
        Ok(self.run_traced(patient_id, question).await?.0)
    }

    /// Run the pipeline and also hand back the final conversation state for
    /// auditing.
    pub async fn run_traced(
        &self,
        patient_id: &str,
        question: &str,
    ) -> Result<(AgentReply, ConversationState)> {
        let mut state = ConversationState::new(question);
        let mut stage = Stage::ClassifyIntent;

        loop {
            info!("Stage: {:?}", stage);
            let (next_state, outcome) = self.step(stage, state, patient_id).await?;
            state = next_state;
            match outcome {
                StageOutcome::Next(next) => {
                    debug_assert!(
                        can_transition(stage, next),
                        "illegal transition {:?} -> {:?}",
                        stage,
                        next
                    );
                    stage = next;
                }
                StageOutcome::Done => break,
            }
        }

        let reply = finish(&state);
        Ok((reply, state))
    }

    async fn step(
        &self,
        stage: Stage,
        state: ConversationState,
        patient_id: &str,
    ) -> Result<(ConversationState, StageOutcome)> {
        match stage {
            Stage::ClassifyIntent => {
                let state = intent::classify(self.llm.as_ref(), state).await?;
                let outcome = match intent::route(&state) {
                    IntentLabel::ListTables => StageOutcome::Next(Stage::ListTables),
                    IntentLabel::Greeting => StageOutcome::Next(Stage::HandleGreeting),
                    IntentLabel::Other => StageOutcome::Done,
                };
                Ok((state, outcome))
            }
            Stage::HandleGreeting => {
                let state =
                    intent::respond_greeting(self.llm.as_ref(), state, patient_id).await?;
                Ok((state, StageOutcome::Done))
            }
            Stage::ListTables => {
                let state = discover::list_tables(self.db.as_ref(), state).await?;
                Ok((state, StageOutcome::Next(Stage::FetchSchema)))
            }
            Stage::FetchSchema => {
                let state =
                    discover::fetch_schema(self.llm.as_ref(), self.db.as_ref(), state).await?;
                Ok((state, StageOutcome::Next(Stage::GenerateQuery)))
            }
            Stage::GenerateQuery => {
                let state = generate::generate_query(
                    self.llm.as_ref(),
                    state,
                    patient_id,
                    self.db.dialect(),
                )
                .await?;
                let next = if self.config.validate_queries {
                    Stage::CheckQuery
                } else {
                    Stage::RunQuery
                };
                Ok((state, StageOutcome::Next(next)))
            }
            Stage::CheckQuery => {
                let state =
                    generate::check_query(self.llm.as_ref(), state, self.db.dialect()).await?;
                Ok((state, StageOutcome::Next(Stage::RunQuery)))
            }
            Stage::RunQuery => {
                let state = execute::run_query(self.db.as_ref(), state).await?;
                let outcome = match state.execution() {
                    Some(ExecutionOutcome::Rows(rows)) if !rows.is_empty() => {
                        StageOutcome::Next(Stage::FormatResults)
                    }
                    _ => StageOutcome::Done,
                };
                Ok((state, outcome))
            }
            Stage::FormatResults => {
                let state = format::format_results(self.llm.as_ref(), state, patient_id).await?;
                Ok((state, StageOutcome::Done))
            }
        }
    }
}

/// Derive the caller-facing reply from the final conversation state.
/// table_data payloads are returned whole with their HTML split out; text
/// payloads unwrap to their content; anything else passes through verbatim.
fn finish(state: &ConversationState) -> AgentReply {
    let content = state.last_content().to_string();
    match serde_json::from_str::<Value>(&content) {
        Ok(parsed) if parsed.get("type").and_then(|t| t.as_str()) == Some("table_data") => {
            let table_html = parsed
                .get("table_html")
                .and_then(|h| h.as_str())
                .map(str::to_string);
            AgentReply { primary_text: content, table_html }
        }
        Ok(parsed) => {
            let primary = parsed
                .get("content")
                .and_then(|c| c.as_str())
                .map(str::to_string)
                .unwrap_or(content);
            AgentReply { primary_text: primary, table_html: None }
        }
        Err(_) => AgentReply { primary_text: content, table_html: None },
    }
}
