use anyhow::Result;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::state::ConversationState;
use crate::core::llm::{ChatMessage, LanguageModel};

/// Strip a leading ```json / ``` fence and a trailing ``` fence, if present.
pub fn strip_code_fences(raw: &str) -> String {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim().to_string()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => "N/A".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Deterministic HTML rendering of row objects. Column order follows the
/// first row's key order; rows missing a key render as N/A.
pub fn render_html_table(data: &[Value]) -> String {
    let headers: Vec<String> = data
        .iter()
        .find_map(|row| row.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();

    let mut html = String::from("<table class=\"table table-striped\">\n<thead>\n<tr>");
    for header in &headers {
        html.push_str("<th>");
        html.push_str(&escape_html(header));
        html.push_str("</th>");
    }
    html.push_str("</tr>\n</thead>\n<tbody>\n");

    for row in data {
        let Some(obj) = row.as_object() else { continue };
        html.push_str("<tr>");
        for header in &headers {
            html.push_str("<td>");
            let text = obj.get(header).map(cell_text).unwrap_or_else(|| "N/A".to_string());
            html.push_str(&escape_html(&text));
            html.push_str("</td>");
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>");
    html
}

fn format_prompt(
    patient_id: &str,
    question: &str,
    raw_result: &str,
    executed_query: &str,
    tables: &[String],
) -> String {
    let tables_json = serde_json::to_string(tables).unwrap_or_else(|_| "[]".to_string());
    let tables_list = tables.join(", ");
    format!(
        r#"You are a health informatics assistant helping doctors analyze patient data. You have received raw query results from a database.

Patient ID: {patient_id}
Original Question: {question}
Raw query result: {raw_result}
Query executed: {executed_query}
Tables queried: {tables_list}

Your task is to create a user-friendly response with two parts:
1. A brief summary that doctors can quickly read
2. Detailed table data that can be viewed on demand

Return a JSON object with this structure:
{{
    "type": "table_data",
    "summary": "Brief, conversational summary of findings (2-3 sentences)",
    "data_source": "Which table(s) and what type of data was found",
    "record_count": "Number of records found",
    "key_insights": ["2-3 bullet points of key findings"],
    "data": [array of objects with column names as keys],
    "table_html": "HTML table representation",
    "explanation": "Brief medical context or interpretation if relevant",
    "schema_info": {{
        "tables": {tables_json},
        "query": "{executed_query}"
    }}
}}

Guidelines for summary:
- Start with "I found [X] records in the [table name] showing..."
- Mention date ranges, key treatments, or notable patterns
- Keep it conversational and doctor-friendly
- Highlight any important medical findings

Guidelines for data processing:
- Convert datetime values to readable date strings (YYYY-MM-DD format)
- Handle None/null values as "N/A" or appropriate empty values
- Use clear, readable column names (Treatment, Date, Disease Type, etc.)
- Each row should be an object with consistent keys
- Sort by date if applicable

IMPORTANT: Return ONLY the JSON object, no markdown formatting, no code blocks, no extra text."#
    )
}

/// Fallback payload when the model's output is not parseable JSON.
fn unparseable_payload(
    cleaned: &str,
    parse_error: &str,
    patient_id: &str,
    tables: &[String],
    executed_query: &str,
) -> Value {
    json!({
        "type": "table_data",
        "summary": format!("Found data in {} table(s) for patient {}", tables.join(", "), patient_id),
        "data_source": format!("Tables: {}", tables.join(", ")),
        "data": [],
        "content": cleaned,
        "original_query": executed_query,
        "tables": tables,
        "parse_error": parse_error,
    })
}

/// Fallback payload when the formatting model call itself failed.
fn model_failure_payload(raw: &str, error: &str, patient_id: &str, tables: &[String]) -> Value {
    json!({
        "type": "table_data",
        "summary": format!("Found data for patient {} in {} table(s)", patient_id, tables.join(", ")),
        "data_source": format!("Tables: {}", tables.join(", ")),
        "data": [],
        "content": format!("Query result: {}", raw),
        "error": format!("Formatting error: {}", error),
    })
}

/// Backfill the fields the frontend relies on when the model omitted them.
fn finalize_payload(mut payload: Value, tables: &[String], executed_query: &str) -> Value {
    let Some(obj) = payload.as_object_mut() else {
        return payload;
    };

    if !obj.contains_key("type") {
        obj.insert("type".to_string(), json!("table_data"));
    }
    if !obj.contains_key("data") {
        obj.insert("data".to_string(), json!([]));
    }
    if !obj.contains_key("summary") {
        obj.insert(
            "summary".to_string(),
            json!(format!("Found data in {} table(s)", tables.join(", "))),
        );
    }
    if !obj.contains_key("schema_info") {
        obj.insert(
            "schema_info".to_string(),
            json!({"tables": tables, "query": executed_query}),
        );
    }

    let data_rows: Vec<Value> = obj
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default();

    if !obj.contains_key("table_html") && !data_rows.is_empty() {
        let table_html = render_html_table(&data_rows);
        obj.insert("table_html".to_string(), json!(table_html.clone()));
        obj.insert("html".to_string(), json!(table_html)); // frontend compatibility
    }
    if !obj.contains_key("record_count") && !data_rows.is_empty() {
        obj.insert("record_count".to_string(), json!(data_rows.len()));
    }

    payload
}

/// Turn the raw tuple text into the structured table_data payload, replacing
/// the raw entry with the formatted one. All failures recover locally.
pub async fn format_results(
    llm: &dyn LanguageModel,
    state: ConversationState,
    patient_id: &str,
) -> Result<ConversationState> {
    let raw = state.last_content().trim().to_string();
    let question = state.question().to_string();
    let tables = state.selected_tables().to_vec();
    let executed_query = state.executed_query().to_string();

    let prompt = format_prompt(patient_id, &question, &raw, &executed_query, &tables);
    let user = format!("Please analyze and format this patient data: {}", raw);

    let payload = match llm
        .generate(&[ChatMessage::system(prompt), ChatMessage::user(user)])
        .await
    {
        Ok(reply) => {
            let cleaned = strip_code_fences(&reply);
            match serde_json::from_str::<Value>(&cleaned) {
                Ok(parsed) if parsed.is_object() => {
                    info!("Formatter returned valid JSON");
                    finalize_payload(parsed, &tables, &executed_query)
                }
                Ok(_) => {
                    warn!("Formatter returned non-object JSON");
                    unparseable_payload(
                        &cleaned,
                        "expected a JSON object",
                        patient_id,
                        &tables,
                        &executed_query,
                    )
                }
                Err(e) => {
                    warn!("Formatter response was not valid JSON: {}", e);
                    unparseable_payload(
                        &cleaned,
                        &e.to_string(),
                        patient_id,
                        &tables,
                        &executed_query,
                    )
                }
            }
        }
        Err(e) => {
            warn!("Error in formatting call: {}", e);
            model_failure_payload(&raw, &e.to_string(), patient_id, &tables)
        }
    };

    let serialized = serde_json::to_string(&payload)?;
    Ok(state.replace_last(ChatMessage::assistant(serialized)))
}
