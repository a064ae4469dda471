use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::super::AppState;
use crate::core::agent::{QueryAgent, QueryAgentConfig};
use crate::core::speech::prepare_audio_text;

#[derive(serde::Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(serde::Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub formatted_response: serde_json::Value,
    pub audio_url: Option<String>,
}

fn error_response(status: StatusCode, detail: String) -> axum::response::Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

pub async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> axum::response::Response {
    info!("Chat request received");

    let agent = QueryAgent::new(state.llm.clone(), state.db.clone()).with_config(QueryAgentConfig {
        validate_queries: state.config.validate_queries,
    });

    let reply = match agent
        .run(&state.config.default_patient_id, &payload.message)
        .await
    {
        Ok(reply) => reply,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    // Agent output is normally a JSON document; anything else becomes a plain
    // text envelope so the frontend always has a `type` to render on.
    let formatted_response = match serde_json::from_str::<serde_json::Value>(&reply.primary_text) {
        Ok(parsed) if parsed.is_object() => parsed,
        _ => json!({
            "type": "text",
            "content": reply.primary_text,
            "html": reply.table_html,
        }),
    };

    let mut audio_url = None;
    if let Some(synthesizer) = state.synthesizer.as_ref() {
        let text_for_audio = prepare_audio_text(&formatted_response, &reply.primary_text);
        match synthesizer.synthesize(&text_for_audio).await {
            Ok(audio) => match write_audio_file(&state, &audio).await {
                Ok(filename) => {
                    audio_url = Some(format!("/api/v1/chat/audio/{}", filename));
                }
                Err(e) => warn!("Failed to save audio file: {}", e),
            },
            // Audio is best effort, the text reply still goes out.
            Err(e) => warn!("Speech synthesis failed: {}", e),
        }
    }

    Json(ChatResponse {
        message: reply.primary_text,
        formatted_response,
        audio_url,
    })
    .into_response()
}

async fn write_audio_file(state: &AppState, audio: &[u8]) -> anyhow::Result<String> {
    let filename = format!("chat-{}.wav", Uuid::new_v4());
    tokio::fs::create_dir_all(&state.config.audio_dir).await?;
    tokio::fs::write(state.config.audio_dir.join(&filename), audio).await?;
    Ok(filename)
}

fn is_safe_audio_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub async fn get_audio(
    Path(filename): Path<String>,
    State(state): State<AppState>,
) -> axum::response::Response {
    if !is_safe_audio_name(&filename) {
        return error_response(StatusCode::NOT_FOUND, "Audio file not found".to_string());
    }

    let path = state.config.audio_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&filename).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref())], bytes).into_response()
        }
        Err(_) => error_response(StatusCode::NOT_FOUND, "Audio file not found".to_string()),
    }
}

pub async fn transcribe_voice(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> axum::response::Response {
    let Some(transcriber) = state.transcriber.clone() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Transcription is not configured".to_string(),
        );
    };

    let mut upload: Option<(bytes::Bytes, String)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let mime_type = field.content_type().unwrap_or("audio/wav").to_string();
                match field.bytes().await {
                    Ok(data) => {
                        upload = Some((data, mime_type));
                        break;
                    }
                    Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
                }
            }
            Ok(None) => break,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }

    let Some((data, mime_type)) = upload else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing audio file upload".to_string(),
        );
    };

    info!("Transcribing {} bytes of {}", data.len(), mime_type);
    match transcriber.transcribe(&data, &mime_type).await {
        Ok(transcript) => Json(json!({ "transcript": transcript })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
