use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{SpeechSynthesizer, Transcriber, wav_from_pcm16};
use crate::core::llm::gemini::GEMINI_API_BASE;

pub const STT_MODEL: &str = "gemini-2.0-flash";
pub const TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";

const TRANSCRIPTION_SYSTEM: &str =
    "You are a transcription assistant. Your job is to transform the content of audio into text.";
const TRANSCRIPTION_PROMPT: &str = "Generate a transcript of the speech.";
const DEFAULT_PCM_RATE: u32 = 24_000;

#[derive(Serialize)]
struct SpeechRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<RequestContent>,
    contents: Vec<RequestContent>,
    generation_config: SpeechGenerationConfig,
}

#[derive(Serialize)]
struct RequestContent {
    role: String,
    parts: Vec<RequestPart>,
}

#[derive(Serialize)]
struct RequestPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct SpeechGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Serialize)]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Deserialize)]
struct SpeechResponse {
    #[serde(default)]
    candidates: Vec<SpeechCandidate>,
}

#[derive(Deserialize)]
struct SpeechCandidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "inlineData")]
    inline_data: Option<ResponseInlineData>,
}

#[derive(Deserialize)]
struct ResponseInlineData {
    #[serde(default, rename = "mimeType")]
    mime_type: Option<String>,
    data: String,
}

/// Sample rate encoded in an audio mime type like
/// `audio/L16;codec=pcm;rate=24000`.
fn pcm_rate(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(DEFAULT_PCM_RATE)
}

/// Speech-to-text and text-to-speech over the Gemini generateContent API.
pub struct GeminiSpeech {
    api_key: String,
    stt_model_id: String,
    tts_model_id: String,
    voice: String,
    base_url: String,
    client: Client,
}

impl GeminiSpeech {
    pub fn new(api_key: String, voice: String) -> Self {
        Self {
            api_key,
            stt_model_id: STT_MODEL.to_string(),
            tts_model_id: TTS_MODEL.to_string(),
            voice,
            base_url: GEMINI_API_BASE.to_string(),
            client: Client::new(),
        }
    }

    /// Point the provider at a different endpoint (local mock servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post(&self, model_id: &str, req: &SpeechRequest) -> Result<SpeechResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model_id, self.api_key
        );
        let res = self.client.post(&url).json(req).send().await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Google Gemini API Error: {}",
                res.text().await.unwrap_or_default()
            ));
        }
        Ok(res.json().await?)
    }
}

#[async_trait]
impl Transcriber for GeminiSpeech {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        let req = SpeechRequest {
            system_instruction: Some(RequestContent {
                role: "user".to_string(),
                parts: vec![RequestPart {
                    text: Some(TRANSCRIPTION_SYSTEM.to_string()),
                    inline_data: None,
                }],
            }),
            contents: vec![RequestContent {
                role: "user".to_string(),
                parts: vec![
                    RequestPart {
                        text: Some(TRANSCRIPTION_PROMPT.to_string()),
                        inline_data: None,
                    },
                    RequestPart {
                        text: None,
                        inline_data: Some(InlineData {
                            mime_type: mime_type.to_string(),
                            data: encoded,
                        }),
                    },
                ],
            }],
            generation_config: SpeechGenerationConfig {
                temperature: Some(0.0),
                max_output_tokens: Some(1000),
                response_modalities: None,
                speech_config: None,
            },
        };

        let parsed = self.post(&self.stt_model_id, &req).await?;
        let transcript = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        info!("Transcribed {} byte(s) of audio", audio.len());
        Ok(transcript)
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiSpeech {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let req = SpeechRequest {
            system_instruction: None,
            contents: vec![RequestContent {
                role: "user".to_string(),
                parts: vec![RequestPart { text: Some(text.to_string()), inline_data: None }],
            }],
            generation_config: SpeechGenerationConfig {
                temperature: None,
                max_output_tokens: None,
                response_modalities: Some(vec!["AUDIO"]),
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                }),
            },
        };

        let parsed = self.post(&self.tts_model_id, &req).await?;
        let inline = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().find_map(|p| p.inline_data))
            .ok_or_else(|| anyhow!("Speech synthesis returned no audio data"))?;

        let pcm = base64::engine::general_purpose::STANDARD.decode(inline.data)?;
        let rate = inline.mime_type.as_deref().map(pcm_rate).unwrap_or(DEFAULT_PCM_RATE);
        Ok(Bytes::from(wav_from_pcm16(&pcm, rate, 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_parsed_from_the_mime_type() {
        assert_eq!(pcm_rate("audio/L16;codec=pcm;rate=24000"), 24_000);
        assert_eq!(pcm_rate("audio/L16; rate=16000"), 16_000);
        assert_eq!(pcm_rate("audio/L16"), DEFAULT_PCM_RATE);
        assert_eq!(pcm_rate("audio/L16;rate=bogus"), DEFAULT_PCM_RATE);
    }

    #[test]
    fn inline_audio_response_deserializes() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [{
                        "inlineData": {
                            "mimeType": "audio/L16;codec=pcm;rate=24000",
                            "data": "AAECAw=="
                        }
                    }]
                }
            }]
        });
        let parsed: SpeechResponse = serde_json::from_value(raw).unwrap();
        let inline = parsed.candidates[0]
            .content
            .as_ref()
            .unwrap()
            .parts[0]
            .inline_data
            .as_ref()
            .unwrap();
        assert_eq!(inline.mime_type.as_deref(), Some("audio/L16;codec=pcm;rate=24000"));
        assert_eq!(inline.data, "AAECAw==");
    }
}
