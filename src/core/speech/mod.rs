pub mod gemini;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

/// Longest text spoken verbatim; anything longer falls back to a notice.
const AUDIO_TEXT_LIMIT: usize = 400;

const TRUNCATION_NOTICE: &str = "... View the full results for more details.";
const TOO_LONG_NOTICE: &str =
    "The response is too long for audio playback. Please read the text response for details.";

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// Pick what gets spoken for a response: the summary for table data
/// (truncated past the limit), the full text when short enough, otherwise a
/// fixed too-long notice.
pub fn prepare_audio_text(formatted: &Value, primary_text: &str) -> String {
    if formatted.get("type").and_then(|t| t.as_str()) == Some("table_data") {
        let summary = formatted
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or("Data retrieved from database");
        if summary.chars().count() > AUDIO_TEXT_LIMIT {
            let truncated: String = summary.chars().take(AUDIO_TEXT_LIMIT).collect();
            format!("{}{}", truncated, TRUNCATION_NOTICE)
        } else {
            summary.to_string()
        }
    } else if primary_text.chars().count() <= AUDIO_TEXT_LIMIT {
        primary_text.to_string()
    } else {
        TOO_LONG_NOTICE.to_string()
    }
}

/// Wrap raw 16-bit PCM samples in a minimal WAV container.
pub fn wav_from_pcm16(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample / 8);
    let block_align = channels * (bits_per_sample / 8);
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn table_data_speaks_the_summary() {
        let formatted = json!({"type": "table_data", "summary": "I found 2 records."});
        assert_eq!(
            prepare_audio_text(&formatted, "ignored"),
            "I found 2 records."
        );
    }

    #[test]
    fn missing_summary_uses_the_default_line() {
        let formatted = json!({"type": "table_data"});
        assert_eq!(
            prepare_audio_text(&formatted, "ignored"),
            "Data retrieved from database"
        );
    }

    #[test]
    fn long_summaries_are_truncated_with_a_notice() {
        let formatted = json!({"type": "table_data", "summary": "x".repeat(500)});
        let spoken = prepare_audio_text(&formatted, "ignored");
        assert!(spoken.starts_with(&"x".repeat(400)));
        assert!(spoken.ends_with(TRUNCATION_NOTICE));
        assert_eq!(spoken.chars().count(), 400 + TRUNCATION_NOTICE.chars().count());
    }

    #[test]
    fn short_text_responses_are_spoken_verbatim() {
        let formatted = json!({"type": "text", "content": "Hello!"});
        assert_eq!(prepare_audio_text(&formatted, "Hello!"), "Hello!");
    }

    #[test]
    fn long_text_responses_become_the_too_long_notice() {
        let formatted = json!({"type": "text"});
        let long = "y".repeat(401);
        assert_eq!(prepare_audio_text(&formatted, &long), TOO_LONG_NOTICE);
    }

    #[test]
    fn boundary_length_text_is_still_spoken() {
        let formatted = json!({"type": "text"});
        let exact = "z".repeat(400);
        assert_eq!(prepare_audio_text(&formatted, &exact), exact);
    }

    #[test]
    fn wav_header_fields_are_correct() {
        let pcm = vec![0u8; 48_000];
        let wav = wav_from_pcm16(&pcm, 24_000, 1);
        assert_eq!(wav.len(), 44 + pcm.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 36 + 48_000);
        assert_eq!(&wav[8..12], b"WAVE");
        // Sample rate at offset 24, byte rate at 28.
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 24_000);
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 48_000);
        assert_eq!(&wav[36..40], b"data");
    }
}
