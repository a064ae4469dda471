use std::sync::Arc;

use anyhow::{Result, bail};
use console::style;

use crate::core::config::{AppConfig, DEFAULT_API_PORT};
use crate::core::db::{ClinicalDatabase, SqliteDatabase};
use crate::core::llm::LanguageModel;
use crate::core::llm::gemini::GeminiModel;
use crate::core::speech::gemini::GeminiSpeech;
use crate::core::speech::{SpeechSynthesizer, Transcriber};
use crate::interfaces::web::{ApiServer, AppState};
use crate::logging;

fn print_help() {
    println!();
    println!(
        " {} clinical database query agent",
        style("clinq").green().bold()
    );
    println!();
    println!(" {}", style("Commands").bold());
    println!("   serve    Start the HTTP API server (default)");
    println!("   ask      Answer a single question from the terminal");
    println!("   help     Show this help message");
    println!();
    println!(" {}", style("Options").bold());
    println!("   serve:  --api-host <host>  --api-port <port>");
    println!("   ask:    <question>  --question, -q <text>  --patient, -p <id>");
    println!();
    println!(
        " {} {} <command> [options]",
        style("Usage:").bold(),
        style("clinq").green()
    );
    println!();
}

fn print_error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AskCommandArgs {
    pub patient: Option<String>,
    pub question: String,
}

pub(crate) fn parse_ask_command_args(args: &[String], start: usize) -> AskCommandArgs {
    let mut patient = None;
    let mut question = String::new();
    let mut positional: Vec<String> = Vec::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--patient" | "-p" => {
                if i + 1 < args.len() {
                    patient = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--question" | "-q" => {
                if i + 1 < args.len() {
                    question = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }
    // Bare words after `ask` are the question unless -q was given.
    if question.is_empty() {
        question = positional.join(" ");
    }
    AskCommandArgs { patient, question }
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(DEFAULT_API_PORT);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

fn open_database(config: &AppConfig) -> Result<Arc<dyn ClinicalDatabase>> {
    let db = SqliteDatabase::open(&config.database_path)?;
    Ok(Arc::new(db))
}

async fn run_serve(args: &[String]) -> Result<()> {
    logging::init();

    let mut config = AppConfig::from_env();
    let (api_host, api_port) =
        parse_api_server_flags(args, 2, config.api_host.clone(), config.api_port);
    config.api_host = api_host;
    config.api_port = api_port;

    if config.google_api_key.is_empty() {
        bail!("GOOGLE_API_KEY must be set to start the server");
    }

    let db = open_database(&config)?;
    let llm: Arc<dyn LanguageModel> = Arc::new(GeminiModel::new(
        config.google_api_key.clone(),
        config.model_id.clone(),
    ));
    let speech = Arc::new(GeminiSpeech::new(
        config.google_api_key.clone(),
        config.tts_voice.clone(),
    ));
    let transcriber: Option<Arc<dyn Transcriber>> = Some(speech.clone());
    let synthesizer: Option<Arc<dyn SpeechSynthesizer>> = Some(speech);

    let state = AppState {
        llm,
        db,
        transcriber,
        synthesizer,
        config: Arc::new(config),
    };
    ApiServer::new(state).serve().await
}

async fn run_ask(args: &[String]) -> Result<()> {
    let parsed = parse_ask_command_args(args, 2);
    if parsed.question.is_empty() {
        print_error("Error: a question is required for ask mode.");
        print_help();
        return Ok(());
    }

    logging::init();

    let config = AppConfig::from_env();
    if config.google_api_key.is_empty() {
        bail!("GOOGLE_API_KEY must be set to ask questions");
    }
    let patient_id = parsed
        .patient
        .unwrap_or_else(|| config.default_patient_id.clone());

    let db = open_database(&config)?;
    let llm: Arc<dyn LanguageModel> = Arc::new(GeminiModel::new(
        config.google_api_key.clone(),
        config.model_id.clone(),
    ));

    let agent = crate::core::agent::QueryAgent::new(llm, db).with_config(
        crate::core::agent::QueryAgentConfig {
            validate_queries: config.validate_queries,
        },
    );
    let reply = agent.run(&patient_id, &parsed.question).await?;
    println!("{}", reply.primary_text);
    if let Some(html) = reply.table_html {
        eprintln!("{}", html);
    }
    Ok(())
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = if args.len() > 1 {
        args[1].as_str()
    } else {
        "serve"
    };

    match cmd {
        "serve" => run_serve(&args).await,
        "ask" => run_ask(&args).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_api_server_flags, parse_ask_command_args};

    #[test]
    fn parse_ask_command_args_reads_patient_and_question() {
        let args = vec![
            "clinq".to_string(),
            "ask".to_string(),
            "--patient".to_string(),
            "207".to_string(),
            "--question".to_string(),
            "show my latest treatment".to_string(),
        ];
        let parsed = parse_ask_command_args(&args, 2);
        assert_eq!(parsed.patient.as_deref(), Some("207"));
        assert_eq!(parsed.question, "show my latest treatment");
    }

    #[test]
    fn parse_ask_command_args_accepts_a_positional_question() {
        let args = vec![
            "clinq".to_string(),
            "ask".to_string(),
            "show".to_string(),
            "me".to_string(),
            "treatments".to_string(),
            "--patient".to_string(),
            "143".to_string(),
        ];
        let parsed = parse_ask_command_args(&args, 2);
        assert_eq!(parsed.question, "show me treatments");
        assert_eq!(parsed.patient.as_deref(), Some("143"));
    }

    #[test]
    fn parse_ask_command_args_defaults_patient_to_none() {
        let args = vec![
            "clinq".to_string(),
            "ask".to_string(),
            "-q".to_string(),
            "hello".to_string(),
        ];
        let parsed = parse_ask_command_args(&args, 2);
        assert!(parsed.patient.is_none());
        assert_eq!(parsed.question, "hello");
    }

    #[test]
    fn parse_api_server_flags_reads_host_and_port() {
        let args = vec![
            "clinq".to_string(),
            "serve".to_string(),
            "--api-host".to_string(),
            "0.0.0.0".to_string(),
            "--api-port".to_string(),
            "9000".to_string(),
        ];
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 8471);
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, 9000);
    }

    #[test]
    fn parse_api_server_flags_keeps_defaults_without_flags() {
        let args = vec!["clinq".to_string(), "serve".to_string()];
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 8471);
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8471);
    }
}
