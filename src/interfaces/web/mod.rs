pub mod handlers;
pub mod router;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::core::config::AppConfig;
use crate::core::db::ClinicalDatabase;
use crate::core::llm::LanguageModel;
use crate::core::speech::{SpeechSynthesizer, Transcriber};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub llm: Arc<dyn LanguageModel>,
    pub db: Arc<dyn ClinicalDatabase>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub config: Arc<AppConfig>,
}

/// HTTP front end for the query agent.
pub struct ApiServer {
    state: AppState,
    api_host: String,
    api_port: u16,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        let api_host = state.config.api_host.clone();
        let api_port = state.config.api_port;
        Self {
            state,
            api_host,
            api_port,
        }
    }

    /// Binds the listener and serves requests until the process exits.
    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.api_port);
        let app = router::build_api_router(self.state);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server on {addr}"))?;
        info!("API Server running at http://{addr}");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
