use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use verified_finance_pipeline::{agent::Orchestrator, api::start_server, config::PipelineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Loads .env as well
    let config = PipelineConfig::from_env()?;

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Verified analysis pipeline - API Server");
    info!(
        port = api_port,
        max_retries = config.max_retries,
        deadline_secs = config.deadline.as_secs(),
        isolation = ?config.sandbox.isolation,
        sandbox_slots = config.sandbox_slots,
        "Configuration loaded"
    );

    let orchestrator = Arc::new(Orchestrator::from_config(config)?);

    info!("Orchestrator initialized, starting API server");

    start_server(orchestrator, api_port).await?;

    Ok(())
}
