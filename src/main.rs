use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agentcom::{
    api::ApiServer,
    config::Config,
    hub::Hub,
    llm::HttpLlmTransport,
};

#[derive(Parser)]
#[command(name = "agentcom", about = "Agent coordination hub")]
struct Cli {
    /// Start with autonomous transitions paused.
    #[arg(long)]
    paused: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("starting AgentCom hub");

    let config = Config::load()?;
    let llm = Arc::new(HttpLlmTransport::new(config.llm.clone()));
    let hub = Hub::new(config.clone(), llm).await?;
    if cli.paused {
        hub.pause().await;
        info!("hub started paused; resume via POST /hub/resume");
    }

    let api_server = ApiServer::new(config, hub.clone());

    tokio::select! {
        result = hub.clone().run() => {
            if let Err(e) = result {
                tracing::error!("hub loop failed: {e}");
            }
        }
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("control surface failed: {e}");
            }
        }
    }

    Ok(())
}
