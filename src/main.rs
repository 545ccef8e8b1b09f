/// canvasflow server entry point
///
/// Loads configuration from the environment and starts the workflow scheduler:
/// - Execution API at /v1/workflow/*
/// - Canvas API at /v1/canvas/{id}
/// - Health check at /healthz

use canvasflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
