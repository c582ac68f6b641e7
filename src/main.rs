use std::sync::Arc;

use anyhow::Context;
use config::load_config;
use domain::DeploymentService;
use infra::{crypto::AesGcmCipher, kubernetes::KubeConnector, memory::MemoryRepository, web::router};
use log::info;
use tokio::net::TcpListener;

mod config;
mod domain;
mod infra;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Start Rokku - application deployments on your Kubernetes clusters");

    let config = load_config()?;
    info!("Loaded config {:?}", config);
    let key = Arc::new(config.encryption_key()?);

    let service = Arc::new(DeploymentService::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(AesGcmCipher),
        Arc::new(KubeConnector),
        key,
        config.settings(),
    ));

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("Can't listen on {}", config.listen_address))?;
    info!("Listening on {}", config.listen_address);
    axum::serve(listener, router(service)).await?;
    Ok(())
}
