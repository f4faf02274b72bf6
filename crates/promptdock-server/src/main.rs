use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use promptdock_runtime::{
    ChatCompletionsClient, Config, RecordStore, RuntimeRegistry, Supervisor,
};
use promptdock_sandbox::ProcessEvaluatorFactory;
use promptdock_server::{build_router, AppState, ProxyTable};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,promptdock_server=info,promptdock_runtime=info")
        }))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    tracing::info!("loading config from {config_path}");
    let config = Config::load(&config_path)?;

    let model = Arc::new(ChatCompletionsClient::new(
        &config.llm_api_url,
        &config.llm_api_key,
        &config.llm_model,
    )?);
    let evaluators = Arc::new(ProcessEvaluatorFactory::new(config.interpreter_cmd.clone()));
    let proxy = Arc::new(ProxyTable::new());

    let supervisor = Arc::new(
        Supervisor::new(
            RuntimeRegistry::new(),
            model,
            evaluators,
            proxy.clone(),
            RecordStore::new(&config.executer_store),
            config.public_base_url(),
        )
        .with_retry_limit(config.retry_limit)
        .with_candidates(config.candidates),
    );
    let restored = supervisor.restore().await?;
    tracing::info!("registry rehydrated with {restored} stored records");

    let state = Arc::new(AppState {
        supervisor,
        proxy,
        public_base_url: config.public_base_url(),
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("promptdock listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
