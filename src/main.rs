use std::sync::Arc;

use anyhow::Result;
use code_awareness_api::{
    analyzer,
    api::{self, AppState},
    editor::LocalEditor,
    transport::InMemoryTransport,
    Config, GraphService,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "code_awareness_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let transport = Arc::new(InMemoryTransport::new(config.outbound_log_capacity));
    if config.builtin_analyzer {
        analyzer::install(&transport);
        info!("Built-in analyzer enabled");
    }
    let editor = Arc::new(LocalEditor::new());
    let service = GraphService::start(config.clone(), transport.clone(), editor.clone());

    let app = api::router(AppState {
        service: service.clone(),
        transport,
        editor,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("code-awareness-api listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    service.dispose();
    Ok(())
}
