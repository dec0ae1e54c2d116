//! Gateway server binary.
//!
//! Owns the process-wide state the library refuses to own as singletons:
//! the storage handle, the protocol factory, the session registry, and
//! the root cancellation scope.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use whatsapp_gateway::config::{Config, LogFormat};
use whatsapp_gateway::protocol::StubFactory;
use whatsapp_gateway::store::SqliteStore;
use whatsapp_gateway::subscriber::{ChatwootBridge, EventSubscriber, QrTerminal, WebhookBridge};
use whatsapp_gateway::SessionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config);

    let store = Arc::new(SqliteStore::open(&config.database_url).await?);
    tracing::info!(database = %config.database_url, "storage ready");

    // The stub backend simulates the wire protocol; a linked protocol
    // library plugs in behind the same factory trait.
    let protocol = Arc::new(StubFactory::new(store.clone()));

    let mut subscribers: Vec<Arc<dyn EventSubscriber>> = vec![Arc::new(QrTerminal)];
    if let Some(url) = &config.webhook_url {
        tracing::info!(url = %url, "webhook bridge enabled");
        subscribers.push(Arc::new(WebhookBridge::new(
            url.clone(),
            config.webhook_secret.clone(),
        )));
    }
    if let (Some(url), Some(token)) = (&config.chatwoot_url, &config.chatwoot_token) {
        tracing::info!(url = %url, "chatwoot bridge enabled");
        subscribers.push(Arc::new(ChatwootBridge::new(
            url.clone(),
            token.clone(),
            store.clone(),
        )));
    }

    let scope = CancellationToken::new();
    let registry = Arc::new(SessionRegistry::new(
        store,
        protocol,
        subscribers,
        scope.clone(),
    ));

    // Bring previously paired sessions back online before accepting
    // traffic.
    registry.restore_all().await;

    let app = whatsapp_gateway::http::router(Arc::clone(&registry), config.api_key.clone());
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(bind = %config.bind, "listening");

    let shutdown_scope = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown_scope.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { scope.cancelled().await })
        .await?;

    tracing::info!("gateway stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
