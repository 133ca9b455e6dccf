use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{routing::get, Router};
use market_bar_relay::{
    config::Config,
    history::{alpaca::AlpacaHistoryProvider, HistoryFetcher},
    registry::SubscriptionRegistry,
    relay::RelayServer,
    upstream::{alpaca::AlpacaFeedTransport, UpstreamConnector},
    web::{self, AppState},
};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;

    let transport = Arc::new(AlpacaFeedTransport::new(
        config.stock_ws_url.clone(),
        config.crypto_ws_url.clone(),
        config.alpaca_api_key.clone(),
        config.alpaca_secret_key.clone(),
    ));
    let (connector, bars) = UpstreamConnector::new(transport, config.reconnect_policy());

    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(connector.clone())));
    let dispatch_task = tokio::spawn(registry.clone().run_dispatch(bars));
    let relay = RelayServer::new(registry);

    let history_provider = AlpacaHistoryProvider::new(
        config.data_base_url.clone(),
        config.alpaca_api_key.clone(),
        config.alpaca_secret_key.clone(),
        config.request_timeout_ms,
    )
    .context("failed to build history provider")?;
    let history = Arc::new(HistoryFetcher::new(
        Arc::new(history_provider),
        config.fetch_limits(),
    ));

    let background_connector = connector.clone();
    tokio::spawn(async move {
        match background_connector.connect().await {
            Ok(()) => info!("upstream feeds connected"),
            Err(err) => tracing::error!(error = %err, "upstream feeds unavailable; serving history only"),
        }
    });

    let state = AppState::new(relay, connector.clone(), history);

    let app = Router::new()
        .route("/healthz", get(web::health))
        .route("/v1/bars", get(web::fetch_bars))
        .route("/v1/ws", get(web::bars_stream_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind tcp listener")?;

    info!(
        host = %config.host,
        port = config.port,
        stock_ws_url = %config.stock_ws_url,
        crypto_ws_url = %config.crypto_ws_url,
        data_base_url = %config.data_base_url,
        reconnect_max_attempts = config.reconnect_max_attempts,
        "server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    connector.shutdown().await;
    dispatch_task.abort();

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c signal");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal_stream) => {
                signal_stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for terminate signal");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
