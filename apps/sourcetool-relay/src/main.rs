use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use sourcetool_pubsub::{PubSub, RedisPubSub};
use sourcetool_relay::auth::TokenAuthenticator;
use sourcetool_relay::bridge::start_bridge_ingest;
use sourcetool_relay::config::AppConfig;
use sourcetool_relay::group_pages::build_group_pages;
use sourcetool_relay::liveness::LivenessConfig;
use sourcetool_relay::metrics;
use sourcetool_relay::persistence;
use sourcetool_relay::registry::Registry;
use sourcetool_relay::router::ProtocolRouter;
use sourcetool_relay::routes;
use sourcetool_relay::state::AppState;
use sourcetool_relay::telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env().context("loading relay configuration")?;
    init_tracing(&cfg.log_filter);

    let persistence = persistence::build_persistence(&cfg).await;
    let pubsub: Option<Arc<dyn PubSub>> = match cfg.redis_url.as_deref() {
        Some(url) => match RedisPubSub::connect(url).await {
            Ok(bus) => Some(Arc::new(bus)),
            Err(err) => {
                warn!(error = %err, "REDIS_URL provided but pub/sub connect failed; running single-replica");
                None
            }
        },
        None => None,
    };

    let shutdown = CancellationToken::new();
    let registry = Registry::new(
        persistence.clone(),
        pubsub.clone(),
        LivenessConfig {
            ping_period: cfg.ping_period,
            write_wait: cfg.write_wait,
        },
    );
    let router = ProtocolRouter::new(
        registry.clone(),
        persistence.clone(),
        build_group_pages(cfg.edition),
    );
    let _ingest = match &pubsub {
        Some(bus) => start_bridge_ingest(Arc::clone(bus), registry, shutdown.clone())
            .await
            .context("subscribing to relay channels")?,
        None => Vec::new(),
    };
    let authenticator = Arc::new(TokenAuthenticator::new(
        persistence.clone(),
        cfg.jwt_secret.as_deref(),
    ));
    let app_state = AppState::new(
        cfg.relay_instance_id.clone(),
        router,
        authenticator,
        cfg.write_wait,
        shutdown.clone(),
    );
    let app: Router = routes::router(app_state);

    info!(
        addr = %cfg.bind_addr,
        instance = %cfg.relay_instance_id,
        persistence = persistence.backend(),
        pubsub = pubsub.is_some(),
        edition = ?cfg.edition,
        ping_period_secs = cfg.ping_period.as_secs(),
        write_wait_secs = cfg.write_wait.as_secs(),
        "starting sourcetool-relay"
    );
    metrics::BOOT_COUNTER.inc();
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await
        .context("serving http")?;
    Ok(())
}
