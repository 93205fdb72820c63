use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use quiver::cache::{ExactCache, SemanticCache};
use quiver::config::{Config, ProviderKind};
use quiver::embedding::EmbeddingClient;
use quiver::pipeline::{
    DispatchStage, ExactCacheStage, Pipeline, SemanticDispatchStage, StageEntry,
};
use quiver::provider::{Anthropic, Google, OpenAiCompat, Provider, Registry};
use quiver::qdrant::QdrantClient;
use quiver::server::{self, AppState, VECTOR_SIZE};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::var("QUIVER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/config.yaml"));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(path = %config_path.display(), error = %err, "failed to load config");
            std::process::exit(1);
        }
    };

    let registry = Registry::new();
    for pc in &config.providers {
        let provider: Arc<dyn Provider> = match pc.kind {
            ProviderKind::Openai => Arc::new(OpenAiCompat::new(
                &pc.name,
                &pc.base_url,
                &pc.api_key,
                pc.models.clone(),
            )),
            ProviderKind::Anthropic => Arc::new(Anthropic::new(
                &pc.name,
                &pc.base_url,
                &pc.api_key,
                pc.models.clone(),
            )),
            ProviderKind::Google => Arc::new(Google::new(
                &pc.name,
                &pc.base_url,
                &pc.api_key,
                pc.models.clone(),
            )),
        };
        registry.register(provider);
        tracing::info!(name = %pc.name, models = ?pc.models, "registered provider");
    }
    registry.freeze();
    let registry = Arc::new(registry);

    let exact_cache = config.cache.exact.enabled.then(|| {
        tracing::info!(
            ttl_seconds = config.cache.exact.ttl,
            max_entries = config.cache.exact.max_entries,
            "exact cache enabled"
        );
        Arc::new(ExactCache::new(
            Duration::from_secs(config.cache.exact.ttl),
            config.cache.exact.max_entries,
        ))
    });

    let dispatch = Arc::new(DispatchStage::new(registry));

    // Final stage: either the semantic race wrapping dispatch, or bare
    // dispatch when the semantic cache is disabled or unreachable.
    let mut qdrant = None;
    let mut final_stage = StageEntry::both(dispatch.clone());
    if config.cache.semantic.enabled {
        let semantic_config = &config.cache.semantic;
        let client = Arc::new(QdrantClient::new(
            &semantic_config.qdrant_url,
            &semantic_config.qdrant_api_key,
            &semantic_config.qdrant_collection,
        ));

        let ensure = tokio::time::timeout(
            Duration::from_secs(5),
            client.ensure_collection(VECTOR_SIZE),
        )
        .await;
        match ensure {
            Ok(Ok(())) => {
                let embedder = EmbeddingClient::new(
                    &semantic_config.embedding_url,
                    &semantic_config.embedding_key,
                    &semantic_config.embedding_model,
                );
                let semantic = Arc::new(SemanticCache::new(
                    embedder,
                    (*client).clone(),
                    semantic_config.threshold,
                ));
                final_stage =
                    StageEntry::both(Arc::new(SemanticDispatchStage::new(semantic, dispatch)));
                qdrant = Some(client);
                tracing::info!(
                    threshold = semantic_config.threshold,
                    qdrant_url = %semantic_config.qdrant_url,
                    embedding_model = %semantic_config.embedding_model,
                    "semantic cache enabled"
                );
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "failed to ensure vector collection, semantic cache disabled");
            }
            Err(_) => {
                tracing::warn!("vector collection setup timed out, semantic cache disabled");
            }
        }
    }

    let mut stages = Vec::new();
    if let Some(cache) = exact_cache.as_ref() {
        stages.push(StageEntry::both(Arc::new(ExactCacheStage::new(
            cache.clone(),
            true,
        ))));
    }
    stages.push(final_stage);

    let mut state = AppState::new(Arc::new(Pipeline::new(stages)));
    if let Some(cache) = exact_cache {
        state = state.with_exact_cache(cache);
    }
    if let Some(client) = qdrant {
        state = state.with_qdrant(client);
    }

    let app = server::router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(port = config.server.port, "starting quiver proxy");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server error");
        std::process::exit(1);
    }
    tracing::info!("server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutting down server");
}
