use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modelgate::api::{self, AppState};
use modelgate::auth::Authenticator;
use modelgate::cache::TieredCache;
use modelgate::config;
use modelgate::crypto::MasterKeyCrypto;
use modelgate::metrics::PrometheusRecorder;
use modelgate::pipeline::Pipeline;
use modelgate::providers::embeddings::{
    EmbeddingProvider, MockEmbeddingProvider, OpenAiEmbeddingProvider,
};
use modelgate::providers::ProviderRegistry;
use modelgate::store::postgres::PgStore;

#[derive(Parser)]
#[command(name = "modelgate", about = "Governance gateway for LLM requests")]
struct Cli {
    /// Listen port; overrides GATEWAY_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "modelgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = Cli::parse();
    let port = args.port.unwrap_or(cfg.port);

    // Startup probe: an unreachable database is a non-zero exit, not a
    // degraded boot.
    tracing::info!("connecting to database...");
    let store = PgStore::connect(&cfg.database_url).await?;
    tracing::info!("running migrations...");
    store.migrate().await?;

    // Redis is the degraded-mode dependency: boot continues local-only
    tracing::info!("connecting to redis...");
    let redis = match redis::Client::open(cfg.redis_url.as_str()) {
        Ok(client) => match redis::aio::ConnectionManager::new(client).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!("redis unavailable, credential cache is local-only: {}", e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("invalid REDIS_URL, credential cache is local-only: {}", e);
            None
        }
    };
    let cache = TieredCache::new(redis);

    let providers = Arc::new(ProviderRegistry::from_config(&cfg));
    let embedding_providers: Vec<Arc<dyn EmbeddingProvider>> = vec![
        Arc::new(OpenAiEmbeddingProvider::new(cfg.openai_api_url.clone())),
        Arc::new(MockEmbeddingProvider),
    ];
    let metrics = Arc::new(PrometheusRecorder::new());

    let store = Arc::new(store);
    let mut pipeline = Pipeline::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        providers,
        metrics,
    )
    .with_embedding_providers(embedding_providers);

    if let Ok(crypto) = MasterKeyCrypto::new(&cfg.master_key) {
        pipeline = pipeline.with_encryption(Arc::new(crypto));
    } else {
        tracing::warn!("master key is not a valid 32-byte hex key; 'enc:' keys pass through");
    }

    let state = Arc::new(AppState {
        pipeline: Arc::new(pipeline),
        auth: Authenticator::new(cache, store),
    });

    let app = api::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("modelgate listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Injects a unique X-Request-Id into every response so clients can
/// correlate errors with gateway logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if resp.headers().get("x-request-id").is_none() {
        if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
            resp.headers_mut().insert("x-request-id", val);
        }
    }
    resp
}
