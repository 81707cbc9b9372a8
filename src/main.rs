use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use maddash::auth::{Role, TokenTable};
use maddash::clickhouse_client::ClickHouseStore;
use maddash::compare_config::ComparisonConfig;
use maddash::config::Config;
use maddash::implementations::InMemoryStore;
use maddash::server::{build_router, AppState};
use maddash::service::HistogramService;
use maddash::traits::DocumentStore;

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match &config.clickhouse {
        Some(settings) => {
            let store = ClickHouseStore::new(settings)
                .with_excluded_databases(config.excluded_databases.iter().cloned());
            store.init_schema().await?;
            info!("✅ ClickHouse schema ready at {}", store.url());
            Ok(Arc::new(store))
        }
        None => {
            warn!("⚠️  MAD_DASH_CLICKHOUSE_URL not set, histograms are kept in memory only");
            Ok(Arc::new(
                InMemoryStore::new().with_excluded_databases(config.excluded_databases.iter().cloned()),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .init();

    // Load configuration from environment variables
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("❌ Configuration error: {}", e);
            error!("💡 Please set the required environment variables:");
            error!("   - MAD_DASH_PRODUCTION_TOKEN: bearer token with write access");
            error!("   - MAD_DASH_WEB_TOKEN: bearer token with read-only access");
            error!("   - MAD_DASH_CLICKHOUSE_URL: ClickHouse server URL (optional, in-memory if unset)");
            error!("   - MAD_DASH_REST_HOST / MAD_DASH_REST_PORT (optional, default 127.0.0.1:8080)");
            std::process::exit(1);
        }
    };

    config.log_config();

    let store = open_store(&config).await?;
    let tokens = TokenTable::new()
        .with_token(config.production_token.clone(), Role::Production)
        .with_token(config.web_token.clone(), Role::Web);

    let app_state = Arc::new(AppState {
        service: HistogramService::new(store),
        tokens: Arc::new(tokens),
        comparison: ComparisonConfig::dashboard().with_test_timeout(config.test_timeout),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = build_router(app_state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Mad Dash REST server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
