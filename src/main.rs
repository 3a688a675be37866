use std::sync::Arc;
use axum::{
    extract::State,
    routing::{get, Router},
    Json,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::{error, info};

use rainbow_forum::{
    config::Config,
    error::AppError,
    repository,
    services::{HttpLinkChecker, PostService},
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenv::dotenv().ok();

    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| "rainbow_forum=debug,tower_http=debug".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rainbow-Forum service...");

    let config = Config::from_env()?;

    // 初始化存储后端
    let repo = match repository::connect(&config).await {
        Ok(repo) => {
            info!("{} storage ready", config.storage_backend);
            repo
        }
        Err(e) => {
            error!("Failed to initialize {} storage: {}", config.storage_backend, e);
            return Err(anyhow::anyhow!("Storage initialization failed"));
        }
    };

    let link_checker = Arc::new(HttpLinkChecker::new(config.link_check_timeout())?);
    let post_service = PostService::new(repo, link_checker, &config);

    // 创建应用状态
    let app_state = Arc::new(AppState {
        config: config.clone(),
        post_service,
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // 启动主服务器
    let addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Starting server on http://{}", addr);

    axum::Server::bind(&addr.parse()?)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn index() -> &'static str {
    "Rainbow-Forum is running!"
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let repo = state.post_service.repository();
    repo.verify_connection().await?;

    Ok(Json(json!({
        "status": "ok",
        "storage": repo.backend().to_string(),
        "environment": state.config.environment,
    })))
}
