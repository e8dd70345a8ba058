use crate::router::router::create_app_router;
use ferry_core::config::loader::{get_config_path, load_config};
use ferry_routing::RoutingService;

use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 应用状态，包含路由服务
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RoutingService>,
}

impl AppState {
    /// 创建新的应用状态
    pub async fn new() -> Result<Self> {
        // 加载配置
        let config = load_config()?;
        info!(
            "Configuration loaded successfully from: {}",
            get_config_path()
        );

        // 创建并启动路由服务
        let router = Arc::new(RoutingService::new(config)?);
        router.start().await?;
        info!("Routing service started");

        Ok(Self { router })
    }

    /// 停止应用
    pub async fn shutdown(&self) {
        info!("Shutting down application...");
        self.router.stop().await;
        info!("Application shutdown complete");
    }
}

/// 创建应用路由
pub fn create_app(state: AppState) -> Router {
    create_app_router().with_state(state)
}

/// 启动应用服务器
pub async fn start_server() -> Result<AppState> {
    // 初始化日志 - 完全依赖RUST_LOG环境变量
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Ferry gateway server...");

    let app_state = AppState::new().await?;
    let app = create_app(app_state.clone());

    let bind_addr =
        std::env::var("FERRY_LISTEN").unwrap_or_else(|_| "0.0.0.0:7400".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Ferry gateway listening on {}", bind_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(app_state)
}
