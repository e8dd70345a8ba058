use crate::app::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::{
    health::{detailed_health_check, simple_health_check},
    monitoring::{get_affinity_stats, get_monitoring_info},
    route::{report_outcome, select_target},
};

/// 创建应用路由
pub fn create_app_router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(detailed_health_check))
        .route("/monitoring", get(get_monitoring_info))
        .route("/monitoring/affinity", get(get_affinity_stats))
        .nest("/v1", create_v1_routes())
        .layer(TraceLayer::new_for_http())
}

/// 创建 v1 API 路由（代理层使用的决策接口）
fn create_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/select", post(select_target))
        .route("/outcome", post(report_outcome))
        .route("/health", get(simple_health_check))
}

/// 首页处理器
pub async fn index() -> &'static str {
    "Ferry - Traffic Routing & Failover Gateway"
}
