use crate::app::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

/// 简单健康检查处理器 - 服务自身的存活探测
pub async fn simple_health_check(State(state): State<AppState>) -> impl IntoResponse {
    let is_running = state.router.is_running().await;

    Json(json!({
        "status": if is_running { "ok" } else { "stopped" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// 详细健康检查处理器 - 返回每个服务和端点的健康状态
pub async fn detailed_health_check(State(state): State<AppState>) -> impl IntoResponse {
    let service_stats = state.router.service_health();
    let snapshot = state.router.health_snapshot();

    let services = service_stats
        .iter()
        .map(|(service, stats)| {
            json!({
                "service": service,
                "total_endpoints": stats.total_endpoints,
                "healthy_endpoints": stats.healthy_endpoints,
                "degraded_endpoints": stats.degraded_endpoints,
                "unhealthy_endpoints": stats.unhealthy_endpoints,
                "health_ratio": stats.health_ratio,
                "is_healthy": stats.is_healthy(),
                "average_latency_ms": stats.average_latency_ms,
            })
        })
        .collect::<Vec<_>>();

    let endpoints = snapshot
        .entries
        .iter()
        .map(|(key, view)| {
            json!({
                "endpoint": key,
                "state": view.state,
                "latency_ms": view.latency_ms,
                "consecutive_failures": view.consecutive_failures,
                "consecutive_successes": view.consecutive_successes,
            })
        })
        .collect::<Vec<_>>();

    let all_healthy = service_stats.values().all(|stats| stats.is_healthy());

    Json(json!({
        "status": if all_healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "is_running": state.router.is_running().await,
        "snapshot_version": snapshot.version,
        "services": services,
        "endpoints": endpoints,
    }))
}
