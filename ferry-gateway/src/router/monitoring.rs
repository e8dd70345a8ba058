use crate::app::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

/// 获取系统监控信息
pub async fn get_monitoring_info(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let service_stats = state.router.service_health();
    let affinity_stats = state.router.affinity_stats();
    let snapshot = state.router.health_snapshot();
    let config = state.router.get_config();

    let response = json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": {
            "is_running": state.router.is_running().await,
            "configured_services": config.get_available_services(),
            "snapshot_version": snapshot.version,
        },
        "services": service_stats.iter().map(|(service, stats)| {
            json!({
                "service": service,
                "healthy_endpoints": stats.healthy_endpoints,
                "degraded_endpoints": stats.degraded_endpoints,
                "unhealthy_endpoints": stats.unhealthy_endpoints,
                "total_endpoints": stats.total_endpoints,
                "health_ratio": stats.health_ratio,
                "is_healthy": stats.is_healthy(),
                "average_latency_ms": stats.average_latency_ms,
            })
        }).collect::<Vec<_>>(),
        "affinity": affinity_stats.iter().map(|(service, stats)| {
            json!({
                "service": service,
                "entries": stats.entries,
                "total_lookups": stats.total_lookups,
                "hits": stats.hits,
                "misses": stats.misses,
                "hit_rate": stats.hit_rate,
                "expired": stats.expired,
                "evictions": stats.evictions,
            })
        }).collect::<Vec<_>>(),
    });

    Ok(Json(response))
}

/// 获取亲和存储统计
pub async fn get_affinity_stats(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let affinity_stats = state.router.affinity_stats();

    Ok(Json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stores": affinity_stats,
    })))
}
