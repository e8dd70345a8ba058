use crate::app::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use ferry_routing::{OutcomeReport, RequestFacts, RouteError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// 代理层的选路请求
#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub service: String,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub affinity_token: Option<String>,
    /// 调用方剩余预算（毫秒）
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// 代理层的结果上报
#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub endpoint: String,
    pub success: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// 为一次请求选择目标端点
pub async fn select_target(
    State(state): State<AppState>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let facts = RequestFacts {
        client_ip: request.client_ip,
        headers: request.headers,
        cookies: request.cookies,
        affinity_token: request.affinity_token,
        deadline: request
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms)),
    };

    match state.router.select_target(&request.service, &facts) {
        Ok(target) => Ok(Json(json!({
            "endpoint": target.endpoint.key,
            "cluster": target.endpoint.cluster,
            "address": target.endpoint.address,
            "weight": target.endpoint.weight,
            "pool": target.pool_kind,
            "selection_time_us": target.selection_time.as_micros(),
        }))),
        Err(error) => {
            debug!("Routing failed for '{}': {}", request.service, error);
            Err(route_error_response(error))
        }
    }
}

/// 上报转发结果（被动健康信号）
pub async fn report_outcome(
    State(state): State<AppState>,
    Json(request): Json<OutcomeRequest>,
) -> Json<Value> {
    let outcome = if request.success {
        OutcomeReport::Success {
            latency: Duration::from_millis(request.latency_ms.unwrap_or(0)),
        }
    } else {
        OutcomeReport::Failure {
            error: request.error.unwrap_or_else(|| "unknown error".to_string()),
        }
    };

    state.router.report_outcome(&request.endpoint, outcome);

    Json(json!({ "status": "recorded" }))
}

/// 路由错误到HTTP状态码的映射；引擎只返回类型化结果，
/// 对客户端可见的语义由这里决定
fn route_error_response(error: RouteError) -> (StatusCode, Json<Value>) {
    let status = match &error {
        RouteError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
        RouteError::ServiceDisabled(_) => StatusCode::FORBIDDEN,
        RouteError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        RouteError::AllTiersExhausted { .. } | RouteError::PoolExhausted { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };

    (
        status,
        Json(json!({
            "error": error.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}
