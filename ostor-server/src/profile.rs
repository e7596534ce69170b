//! 可选的 HTTP 端点，暴露引擎与 namespace 统计信息。
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::{Router, routing::get};
use ostor_core::codec::decode_store_stat;
use ostor_core::db::{DbError, Engine};
use ostor_core::keys;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::api::AppState;

#[derive(Debug, Serialize)]
struct NamespaceRates {
    label: String,
    read_request_per_hour: u64,
    write_request_per_hour: u64,
}

#[derive(Debug, Serialize)]
struct StoreUsage {
    available: u64,
    used: u64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/debug/rocksdb", get(engine_stats))
        .route("/debug/namespaces/{label}", get(namespace_rates))
        .route("/debug/store", get(store_usage))
        .with_state(state)
}

type Rejection = (StatusCode, String);

/// 在 blocking 线程池中执行引擎调用，不占用 axum 的 worker 线程。
async fn on_engine<T, F>(state: &AppState, f: F) -> Result<T, Rejection>
where
    F: FnOnce(&Engine) -> T + Send + 'static,
    T: Send + 'static,
{
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn engine_stats(State(state): State<AppState>) -> Result<(StatusCode, String), Rejection> {
    let stats = on_engine(&state, |engine| engine.property("rocksdb.stats")).await?;
    Ok(match stats {
        Ok(Some(stats)) => (StatusCode::OK, stats),
        Ok(None) => (StatusCode::NOT_FOUND, "statistics unavailable".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    })
}

async fn namespace_rates(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Json<NamespaceRates> {
    let (reads, writes) = state.stats.rate(&label);
    Json(NamespaceRates {
        label,
        read_request_per_hour: reads,
        write_request_per_hour: writes,
    })
}

async fn store_usage(State(state): State<AppState>) -> Result<Json<StoreUsage>, Rejection> {
    let raw = on_engine(&state, |engine| engine.get(keys::STORE_STATS_KEY)).await?;
    let raw = raw.map_err(|e| match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "store statistics not computed".to_string()),
        e => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    })?;
    let stat = decode_store_stat(&raw)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(StoreUsage {
        available: stat.available,
        used: stat.used,
    }))
}

/// 在后台于 `addr` 上提供 profiling 路由。绑定失败只记录日志，
/// 不影响 gRPC 服务。
pub fn spawn(addr: String, state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "failed to enable profiling");
                return;
            }
        };
        tracing::info!(%addr, "profiling enabled");
        let shutdown = state.shutdown.clone();
        let app = build_router(state);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            tracing::warn!(error = %e, "profiling endpoint stopped");
        }
    })
}
