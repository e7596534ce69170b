//! `ObjectManager` 与 `NamespaceManager` 服务的 RPC handler。

mod namespace;
mod object;

use std::sync::Arc;

use ostor_core::codec::{Namespace, encode_namespace};
use ostor_core::db::{DbError, Engine};
use ostor_core::keys;
use ostor_core::stats::NamespaceStats;
use tokio_util::sync::CancellationToken;
use tonic::Request;

use crate::error::{AppError, AppResult};
use crate::logging::RpcLog;
use crate::middleware::LABEL_KEY;

pub use namespace::NamespaceApi;
pub use object::ObjectApi;

/// 所有 handler 共享的进程级状态。
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub stats: Arc<NamespaceStats>,
    /// 服务开始关闭时取消，list 流从它派生各自的 token。
    pub shutdown: CancellationToken,
    /// list pipeline 通道的容量。
    pub job_count: usize,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, stats: Arc<NamespaceStats>, job_count: usize) -> Self {
        Self {
            engine,
            stats,
            shutdown: CancellationToken::new(),
            job_count: job_count.max(1),
        }
    }
}

fn request_label<T>(request: &Request<T>) -> AppResult<String> {
    request
        .metadata()
        .get(LABEL_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| keys::is_valid_label(v.as_bytes()))
        .map(str::to_owned)
        .ok_or(AppError::NilLabel)
}

/// 在 async worker 之外执行阻塞的引擎调用。
async fn blocking<T, F>(log: &RpcLog, f: F) -> AppResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        log.error(&format!("engine task failed: {e}"));
        AppError::Database
    })
}

/// 记录引擎错误，客户端只会看到 [`AppError::Database`]。
fn database_error(log: &RpcLog, key: &[u8], err: DbError) -> AppError {
    log.error(&format!(
        "database error for {:?}: {err}",
        String::from_utf8_lossy(key)
    ));
    AppError::Database
}

/// 若 `label` 的 namespace 记录不存在，则写入一条空记录。
fn ensure_namespace(engine: &Engine, label: &str) -> Result<(), DbError> {
    let key = keys::namespace_key(label.as_bytes());
    if engine.exists(&key)? {
        return Ok(());
    }
    let Ok(record) = encode_namespace(Namespace {
        reserved: 0,
        label: label.as_bytes(),
    }) else {
        // 只有空 label 会编码失败，而空 label 到不了这里
        return Ok(());
    };
    engine.update(&key, |old| {
        Ok(old.map_or_else(|| record.clone(), <[u8]>::to_vec))
    })
}
