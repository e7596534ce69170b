use std::time::Instant;

use tonic::Status;
use tracing::Span;

/// 初始化全局日志 subscriber。
///
/// 设置了 `RUST_LOG` 时以其为准，否则为 `info`，`debug` 为 true 时为 `debug`。
pub fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // 测试或嵌入方可能已经安装过 subscriber，避免 panic
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

/// 单次 RPC 的 span，记录请求 id、方法名和 namespace label。
#[derive(Clone, Debug)]
pub struct RpcLog {
    span: Span,
    started_at: Instant,
}

impl RpcLog {
    pub fn new(method: &'static str) -> Self {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "ostor_rpc",
            request_id = %request_id,
            method = method,
            label = tracing::field::Empty
        );

        Self {
            span,
            started_at: Instant::now(),
        }
    }

    /// handler 取到 label 之后填入。
    pub fn record_label(&self, label: &str) {
        self.span.record("label", label);
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(parent: &self.span, "{msg}");
    }

    pub fn error(&self, msg: &str) {
        tracing::error!(parent: &self.span, "{msg}");
    }

    pub fn finish_ok(&self) {
        let ms = self.started_at.elapsed().as_millis();
        tracing::debug!(parent: &self.span, elapsed_ms = ms, "rpc finished: ok");
    }

    pub fn finish_err(&self, status: &Status) {
        let ms = self.started_at.elapsed().as_millis();
        tracing::warn!(
            parent: &self.span,
            elapsed_ms = ms,
            grpc_code = ?status.code(),
            grpc_message = status.message(),
            "rpc finished: err"
        );
    }

    /// 记录 handler 的结果并原样返回。
    pub fn finish<T>(&self, result: Result<T, Status>) -> Result<T, Status> {
        match &result {
            Ok(_) => self.finish_ok(),
            Err(status) => self.finish_err(status),
        }
        result
    }
}
