use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::Request;
use ostor_core::stats::NamespaceStats;
use tower::{Layer, Service};

use super::{Counter, label_header, stats_counter};

/// 把每个被处理的 RPC 计入其 label 的读或写速率。
///
/// 计数在 handler 返回后于独立任务中进行，不影响调用结果。
#[derive(Clone)]
pub struct StatsLayer {
    stats: Arc<NamespaceStats>,
}

impl StatsLayer {
    pub fn new(stats: Arc<NamespaceStats>) -> Self {
        Self { stats }
    }
}

impl<S> Layer<S> for StatsLayer {
    type Service = Stats<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Stats {
            inner,
            stats: self.stats.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Stats<S> {
    inner: S,
    stats: Arc<NamespaceStats>,
}

fn record(stats: &NamespaceStats, label: Option<&str>, path: &str) {
    let Some(label) = label else {
        tracing::warn!(path, "stat not recorded: no label given");
        return;
    };
    match stats_counter(path) {
        Some(Counter::Read) => stats.increment_read(label),
        Some(Counter::Write) => stats.increment_write(label),
        None => tracing::warn!(path, "stat not recorded: unknown method"),
    }
}

impl<S, ReqBody> Service<Request<ReqBody>> for Stats<S>
where
    S: Service<Request<ReqBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let label = label_header(req.headers()).map(str::to_owned);
        let path = req.uri().path().to_owned();
        let stats = self.stats.clone();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let result = inner.call(req).await;
            tokio::spawn(async move { record(&stats, label.as_deref(), &path) });
            result
        })
    }
}
