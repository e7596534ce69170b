//! gRPC 接口的 handler 测试与端到端测试。


use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use ostor_core::auth::{JwtVerifier, NopVerifier, TokenVerifier};
use ostor_core::db::{Engine, EngineConfig};
use ostor_core::stats::NamespaceStats;
use serde::Serialize;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::Request;
use tonic::transport::Channel;

use crate::api::AppState;

pub(crate) const PUBLIC_KEY: &str = include_str!("../../../ostor-core/testdata/es384_public.pem");
const PRIVATE_KEY: &str = include_str!("../../../ostor-core/testdata/es384_private.pem");

pub(crate) const LABEL: &str = "org_0stor_ns";

#[derive(Serialize)]
struct Claims<'a> {
    scope: &'a [&'a str],
    exp: i64,
}

/// 携带 `scope` 的 ES384 token，有效期一小时。
pub(crate) fn sign_token(scope: &[&str]) -> String {
    let key = EncodingKey::from_ec_pem(PRIVATE_KEY.as_bytes()).unwrap();
    let claims = Claims {
        scope,
        exp: Utc::now().timestamp() + 3600,
    };
    encode(&Header::new(Algorithm::ES384), &claims, &key).unwrap()
}

pub(crate) fn jwt_verifier() -> Arc<dyn TokenVerifier> {
    Arc::new(JwtVerifier::new(PUBLIC_KEY.as_bytes()).unwrap())
}

/// 在临时目录中新建引擎和状态。
pub(crate) fn test_state(job_count: usize) -> (TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(&EngineConfig {
        data_dir: dir.path().join("data"),
        meta_dir: dir.path().join("meta"),
        async_write: true,
    })
    .unwrap();
    let state = AppState::new(Arc::new(engine), Arc::new(NamespaceStats::new()), job_count);
    (dir, state)
}

pub(crate) fn labeled<T>(message: T, label: &str) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert("label", label.parse().unwrap());
    request
}

pub(crate) fn authorized<T>(message: T, label: &str, token: &str) -> Request<T> {
    let mut request = labeled(message, label);
    request
        .metadata_mut()
        .insert("authorization", format!("Bearer {token}").parse().unwrap());
    request
}

/// 绑定在本地临时端口上的服务。
pub(crate) struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
    _dir: TempDir,
}

impl TestServer {
    pub async fn start(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self::start_with_jobs(verifier, 4).await
    }

    pub async fn without_auth() -> Self {
        Self::start(Arc::new(NopVerifier)).await
    }

    pub async fn start_with_jobs(verifier: Arc<dyn TokenVerifier>, job_count: usize) -> Self {
        let (dir, state) = test_state(job_count);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(crate::server::serve(
            state.clone(),
            verifier,
            4 * 1024 * 1024,
            listener,
            async move {
                let _ = stopped.await;
            },
        ));
        Self {
            addr,
            state,
            stop: Some(stop),
            handle,
            _dir: dir,
        }
    }

    pub async fn channel(&self) -> Channel {
        Channel::from_shared(format!("http://{}", self.addr))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    /// 通知服务关闭，不等待。
    pub fn trigger_shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// 关闭服务，等待其退出并关闭引擎。
    pub async fn stop(mut self) {
        self.trigger_shutdown();
        let served = tokio::time::timeout(std::time::Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked");
        served.expect("server failed");
        self.state.engine.close().unwrap();
    }
}
