//! 服务启动、运行与关闭。
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ostor_core::auth::{AuthError, JwtVerifier, NopVerifier, TokenVerifier};
use ostor_core::codec::{StoreStat, decode_namespace, encode_store_stat};
use ostor_core::db::{DbError, Engine, EngineConfig};
use ostor_core::disk::disk_space;
use ostor_core::keys;
use ostor_core::stats::NamespaceStats;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tower::util::option_layer;

use crate::api::{AppState, NamespaceApi, ObjectApi};
use crate::config::ServerConfig;
use crate::middleware::{AuthLayer, StatsLayer};
use crate::pb::namespace_manager_server::NamespaceManagerServer;
use crate::pb::object_manager_server::ObjectManagerServer;
use crate::profile;

/// 全量 compaction 的间隔。
pub const COMPACTION_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("namespace record at {key} is corrupted")]
    CorruptNamespace { key: String },
    #[error("failed to read free space of {}: {source}", path.display())]
    DiskSpace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("total reserved size ({reserved} bytes) exceeds available disk space ({free} bytes)")]
    NoSpace { reserved: u64, free: u64 },
    #[error("a JWT public key is required unless authorization is disabled")]
    MissingPublicKey,
    #[error("failed to read JWT public key {}: {source}", path.display())]
    ReadPublicKey {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JWT public key: {0}")]
    Verifier(#[from] AuthError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// 汇总所有 namespace 的预留空间，与数据目录的可用空间比较，
/// 并把结果写入存储统计 key。
pub async fn ensure_store_stat(engine: &Engine, data_dir: &Path) -> Result<StoreStat, StartupError> {
    let mut reserved = 0u64;
    let mut items = engine.list_items(CancellationToken::new(), keys::namespace_prefix())?;
    while let Some(item) = items.next().await {
        let item = item?;
        let value = item.value().await?;
        let namespace = decode_namespace(&value).map_err(|_| StartupError::CorruptNamespace {
            key: String::from_utf8_lossy(item.key()).into_owned(),
        })?;
        reserved = reserved.saturating_add(namespace.reserved);
        item.close()?;
    }

    let free = disk_space(data_dir)
        .map_err(|source| StartupError::DiskSpace {
            path: data_dir.to_path_buf(),
            source,
        })?
        .free_bytes;
    if free <= reserved {
        return Err(StartupError::NoSpace { reserved, free });
    }

    let stat = StoreStat {
        available: free - reserved,
        used: reserved,
    };
    engine.set(keys::STORE_STATS_KEY, &encode_store_stat(stat))?;
    tracing::info!(reserved, available = stat.available, "store statistics computed");
    Ok(stat)
}

pub fn build_verifier(config: &ServerConfig) -> Result<Arc<dyn TokenVerifier>, StartupError> {
    if config.no_auth {
        tracing::warn!("authorization disabled, don't use this mode in production");
        return Ok(Arc::new(NopVerifier));
    }
    let path = config
        .jwt_public_key
        .as_ref()
        .ok_or(StartupError::MissingPublicKey)?;
    let pem = std::fs::read(path).map_err(|source| StartupError::ReadPublicKey {
        path: path.clone(),
        source,
    })?;
    Ok(Arc::new(JwtVerifier::new(&pem)?))
}

/// 在 `listener` 上提供两个 gRPC 服务，直到 `shutdown` 完成。
///
/// `shutdown` 触发时先取消全局 cancellation token 以结束正在进行的 list 流，
/// 然后等待在途调用处理完毕。
pub async fn serve<F>(
    state: AppState,
    verifier: Arc<dyn TokenVerifier>,
    max_msg_bytes: usize,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), tonic::transport::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = state.shutdown.clone();
    let shutdown = async move {
        shutdown.await;
        token.cancel();
    };

    let objects = ObjectManagerServer::new(ObjectApi::new(state.clone()))
        .max_decoding_message_size(max_msg_bytes)
        .max_encoding_message_size(max_msg_bytes);
    let namespaces = NamespaceManagerServer::new(NamespaceApi::new(state.clone()))
        .max_decoding_message_size(max_msg_bytes)
        .max_encoding_message_size(max_msg_bytes);

    Server::builder()
        .layer(option_layer(AuthLayer::for_verifier(verifier)))
        .layer(StatsLayer::new(state.stats.clone()))
        .add_service(objects)
        .add_service(namespaces)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}

/// 每隔 `every` 做一次 compaction，直到 `cancel` 触发或引擎关闭。
pub fn spawn_compaction(
    engine: Arc<Engine>,
    cancel: CancellationToken,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // 第一次 tick 会立即完成
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let engine = engine.clone();
            match tokio::task::spawn_blocking(move || engine.compact()).await {
                Ok(Ok(())) => tracing::debug!("compaction finished"),
                Ok(Err(DbError::Closed)) => break,
                Ok(Err(e)) => tracing::warn!(error = %e, "compaction failed"),
                Err(e) => tracing::warn!(error = %e, "compaction task failed"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install the SIGINT handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("received SIGINT, shutting down gracefully");
}

/// 打开引擎，提供服务直到收到 SIGINT，然后关闭引擎。
pub async fn run(config: ServerConfig) -> Result<(), StartupError> {
    let limits = config.sanitize();
    let verifier = build_verifier(&config)?;

    let engine = Arc::new(Engine::open(&EngineConfig {
        data_dir: config.data_dir.clone(),
        meta_dir: config.meta_dir.clone(),
        async_write: config.async_write,
    })?);
    if let Err(e) = ensure_store_stat(&engine, &config.data_dir).await {
        let _ = engine.close();
        return Err(e);
    }

    let state = AppState::new(
        engine.clone(),
        Arc::new(NamespaceStats::new()),
        limits.job_count,
    );
    let shutdown = state.shutdown.clone();

    if !config.profile_addr.is_empty() {
        profile::spawn(config.profile_addr.clone(), state.clone());
    }
    let compaction = spawn_compaction(engine.clone(), shutdown.clone(), COMPACTION_INTERVAL);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(source) => {
            shutdown.cancel();
            let _ = engine.close();
            return Err(StartupError::Bind { addr, source });
        }
    };
    tracing::info!(%addr, "gRPC server listening");

    let served = serve(state, verifier, limits.max_msg_bytes, listener, shutdown_signal()).await;

    shutdown.cancel();
    let _ = compaction.await;
    tracing::info!("closing database");
    engine.close()?;
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use ostor_core::codec::{Namespace, decode_store_stat, encode_namespace};

    use super::*;

    fn open(dir: &Path) -> Engine {
        Engine::open(&EngineConfig {
            data_dir: dir.join("data"),
            meta_dir: dir.join("meta"),
            async_write: true,
        })
        .unwrap()
    }

    fn reserve(engine: &Engine, label: &str, reserved: u64) {
        let record = encode_namespace(Namespace {
            reserved,
            label: label.as_bytes(),
        })
        .unwrap();
        engine.set(&keys::namespace_key(label.as_bytes()), &record).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_stat_subtracts_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        reserve(&engine, "a_0stor_x", 1024);
        reserve(&engine, "b_0stor_y", 2048);

        let data_dir = dir.path().join("data");
        let stat = ensure_store_stat(&engine, &data_dir).await.unwrap();
        assert_eq!(stat.used, 3072);

        let free = disk_space(&data_dir).unwrap().free_bytes;
        // 期间其他进程可能改变可用空间
        assert!(stat.available <= free);

        let stored = engine.get(keys::STORE_STATS_KEY).unwrap();
        assert_eq!(decode_store_stat(&stored).unwrap(), stat);
        engine.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refuses_to_start_when_over_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        reserve(&engine, "a_0stor_x", u64::MAX);

        let err = ensure_store_stat(&engine, &dir.path().join("data"))
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::NoSpace { .. }), "{err}");
        assert!(matches!(
            engine.get(keys::STORE_STATS_KEY),
            Err(DbError::NotFound)
        ));
        engine.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_namespace_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.set(&keys::namespace_key(b"bad"), b"junk-record").unwrap();

        let err = ensure_store_stat(&engine, &dir.path().join("data"))
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::CorruptNamespace { .. }), "{err}");
        engine.close().unwrap();
    }

    #[test]
    fn verifier_selection() {
        let cfg = ServerConfig {
            no_auth: true,
            ..Default::default()
        };
        assert!(build_verifier(&cfg).unwrap().is_noop());

        let cfg = ServerConfig::default();
        assert!(matches!(
            build_verifier(&cfg),
            Err(StartupError::MissingPublicKey)
        ));

        let cfg = ServerConfig {
            jwt_public_key: Some(PathBuf::from(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../ostor-core/testdata/es384_public.pem"
            ))),
            ..Default::default()
        };
        assert!(!build_verifier(&cfg).unwrap().is_noop());
    }

    #[tokio::test]
    async fn compaction_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(open(dir.path()));
        let cancel = CancellationToken::new();
        let task = spawn_compaction(engine.clone(), cancel.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        engine.close().unwrap();
    }
}
