use ostor_core::codec::{Object, decode_object, encode_object, validate_data};
use ostor_core::db::{DbError, ItemStream};
use ostor_core::keys;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::error::{AppError, AppResult};
use crate::logging::RpcLog;
use crate::pb::object_manager_server::ObjectManager;
use crate::pb::{
    CreateObjectRequest, CreateObjectResponse, DeleteObjectRequest, DeleteObjectResponse,
    GetObjectRequest, GetObjectResponse, GetObjectStatusRequest, GetObjectStatusResponse,
    ListObjectKeysRequest, ListObjectKeysResponse, ObjectStatus, SetObjectRequest,
    SetObjectResponse,
};

use super::{AppState, blocking, database_error, ensure_namespace, request_label};

pub type ListObjectKeysStream = ReceiverStream<Result<ListObjectKeysResponse, Status>>;

pub struct ObjectApi {
    state: AppState,
}

impl ObjectApi {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    async fn set(
        &self,
        log: &RpcLog,
        request: Request<SetObjectRequest>,
    ) -> AppResult<SetObjectResponse> {
        let label = request_label(&request)?;
        log.record_label(&label);
        let SetObjectRequest { key, data } = request.into_inner();
        if key.is_empty() {
            return Err(AppError::NilKey);
        }
        let record = encode_object(Object { data: &data }).map_err(|_| AppError::NilData)?;

        let key = keys::data_key(label.as_bytes(), &key);
        let engine = self.state.engine.clone();
        let db_key = key.clone();
        blocking(log, move || {
            ensure_namespace(&engine, &label)?;
            engine.set(&db_key, &record)
        })
        .await?
        .map_err(|e| database_error(log, &key, e))?;

        Ok(SetObjectResponse {})
    }

    async fn create(
        &self,
        log: &RpcLog,
        request: Request<CreateObjectRequest>,
    ) -> AppResult<CreateObjectResponse> {
        let label = request_label(&request)?;
        log.record_label(&label);
        let data = request.into_inner().data;
        let record = encode_object(Object { data: &data }).map_err(|_| AppError::NilData)?;

        let scope = keys::data_scope_key(label.as_bytes());
        let engine = self.state.engine.clone();
        let db_scope = scope.clone();
        let key = blocking(log, move || {
            ensure_namespace(&engine, &label)?;
            engine.set_scoped(&db_scope, &record)
        })
        .await?
        .map_err(|e| database_error(log, &scope, e))?;

        Ok(CreateObjectResponse {
            key: key[scope.len()..].to_vec(),
        })
    }

    async fn get(
        &self,
        log: &RpcLog,
        request: Request<GetObjectRequest>,
    ) -> AppResult<GetObjectResponse> {
        let key = object_key(log, &request, &request.get_ref().key)?;
        let engine = self.state.engine.clone();
        let db_key = key.clone();
        let raw = match blocking(log, move || engine.get(&db_key)).await? {
            Ok(raw) => raw,
            Err(DbError::NotFound) => return Err(AppError::KeyNotFound),
            Err(e) => return Err(database_error(log, &key, e)),
        };

        let object = decode_object(&raw).map_err(|e| {
            log.warn(&format!(
                "object {:?} failed validation: {e}",
                String::from_utf8_lossy(&key)
            ));
            AppError::ObjectDataCorrupted
        })?;
        Ok(GetObjectResponse {
            data: object.data.to_vec(),
        })
    }

    async fn delete(
        &self,
        log: &RpcLog,
        request: Request<DeleteObjectRequest>,
    ) -> AppResult<DeleteObjectResponse> {
        let key = object_key(log, &request, &request.get_ref().key)?;
        let engine = self.state.engine.clone();
        let db_key = key.clone();
        blocking(log, move || engine.delete(&db_key))
            .await?
            .map_err(|e| database_error(log, &key, e))?;
        Ok(DeleteObjectResponse {})
    }

    async fn status(
        &self,
        log: &RpcLog,
        request: Request<GetObjectStatusRequest>,
    ) -> AppResult<GetObjectStatusResponse> {
        let key = object_key(log, &request, &request.get_ref().key)?;
        let engine = self.state.engine.clone();
        let db_key = key.clone();
        let status = match blocking(log, move || engine.get(&db_key)).await? {
            Ok(raw) if validate_data(&raw).is_ok() => ObjectStatus::Ok,
            Ok(_) => ObjectStatus::Corrupted,
            Err(DbError::NotFound) => ObjectStatus::Missing,
            Err(e) => return Err(database_error(log, &key, e)),
        };
        Ok(GetObjectStatusResponse {
            status: status.into(),
        })
    }

    fn list(
        &self,
        log: RpcLog,
        request: Request<ListObjectKeysRequest>,
    ) -> AppResult<ListObjectKeysStream> {
        let label = request_label(&request)?;
        log.record_label(&label);

        let prefix = keys::data_scope_key(label.as_bytes());
        let cancel = self.state.shutdown.child_token();
        let items = self
            .state
            .engine
            .list_items(cancel.clone(), &prefix)
            .map_err(|e| database_error(&log, &prefix, e))?;

        let (out, rx) = mpsc::channel(1);
        tokio::spawn(run_list_pipeline(
            items,
            prefix.len(),
            self.state.job_count,
            cancel,
            out,
            log,
        ));
        Ok(ReceiverStream::new(rx))
    }
}

/// 单对象请求的 label 和 key，组合成数据 key。
fn object_key<T>(log: &RpcLog, request: &Request<T>, key: &[u8]) -> AppResult<Vec<u8>> {
    let label = request_label(request)?;
    log.record_label(&label);
    if key.is_empty() {
        return Err(AppError::NilKey);
    }
    Ok(keys::data_key(label.as_bytes(), key))
}

fn cancelled() -> Status {
    Status::cancelled("ostord: list operation cancelled")
}

/// 把一次 ListObjectKeys 调用的生产者和消费者作为一组驱动：
/// 第一个失败会取消两者，并返回给客户端。
async fn run_list_pipeline(
    items: ItemStream,
    prefix_len: usize,
    job_count: usize,
    cancel: CancellationToken,
    out: mpsc::Sender<Result<ListObjectKeysResponse, Status>>,
    log: RpcLog,
) {
    let (tx, rx) = mpsc::channel(job_count);
    let mut group = JoinSet::new();
    group.spawn(produce_keys(items, prefix_len, tx, cancel.clone(), log.clone()));
    group.spawn(forward_keys(rx, out.clone(), cancel.clone()));

    let mut outcome = Ok(());
    let mut panicked = None;
    while let Some(joined) = group.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                panicked.get_or_insert(e.into_panic());
                Err(Status::from(AppError::Database))
            }
            Err(_) => Err(cancelled()),
        };
        if let Err(status) = result {
            cancel.cancel();
            if outcome.is_ok() {
                outcome = Err(status);
            }
        }
    }
    // 生产者提前结束时释放引擎的 listing
    cancel.cancel();

    match outcome {
        Ok(()) => log.finish_ok(),
        Err(status) => {
            log.finish_err(&status);
            let _ = out.send(Err(status)).await;
        }
    }
    if let Some(payload) = panicked {
        std::panic::resume_unwind(payload);
    }
}

/// 去掉每个列出 key 的 label 前缀后交给消费者。拉取下一个条目之前
/// 先关闭当前条目。
async fn produce_keys(
    mut items: ItemStream,
    prefix_len: usize,
    tx: mpsc::Sender<ListObjectKeysResponse>,
    cancel: CancellationToken,
    log: RpcLog,
) -> Result<(), Status> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            next = items.next() => next,
        };
        let Some(item) = next else {
            // token 触发时 listing 同样结束
            return if cancel.is_cancelled() {
                Err(cancelled())
            } else {
                Ok(())
            };
        };
        let item = item.map_err(|e| Status::from(database_error(&log, b"", e)))?;

        let key = item.key();
        if key.len() < prefix_len {
            panic!(
                "listed key {:?} is shorter than its prefix",
                String::from_utf8_lossy(key)
            );
        }
        if key.len() == prefix_len {
            log.warn(&format!(
                "skipping listed key {:?}, it equals the prefix",
                String::from_utf8_lossy(key)
            ));
            continue;
        }
        let resp = ListObjectKeysResponse {
            key: key[prefix_len..].to_vec(),
        };
        item.close()
            .map_err(|e| Status::from(database_error(&log, &resp.key, e)))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            sent = tx.send(resp) => {
                if sent.is_err() {
                    // 消费者已退出，由它报告原因
                    return Ok(());
                }
            }
        }
    }
}

/// 把产出的 key 写入响应流。响应流只有一个发送端，响应不会交错。
async fn forward_keys(
    mut rx: mpsc::Receiver<ListObjectKeysResponse>,
    out: mpsc::Sender<Result<ListObjectKeysResponse, Status>>,
    cancel: CancellationToken,
) -> Result<(), Status> {
    loop {
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = out.closed() => return Err(cancelled()),
            resp = rx.recv() => match resp {
                Some(resp) => resp,
                None => return Ok(()),
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            sent = out.send(Ok(resp)) => sent.map_err(|_| cancelled())?,
        }
    }
}

#[tonic::async_trait]
impl ObjectManager for ObjectApi {
    async fn set_object(
        &self,
        request: Request<SetObjectRequest>,
    ) -> Result<Response<SetObjectResponse>, Status> {
        let log = RpcLog::new("SetObject");
        let result = self.set(&log, request).await;
        log.finish(result.map(Response::new).map_err(Status::from))
    }

    async fn create_object(
        &self,
        request: Request<CreateObjectRequest>,
    ) -> Result<Response<CreateObjectResponse>, Status> {
        let log = RpcLog::new("CreateObject");
        let result = self.create(&log, request).await;
        log.finish(result.map(Response::new).map_err(Status::from))
    }

    async fn get_object(
        &self,
        request: Request<GetObjectRequest>,
    ) -> Result<Response<GetObjectResponse>, Status> {
        let log = RpcLog::new("GetObject");
        let result = self.get(&log, request).await;
        log.finish(result.map(Response::new).map_err(Status::from))
    }

    async fn delete_object(
        &self,
        request: Request<DeleteObjectRequest>,
    ) -> Result<Response<DeleteObjectResponse>, Status> {
        let log = RpcLog::new("DeleteObject");
        let result = self.delete(&log, request).await;
        log.finish(result.map(Response::new).map_err(Status::from))
    }

    async fn get_object_status(
        &self,
        request: Request<GetObjectStatusRequest>,
    ) -> Result<Response<GetObjectStatusResponse>, Status> {
        let log = RpcLog::new("GetObjectStatus");
        let result = self.status(&log, request).await;
        log.finish(result.map(Response::new).map_err(Status::from))
    }

    type ListObjectKeysStream = ListObjectKeysStream;

    async fn list_object_keys(
        &self,
        request: Request<ListObjectKeysRequest>,
    ) -> Result<Response<Self::ListObjectKeysStream>, Status> {
        let log = RpcLog::new("ListObjectKeys");
        // 流结束后由 pipeline 记录完成日志
        match self.list(log.clone(), request) {
            Ok(stream) => Ok(Response::new(stream)),
            Err(err) => log.finish(Err(Status::from(err))),
        }
    }
}
