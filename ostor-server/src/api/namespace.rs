use ostor_core::keys;
use tonic::{Request, Response, Status};

use crate::error::AppResult;
use crate::logging::RpcLog;
use crate::pb::namespace_manager_server::NamespaceManager;
use crate::pb::{GetNamespaceRequest, GetNamespaceResponse};

use super::{AppState, blocking, database_error, ensure_namespace, request_label};

pub struct NamespaceApi {
    state: AppState,
}

impl NamespaceApi {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    async fn get(
        &self,
        log: &RpcLog,
        request: Request<GetNamespaceRequest>,
    ) -> AppResult<GetNamespaceResponse> {
        let label = request_label(&request)?;
        log.record_label(&label);

        let scope = keys::data_scope_key(label.as_bytes());
        let engine = self.state.engine.clone();
        let (db_label, db_scope) = (label.clone(), scope.clone());
        let nr_objects = blocking(log, move || {
            ensure_namespace(&engine, &db_label)?;
            engine.count_keys(&db_scope)
        })
        .await?
        .map_err(|e| database_error(log, &scope, e))?;

        let (reads, writes) = self.state.stats.rate(&label);
        Ok(GetNamespaceResponse {
            label,
            nr_objects: saturating_i64(nr_objects),
            read_request_per_hour: saturating_i64(reads),
            write_request_per_hour: saturating_i64(writes),
        })
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[tonic::async_trait]
impl NamespaceManager for NamespaceApi {
    async fn get_namespace(
        &self,
        request: Request<GetNamespaceRequest>,
    ) -> Result<Response<GetNamespaceResponse>, Status> {
        let log = RpcLog::new("GetNamespace");
        let result = self.get(&log, request).await;
        log.finish(result.map(Response::new).map_err(Status::from))
    }
}
