//! 统一的错误处理，返回给 RPC 客户端。
use thiserror::Error;
use tonic::{Code, Status};

pub type AppResult<T> = Result<T, AppError>;

/// 客户端可能从服务端收到的所有错误。每个变体的消息都属于协议的一部分：
/// 客户端通过 [`AppError::from_status`] 把 status 映射回这些类型。
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppError {
    #[error("ostord: key is not provided")]
    NilKey,
    #[error("ostord: data is not provided")]
    NilData,
    #[error("ostord: key is not found")]
    KeyNotFound,
    #[error("ostord: database operation failed")]
    Database,
    #[error("ostord: object data is corrupted")]
    ObjectDataCorrupted,
    #[error("ostord: no label given")]
    NilLabel,
    #[error("ostord: no JWT token given")]
    NilToken,
    #[error("ostord: method support not implemented")]
    Unimplemented,
    #[error("ostord: JWT token does not permit requested action")]
    PermissionDenied,
}

impl AppError {
    const ALL: [AppError; 9] = [
        AppError::NilKey,
        AppError::NilData,
        AppError::KeyNotFound,
        AppError::Database,
        AppError::ObjectDataCorrupted,
        AppError::NilLabel,
        AppError::NilToken,
        AppError::Unimplemented,
        AppError::PermissionDenied,
    ];

    pub fn code(self) -> Code {
        match self {
            AppError::NilKey | AppError::NilData => Code::InvalidArgument,
            AppError::KeyNotFound => Code::NotFound,
            AppError::Database => Code::Internal,
            AppError::ObjectDataCorrupted => Code::DataLoss,
            AppError::NilLabel | AppError::NilToken => Code::Unauthenticated,
            AppError::Unimplemented => Code::Unimplemented,
            AppError::PermissionDenied => Code::PermissionDenied,
        }
    }

    /// 从客户端收到的 status 还原服务端错误类型。
    /// 并非来自 [`AppError`] 的 status 返回 `None`。
    pub fn from_status(status: &Status) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.code() == status.code() && status.message() == e.to_string())
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}
