//! 中间件层，包裹每个 RPC：先鉴权，再统计。
//!
//! 两者都作用于原始 HTTP/2 请求，一元调用和流式调用共用同一实现。
//! RPC 通过请求路径 `/<package>.<Service>/<Method>` 识别。

pub mod auth;
pub mod stats;

use http::HeaderMap;
use ostor_core::auth::Method;
use ostor_core::keys;

pub use auth::AuthLayer;
pub use stats::StatsLayer;

/// 携带 namespace label 的 metadata key。
pub const LABEL_KEY: &str = "label";
/// 携带 bearer token 的 metadata key。
pub const AUTHORIZATION_KEY: &str = "authorization";

pub const OBJECT_SERVICE: &str = "ostor.ObjectManager";
pub const NAMESPACE_SERVICE: &str = "ostor.NamespaceManager";

fn split_path(path: &str) -> Option<(&str, &str)> {
    path.strip_prefix('/')?.split_once('/')
}

/// RPC 路径对应的权限类别，未知方法返回 `None`。
pub fn auth_method(path: &str) -> Option<Method> {
    match split_path(path)? {
        (OBJECT_SERVICE, "GetObject" | "GetObjectStatus" | "ListObjectKeys") => Some(Method::Read),
        (OBJECT_SERVICE, "SetObject" | "CreateObject") => Some(Method::Write),
        (OBJECT_SERVICE, "DeleteObject") => Some(Method::Delete),
        (NAMESPACE_SERVICE, "GetNamespace") => Some(Method::Admin),
        _ => None,
    }
}

/// RPC 计入哪一项 namespace 速率。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Read,
    Write,
}

pub fn stats_counter(path: &str) -> Option<Counter> {
    match split_path(path)? {
        (OBJECT_SERVICE, "GetObject" | "GetObjectStatus" | "ListObjectKeys") => Some(Counter::Read),
        (OBJECT_SERVICE, "SetObject" | "CreateObject" | "DeleteObject") => Some(Counter::Write),
        (NAMESPACE_SERVICE, "GetNamespace") => Some(Counter::Read),
        _ => None,
    }
}

/// 非空且为合法 UTF-8 的 header 值。
fn header_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// namespace label，缺失或不能作为 label 时返回 `None`。
pub fn label_header(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, LABEL_KEY).filter(|label| keys::is_valid_label(label.as_bytes()))
}

pub fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, AUTHORIZATION_KEY)
}
