//! 单一有序 keyspace 中的 key 构造。
//!
//! | 记录             | key                      |
//! |------------------|--------------------------|
//! | 对象数据         | `<label>:d:<object_key>` |
//! | namespace 记录   | `@:<label>`              |
//! | 存储统计         | `$`                      |

const SEPARATOR: u8 = b':';
const DATA_INFIX: &[u8] = b":d:";
const NAMESPACE_PREFIX: &[u8] = b"@:";
const NAMESPACE_MARKER: &[u8] = b"@";

/// 进程级 [`StoreStat`](crate::codec::StoreStat) 记录的 key。
pub const STORE_STATS_KEY: &[u8] = b"$";

/// 各 scope 序列租约共用的前缀。通过数据 scope 列出的 key 不会以它开头。
pub const SEQUENCE_LEASE_PREFIX: &[u8] = b"__";

/// label 非空、不含 `:` 且不等于 `@`。满足该规则时，每个组合出的 key
/// 都只对应一条记录。
pub fn is_valid_label(label: &[u8]) -> bool {
    !label.is_empty() && !label.contains(&SEPARATOR) && label != NAMESPACE_MARKER
}

pub fn data_key(label: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = data_scope_key(label);
    out.extend_from_slice(key);
    out
}

/// `label` 下所有对象 key 的前缀。
pub fn data_scope_key(label: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + DATA_INFIX.len());
    out.extend_from_slice(label);
    out.extend_from_slice(DATA_INFIX);
    out
}

pub fn namespace_key(label: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NAMESPACE_PREFIX.len() + label.len());
    out.extend_from_slice(NAMESPACE_PREFIX);
    out.extend_from_slice(label);
    out
}

/// 所有 namespace 记录的前缀。
pub fn namespace_prefix() -> &'static [u8] {
    NAMESPACE_PREFIX
}

/// `scope` 的持久化序列租约所在的 key。
pub fn sequence_lease_key(scope: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEQUENCE_LEASE_PREFIX.len() + scope.len());
    out.extend_from_slice(SEQUENCE_LEASE_PREFIX);
    out.extend_from_slice(scope);
    out
}

/// `scope || index`，index 为小端序。
pub fn scoped_key(scope: &[u8], index: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(scope.len() + 8);
    out.extend_from_slice(scope);
    out.extend_from_slice(&index.to_le_bytes());
    out
}
