//! 基于 RocksDB 乐观事务数据库的嵌入式 KV 引擎。
//!
//! 数据目录存放 table 文件以及大 value 被移出后所在的 blob 文件。RocksDB
//! 把两者放在同一路径下，因此 table 中的 key 也在数据目录里。元数据目录存放
//! WAL、MANIFEST、OPTIONS 和 LOG 文件。

mod item;
mod sequence;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rocksdb::{
    DBPath, ErrorKind, MultiThreaded, OptimisticTransactionDB, OptimisticTransactionOptions,
    Options, WriteOptions,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::keys;

pub use item::{Item, ItemStream};
use sequence::SequenceCache;

type RawDb = OptimisticTransactionDB<MultiThreaded>;

/// 不小于该大小的 value 会从 LSM 树移到 blob 文件中。
const MIN_BLOB_SIZE: u64 = 256;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("nil key given")]
    NilKey,
    #[error("key not found")]
    NotFound,
    #[error("transaction conflict, retry")]
    Conflict,
    #[error("database is closed")]
    Closed,
    #[error("item is already closed")]
    ClosedItem,
    #[error("sequence lease at {0:?} is not a u64")]
    InvalidLease(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RocksDB internal error: {0}")]
    RocksDb(rocksdb::Error),
}

impl From<rocksdb::Error> for DbError {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            ErrorKind::Busy | ErrorKind::TryAgain => DbError::Conflict,
            _ => DbError::RocksDb(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub meta_dir: PathBuf,
    /// 为 false 时每次提交都会在返回前 fsync。
    pub async_write: bool,
}

/// 原始数据库以及所有写操作共用的写选项。
pub(crate) struct Store {
    db: RawDb,
    write_opts: WriteOptions,
}

impl Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// 对单个 key 读-改-写，只要提交（或 `f` 本身）报告冲突就一直重试。
    pub(crate) fn update<F>(&self, key: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<Vec<u8>>,
    {
        loop {
            match self.try_update(key, &mut f) {
                Err(DbError::Conflict) => {
                    tracing::trace!(key = %String::from_utf8_lossy(key), "update conflict, retrying");
                }
                res => return res,
            }
        }
    }

    fn try_update<F>(&self, key: &[u8], f: &mut F) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<Vec<u8>>,
    {
        let txn = self
            .db
            .transaction_opt(&self.write_opts, &OptimisticTransactionOptions::default());
        let old = txn.get_for_update(key, true)?;
        let new = f(old.as_deref())?;
        txn.put(key, new)?;
        txn.commit()?;
        Ok(())
    }
}

pub struct Engine {
    store: Arc<Store>,
    sequences: SequenceCache,
    closed: AtomicBool,
}

impl Engine {
    pub fn open(config: &EngineConfig) -> Result<Self> {
        create_dir(&config.data_dir)?;
        create_dir(&config.meta_dir)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_wal_dir(&config.meta_dir);
        opts.set_db_paths(&[DBPath::new(&config.data_dir, u64::MAX)?]);
        opts.set_enable_blob_files(true);
        opts.set_min_blob_size(MIN_BLOB_SIZE);
        opts.enable_statistics();

        let db = RawDb::open(&opts, &config.meta_dir)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(!config.async_write);

        let store = Arc::new(Store { db, write_opts });
        tracing::info!(
            data_dir = %config.data_dir.display(),
            meta_dir = %config.meta_dir.display(),
            async_write = config.async_write,
            "database opened"
        );
        Ok(Self {
            sequences: SequenceCache::new(store.clone()),
            store,
            closed: AtomicBool::new(false),
        })
    }

    fn store(&self) -> Result<&Store> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(&self.store)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        self.store()?.get(key)?.ok_or(DbError::NotFound)
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        Ok(self.store()?.db.get_pinned(key)?.is_some())
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        let store = self.store()?;
        store.db.put_opt(key, value, &store.write_opts)?;
        Ok(())
    }

    /// 删除 `key`，key 不存在不视为错误。
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        let store = self.store()?;
        store.db.delete_opt(key, &store.write_opts)?;
        Ok(())
    }

    /// 原子地把 `key` 上的值替换为 `f(old)`。
    ///
    /// 其他写者并发修改同一个 key 时 `f` 可能被调用多次，除了记录结果外
    /// 不应有副作用。`f` 返回 [`DbError::Conflict`] 同样会重试。
    pub fn update<F>(&self, key: &[u8], f: F) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> Result<Vec<u8>>,
    {
        check_key(key)?;
        self.store()?.update(key, f)
    }

    /// 把 `value` 写到 `scope || next_index(scope)` 并返回该 key。
    pub fn set_scoped(&self, scope: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        check_key(scope)?;
        let store = self.store()?;
        let index = self.sequences.next(scope)?;
        let key = keys::scoped_key(scope, index);
        store.db.put_opt(&key, value, &store.write_opts)?;
        Ok(key)
    }

    /// 按引擎顺序流式返回所有以 `prefix` 开头的 key。
    ///
    /// 必须在 tokio runtime 内调用。单个条目的协议见 [`Item`]。
    pub fn list_items(&self, cancel: CancellationToken, prefix: &[u8]) -> Result<ItemStream> {
        self.store()?;
        Ok(item::spawn_listing(self.store.clone(), cancel, prefix.to_vec()))
    }

    /// `prefix` 下的 key 数量，与前缀完全相等的 key 不计入。
    pub fn count_keys(&self, prefix: &[u8]) -> Result<u64> {
        let store = self.store()?;
        let mut iter = store.db.raw_iterator();
        iter.seek(prefix);
        let mut count = 0u64;
        while let Some(key) = iter.key() {
            if !key.starts_with(prefix) {
                break;
            }
            if key.len() > prefix.len() {
                count += 1;
            }
            iter.next();
        }
        iter.status()?;
        Ok(count)
    }

    /// 读取 RocksDB 属性，例如 `rocksdb.stats`。
    pub fn property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.store()?.db.property_value(name)?)
    }

    /// 对全部 key 范围做 compaction，回收已删除 value 占用的空间。
    pub fn compact(&self) -> Result<()> {
        let store = self.store()?;
        store.db.compact_range(None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    /// 归还所有缓存的序列区间并 flush，之后拒绝任何操作。重复调用无害。
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sequences.purge();
        self.store.db.flush()?;
        tracing::info!("database closed");
        Ok(())
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(DbError::NilKey);
    }
    Ok(())
}

fn create_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o774);
    }
    builder.create(dir)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn open_temp() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::open(&EngineConfig {
        data_dir: dir.path().join("data"),
        meta_dir: dir.path().join("meta"),
        async_write: true,
    })
    .expect("open engine");
    (dir, engine)
}
