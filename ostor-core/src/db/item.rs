use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{DbError, Result, Store};

/// 某个前缀下条目的有序流。
pub type ItemStream = ReceiverStream<Result<Item>>;

enum Request {
    Value(oneshot::Sender<Result<Vec<u8>>>),
}

/// [`Engine::list_items`](super::Engine::list_items) 产出的一个 key。
///
/// 生产者会停在该条目上，直到它被关闭或 drop，因此一个流中同时最多只有
/// 一个存活的条目。只有 await [`Item::value`] 时才会从引擎读取 value。
pub struct Item {
    key: Vec<u8>,
    requests: mpsc::Sender<Request>,
}

impl Item {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// 读取该条目产出时迭代器所在位置的 value。
    pub async fn value(&self) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Value(tx))
            .await
            .map_err(|_| DbError::ClosedItem)?;
        rx.await.map_err(|_| DbError::ClosedItem)?
    }

    /// 释放条目，让生产者继续前进。
    pub fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("key", &String::from_utf8_lossy(&self.key))
            .finish()
    }
}

pub(super) fn spawn_listing(
    store: Arc<Store>,
    cancel: CancellationToken,
    prefix: Vec<u8>,
) -> ItemStream {
    let (tx, rx) = mpsc::channel(1);
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || produce(&store, &handle, &cancel, &prefix, tx));
    ReceiverStream::new(rx)
}

fn produce(
    store: &Store,
    handle: &Handle,
    cancel: &CancellationToken,
    prefix: &[u8],
    out: mpsc::Sender<Result<Item>>,
) {
    let mut iter = store.db.raw_iterator();
    iter.seek(prefix);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let key = match iter.key() {
            Some(key) if key.starts_with(prefix) => key.to_vec(),
            Some(_) => return,
            None => {
                if let Err(e) = iter.status() {
                    tracing::error!(error = %e, "listing iterator failed");
                    let _ = out.blocking_send(Err(e.into()));
                }
                return;
            }
        };

        let (req_tx, mut req_rx) = mpsc::channel(1);
        let item = Item {
            key,
            requests: req_tx,
        };
        let delivered = handle.block_on(async {
            tokio::select! {
                res = out.send(Ok(item)) => res.is_ok(),
                _ = cancel.cancelled() => false,
            }
        });
        if !delivered {
            return;
        }

        // 在消费者释放条目之前持续响应 value 请求
        loop {
            let request = handle.block_on(async {
                tokio::select! {
                    req = req_rx.recv() => req,
                    _ = cancel.cancelled() => None,
                }
            });
            match request {
                Some(Request::Value(reply)) => {
                    let value = iter.value().map(<[u8]>::to_vec).ok_or(DbError::ClosedItem);
                    let _ = reply.send(value);
                }
                None => break,
            }
        }

        iter.next();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;

    use crate::db::{DbError, Engine, EngineConfig, open_temp};

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_prefix_yields_nothing() {
        let (_dir, db) = open_temp();
        let mut stream = db.list_items(CancellationToken::new(), b"none").unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lists_keys_under_prefix() {
        let (_dir, db) = open_temp();
        db.set(b"a", b"1").unwrap();
        db.set(b"_b", b"2").unwrap();
        db.set(b"_c", b"3").unwrap();

        let mut stream = db.list_items(CancellationToken::new(), b"_").unwrap();
        let mut found = HashSet::new();
        while let Some(item) = stream.next().await {
            let item = item.unwrap();
            found.insert(item.key().to_vec());
            item.close().unwrap();
        }
        let expected: HashSet<Vec<u8>> = [b"_b".to_vec(), b"_c".to_vec()].into();
        assert_eq!(found, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn values_are_fetched_lazily() {
        let (_dir, db) = open_temp();
        for i in 0..5u8 {
            db.set(&[b'k', i], &[i; 3]).unwrap();
        }

        let mut stream = db.list_items(CancellationToken::new(), b"k").unwrap();
        let mut count = 0;
        while let Some(item) = stream.next().await {
            let item = item.unwrap();
            let i = item.key()[1];
            assert_eq!(item.value().await.unwrap(), vec![i; 3]);
            // 两次请求读到的是同一个迭代器位置
            assert_eq!(item.value().await.unwrap(), vec![i; 3]);
            drop(item);
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn producer_waits_for_item_release() {
        let (_dir, db) = open_temp();
        db.set(b"p1", b"x").unwrap();
        db.set(b"p2", b"x").unwrap();

        let mut stream = db.list_items(CancellationToken::new(), b"p").unwrap();
        let first = stream.next().await.unwrap().unwrap();

        // 第一个条目存活时不会产出第二个
        let pending = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(pending.is_err());

        first.close().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.key(), b"p2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_stops_the_producer() {
        let (_dir, db) = open_temp();
        for i in 0..100u8 {
            db.set(&[b'c', i], b"x").unwrap();
        }

        let cancel = CancellationToken::new();
        let mut stream = db.list_items(cancel.clone(), b"c").unwrap();
        let mut seen = 0;
        while let Some(item) = stream.next().await {
            drop(item.unwrap());
            seen += 1;
            if seen == 3 {
                cancel.cancel();
            }
        }
        // 取消后最多再收到一个已在途的条目
        assert!(seen <= 4, "saw {seen} items after cancelling at 3");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn value_after_cancel_reports_closed_item() {
        let (_dir, db) = open_temp();
        db.set(b"v1", b"x").unwrap();

        let cancel = CancellationToken::new();
        let mut stream = db.list_items(cancel.clone(), b"v").unwrap();
        let item = stream.next().await.unwrap().unwrap();
        cancel.cancel();
        // 生产者退出并 drop 请求接收端
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(item.value().await, Err(DbError::ClosedItem)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_the_stream_stops_the_producer() {
        let (dir, db) = open_temp();
        for i in 0..100u8 {
            db.set(&[b'd', i], b"x").unwrap();
        }

        let mut stream = db.list_items(CancellationToken::new(), b"d").unwrap();
        drop(stream.next().await.unwrap().unwrap());
        drop(stream);
        drop(db);

        // 生产者 drop store 之后 LOCK 文件才会释放
        let config = EngineConfig {
            data_dir: dir.path().join("data"),
            meta_dir: dir.path().join("meta"),
            async_write: true,
        };
        let reopened = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match Engine::open(&config) {
                    Ok(engine) => return engine,
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .expect("producer kept the engine open");
        assert_eq!(reopened.count_keys(b"d").unwrap(), 100);
        reopened.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_engine_refuses_listing() {
        let (_dir, db) = open_temp();
        db.close().unwrap();
        assert!(matches!(
            db.list_items(CancellationToken::new(), b"x"),
            Err(DbError::Closed)
        ));
    }
}
