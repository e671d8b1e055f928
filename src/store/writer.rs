//! 批量写回
//!
//! 将派生字段按块提交为局部更新。单条失败只记录不重试；
//! 某个块整体提交失败时放弃本批剩余的块。

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{FlowStore, UpdateOp};
use crate::error::Result;

/// 日志中最多展示的单条失败原因数
const MAX_LOGGED_FAILURES: usize = 5;

/// 一批写回的结果
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub submitted: usize,
    pub updated: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

pub struct BulkWriter<S: FlowStore> {
    store: Arc<S>,
    chunk_size: usize,
}

impl<S: FlowStore> Clone for BulkWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chunk_size: self.chunk_size,
        }
    }
}

impl<S: FlowStore> BulkWriter<S> {
    pub fn new(store: Arc<S>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn write(&self, updates: &[UpdateOp]) -> Result<BulkOutcome> {
        let start = Instant::now();
        let mut outcome = BulkOutcome {
            submitted: updates.len(),
            ..Default::default()
        };

        if updates.is_empty() {
            tracing::info!("没有需要更新的记录");
            return Ok(outcome);
        }

        for chunk in updates.chunks(self.chunk_size) {
            let resp = match self.store.bulk_update(chunk).await {
                Ok(resp) => resp,
                Err(e) => {
                    let dropped = updates.len() - outcome.updated - outcome.failed;
                    tracing::error!(
                        updated = outcome.updated,
                        dropped,
                        "批量更新失败，放弃本批剩余记录: {}",
                        e
                    );
                    return Err(e);
                }
            };

            for failure in resp.failures.iter().take(MAX_LOGGED_FAILURES) {
                tracing::warn!(id = %failure.id, "记录更新失败: {}", failure.reason);
            }
            outcome.updated += resp.updated;
            outcome.failed += resp.failures.len();
        }

        outcome.elapsed = start.elapsed();
        tracing::info!(
            submitted = outcome.submitted,
            updated = outcome.updated,
            failed = outcome.failed,
            "更新完成，耗时：{:.2}s",
            outcome.elapsed.as_secs_f64()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::{Map, json};

    const PARTITION: &str = "sflow-2024.11.17";

    fn op(id: &str, node: &str) -> UpdateOp {
        let mut doc = Map::new();
        doc.insert("node".into(), json!(node));
        UpdateOp {
            partition: PARTITION.into(),
            id: id.into(),
            doc,
        }
    }

    fn seeded(n: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..n {
            store.insert(
                PARTITION,
                &format!("r{}", i),
                json!({"@timestamp": "2024-11-17T10:00:00Z", "src_ip": "1.1.1.1"}),
            );
        }
        store
    }

    #[tokio::test]
    async fn test_write_merges_partial_fields() {
        let store = seeded(2);
        let writer = BulkWriter::new(store.clone(), 500);

        let outcome = writer.write(&[op("r0", "武汉"), op("r1", "广州")]).await.unwrap();
        assert_eq!(outcome.submitted, 2);
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.failed, 0);

        let doc = store.get(PARTITION, "r0").unwrap();
        assert_eq!(doc["node"], "武汉");
        // 原始字段保持不变
        assert_eq!(doc["src_ip"], "1.1.1.1");
    }

    #[tokio::test]
    async fn test_write_splits_into_chunks() {
        let store = seeded(5);
        let writer = BulkWriter::new(store.clone(), 2);

        let ops: Vec<_> = (0..5).map(|i| op(&format!("r{}", i), "n")).collect();
        let outcome = writer.write(&ops).await.unwrap();
        assert_eq!(outcome.updated, 5);
        assert_eq!(store.bulk_calls(), 3);
    }

    #[tokio::test]
    async fn test_item_failures_are_counted_not_retried() {
        let store = seeded(1);
        let writer = BulkWriter::new(store.clone(), 500);

        let outcome = writer.write(&[op("r0", "n"), op("ghost", "n")]).await.unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(store.bulk_calls(), 1);
    }

    #[tokio::test]
    async fn test_chunk_failure_drops_rest_of_batch() {
        let store = seeded(4);
        store.fail_next_bulks(1);
        let writer = BulkWriter::new(store.clone(), 2);

        let ops: Vec<_> = (0..4).map(|i| op(&format!("r{}", i), "n")).collect();
        let err = writer.write(&ops).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.bulk_calls(), 1);
        assert!(store.applied_ops().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_skips_store() {
        let store = seeded(0);
        let writer = BulkWriter::new(store.clone(), 500);
        let outcome = writer.write(&[]).await.unwrap();
        assert_eq!(outcome.submitted, 0);
        assert_eq!(store.bulk_calls(), 0);
    }
}
