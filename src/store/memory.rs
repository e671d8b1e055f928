//! 内存存储（测试用）
//!
//! 模拟存储的排序、严格大于过滤、search_after 续取与局部合并更新，
//! 并支持注入连接失败

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{BulkResponse, FlowStore, Hit, ItemFailure, PageRequest, UpdateOp};
use crate::common::{lookup_path, timestamp_value};
use crate::error::{AnalyzerError, Result};

struct StoredDoc {
    partition: String,
    id: String,
    seq: u64,
    source: Value,
}

#[derive(Default)]
struct Inner {
    docs: Vec<StoredDoc>,
    next_seq: u64,
    fail_searches: usize,
    fail_bulks: usize,
    search_calls: usize,
    bulk_calls: usize,
    bulk_ops: Vec<UpdateOp>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, partition: &str, id: &str, source: Value) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.docs.push(StoredDoc {
            partition: partition.to_string(),
            id: id.to_string(),
            seq,
            source,
        });
    }

    pub fn get(&self, partition: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .docs
            .iter()
            .find(|d| d.partition == partition && d.id == id)
            .map(|d| d.source.clone())
    }

    /// 接下来 n 次查询返回连接错误
    pub fn fail_next_searches(&self, n: usize) {
        self.inner.lock().fail_searches = n;
    }

    /// 接下来 n 次批量更新返回连接错误
    pub fn fail_next_bulks(&self, n: usize) {
        self.inner.lock().fail_bulks = n;
    }

    pub fn search_calls(&self) -> usize {
        self.inner.lock().search_calls
    }

    pub fn bulk_calls(&self) -> usize {
        self.inner.lock().bulk_calls
    }

    /// 所有成功提交的更新操作
    pub fn applied_ops(&self) -> Vec<UpdateOp> {
        self.inner.lock().bulk_ops.clone()
    }
}

fn sort_key(doc: &StoredDoc, field: &str) -> Option<(i64, u64)> {
    let ts = lookup_path(&doc.source, field).and_then(timestamp_value)?;
    Some((ts.timestamp_millis(), doc.seq))
}

fn cursor_key(cursor: &[Value]) -> Option<(i64, u64)> {
    Some((cursor.first()?.as_i64()?, cursor.get(1)?.as_u64()?))
}

impl FlowStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn search_page(&self, req: PageRequest<'_>) -> Result<Vec<Hit>> {
        let mut inner = self.inner.lock();
        inner.search_calls += 1;
        if inner.fail_searches > 0 {
            inner.fail_searches -= 1;
            return Err(AnalyzerError::Connectivity("connection refused".into()));
        }

        let after = req.after.timestamp_millis();
        let resume = req.cursor.and_then(cursor_key);

        let mut matched: Vec<((i64, u64), &StoredDoc)> = inner
            .docs
            .iter()
            .filter(|d| d.partition == req.partition)
            .filter_map(|d| sort_key(d, req.field).map(|k| (k, d)))
            .filter(|(k, _)| k.0 > after)
            .filter(|(k, _)| resume.is_none_or(|r| *k > r))
            .collect();
        matched.sort_by_key(|(k, _)| *k);

        Ok(matched
            .into_iter()
            .take(req.size)
            .map(|(k, d)| Hit {
                id: d.id.clone(),
                partition: d.partition.clone(),
                source: d.source.clone(),
                sort: vec![json!(k.0), json!(k.1)],
            })
            .collect())
    }

    async fn bulk_update(&self, ops: &[UpdateOp]) -> Result<BulkResponse> {
        let mut inner = self.inner.lock();
        inner.bulk_calls += 1;
        if inner.fail_bulks > 0 {
            inner.fail_bulks -= 1;
            return Err(AnalyzerError::Connectivity("bulk endpoint unreachable".into()));
        }

        let mut out = BulkResponse::default();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for (i, d) in inner.docs.iter().enumerate() {
            index.insert((d.partition.clone(), d.id.clone()), i);
        }

        for op in ops {
            match index.get(&(op.partition.clone(), op.id.clone())) {
                Some(&i) => {
                    if let Some(obj) = inner.docs[i].source.as_object_mut() {
                        for (k, v) in &op.doc {
                            obj.insert(k.clone(), v.clone());
                        }
                    }
                    inner.bulk_ops.push(op.clone());
                    out.updated += 1;
                }
                None => out.failures.push(ItemFailure {
                    id: op.id.clone(),
                    reason: "document missing".into(),
                }),
            }
        }
        Ok(out)
    }
}
