//! 文档存储访问
//!
//! 按天分区的流量记录存储，只用到三类能力：
//! 连通性探测、按时间戳增量翻页查询、批量局部更新

pub mod elasticsearch;
pub mod scanner;
pub mod writer;

#[cfg(test)]
pub mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::Result;

pub use elasticsearch::EsClient;
pub use scanner::ChangeScanner;
pub use writer::{BulkOutcome, BulkWriter};

/// 存储返回的一条原始命中
#[derive(Debug, Clone)]
pub struct Hit {
    pub id: String,
    pub partition: String,
    pub source: Value,
    /// 排序键，作为下一页的续取游标
    pub sort: Vec<Value>,
}

/// 一条流量记录（带解析后的时间戳）
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub id: String,
    pub partition: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: Value,
}

/// 单页查询参数
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub partition: &'a str,
    pub field: &'a str,
    /// 只返回 `field > after` 的记录
    pub after: DateTime<Utc>,
    /// 上一页最后一条的排序键
    pub cursor: Option<&'a [Value]>,
    pub size: usize,
}

/// 一次局部更新：只携带派生字段
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub partition: String,
    pub id: String,
    pub doc: Map<String, Value>,
}

/// 单条更新失败
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// 一次批量更新请求的结果
#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    pub updated: usize,
    pub failures: Vec<ItemFailure>,
}

/// 存储契约
///
/// 查询/更新引擎本身由外部提供，这里只描述本服务消费的接口
pub trait FlowStore: Send + Sync + 'static {
    /// 探测存储是否可达
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// 按 `(field asc, 稳定次序)` 排序拉取一页 `field > after` 的记录
    fn search_page(&self, req: PageRequest<'_>) -> impl Future<Output = Result<Vec<Hit>>> + Send;

    /// 提交一批局部更新（合并写入，不替换整个文档）
    fn bulk_update(&self, ops: &[UpdateOp]) -> impl Future<Output = Result<BulkResponse>> + Send;
}
