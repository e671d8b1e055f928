//! 增量扫描
//!
//! 每轮从水位线出发，按 `(时间戳 asc, _doc)` 排序用 search_after 游标逐页拉取，
//! 直到某页为空。游标只在一轮内有效，跨轮依靠严格大于过滤去重。

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde_json::Value;

use super::{FlowRecord, FlowStore, Hit, PageRequest};
use crate::common::{lookup_path, timestamp_value};
use crate::error::{AnalyzerError, Result};

/// 单个分区上的翻页游标
pub struct ScanCursor<'a, S: FlowStore> {
    store: &'a S,
    partition: String,
    field: &'a str,
    after: DateTime<Utc>,
    batch_size: usize,
    search_after: Option<Vec<Value>>,
    exhausted: bool,
}

impl<'a, S: FlowStore> ScanCursor<'a, S> {
    /// 拉取下一页，分区读完后返回 `None`
    pub async fn next_page(&mut self) -> Result<Option<Vec<FlowRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let hits = self
            .store
            .search_page(PageRequest {
                partition: &self.partition,
                field: self.field,
                after: self.after,
                cursor: self.search_after.as_deref(),
                size: self.batch_size,
            })
            .await?;

        if hits.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        let last_sort = hits.last().map(|h| h.sort.clone()).unwrap_or_default();
        if last_sort.is_empty() {
            // 没有排序键无法续取，继续请求只会得到同一页
            self.exhausted = true;
            return Err(AnalyzerError::Data(format!(
                "分区 {} 返回的记录缺少排序键",
                self.partition
            )));
        }
        self.search_after = Some(last_sort);

        Ok(Some(hits.into_iter().map(|h| into_record(h, self.field)).collect()))
    }
}

/// 时间戳优先取记录字段，取不到时用排序键（存储返回的毫秒时间戳）
fn into_record(hit: Hit, field: &str) -> FlowRecord {
    let timestamp = lookup_path(&hit.source, field)
        .and_then(timestamp_value)
        .or_else(|| {
            hit.sort
                .first()
                .and_then(Value::as_i64)
                .and_then(DateTime::from_timestamp_millis)
        });
    if timestamp.is_none() {
        tracing::warn!(id = %hit.id, partition = %hit.partition, "记录的 {} 字段无法解析", field);
    }
    FlowRecord {
        id: hit.id,
        partition: hit.partition,
        timestamp,
        source: hit.source,
    }
}

/// 变更扫描器
pub struct ChangeScanner<'a, S: FlowStore> {
    store: &'a S,
    field: &'a str,
    batch_size: usize,
}

impl<'a, S: FlowStore> ChangeScanner<'a, S> {
    pub fn new(store: &'a S, field: &'a str, batch_size: usize) -> Self {
        Self {
            store,
            field,
            batch_size: batch_size.max(1),
        }
    }

    /// 打开一个分区上的游标
    pub fn cursor(&self, partition: &str, after: DateTime<Utc>) -> ScanCursor<'a, S> {
        ScanCursor {
            store: self.store,
            partition: partition.to_string(),
            field: self.field,
            after,
            batch_size: self.batch_size,
            search_after: None,
            exhausted: false,
        }
    }

    /// 取出分区中所有时间戳严格大于 `after` 的记录
    pub async fn scan(&self, partition: &str, after: DateTime<Utc>) -> Result<Vec<FlowRecord>> {
        let mut cursor = self.cursor(partition, after);
        let mut all = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            all.extend(page);
            tracing::info!(partition = %partition, "已获取 {} 条记录", all.len());
        }
        Ok(all)
    }

    /// 依次扫描多个分区（由旧到新）
    pub async fn scan_partitions(
        &self,
        partitions: &[String],
        after: DateTime<Utc>,
    ) -> Result<Vec<FlowRecord>> {
        let mut all = Vec::new();
        for partition in partitions {
            all.extend(self.scan(partition, after).await?);
        }
        Ok(all)
    }
}

/// 按 UTC 日期生成分区名，如 `sflow-2024.11.17`
pub fn partition_name(prefix: &str, day: NaiveDate) -> String {
    format!("{}-{}", prefix, day.format("%Y.%m.%d"))
}

/// 需要扫描的分区列表
///
/// 水位线落在更早的日期时，把跨天前的分区也带上（最多回溯 `catch_up_days` 天），
/// 避免零点前写入的记录在换日后被跳过
pub fn partitions_to_scan(
    prefix: &str,
    watermark: DateTime<Utc>,
    now: DateTime<Utc>,
    catch_up_days: u32,
) -> Vec<String> {
    let today = now.date_naive();
    let earliest = today
        .checked_sub_days(Days::new(u64::from(catch_up_days)))
        .unwrap_or(today);
    let mut day = watermark.date_naive().clamp(earliest, today);

    let mut partitions = Vec::new();
    while day <= today {
        partitions.push(partition_name(prefix, day));
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    partitions
}

/// 记录中的最大时间戳
pub fn max_timestamp(records: &[FlowRecord]) -> Option<DateTime<Utc>> {
    records.iter().filter_map(|r| r.timestamp).max()
}
