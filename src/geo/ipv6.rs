//! IPv6 地址段表
//!
//! 从 JSON 文件加载 `[{"start": "...", "end": "...", "row": [...]}]`，
//! 按起始地址排序后二分查找。地址段之间不重叠。

use std::net::Ipv6Addr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use super::Ipv6Lookup;

#[derive(Debug, Deserialize)]
struct RawRange {
    start: Ipv6Addr,
    end: Ipv6Addr,
    row: Vec<Value>,
}

#[derive(Debug, Clone)]
struct Range {
    start: u128,
    end: u128,
    row: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Ipv6RangeTable {
    ranges: Vec<Range>,
}

impl Ipv6RangeTable {
    /// 空表：所有查询都未命中
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let raw: Vec<RawRange> = serde_json::from_str(content).context("解析 IPv6 地址段表失败")?;
        let mut ranges: Vec<Range> = raw
            .into_iter()
            .filter_map(|r| {
                let (start, end) = (u128::from(r.start), u128::from(r.end));
                if start > end {
                    tracing::warn!("IPv6 地址段起止颠倒，已跳过: {} - {}", r.start, r.end);
                    return None;
                }
                Some(Range {
                    start,
                    end,
                    row: r.row.iter().map(cell_to_string).collect(),
                })
            })
            .collect();
        ranges.sort_by_key(|r| r.start);
        Ok(Self { ranges })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取 IPv6 地址段表失败: {}", path.display()))?;
        let table = Self::from_json(&content)?;
        tracing::info!(path = %path.display(), ranges = table.len(), "已加载 IPv6 地址段表");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}

fn cell_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Ipv6Lookup for Ipv6RangeTable {
    fn search(&self, ip: Ipv6Addr) -> Option<Vec<String>> {
        let ip = u128::from(ip);
        // 起始地址不大于 ip 的最后一段
        let idx = self.ranges.partition_point(|r| r.start <= ip);
        let candidate = self.ranges.get(idx.checked_sub(1)?)?;
        (ip <= candidate.end).then(|| candidate.row.clone())
    }
}
