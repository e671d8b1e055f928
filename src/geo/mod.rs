//! IP 归属地与运营商解析
//!
//! IPv4 走 ip2region xdb 索引（`|` 分隔的原始记录），IPv6 走地址段表（按列定位的行）。
//! 每轮扫描使用一个 [`CycleResolver`]，对同一地址只查询一次，轮次结束即丢弃缓存。

pub mod ipv6;
pub mod xdb;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use serde::Serialize;

pub use ipv6::Ipv6RangeTable;
pub use xdb::XdbSearcher;

/// 未知值占位
pub const UNKNOWN: &str = "未知";

/// 运营商名称中的国家前缀
pub const NATIONAL_PREFIX: &str = "中国";

/// 数据校正：该地址段固定归属中国联通
const UNICOM_OVERRIDE_BLOCK: (Ipv4Addr, u8) = (Ipv4Addr::new(120, 72, 50, 0), 24);
const CHINA_UNICOM: &str = "中国联通";

/// 一个地址的解析结果，各字段总是存在
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeoInfo {
    pub province: String,
    pub city: String,
    pub district: String,
    pub isp: String,
}

impl Default for GeoInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

impl GeoInfo {
    pub fn unknown() -> Self {
        Self {
            province: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            district: UNKNOWN.to_string(),
            isp: UNKNOWN.to_string(),
        }
    }

    /// 解析 IPv4 原始记录：`isp|..|..|..|district|..|..|province|..|city|...`
    ///
    /// 字段数不足 10 个时返回全部未知
    pub fn from_ipv4_record(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::unknown();
        }
        let parts: Vec<&str> = raw.split('|').collect();
        if parts.len() <= 9 {
            return Self::unknown();
        }
        Self {
            province: or_unknown(parts[7]),
            city: or_unknown(parts[9]),
            district: or_unknown(parts[4]),
            isp: or_unknown(parts[0]),
        }
    }

    /// 解析 IPv6 地址段表的一行：运营商在第 6 列，省份第 13 列，城市第 15 列
    pub fn from_ipv6_row(row: &[String]) -> Self {
        if row.len() <= 15 {
            return Self::unknown();
        }
        Self {
            province: or_unknown(&row[13]),
            city: or_unknown(&row[15]),
            district: UNKNOWN.to_string(),
            isp: or_unknown(&row[6]),
        }
    }

    /// `"{ip} {province}{city}"`
    pub fn region_label(&self, ip: &str) -> String {
        format!("{} {}{}", ip, self.province, self.city)
    }
}

fn or_unknown(s: &str) -> String {
    if s.is_empty() {
        UNKNOWN.to_string()
    } else {
        s.to_string()
    }
}

/// 严格的点分十进制 IPv4（每段 0-255，不允许前导零）
pub fn is_ipv4(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>().is_ok()
}

/// 去掉运营商名称中的国家前缀
pub fn normalize_isp(isp: &str) -> String {
    isp.replace(NATIONAL_PREFIX, "")
}

/// 已知的归属数据校正
fn apply_carrier_override(ip: Ipv4Addr, mut info: GeoInfo) -> GeoInfo {
    let (block, prefix) = UNICOM_OVERRIDE_BLOCK;
    let mask = u32::MAX << (32 - prefix);
    if u32::from(ip) & mask == u32::from(block) & mask {
        info.isp = CHINA_UNICOM.to_string();
    }
    info
}

/// IPv4 归属索引：返回原始记录字符串
pub trait Ipv4Lookup: Send + Sync {
    fn search(&self, ip: Ipv4Addr) -> Option<String>;
}

/// IPv6 归属索引：返回按列排列的一行
pub trait Ipv6Lookup: Send + Sync {
    fn search(&self, ip: Ipv6Addr) -> Option<Vec<String>>;
}

/// 进程级只读索引句柄，可在多个任务间共享
#[derive(Clone)]
pub struct GeoIndex {
    v4: Arc<dyn Ipv4Lookup>,
    v6: Arc<dyn Ipv6Lookup>,
}

impl GeoIndex {
    pub fn new(v4: Arc<dyn Ipv4Lookup>, v6: Arc<dyn Ipv6Lookup>) -> Self {
        Self { v4, v6 }
    }

    /// 开始新一轮解析（带空缓存）
    pub fn begin_cycle(&self) -> CycleResolver<'_> {
        CycleResolver {
            index: self,
            cache: HashMap::new(),
            lookups: 0,
        }
    }

    /// 不经缓存直接解析
    fn resolve_uncached(&self, ip: &str) -> GeoInfo {
        if let Ok(v4) = ip.parse::<Ipv4Addr>() {
            let info = self
                .v4
                .search(v4)
                .map(|raw| GeoInfo::from_ipv4_record(&raw))
                .unwrap_or_default();
            return apply_carrier_override(v4, info);
        }

        match ip.parse::<Ipv6Addr>() {
            Ok(v6) => self
                .v6
                .search(v6)
                .map(|row| GeoInfo::from_ipv6_row(&row))
                .unwrap_or_default(),
            Err(_) => {
                tracing::debug!(ip = %ip, "无法识别的地址");
                GeoInfo::unknown()
            }
        }
    }
}

/// 单轮解析器：地址 → GeoInfo 的记忆化
pub struct CycleResolver<'a> {
    index: &'a GeoIndex,
    cache: HashMap<String, GeoInfo>,
    lookups: usize,
}

impl CycleResolver<'_> {
    pub fn resolve(&mut self, ip: &str) -> GeoInfo {
        if let Some(info) = self.cache.get(ip) {
            return info.clone();
        }
        self.lookups += 1;
        let info = self.index.resolve_uncached(ip);
        self.cache.insert(ip.to_string(), info.clone());
        info
    }

    /// 实际访问索引的次数
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// 固定表的索引，并记录访问次数
    #[derive(Default)]
    pub struct FixedIndex {
        pub v4: HashMap<Ipv4Addr, String>,
        pub v6: HashMap<Ipv6Addr, Vec<String>>,
        pub calls: Mutex<usize>,
    }

    impl Ipv4Lookup for FixedIndex {
        fn search(&self, ip: Ipv4Addr) -> Option<String> {
            *self.calls.lock() += 1;
            self.v4.get(&ip).cloned()
        }
    }

    impl Ipv6Lookup for FixedIndex {
        fn search(&self, ip: Ipv6Addr) -> Option<Vec<String>> {
            *self.calls.lock() += 1;
            self.v6.get(&ip).cloned()
        }
    }

    /// 生成 ip2region 格式的记录
    pub fn v4_record(isp: &str, province: &str, city: &str) -> String {
        format!("{}|0|0|0|0|0|0|{}|0|{}|0|0", isp, province, city)
    }

    pub fn index_with(entries: &[(&str, &str)]) -> (GeoIndex, Arc<FixedIndex>) {
        let mut fixed = FixedIndex::default();
        for (ip, raw) in entries {
            fixed.v4.insert(ip.parse().unwrap(), raw.to_string());
        }
        let fixed = Arc::new(fixed);
        (GeoIndex::new(fixed.clone(), fixed.clone()), fixed)
    }
}
