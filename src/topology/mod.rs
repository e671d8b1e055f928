//! 拓扑配置
//!
//! 主机 IP（+ 接口）到节点/客户/交换机/方向的映射。每轮扫描前整体重新加载。
//! 配置不可读或格式错误时返回空映射，本轮不做任何富化；
//! 远程来源不可达时按退避策略重试，重试耗尽则本轮失败。

use std::collections::HashMap;
use std::path::PathBuf;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::common::scalar_to_key;
use crate::error::{AnalyzerError, Result};
use crate::retry::RetryPolicy;

/// 一条拓扑配置
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyEntry {
    pub host_ip: String,
    pub interface: Option<String>,
    pub agent_ip: String,
    pub node: String,
    pub customer: String,
    pub switch: String,
    pub direction: String,
    pub flow_direction: String,
    pub host_name: Option<String>,
}

/// 配置文件中的原始条目（字段名沿用上游配置，客户字段为 `costumer`）
#[derive(Debug, Deserialize)]
struct RawEntry {
    host_ip: String,
    #[serde(default)]
    interface: Value,
    agent_ip: String,
    node: String,
    #[serde(alias = "customer")]
    costumer: String,
    #[serde(default)]
    switch: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    flow_direction: Option<String>,
    #[serde(default)]
    host_name: Option<String>,
}

impl From<RawEntry> for TopologyEntry {
    fn from(raw: RawEntry) -> Self {
        let unknown = || crate::geo::UNKNOWN.to_string();
        Self {
            host_ip: raw.host_ip,
            interface: scalar_to_key(&raw.interface),
            agent_ip: raw.agent_ip,
            node: raw.node,
            customer: raw.costumer,
            switch: raw.switch.unwrap_or_else(unknown),
            direction: raw.direction.unwrap_or_else(|| "out".to_string()),
            flow_direction: raw.flow_direction.unwrap_or_else(unknown),
            host_name: raw.host_name,
        }
    }
}

impl TopologyEntry {
    pub fn is_inbound(&self) -> bool {
        self.direction == "in"
    }
}

/// 查找键的构成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKey {
    /// `{host_ip}_{interface}`
    HostAndInterface,
    /// `{host_ip}`
    HostOnly,
}

impl TopologyKey {
    pub fn compose(self, host_ip: &str, interface: Option<&str>) -> Option<String> {
        match self {
            TopologyKey::HostAndInterface => interface.map(|i| format!("{}_{}", host_ip, i)),
            TopologyKey::HostOnly => Some(host_ip.to_string()),
        }
    }
}

/// 一轮内只读的拓扑快照
#[derive(Debug, Clone)]
pub struct TopologyMap {
    key: TopologyKey,
    entries: HashMap<String, TopologyEntry>,
}

impl TopologyMap {
    pub fn empty(key: TopologyKey) -> Self {
        Self {
            key,
            entries: HashMap::new(),
        }
    }

    /// 建立索引，同键重复时保留第一条
    pub fn build(key: TopologyKey, entries: Vec<TopologyEntry>) -> Self {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let Some(k) = key.compose(&entry.host_ip, entry.interface.as_deref()) else {
                tracing::warn!(host_ip = %entry.host_ip, "拓扑条目缺少接口，已忽略");
                continue;
            };
            if map.contains_key(&k) {
                tracing::warn!(key = %k, "拓扑条目重复，保留第一条");
                continue;
            }
            map.insert(k, entry);
        }
        Self { key, entries: map }
    }

    pub fn get(&self, host_ip: &str, interface: Option<&str>) -> Option<&TopologyEntry> {
        let k = self.key.compose(host_ip, interface)?;
        self.entries.get(&k)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 拓扑配置来源
pub enum TopologySource {
    File(PathBuf),
    Remote { client: Client, url: String },
}

impl TopologySource {
    async fn fetch(&self) -> Result<Value> {
        match self {
            TopologySource::File(path) => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AnalyzerError::Data(format!("读取拓扑配置 {} 失败: {}", path.display(), e))
                })?;
                serde_json::from_str(&content)
                    .map_err(|e| AnalyzerError::Data(format!("拓扑配置格式错误: {}", e)))
            }
            TopologySource::Remote { client, url } => {
                let resp = client.get(url).send().await?;
                if !resp.status().is_success() {
                    return Err(AnalyzerError::Connectivity(format!(
                        "拉取拓扑配置失败: HTTP {}",
                        resp.status()
                    )));
                }
                Ok(resp.json().await?)
            }
        }
    }
}

/// 逐条解析配置数组，格式错误的条目跳过
pub fn parse_entries(value: Value) -> Result<Vec<TopologyEntry>> {
    let Value::Array(items) = value else {
        return Err(AnalyzerError::Data("拓扑配置应为 JSON 数组".into()));
    };

    let mut entries = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<RawEntry>(item) {
            Ok(raw) => entries.push(raw.into()),
            Err(e) => tracing::warn!("第 {} 条拓扑配置格式错误，已跳过: {}", i, e),
        }
    }
    Ok(entries)
}

/// 拓扑解析器
pub struct TopologyResolver {
    source: TopologySource,
    key: TopologyKey,
}

impl TopologyResolver {
    pub fn new(source: TopologySource, key: TopologyKey) -> Self {
        Self { source, key }
    }

    /// 加载最新拓扑快照
    ///
    /// 连接类错误按 `retry` 重试，耗尽后返回错误；数据类错误返回空映射
    pub async fn load(&self, retry: &RetryPolicy) -> Result<TopologyMap> {
        let fetched = retry.run("加载拓扑配置", || self.source.fetch()).await;
        match fetched.and_then(parse_entries) {
            Ok(entries) => {
                let map = TopologyMap::build(self.key, entries);
                tracing::debug!("已加载 {} 条拓扑配置", map.len());
                Ok(map)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::error!("加载拓扑配置失败，本轮不做富化: {}", e);
                Ok(TopologyMap::empty(self.key))
            }
        }
    }
}
