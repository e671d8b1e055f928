use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 记录形态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// sflow 流量记录
    Flow,
    /// ipbw agent 带宽记录
    Bandwidth,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Flow
    }
}

/// 写回与检查点推进的先后策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// 先持久化检查点，写回交给后台工作池（吞吐优先）
    Detached,
    /// 等待写回确认后再持久化检查点
    Confirmed,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::Detached
    }
}

/// 重试配置（指数退避）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_es_url")]
    pub es_url: String,

    #[serde(default)]
    pub es_username: Option<String>,

    #[serde(default)]
    pub es_password: Option<String>,

    #[serde(default)]
    pub mode: Mode,

    /// 记录时间戳字段
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,

    /// 两轮扫描之间的间隔（毫秒）
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// 单页拉取条数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 每个 _bulk 请求携带的更新数
    #[serde(default = "default_bulk_chunk_size")]
    pub bulk_chunk_size: usize,

    /// 写回工作池容量
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,

    /// 冷启动时回看的秒数
    #[serde(default = "default_cold_start_grace_secs")]
    pub cold_start_grace_secs: u64,

    /// 拓扑配置文件
    #[serde(default = "default_topology_path")]
    pub topology_path: PathBuf,

    /// 远程拓扑配置地址（可选，配置后优先于本地文件）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_url: Option<String>,

    /// ip2region xdb 文件
    #[serde(default = "default_xdb_path")]
    pub xdb_path: PathBuf,

    /// IPv6 地址段表（可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_table_path: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub write_policy: WritePolicy,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 退出时等待写回完成的最长时间（秒）
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// 跨天时最多回扫的历史分区天数
    #[serde(default = "default_catch_up_days")]
    pub catch_up_days: u32,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_es_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

fn default_check_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    10_000
}

fn default_bulk_chunk_size() -> usize {
    500
}

fn default_max_workers() -> usize {
    30
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("res/last_checked_time.json")
}

fn default_cold_start_grace_secs() -> u64 {
    1
}

fn default_topology_path() -> PathBuf {
    PathBuf::from("res/config_data.json")
}

fn default_xdb_path() -> PathBuf {
    PathBuf::from("res/china.xdb")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_catch_up_days() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            es_url: default_es_url(),
            es_username: None,
            es_password: None,
            mode: Mode::default(),
            timestamp_field: default_timestamp_field(),
            check_interval_ms: default_check_interval_ms(),
            batch_size: default_batch_size(),
            bulk_chunk_size: default_bulk_chunk_size(),
            max_workers: default_max_workers(),
            checkpoint_path: default_checkpoint_path(),
            cold_start_grace_secs: default_cold_start_grace_secs(),
            topology_path: default_topology_path(),
            topology_url: None,
            xdb_path: default_xdb_path(),
            ipv6_table_path: None,
            retry: RetryConfig::default(),
            write_policy: WritePolicy::default(),
            request_timeout_secs: default_request_timeout_secs(),
            proxy_url: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            catch_up_days: default_catch_up_days(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}
