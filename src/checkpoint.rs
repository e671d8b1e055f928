//! 检查点（水位线）持久化
//!
//! 水位线是已观察到的最新记录时间戳，扫描只取严格大于它的记录。
//! 文件格式: `{"last_checked_time": "<ISO-8601>"}`

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::common::parse_timestamp;
use crate::error::{AnalyzerError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    last_checked_time: String,
}

/// 检查点文件存储
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    /// 冷启动时回看的时间窗口
    grace: Duration,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            path: path.into(),
            grace,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取持久化的水位线
    ///
    /// 文件不存在时返回 `now - grace`；文件存在但读不出或内容损坏时返回错误，
    /// 不能悄悄从当前时间开始，否则上次水位线到现在之间的记录都会被跳过
    pub fn load(&self) -> Result<DateTime<Utc>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                tracing::info!(path = %self.path.display(), "检查点文件不存在，从当前时间开始");
                let grace = chrono::Duration::from_std(self.grace)
                    .unwrap_or(chrono::Duration::seconds(1));
                return Ok(Utc::now() - grace);
            }
            Err(e) => {
                return Err(AnalyzerError::Fatal(format!(
                    "读取检查点 {} 失败: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let file: CheckpointFile = serde_json::from_str(&content).map_err(|e| {
            AnalyzerError::Fatal(format!("检查点 {} 格式错误: {}", self.path.display(), e))
        })?;
        let ts = parse_timestamp(&file.last_checked_time).ok_or_else(|| {
            AnalyzerError::Fatal(format!(
                "检查点 {} 时间戳无法解析: {}",
                self.path.display(),
                file.last_checked_time
            ))
        })?;

        tracing::info!("已加载检查点: {}", ts.to_rfc3339());
        Ok(ts)
    }

    /// 原子覆盖写入检查点
    ///
    /// 先写临时文件并刷盘，再 rename 覆盖，读方不会看到写了一半的文件
    pub fn save(&self, ts: DateTime<Utc>) -> Result<()> {
        let body = serde_json::to_string(&CheckpointFile {
            last_checked_time: ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })
        .map_err(|e| AnalyzerError::Persistence(format!("序列化检查点失败: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            AnalyzerError::Persistence(format!(
                "替换检查点文件失败 {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), "检查点已保存: {}", ts.to_rfc3339());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// 内存中的水位线，只进不退
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    current: DateTime<Utc>,
}

impl Watermark {
    pub fn new(initial: DateTime<Utc>) -> Self {
        Self { current: initial }
    }

    pub fn get(&self) -> DateTime<Utc> {
        self.current
    }

    /// 推进到 `ts`，仅当 `ts` 更新时生效，返回是否发生了推进
    pub fn advance(&mut self, ts: DateTime<Utc>) -> bool {
        if ts > self.current {
            self.current = ts;
            true
        } else {
            false
        }
    }
}
