//! 错误类型
//!
//! 按照处理方式划分错误类别：
//! - Connectivity: 存储/配置/索引不可达，可重试
//! - Data: 单条记录或配置项数据异常，跳过即可
//! - Persistence: 检查点写入失败
//! - Fatal: 启动阶段无法恢复的错误

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Data,
    Persistence,
    Fatal,
}

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("连接失败: {0}")]
    Connectivity(String),

    #[error("数据错误: {0}")]
    Data(String),

    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("致命错误: {0}")]
    Fatal(String),
}

impl AnalyzerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalyzerError::Connectivity(_) => ErrorKind::Connectivity,
            AnalyzerError::Data(_) => ErrorKind::Data,
            AnalyzerError::Persistence(_) => ErrorKind::Persistence,
            AnalyzerError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// 只有连接类错误值得退避重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }
}

impl From<reqwest::Error> for AnalyzerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AnalyzerError::Data(format!("响应解析失败: {}", e))
        } else {
            AnalyzerError::Connectivity(e.to_string())
        }
    }
}

impl From<std::io::Error> for AnalyzerError {
    fn from(e: std::io::Error) -> Self {
        AnalyzerError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(AnalyzerError::Connectivity("timeout".into()).is_retryable());
        assert!(!AnalyzerError::Data("bad".into()).is_retryable());
        assert!(!AnalyzerError::Persistence("disk".into()).is_retryable());
        assert!(!AnalyzerError::Fatal("refused".into()).is_retryable());
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let err: AnalyzerError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }
}
