//! HTTP Client 构建模块
//!
//! 存储访问与远程拓扑拉取共用同一个 reqwest::Client

use reqwest::{Client, Proxy};
use std::time::Duration;

/// 构建 HTTP Client
///
/// # Arguments
/// * `proxy_url` - 可选的代理 URL，支持 http:// 与 socks5://（可带认证信息）
/// * `timeout_secs` - 单次请求超时时间（秒）
pub fn build_client(proxy_url: Option<&str>, timeout_secs: u64) -> anyhow::Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
        .pool_max_idle_per_host(32);

    if let Some(url) = proxy_url {
        let proxy = Proxy::all(url)?;
        builder = builder.proxy(proxy);
        tracing::debug!("HTTP Client 使用代理: {}", url);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_without_proxy() {
        assert!(build_client(None, 30).is_ok());
    }

    #[test]
    fn test_build_client_with_socks5_proxy() {
        assert!(build_client(Some("socks5://127.0.0.1:1080"), 30).is_ok());
    }
}
