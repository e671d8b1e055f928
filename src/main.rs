mod analyzer;
mod checkpoint;
mod common;
mod error;
mod geo;
mod http_client;
mod model;
mod pipeline;
mod retry;
mod store;
mod topology;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use analyzer::{Analyzer, AnalyzerOptions};
use checkpoint::CheckpointStore;
use error::AnalyzerError;
use geo::{GeoIndex, Ipv6RangeTable, XdbSearcher};
use model::config::{Config, Mode};
use pipeline::Variant;
use store::{EsClient, FlowStore};
use topology::{TopologyResolver, TopologySource};

/// 流量记录归属地/拓扑富化服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = Config::default_config_path())]
    config: String,

    /// 记录形态，覆盖配置文件中的 mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// 只执行一轮后退出
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        tracing::error!("加载配置失败: {:#}", e);
        std::process::exit(1);
    });
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(path) = config.config_path() {
        tracing::info!("配置文件: {}", path.display());
    }

    let variant = Variant::for_mode(config.mode);
    tracing::info!(
        variant = variant.name,
        raw_fields = ?variant.raw_fields,
        write_policy = ?config.write_policy,
        "启动 nettraffic-analyzer {}",
        env!("CARGO_PKG_VERSION")
    );

    let client = http_client::build_client(config.proxy_url.as_deref(), config.request_timeout_secs)
        .unwrap_or_else(|e| {
            tracing::error!("创建 HTTP Client 失败: {:#}", e);
            std::process::exit(1);
        });

    let store = Arc::new(EsClient::new(
        client.clone(),
        config.es_url.clone(),
        config.es_username.clone(),
        config.es_password.clone(),
    ));
    if let Err(e) = store.ping().await {
        let fatal = AnalyzerError::Fatal(format!("无法连接存储 {}: {}", config.es_url, e));
        tracing::error!(kind = ?fatal.kind(), "{}", fatal);
        std::process::exit(1);
    }
    tracing::info!("已连接存储: {}", config.es_url);

    let geo = load_geo(&config).unwrap_or_else(|e| {
        tracing::error!("加载归属地数据失败: {:#}", e);
        std::process::exit(1);
    });

    let source = match &config.topology_url {
        Some(url) => TopologySource::Remote {
            client,
            url: url.clone(),
        },
        None => TopologySource::File(config.topology_path.clone()),
    };
    let topology = TopologyResolver::new(source, variant.topology_key);

    let checkpoint = CheckpointStore::new(
        config.checkpoint_path.clone(),
        Duration::from_secs(config.cold_start_grace_secs),
    );

    let mut analyzer = Analyzer::new(
        store,
        variant,
        topology,
        geo,
        checkpoint,
        AnalyzerOptions::from_config(&config),
    )
    .unwrap_or_else(|e| {
        tracing::error!(kind = ?e.kind(), "初始化失败: {}", e);
        std::process::exit(1);
    });

    if args.once {
        if let Err(e) = analyzer.run_cycle().await {
            tracing::error!("本轮处理失败: {}", e);
        }
        analyzer.shutdown().await;
        return;
    }

    analyzer.run(shutdown_signal()).await;
    tracing::info!("已退出");
}

fn load_geo(config: &Config) -> anyhow::Result<GeoIndex> {
    let v4 = XdbSearcher::load(&config.xdb_path)?;
    let v6 = match &config.ipv6_table_path {
        Some(path) => Ipv6RangeTable::load(path)?,
        None => {
            tracing::warn!("未配置 IPv6 地址段表，IPv6 地址将解析为未知");
            Ipv6RangeTable::empty()
        }
    };
    Ok(GeoIndex::new(Arc::new(v4), Arc::new(v6)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
}
