//! 主循环
//!
//! 每轮：扫描新记录 → 加载拓扑 → 富化 → 写回 → 推进水位线。
//! 两轮之间固定休眠；任何单轮失败只记录日志，循环本身不退出。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::checkpoint::{CheckpointStore, Watermark};
use crate::error::Result;
use crate::geo::GeoIndex;
use crate::model::config::{Config, WritePolicy};
use crate::pipeline::{Variant, enrich_records};
use crate::retry::RetryPolicy;
use crate::store::scanner::{max_timestamp, partitions_to_scan};
use crate::store::{BulkOutcome, BulkWriter, ChangeScanner, FlowStore, UpdateOp};
use crate::topology::TopologyResolver;

/// 调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    CycleRunning,
}

/// 主循环参数
#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    pub timestamp_field: String,
    pub batch_size: usize,
    pub bulk_chunk_size: usize,
    pub max_workers: usize,
    pub check_interval: Duration,
    pub shutdown_grace: Duration,
    pub catch_up_days: u32,
    pub write_policy: WritePolicy,
    pub retry: RetryPolicy,
}

impl AnalyzerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timestamp_field: config.timestamp_field.clone(),
            batch_size: config.batch_size,
            bulk_chunk_size: config.bulk_chunk_size,
            max_workers: config.max_workers,
            check_interval: config.check_interval(),
            shutdown_grace: config.shutdown_grace(),
            catch_up_days: config.catch_up_days,
            write_policy: config.write_policy,
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

/// 单轮结果
#[derive(Debug, Default)]
pub struct CycleSummary {
    /// 扫描到的新记录数
    pub scanned: usize,
    /// 进入写回批次的记录数
    pub enriched: usize,
    pub unmatched: usize,
    pub incomplete: usize,
    /// 本轮结束后的水位线是否前进
    pub advanced: bool,
    /// 同步写回时的结果；后台写回时为 `None`
    pub outcome: Option<BulkOutcome>,
}

/// 有界写回工作池
///
/// 提交时先占用一个名额，池满时阻塞调用方，直到有写回完成
pub struct WritePool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl WritePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            tasks: JoinSet::new(),
        }
    }

    pub async fn submit<S: FlowStore>(&mut self, writer: BulkWriter<S>, updates: Vec<UpdateOp>) {
        self.reap();
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!("写回工作池已关闭，{} 条更新被丢弃: {}", updates.len(), e);
                return;
            }
        };

        self.tasks.spawn(async move {
            let _permit = permit;
            if let Err(e) = writer.write(&updates).await {
                tracing::error!("后台写回失败，{} 条记录未更新: {}", updates.len(), e);
            }
        });
    }

    /// 回收已结束的任务
    fn reap(&mut self) {
        while let Some(res) = self.tasks.try_join_next() {
            if let Err(e) = res {
                tracing::error!("写回任务异常退出: {}", e);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// 等待所有写回结束，最多等待 `grace`；超时后放弃剩余任务
    pub async fn drain(&mut self, grace: Duration) -> bool {
        let tasks = &mut self.tasks;
        let all = async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    tracing::error!("写回任务异常退出: {}", e);
                }
            }
        };
        let finished = tokio::time::timeout(grace, all).await.is_ok();

        if !finished {
            tracing::warn!("等待写回超时，放弃 {} 个未完成的写回任务", self.tasks.len());
            self.tasks.abort_all();
        }
        finished
    }
}

pub struct Analyzer<S: FlowStore> {
    store: Arc<S>,
    variant: &'static Variant,
    topology: TopologyResolver,
    geo: GeoIndex,
    checkpoint: CheckpointStore,
    watermark: Watermark,
    writer: BulkWriter<S>,
    pool: WritePool,
    options: AnalyzerOptions,
    state: CycleState,
}

impl<S: FlowStore> Analyzer<S> {
    pub fn new(
        store: Arc<S>,
        variant: &'static Variant,
        topology: TopologyResolver,
        geo: GeoIndex,
        checkpoint: CheckpointStore,
        options: AnalyzerOptions,
    ) -> Result<Self> {
        let watermark = Watermark::new(checkpoint.load()?);
        Ok(Self {
            writer: BulkWriter::new(store.clone(), options.bulk_chunk_size),
            pool: WritePool::new(options.max_workers),
            store,
            variant,
            topology,
            geo,
            checkpoint,
            watermark,
            options,
            state: CycleState::Idle,
        })
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark.get()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// 执行一轮
    ///
    /// 扫描重试耗尽时返回错误，水位线不变
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        self.state = CycleState::CycleRunning;
        let result = self.cycle().await;
        self.state = CycleState::Idle;
        result
    }

    async fn cycle(&mut self) -> Result<CycleSummary> {
        let after = self.watermark.get();
        let partitions = partitions_to_scan(
            self.variant.partition_prefix,
            after,
            Utc::now(),
            self.options.catch_up_days,
        );

        let scanner = ChangeScanner::new(
            self.store.as_ref(),
            &self.options.timestamp_field,
            self.options.batch_size,
        );
        let records = self
            .options
            .retry
            .run("扫描新记录", || scanner.scan_partitions(&partitions, after))
            .await?;

        let mut summary = CycleSummary {
            scanned: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            tracing::info!("没有新的文档需要更新");
            return Ok(summary);
        }
        tracing::info!("找到 {} 个新记录，正在处理...", records.len());

        let newest = max_timestamp(&records);
        // 拓扑不可达时本轮失败，水位线不动，下一轮重新处理这批记录
        let topology = self.topology.load(&self.options.retry).await?;
        let report = {
            let mut resolver = self.geo.begin_cycle();
            enrich_records(self.variant, &records, &topology, &mut resolver)
        };
        summary.enriched = report.updates.len();
        summary.unmatched = report.unmatched;
        summary.incomplete = report.incomplete;
        if report.updates.is_empty() {
            tracing::info!(unmatched = report.unmatched, "本轮没有匹配拓扑的记录");
        }

        match self.options.write_policy {
            WritePolicy::Detached => {
                summary.advanced = self.commit(newest);
                if !report.updates.is_empty() {
                    self.pool.submit(self.writer.clone(), report.updates).await;
                }
            }
            WritePolicy::Confirmed => {
                if !report.updates.is_empty() {
                    let writer = &self.writer;
                    let updates = &report.updates;
                    let outcome = self
                        .options
                        .retry
                        .run("写回", || writer.write(updates))
                        .await?;
                    summary.outcome = Some(outcome);
                }
                summary.advanced = self.commit(newest);
            }
        }
        Ok(summary)
    }

    /// 推进并持久化水位线；持久化失败只记录，内存中的水位线照常前进
    fn commit(&mut self, newest: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = newest else {
            tracing::warn!("新记录都没有可解析的时间戳，水位线保持不变");
            return false;
        };
        if !self.watermark.advance(ts) {
            return false;
        }
        if let Err(e) = self.checkpoint.save(ts) {
            tracing::error!(
                path = %self.checkpoint.path().display(),
                "保存检查点失败，重启后可能重复处理: {}",
                e
            );
        }
        true
    }

    /// 持续运行，直到 `shutdown` 完成；退出前等待在途写回
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tracing::info!(
            variant = self.variant.name,
            watermark = %self.watermark().to_rfc3339(),
            "开始监听新记录"
        );
        tokio::pin!(shutdown);

        loop {
            match self.run_cycle().await {
                Ok(summary) if summary.scanned > 0 => tracing::debug!(
                    scanned = summary.scanned,
                    enriched = summary.enriched,
                    unmatched = summary.unmatched,
                    incomplete = summary.incomplete,
                    advanced = summary.advanced,
                    watermark = %self.watermark().to_rfc3339(),
                    state = ?self.state(),
                    "本轮完成"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(kind = ?e.kind(), "本轮处理失败: {}", e),
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("收到退出信号");
                    break;
                }
                _ = tokio::time::sleep(self.options.check_interval) => {}
            }
        }

        self.shutdown().await;
    }

    /// 等待在途写回结束
    pub async fn shutdown(&mut self) {
        let in_flight = self.pool.in_flight();
        if in_flight > 0 {
            tracing::info!("等待 {} 个写回任务完成...", in_flight);
        }
        if self.pool.drain(self.options.shutdown_grace).await {
            tracing::info!("写回已全部完成");
        }
    }
}
