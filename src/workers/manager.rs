// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::{EngineSettings, WorkerSettings};
use crate::domain::repositories::job_repository::JobRepository;
use crate::domain::repositories::record_repository::RecordRepository;
use crate::engine::browser::BrowserHandle;
use crate::engine::ScrapeEngine;
use crate::proxy::ProxySelector;
use crate::queue::job_queue::JobQueue;
use crate::utils::retry_policy::RetryPolicy;
use crate::workers::scrape_worker::ScrapeWorker;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use sea_orm::DatabaseConnection;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 全局调度速率限制器
///
/// 独立于工作器数量约束总出站调度频率。
pub type DispatchLimiter = DefaultDirectRateLimiter;

/// 按配置构建全局调度速率限制器
///
/// 配额为：dispatch_window_secs窗口内最多dispatch_count次调度。
pub fn build_dispatch_limiter(settings: &WorkerSettings) -> Arc<DispatchLimiter> {
    let count = NonZeroU32::new(settings.dispatch_count.max(1)).expect("non-zero dispatch count");
    let period = Duration::from_secs(settings.dispatch_window_secs.max(1)) / count.get();

    let quota = Quota::with_period(period)
        .expect("non-zero dispatch period")
        .allow_burst(count);

    Arc::new(RateLimiter::direct(quota))
}

/// 工作管理器
///
/// 持有队列、仓库、引擎和代理选择器，按配置并发度
/// 启动工作器，并负责有序关闭：先停止分发并结束工作器，
/// 再关闭浏览器进程，最后关闭数据库连接，每一步都
/// 独立容错，部分失败不会让连接悬空。
pub struct WorkerManager<Q, R, S>
where
    Q: JobQueue + 'static,
    R: JobRepository + Send + Sync + 'static,
    S: RecordRepository + Send + Sync + 'static,
{
    queue: Arc<Q>,
    repository: Arc<R>,
    record_repository: Arc<S>,
    engine: Arc<ScrapeEngine>,
    proxies: ProxySelector,
    retry_policy: RetryPolicy,
    worker_settings: WorkerSettings,
    engine_settings: EngineSettings,
    limiter: Arc<DispatchLimiter>,
    handles: Vec<JoinHandle<()>>,
}

impl<Q, R, S> WorkerManager<Q, R, S>
where
    Q: JobQueue + Send + Sync,
    R: JobRepository + Send + Sync,
    S: RecordRepository + Send + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<Q>,
        repository: Arc<R>,
        record_repository: Arc<S>,
        engine: Arc<ScrapeEngine>,
        proxies: ProxySelector,
        retry_policy: RetryPolicy,
        worker_settings: WorkerSettings,
        engine_settings: EngineSettings,
    ) -> Self {
        let limiter = build_dispatch_limiter(&worker_settings);
        Self {
            queue,
            repository,
            record_repository,
            engine,
            proxies,
            retry_policy,
            worker_settings,
            engine_settings,
            limiter,
            handles: Vec::new(),
        }
    }

    /// 启动工作进程
    ///
    /// 按配置的并发度创建并启动工作器，每个工作器在
    /// 独立的任务上运行自己的拉取循环。
    pub async fn start_workers(&mut self) {
        for _ in 0..self.worker_settings.concurrency {
            let worker = ScrapeWorker::new(
                self.repository.clone(),
                self.record_repository.clone(),
                self.engine.clone(),
                self.proxies.clone(),
                self.retry_policy.clone(),
                self.engine_settings.clone(),
            );

            let queue = self.queue.clone();
            let limiter = self.limiter.clone();
            let handle = tokio::spawn(async move {
                worker.run(queue, limiter).await;
            });
            self.handles.push(handle);
        }

        info!("Started {} scrape workers", self.worker_settings.concurrency);
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&mut self) {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
    }

    /// 有序关闭
    ///
    /// 依次关闭：工作器（停止拉取新任务）、共享浏览器进程、
    /// 数据库连接。每一步记录并继续，保证不留下未关闭的连接。
    ///
    /// # 参数
    ///
    /// * `browser` - 共享浏览器句柄
    /// * `db` - 数据库连接
    pub async fn shutdown(&mut self, browser: &BrowserHandle, db: DatabaseConnection) {
        info!("Shutting down workers...");
        self.queue.pause();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("Workers shut down");

        browser.close().await;
        info!("Browser closed");

        if let Err(e) = db.close().await {
            error!("Failed to close database connection: {}", e);
        } else {
            info!("Database connection closed");
        }
    }

    /// 仅停止工作器，不触碰浏览器和数据库
    pub fn stop_workers(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}
