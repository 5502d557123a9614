// Copyright 2025 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use harvestrs::config::settings::Settings;
use harvestrs::engine::browser::BrowserHandle;
use harvestrs::engine::ScrapeEngine;
use harvestrs::infrastructure::database;
use harvestrs::infrastructure::repositories::job_repo_impl::JobRepositoryImpl;
use harvestrs::infrastructure::repositories::proxy_repo_impl::ProxyRepositoryImpl;
use harvestrs::infrastructure::repositories::record_repo_impl::RecordRepositoryImpl;
use harvestrs::proxy::{ProxyHealthMonitor, ProxySelector};
use harvestrs::queue::job_queue::PostgresJobQueue;
use harvestrs::queue::scheduler::JobScheduler;
use harvestrs::utils::retry_policy::RetryPolicy;
use harvestrs::utils::telemetry;
use harvestrs::workers::manager::WorkerManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 主函数
///
/// 应用程序入口点，负责初始化所有组件并启动流水线
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize logging
    telemetry::init_telemetry();
    info!("Starting harvestrs...");

    // Initialize Prometheus Metrics
    harvestrs::infrastructure::metrics::init_metrics();

    // 2. Load configuration
    let settings = Arc::new(Settings::new()?);
    info!("Configuration loaded");

    // 3. Connect to database
    let db = Arc::new(database::create_pool(&settings.database).await?);
    info!("Database connection established");

    // 4. Initialize repositories
    let job_repo = Arc::new(JobRepositoryImpl::new(db.clone()));
    let proxy_repo = Arc::new(ProxyRepositoryImpl::new(db.clone()));
    let record_repo = Arc::new(RecordRepositoryImpl::new(db.clone()));

    // 5. Proxy selector and background health sweep
    let proxies = ProxySelector::new(proxy_repo.clone(), settings.proxy.clone());
    proxies.load_proxies().await;
    let health_monitor = ProxyHealthMonitor::new(proxies.clone(), settings.proxy.clone());
    let _health_handle = health_monitor.start();

    // 6. Browser handle and execution engine; the browser process itself
    //    launches lazily on the first scrape
    let browser = Arc::new(BrowserHandle::new(settings.engine.clone()));
    let engine = Arc::new(ScrapeEngine::new(browser.clone(), settings.engine.clone()));

    // 7. Queue and maintenance scheduler
    let queue = Arc::new(PostgresJobQueue::new(
        job_repo.clone(),
        Duration::from_millis(settings.worker.bulk_stagger_ms),
    ));
    let scheduler = JobScheduler::new(job_repo.clone());
    let _scheduler_handle = scheduler.start();

    // 8. Start workers
    let retry_policy = RetryPolicy::from_settings(&settings.retry);
    let mut worker_manager = WorkerManager::new(
        queue.clone(),
        job_repo.clone(),
        record_repo.clone(),
        engine.clone(),
        proxies.clone(),
        retry_policy,
        settings.worker.clone(),
        settings.engine.clone(),
    );
    worker_manager.start_workers().await;

    // 9. Run until shutdown, then release resources in order:
    //    workers, browser, database connection
    worker_manager.wait_for_shutdown().await;
    worker_manager
        .shutdown(browser.as_ref(), db.as_ref().clone())
        .await;

    info!("harvestrs stopped");
    Ok(())
}
