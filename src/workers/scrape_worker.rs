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

use anyhow::Result;
use chrono::Utc;
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::settings::EngineSettings;
use crate::domain::models::job::ScrapeJob;
use crate::domain::models::record::ScrapedRecord;
use crate::domain::repositories::job_repository::JobRepository;
use crate::domain::repositories::record_repository::RecordRepository;
use crate::engine::actions::ActionSpec;
use crate::engine::extractor::ExtractorSpec;
use crate::engine::{ScrapeEngine, ScrapeOutcome, ScrapeRequest};
use crate::proxy::ProxySelector;
use crate::queue::job_queue::JobQueue;
use crate::utils::retry_policy::RetryPolicy;
use crate::workers::manager::DispatchLimiter;

/// 任务配置的线上格式
///
/// 核心不在提交时校验配置模式：格式错误或未知的动作与
/// 提取器类型在执行时被容忍并跳过/置空，从不在提交时拒绝。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfigDto {
    /// 动作序列
    pub actions: Vec<ActionSpec>,
    /// 提取器列表
    pub extractors: Vec<ExtractorSpec>,
    /// 提取前等待出现的选择器
    pub wait_for: Option<String>,
    /// 抓取总超时（秒）
    pub timeout: Option<u64>,
    /// 是否捕获整页截图
    pub take_screenshot: bool,
    /// 是否通过代理执行
    pub use_proxy: bool,
    /// 需要排除的代理国家
    pub exclude_countries: Vec<String>,
}

impl Default for JobConfigDto {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            extractors: Vec::new(),
            wait_for: None,
            timeout: None,
            take_screenshot: false,
            use_proxy: true,
            exclude_countries: Vec::new(),
        }
    }
}

/// 抓取工作器
///
/// 从队列拉取任务，向选择器申请代理，驱动执行引擎，
/// 持久化结果并把代理成败回报给选择器。
/// 重试由指数退避策略决定，超过最大尝试次数的任务
/// 终态保持failed，不再向上抛出。
pub struct ScrapeWorker<R, S>
where
    R: JobRepository + Send + Sync,
    S: RecordRepository + Send + Sync,
{
    repository: Arc<R>,
    record_repository: Arc<S>,
    engine: Arc<ScrapeEngine>,
    proxies: ProxySelector,
    retry_policy: RetryPolicy,
    engine_settings: EngineSettings,
    worker_id: Uuid,
}

impl<R, S> ScrapeWorker<R, S>
where
    R: JobRepository + Send + Sync,
    S: RecordRepository + Send + Sync,
{
    /// 创建新的抓取工作器实例
    pub fn new(
        repository: Arc<R>,
        record_repository: Arc<S>,
        engine: Arc<ScrapeEngine>,
        proxies: ProxySelector,
        retry_policy: RetryPolicy,
        engine_settings: EngineSettings,
    ) -> Self {
        Self {
            repository,
            record_repository,
            engine,
            proxies,
            retry_policy,
            engine_settings,
            worker_id: Uuid::new_v4(),
        }
    }

    /// 运行抓取工作器
    ///
    /// 循环：暂停检查 → 全局速率限制 → 拉取任务 → 处理。
    /// 速率限制独立于工作器数量约束总出站调度频率。
    pub async fn run<Q>(&self, queue: Arc<Q>, limiter: Arc<DispatchLimiter>)
    where
        Q: JobQueue + Send + Sync,
    {
        info!("Scrape worker {} started", self.worker_id);

        loop {
            if queue.is_paused() {
                sleep(Duration::from_secs(1)).await;
                continue;
            }

            limiter.until_ready().await;

            match self.process_next().await {
                Ok(processed) => {
                    if !processed {
                        sleep(Duration::from_secs(1)).await;
                    }
                }
                Err(e) => {
                    error!("Error processing job: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_next(&self) -> Result<bool> {
        let job = self.repository.acquire_next(self.worker_id).await?;

        if let Some(job) = job {
            self.process_job(job).await?;
            return Ok(true);
        }

        Ok(false)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, url = %job.url, attempt = job.attempts_made))]
    async fn process_job(&self, job: ScrapeJob) -> Result<()> {
        info!("Processing job");
        counter!("jobs_processed_total").increment(1);

        // malformed config is fatal for this attempt, not for the worker
        let config: JobConfigDto = match serde_json::from_value(job.config.clone()) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to parse job config: {}", e);
                return self
                    .handle_failure(&job, format!("Invalid job config: {}", e))
                    .await;
            }
        };

        let proxy = if config.use_proxy {
            let selected = self.proxies.select_next(&config.exclude_countries);
            if selected.is_none() {
                // "no proxy available" is a valid outcome: proceed proxyless
                debug!("No proxy available, proceeding without one");
            }
            selected
        } else {
            None
        };

        let request = Self::build_scrape_request(&job, &config, &self.engine_settings);
        let started = Instant::now();
        let outcome = self.engine.scrape(&request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if outcome.success {
            if let Some(proxy) = &proxy {
                self.proxies.report_success(proxy.id, elapsed_ms).await;
            }
            self.handle_success(&job, outcome).await
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "unknown engine failure".to_string());
            if let Some(proxy) = &proxy {
                self.proxies.report_failure(proxy.id, &error).await;
            }
            self.handle_failure(&job, error).await
        }
    }

    async fn handle_success(&self, job: &ScrapeJob, outcome: ScrapeOutcome) -> Result<()> {
        let field_count = outcome.data.len();
        let record = ScrapedRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            url: outcome.final_url.clone().unwrap_or_else(|| job.url.clone()),
            data: Value::Object(outcome.data),
            config_snapshot: job.config.clone(),
            duration_ms: outcome.duration_ms as i64,
            screenshot: outcome.screenshot,
            created_at: Utc::now(),
        };

        // a record that cannot be persisted fails the attempt
        if let Err(e) = self.record_repository.save(record).await {
            error!("Failed to persist scraped record: {}", e);
            return self
                .handle_failure(job, format!("Failed to persist record: {}", e))
                .await;
        }

        let summary = json!({
            "fields": field_count,
            "durationMs": outcome.duration_ms,
            "finalUrl": outcome.final_url,
        });
        self.repository.mark_completed(job.id, summary).await?;

        counter!("jobs_completed_total").increment(1);
        info!(
            "Job completed in {}ms with {} fields",
            outcome.duration_ms, field_count
        );
        Ok(())
    }

    async fn handle_failure(&self, job: &ScrapeJob, error: String) -> Result<()> {
        counter!("jobs_failed_total").increment(1);

        if job.attempts_made >= job.max_attempts {
            // terminal: stays failed, never escalates above the worker
            warn!(
                "Job {} exceeded max attempts ({}/{})",
                job.id, job.attempts_made, job.max_attempts
            );
            counter!("jobs_exhausted_total").increment(1);
            self.repository.mark_failed(job.id, &error).await?;
            return Ok(());
        }

        let next_retry = self.retry_policy.next_retry_time(job.attempts_made, Utc::now());
        self.repository
            .reschedule(job.id, next_retry.into(), &error)
            .await?;

        counter!("jobs_retried_total").increment(1);
        info!(
            "Scheduled retry {}/{} for job {} at {}",
            job.attempts_made + 1,
            job.max_attempts,
            job.id,
            next_retry
        );
        Ok(())
    }

    /// 从任务及其配置构建引擎请求
    pub fn build_scrape_request(
        job: &ScrapeJob,
        config: &JobConfigDto,
        defaults: &EngineSettings,
    ) -> ScrapeRequest {
        ScrapeRequest {
            url: job.url.clone(),
            actions: config.actions.clone(),
            extractors: config.extractors.clone(),
            wait_for: config.wait_for.clone(),
            timeout: Duration::from_secs(config.timeout.unwrap_or(defaults.default_timeout_secs)),
            screenshot: config.take_screenshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ProxySettings;
    use crate::domain::models::job::JobStatus;
    use crate::domain::models::proxy::Proxy;
    use crate::domain::repositories::job_repository::{QueueCounts, RepositoryError};
    use crate::domain::repositories::proxy_repository::ProxyRepository;
    use crate::engine::browser::BrowserHandle;
    use async_trait::async_trait;
    use chrono::{DateTime, FixedOffset};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    struct MockJobRepository {
        jobs: Mutex<HashMap<Uuid, ScrapeJob>>,
    }

    impl MockJobRepository {
        fn with_job(job: ScrapeJob) -> Self {
            let mut jobs = HashMap::new();
            jobs.insert(job.id, job);
            Self {
                jobs: Mutex::new(jobs),
            }
        }

        fn get(&self, id: Uuid) -> ScrapeJob {
            self.jobs.lock().get(&id).cloned().unwrap()
        }
    }

    #[async_trait]
    impl JobRepository for MockJobRepository {
        async fn create(&self, job: &ScrapeJob) -> Result<ScrapeJob, RepositoryError> {
            self.jobs.lock().insert(job.id, job.clone());
            Ok(job.clone())
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapeJob>, RepositoryError> {
            Ok(self.jobs.lock().get(&id).cloned())
        }

        async fn update(&self, job: &ScrapeJob) -> Result<ScrapeJob, RepositoryError> {
            self.jobs.lock().insert(job.id, job.clone());
            Ok(job.clone())
        }

        async fn mark_queued(&self, id: Uuid, priority: i32) -> Result<ScrapeJob, RepositoryError> {
            let mut jobs = self.jobs.lock();
            let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound)?;
            if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                return Err(RepositoryError::AlreadyQueued);
            }
            job.status = JobStatus::Queued;
            job.priority = priority;
            Ok(job.clone())
        }

        async fn acquire_next(&self, _worker_id: Uuid) -> Result<Option<ScrapeJob>, RepositoryError> {
            Ok(None)
        }

        async fn mark_completed(
            &self,
            id: Uuid,
            result_summary: serde_json::Value,
        ) -> Result<(), RepositoryError> {
            let mut jobs = self.jobs.lock();
            let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound)?;
            job.status = JobStatus::Completed;
            job.result_summary = Some(result_summary);
            Ok(())
        }

        async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
            let mut jobs = self.jobs.lock();
            let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound)?;
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            Ok(())
        }

        async fn reschedule(
            &self,
            id: Uuid,
            at: DateTime<FixedOffset>,
            error: &str,
        ) -> Result<(), RepositoryError> {
            let mut jobs = self.jobs.lock();
            let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound)?;
            job.status = JobStatus::Queued;
            job.scheduled_at = Some(at);
            job.error_message = Some(error.to_string());
            Ok(())
        }

        async fn count_by_status(&self) -> Result<QueueCounts, RepositoryError> {
            Ok(QueueCounts::default())
        }

        async fn reset_stuck_jobs(
            &self,
            _timeout: chrono::Duration,
        ) -> Result<u64, RepositoryError> {
            Ok(0)
        }

        async fn clear_queued(&self) -> Result<u64, RepositoryError> {
            Ok(0)
        }

        async fn requeue_failed(&self) -> Result<u64, RepositoryError> {
            Ok(0)
        }
    }

    struct MockRecordRepository;

    #[async_trait]
    impl RecordRepository for MockRecordRepository {
        async fn save(&self, _record: ScrapedRecord) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    struct EmptyProxyRepository;

    #[async_trait]
    impl ProxyRepository for EmptyProxyRepository {
        async fn find_active(&self) -> Result<Vec<Proxy>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn find_by_id(&self, _id: Uuid) -> Result<Option<Proxy>, RepositoryError> {
            Ok(None)
        }
        async fn update(&self, proxy: &Proxy) -> Result<Proxy, RepositoryError> {
            Ok(proxy.clone())
        }
    }

    fn engine_settings() -> EngineSettings {
        EngineSettings {
            navigation_timeout_secs: 30,
            action_timeout_secs: 5,
            wait_for_timeout_secs: 10,
            default_timeout_secs: 60,
            remote_debugging_url: None,
        }
    }

    fn proxy_settings() -> ProxySettings {
        ProxySettings {
            skip_rate_threshold: 0.5,
            skip_min_requests: 10,
            auto_disable_rate: 0.1,
            auto_disable_min_requests: 20,
            quarantine_secs: 300,
            health_interval_secs: 600,
            health_sample_size: 5,
            probe_url: "https://www.gstatic.com/generate_204".to_string(),
            probe_timeout_secs: 10,
        }
    }

    fn test_worker(
        repository: Arc<MockJobRepository>,
    ) -> ScrapeWorker<MockJobRepository, MockRecordRepository> {
        // the browser handle stays lazy, no Chromium is launched here
        let browser = Arc::new(BrowserHandle::new(engine_settings()));
        let engine = Arc::new(ScrapeEngine::new(browser, engine_settings()));
        let proxies = ProxySelector::new(Arc::new(EmptyProxyRepository), proxy_settings());

        ScrapeWorker::new(
            repository,
            Arc::new(MockRecordRepository),
            engine,
            proxies,
            RetryPolicy::default(),
            engine_settings(),
        )
    }

    fn running_job(attempts_made: i32, max_attempts: i32) -> ScrapeJob {
        let mut job = ScrapeJob::new("https://example.com".to_string(), json!({}));
        job.status = JobStatus::Running;
        job.attempts_made = attempts_made;
        job.max_attempts = max_attempts;
        job
    }

    #[tokio::test]
    async fn test_failure_below_max_attempts_is_rescheduled() {
        let job = running_job(1, 3);
        let job_id = job.id;
        let repository = Arc::new(MockJobRepository::with_job(job.clone()));
        let worker = test_worker(repository.clone());

        worker
            .handle_failure(&job, "navigation timed out".to_string())
            .await
            .unwrap();

        let stored = repository.get(job_id);
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored.scheduled_at.is_some());
        assert_eq!(stored.error_message.as_deref(), Some("navigation timed out"));
    }

    #[tokio::test]
    async fn test_failure_at_max_attempts_is_terminal() {
        // third attempt of three: no fourth attempt is ever scheduled
        let job = running_job(3, 3);
        let job_id = job.id;
        let repository = Arc::new(MockJobRepository::with_job(job.clone()));
        let worker = test_worker(repository.clone());

        worker
            .handle_failure(&job, "still broken".to_string())
            .await
            .unwrap();

        let stored = repository.get(job_id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts_made, 3);
        assert!(stored.scheduled_at.is_none());
    }

    #[tokio::test]
    async fn test_malformed_config_counts_as_attempt_failure() {
        let mut job = running_job(1, 3);
        job.config = json!({"actions": "not-an-array"});
        let job_id = job.id;
        let repository = Arc::new(MockJobRepository::with_job(job.clone()));
        let worker = test_worker(repository.clone());

        worker.process_job(job).await.unwrap();

        let stored = repository.get(job_id);
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored
            .error_message
            .unwrap()
            .contains("Invalid job config"));
    }

    #[test]
    fn test_build_scrape_request_defaults() {
        let job = ScrapeJob::new("https://example.com".to_string(), json!({}));
        let config = JobConfigDto::default();

        let request =
            ScrapeWorker::<MockJobRepository, MockRecordRepository>::build_scrape_request(
                &job,
                &config,
                &engine_settings(),
            );

        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.timeout, Duration::from_secs(60));
        assert!(request.actions.is_empty());
        assert!(!request.screenshot);
    }

    #[test]
    fn test_job_config_wire_format() {
        let config: JobConfigDto = serde_json::from_value(json!({
            "actions": [{"type": "click", "selector": "#go"}],
            "extractors": [{"name": "title", "type": "text", "selector": "h1"}],
            "waitFor": "#results",
            "timeout": 45,
            "takeScreenshot": true,
            "excludeCountries": ["CN"]
        }))
        .unwrap();

        assert_eq!(config.actions.len(), 1);
        assert_eq!(config.extractors.len(), 1);
        assert_eq!(config.wait_for.as_deref(), Some("#results"));
        assert_eq!(config.timeout, Some(45));
        assert!(config.take_screenshot);
        assert!(config.use_proxy); // defaults on
        assert_eq!(config.exclude_countries, vec!["CN".to_string()]);
    }
}
