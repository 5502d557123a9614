// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::job::ScrapeJob;
use crate::domain::repositories::job_repository::{JobRepository, QueueCounts, RepositoryError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// 队列错误类型
#[derive(Error, Debug)]
pub enum QueueError {
    /// 仓库错误
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// 重复提交：同一任务已在队列中或正在运行
    #[error("Job {0} already queued or running")]
    Duplicate(Uuid),

    /// 任务不存在
    #[error("Job {0} not found")]
    NotFound(Uuid),
}

/// 任务队列特质
///
/// 面向调用方的入队和运维操作；工作器侧的出队
/// 通过仓库的锁定获取进行。
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 入队任务，重复提交被拒绝
    async fn enqueue(&self, job_id: Uuid, priority: i32) -> Result<ScrapeJob, QueueError>;

    /// 批量入队，提交之间插入错峰延迟，逐个尽力而为
    async fn enqueue_bulk(&self, job_ids: &[Uuid]) -> Result<usize, QueueError>;

    /// 按状态查询队列深度，不阻塞工作器
    async fn stats(&self) -> Result<QueueCounts, QueueError>;

    /// 暂停新任务的分发，不影响在途任务
    fn pause(&self);

    /// 恢复任务分发
    fn resume(&self);

    /// 查询是否处于暂停状态
    fn is_paused(&self) -> bool;

    /// 硬重置：将所有队列中的任务重置回pending
    async fn clear(&self) -> Result<u64, QueueError>;

    /// 将所有失败任务重新入队，逐个尽力而为
    async fn retry_failed(&self) -> Result<u64, QueueError>;
}

/// PostgreSQL任务队列实现
///
/// 以任务表为持久化队列：任务通过状态列入队，
/// 工作器用SKIP LOCKED获取，队列因此在进程重启后存活。
pub struct PostgresJobQueue<R: JobRepository> {
    repository: Arc<R>,
    paused: AtomicBool,
    bulk_stagger: Duration,
}

impl<R: JobRepository> PostgresJobQueue<R> {
    /// 创建新的PostgreSQL任务队列实例
    ///
    /// # 参数
    ///
    /// * `repository` - 任务仓库
    /// * `bulk_stagger` - 批量入队的错峰间隔
    pub fn new(repository: Arc<R>, bulk_stagger: Duration) -> Self {
        Self {
            repository,
            paused: AtomicBool::new(false),
            bulk_stagger,
        }
    }
}

#[async_trait]
impl<R: JobRepository> JobQueue for PostgresJobQueue<R> {
    async fn enqueue(&self, job_id: Uuid, priority: i32) -> Result<ScrapeJob, QueueError> {
        match self.repository.mark_queued(job_id, priority).await {
            Ok(job) => Ok(job),
            Err(RepositoryError::AlreadyQueued) => Err(QueueError::Duplicate(job_id)),
            Err(RepositoryError::NotFound) => Err(QueueError::NotFound(job_id)),
            Err(e) => Err(QueueError::Repository(e)),
        }
    }

    async fn enqueue_bulk(&self, job_ids: &[Uuid]) -> Result<usize, QueueError> {
        let mut submitted = 0;
        for (i, job_id) in job_ids.iter().enumerate() {
            // stagger submissions so a batch does not stampede one target
            if i > 0 {
                tokio::time::sleep(self.bulk_stagger).await;
            }
            match self.enqueue(*job_id, 0).await {
                Ok(_) => submitted += 1,
                Err(e) => warn!("Bulk enqueue skipped job {}: {}", job_id, e),
            }
        }
        info!("Bulk enqueued {}/{} jobs", submitted, job_ids.len());
        Ok(submitted)
    }

    async fn stats(&self) -> Result<QueueCounts, QueueError> {
        Ok(self.repository.count_by_status().await?)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Queue dispatch paused");
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Queue dispatch resumed");
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let reset = self.repository.clear_queued().await?;
        info!("Queue cleared, {} jobs reset to pending", reset);
        Ok(reset)
    }

    async fn retry_failed(&self) -> Result<u64, QueueError> {
        let requeued = self.repository.requeue_failed().await?;
        info!("Re-queued {} failed jobs", requeued);
        Ok(requeued)
    }
}

#[async_trait]
impl<T: JobQueue + ?Sized> JobQueue for Arc<T> {
    async fn enqueue(&self, job_id: Uuid, priority: i32) -> Result<ScrapeJob, QueueError> {
        (**self).enqueue(job_id, priority).await
    }

    async fn enqueue_bulk(&self, job_ids: &[Uuid]) -> Result<usize, QueueError> {
        (**self).enqueue_bulk(job_ids).await
    }

    async fn stats(&self) -> Result<QueueCounts, QueueError> {
        (**self).stats().await
    }

    fn pause(&self) {
        (**self).pause()
    }

    fn resume(&self) {
        (**self).resume()
    }

    fn is_paused(&self) -> bool {
        (**self).is_paused()
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        (**self).clear().await
    }

    async fn retry_failed(&self) -> Result<u64, QueueError> {
        (**self).retry_failed().await
    }
}
