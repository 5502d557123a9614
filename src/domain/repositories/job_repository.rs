// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::job::ScrapeJob;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// 仓库错误类型
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    /// 记录未找到
    #[error("Record not found")]
    NotFound,
    /// 任务已在队列中或正在运行
    #[error("Job already queued or running")]
    AlreadyQueued,
}

/// 队列状态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// 等待中的任务数（queued）
    pub waiting: u64,
    /// 活跃中的任务数（running）
    pub active: u64,
    /// 已完成的任务数
    pub completed: u64,
    /// 已失败的任务数
    pub failed: u64,
}

/// 任务仓库特质
///
/// 定义抓取任务的数据访问接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 创建新任务
    async fn create(&self, job: &ScrapeJob) -> Result<ScrapeJob, RepositoryError>;
    /// 根据ID查找任务
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapeJob>, RepositoryError>;
    /// 更新任务
    async fn update(&self, job: &ScrapeJob) -> Result<ScrapeJob, RepositoryError>;
    /// 将任务标记为已入队
    ///
    /// 只有不处于queued/running状态的任务才能入队，
    /// 重复提交返回`RepositoryError::AlreadyQueued`
    async fn mark_queued(&self, id: Uuid, priority: i32) -> Result<ScrapeJob, RepositoryError>;
    /// 获取下一个待处理任务并锁定
    async fn acquire_next(&self, worker_id: Uuid) -> Result<Option<ScrapeJob>, RepositoryError>;
    /// 标记任务已完成
    async fn mark_completed(
        &self,
        id: Uuid,
        result_summary: serde_json::Value,
    ) -> Result<(), RepositoryError>;
    /// 标记任务已失败并记录错误信息
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), RepositoryError>;
    /// 将失败任务重新调度到指定时间
    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<FixedOffset>,
        error: &str,
    ) -> Result<(), RepositoryError>;
    /// 按状态统计队列深度
    async fn count_by_status(&self) -> Result<QueueCounts, RepositoryError>;
    /// 重置卡住的任务（锁已过期但仍处于Running状态）
    async fn reset_stuck_jobs(&self, timeout: chrono::Duration) -> Result<u64, RepositoryError>;
    /// 将所有队列中的任务重置回pending（硬重置）
    async fn clear_queued(&self) -> Result<u64, RepositoryError>;
    /// 将所有失败任务重新入队
    async fn requeue_failed(&self) -> Result<u64, RepositoryError>;
}
