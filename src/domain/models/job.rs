// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// 抓取任务实体
///
/// 表示系统中一个待处理的抓取工作单元。任务由外部调用方创建，
/// 由工作器独占处理，具有状态、优先级、重试机制和锁定机制等属性。
/// 任务从不被流水线删除，数据保留是外部职责。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    /// 任务唯一标识符
    pub id: Uuid,
    /// 目标URL，任务要抓取的具体网址
    pub url: String,
    /// 任务状态，跟踪任务在其生命周期中的当前阶段
    pub status: JobStatus,
    /// 任务优先级，数值越大优先级越高
    pub priority: i32,
    /// 任务配置，包含动作序列、提取器和超时等执行参数
    pub config: serde_json::Value,
    /// 已尝试次数，记录任务已经执行的次数
    pub attempts_made: i32,
    /// 最大尝试次数，任务失败时的重试上限
    pub max_attempts: i32,
    /// 失败时记录的错误信息
    pub error_message: Option<String>,
    /// 成功时记录的结果摘要
    pub result_summary: Option<serde_json::Value>,
    /// 计划执行时间，可选的延迟执行时间（重试路径使用）
    pub scheduled_at: Option<DateTime<FixedOffset>>,
    /// 开始执行时间，任务开始处理的时间戳
    pub started_at: Option<DateTime<FixedOffset>>,
    /// 完成时间，任务处理完成的时间戳
    pub completed_at: Option<DateTime<FixedOffset>>,
    /// 创建时间，任务创建的时间戳
    pub created_at: DateTime<FixedOffset>,
    /// 更新时间，任务信息最后更新的时间戳
    pub updated_at: DateTime<FixedOffset>,
    /// 锁定令牌，用于工作器独占任务
    pub lock_token: Option<Uuid>,
    /// 锁定过期时间，锁定自动释放的时间点
    pub lock_expires_at: Option<DateTime<FixedOffset>>,
}

/// 任务状态枚举
///
/// 表示任务在其生命周期中的不同状态。
/// 单次尝试内的状态转换是单调的：
/// Queued → Running → Completed/Failed，
/// 只有重试路径可以将任务从Failed带回Queued。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 待处理，任务已创建但尚未提交到队列
    #[default]
    Pending,
    /// 已入队，任务等待工作器拉取
    Queued,
    /// 运行中，任务正在被工作器处理
    Running,
    /// 已完成，任务成功执行完成
    Completed,
    /// 已失败，本次尝试执行失败
    Failed,
    /// 已暂停，任务被操作员暂停
    Paused,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Paused => write!(f, "paused"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "paused" => Ok(JobStatus::Paused),
            _ => Err(()),
        }
    }
}

/// 领域错误类型
#[derive(Error, Debug)]
pub enum DomainError {
    /// 无效的状态转换，当任务状态转换不符合业务规则时发生
    #[error("Invalid state transition")]
    InvalidStateTransition,

    /// 验证错误，当输入数据不符合领域规则时发生
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ScrapeJob {
    /// 创建一个新的抓取任务
    ///
    /// # 参数
    ///
    /// * `url` - 目标URL
    /// * `config` - 任务配置
    ///
    /// # 返回值
    ///
    /// 返回新创建的任务实例
    pub fn new(url: String, config: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            status: JobStatus::Pending,
            priority: 0,
            config,
            attempts_made: 0,
            max_attempts: 3,
            error_message: None,
            result_summary: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
            lock_token: None,
            lock_expires_at: None,
        }
    }

    /// 启动任务
    ///
    /// 将任务状态从Queued变更为Running
    ///
    /// # 返回值
    ///
    /// * `Ok(ScrapeJob)` - 成功启动的任务
    /// * `Err(DomainError)` - 状态转换失败
    pub fn start(mut self) -> Result<Self, DomainError> {
        match self.status {
            JobStatus::Queued => {
                self.status = JobStatus::Running;
                self.started_at = Some(Utc::now().into());
                self.attempts_made += 1;
                Ok(self)
            }
            _ => Err(DomainError::InvalidStateTransition),
        }
    }

    /// 完成任务
    ///
    /// 将任务状态从Running变更为Completed
    ///
    /// # 返回值
    ///
    /// * `Ok(ScrapeJob)` - 成功完成的任务
    /// * `Err(DomainError)` - 状态转换失败
    pub fn complete(mut self) -> Result<Self, DomainError> {
        match self.status {
            JobStatus::Running => {
                self.status = JobStatus::Completed;
                self.completed_at = Some(Utc::now().into());
                Ok(self)
            }
            _ => Err(DomainError::InvalidStateTransition),
        }
    }

    /// 标记任务失败
    ///
    /// 将任务状态从Running变更为Failed并记录错误信息
    ///
    /// # 返回值
    ///
    /// * `Ok(ScrapeJob)` - 失败的任务
    /// * `Err(DomainError)` - 状态转换失败
    pub fn fail(mut self, error: String) -> Result<Self, DomainError> {
        match self.status {
            JobStatus::Running => {
                self.status = JobStatus::Failed;
                self.error_message = Some(error);
                self.completed_at = Some(Utc::now().into());
                Ok(self)
            }
            _ => Err(DomainError::InvalidStateTransition),
        }
    }

    /// 判断任务是否可以重试
    ///
    /// # 返回值
    ///
    /// 如果任务处于失败状态且未达到最大尝试次数则返回true，否则返回false
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lifecycle_success_path() {
        let job = ScrapeJob::new("https://example.com".to_string(), json!({}));
        assert_eq!(job.status, JobStatus::Pending);

        let mut job = job;
        job.status = JobStatus::Queued;

        let job = job.start().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts_made, 1);
        assert!(job.started_at.is_some());

        let job = job.complete().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_completed_job_cannot_restart() {
        let mut job = ScrapeJob::new("https://example.com".to_string(), json!({}));
        job.status = JobStatus::Completed;

        // completed jobs never cycle back through start
        assert!(job.start().is_err());
    }

    #[test]
    fn test_fail_records_error() {
        let mut job = ScrapeJob::new("https://example.com".to_string(), json!({}));
        job.status = JobStatus::Running;

        let job = job.fail("navigation timed out".to_string()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("navigation timed out"));
    }

    #[test]
    fn test_can_retry_bounded_by_max_attempts() {
        let mut job = ScrapeJob::new("https://example.com".to_string(), json!({}));
        job.status = JobStatus::Failed;
        job.max_attempts = 3;

        job.attempts_made = 2;
        assert!(job.can_retry());

        job.attempts_made = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Paused,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }
}
