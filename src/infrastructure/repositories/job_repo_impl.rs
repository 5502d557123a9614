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

use crate::domain::models::job::{JobStatus, ScrapeJob};
use crate::domain::repositories::job_repository::{JobRepository, QueueCounts, RepositoryError};
use crate::infrastructure::database::entities::scrape_job as job_entity;
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use sea_orm::{
    sea_query::{Expr, LockBehavior, LockType},
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::sync::Arc;
use uuid::Uuid;

/// 任务仓库实现
///
/// 基于SeaORM实现的抓取任务数据访问层
#[derive(Clone)]
pub struct JobRepositoryImpl {
    /// 数据库连接
    db: Arc<DatabaseConnection>,
}

impl JobRepositoryImpl {
    /// 创建新的任务仓库实例
    ///
    /// # 参数
    ///
    /// * `db` - 数据库连接
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl From<job_entity::Model> for ScrapeJob {
    fn from(model: job_entity::Model) -> Self {
        Self {
            id: model.id,
            url: model.url,
            status: model.status.parse().unwrap_or_default(),
            priority: model.priority,
            config: model.config,
            attempts_made: model.attempts_made,
            max_attempts: model.max_attempts,
            error_message: model.error_message,
            result_summary: model.result_summary,
            scheduled_at: model.scheduled_at,
            started_at: model.started_at,
            completed_at: model.completed_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
            lock_token: model.lock_token,
            lock_expires_at: model.lock_expires_at,
        }
    }
}

impl From<ScrapeJob> for job_entity::ActiveModel {
    fn from(job: ScrapeJob) -> Self {
        Self {
            id: Set(job.id),
            url: Set(job.url.clone()),
            status: Set(job.status.to_string()),
            priority: Set(job.priority),
            config: Set(job.config.clone()),
            attempts_made: Set(job.attempts_made),
            max_attempts: Set(job.max_attempts),
            error_message: Set(job.error_message.clone()),
            result_summary: Set(job.result_summary.clone()),
            scheduled_at: Set(job.scheduled_at),
            started_at: Set(job.started_at),
            completed_at: Set(job.completed_at),
            created_at: Set(job.created_at),
            updated_at: Set(job.updated_at),
            lock_token: Set(job.lock_token),
            lock_expires_at: Set(job.lock_expires_at),
        }
    }
}

#[async_trait]
impl JobRepository for JobRepositoryImpl {
    async fn create(&self, job: &ScrapeJob) -> Result<ScrapeJob, RepositoryError> {
        let model: job_entity::ActiveModel = job.clone().into();
        model.insert(self.db.as_ref()).await?;
        Ok(job.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapeJob>, RepositoryError> {
        let model = job_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;
        Ok(model.map(Into::into))
    }

    async fn update(&self, job: &ScrapeJob) -> Result<ScrapeJob, RepositoryError> {
        let mut model: job_entity::ActiveModel = job.clone().into();
        model.updated_at = Set(Utc::now().into());

        let updated = model.update(self.db.as_ref()).await?;
        Ok(updated.into())
    }

    async fn mark_queued(&self, id: Uuid, priority: i32) -> Result<ScrapeJob, RepositoryError> {
        let txn = self.db.begin().await?;

        let model = job_entity::Entity::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        // duplicate admission: a job already queued or running is never
        // submitted a second time
        let status: JobStatus = model.status.parse().unwrap_or_default();
        if matches!(status, JobStatus::Queued | JobStatus::Running) {
            txn.commit().await?;
            return Err(RepositoryError::AlreadyQueued);
        }

        let mut active: job_entity::ActiveModel = model.into();
        active.status = Set(JobStatus::Queued.to_string());
        active.priority = Set(priority);
        active.scheduled_at = Set(None);
        active.completed_at = Set(None);
        active.updated_at = Set(Utc::now().into());

        let updated = active.update(&txn).await?;
        txn.commit().await?;

        Ok(updated.into())
    }

    async fn acquire_next(&self, worker_id: Uuid) -> Result<Option<ScrapeJob>, RepositoryError> {
        let txn = self.db.begin().await?;

        let job = job_entity::Entity::find()
            .filter(job_entity::Column::Status.eq(JobStatus::Queued.to_string()))
            .filter(
                Condition::any()
                    .add(job_entity::Column::ScheduledAt.is_null())
                    .add(job_entity::Column::ScheduledAt.lte(Utc::now())),
            )
            .order_by_desc(job_entity::Column::Priority)
            .order_by_asc(job_entity::Column::CreatedAt)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .one(&txn)
            .await?;

        if let Some(job) = job {
            let mut active: job_entity::ActiveModel = job.into();
            active.lock_token = Set(Some(worker_id));
            active.lock_expires_at = Set(Some((Utc::now() + Duration::minutes(5)).into()));
            active.status = Set(JobStatus::Running.to_string());
            active.started_at = Set(Some(Utc::now().into()));
            let current_attempts = *active.attempts_made.as_ref();
            active.attempts_made = Set(current_attempts + 1);
            active.updated_at = Set(Utc::now().into());

            let updated = active.update(&txn).await?;
            txn.commit().await?;

            return Ok(Some(updated.into()));
        }

        txn.commit().await?;
        Ok(None)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result_summary: serde_json::Value,
    ) -> Result<(), RepositoryError> {
        let job = self
            .find_by_id(id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        let mut active: job_entity::ActiveModel = job.into();
        active.status = Set(JobStatus::Completed.to_string());
        active.result_summary = Set(Some(result_summary));
        active.completed_at = Set(Some(Utc::now().into()));
        active.lock_token = Set(None);
        active.lock_expires_at = Set(None);
        active.updated_at = Set(Utc::now().into());

        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
        let job = self
            .find_by_id(id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        let mut active: job_entity::ActiveModel = job.into();
        active.status = Set(JobStatus::Failed.to_string());
        active.error_message = Set(Some(error.to_string()));
        active.completed_at = Set(Some(Utc::now().into()));
        active.lock_token = Set(None);
        active.lock_expires_at = Set(None);
        active.updated_at = Set(Utc::now().into());

        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<FixedOffset>,
        error: &str,
    ) -> Result<(), RepositoryError> {
        let job = self
            .find_by_id(id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        let mut active: job_entity::ActiveModel = job.into();
        active.status = Set(JobStatus::Queued.to_string());
        active.error_message = Set(Some(error.to_string()));
        active.scheduled_at = Set(Some(at));
        active.started_at = Set(None);
        active.completed_at = Set(None);
        active.lock_token = Set(None);
        active.lock_expires_at = Set(None);
        active.updated_at = Set(Utc::now().into());

        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    async fn count_by_status(&self) -> Result<QueueCounts, RepositoryError> {
        let count = |status: JobStatus| {
            job_entity::Entity::find()
                .filter(job_entity::Column::Status.eq(status.to_string()))
                .count(self.db.as_ref())
        };

        Ok(QueueCounts {
            waiting: count(JobStatus::Queued).await?,
            active: count(JobStatus::Running).await?,
            completed: count(JobStatus::Completed).await?,
            failed: count(JobStatus::Failed).await?,
        })
    }

    async fn reset_stuck_jobs(&self, timeout: chrono::Duration) -> Result<u64, RepositoryError> {
        let threshold = Utc::now() - timeout;

        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::Status,
                Expr::value(JobStatus::Queued.to_string()),
            )
            .col_expr(
                job_entity::Column::LockToken,
                Expr::value(Option::<Uuid>::None),
            )
            .col_expr(
                job_entity::Column::LockExpiresAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .filter(job_entity::Column::Status.eq(JobStatus::Running.to_string()))
            .filter(
                Condition::any()
                    .add(job_entity::Column::LockExpiresAt.lte(Utc::now()))
                    .add(
                        Condition::all()
                            .add(job_entity::Column::LockExpiresAt.is_null())
                            .add(job_entity::Column::StartedAt.lte(threshold)),
                    ),
            )
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected)
    }

    async fn clear_queued(&self) -> Result<u64, RepositoryError> {
        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::Status,
                Expr::value(JobStatus::Pending.to_string()),
            )
            .col_expr(
                job_entity::Column::ScheduledAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .filter(job_entity::Column::Status.eq(JobStatus::Queued.to_string()))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected)
    }

    async fn requeue_failed(&self) -> Result<u64, RepositoryError> {
        let result = job_entity::Entity::update_many()
            .col_expr(
                job_entity::Column::Status,
                Expr::value(JobStatus::Queued.to_string()),
            )
            .col_expr(job_entity::Column::AttemptsMade, Expr::value(0))
            .col_expr(
                job_entity::Column::ScheduledAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(
                job_entity::Column::CompletedAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .filter(job_entity::Column::Status.eq(JobStatus::Failed.to_string()))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected)
    }
}
