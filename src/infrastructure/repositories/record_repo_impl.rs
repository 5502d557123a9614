// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::record::ScrapedRecord;
use crate::domain::repositories::job_repository::RepositoryError;
use crate::domain::repositories::record_repository::RecordRepository;
use crate::infrastructure::database::entities::scraped_record as record_entity;
use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use std::sync::Arc;

/// 结果记录仓库实现
#[derive(Clone)]
pub struct RecordRepositoryImpl {
    /// 数据库连接
    db: Arc<DatabaseConnection>,
}

impl RecordRepositoryImpl {
    /// 创建新的结果记录仓库实例
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordRepository for RecordRepositoryImpl {
    async fn save(&self, record: ScrapedRecord) -> Result<(), RepositoryError> {
        let model = record_entity::ActiveModel {
            id: Set(record.id),
            job_id: Set(record.job_id),
            url: Set(record.url),
            data: Set(record.data),
            config_snapshot: Set(record.config_snapshot),
            duration_ms: Set(record.duration_ms),
            screenshot: Set(record.screenshot),
            created_at: Set(record.created_at),
        };

        model.insert(self.db.as_ref()).await?;
        Ok(())
    }
}
